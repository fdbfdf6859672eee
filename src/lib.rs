//! `plonk`: a tasking and static-file HTTP(S) server for implants, with an
//! ACME/self-signed TLS front end and an interactive operator client.
//!
//! Mirrors the teacher crate's `lib.rs` shape: `main.rs` owns argument
//! parsing and process bootstrap; everything else lives here as a library so
//! it can be exercised directly from integration tests.

pub mod bus;
pub mod cli;
pub mod client;
pub mod error;
pub mod event_stream;
pub mod implant;
pub mod lifecycle;
pub mod log_ring;
pub mod logging;
pub mod operator;
pub mod paths;
pub mod server;
pub mod state;
pub mod tls;
