//! `/f/{rel…}` (spec §4.5.4): delegate to a generic static file server rooted
//! at `files/`, wrapped so the caller can log what actually went out without
//! the file server needing to know logging exists (spec §9's "composable
//! decorator preserving the standard HTTP writer contract, not inheritance").

use std::path::PathBuf;

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, LOCATION};
use axum::http::{Request, Response, StatusCode};
use tower::ServiceExt;
use tower_http::services::ServeDir;

pub struct FileServer {
    root: PathBuf,
}

/// What the wrapped response looked like, for logging — never touched by
/// the file server itself.
pub struct ServedMeta {
    pub status: StatusCode,
    pub bytes: Option<u64>,
    pub location: Option<String>,
}

impl FileServer {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn serve(&self, req: Request<Body>) -> (Response<Body>, ServedMeta) {
        let response = match ServeDir::new(&self.root).oneshot(req).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        };
        let meta = ServedMeta {
            status: response.status(),
            bytes: response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
            location: response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        };
        (response.map(Body::new), meta)
    }
}
