//! On-disk layout (spec §6): one base directory holding everything plonk
//! owns. Directories are created `0750`, files `0640`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const DIR_MODE: u32 = 0o750;
pub const FILE_MODE: u32 = 0o640;

#[derive(Debug, Clone)]
pub struct Layout {
    base: PathBuf,
}

impl Layout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn files_dir(&self) -> PathBuf {
        self.base.join("files")
    }

    pub fn exfil_dir(&self) -> PathBuf {
        self.base.join("exfil")
    }

    pub fn index_html(&self) -> PathBuf {
        self.base.join("index.html")
    }

    pub fn implant_tmpl(&self) -> PathBuf {
        self.base.join("implant.tmpl")
    }

    pub fn log_json(&self) -> PathBuf {
        self.base.join("log.json")
    }

    pub fn op_sock(&self) -> PathBuf {
        self.base.join("op.sock")
    }

    pub fn state_json(&self) -> PathBuf {
        self.base.join("state.json")
    }

    pub fn tls_cache_dir(&self) -> PathBuf {
        self.base.join("tlscache")
    }

    /// Create every directory plonk needs up front, with the permissions
    /// spec'd in §6. Idempotent.
    pub fn bootstrap(&self) -> Result<()> {
        // SAFETY: umask affects only this process and is restored by the OS
        // on exit; there is no concurrent file creation before this point.
        unsafe {
            libc::umask(0o027);
        }
        for dir in [
            self.base.clone(),
            self.files_dir(),
            self.exfil_dir(),
            self.tls_cache_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
            set_dir_mode(&dir)?;
        }
        Ok(())
    }
}

pub fn set_dir_mode(path: &Path) -> Result<()> {
    set_mode(path, DIR_MODE)
}

pub fn set_file_mode(path: &Path) -> Result<()> {
    set_mode(path, FILE_MODE)
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting permissions on {}", path.display()))
}
