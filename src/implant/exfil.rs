//! `/p/{rel}` (spec §4.5.3): write the request body to a uniquely-named file
//! under `exfil/`, truncated at the configured maximum and hashed as it's
//! written (Testable Properties 5 and 6).

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::ExfilError;

const MAX_CREATE_ATTEMPTS: u32 = 100;

pub struct ExfilResult {
    pub path: PathBuf,
    pub size: u64,
    pub hash_hex: String,
}

/// Clean the path component after `/p`: reject `..` traversal, absolute
/// paths, and an empty (root) path. Does not touch the filesystem.
pub fn clean_relative_path(raw: &str) -> Result<PathBuf, ExfilError> {
    if raw.is_empty() || raw.starts_with('/') {
        return Err(if raw.is_empty() {
            ExfilError::EmptyPath
        } else {
            ExfilError::PathEscape
        });
    }
    let mut cleaned = PathBuf::new();
    for component in raw.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(ExfilError::PathEscape),
            other => cleaned.push(other),
        }
    }
    if cleaned.as_os_str().is_empty() {
        return Err(ExfilError::EmptyPath);
    }
    Ok(cleaned)
}

/// Save `body` under `exfil_dir`, truncated to `max` bytes. `body`'s errors
/// (client disconnect, read timeout) simply stop the copy early; whatever
/// was written before the error is what gets hashed and logged.
pub async fn save<S, E>(
    exfil_dir: &Path,
    raw_path: &str,
    max: u64,
    mut body: S,
) -> Result<ExfilResult, ExfilError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let relative = clean_relative_path(raw_path)?;
    let target = exfil_dir.join(&relative);
    let (mut file, final_path) = create_exclusive(&target).await.map_err(ExfilError::Io)?;

    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let Ok(chunk) = chunk else { break };
        if written >= max {
            continue;
        }
        let remaining = max - written;
        let take = remaining.min(chunk.len() as u64) as usize;
        let slice = &chunk[..take];
        file.write_all(slice).await.map_err(ExfilError::Io)?;
        hasher.update(slice);
        written += take as u64;
    }
    file.flush().await.map_err(ExfilError::Io)?;

    Ok(ExfilResult {
        path: final_path,
        size: written,
        hash_hex: hex::encode(hasher.finalize()),
    })
}

/// Open `base` exclusively, creating parent directories as needed. On
/// `EEXIST`, append `.` + a nanosecond timestamp and retry, up to
/// `MAX_CREATE_ATTEMPTS` times (spec §4.5.3).
async fn create_exclusive(base: &Path) -> std::io::Result<(fs::File, PathBuf)> {
    if let Some(parent) = base.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut candidate = base.to_path_buf();
    for _ in 0..MAX_CREATE_ATTEMPTS {
        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((file, candidate)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                candidate = disambiguate(base);
            }
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "exhausted exfil filename attempts",
    ))
}

fn disambiguate(base: &Path) -> PathBuf {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    let mut name = base.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{nanos}"));
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn rejects_traversal_and_empty_and_absolute() {
        assert!(matches!(clean_relative_path(""), Err(ExfilError::EmptyPath)));
        assert!(matches!(
            clean_relative_path("/abs"),
            Err(ExfilError::PathEscape)
        ));
        assert!(matches!(
            clean_relative_path("../escape"),
            Err(ExfilError::PathEscape)
        ));
        assert!(clean_relative_path("foo/bar").is_ok());
    }

    #[tokio::test]
    async fn saves_body_and_hashes_it() {
        let dir = tempfile::tempdir().unwrap();
        let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"This is Exfil!\n",
        ))]);
        let result = save(dir.path(), "foo/bar", 1_000_000, body).await.unwrap();
        assert_eq!(result.size, 15);
        assert_eq!(
            result.hash_hex,
            "d640c6c638d986f092b2688ee0aec215f6b5c9e200f4daa26fb22ee6a5f2e9b4"
        );
        let contents = tokio::fs::read(&result.path).await.unwrap();
        assert_eq!(contents, b"This is Exfil!\n");
    }

    #[tokio::test]
    async fn truncates_at_max_and_hashes_only_saved_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"0123456789",
        ))]);
        let result = save(dir.path(), "f", 4, body).await.unwrap();
        assert_eq!(result.size, 4);
        let contents = tokio::fs::read(&result.path).await.unwrap();
        assert_eq!(contents, b"0123");
    }

    #[tokio::test]
    async fn collision_gets_nanosecond_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let body_a = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"a"))]);
        let body_b = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"b"))]);
        let first = save(dir.path(), "dup", 10, body_a).await.unwrap();
        let second = save(dir.path(), "dup", 10, body_b).await.unwrap();
        assert_ne!(first.path, second.path);
    }
}
