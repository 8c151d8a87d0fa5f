//! Content-addressed archive of raw remote payloads, kept for audit and replay.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use harvest_core::record::sha256_hex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<YYYYMMDD>/<source_id>/<job_id>/<hash>.<ext>`
    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        job_id: Uuid,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(day)
            .join(sanitize_segment(source_id))
            .join(job_id.to_string())
            .join(format!("{content_hash}.{ext}"))
    }

    /// Write once via temp file and rename; identical payloads within a job are stored once.
    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        job_id: Uuid,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = sha256_hex(bytes);
        let relative_path =
            self.payload_relative_path(fetched_at, source_id, job_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedPayload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp payload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp payload file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp payload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

fn sanitize_segment(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[tokio::test]
    async fn identical_payloads_are_stored_once() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).single().expect("ts");
        let job = Uuid::new_v4();

        let first = archive
            .store(at, "catalog/remote", job, "json", br#"{"a":1}"#)
            .await
            .expect("first");
        let second = archive
            .store(at, "catalog/remote", job, ".json", br#"{"a":1}"#)
            .await
            .expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20260302/catalog_remote"));
        let stored = std::fs::read(&first.absolute_path).expect("read back");
        assert_eq!(stored, br#"{"a":1}"#);
    }

    #[test]
    fn missing_extension_falls_back_to_bin() {
        let archive = PayloadArchive::new("/tmp/archive");
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("ts");
        let path = archive.payload_relative_path(at, "src", Uuid::nil(), "abc", "");
        assert!(path.to_string_lossy().ends_with("abc.bin"));
    }
}
