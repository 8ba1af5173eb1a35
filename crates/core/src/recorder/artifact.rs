use super::format::RecordingFormat;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};

pub const FILE_PREFIX: &str = "partner-session";

/// The encoded output of one start/stop recording cycle.
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub format: RecordingFormat,
    pub data: Bytes,
    pub created_at: DateTime<Utc>,
}

impl RecordingArtifact {
    pub fn from_chunks(format: RecordingFormat, chunks: Vec<Bytes>) -> Self {
        let total = chunks.iter().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(total);
        for chunk in chunks {
            data.extend_from_slice(&chunk);
        }
        Self {
            format,
            data: data.freeze(),
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// `partner-session-2025-01-31T12-00-00-000Z.webm`
    pub fn file_name(&self) -> String {
        let stamp = self
            .created_at
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .replace([':', '.'], "-");
        format!("{FILE_PREFIX}-{stamp}.{}", self.format.extension)
    }

    /// Writes the artifact into `dir` and returns the full path.
    pub async fn save_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(self.file_name());
        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}
