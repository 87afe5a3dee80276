use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::record::CaptureRecord;

#[derive(Debug, thiserror::Error)]
pub enum RecordWriteError {
    #[error("cannot open capture file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot encode capture record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("capture output failed: {0}")]
    Io(#[source] io::Error),
}

/// JSON-lines output for [`CaptureRecord`]s: one object, one `\n`.
pub struct RecordWriter<W> {
    output: W,
}

impl RecordWriter<tokio::fs::File> {
    /// Append to the file at `path`, creating it and any missing parent
    /// directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RecordWriteError> {
        let path = path.as_ref();
        let open_error = |source: io::Error| RecordWriteError::Open {
            path: path.to_path_buf(),
            source,
        };

        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                tokio::fs::create_dir_all(dir).await.map_err(open_error)?
            }
            _ => {}
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(open_error)?;
        Ok(Self::new(file))
    }
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    pub async fn write(&mut self, record: &CaptureRecord) -> Result<(), RecordWriteError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.output.write_all(&line).await.map_err(RecordWriteError::Io)
    }

    pub async fn flush(&mut self) -> Result<(), RecordWriteError> {
        self.output.flush().await.map_err(RecordWriteError::Io)
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}
