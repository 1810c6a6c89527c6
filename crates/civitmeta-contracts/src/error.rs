use std::path::{Path, PathBuf};

use thiserror::Error;

pub type ConvertResult<T> = Result<T, ConvertError>;

/// Per-file failures. Any of these skips the file and leaves no output behind;
/// lookup problems are never reported here because they degrade to a fallback hash.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("comment recovery failed: {0}")]
    Recovery(String),
    #[error("metadata schema invalid: {0}")]
    Schema(String),
    #[error("image container error: {0}")]
    Container(String),
    #[error("cannot access {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported input {}: expected a JPEG file or a folder of JPEG files", path.display())]
    Unsupported { path: PathBuf },
}

impl ConvertError {
    pub fn file_system(path: &Path, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Recovery(_) => "recovery",
            Self::Schema(_) => "schema",
            Self::Container(_) => "container",
            Self::FileSystem { .. } => "filesystem",
            Self::Unsupported { .. } => "unsupported",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FileSystem { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}
