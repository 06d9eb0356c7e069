mod node;
mod ops;

pub use node::{FileSystem, VfsEntry, VfsFile, VfsFolder, VfsNode};
pub use ops::{copy_file, copy_folder, find_child, move_file, move_folder};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("folder not found: {0}")]
    FolderNotFound(String),
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("file already exists: {0}")]
    FileExists(String),
    #[error("folder is not empty: {0}")]
    FolderNotEmpty(String),
    #[error("operands belong to another filesystem: {0}")]
    CrossFsOperation(String),
    #[error("corrupt container format: {0}")]
    CorruptFormat(String),
    #[error("short read: {0}")]
    ShortRead(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type VfsResult<T> = std::result::Result<T, VfsError>;

impl VfsError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VfsError::NodeNotFound(_) | VfsError::FileNotFound(_) | VfsError::FolderNotFound(_)
        )
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, VfsError::NodeExists(_) | VfsError::FileExists(_))
    }

    /// Translate the internal navigation failure for a caller that expected a file.
    pub fn expecting_file(self, path: &str) -> Self {
        match self {
            VfsError::NodeNotFound(_) => VfsError::FileNotFound(path.to_string()),
            other => other,
        }
    }

    /// Translate the internal navigation failure for a caller that expected a folder.
    pub fn expecting_folder(self, path: &str) -> Self {
        match self {
            VfsError::NodeNotFound(_) => VfsError::FolderNotFound(path.to_string()),
            other => other,
        }
    }
}

impl From<std::io::Error> for VfsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => VfsError::ShortRead(err.to_string()),
            _ => VfsError::Internal(err.to_string()),
        }
    }
}

/// Render an absolute path as a `/`-separated string with a leading `/`.
pub fn represent_path(path: &[String]) -> String {
    let mut rendered = String::from("/");
    rendered.push_str(&path.join("/"));
    rendered
}
