//! The VFS contract: node, file and folder traits plus the filesystem surface.
//!
//! Handles are cheap path-addressed values; implementations resolve the path
//! against live state on every call, so a handle never pins storage.

use crate::{VfsResult, represent_path};
use async_trait::async_trait;
use std::any::Any;

/// Common surface of file and folder handles.
pub trait VfsNode: Send + Sync {
    /// Last path component; empty for the root folder.
    fn name(&self) -> &str;

    /// Absolute path from the root, one component per element.
    fn absolute_path(&self) -> &[String];

    /// Implementation identity escape hatch, used by filesystems to reject
    /// handles that belong to a different engine.
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait VfsFile: VfsNode {
    /// Current content length in bytes.
    async fn size(&self) -> VfsResult<u64>;

    /// Read the whole content.
    async fn read(&self) -> VfsResult<Vec<u8>>;

    /// Replace the whole content.
    async fn write(&self, data: &[u8]) -> VfsResult<()>;

    /// Detach this file from its parent folder.
    async fn remove(&self) -> VfsResult<()>;

    fn clone_file(&self) -> Box<dyn VfsFile>;
}

#[async_trait]
pub trait VfsFolder: VfsNode {
    /// Children in stored insertion order.
    async fn list(&self) -> VfsResult<Vec<VfsEntry>>;

    /// Create an empty file; fails with NodeExists when the name is taken.
    async fn create_file(&self, name: &str) -> VfsResult<Box<dyn VfsFile>>;

    /// Create an empty folder; fails with NodeExists when the name is taken.
    async fn create_folder(&self, name: &str) -> VfsResult<Box<dyn VfsFolder>>;

    /// Resolve a direct child that must be a file.
    async fn child_file(&self, name: &str) -> VfsResult<Box<dyn VfsFile>>;

    /// Resolve a direct child that must be a folder.
    async fn child_folder(&self, name: &str) -> VfsResult<Box<dyn VfsFolder>>;

    /// Detach this folder from its parent. A non-empty folder is only
    /// removed when `recursive` is set, otherwise FolderNotEmpty.
    async fn remove(&self, recursive: bool) -> VfsResult<()>;

    fn clone_folder(&self) -> Box<dyn VfsFolder>;
}

pub enum VfsEntry {
    File(Box<dyn VfsFile>),
    Folder(Box<dyn VfsFolder>),
}

impl VfsEntry {
    pub fn name(&self) -> &str {
        self.as_node().name()
    }

    pub fn absolute_path(&self) -> &[String] {
        self.as_node().absolute_path()
    }

    pub fn is_file(&self) -> bool {
        matches!(self, VfsEntry::File(_))
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, VfsEntry::Folder(_))
    }

    pub fn as_node(&self) -> &dyn VfsNode {
        match self {
            VfsEntry::File(file) => file.as_ref(),
            VfsEntry::Folder(folder) => folder.as_ref(),
        }
    }

    pub fn clone_entry(&self) -> VfsEntry {
        match self {
            VfsEntry::File(file) => VfsEntry::File(file.clone_file()),
            VfsEntry::Folder(folder) => VfsEntry::Folder(folder.clone_folder()),
        }
    }
}

impl std::fmt::Debug for dyn VfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VfsFile({})", represent_path(self.absolute_path()))
    }
}

impl std::fmt::Debug for dyn VfsFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VfsFolder({})", represent_path(self.absolute_path()))
    }
}

impl std::fmt::Debug for VfsEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_file() { "File" } else { "Folder" };
        write!(f, "VfsEntry::{}({})", kind, represent_path(self.absolute_path()))
    }
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Root folder handle: empty name, empty absolute path.
    fn root(&self) -> Box<dyn VfsFolder>;

    fn represent_path(&self, path: &[String]) -> String {
        represent_path(path)
    }

    /// Copy `source` into `target` under `name`. Both operands must belong to
    /// this filesystem. Copying a node onto itself is a no-op that returns
    /// the source handle.
    async fn copy_node(
        &self,
        source: &VfsEntry,
        target: &dyn VfsFolder,
        name: &str,
        overwrite: bool,
    ) -> VfsResult<VfsEntry>;

    /// Move `source` into `target` under `name`; the source is detached once
    /// the destination holds the content.
    async fn move_node(
        &self,
        source: &VfsEntry,
        target: &dyn VfsFolder,
        name: &str,
        overwrite: bool,
    ) -> VfsResult<VfsEntry>;
}
