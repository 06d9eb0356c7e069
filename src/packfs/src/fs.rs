//! VFS facade over the storage engine.
//!
//! Handles are path-addressed: every operation re-navigates from the root
//! under a fresh lock, so a handle stays valid across arbitrary concurrent
//! mutations and simply reports not-found once its path is gone.

use crate::engine::{self, PackFsConfig, StorageEngine};
use crate::fragment::{NodeKind, NodeReference};
use async_trait::async_trait;
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use vfs_lib::{
    copy_file, copy_folder, move_file, move_folder, represent_path, FileSystem, VfsEntry,
    VfsError, VfsFile, VfsFolder, VfsNode, VfsResult,
};

#[derive(Clone)]
pub struct PackFs {
    engine: Arc<StorageEngine>,
}

#[derive(Clone)]
pub struct PackFolder {
    engine: Arc<StorageEngine>,
    path: Vec<String>,
}

#[derive(Clone)]
pub struct PackFile {
    engine: Arc<StorageEngine>,
    path: Vec<String>,
}

impl PackFs {
    /// Open a filesystem stored in the single backing file at `path`,
    /// creating an empty one when the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> VfsResult<PackFs> {
        Ok(PackFs {
            engine: StorageEngine::open(path).await?,
        })
    }

    pub async fn open_with_config(
        path: impl Into<PathBuf>,
        config: PackFsConfig,
    ) -> VfsResult<PackFs> {
        Ok(PackFs {
            engine: StorageEngine::open_with_config(path.into(), config).await?,
        })
    }

    pub fn root(&self) -> PackFolder {
        PackFolder {
            engine: self.engine.clone(),
            path: Vec::new(),
        }
    }

    pub(crate) fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    fn engine_of(node: &dyn VfsNode) -> Option<&Arc<StorageEngine>> {
        if let Some(file) = node.as_any().downcast_ref::<PackFile>() {
            Some(&file.engine)
        } else if let Some(folder) = node.as_any().downcast_ref::<PackFolder>() {
            Some(&folder.engine)
        } else {
            None
        }
    }

    fn claim(&self, node: &dyn VfsNode) -> VfsResult<()> {
        match Self::engine_of(node) {
            Some(engine) if Arc::ptr_eq(engine, &self.engine) => Ok(()),
            _ => Err(VfsError::CrossFsOperation(represent_path(
                node.absolute_path(),
            ))),
        }
    }

    fn coincides(source: &VfsEntry, target: &dyn VfsFolder, name: &str) -> bool {
        source
            .absolute_path()
            .split_last()
            .map_or(false, |(last, parent)| {
                last == name && parent == target.absolute_path()
            })
    }
}

#[async_trait]
impl FileSystem for PackFs {
    fn root(&self) -> Box<dyn VfsFolder> {
        Box::new(PackFs::root(self))
    }

    async fn copy_node(
        &self,
        source: &VfsEntry,
        target: &dyn VfsFolder,
        name: &str,
        overwrite: bool,
    ) -> VfsResult<VfsEntry> {
        self.claim(source.as_node())?;
        self.claim(target)?;
        if Self::coincides(source, target, name) {
            return Ok(source.clone_entry());
        }
        match source {
            VfsEntry::File(file) => Ok(VfsEntry::File(
                copy_file(file.as_ref(), target, name, overwrite).await?,
            )),
            VfsEntry::Folder(folder) => Ok(VfsEntry::Folder(
                copy_folder(folder.as_ref(), target, name, overwrite).await?,
            )),
        }
    }

    async fn move_node(
        &self,
        source: &VfsEntry,
        target: &dyn VfsFolder,
        name: &str,
        overwrite: bool,
    ) -> VfsResult<VfsEntry> {
        self.claim(source.as_node())?;
        self.claim(target)?;
        if Self::coincides(source, target, name) {
            return Ok(source.clone_entry());
        }
        match source {
            VfsEntry::File(file) => Ok(VfsEntry::File(
                move_file(file.as_ref(), target, name, overwrite).await?,
            )),
            VfsEntry::Folder(folder) => Ok(VfsEntry::Folder(
                move_folder(folder.as_ref(), target, name, overwrite).await?,
            )),
        }
    }
}

fn child_path(path: &[String], name: &str) -> Vec<String> {
    let mut child = path.to_vec();
    child.push(name.to_string());
    child
}

impl VfsNode for PackFolder {
    fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("")
    }

    fn absolute_path(&self) -> &[String] {
        &self.path
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl VfsFolder for PackFolder {
    async fn list(&self) -> VfsResult<Vec<VfsEntry>> {
        let path = self.path.clone();
        let repr = represent_path(&path);
        let children: Vec<(String, NodeKind)> = self
            .engine
            .with_read_lock(move |fc| {
                Box::pin(async move {
                    let fragment = engine::navigate(fc, &path)
                        .await
                        .map_err(|e| e.expecting_folder(&repr))?;
                    let folder = fragment
                        .folder_meta()
                        .ok_or_else(|| VfsError::FolderNotFound(repr.clone()))?;
                    let mut children = Vec::with_capacity(folder.children.len());
                    for reference in folder.children.clone() {
                        let child = fc.read_fragment(reference, None).await?;
                        children.push((child.name().to_string(), reference.kind));
                    }
                    Ok(children)
                })
            })
            .await?;

        Ok(children
            .into_iter()
            .map(|(name, kind)| {
                let path = child_path(&self.path, &name);
                match kind {
                    NodeKind::File => VfsEntry::File(Box::new(PackFile {
                        engine: self.engine.clone(),
                        path,
                    })),
                    NodeKind::Folder => VfsEntry::Folder(Box::new(PackFolder {
                        engine: self.engine.clone(),
                        path,
                    })),
                }
            })
            .collect())
    }

    async fn create_file(&self, name: &str) -> VfsResult<Box<dyn VfsFile>> {
        let parent_path = self.path.clone();
        let child_name = name.to_string();
        let repr = represent_path(&parent_path);
        self.engine
            .with_write_lock(move |fc| {
                Box::pin(async move {
                    let parent = engine::navigate(fc, &parent_path)
                        .await
                        .map_err(|e| e.expecting_folder(&repr))?;
                    if !parent.is_folder() {
                        return Err(VfsError::FolderNotFound(repr));
                    }
                    engine::ensure_not_exists(fc, &parent_path, &child_name).await?;
                    let data_position = fc.size().await?;
                    let child = fc
                        .put_file_fragment(
                            NodeReference::intangible(NodeKind::File, data_position),
                            &child_name,
                            &[],
                            Some(parent.clone()),
                        )
                        .await?;
                    engine::add_child(fc, parent, &child).await?;
                    Ok(())
                })
            })
            .await?;
        Ok(Box::new(PackFile {
            engine: self.engine.clone(),
            path: child_path(&self.path, name),
        }))
    }

    async fn create_folder(&self, name: &str) -> VfsResult<Box<dyn VfsFolder>> {
        let parent_path = self.path.clone();
        let child_name = name.to_string();
        let repr = represent_path(&parent_path);
        self.engine
            .with_write_lock(move |fc| {
                Box::pin(async move {
                    let parent = engine::navigate(fc, &parent_path)
                        .await
                        .map_err(|e| e.expecting_folder(&repr))?;
                    if !parent.is_folder() {
                        return Err(VfsError::FolderNotFound(repr));
                    }
                    engine::ensure_not_exists(fc, &parent_path, &child_name).await?;
                    let data_position = fc.size().await?;
                    let child = fc
                        .put_folder_fragment(
                            NodeReference::intangible(NodeKind::Folder, data_position),
                            &child_name,
                            0,
                            &[],
                            Some(parent.clone()),
                        )
                        .await?;
                    engine::add_child(fc, parent, &child).await?;
                    Ok(())
                })
            })
            .await?;
        Ok(Box::new(PackFolder {
            engine: self.engine.clone(),
            path: child_path(&self.path, name),
        }))
    }

    async fn child_file(&self, name: &str) -> VfsResult<Box<dyn VfsFile>> {
        let path = child_path(&self.path, name);
        let repr = represent_path(&path);
        self.engine
            .with_read_lock(move |fc| {
                Box::pin(async move {
                    let fragment = engine::navigate(fc, &path)
                        .await
                        .map_err(|e| e.expecting_file(&repr))?;
                    if !fragment.is_file() {
                        return Err(VfsError::FileNotFound(repr));
                    }
                    Ok(())
                })
            })
            .await?;
        Ok(Box::new(PackFile {
            engine: self.engine.clone(),
            path: child_path(&self.path, name),
        }))
    }

    async fn child_folder(&self, name: &str) -> VfsResult<Box<dyn VfsFolder>> {
        let path = child_path(&self.path, name);
        let repr = represent_path(&path);
        self.engine
            .with_read_lock(move |fc| {
                Box::pin(async move {
                    let fragment = engine::navigate(fc, &path)
                        .await
                        .map_err(|e| e.expecting_folder(&repr))?;
                    if !fragment.is_folder() {
                        return Err(VfsError::FolderNotFound(repr));
                    }
                    Ok(())
                })
            })
            .await?;
        Ok(Box::new(PackFolder {
            engine: self.engine.clone(),
            path: child_path(&self.path, name),
        }))
    }

    async fn remove(&self, recursive: bool) -> VfsResult<()> {
        let path = self.path.clone();
        let repr = represent_path(&path);
        self.engine
            .with_write_lock(move |fc| {
                Box::pin(async move {
                    let fragment = engine::navigate(fc, &path)
                        .await
                        .map_err(|e| e.expecting_folder(&repr))?;
                    let folder = fragment
                        .folder_meta()
                        .ok_or_else(|| VfsError::FolderNotFound(repr.clone()))?;
                    if !folder.children.is_empty() && !recursive {
                        return Err(VfsError::FolderNotEmpty(repr));
                    }
                    // dropping the reference makes the whole subtree garbage;
                    // the next defragmentation reclaims it
                    if let Some(parent) = fragment.parent.clone() {
                        engine::remove_child(fc, parent, &fragment).await?;
                    }
                    Ok(())
                })
            })
            .await
    }

    fn clone_folder(&self) -> Box<dyn VfsFolder> {
        Box::new(self.clone())
    }
}

impl VfsNode for PackFile {
    fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("")
    }

    fn absolute_path(&self) -> &[String] {
        &self.path
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl VfsFile for PackFile {
    async fn size(&self) -> VfsResult<u64> {
        let path = self.path.clone();
        let repr = represent_path(&path);
        self.engine
            .with_read_lock(move |fc| {
                Box::pin(async move {
                    let fragment = engine::navigate(fc, &path)
                        .await
                        .map_err(|e| e.expecting_file(&repr))?;
                    let meta = fragment
                        .file_meta()
                        .ok_or_else(|| VfsError::FileNotFound(repr.clone()))?;
                    Ok(meta.file_size as u64)
                })
            })
            .await
    }

    async fn read(&self) -> VfsResult<Vec<u8>> {
        let path = self.path.clone();
        let repr = represent_path(&path);
        self.engine
            .with_read_lock(move |fc| {
                Box::pin(async move {
                    let fragment = engine::navigate(fc, &path)
                        .await
                        .map_err(|e| e.expecting_file(&repr))?;
                    if !fragment.is_file() {
                        return Err(VfsError::FileNotFound(repr));
                    }
                    fc.read_file_content(&fragment).await
                })
            })
            .await
    }

    async fn write(&self, data: &[u8]) -> VfsResult<()> {
        let path = self.path.clone();
        let repr = represent_path(&path);
        let data = data.to_vec();
        self.engine
            .with_write_lock(move |fc| {
                Box::pin(async move {
                    let fragment = engine::navigate(fc, &path)
                        .await
                        .map_err(|e| e.expecting_file(&repr))?;
                    if !fragment.is_file() {
                        return Err(VfsError::FileNotFound(repr));
                    }
                    let parent = fragment.parent.clone();
                    fc.update_file_content(fragment.reference, &data, parent)
                        .await?;
                    Ok(())
                })
            })
            .await
    }

    async fn remove(&self) -> VfsResult<()> {
        let path = self.path.clone();
        let repr = represent_path(&path);
        self.engine
            .with_write_lock(move |fc| {
                Box::pin(async move {
                    let fragment = engine::navigate(fc, &path)
                        .await
                        .map_err(|e| e.expecting_file(&repr))?;
                    if !fragment.is_file() {
                        return Err(VfsError::FileNotFound(repr));
                    }
                    let parent = fragment.parent.clone().ok_or_else(|| {
                        VfsError::Internal(format!("file {} has no parent", repr))
                    })?;
                    engine::remove_child(fc, parent, &fragment).await?;
                    Ok(())
                })
            })
            .await
    }

    fn clone_file(&self) -> Box<dyn VfsFile> {
        Box::new(self.clone())
    }
}
