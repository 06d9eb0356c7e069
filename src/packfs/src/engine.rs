//! High-level storage operations on one backing file.
//!
//! The engine owns the writer-preferring lock, the backing file path and a
//! one-shot initialization flag. Every user-visible operation runs inside a
//! scoped locked section with a fresh [`FileController`]; write sections
//! initialize an empty file on first use and finish with a defragmentation
//! check before the lock is released.

use crate::controller::FileController;
use crate::fragment::{NodeFragment, NodeKind, NodeReference, REFERENCE_SIZE};
use crate::rwlock::WritePriorityLock;
use fs2::FileExt;
use futures::future::BoxFuture;
use log::{debug, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use vfs_lib::{represent_path, VfsError, VfsResult};

/// One engine per backing file per process; dropped engines fall out and can
/// be reopened cold.
static ENGINE_REGISTRY: Lazy<Mutex<HashMap<PathBuf, Weak<StorageEngine>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackFsConfig {
    /// Write operations compact the file once the live share of its bytes
    /// drops below this value. 1.0 compacts on any garbage, 0.0 never.
    pub defrag_utilization: f64,
}

impl Default for PackFsConfig {
    fn default() -> Self {
        Self {
            defrag_utilization: 0.4,
        }
    }
}

#[derive(Debug)]
pub struct StorageEngine {
    pub(crate) path: PathBuf,
    pub(crate) config: PackFsConfig,
    lock: WritePriorityLock,
    initialized: AtomicBool,
    /// Advisory exclusive lock on the `.lock` sidecar, held for the engine's
    /// lifetime. Released when the handle drops.
    _guard: std::fs::File,
}

pub(crate) fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".");
    raw.push(suffix);
    PathBuf::from(raw)
}

impl StorageEngine {
    /// Open the engine on `path`, creating an empty backing file when none
    /// exists. A config sidecar `<path>.json` overrides the defaults.
    pub async fn open(path: impl Into<PathBuf>) -> VfsResult<Arc<StorageEngine>> {
        let path = path.into();
        let config = Self::load_sidecar_config(&path).await?;
        Self::open_with_config(path, config).await
    }

    pub async fn open_with_config(
        path: PathBuf,
        config: PackFsConfig,
    ) -> VfsResult<Arc<StorageEngine>> {
        let mut registry = ENGINE_REGISTRY.lock().unwrap();
        if let Some(existing) = registry.get(&path).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        registry.retain(|_, engine| engine.strong_count() > 0);

        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                VfsError::Internal(format!(
                    "create backing file {} failed: {}",
                    path.display(),
                    e
                ))
            })?;
        let guard = Self::acquire_guard(&path)?;

        let engine = Arc::new(StorageEngine {
            path: path.clone(),
            config,
            lock: WritePriorityLock::new(),
            initialized: AtomicBool::new(false),
            _guard: guard,
        });
        registry.insert(path, Arc::downgrade(&engine));
        Ok(engine)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &PackFsConfig {
        &self.config
    }

    async fn load_sidecar_config(path: &Path) -> VfsResult<PackFsConfig> {
        let sidecar = sidecar_path(path, "json");
        if !sidecar.exists() {
            return Ok(PackFsConfig::default());
        }
        let raw = tokio::fs::read_to_string(&sidecar).await.map_err(|e| {
            warn!(
                "StorageEngine: read config sidecar {} failed! {}",
                sidecar.display(),
                e
            );
            VfsError::Internal(format!("read config sidecar failed: {}", e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            warn!(
                "StorageEngine: parse config sidecar {} failed! {}",
                sidecar.display(),
                e
            );
            VfsError::Internal(format!("config sidecar is invalid: {}", e))
        })
    }

    fn acquire_guard(path: &Path) -> VfsResult<std::fs::File> {
        let lock_path = sidecar_path(path, "lock");
        let guard = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(|e| {
                VfsError::Internal(format!("create lock file {} failed: {}", lock_path.display(), e))
            })?;
        guard.try_lock_exclusive().map_err(|_| {
            VfsError::Internal(format!(
                "backing file {} is locked by another engine",
                path.display()
            ))
        })?;
        Ok(guard)
    }

    /// Run `op` with shared access and a read-only controller.
    pub async fn with_read_lock<T, F>(&self, op: F) -> VfsResult<T>
    where
        F: for<'c> FnOnce(&'c mut FileController) -> BoxFuture<'c, VfsResult<T>>,
    {
        self.lock.lock_read().await;
        let result = self.read_section(op).await;
        self.lock.unlock_read().await;
        result
    }

    async fn read_section<T, F>(&self, op: F) -> VfsResult<T>
    where
        F: for<'c> FnOnce(&'c mut FileController) -> BoxFuture<'c, VfsResult<T>>,
    {
        let mut fc = FileController::open_read(&self.path).await?;
        let value = op(&mut fc).await?;
        fc.close().await?;
        Ok(value)
    }

    /// Run `op` with exclusive access and a read/write controller. An empty
    /// backing file is initialized first; a defragmentation check runs after
    /// the operation, before the lock is released.
    pub async fn with_write_lock<T, F>(&self, op: F) -> VfsResult<T>
    where
        F: for<'c> FnOnce(&'c mut FileController) -> BoxFuture<'c, VfsResult<T>>,
    {
        self.lock.lock_write().await;
        let result = self.write_section(op).await;
        self.lock.unlock_write().await;
        result
    }

    async fn write_section<T, F>(&self, op: F) -> VfsResult<T>
    where
        F: for<'c> FnOnce(&'c mut FileController) -> BoxFuture<'c, VfsResult<T>>,
    {
        let mut fc = FileController::open_write(&self.path).await?;
        if !self.initialized.load(Ordering::Acquire) {
            if fc.size().await? == 0 {
                self.initialize(&mut fc).await?;
            }
            self.initialized.store(true, Ordering::Release);
        }
        let value = op(&mut fc).await?;
        self.defragment_if_needed(&mut fc).await?;
        fc.close().await?;
        Ok(value)
    }

    /// Lay down the root: a folder reference at offset 0 pointing at an empty
    /// root record at offset 9.
    async fn initialize(&self, fc: &mut FileController) -> VfsResult<()> {
        debug!(
            "StorageEngine: initializing backing file {}",
            self.path.display()
        );
        fc.seek(0).await?;
        fc.put_reference(NodeKind::Folder, REFERENCE_SIZE).await?;
        let root_reference = NodeReference {
            position: 0,
            data_position: REFERENCE_SIZE,
            kind: NodeKind::Folder,
        };
        fc.put_folder_fragment(root_reference, "", 0, &[], None)
            .await?;
        Ok(())
    }
}

/// Walk `path` from the root, one component at a time. Each step loads the
/// children of the current folder and matches by name. A missing component,
/// or a file in a non-terminal position, is NodeNotFound.
pub(crate) async fn navigate(
    fc: &mut FileController,
    path: &[String],
) -> VfsResult<Arc<NodeFragment>> {
    let mut current = Arc::new(fc.read_fragment_at(0, None).await?);
    for (depth, part) in path.iter().enumerate() {
        let children = match current.folder_meta() {
            Some(folder) => folder.children.clone(),
            None => return Err(VfsError::NodeNotFound(represent_path(&path[..depth]))),
        };
        let mut matched = None;
        for reference in children {
            let child = fc.read_fragment(reference, Some(current.clone())).await?;
            if child.name() == part {
                matched = Some(child);
                break;
            }
        }
        current = match matched {
            Some(child) => Arc::new(child),
            None => return Err(VfsError::NodeNotFound(represent_path(&path[..=depth]))),
        };
    }
    Ok(current)
}

/// Append the grown parent record at end-of-file, redirect its reference
/// cell, and push the growth up the ancestor chain. Growing in place is
/// never possible: the record gains a 9-byte reference cell.
pub(crate) async fn add_child(
    fc: &mut FileController,
    parent: Arc<NodeFragment>,
    child: &NodeFragment,
) -> VfsResult<Arc<NodeFragment>> {
    let folder = parent
        .folder_meta()
        .ok_or_else(|| VfsError::Internal(format!("{} is not a folder", parent.name())))?;
    let new_data_position = fc.size().await?;
    let mut children = folder.children.clone();
    children.push(child.reference);
    let children_used_space = folder.children_used_space + child.total_size_bytes();

    let new_parent = fc
        .put_folder_fragment(
            NodeReference {
                position: parent.reference.position,
                data_position: new_data_position,
                kind: NodeKind::Folder,
            },
            &folder.name,
            children_used_space,
            &children,
            parent.parent.clone(),
        )
        .await?;
    fc.seek(parent.reference.position).await?;
    fc.put_reference(NodeKind::Folder, new_data_position).await?;

    let growth = new_parent.total_size_bytes() - parent.total_size_bytes();
    fc.propagate_used_space_change(&new_parent, growth).await?;
    Ok(Arc::new(new_parent))
}

/// Drop the child's reference cell from the parent record. The record
/// strictly shrinks, so it is rewritten in place and the parent's own
/// reference cell stays put.
pub(crate) async fn remove_child(
    fc: &mut FileController,
    parent: Arc<NodeFragment>,
    child: &NodeFragment,
) -> VfsResult<Arc<NodeFragment>> {
    let folder = parent
        .folder_meta()
        .ok_or_else(|| VfsError::Internal(format!("{} is not a folder", parent.name())))?;
    let children: Vec<NodeReference> = folder
        .children
        .iter()
        .filter(|reference| reference.data_position != child.reference.data_position)
        .copied()
        .collect();
    let children_used_space = folder.children_used_space - child.total_size_bytes();

    let new_parent = fc
        .put_folder_fragment(
            NodeReference {
                position: parent.reference.position,
                data_position: parent.reference.data_position,
                kind: NodeKind::Folder,
            },
            &folder.name,
            children_used_space,
            &children,
            parent.parent.clone(),
        )
        .await?;
    let delta = new_parent.total_size_bytes() - parent.total_size_bytes();
    fc.propagate_used_space_change(&new_parent, delta).await?;
    Ok(Arc::new(new_parent))
}

/// Fail with NodeExists when `parent_path/name` already resolves.
pub(crate) async fn ensure_not_exists(
    fc: &mut FileController,
    parent_path: &[String],
    name: &str,
) -> VfsResult<()> {
    let mut full = parent_path.to_vec();
    full.push(name.to_string());
    match navigate(fc, &full).await {
        Ok(_) => Err(VfsError::NodeExists(represent_path(&full))),
        Err(VfsError::NodeNotFound(_)) => Ok(()),
        Err(err) => Err(err),
    }
}
