//! Generic copy/move helpers written purely against the VFS traits.
//!
//! Filesystems delegate here after validating that both operands belong to
//! them; the helpers only speak the trait contract, so any two handles of the
//! same implementation compose.

use crate::{represent_path, VfsEntry, VfsError, VfsFile, VfsFolder, VfsResult};
use futures::future::BoxFuture;

fn child_repr(folder: &dyn VfsFolder, name: &str) -> String {
    let mut path = folder.absolute_path().to_vec();
    path.push(name.to_string());
    represent_path(&path)
}

/// Look up a direct child of any kind by name.
pub async fn find_child(folder: &dyn VfsFolder, name: &str) -> VfsResult<Option<VfsEntry>> {
    for entry in folder.list().await? {
        if entry.name() == name {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

/// Copy a file into `target` under `name`, replacing an existing node only
/// when `overwrite` is set.
pub async fn copy_file(
    source: &dyn VfsFile,
    target: &dyn VfsFolder,
    name: &str,
    overwrite: bool,
) -> VfsResult<Box<dyn VfsFile>> {
    let destination = match find_child(target, name).await? {
        Some(existing) => {
            if !overwrite {
                return Err(VfsError::FileExists(child_repr(target, name)));
            }
            match existing {
                VfsEntry::File(file) => file,
                VfsEntry::Folder(folder) => {
                    folder.remove(true).await?;
                    target.create_file(name).await?
                }
            }
        }
        None => target.create_file(name).await?,
    };
    let data = source.read().await?;
    destination.write(&data).await?;
    Ok(destination)
}

/// Copy, then detach the source file.
pub async fn move_file(
    source: &dyn VfsFile,
    target: &dyn VfsFolder,
    name: &str,
    overwrite: bool,
) -> VfsResult<Box<dyn VfsFile>> {
    let destination = copy_file(source, target, name, overwrite).await?;
    source.remove().await?;
    Ok(destination)
}

/// Copy a folder subtree into `target` under `name`. An existing destination
/// node is dropped first when `overwrite` is set.
pub fn copy_folder<'a>(
    source: &'a dyn VfsFolder,
    target: &'a dyn VfsFolder,
    name: &'a str,
    overwrite: bool,
) -> BoxFuture<'a, VfsResult<Box<dyn VfsFolder>>> {
    Box::pin(async move {
        let destination = match find_child(target, name).await? {
            Some(existing) => {
                if !overwrite {
                    return Err(VfsError::FileExists(child_repr(target, name)));
                }
                match existing {
                    VfsEntry::File(file) => file.remove().await?,
                    VfsEntry::Folder(folder) => folder.remove(true).await?,
                }
                target.create_folder(name).await?
            }
            None => target.create_folder(name).await?,
        };
        for entry in source.list().await? {
            match entry {
                VfsEntry::File(file) => {
                    copy_file(file.as_ref(), destination.as_ref(), file.name(), true).await?;
                }
                VfsEntry::Folder(folder) => {
                    copy_folder(folder.as_ref(), destination.as_ref(), folder.name(), true)
                        .await?;
                }
            }
        }
        Ok(destination)
    })
}

/// Copy the subtree, then detach the source folder.
pub async fn move_folder(
    source: &dyn VfsFolder,
    target: &dyn VfsFolder,
    name: &str,
    overwrite: bool,
) -> VfsResult<Box<dyn VfsFolder>> {
    let destination = copy_folder(source, target, name, overwrite).await?;
    source.remove(true).await?;
    Ok(destination)
}
