//! Positioned byte access to the backing file.
//!
//! One controller wraps one open handle for the duration of a locked
//! section: read-only for readers, read/write for writers. It knows the
//! record framing but nothing about tree navigation.

use crate::fragment::{
    file_record_len, folder_record_len, FileMeta, FolderMeta, NodeFragment, NodeKind, NodeMeta,
    NodeReference, REFERENCE_SIZE,
};
use log::warn;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use vfs_lib::{VfsError, VfsResult};

pub struct FileController {
    file: File,
}

impl FileController {
    pub async fn open_read(path: &Path) -> VfsResult<Self> {
        let file = OpenOptions::new().read(true).open(path).await.map_err(|e| {
            VfsError::Internal(format!("open backing file {} failed: {}", path.display(), e))
        })?;
        Ok(Self { file })
    }

    pub async fn open_write(path: &Path) -> VfsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| {
                VfsError::Internal(format!("open backing file {} failed: {}", path.display(), e))
            })?;
        Ok(Self { file })
    }

    /// Open a fresh sidecar for the defragmentation rewrite.
    pub async fn create(path: &Path) -> VfsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| {
                VfsError::Internal(format!("create {} failed: {}", path.display(), e))
            })?;
        Ok(Self { file })
    }

    pub async fn close(mut self) -> VfsResult<()> {
        self.file.flush().await?;
        Ok(())
    }

    pub async fn position(&mut self) -> VfsResult<i64> {
        Ok(self.file.stream_position().await? as i64)
    }

    pub async fn seek(&mut self, position: i64) -> VfsResult<()> {
        self.file.seek(SeekFrom::Start(position as u64)).await?;
        Ok(())
    }

    pub async fn size(&mut self) -> VfsResult<i64> {
        Ok(self.file.metadata().await?.len() as i64)
    }

    async fn read_u8(&mut self) -> VfsResult<u8> {
        let mut buf = [0u8; 1];
        self.file.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    async fn read_u16(&mut self) -> VfsResult<u16> {
        let mut buf = [0u8; 2];
        self.file.read_exact(&mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    async fn read_i32(&mut self) -> VfsResult<i32> {
        let mut buf = [0u8; 4];
        self.file.read_exact(&mut buf).await?;
        Ok(i32::from_be_bytes(buf))
    }

    async fn read_i64(&mut self) -> VfsResult<i64> {
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf).await?;
        Ok(i64::from_be_bytes(buf))
    }

    async fn write_u16(&mut self, value: u16) -> VfsResult<()> {
        self.file.write_all(&value.to_be_bytes()).await?;
        Ok(())
    }

    async fn write_i32(&mut self, value: i32) -> VfsResult<()> {
        self.file.write_all(&value.to_be_bytes()).await?;
        Ok(())
    }

    async fn write_i64(&mut self, value: i64) -> VfsResult<()> {
        self.file.write_all(&value.to_be_bytes()).await?;
        Ok(())
    }

    async fn read_name(&mut self) -> VfsResult<String> {
        let len = self.read_u16().await? as usize;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;
        String::from_utf8(buf)
            .map_err(|e| VfsError::CorruptFormat(format!("node name is not valid utf-8: {}", e)))
    }

    async fn write_name(&mut self, name: &str) -> VfsResult<()> {
        self.write_u16(name.len() as u16).await?;
        self.file.write_all(name.as_bytes()).await?;
        Ok(())
    }

    /// Decode the 9-byte reference cell at the current position.
    pub async fn read_reference(&mut self) -> VfsResult<NodeReference> {
        let position = self.position().await?;
        let mark = self.read_u8().await?;
        let data_position = self.read_i64().await?;
        let kind = NodeKind::from_mark(mark).ok_or_else(|| {
            warn!(
                "FileController: unknown reference mark {:#04x} at offset {}",
                mark, position
            );
            VfsError::CorruptFormat(format!(
                "unknown reference mark {:#04x} at offset {}",
                mark, position
            ))
        })?;
        Ok(NodeReference {
            position,
            data_position,
            kind,
        })
    }

    /// Encode a reference cell at the current position.
    pub async fn put_reference(
        &mut self,
        kind: NodeKind,
        data_position: i64,
    ) -> VfsResult<NodeReference> {
        let position = self.position().await?;
        self.file.write_all(&[kind.mark()]).await?;
        self.write_i64(data_position).await?;
        Ok(NodeReference {
            position,
            data_position,
            kind,
        })
    }

    /// Decode the metadata record a reference points at. File content is not
    /// read here, only its length.
    pub async fn read_fragment(
        &mut self,
        reference: NodeReference,
        parent: Option<Arc<NodeFragment>>,
    ) -> VfsResult<NodeFragment> {
        self.seek(reference.data_position).await?;
        match reference.kind {
            NodeKind::File => {
                let name = self.read_name().await?;
                let file_size = self.read_i64().await?;
                if file_size < 0 {
                    return Err(VfsError::CorruptFormat(format!(
                        "negative file size {} at offset {}",
                        file_size, reference.data_position
                    )));
                }
                let meta_size_bytes = file_record_len(&name, file_size) + REFERENCE_SIZE;
                Ok(NodeFragment {
                    reference,
                    meta: NodeMeta::File(FileMeta { name, file_size }),
                    parent,
                    meta_size_bytes,
                })
            }
            NodeKind::Folder => {
                let children_used_space = self.read_i64().await?;
                let children_count = self.read_i32().await?;
                if children_count < 0 {
                    return Err(VfsError::CorruptFormat(format!(
                        "negative child count {} at offset {}",
                        children_count, reference.data_position
                    )));
                }
                let mut children = Vec::with_capacity(children_count as usize);
                for _ in 0..children_count {
                    children.push(self.read_reference().await?);
                }
                let name = self.read_name().await?;
                let meta_size_bytes =
                    folder_record_len(&name, children.len()) + REFERENCE_SIZE;
                Ok(NodeFragment {
                    reference,
                    meta: NodeMeta::Folder(FolderMeta {
                        name,
                        children_used_space,
                        children,
                    }),
                    parent,
                    meta_size_bytes,
                })
            }
        }
    }

    /// Decode the reference at `ref_position`, then its record. An empty
    /// backing file yields the virtual root instead.
    pub async fn read_fragment_at(
        &mut self,
        ref_position: i64,
        parent: Option<Arc<NodeFragment>>,
    ) -> VfsResult<NodeFragment> {
        if ref_position == 0 && self.size().await? == 0 {
            return Ok(NodeFragment::virtual_root());
        }
        self.seek(ref_position).await?;
        let reference = self.read_reference().await?;
        self.read_fragment(reference, parent).await
    }

    /// Read exactly `file_size` content bytes of a file fragment.
    pub async fn read_file_content(&mut self, fragment: &NodeFragment) -> VfsResult<Vec<u8>> {
        let meta = fragment.file_meta().ok_or_else(|| {
            VfsError::Internal(format!("{} is not a file fragment", fragment.name()))
        })?;
        self.seek(fragment.reference.data_position + 2 + meta.name.len() as i64 + 8)
            .await?;
        let mut data = vec![0u8; meta.file_size as usize];
        self.file.read_exact(&mut data).await?;
        Ok(data)
    }

    /// Write a complete file record at `reference.data_position`.
    pub async fn put_file_fragment(
        &mut self,
        reference: NodeReference,
        name: &str,
        data: &[u8],
        parent: Option<Arc<NodeFragment>>,
    ) -> VfsResult<NodeFragment> {
        self.seek(reference.data_position).await?;
        self.write_name(name).await?;
        self.write_i64(data.len() as i64).await?;
        self.file.write_all(data).await?;
        Ok(NodeFragment {
            reference,
            meta: NodeMeta::File(FileMeta {
                name: name.to_string(),
                file_size: data.len() as i64,
            }),
            parent,
            meta_size_bytes: file_record_len(name, data.len() as i64) + REFERENCE_SIZE,
        })
    }

    /// Write a complete folder record at `reference.data_position`. The
    /// returned fragment carries the child references at their new cells.
    pub async fn put_folder_fragment(
        &mut self,
        reference: NodeReference,
        name: &str,
        children_used_space: i64,
        children: &[NodeReference],
        parent: Option<Arc<NodeFragment>>,
    ) -> VfsResult<NodeFragment> {
        self.seek(reference.data_position).await?;
        self.write_i64(children_used_space).await?;
        self.write_i32(children.len() as i32).await?;
        let mut stored = Vec::with_capacity(children.len());
        for child in children {
            stored.push(self.put_reference(child.kind, child.data_position).await?);
        }
        self.write_name(name).await?;
        Ok(NodeFragment {
            reference,
            meta: NodeMeta::Folder(FolderMeta {
                name: name.to_string(),
                children_used_space,
                children: stored,
            }),
            parent,
            meta_size_bytes: folder_record_len(name, children.len()) + REFERENCE_SIZE,
        })
    }

    /// Replace a file's content. Shrinking (or equal-size) rewrites land in
    /// place; growth appends a fresh record at end-of-file and redirects the
    /// reference cell. Ancestor used-space counters absorb the size delta
    /// either way.
    pub async fn update_file_content(
        &mut self,
        reference: NodeReference,
        data: &[u8],
        parent: Option<Arc<NodeFragment>>,
    ) -> VfsResult<NodeFragment> {
        self.seek(reference.data_position).await?;
        let name = self.read_name().await?;
        let old_size = self.read_i64().await?;
        let new_size = data.len() as i64;

        let fragment = if new_size <= old_size {
            self.seek(reference.data_position + 2 + name.len() as i64)
                .await?;
            self.write_i64(new_size).await?;
            self.file.write_all(data).await?;
            NodeFragment {
                reference,
                meta: NodeMeta::File(FileMeta {
                    name: name.clone(),
                    file_size: new_size,
                }),
                parent,
                meta_size_bytes: file_record_len(&name, new_size) + REFERENCE_SIZE,
            }
        } else {
            let new_data_position = self.size().await?;
            let moved = NodeReference {
                position: reference.position,
                data_position: new_data_position,
                kind: NodeKind::File,
            };
            let fragment = self.put_file_fragment(moved, &name, data, parent).await?;
            self.seek(reference.position).await?;
            self.put_reference(NodeKind::File, new_data_position).await?;
            fragment
        };
        self.propagate_used_space_change(&fragment, new_size - old_size)
            .await?;
        Ok(fragment)
    }

    /// Add `delta` to `children_used_space` of every ancestor folder record,
    /// walking the parent chain upward.
    pub async fn propagate_used_space_change(
        &mut self,
        fragment: &NodeFragment,
        delta: i64,
    ) -> VfsResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut ancestor = fragment.parent.clone();
        while let Some(node) = ancestor {
            let folder = node.folder_meta().ok_or_else(|| {
                VfsError::Internal(format!("ancestor {} is not a folder", node.name()))
            })?;
            if !node.reference.is_tangible() {
                break;
            }
            self.seek(node.reference.data_position).await?;
            self.write_i64(folder.children_used_space + delta).await?;
            ancestor = node.parent.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::INTANGIBLE;
    use tempfile::TempDir;

    async fn create_controller() -> (TempDir, FileController) {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("backing.bin");
        let fc = FileController::create(&path).await.unwrap();
        (temp_dir, fc)
    }

    #[tokio::test]
    async fn test_reference_roundtrip() {
        let (_temp_dir, mut fc) = create_controller().await;
        fc.seek(0).await.unwrap();
        let written = fc.put_reference(NodeKind::Folder, 9).await.unwrap();
        assert_eq!(written.position, 0);

        fc.seek(0).await.unwrap();
        let read = fc.read_reference().await.unwrap();
        assert_eq!(read, written);
        assert_eq!(read.kind, NodeKind::Folder);
        assert_eq!(read.data_position, 9);
    }

    #[tokio::test]
    async fn test_bad_mark_is_corrupt_format() {
        let (_temp_dir, mut fc) = create_controller().await;
        fc.seek(0).await.unwrap();
        fc.file.write_all(b"X\x00\x00\x00\x00\x00\x00\x00\x09").await.unwrap();
        fc.seek(0).await.unwrap();
        let err = fc.read_reference().await.unwrap_err();
        assert!(matches!(err, VfsError::CorruptFormat(_)));
    }

    #[tokio::test]
    async fn test_file_fragment_roundtrip() {
        let (_temp_dir, mut fc) = create_controller().await;
        let reference = NodeReference {
            position: INTANGIBLE,
            data_position: 0,
            kind: NodeKind::File,
        };
        let written = fc
            .put_file_fragment(reference, "данные", b"hello", None)
            .await
            .unwrap();

        let read = fc.read_fragment(reference, None).await.unwrap();
        assert_eq!(read.name(), "данные");
        assert_eq!(read.file_meta().unwrap().file_size, 5);
        assert_eq!(read.meta_size_bytes, written.meta_size_bytes);
        assert_eq!(fc.read_file_content(&read).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_folder_fragment_roundtrip() {
        let (_temp_dir, mut fc) = create_controller().await;
        let children = vec![
            NodeReference::intangible(NodeKind::File, 100),
            NodeReference::intangible(NodeKind::Folder, 200),
        ];
        let reference = NodeReference {
            position: INTANGIBLE,
            data_position: 0,
            kind: NodeKind::Folder,
        };
        fc.put_folder_fragment(reference, "dir", 64, &children, None)
            .await
            .unwrap();

        let read = fc.read_fragment(reference, None).await.unwrap();
        let folder = read.folder_meta().unwrap();
        assert_eq!(read.name(), "dir");
        assert_eq!(folder.children_used_space, 64);
        assert_eq!(folder.children.len(), 2);
        assert_eq!(folder.children[0].kind, NodeKind::File);
        assert_eq!(folder.children[0].data_position, 100);
        // cells are laid out right behind the folder header
        assert_eq!(folder.children[0].position, 12);
        assert_eq!(folder.children[1].position, 21);
    }

    #[tokio::test]
    async fn test_truncated_content_is_short_read() {
        let (_temp_dir, mut fc) = create_controller().await;
        let reference = NodeReference {
            position: INTANGIBLE,
            data_position: 0,
            kind: NodeKind::File,
        };
        fc.put_file_fragment(reference, "f", b"abc", None)
            .await
            .unwrap();

        // claim more content than the file holds
        fc.seek(2 + 1).await.unwrap();
        fc.write_i64(1000).await.unwrap();
        fc.file.flush().await.unwrap();

        let fragment = fc.read_fragment(reference, None).await.unwrap();
        let err = fc.read_file_content(&fragment).await.unwrap_err();
        assert!(matches!(err, VfsError::ShortRead(_)));
    }

    #[tokio::test]
    async fn test_update_in_place_keeps_offset() {
        let (_temp_dir, mut fc) = create_controller().await;
        fc.seek(0).await.unwrap();
        let cell = fc.put_reference(NodeKind::File, 9).await.unwrap();
        let reference = NodeReference {
            position: cell.position,
            data_position: 9,
            kind: NodeKind::File,
        };
        fc.put_file_fragment(reference, "f", b"longer content", None)
            .await
            .unwrap();
        let size_before = fc.size().await.unwrap();

        let updated = fc
            .update_file_content(reference, b"tiny", None)
            .await
            .unwrap();

        assert_eq!(updated.reference.data_position, 9);
        assert_eq!(fc.size().await.unwrap(), size_before);
        let read = fc.read_fragment(updated.reference, None).await.unwrap();
        assert_eq!(fc.read_file_content(&read).await.unwrap(), b"tiny");
    }

    #[tokio::test]
    async fn test_update_growth_appends_and_redirects() {
        let (_temp_dir, mut fc) = create_controller().await;
        fc.seek(0).await.unwrap();
        fc.put_reference(NodeKind::File, 9).await.unwrap();
        let reference = NodeReference {
            position: 0,
            data_position: 9,
            kind: NodeKind::File,
        };
        fc.put_file_fragment(reference, "f", b"abc", None)
            .await
            .unwrap();
        let size_before = fc.size().await.unwrap();

        let updated = fc
            .update_file_content(reference, b"a much longer payload", None)
            .await
            .unwrap();

        assert_eq!(updated.reference.data_position, size_before);
        // the cell at offset 0 now points at the appended record
        let reread = fc.read_fragment_at(0, None).await.unwrap();
        assert_eq!(reread.reference.data_position, size_before);
        assert_eq!(
            fc.read_file_content(&reread).await.unwrap(),
            b"a much longer payload"
        );
    }

    #[tokio::test]
    async fn test_virtual_root_on_empty_file() {
        let (_temp_dir, mut fc) = create_controller().await;
        let root = fc.read_fragment_at(0, None).await.unwrap();
        assert!(root.is_folder());
        assert_eq!(root.total_size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_propagation_rewrites_ancestors() {
        let (_temp_dir, mut fc) = create_controller().await;
        // grandparent record at 0, parent record at 50
        let grandparent = Arc::new(
            fc.put_folder_fragment(
                NodeReference {
                    position: INTANGIBLE,
                    data_position: 0,
                    kind: NodeKind::Folder,
                },
                "g",
                100,
                &[NodeReference::intangible(NodeKind::Folder, 50)],
                None,
            )
            .await
            .unwrap(),
        );
        let parent = Arc::new(
            fc.put_folder_fragment(
                NodeReference {
                    position: INTANGIBLE,
                    data_position: 50,
                    kind: NodeKind::Folder,
                },
                "p",
                40,
                &[],
                Some(grandparent.clone()),
            )
            .await
            .unwrap(),
        );
        let leaf = NodeFragment {
            reference: NodeReference::intangible(NodeKind::File, 90),
            meta: NodeMeta::File(FileMeta {
                name: "leaf".to_string(),
                file_size: 4,
            }),
            parent: Some(parent),
            meta_size_bytes: file_record_len("leaf", 4) + REFERENCE_SIZE,
        };

        fc.propagate_used_space_change(&leaf, 7).await.unwrap();

        let grandparent_read = fc
            .read_fragment(grandparent.reference, None)
            .await
            .unwrap();
        assert_eq!(
            grandparent_read.folder_meta().unwrap().children_used_space,
            107
        );
        let parent_read = fc
            .read_fragment(
                NodeReference {
                    position: INTANGIBLE,
                    data_position: 50,
                    kind: NodeKind::Folder,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(parent_read.folder_meta().unwrap().children_used_space, 47);
    }
}
