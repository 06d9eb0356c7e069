//! On-disk record model.
//!
//! Two record kinds interleave in the backing file. A reference is a fixed
//! 9-byte cell: a one-byte mark (`C` file, `F` folder) followed by the
//! big-endian offset of the node's metadata record. File records are
//! `name_len:u16 | name | file_size:i64 | content`; folder records are
//! `children_used_space:i64 | children_count:i32 | refs | name_len:u16 | name`.
//! All integers big-endian; the root folder reference occupies `[0, 9)`.

use std::sync::Arc;

pub const FILE_MARK: u8 = b'C';
pub const FOLDER_MARK: u8 = b'F';

/// Encoded size of one reference cell.
pub const REFERENCE_SIZE: i64 = 9;
/// Folder records open with the used-space (8) and child-count (4) fields.
pub const FOLDER_HEADER_SIZE: i64 = 12;

/// In-memory marker for a reference that has not been persisted yet.
/// Never written to the file.
pub const INTANGIBLE: i64 = -239;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
}

impl NodeKind {
    pub fn from_mark(mark: u8) -> Option<NodeKind> {
        match mark {
            FILE_MARK => Some(NodeKind::File),
            FOLDER_MARK => Some(NodeKind::Folder),
            _ => None,
        }
    }

    pub fn mark(&self) -> u8 {
        match self {
            NodeKind::File => FILE_MARK,
            NodeKind::Folder => FOLDER_MARK,
        }
    }
}

/// A decoded reference cell. `position` is where the cell itself lives,
/// `data_position` is where the referenced metadata record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeReference {
    pub position: i64,
    pub data_position: i64,
    pub kind: NodeKind,
}

impl NodeReference {
    /// Reference for a record that is about to be written; the cell pointing
    /// at it does not exist yet.
    pub fn intangible(kind: NodeKind, data_position: i64) -> Self {
        Self {
            position: INTANGIBLE,
            data_position,
            kind,
        }
    }

    pub fn is_tangible(&self) -> bool {
        self.position != INTANGIBLE
    }
}

#[derive(Debug, Clone)]
pub struct FileMeta {
    pub name: String,
    pub file_size: i64,
}

#[derive(Debug, Clone)]
pub struct FolderMeta {
    pub name: String,
    /// Sum of `total_size_bytes` over the direct children.
    pub children_used_space: i64,
    pub children: Vec<NodeReference>,
}

#[derive(Debug, Clone)]
pub enum NodeMeta {
    File(FileMeta),
    Folder(FolderMeta),
}

/// Snapshot of one node taken under the current lock. Stale as soon as any
/// mutation lands; never kept across lock boundaries.
#[derive(Debug, Clone)]
pub struct NodeFragment {
    pub reference: NodeReference,
    pub meta: NodeMeta,
    pub parent: Option<Arc<NodeFragment>>,
    /// Length of this node's own record plus the 9 reference bytes.
    pub meta_size_bytes: i64,
}

impl NodeFragment {
    pub fn name(&self) -> &str {
        match &self.meta {
            NodeMeta::File(meta) => &meta.name,
            NodeMeta::Folder(meta) => &meta.name,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.meta, NodeMeta::File(_))
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.meta, NodeMeta::Folder(_))
    }

    pub fn file_meta(&self) -> Option<&FileMeta> {
        match &self.meta {
            NodeMeta::File(meta) => Some(meta),
            NodeMeta::Folder(_) => None,
        }
    }

    pub fn folder_meta(&self) -> Option<&FolderMeta> {
        match &self.meta {
            NodeMeta::Folder(meta) => Some(meta),
            NodeMeta::File(_) => None,
        }
    }

    /// Bytes this node contributes to the live region, descendants included.
    /// The child reference cells live inside this node's record and inside
    /// each child's `total_size_bytes`, so one copy is subtracted out.
    pub fn total_size_bytes(&self) -> i64 {
        match &self.meta {
            NodeMeta::File(_) => self.meta_size_bytes,
            NodeMeta::Folder(meta) => {
                self.meta_size_bytes + meta.children_used_space
                    - meta.children.len() as i64 * REFERENCE_SIZE
            }
        }
    }

    /// Stand-in root for a backing file that has not been initialized yet.
    pub fn virtual_root() -> Self {
        Self {
            reference: NodeReference {
                position: INTANGIBLE,
                data_position: INTANGIBLE,
                kind: NodeKind::Folder,
            },
            meta: NodeMeta::Folder(FolderMeta {
                name: String::new(),
                children_used_space: 0,
                children: Vec::new(),
            }),
            parent: None,
            meta_size_bytes: 0,
        }
    }
}

/// Record length of a file node, reference cell excluded.
pub fn file_record_len(name: &str, file_size: i64) -> i64 {
    2 + name.len() as i64 + 8 + file_size
}

/// Record length of a folder node, reference cell excluded.
pub fn folder_record_len(name: &str, children_count: usize) -> i64 {
    FOLDER_HEADER_SIZE + children_count as i64 * REFERENCE_SIZE + 2 + name.len() as i64
}
