mod controller;
mod defrag;
mod engine;
mod fragment;
mod fs;
mod rwlock;

pub use controller::FileController;
pub use engine::{PackFsConfig, StorageEngine};
pub use fragment::{
    FileMeta, FolderMeta, NodeFragment, NodeKind, NodeMeta, NodeReference, INTANGIBLE,
};
pub use fs::{PackFile, PackFolder, PackFs};
pub use rwlock::WritePriorityLock;
