//! Offline compaction of the backing file.
//!
//! Mutations never reclaim space: grown records are appended and the old
//! bytes become garbage. Once the live share of the file drops below the
//! configured threshold, the whole reachable tree is replanned into a dense
//! layout, written to a `.defrag` sidecar and renamed over the original.
//! Runs under the write lock, so no reader can observe the swap.

use crate::controller::FileController;
use crate::engine::{sidecar_path, StorageEngine};
use crate::fragment::{NodeFragment, NodeKind, NodeMeta, NodeReference, REFERENCE_SIZE};
use log::info;
use std::collections::{BinaryHeap, HashMap};
use vfs_lib::{VfsError, VfsResult};

/// Heap entry ordered by ascending on-disk record offset.
struct Visit(NodeFragment);

impl PartialEq for Visit {
    fn eq(&self, other: &Self) -> bool {
        self.0.reference.data_position == other.0.reference.data_position
    }
}

impl Eq for Visit {}

impl PartialOrd for Visit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Visit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reversed: BinaryHeap is a max-heap, we pop lowest offsets first
        other
            .0
            .reference
            .data_position
            .cmp(&self.0.reference.data_position)
    }
}

struct DefragPlan {
    /// Old record offset to its packed offset.
    data_map: HashMap<i64, i64>,
    /// Visit order; every parent precedes each of its children.
    order: Vec<NodeFragment>,
    total_len: i64,
}

impl StorageEngine {
    /// Compact when the live share of the file has fallen below the
    /// configured utilization. Returns whether a compaction ran.
    pub(crate) async fn defragment_if_needed(
        &self,
        fc: &mut FileController,
    ) -> VfsResult<bool> {
        let root = fc.read_fragment_at(0, None).await?;
        let live = root.total_size_bytes();
        let storage = fc.size().await?;
        if storage as f64 * self.config.defrag_utilization <= live as f64 {
            return Ok(false);
        }

        let sidecar = sidecar_path(&self.path, "defrag");
        let mut out = FileController::create(&sidecar).await?;
        let plan = plan_layout(fc).await?;
        write_layout(fc, &mut out, &plan).await?;
        out.close().await?;
        tokio::fs::rename(&sidecar, &self.path).await?;

        info!(
            "StorageEngine: defragmented {}: {} -> {} bytes",
            self.path.display(),
            storage,
            plan.total_len
        );
        Ok(true)
    }
}

/// First pass: walk the live tree in ascending record-offset order and
/// assign every record its packed offset. The root reference keeps `[0, 9)`
/// and the root record lands at 9; each following record starts where the
/// previous one ends.
async fn plan_layout(fc: &mut FileController) -> VfsResult<DefragPlan> {
    let root = fc.read_fragment_at(0, None).await?;
    let mut heap = BinaryHeap::new();
    let mut data_map = HashMap::new();
    let mut order = Vec::new();
    let mut current_position = REFERENCE_SIZE;

    heap.push(Visit(root));
    while let Some(Visit(node)) = heap.pop() {
        data_map.insert(node.reference.data_position, current_position);
        current_position += node.meta_size_bytes - REFERENCE_SIZE;
        if let Some(folder) = node.folder_meta() {
            for reference in folder.children.clone() {
                let child = fc.read_fragment(reference, None).await?;
                heap.push(Visit(child));
            }
        }
        order.push(node);
    }

    Ok(DefragPlan {
        data_map,
        order,
        total_len: current_position,
    })
}

/// Second pass: write the packed file. File content is copied over; child
/// reference cells are rewritten through the plan's offset map; folder names
/// and used-space counters carry over unchanged.
async fn write_layout(
    src: &mut FileController,
    dst: &mut FileController,
    plan: &DefragPlan,
) -> VfsResult<()> {
    dst.seek(0).await?;
    dst.put_reference(NodeKind::Folder, REFERENCE_SIZE).await?;

    for node in &plan.order {
        let new_data_position = mapped(&plan.data_map, node.reference.data_position)?;
        match &node.meta {
            NodeMeta::File(_) => {
                let content = src.read_file_content(node).await?;
                dst.put_file_fragment(
                    NodeReference::intangible(NodeKind::File, new_data_position),
                    node.name(),
                    &content,
                    None,
                )
                .await?;
            }
            NodeMeta::Folder(folder) => {
                let mut children = Vec::with_capacity(folder.children.len());
                for reference in &folder.children {
                    children.push(NodeReference::intangible(
                        reference.kind,
                        mapped(&plan.data_map, reference.data_position)?,
                    ));
                }
                dst.put_folder_fragment(
                    NodeReference::intangible(NodeKind::Folder, new_data_position),
                    node.name(),
                    folder.children_used_space,
                    &children,
                    None,
                )
                .await?;
            }
        }
    }
    Ok(())
}

fn mapped(data_map: &HashMap<i64, i64>, old_position: i64) -> VfsResult<i64> {
    data_map.get(&old_position).copied().ok_or_else(|| {
        VfsError::Internal(format!("defrag plan misses record at offset {}", old_position))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{navigate, PackFsConfig};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn create_engine(defrag_utilization: f64) -> (TempDir, Arc<StorageEngine>) {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("backing.pfs");
        let engine = StorageEngine::open_with_config(path, PackFsConfig { defrag_utilization })
            .await
            .unwrap();
        (temp_dir, engine)
    }

    async fn create_root_file(engine: &StorageEngine, name: &str, content: &[u8]) {
        let name = name.to_string();
        let content = content.to_vec();
        engine
            .with_write_lock(move |fc| {
                Box::pin(async move {
                    let root = navigate(fc, &[]).await?;
                    let data_position = fc.size().await?;
                    let child = fc
                        .put_file_fragment(
                            NodeReference::intangible(NodeKind::File, data_position),
                            &name,
                            &content,
                            Some(root.clone()),
                        )
                        .await?;
                    crate::engine::add_child(fc, root, &child).await?;
                    Ok(())
                })
            })
            .await
            .unwrap();
    }

    async fn rewrite_root_file(engine: &StorageEngine, name: &str, content: &[u8]) {
        let path = vec![name.to_string()];
        let content = content.to_vec();
        engine
            .with_write_lock(move |fc| {
                Box::pin(async move {
                    let fragment = navigate(fc, &path).await?;
                    let parent = fragment.parent.clone();
                    fc.update_file_content(fragment.reference, &content, parent)
                        .await?;
                    Ok(())
                })
            })
            .await
            .unwrap();
    }

    async fn read_root_file(engine: &StorageEngine, name: &str) -> Vec<u8> {
        let path = vec![name.to_string()];
        engine
            .with_read_lock(move |fc| {
                Box::pin(async move {
                    let fragment = navigate(fc, &path).await?;
                    fc.read_file_content(&fragment).await
                })
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_disabled_defrag_accumulates_garbage() {
        let (_temp_dir, engine) = create_engine(0.0).await;
        create_root_file(&engine, "f", b"start").await;
        let size_before = std::fs::metadata(engine.path()).unwrap().len();
        for round in 0..8 {
            rewrite_root_file(&engine, "f", &vec![round as u8; 64]).await;
        }
        let size_after = std::fs::metadata(engine.path()).unwrap().len();
        assert!(size_after > size_before);
        assert_eq!(read_root_file(&engine, "f").await, vec![7u8; 64]);
    }

    async fn live_bytes(engine: &StorageEngine) -> i64 {
        engine
            .with_read_lock(|fc| {
                Box::pin(async move {
                    let root = fc.read_fragment_at(0, None).await?;
                    Ok(root.total_size_bytes())
                })
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_plan_packs_exactly_the_live_bytes() {
        let (_temp_dir, engine) = create_engine(0.0).await;
        create_root_file(&engine, "a", b"aaaa").await;
        create_root_file(&engine, "b", b"bbbb").await;
        for round in 0..10 {
            rewrite_root_file(&engine, "a", &vec![round as u8; 128]).await;
        }

        let planned = engine
            .with_read_lock(|fc| {
                Box::pin(async move { Ok(plan_layout(fc).await?.total_len) })
            })
            .await
            .unwrap();
        assert_eq!(planned, live_bytes(&engine).await);
    }

    #[tokio::test]
    async fn test_threshold_keeps_utilization_bounded() {
        let (_temp_dir, engine) = create_engine(0.4).await;
        create_root_file(&engine, "a", b"seed").await;
        for round in 0..20 {
            rewrite_root_file(&engine, "a", &vec![round as u8; 50 + round]).await;
        }

        // after every write section: either the file was dense enough, or the
        // pass just ran and storage equals the live bytes
        let storage = std::fs::metadata(engine.path()).unwrap().len() as i64;
        let live = live_bytes(&engine).await;
        assert!(storage as f64 * 0.4 <= live as f64);
        assert_eq!(read_root_file(&engine, "a").await, vec![19u8; 69]);
    }

    #[tokio::test]
    async fn test_threshold_skips_dense_files() {
        let (_temp_dir, engine) = create_engine(0.4).await;
        create_root_file(&engine, "f", b"payload").await;
        engine
            .with_write_lock(|_fc| Box::pin(async move { Ok(()) }))
            .await
            .unwrap();
        // nothing was garbage yet, so the file keeps its exact layout
        let raw = std::fs::read(engine.path()).unwrap();
        assert_eq!(&raw[..9], &[b'F', 0, 0, 0, 0, 0, 0, 0, 9]);
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_tree() {
        let (_temp_dir, engine) = create_engine(1.0).await;
        create_root_file(&engine, "one", b"first").await;
        create_root_file(&engine, "two", b"second").await;
        rewrite_root_file(&engine, "one", b"first, but longer").await;

        // the eager threshold compacted after every write section
        let storage = std::fs::metadata(engine.path()).unwrap().len() as i64;
        let live = engine
            .with_read_lock(|fc| {
                Box::pin(async move {
                    let root = fc.read_fragment_at(0, None).await?;
                    Ok(root.total_size_bytes())
                })
            })
            .await
            .unwrap();
        assert_eq!(storage, live);

        assert_eq!(read_root_file(&engine, "one").await, b"first, but longer");
        assert_eq!(read_root_file(&engine, "two").await, b"second");

        let names = engine
            .with_read_lock(|fc| {
                Box::pin(async move {
                    let root = navigate(fc, &[]).await?;
                    let mut names = Vec::new();
                    for reference in root.folder_meta().unwrap().children.clone() {
                        let child = fc.read_fragment(reference, None).await?;
                        names.push(child.name().to_string());
                    }
                    Ok(names)
                })
            })
            .await
            .unwrap();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_unreachable_subtree_is_reclaimed() {
        let (_temp_dir, engine) = create_engine(1.0).await;
        create_root_file(&engine, "keep", b"kept bytes").await;
        create_root_file(&engine, "drop", b"dropped bytes").await;

        engine
            .with_write_lock(|fc| {
                Box::pin(async move {
                    let child = navigate(fc, &["drop".to_string()]).await?;
                    let parent = child.parent.clone().unwrap();
                    crate::engine::remove_child(fc, parent, &child).await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        // the eager pass ran right after the removal
        let storage = std::fs::metadata(engine.path()).unwrap().len() as i64;
        assert_eq!(storage, live_bytes(&engine).await);
        let raw = std::fs::read(engine.path()).unwrap();
        assert!(!raw.windows(7).any(|window| window == b"dropped"));
        assert_eq!(read_root_file(&engine, "keep").await, b"kept bytes");
    }
}
