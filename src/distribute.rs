//! Distributing a node stream over the leaves of a partition tree.
//!
//! Routing by coordinate is CPU-bound; serializing to many leaf files
//! blocks on I/O. The distributor overlaps the two through the write
//! pipeline: it resolves each node's leaf, enqueues the write, and lets the
//! pipeline workers do the disk work.

use std::io::Read;

use log::{info, warn};
use rustc_hash::FxHashMap;

use crate::datatree::{DataTree, DataTreeFiles};
use crate::error::Result;
use crate::io::{EntityReader, EntityWriter};
use crate::model::Entity;
use crate::pipeline::{DEFAULT_CAPACITY, SharedWriter, WritePipeline};

/// Counts of one distribution run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributionSummary {
    /// Nodes routed to a leaf and written.
    pub num_written: u64,
    /// Nodes outside the tree's root envelope.
    pub num_outside: u64,
}

/// Fans a node cursor out to per-leaf node files.
pub struct NodeTreeDistributor<'a> {
    tree: &'a DataTree,
    files: DataTreeFiles,
    capacity: usize,
    workers: usize,
}

impl<'a> NodeTreeDistributor<'a> {
    pub fn new(tree: &'a DataTree, files: DataTreeFiles) -> Self {
        Self {
            tree,
            files,
            capacity: DEFAULT_CAPACITY,
            workers: 1,
        }
    }

    pub fn with_pipeline(mut self, capacity: usize, workers: usize) -> Self {
        self.capacity = capacity;
        self.workers = workers;
        self
    }

    /// Stream `reader` to completion, routing every node to the leaf whose
    /// envelope contains its coordinate. A point on a shared leaf boundary
    /// goes to the first leaf in pre-order. Nodes outside the root envelope
    /// are logged and counted, not fatal.
    pub fn execute(&self, reader: &mut EntityReader<impl Read>) -> Result<DistributionSummary> {
        let mut pipeline = WritePipeline::new(self.capacity, self.workers);
        let mut writers: FxHashMap<u64, SharedWriter> = FxHashMap::default();
        let mut summary = DistributionSummary::default();

        let result = self.distribute(reader, &mut pipeline, &mut writers, &mut summary);

        // Drain the queue and surface worker failures even when production
        // itself failed; the first error wins.
        let closed = pipeline.close();
        result?;
        closed?;

        for writer in writers.values() {
            writer.finish()?;
        }

        info!(
            "distributed {} nodes, {} outside the tree",
            summary.num_written, summary.num_outside
        );
        Ok(summary)
    }

    fn distribute(
        &self,
        reader: &mut EntityReader<impl Read>,
        pipeline: &mut WritePipeline,
        writers: &mut FxHashMap<u64, SharedWriter>,
        summary: &mut DistributionSummary,
    ) -> Result<()> {
        while let Some(entity) = reader.next_entity()? {
            let node = match entity {
                Entity::Node(node) => node,
                other => {
                    warn!("skipping non-node entity in node stream: {}", other.id());
                    continue;
                }
            };

            let leafs = self.tree.query_point(node.lon, node.lat);
            let Some(leaf) = leafs.first().copied() else {
                warn!("node {} outside the tree envelope", node.id);
                summary.num_outside += 1;
                continue;
            };

            let writer = match writers.get(&leaf.path_code()) {
                Some(writer) => writer.clone(),
                None => {
                    let writer = pipeline.register(EntityWriter::create(self.files.path(leaf))?);
                    writers.insert(leaf.path_code(), writer.clone());
                    writer
                }
            };

            pipeline.write(&writer, Entity::Node(node))?;
            summary.num_written += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::read_dataset;
    use crate::model::Node;
    use crate::spatial::rect;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn node_stream(nodes: &[Node]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = EntityWriter::new(&mut buf);
        for node in nodes {
            writer.write_node(node).unwrap();
        }
        writer.finish().unwrap();
        drop(writer);
        buf
    }

    #[test]
    fn test_nodes_land_in_their_leaves() {
        let tmp = TempDir::new().unwrap();
        let tree = DataTree::create(tmp.path(), rect(0.0, 0.0, 16.0, 16.0), 1).unwrap();
        let files = DataTreeFiles::new(tmp.path(), "nodes.dat");

        let stream = node_stream(&[
            Node::new(1, 2.0, 2.0),
            Node::new(2, 12.0, 3.0),
            Node::new(3, 4.0, 9.0),
            Node::new(4, 99.0, 99.0),
        ]);

        let distributor = NodeTreeDistributor::new(&tree, files.clone());
        let summary = distributor
            .execute(&mut EntityReader::new(Cursor::new(stream.as_slice())))
            .unwrap();

        assert_eq!(summary.num_written, 3);
        assert_eq!(summary.num_outside, 1);

        let leafs = tree.leafs();
        let left = read_dataset(files.path(leafs[0])).unwrap();
        let right = read_dataset(files.path(leafs[1])).unwrap();
        let left_ids: Vec<i64> = left.nodes.keys().copied().collect();
        let right_ids: Vec<i64> = right.nodes.keys().copied().collect();
        assert_eq!(left_ids, vec![1, 3]);
        assert_eq!(right_ids, vec![2]);
    }

    #[test]
    fn test_boundary_node_goes_to_first_leaf() {
        let tmp = TempDir::new().unwrap();
        let tree = DataTree::create(tmp.path(), rect(0.0, 0.0, 16.0, 16.0), 1).unwrap();
        let files = DataTreeFiles::new(tmp.path(), "nodes.dat");

        let stream = node_stream(&[Node::new(5, 8.0, 4.0)]);
        NodeTreeDistributor::new(&tree, files.clone())
            .execute(&mut EntityReader::new(Cursor::new(stream.as_slice())))
            .unwrap();

        let leafs = tree.leafs();
        let left = read_dataset(files.path(leafs[0])).unwrap();
        assert_eq!(left.nodes.len(), 1);
        assert!(!files.path(leafs[1]).exists());
    }
}
