//! Splitting relations into size-bounded batches on disk.
//!
//! Relations that cannot be routed to a single tree leaf are packed into
//! numbered batch directories, each holding the relations plus the member
//! ways and nodes they need, and indexed by an `(id, bbox, size)` record so
//! queries can test a whole batch before opening it.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::batch::{DEFAULT_MAX_MEMBERS, GroupBatch};
use crate::error::{GeoshardError, Result};
use crate::idbbox::{IdBboxEntry, IdBboxWriter};
use crate::io::EntityWriter;
use crate::model::{DataSet, Entity, EntityProvider, EntityType};
use crate::paths::BatchFileNames;
use crate::relgraph::{Group, RelationGraph, group_size};
use crate::spatial::nodes_envelope;

/// How batch contents are grouped.
///
/// Complex relations are grouped by their reference graph; simple relations
/// have no relation members, so every relation is a singleton group. Both
/// kinds share the packing, output and bbox-index machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationBatchKind {
    Simple,
    Complex,
}

/// Splitter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitterConfig {
    /// Ceiling on the summed member count of one batch.
    #[serde(default = "SplitterConfig::default_max_members")]
    pub max_members: usize,
}

impl SplitterConfig {
    const fn default_max_members() -> usize {
        DEFAULT_MAX_MEMBERS
    }

    pub fn with_max_members(mut self, max_members: usize) -> Self {
        self.max_members = max_members;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_members == 0 {
            return Err(GeoshardError::InvalidConfig(
                "max_members must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            max_members: Self::default_max_members(),
        }
    }
}

/// Aggregate counts of one splitting pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitSummary {
    pub num_groups: usize,
    pub num_batches: usize,
    pub num_relations: u64,
}

/// Packs relation groups into batch directories under an output directory
/// and writes the bbox index beside them.
pub struct RelationSplitter {
    kind: RelationBatchKind,
    output_dir: PathBuf,
    bbox_path: PathBuf,
    file_names: BatchFileNames,
    config: SplitterConfig,
}

impl RelationSplitter {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        kind: RelationBatchKind,
        output_dir: P,
        bbox_path: Q,
        file_names: BatchFileNames,
        config: SplitterConfig,
    ) -> Self {
        Self {
            kind,
            output_dir: output_dir.as_ref().to_path_buf(),
            bbox_path: bbox_path.as_ref().to_path_buf(),
            file_names,
            config,
        }
    }

    /// Run the full pass: group, size, sort, pack, flush batches and write
    /// the bbox index. `relations` is the complete input stream loaded in
    /// memory; `members` resolves the node and way payloads the batches
    /// collect.
    pub fn execute(
        &self,
        relations: &DataSet,
        members: &impl EntityProvider,
    ) -> Result<SplitSummary> {
        self.config.validate()?;
        self.prepare_output_dir()?;

        let mut groups = self.build_groups(relations);
        info!("number of groups: {}", groups.len());

        for group in &mut groups {
            let size = group_size(group, relations);
            group.set_num_members(size);
        }

        // Largest first reduces fragmentation versus arrival order.
        groups.sort_by(|a, b| {
            b.num_members()
                .cmp(&a.num_members())
                .then(a.start().cmp(&b.start()))
        });

        let num_groups = groups.len();
        let mut bbox_writer = IdBboxWriter::create(&self.bbox_path)?;
        let mut summary = SplitSummary {
            num_groups,
            ..Default::default()
        };

        let mut batch = GroupBatch::new(self.config.max_members);
        while !groups.is_empty() {
            let mut flushed = false;
            let mut i = 0;
            while i < groups.len() {
                if batch.fits(&groups[i]) {
                    batch.add(groups.remove(i));
                    if batch.is_full() {
                        self.flush(&mut batch, relations, members, &mut bbox_writer, &mut summary)?;
                        flushed = true;
                        break;
                    }
                } else {
                    i += 1;
                }
            }
            if !flushed && !batch.is_empty() {
                self.flush(&mut batch, relations, members, &mut bbox_writer, &mut summary)?;
            }
        }

        bbox_writer.finish()?;
        info!(
            "wrote {} relations into {} batches",
            summary.num_relations, summary.num_batches
        );
        Ok(summary)
    }

    fn build_groups(&self, relations: &DataSet) -> Vec<Group> {
        match self.kind {
            RelationBatchKind::Complex => {
                let graph = RelationGraph::build(relations.relations.values());
                info!(
                    "relations without relation members: {}",
                    graph.num_no_children()
                );
                info!(
                    "relations with relation members: {}",
                    graph.ids_has_child_relations().len()
                );
                info!(
                    "child relations: {}",
                    graph.ids_is_child_relation().len()
                );
                graph.build_groups()
            }
            RelationBatchKind::Simple => relations
                .relations
                .keys()
                .map(|&id| {
                    let mut ids = FxHashSet::default();
                    ids.insert(id);
                    Group::new(id, ids)
                })
                .collect(),
        }
    }

    fn prepare_output_dir(&self) -> Result<()> {
        if !self.output_dir.exists() {
            debug!("creating output directory: {}", self.output_dir.display());
            fs::create_dir_all(&self.output_dir)?;
        }
        if !self.output_dir.is_dir() {
            return Err(GeoshardError::NotADirectory(self.output_dir.clone()));
        }
        if fs::read_dir(&self.output_dir)?.next().is_some() {
            return Err(GeoshardError::DirectoryNotEmpty(self.output_dir.clone()));
        }
        Ok(())
    }

    fn flush(
        &self,
        batch: &mut GroupBatch,
        relations: &DataSet,
        members: &impl EntityProvider,
        bbox_writer: &mut IdBboxWriter,
        summary: &mut SplitSummary,
    ) -> Result<()> {
        debug!(
            "flushing batch: groups: {}, members: {}",
            batch.elements().len(),
            batch.size()
        );
        let groups = batch.take();

        let mut relation_ids = FxHashSet::default();
        for group in &groups {
            relation_ids.extend(group.relation_ids().iter().copied());
        }

        let mut batch_data = DataSet::new();
        for &id in &relation_ids {
            match relations.relation(id) {
                Some(relation) => batch_data.insert(Entity::Relation(relation.clone())),
                None => warn!("relation not found: {id}"),
            }
        }
        if batch_data.relations.is_empty() {
            return Ok(());
        }

        self.collect_members(&mut batch_data, members);

        summary.num_batches += 1;
        summary.num_relations += batch_data.relations.len() as u64;

        let subdir = self.output_dir.join(summary.num_batches.to_string());
        fs::create_dir(&subdir)?;

        let mut relations_out = EntityWriter::create(subdir.join(self.file_names.relations()))?;
        for relation in batch_data.relations.values() {
            relations_out.write_relation(relation)?;
        }
        relations_out.finish()?;

        let mut ways_out = EntityWriter::create(subdir.join(self.file_names.ways()))?;
        for way in batch_data.ways.values() {
            ways_out.write_way(way)?;
        }
        ways_out.finish()?;

        let mut nodes_out = EntityWriter::create(subdir.join(self.file_names.nodes()))?;
        for node in batch_data.nodes.values() {
            nodes_out.write_node(node)?;
        }
        nodes_out.finish()?;

        let lowest_id = batch_data
            .relations
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| unreachable!("non-empty relation map"));

        match nodes_envelope(batch_data.nodes.values()) {
            Some(envelope) => {
                let size = batch_data.nodes.len() as u64;
                bbox_writer.write(&IdBboxEntry::new(lowest_id, envelope, size))?;
            }
            None => warn!("batch {lowest_id} has no resolvable nodes, no bbox entry written"),
        }

        Ok(())
    }

    /// Resolve the transitive member closure of the batch relations into
    /// the batch dataset: member ways, member nodes, and the nodes of the
    /// member ways. Missing references are logged and skipped.
    fn collect_members(&self, batch_data: &mut DataSet, members: &impl EntityProvider) {
        let mut way_ids = FxHashSet::default();
        let mut node_ids = FxHashSet::default();

        for relation in batch_data.relations.values() {
            for member in &relation.members {
                match member.mtype {
                    EntityType::Node => {
                        node_ids.insert(member.id);
                    }
                    EntityType::Way => {
                        way_ids.insert(member.id);
                    }
                    // Member relations belong to the same batch by
                    // construction; their own members are covered by this
                    // same loop.
                    EntityType::Relation => {}
                }
            }
        }

        for &id in &way_ids {
            match members.way(id) {
                Some(way) => {
                    node_ids.extend(way.node_refs.iter().copied());
                    batch_data.ways.insert(way.id, way.clone());
                }
                None => warn!("way not found: {id}"),
            }
        }

        for &id in &node_ids {
            match members.node(id) {
                Some(node) => {
                    batch_data.nodes.insert(node.id, node.clone());
                }
                None => warn!("node not found: {id}"),
            }
        }
    }
}
