//! Region extraction against a partitioned store.
//!
//! A query walks the partition tree, copies fully contained leaves by
//! reference, re-filters partially intersecting leaves, resolves relation
//! batches through their bbox index, and finally merges every intermediate
//! file into one sorted output.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use geo::Rect;
use log::{debug, info};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::datatree::{DataTree, DataTreeFiles};
use crate::error::{GeoshardError, Result};
use crate::idbbox::IdBboxEntry;
use crate::io::{EntityReader, EntityWriter, read_dataset};
use crate::leafquery::{LeafOutputs, LeafQuery, QueryResult};
use crate::merge::sorted_merge;
use crate::model::{DataSet, EntityType, Node, Relation, Way};
use crate::paths::{BatchFileNames, DATA_EXTENSION, ExtractionPaths, TreeFileNames};
use crate::relgraph::RelationGraph;
use crate::spatial::RegionPredicate;
use crate::splitter::RelationBatchKind;

/// Selects a subset of relations to extract. When a filter is in effect,
/// every relation transitively referenced by a selected relation is
/// included as well, so the output stays internally resolvable.
pub trait RelationFilter {
    fn take(&self, relation: &Relation) -> bool;
}

impl<F: Fn(&Relation) -> bool> RelationFilter for F {
    fn take(&self, relation: &Relation) -> bool {
        self(relation)
    }
}

/// Query flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct QueryOptions {
    /// Keep the intermediate per-leaf and per-batch files after the merge.
    #[serde(default)]
    pub keep_temporary_files: bool,

    /// Include relations by testing their bounding box against the region
    /// instead of requiring an already-accepted member.
    #[serde(default)]
    pub fast_relation_bbox_test: bool,
}

impl QueryOptions {
    pub fn with_keep_temporary_files(mut self, keep: bool) -> Self {
        self.keep_temporary_files = keep;
        self
    }

    pub fn with_fast_relation_bbox_test(mut self, fast: bool) -> Self {
        self.fast_relation_bbox_test = fast;
        self
    }
}

/// A region extraction query against an extraction database.
pub struct Query<'a, P: RegionPredicate> {
    region: Rect,
    test: &'a P,
    path_output: PathBuf,
    path_tmp: Option<PathBuf>,
    paths: ExtractionPaths,
    tree_names: TreeFileNames,
    batch_names: BatchFileNames,
    options: QueryOptions,
    relation_filter: Option<&'a dyn RelationFilter>,
}

impl<'a, P: RegionPredicate> Query<'a, P> {
    /// Create a query extracting the data inside `region` according to
    /// `test`, writing the merged result to `path_output`. Intermediate
    /// files go to `path_tmp`, or a fresh directory under the system
    /// temporary storage when `None`.
    pub fn new<O: AsRef<Path>>(
        region: Rect,
        test: &'a P,
        path_output: O,
        path_tmp: Option<PathBuf>,
        paths: ExtractionPaths,
        tree_names: TreeFileNames,
        batch_names: BatchFileNames,
        options: QueryOptions,
    ) -> Self {
        Self {
            region,
            test,
            path_output: path_output.as_ref().to_path_buf(),
            path_tmp,
            paths,
            tree_names,
            batch_names,
            options,
            relation_filter: None,
        }
    }

    /// Restrict the extraction to relations accepted by `filter`, plus
    /// everything they transitively reference.
    pub fn with_relation_filter(mut self, filter: &'a dyn RelationFilter) -> Self {
        self.relation_filter = Some(filter);
        self
    }

    /// Run the query. Returns the aggregate counts of accepted entities.
    pub fn execute(&self) -> Result<QueryResult> {
        let tmp = TmpDirs::create(self.path_tmp.clone())?;

        let tree = DataTree::open(self.paths.tree())?;
        let tree_dir = self.paths.tree();
        let files_nodes = DataTreeFiles::new(&tree_dir, self.tree_names.nodes());
        let files_ways = DataTreeFiles::new(&tree_dir, self.tree_names.ways());
        let files_simple = DataTreeFiles::new(&tree_dir, self.tree_names.simple_relations());
        let files_complex = DataTreeFiles::new(&tree_dir, self.tree_names.complex_relations());

        let mut merge_files = MergeFiles::default();
        let mut result = QueryResult::default();

        // Query the data tree.
        let mut tmp_index_tree = 0usize;
        for leaf in tree.query(&self.region) {
            if self.test.contains_rect(leaf.envelope()) {
                info!("leaf is completely contained: {}", leaf.name());
                merge_files.nodes.push(files_nodes.path(leaf));
                merge_files.ways.push(files_ways.path(leaf));
                merge_files.simple_relations.push(files_simple.path(leaf));
                merge_files.complex_relations.push(files_complex.path(leaf));
                continue;
            }

            info!("loading data from leaf: {}", leaf.name());
            tmp_index_tree += 1;
            let name = filename(tmp_index_tree);
            let outputs = LeafOutputs {
                nodes: tmp.tree_nodes.join(&name),
                ways: tmp.tree_ways.join(&name),
                simple_relations: tmp.tree_simple_relations.join(&name),
                complex_relations: tmp.tree_complex_relations.join(&name),
                additional_nodes: tmp.tree_additional_nodes.join(&name),
                additional_ways: tmp.tree_additional_ways.join(&name),
            };

            let leaf_query = LeafQuery::new(
                self.test,
                &files_nodes,
                &files_ways,
                &files_simple,
                &files_complex,
                self.options.fast_relation_bbox_test,
            );
            let leaf_result = leaf_query.execute(leaf, &outputs)?;
            info!(
                "found {} nodes, {} ways, {} simple relations, {} complex relations",
                leaf_result.num_nodes,
                leaf_result.num_ways,
                leaf_result.num_simple_relations,
                leaf_result.num_complex_relations
            );
            result.add(&leaf_result);

            merge_files.nodes.push(outputs.nodes);
            merge_files.nodes.push(outputs.additional_nodes);
            merge_files.ways.push(outputs.ways);
            merge_files.ways.push(outputs.additional_ways);
            merge_files.simple_relations.push(outputs.simple_relations);
            merge_files.complex_relations.push(outputs.complex_relations);
        }

        info!(
            "tree totals: {} nodes, {} ways, {} simple relations, {} complex relations",
            result.num_nodes, result.num_ways, result.num_simple_relations,
            result.num_complex_relations
        );

        // Query the relation batches through their bbox indexes.
        let batch_result = self.query_batches(&tmp, &mut merge_files)?;
        result.add(&batch_result);

        // Merge the intermediate files.
        let mut inputs = Vec::new();
        for path in merge_files.all() {
            inputs.push(EntityReader::open(path)?);
        }
        info!("merging {} files", inputs.len());
        let mut output = EntityWriter::create(&self.path_output)?;
        let written = sorted_merge(inputs, &mut output)?;
        info!("wrote {written} entities");

        tmp.cleanup(self.options.keep_temporary_files)?;

        Ok(result)
    }

    fn query_batches(&self, tmp: &TmpDirs, merge_files: &mut MergeFiles) -> Result<QueryResult> {
        let mut result = QueryResult::default();

        let entries_simple = read_bbox_entries(self.paths.simple_relations_bboxes())?;
        let entries_complex = read_bbox_entries(self.paths.complex_relations_bboxes())?;

        let mut tmp_index = 0usize;
        for (index, entry) in entries_simple.iter().enumerate() {
            result.num_simple_relations += self.query_batch(
                RelationBatchKind::Simple,
                index,
                entry,
                &self.paths.simple_relations(),
                tmp,
                merge_files,
                &mut tmp_index,
            )?;
        }

        let mut tmp_index = 0usize;
        for (index, entry) in entries_complex.iter().enumerate() {
            result.num_complex_relations += self.query_batch(
                RelationBatchKind::Complex,
                index,
                entry,
                &self.paths.complex_relations(),
                tmp,
                merge_files,
                &mut tmp_index,
            )?;
        }

        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn query_batch(
        &self,
        kind: RelationBatchKind,
        index: usize,
        entry: &IdBboxEntry,
        batches_dir: &Path,
        tmp: &TmpDirs,
        merge_files: &mut MergeFiles,
        tmp_index: &mut usize,
    ) -> Result<u64> {
        let kind_name = match kind {
            RelationBatchKind::Simple => "simple",
            RelationBatchKind::Complex => "complex",
        };
        let relation_files = match kind {
            RelationBatchKind::Simple => &mut merge_files.simple_relations,
            RelationBatchKind::Complex => &mut merge_files.complex_relations,
        };

        // Batch directories are numbered in flush order, matching the
        // order of the bbox index records.
        let batch_dir = batches_dir.join((index + 1).to_string());

        if self.test.contains_rect(&entry.bbox) {
            info!("{kind_name} batch completely contained: {}", entry.id);
            merge_files
                .nodes
                .push(batch_dir.join(self.batch_names.nodes()));
            merge_files
                .ways
                .push(batch_dir.join(self.batch_names.ways()));
            relation_files.push(batch_dir.join(self.batch_names.relations()));
            return Ok(0);
        }

        if !self.test.intersects_rect(&entry.bbox) {
            return Ok(0);
        }

        info!("loading data from {kind_name} batch: {}", entry.id);
        *tmp_index += 1;
        let name = filename(*tmp_index);

        let (tmp_nodes, tmp_ways, tmp_relations) = match kind {
            RelationBatchKind::Simple => (
                tmp.simple_nodes.join(&name),
                tmp.simple_ways.join(&name),
                tmp.simple_relations.join(&name),
            ),
            RelationBatchKind::Complex => (
                tmp.complex_nodes.join(&name),
                tmp.complex_ways.join(&name),
                tmp.complex_relations.join(&name),
            ),
        };

        let accepted = self.run_relations_query(
            kind,
            &batch_dir,
            &tmp_nodes,
            &tmp_ways,
            &tmp_relations,
        )?;
        if accepted == 0 {
            return Ok(0);
        }

        merge_files.nodes.push(tmp_nodes);
        merge_files.ways.push(tmp_ways);
        relation_files.push(tmp_relations);
        Ok(accepted)
    }

    /// Filter one batch: load its contents, evaluate the inclusion test per
    /// relation (per group for complex batches), and write the accepted
    /// relations plus the member nodes and ways they need.
    fn run_relations_query(
        &self,
        kind: RelationBatchKind,
        batch_dir: &Path,
        out_nodes: &Path,
        out_ways: &Path,
        out_relations: &Path,
    ) -> Result<u64> {
        debug!("loading batch data from {}", batch_dir.display());
        let data_relations = read_dataset(batch_dir.join(self.batch_names.relations()))?;

        let selected_ids = self.select_relations(&data_relations);
        if selected_ids.is_empty() {
            info!("nothing selected, skipping");
            return Ok(0);
        }

        let data_nodes = read_dataset(batch_dir.join(self.batch_names.nodes()))?;
        let data_ways = read_dataset(batch_dir.join(self.batch_names.ways()))?;

        let mut node_ids = FxHashSet::default();
        for node in data_nodes.nodes.values() {
            if self.test.contains_point(node.lon, node.lat) {
                node_ids.insert(node.id);
            }
        }
        let mut way_ids = FxHashSet::default();
        for way in data_ways.ways.values() {
            if way.node_refs.iter().any(|id| node_ids.contains(id)) {
                way_ids.insert(way.id);
            }
        }

        let selected = || {
            data_relations
                .relations
                .values()
                .filter(|r| selected_ids.contains(&r.id))
        };

        let accepted: BTreeSet<i64> = match kind {
            RelationBatchKind::Simple => selected()
                .filter(|relation| {
                    self.relation_accepted(relation, &node_ids, &way_ids, &data_nodes, &data_ways)
                })
                .map(|relation| relation.id)
                .collect(),
            RelationBatchKind::Complex => {
                // Whole groups are kept so relation references inside the
                // batch stay resolvable.
                let graph = RelationGraph::build(selected());
                let mut ids = BTreeSet::new();
                for group in graph.build_groups() {
                    let hit = group.relation_ids().iter().any(|id| {
                        data_relations.relations.get(id).is_some_and(|relation| {
                            self.relation_accepted(
                                relation, &node_ids, &way_ids, &data_nodes, &data_ways,
                            )
                        })
                    });
                    if hit {
                        ids.extend(
                            group
                                .relation_ids()
                                .iter()
                                .filter(|id| data_relations.relations.contains_key(id)),
                        );
                    }
                }
                ids
            }
        };

        if accepted.is_empty() {
            return Ok(0);
        }

        let mut writer = EntityWriter::create(out_relations)?;
        for &id in &accepted {
            writer.write_relation(&data_relations.relations[&id])?;
        }
        writer.finish()?;

        // Member closure: the nodes and ways the accepted relations need.
        let mut member_nodes: BTreeMap<i64, &Node> = BTreeMap::new();
        let mut member_ways: BTreeMap<i64, &Way> = BTreeMap::new();
        for &id in &accepted {
            collect_members(
                &data_relations.relations[&id],
                &data_nodes,
                &data_ways,
                &mut member_nodes,
                &mut member_ways,
            );
        }

        debug!("writing member nodes and ways");
        let mut writer = EntityWriter::create(out_nodes)?;
        for node in member_nodes.values() {
            writer.write_node(node)?;
        }
        writer.finish()?;

        let mut writer = EntityWriter::create(out_ways)?;
        for way in member_ways.values() {
            writer.write_way(way)?;
        }
        writer.finish()?;

        Ok(accepted.len() as u64)
    }

    /// Apply the relation filter: the matching relations plus everything
    /// they transitively reference within the batch.
    fn select_relations(&self, data: &DataSet) -> FxHashSet<i64> {
        let Some(filter) = self.relation_filter else {
            return data.relations.keys().copied().collect();
        };

        let mut selected = FxHashSet::default();
        let mut stack: Vec<i64> = data
            .relations
            .values()
            .filter(|r| filter.take(r))
            .map(|r| r.id)
            .collect();

        while let Some(id) = stack.pop() {
            if !selected.insert(id) {
                continue;
            }
            if let Some(relation) = data.relations.get(&id) {
                for member in &relation.members {
                    if member.mtype == EntityType::Relation && !selected.contains(&member.id) {
                        stack.push(member.id);
                    }
                }
            }
        }

        info!(
            "selected {} of {} relations",
            selected.len(),
            data.relations.len()
        );
        selected
    }

    fn relation_accepted(
        &self,
        relation: &Relation,
        node_ids: &FxHashSet<i64>,
        way_ids: &FxHashSet<i64>,
        data_nodes: &DataSet,
        data_ways: &DataSet,
    ) -> bool {
        if self.options.fast_relation_bbox_test
            && let Some(envelope) = batch_relation_envelope(relation, data_nodes, data_ways)
        {
            return self.test.intersects_rect(&envelope);
        }
        relation.members.iter().any(|member| match member.mtype {
            EntityType::Node => node_ids.contains(&member.id),
            EntityType::Way => way_ids.contains(&member.id),
            EntityType::Relation => false,
        })
    }
}

/// Merge input lists, one per output kind.
#[derive(Debug, Default)]
struct MergeFiles {
    nodes: Vec<PathBuf>,
    ways: Vec<PathBuf>,
    simple_relations: Vec<PathBuf>,
    complex_relations: Vec<PathBuf>,
}

impl MergeFiles {
    fn all(&self) -> impl Iterator<Item = &PathBuf> {
        self.nodes
            .iter()
            .chain(self.ways.iter())
            .chain(self.simple_relations.iter())
            .chain(self.complex_relations.iter())
    }
}

/// The temporary directory hierarchy of one query run.
#[derive(Debug)]
struct TmpDirs {
    root: PathBuf,
    tree_nodes: PathBuf,
    tree_ways: PathBuf,
    tree_simple_relations: PathBuf,
    tree_complex_relations: PathBuf,
    tree_additional_nodes: PathBuf,
    tree_additional_ways: PathBuf,
    simple_nodes: PathBuf,
    simple_ways: PathBuf,
    simple_relations: PathBuf,
    complex_nodes: PathBuf,
    complex_ways: PathBuf,
    complex_relations: PathBuf,
}

impl TmpDirs {
    fn create(path: Option<PathBuf>) -> Result<Self> {
        let root = match path {
            Some(path) => path,
            None => pick_system_tmp_dir()?,
        };

        fs::create_dir_all(&root)?;
        if !root.is_dir() {
            return Err(GeoshardError::NotADirectory(root));
        }
        if fs::read_dir(&root)?.next().is_some() {
            return Err(GeoshardError::DirectoryNotEmpty(root));
        }
        info!("storing intermediate files here: {}", root.display());

        let tree = root.join("tree");
        let simple = root.join("simple-relations");
        let complex = root.join("complex-relations");

        let dirs = Self {
            tree_nodes: tree.join("nodes"),
            tree_ways: tree.join("ways"),
            tree_simple_relations: tree.join("relations.simple"),
            tree_complex_relations: tree.join("relations.complex"),
            tree_additional_nodes: tree.join("nodes-extra"),
            tree_additional_ways: tree.join("ways-extra"),
            simple_nodes: simple.join("nodes"),
            simple_ways: simple.join("ways"),
            simple_relations: simple.join("relations"),
            complex_nodes: complex.join("nodes"),
            complex_ways: complex.join("ways"),
            complex_relations: complex.join("relations"),
            root,
        };

        for dir in [
            &dirs.tree_nodes,
            &dirs.tree_ways,
            &dirs.tree_simple_relations,
            &dirs.tree_complex_relations,
            &dirs.tree_additional_nodes,
            &dirs.tree_additional_ways,
            &dirs.simple_nodes,
            &dirs.simple_ways,
            &dirs.simple_relations,
            &dirs.complex_nodes,
            &dirs.complex_ways,
            &dirs.complex_relations,
        ] {
            fs::create_dir_all(dir)?;
        }

        Ok(dirs)
    }

    fn cleanup(&self, keep: bool) -> Result<()> {
        if keep {
            info!("keeping intermediate files: {}", self.root.display());
            return Ok(());
        }
        fs::remove_dir_all(&self.root)?;
        Ok(())
    }
}

fn pick_system_tmp_dir() -> Result<PathBuf> {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    for attempt in 0..1000u32 {
        let candidate = base.join(format!("geoshard-extract-{pid}-{attempt}"));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(GeoshardError::InvalidConfig(
        "unable to create a temporary directory".to_string(),
    ))
}

fn filename(index: usize) -> String {
    format!("{index}{DATA_EXTENSION}")
}

/// Bbox index entries for one batch kind. A database without batches of
/// this kind has no index file, which reads as an empty list.
fn read_bbox_entries(path: PathBuf) -> Result<Vec<IdBboxEntry>> {
    if !path.exists() {
        debug!("no bbox index at {}", path.display());
        return Ok(Vec::new());
    }
    crate::idbbox::read_entries(path)
}

/// Envelope of a relation's resolvable members inside a batch.
fn batch_relation_envelope(
    relation: &Relation,
    data_nodes: &DataSet,
    data_ways: &DataSet,
) -> Option<Rect> {
    let mut nodes: Vec<&Node> = Vec::new();
    for member in &relation.members {
        match member.mtype {
            EntityType::Node => {
                if let Some(node) = data_nodes.nodes.get(&member.id) {
                    nodes.push(node);
                }
            }
            EntityType::Way => {
                if let Some(way) = data_ways.ways.get(&member.id) {
                    for id in &way.node_refs {
                        if let Some(node) = data_nodes.nodes.get(id) {
                            nodes.push(node);
                        }
                    }
                }
            }
            EntityType::Relation => {}
        }
    }
    crate::spatial::nodes_envelope(nodes)
}

/// Resolve the member nodes and ways of one accepted relation, including
/// the nodes of member ways. Missing references are logged and skipped.
fn collect_members<'d>(
    relation: &Relation,
    data_nodes: &'d DataSet,
    data_ways: &'d DataSet,
    member_nodes: &mut BTreeMap<i64, &'d Node>,
    member_ways: &mut BTreeMap<i64, &'d Way>,
) {
    use log::warn;

    for member in &relation.members {
        match member.mtype {
            EntityType::Node => match data_nodes.nodes.get(&member.id) {
                Some(node) => {
                    member_nodes.insert(member.id, node);
                }
                None => warn!(
                    "relation {} references missing node {}",
                    relation.id, member.id
                ),
            },
            EntityType::Way => match data_ways.ways.get(&member.id) {
                Some(way) => {
                    member_ways.insert(member.id, way);
                    for id in &way.node_refs {
                        match data_nodes.nodes.get(id) {
                            Some(node) => {
                                member_nodes.insert(*id, node);
                            }
                            None => warn!("way {} references missing node {id}", way.id),
                        }
                    }
                }
                None => warn!(
                    "relation {} references missing way {}",
                    relation.id, member.id
                ),
            },
            // Referenced relations travel in the same batch; their own
            // members are collected when they are visited.
            EntityType::Relation => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Member;
    use crate::spatial::{RectRegion, rect};

    fn relation(id: i64, members: Vec<Member>) -> Relation {
        Relation::new(id, members)
    }

    #[test]
    fn test_select_relations_without_filter() {
        let mut data = DataSet::new();
        data.insert(crate::model::Entity::Relation(relation(1, vec![])));
        data.insert(crate::model::Entity::Relation(relation(2, vec![])));

        let region = RectRegion::new(rect(0.0, 0.0, 1.0, 1.0));
        let query = Query::new(
            rect(0.0, 0.0, 1.0, 1.0),
            &region,
            "out.dat",
            None,
            ExtractionPaths::new("db"),
            TreeFileNames::default(),
            BatchFileNames::default(),
            QueryOptions::default(),
        );
        assert_eq!(query.select_relations(&data).len(), 2);
    }

    #[test]
    fn test_select_relations_pulls_references() {
        let mut data = DataSet::new();
        data.insert(crate::model::Entity::Relation(relation(
            1,
            vec![Member::new(EntityType::Relation, 2, "")],
        )));
        data.insert(crate::model::Entity::Relation(relation(2, vec![])));
        data.insert(crate::model::Entity::Relation(relation(3, vec![])));

        let region = RectRegion::new(rect(0.0, 0.0, 1.0, 1.0));
        let filter = |r: &Relation| r.id == 1;
        let query = Query::new(
            rect(0.0, 0.0, 1.0, 1.0),
            &region,
            "out.dat",
            None,
            ExtractionPaths::new("db"),
            TreeFileNames::default(),
            BatchFileNames::default(),
            QueryOptions::default(),
        )
        .with_relation_filter(&filter);

        let selected = query.select_relations(&data);
        assert!(selected.contains(&1));
        assert!(selected.contains(&2));
        assert!(!selected.contains(&3));
    }

    #[test]
    fn test_tmp_dirs_reject_non_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("stale"), b"x").unwrap();
        match TmpDirs::create(Some(tmp.path().to_path_buf())) {
            Err(GeoshardError::DirectoryNotEmpty(_)) => {}
            other => panic!("expected DirectoryNotEmpty, got {other:?}"),
        }
    }

    #[test]
    fn test_query_options_round_trip() {
        let options = QueryOptions::default()
            .with_keep_temporary_files(true)
            .with_fast_relation_bbox_test(true);
        let json = serde_json::to_string(&options).unwrap();
        let parsed: QueryOptions = serde_json::from_str(&json).unwrap();
        assert!(parsed.keep_temporary_files);
        assert!(parsed.fast_relation_bbox_test);

        let defaulted: QueryOptions = serde_json::from_str("{}").unwrap();
        assert!(!defaulted.keep_temporary_files);
    }
}
