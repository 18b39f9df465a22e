//! Filtered extraction of a single tree leaf.
//!
//! A leaf that only partially intersects the query region is loaded into
//! memory and re-filtered entity by entity. Six outputs are produced:
//! accepted nodes, ways, simple relations and complex relations, plus the
//! additional nodes and ways pulled in by referential closure so accepted
//! compound entities stay structurally complete.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use log::warn;
use rustc_hash::FxHashSet;

use crate::datatree::{DataTreeFiles, TreeNode};
use crate::error::Result;
use crate::io::{EntityWriter, read_dataset};
use crate::model::{DataSet, EntityType, Node, Relation, Way};
use crate::relgraph::RelationGraph;
use crate::spatial::{RegionPredicate, nodes_envelope};

/// Exact counts of accepted entities, threaded through and summed by the
/// query orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub num_nodes: u64,
    pub num_ways: u64,
    pub num_simple_relations: u64,
    pub num_complex_relations: u64,
}

impl QueryResult {
    pub fn add(&mut self, other: &QueryResult) {
        self.num_nodes += other.num_nodes;
        self.num_ways += other.num_ways;
        self.num_simple_relations += other.num_simple_relations;
        self.num_complex_relations += other.num_complex_relations;
    }

    pub fn total(&self) -> u64 {
        self.num_nodes + self.num_ways + self.num_simple_relations + self.num_complex_relations
    }
}

/// Destination paths for the six outputs of one leaf query.
#[derive(Debug, Clone)]
pub struct LeafOutputs {
    pub nodes: PathBuf,
    pub ways: PathBuf,
    pub simple_relations: PathBuf,
    pub complex_relations: PathBuf,
    pub additional_nodes: PathBuf,
    pub additional_ways: PathBuf,
}

/// Re-filters one partially intersecting leaf against an inclusion
/// predicate.
pub struct LeafQuery<'a, P: RegionPredicate> {
    test: &'a P,
    files_nodes: &'a DataTreeFiles,
    files_ways: &'a DataTreeFiles,
    files_simple_relations: &'a DataTreeFiles,
    files_complex_relations: &'a DataTreeFiles,
    fast_relation_tests: bool,
}

impl<'a, P: RegionPredicate> LeafQuery<'a, P> {
    pub fn new(
        test: &'a P,
        files_nodes: &'a DataTreeFiles,
        files_ways: &'a DataTreeFiles,
        files_simple_relations: &'a DataTreeFiles,
        files_complex_relations: &'a DataTreeFiles,
        fast_relation_tests: bool,
    ) -> Self {
        Self {
            test,
            files_nodes,
            files_ways,
            files_simple_relations,
            files_complex_relations,
            fast_relation_tests,
        }
    }

    /// Run the query against `leaf`, writing the six outputs. A missing or
    /// unreadable leaf file is fatal for the query.
    pub fn execute(&self, leaf: &TreeNode, outputs: &LeafOutputs) -> Result<QueryResult> {
        let data_nodes = read_dataset(self.files_nodes.path(leaf))?;
        let data_ways = read_dataset(self.files_ways.path(leaf))?;
        let data_simple = read_dataset(self.files_simple_relations.path(leaf))?;
        let data_complex = read_dataset(self.files_complex_relations.path(leaf))?;

        let mut node_ids = FxHashSet::default();
        let mut way_ids = FxHashSet::default();

        // Node pass: the predicate's point test decides.
        let mut out_nodes = EntityWriter::create(&outputs.nodes)?;
        for node in data_nodes.nodes.values() {
            if self.test.contains_point(node.lon, node.lat) {
                node_ids.insert(node.id);
                out_nodes.write_node(node)?;
            }
        }
        out_nodes.finish()?;

        // Way pass: a way is kept when any of its nodes was accepted. This
        // is a coarse geometric approximation, not exact clipping.
        let mut out_ways = EntityWriter::create(&outputs.ways)?;
        for way in data_ways.ways.values() {
            if way.node_refs.iter().any(|id| node_ids.contains(id)) {
                way_ids.insert(way.id);
                out_ways.write_way(way)?;
            }
        }
        out_ways.finish()?;

        // Simple relations: any accepted node or way member.
        let mut accepted_simple = BTreeSet::new();
        for relation in data_simple.relations.values() {
            if self.relation_accepted(relation, &node_ids, &way_ids, &data_nodes, &data_ways) {
                accepted_simple.insert(relation.id);
            }
        }
        let mut out_simple = EntityWriter::create(&outputs.simple_relations)?;
        for &id in &accepted_simple {
            out_simple.write_relation(&data_simple.relations[&id])?;
        }
        out_simple.finish()?;

        // Complex relations: groups of the leaf's reference graph are kept
        // or dropped as a whole, so relation-to-relation references stay
        // resolvable within the output.
        let graph = RelationGraph::build(data_complex.relations.values());
        let mut accepted_complex = BTreeSet::new();
        for group in graph.build_groups() {
            let hit = group.relation_ids().iter().any(|id| {
                data_complex.relations.get(id).is_some_and(|relation| {
                    self.relation_accepted(relation, &node_ids, &way_ids, &data_nodes, &data_ways)
                })
            });
            if hit {
                accepted_complex.extend(
                    group
                        .relation_ids()
                        .iter()
                        .filter(|id| data_complex.relations.contains_key(id)),
                );
            }
        }
        let mut out_complex = EntityWriter::create(&outputs.complex_relations)?;
        for &id in &accepted_complex {
            out_complex.write_relation(&data_complex.relations[&id])?;
        }
        out_complex.finish()?;

        // Referential closure: accepted ways and relations may reference
        // entities that were not themselves accepted.
        let mut additional_nodes: BTreeMap<i64, &Node> = BTreeMap::new();
        let mut additional_ways: BTreeMap<i64, &Way> = BTreeMap::new();

        for &id in accepted_simple.iter().chain(accepted_complex.iter()) {
            let relation = data_simple
                .relations
                .get(&id)
                .or_else(|| data_complex.relations.get(&id))
                .unwrap_or_else(|| unreachable!("accepted relation was loaded"));
            self.collect_relation_closure(
                relation,
                &node_ids,
                &way_ids,
                &data_nodes,
                &data_ways,
                &mut additional_nodes,
                &mut additional_ways,
            );
        }

        for way in data_ways
            .ways
            .values()
            .filter(|w| way_ids.contains(&w.id))
            .chain(additional_ways.values().copied())
        {
            for id in &way.node_refs {
                if node_ids.contains(id) || additional_nodes.contains_key(id) {
                    continue;
                }
                match data_nodes.nodes.get(id) {
                    Some(node) => {
                        additional_nodes.insert(*id, node);
                    }
                    None => warn!("way {} references missing node {id}", way.id),
                }
            }
        }

        let mut out_additional_nodes = EntityWriter::create(&outputs.additional_nodes)?;
        for node in additional_nodes.values() {
            out_additional_nodes.write_node(node)?;
        }
        out_additional_nodes.finish()?;

        let mut out_additional_ways = EntityWriter::create(&outputs.additional_ways)?;
        for way in additional_ways.values() {
            out_additional_ways.write_way(way)?;
        }
        out_additional_ways.finish()?;

        Ok(QueryResult {
            num_nodes: node_ids.len() as u64,
            num_ways: way_ids.len() as u64,
            num_simple_relations: accepted_simple.len() as u64,
            num_complex_relations: accepted_complex.len() as u64,
        })
    }

    fn relation_accepted(
        &self,
        relation: &Relation,
        node_ids: &FxHashSet<i64>,
        way_ids: &FxHashSet<i64>,
        data_nodes: &DataSet,
        data_ways: &DataSet,
    ) -> bool {
        if self.fast_relation_tests
            && let Some(envelope) = relation_envelope(relation, data_nodes, data_ways)
        {
            return self.test.intersects_rect(&envelope);
        }
        relation.members.iter().any(|member| match member.mtype {
            EntityType::Node => node_ids.contains(&member.id),
            EntityType::Way => way_ids.contains(&member.id),
            EntityType::Relation => false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_relation_closure<'d>(
        &self,
        relation: &Relation,
        node_ids: &FxHashSet<i64>,
        way_ids: &FxHashSet<i64>,
        data_nodes: &'d DataSet,
        data_ways: &'d DataSet,
        additional_nodes: &mut BTreeMap<i64, &'d Node>,
        additional_ways: &mut BTreeMap<i64, &'d Way>,
    ) {
        for member in &relation.members {
            match member.mtype {
                EntityType::Node => {
                    if node_ids.contains(&member.id) || additional_nodes.contains_key(&member.id) {
                        continue;
                    }
                    match data_nodes.nodes.get(&member.id) {
                        Some(node) => {
                            additional_nodes.insert(member.id, node);
                        }
                        None => warn!(
                            "relation {} references missing node {}",
                            relation.id, member.id
                        ),
                    }
                }
                EntityType::Way => {
                    if way_ids.contains(&member.id) || additional_ways.contains_key(&member.id) {
                        continue;
                    }
                    match data_ways.ways.get(&member.id) {
                        Some(way) => {
                            additional_ways.insert(member.id, way);
                        }
                        None => warn!(
                            "relation {} references missing way {}",
                            relation.id, member.id
                        ),
                    }
                }
                // Handled by group closure; a reference leaving the leaf is
                // the batch mechanism's job.
                EntityType::Relation => {}
            }
        }
    }
}

/// Envelope of a relation's resolvable member geometry inside one leaf.
fn relation_envelope(
    relation: &Relation,
    data_nodes: &DataSet,
    data_ways: &DataSet,
) -> Option<geo::Rect> {
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
    nodes_envelope(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatree::DataTree;
    use crate::io::write_dataset_sorted;
    use crate::model::{Entity, Member};
    use crate::spatial::{RectRegion, rect};
    use tempfile::TempDir;

    struct Fixture {
        _tree_dir: TempDir,
        out_dir: TempDir,
        tree: DataTree,
        files: [DataTreeFiles; 4],
    }

    fn outputs(dir: &TempDir) -> LeafOutputs {
        LeafOutputs {
            nodes: dir.path().join("nodes.dat"),
            ways: dir.path().join("ways.dat"),
            simple_relations: dir.path().join("relations.simple.dat"),
            complex_relations: dir.path().join("relations.complex.dat"),
            additional_nodes: dir.path().join("nodes-extra.dat"),
            additional_ways: dir.path().join("ways-extra.dat"),
        }
    }

    /// One leaf tree over [0,16]x[0,16] with a small dataset: nodes 1..=4
    /// on a west-east line, way 1 over nodes 1-2, way 2 over nodes 3-4,
    /// way 3 bridging 2-3, a simple relation on way 1 and a complex pair
    /// where relation 11 references relation 10 (on way 2).
    fn fixture() -> Fixture {
        let tree_dir = TempDir::new().unwrap();
        let tree = DataTree::create(tree_dir.path(), rect(0.0, 0.0, 16.0, 16.0), 0).unwrap();

        let mut nodes = DataSet::new();
        nodes.insert(Entity::Node(Node::new(1, 1.0, 8.0)));
        nodes.insert(Entity::Node(Node::new(2, 5.0, 8.0)));
        nodes.insert(Entity::Node(Node::new(3, 11.0, 8.0)));
        nodes.insert(Entity::Node(Node::new(4, 15.0, 8.0)));

        let mut ways = DataSet::new();
        ways.insert(Entity::Way(Way::new(1, vec![1, 2])));
        ways.insert(Entity::Way(Way::new(2, vec![3, 4])));
        ways.insert(Entity::Way(Way::new(3, vec![2, 3])));

        let mut simple = DataSet::new();
        simple.insert(Entity::Relation(Relation::new(
            20,
            vec![Member::new(EntityType::Way, 1, "outer")],
        )));

        let mut complex = DataSet::new();
        complex.insert(Entity::Relation(Relation::new(
            10,
            vec![Member::new(EntityType::Way, 2, "outer")],
        )));
        complex.insert(Entity::Relation(Relation::new(
            11,
            vec![Member::new(EntityType::Relation, 10, "subarea")],
        )));

        let names = ["nodes.dat", "ways.dat", "rel.s.dat", "rel.c.dat"];
        let files = names.map(|n| DataTreeFiles::new(tree_dir.path(), n));
        let leaf_sets = [&nodes, &ways, &simple, &complex];
        for (f, data) in files.iter().zip(leaf_sets) {
            let leafs = tree.leafs();
            write_dataset_sorted(f.path(leafs[0]), data).unwrap();
        }

        Fixture {
            _tree_dir: tree_dir,
            out_dir: TempDir::new().unwrap(),
            tree,
            files,
        }
    }

    #[test]
    fn test_west_half_query() {
        let fx = fixture();
        let region = RectRegion::new(rect(0.0, 0.0, 8.0, 16.0));
        let query = LeafQuery::new(
            &region,
            &fx.files[0],
            &fx.files[1],
            &fx.files[2],
            &fx.files[3],
            false,
        );
        let out = outputs(&fx.out_dir);
        let leafs = fx.tree.leafs();
        let result = query.execute(leafs[0], &out).unwrap();

        // Nodes 1 and 2 are west of the midline; ways 1 and 3 each have an
        // accepted node; the simple relation rides on way 1.
        assert_eq!(result.num_nodes, 2);
        assert_eq!(result.num_ways, 2);
        assert_eq!(result.num_simple_relations, 1);
        assert_eq!(result.num_complex_relations, 0);

        // Way 3 reaches node 3 outside the region: closure provides it.
        let extra = read_dataset(&out.additional_nodes).unwrap();
        let ids: Vec<i64> = extra.nodes.keys().copied().collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn test_complex_group_kept_whole() {
        let fx = fixture();
        let region = RectRegion::new(rect(8.0, 0.0, 16.0, 16.0));
        let query = LeafQuery::new(
            &region,
            &fx.files[0],
            &fx.files[1],
            &fx.files[2],
            &fx.files[3],
            false,
        );
        let out = outputs(&fx.out_dir);
        let leafs = fx.tree.leafs();
        let result = query.execute(leafs[0], &out).unwrap();

        // Relation 10 is accepted through way 2; relation 11 references 10
        // and must come along even though none of its members matched.
        assert_eq!(result.num_complex_relations, 2);
        let written = read_dataset(&out.complex_relations).unwrap();
        let ids: Vec<i64> = written.relations.keys().copied().collect();
        assert_eq!(ids, vec![10, 11]);
    }

    #[test]
    fn test_referential_closure_property() {
        // Every way in the filtered output has all its nodes in either the
        // primary or the additional nodes output.
        let fx = fixture();
        let region = RectRegion::new(rect(0.0, 0.0, 8.0, 16.0));
        let query = LeafQuery::new(
            &region,
            &fx.files[0],
            &fx.files[1],
            &fx.files[2],
            &fx.files[3],
            false,
        );
        let out = outputs(&fx.out_dir);
        let leafs = fx.tree.leafs();
        query.execute(leafs[0], &out).unwrap();

        let nodes = read_dataset(&out.nodes).unwrap();
        let extra = read_dataset(&out.additional_nodes).unwrap();
        let ways = read_dataset(&out.ways).unwrap();
        for way in ways.ways.values() {
            for id in &way.node_refs {
                assert!(
                    nodes.nodes.contains_key(id) || extra.nodes.contains_key(id),
                    "way {} is missing node {id}",
                    way.id
                );
            }
        }
    }

    #[test]
    fn test_fast_relation_bbox_test() {
        let fx = fixture();
        // A sliver between nodes: no node is contained, but way 2's
        // envelope crosses it.
        let region = RectRegion::new(rect(12.0, 0.0, 13.0, 16.0));
        let query = LeafQuery::new(
            &region,
            &fx.files[0],
            &fx.files[1],
            &fx.files[2],
            &fx.files[3],
            true,
        );
        let out = outputs(&fx.out_dir);
        let leafs = fx.tree.leafs();
        let result = query.execute(leafs[0], &out).unwrap();

        assert_eq!(result.num_nodes, 0);
        // The bbox test accepts relation 10 (its envelope spans x 11..15).
        assert!(result.num_complex_relations >= 1);
    }

    #[test]
    fn test_missing_leaf_file_is_fatal() {
        let fx = fixture();
        let region = RectRegion::new(rect(0.0, 0.0, 8.0, 16.0));
        let bogus = DataTreeFiles::new(fx._tree_dir.path(), "missing.dat");
        let query = LeafQuery::new(
            &region,
            &bogus,
            &fx.files[1],
            &fx.files[2],
            &fx.files[3],
            false,
        );
        let out = outputs(&fx.out_dir);
        let leafs = fx.tree.leafs();
        assert!(query.execute(leafs[0], &out).is_err());
    }
}
