//! The relation reference graph and its partition into groups.
//!
//! An edge `A -> B` exists when relation A has a member of type Relation
//! with id B. Extracting A requires B and vice versa for consistent
//! re-querying, so groups are the connected components of the undirected
//! closure, computed with an explicit union-find.

use log::warn;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::model::{EntityProvider, EntityType, Relation};

/// A maximal set of relations connected through mutual relation-member
/// references. Immutable once built; `num_members` is derived by
/// [`group_size`].
#[derive(Debug, Clone)]
pub struct Group {
    start: i64,
    relation_ids: FxHashSet<i64>,
    num_members: usize,
}

impl Group {
    pub fn new(start: i64, relation_ids: FxHashSet<i64>) -> Self {
        Self {
            start,
            relation_ids,
            num_members: 0,
        }
    }

    /// The lowest relation id in the group, the deterministic batch key.
    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn relation_ids(&self) -> &FxHashSet<i64> {
        &self.relation_ids
    }

    pub fn num_relations(&self) -> usize {
        self.relation_ids.len()
    }

    pub fn num_members(&self) -> usize {
        self.num_members
    }

    pub fn set_num_members(&mut self, num_members: usize) {
        self.num_members = num_members;
    }
}

/// Union-find over sparse relation ids.
struct UnionFind {
    parent: FxHashMap<i64, i64>,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: FxHashMap::default(),
        }
    }

    fn insert(&mut self, id: i64) {
        self.parent.entry(id).or_insert(id);
    }

    fn find(&mut self, id: i64) -> i64 {
        let mut root = id;
        while self.parent[&root] != root {
            root = self.parent[&root];
        }
        // Path compression.
        let mut current = id;
        while current != root {
            let next = self.parent[&current];
            self.parent.insert(current, root);
            current = next;
        }
        root
    }

    fn union(&mut self, a: i64, b: i64) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Lower id wins as representative, keeping roots deterministic.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(hi, lo);
        }
    }
}

/// Reference graph over a set of relations.
#[derive(Debug, Default)]
pub struct RelationGraph {
    edges: Vec<(i64, i64)>,
    ids: FxHashSet<i64>,
    ids_has_child_relations: FxHashSet<i64>,
    ids_is_child_relation: FxHashSet<i64>,
    num_no_children: usize,
}

impl RelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from a pass over relations.
    pub fn build<'a>(relations: impl IntoIterator<Item = &'a Relation>) -> Self {
        let mut graph = Self::new();
        for relation in relations {
            graph.add(relation);
        }
        graph
    }

    pub fn add(&mut self, relation: &Relation) {
        self.ids.insert(relation.id);

        let mut has_child = false;
        for member in &relation.members {
            if member.mtype != EntityType::Relation {
                continue;
            }
            has_child = true;
            self.ids.insert(member.id);
            self.ids_is_child_relation.insert(member.id);
            self.edges.push((relation.id, member.id));
        }

        if has_child {
            self.ids_has_child_relations.insert(relation.id);
        } else {
            self.num_no_children += 1;
        }
    }

    /// Relations that reference at least one other relation.
    pub fn ids_has_child_relations(&self) -> &FxHashSet<i64> {
        &self.ids_has_child_relations
    }

    /// Relations referenced as a member by some other relation.
    pub fn ids_is_child_relation(&self) -> &FxHashSet<i64> {
        &self.ids_is_child_relation
    }

    /// Number of scanned relations without relation members.
    pub fn num_no_children(&self) -> usize {
        self.num_no_children
    }

    /// Partition the graph into connected components of its undirected
    /// closure. Groups are returned sorted by their lowest relation id, so
    /// downstream numbering is deterministic.
    pub fn build_groups(&self) -> Vec<Group> {
        let mut uf = UnionFind::new();
        for &id in &self.ids {
            uf.insert(id);
        }
        for &(a, b) in &self.edges {
            uf.union(a, b);
        }

        let mut components: FxHashMap<i64, FxHashSet<i64>> = FxHashMap::default();
        for &id in &self.ids {
            let root = uf.find(id);
            components.entry(root).or_default().insert(id);
        }

        let mut groups: Vec<Group> = components
            .into_iter()
            .map(|(root, ids)| Group::new(root, ids))
            .collect();
        groups.sort_by_key(|g| g.start());
        groups
    }
}

/// Total member count of a group: the sum of the member counts of all its
/// relations, resolved from `provider`. A relation missing from the
/// provider is logged and skipped.
pub fn group_size(group: &Group, provider: &impl EntityProvider) -> usize {
    let mut size = 0;
    for &id in group.relation_ids() {
        match provider.relation(id) {
            Some(relation) => size += relation.members.len(),
            None => warn!("relation not found while sizing group: {id}"),
        }
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataSet, Entity, Member};

    fn relation_with_children(id: i64, children: &[i64]) -> Relation {
        let members = children
            .iter()
            .map(|&c| Member::new(EntityType::Relation, c, ""))
            .collect();
        Relation::new(id, members)
    }

    fn relation_plain(id: i64, n_members: usize) -> Relation {
        let members = (0..n_members)
            .map(|i| Member::new(EntityType::Node, i as i64 + 1000, ""))
            .collect();
        Relation::new(id, members)
    }

    #[test]
    fn test_groups_are_connected_components() {
        // A(1) -> B(2), C(3) and D(4) isolated.
        let relations = vec![
            relation_with_children(1, &[2]),
            relation_plain(2, 3),
            relation_plain(3, 2),
            relation_plain(4, 1),
        ];
        let graph = RelationGraph::build(&relations);
        let groups = graph.build_groups();

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].start(), 1);
        assert_eq!(groups[0].num_relations(), 2);
        assert!(groups[0].relation_ids().contains(&1));
        assert!(groups[0].relation_ids().contains(&2));
        assert_eq!(groups[1].num_relations(), 1);
        assert_eq!(groups[2].num_relations(), 1);
    }

    #[test]
    fn test_grouping_ignores_edge_direction() {
        // 1 -> 3 and 2 -> 3 puts all three in one group.
        let relations = vec![
            relation_with_children(1, &[3]),
            relation_with_children(2, &[3]),
            relation_plain(3, 1),
        ];
        let groups = RelationGraph::build(&relations).build_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].num_relations(), 3);
    }

    #[test]
    fn test_classification() {
        let relations = vec![
            relation_with_children(1, &[2, 3]),
            relation_plain(2, 1),
            relation_plain(4, 2),
        ];
        let graph = RelationGraph::build(&relations);

        assert_eq!(graph.num_no_children(), 2);
        assert!(graph.ids_has_child_relations().contains(&1));
        assert!(graph.ids_is_child_relation().contains(&2));
        assert!(graph.ids_is_child_relation().contains(&3));
        assert!(!graph.ids_is_child_relation().contains(&4));
    }

    #[test]
    fn test_group_size_skips_missing() {
        let relations = vec![relation_with_children(1, &[2]), relation_plain(2, 5)];
        let graph = RelationGraph::build(&relations);
        let groups = graph.build_groups();
        assert_eq!(groups.len(), 1);

        let mut data = DataSet::new();
        for r in &relations {
            data.insert(Entity::Relation(r.clone()));
        }
        // 1 member of relation 1 plus 5 members of relation 2.
        assert_eq!(group_size(&groups[0], &data), 6);

        // Without relation 2 loaded, its members are not counted.
        let mut partial = DataSet::new();
        partial.insert(Entity::Relation(relations[0].clone()));
        assert_eq!(group_size(&groups[0], &partial), 1);
    }
}
