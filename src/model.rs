//! Map entity model: nodes, ways, relations and in-memory datasets.
//!
//! Ids are unique within one kind; the id spaces of the three kinds are
//! independent. The merge stage relies on the kind rank
//! `Node < Way < Relation`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::io::EntityReader;

/// The three entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Node,
    Way,
    Relation,
}

impl EntityType {
    /// Rank used by the global sorted merge: nodes before ways before
    /// relations.
    pub fn rank(self) -> u8 {
        match self {
            EntityType::Node => 0,
            EntityType::Way => 1,
            EntityType::Relation => 2,
        }
    }
}

/// A point feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub lon: f64,
    pub lat: f64,
    pub tags: Vec<(String, String)>,
}

impl Node {
    pub fn new(id: i64, lon: f64, lat: f64) -> Self {
        Self {
            id,
            lon,
            lat,
            tags: Vec::new(),
        }
    }
}

/// An ordered sequence of node references. References may repeat (closed
/// rings repeat their first node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Way {
    pub id: i64,
    pub node_refs: Vec<i64>,
    pub tags: Vec<(String, String)>,
}

impl Way {
    pub fn new(id: i64, node_refs: Vec<i64>) -> Self {
        Self {
            id,
            node_refs,
            tags: Vec::new(),
        }
    }
}

/// One member of a relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub mtype: EntityType,
    pub id: i64,
    pub role: String,
}

impl Member {
    pub fn new(mtype: EntityType, id: i64, role: impl Into<String>) -> Self {
        Self {
            mtype,
            id,
            role: role.into(),
        }
    }
}

/// An ordered collection of typed members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: i64,
    pub members: Vec<Member>,
    pub tags: Vec<(String, String)>,
}

impl Relation {
    pub fn new(id: i64, members: Vec<Member>) -> Self {
        Self {
            id,
            members,
            tags: Vec::new(),
        }
    }

    /// Whether any member references another relation.
    pub fn has_relation_members(&self) -> bool {
        self.members.iter().any(|m| m.mtype == EntityType::Relation)
    }
}

/// A single entity of any kind, as read from or written to entity files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl Entity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Entity::Node(_) => EntityType::Node,
            Entity::Way(_) => EntityType::Way,
            Entity::Relation(_) => EntityType::Relation,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Entity::Node(n) => n.id,
            Entity::Way(w) => w.id,
            Entity::Relation(r) => r.id,
        }
    }

    /// Sort key used by the merge stage.
    pub fn sort_key(&self) -> (u8, i64) {
        (self.entity_type().rank(), self.id())
    }
}

/// Lookup of entities by id, the seam between batch contents and the
/// algorithms that resolve member references.
pub trait EntityProvider {
    fn node(&self, id: i64) -> Option<&Node>;
    fn way(&self, id: i64) -> Option<&Way>;
    fn relation(&self, id: i64) -> Option<&Relation>;
}

/// An in-memory dataset, bulk-loaded from entity files.
///
/// Entities are keyed by id in ordered maps, so iteration is always in
/// ascending id order and rewriting a dataset yields sorted files.
#[derive(Debug, Default, Clone)]
pub struct DataSet {
    pub nodes: BTreeMap<i64, Node>,
    pub ways: BTreeMap<i64, Way>,
    pub relations: BTreeMap<i64, Relation>,
}

impl DataSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain a cursor into memory.
    pub fn read_from(reader: &mut EntityReader<impl std::io::Read>) -> Result<Self> {
        let mut data = Self::new();
        while let Some(entity) = reader.next_entity()? {
            data.insert(entity);
        }
        Ok(data)
    }

    pub fn insert(&mut self, entity: Entity) {
        match entity {
            Entity::Node(n) => {
                self.nodes.insert(n.id, n);
            }
            Entity::Way(w) => {
                self.ways.insert(w.id, w);
            }
            Entity::Relation(r) => {
                self.relations.insert(r.id, r);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.ways.is_empty() && self.relations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.ways.len() + self.relations.len()
    }
}

impl EntityProvider for DataSet {
    fn node(&self, id: i64) -> Option<&Node> {
        self.nodes.get(&id)
    }

    fn way(&self, id: i64) -> Option<&Way> {
        self.ways.get(&id)
    }

    fn relation(&self, id: i64) -> Option<&Relation> {
        self.relations.get(&id)
    }
}
