//! Spatial partition tree storage and region extraction for large map
//! datasets.
//!
//! ```rust
//! use geoshard::prelude::*;
//!
//! let dir = tempfile::tempdir()?;
//! let tree = DataTree::create(dir.path(), rect(0.0, 0.0, 16.0, 16.0), 1)?;
//!
//! assert_eq!(tree.leafs().len(), 2);
//! assert_eq!(tree.query(&rect(1.0, 1.0, 2.0, 2.0)).len(), 1);
//! # Ok::<(), geoshard::GeoshardError>(())
//! ```

pub mod batch;
pub mod datatree;
pub mod distribute;
pub mod error;
pub mod idbbox;
pub mod io;
pub mod leafquery;
pub mod merge;
pub mod model;
pub mod paths;
pub mod pipeline;
pub mod query;
pub mod relgraph;
pub mod spatial;
pub mod splitter;

pub use error::{GeoshardError, Result};

pub use geo::{Coord, Rect};

pub use datatree::{DataTree, DataTreeFiles, TreeNode};

pub use model::{DataSet, Entity, EntityProvider, EntityType, Member, Node, Relation, Way};

pub use spatial::{RectRegion, RegionPredicate, rect};

pub use io::{EntityReader, EntityWriter};

pub use idbbox::IdBboxEntry;

pub use paths::{BatchFileNames, ExtractionPaths, TreeFileNames};

pub use relgraph::{Group, RelationGraph};

pub use batch::GroupBatch;

pub use splitter::{RelationBatchKind, RelationSplitter, SplitterConfig};

pub use merge::sorted_merge;

pub use pipeline::{SharedWriter, WritePipeline};

pub use distribute::NodeTreeDistributor;

pub use leafquery::{LeafOutputs, LeafQuery, QueryResult};

pub use query::{Query, QueryOptions, RelationFilter};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{GeoshardError, Result};

    pub use crate::{DataTree, DataTreeFiles};

    pub use crate::{DataSet, Entity, EntityType, Member, Node, Relation, Way};

    pub use crate::spatial::{RectRegion, RegionPredicate, rect};

    pub use crate::{EntityReader, EntityWriter};

    pub use crate::{BatchFileNames, ExtractionPaths, TreeFileNames};

    pub use crate::{Query, QueryOptions, QueryResult};

    pub use crate::{RelationBatchKind, RelationSplitter, SplitterConfig};
}
