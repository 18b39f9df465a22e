//! Naming scheme for extraction databases: tree file names, batch file
//! names and the directory layout derived from a base path.

use std::path::{Path, PathBuf};

/// Default extension of entity files.
pub const DATA_EXTENSION: &str = ".dat";

/// Names of the per-leaf files inside the tree directory.
#[derive(Debug, Clone)]
pub struct TreeFileNames {
    nodes: String,
    ways: String,
    simple_relations: String,
    complex_relations: String,
}

impl TreeFileNames {
    pub fn new(
        nodes: impl Into<String>,
        ways: impl Into<String>,
        simple_relations: impl Into<String>,
        complex_relations: impl Into<String>,
    ) -> Self {
        Self {
            nodes: nodes.into(),
            ways: ways.into(),
            simple_relations: simple_relations.into(),
            complex_relations: complex_relations.into(),
        }
    }

    pub fn nodes(&self) -> &str {
        &self.nodes
    }

    pub fn ways(&self) -> &str {
        &self.ways
    }

    pub fn simple_relations(&self) -> &str {
        &self.simple_relations
    }

    pub fn complex_relations(&self) -> &str {
        &self.complex_relations
    }
}

impl Default for TreeFileNames {
    fn default() -> Self {
        Self::new(
            format!("nodes{DATA_EXTENSION}"),
            format!("ways{DATA_EXTENSION}"),
            format!("relations.simple{DATA_EXTENSION}"),
            format!("relations.complex{DATA_EXTENSION}"),
        )
    }
}

/// Names of the files inside a relation batch directory.
#[derive(Debug, Clone)]
pub struct BatchFileNames {
    nodes: String,
    ways: String,
    relations: String,
}

impl BatchFileNames {
    pub fn new(
        nodes: impl Into<String>,
        ways: impl Into<String>,
        relations: impl Into<String>,
    ) -> Self {
        Self {
            nodes: nodes.into(),
            ways: ways.into(),
            relations: relations.into(),
        }
    }

    pub fn nodes(&self) -> &str {
        &self.nodes
    }

    pub fn ways(&self) -> &str {
        &self.ways
    }

    pub fn relations(&self) -> &str {
        &self.relations
    }
}

impl Default for BatchFileNames {
    fn default() -> Self {
        Self::new(
            format!("nodes{DATA_EXTENSION}"),
            format!("ways{DATA_EXTENSION}"),
            format!("relations{DATA_EXTENSION}"),
        )
    }
}

/// Directory layout of an extraction database, derived from its base
/// directory.
#[derive(Debug, Clone)]
pub struct ExtractionPaths {
    base: PathBuf,
}

impl ExtractionPaths {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The partition tree directory.
    pub fn tree(&self) -> PathBuf {
        self.base.join("tree")
    }

    /// Numbered batch directories for simple relations that straddle
    /// leaves.
    pub fn simple_relations(&self) -> PathBuf {
        self.base.join("simple-relations")
    }

    /// Numbered batch directories for complex relations.
    pub fn complex_relations(&self) -> PathBuf {
        self.base.join("complex-relations")
    }

    /// Bbox index over the simple relation batches.
    pub fn simple_relations_bboxes(&self) -> PathBuf {
        self.base.join("simple-relations.bboxlist")
    }

    /// Bbox index over the complex relation batches.
    pub fn complex_relations_bboxes(&self) -> PathBuf {
        self.base.join("complex-relations.bboxlist")
    }
}
