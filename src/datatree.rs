//! The spatial partition tree: path codes, on-disk layout, region and point
//! queries.
//!
//! A tree lives in a directory. `tree.json` records the root envelope; one
//! subdirectory per leaf, named by the leaf's path code in hexadecimal,
//! holds that leaf's entity files. The directory names alone encode the
//! structure: opening a tree parses them and rebuilds the split hierarchy.
//!
//! Splits are binary with alternating axis, longitude first. A path code is
//! a bit string with a leading sentinel bit: the root is `0x1`, a child is
//! `parent << 1 | side` where side 0 is the lower half. Leaf regions follow
//! a half-open convention (`[min, mid)` / `[mid, max)`), so they partition
//! the root envelope exactly; point queries test closed envelopes and may
//! return two leaves for a point on a shared boundary.

use std::fs;
use std::path::{Path, PathBuf};

use geo::Rect;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{GeoshardError, Result};
use crate::spatial::{rect, rects_intersect};

/// Name of the tree metadata file inside the tree directory.
pub const TREE_META_FILE: &str = "tree.json";

/// Root envelope record persisted as `tree.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TreeMeta {
    pub lon_min: f64,
    pub lat_min: f64,
    pub lon_max: f64,
    pub lat_max: f64,
}

impl TreeMeta {
    pub fn from_rect(bbox: &Rect) -> Self {
        Self {
            lon_min: bbox.min().x,
            lat_min: bbox.min().y,
            lon_max: bbox.max().x,
            lat_max: bbox.max().y,
        }
    }

    pub fn to_rect(self) -> Rect {
        rect(self.lon_min, self.lat_min, self.lon_max, self.lat_max)
    }
}

/// Render a path code as its directory name.
pub fn path_code_to_hex(code: u64) -> String {
    format!("{code:x}")
}

/// Parse a directory name back into a path code.
pub fn path_code_from_hex(name: &str) -> Result<u64> {
    let code = u64::from_str_radix(name, 16)
        .map_err(|_| GeoshardError::InvalidPathCode(name.to_string()))?;
    if code == 0 {
        return Err(GeoshardError::InvalidPathCode(name.to_string()));
    }
    Ok(code)
}

/// Number of splits between the root and this code.
fn path_depth(code: u64) -> u32 {
    63 - code.leading_zeros()
}

/// A node of the partition tree. Inner nodes own exactly two children that
/// partition the region; leaves own none.
#[derive(Debug, Clone)]
pub struct TreeNode {
    code: u64,
    bbox: Rect,
    children: Vec<TreeNode>,
}

impl TreeNode {
    fn new(code: u64, bbox: Rect) -> Self {
        Self {
            code,
            bbox,
            children: Vec::new(),
        }
    }

    pub fn path_code(&self) -> u64 {
        self.code
    }

    /// The directory name of this node.
    pub fn name(&self) -> String {
        path_code_to_hex(self.code)
    }

    pub fn envelope(&self) -> &Rect {
        &self.bbox
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Split this node in two along the axis for its depth, longitude on
    /// even depths.
    fn split(&mut self) {
        debug_assert!(self.children.is_empty());
        let (min, max) = (self.bbox.min(), self.bbox.max());
        let (lower, upper) = if path_depth(self.code) % 2 == 0 {
            let mid = (min.x + max.x) / 2.0;
            (
                rect(min.x, min.y, mid, max.y),
                rect(mid, min.y, max.x, max.y),
            )
        } else {
            let mid = (min.y + max.y) / 2.0;
            (
                rect(min.x, min.y, max.x, mid),
                rect(min.x, mid, max.x, max.y),
            )
        };
        self.children.push(TreeNode::new(self.code << 1, lower));
        self.children.push(TreeNode::new(self.code << 1 | 1, upper));
    }

    fn collect_leafs<'a>(&'a self, out: &mut Vec<&'a TreeNode>) {
        if self.is_leaf() {
            out.push(self);
        } else {
            for child in &self.children {
                child.collect_leafs(out);
            }
        }
    }

    fn query<'a>(&'a self, region: &Rect, out: &mut Vec<&'a TreeNode>) {
        if !rects_intersect(&self.bbox, region) {
            return;
        }
        if self.is_leaf() {
            out.push(self);
        } else {
            for child in &self.children {
                child.query(region, out);
            }
        }
    }

    fn query_point<'a>(&'a self, lon: f64, lat: f64, out: &mut SmallVec<[&'a TreeNode; 2]>) {
        let (min, max) = (self.bbox.min(), self.bbox.max());
        if lon < min.x || lon > max.x || lat < min.y || lat > max.y {
            return;
        }
        if self.is_leaf() {
            out.push(self);
        } else {
            for child in &self.children {
                child.query_point(lon, lat, out);
            }
        }
    }
}

/// A partition tree opened from disk. Read-only shared state for the
/// duration of a query.
#[derive(Debug, Clone)]
pub struct DataTree {
    root: TreeNode,
}

impl DataTree {
    /// Load the persisted tree description without touching entity payloads.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let meta: TreeMeta = serde_json::from_str(&fs::read_to_string(dir.join(TREE_META_FILE))?)?;

        let mut codes = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            codes.push(path_code_from_hex(&name)?);
        }
        if codes.is_empty() {
            return Err(GeoshardError::InvalidFormat);
        }

        Self::from_leaf_codes(meta.to_rect(), &codes)
    }

    /// Rebuild the split hierarchy from a set of leaf path codes.
    pub fn from_leaf_codes(bbox: Rect, codes: &[u64]) -> Result<Self> {
        let mut root = TreeNode::new(1, bbox);

        for &code in codes {
            let depth = path_depth(code);
            let mut current = &mut root;
            for i in (0..depth).rev() {
                if current.children.is_empty() {
                    current.split();
                }
                let side = ((code >> i) & 1) as usize;
                current = &mut current.children[side];
            }
        }

        let tree = Self { root };

        // The leaf set of the rebuilt hierarchy must equal the given codes;
        // a mismatch means one code was a prefix of another, or a sibling
        // directory is missing.
        let built: FxHashSet<u64> = tree.leafs().iter().map(|l| l.code).collect();
        let given: FxHashSet<u64> = codes.iter().copied().collect();
        if built != given {
            return Err(GeoshardError::InvalidFormat);
        }

        Ok(tree)
    }

    /// Create a tree directory with a uniform split depth: `tree.json` plus
    /// one empty subdirectory per leaf. Returns the opened tree.
    pub fn create<P: AsRef<Path>>(dir: P, bbox: Rect, splits: u32) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let mut root = TreeNode::new(1, bbox);
        split_to_depth(&mut root, splits);
        let tree = Self { root };

        let meta = TreeMeta::from_rect(&bbox);
        fs::write(dir.join(TREE_META_FILE), serde_json::to_string_pretty(&meta)?)?;
        for leaf in tree.leafs() {
            fs::create_dir_all(dir.join(leaf.name()))?;
        }
        Ok(tree)
    }

    /// The root envelope.
    pub fn envelope(&self) -> &Rect {
        &self.root.bbox
    }

    /// All leaves in pre-order. The order is stable across runs, so batch
    /// index numbering derived from it is deterministic.
    pub fn leafs(&self) -> Vec<&TreeNode> {
        let mut out = Vec::new();
        self.root.collect_leafs(&mut out);
        out
    }

    /// Every leaf whose envelope intersects `region`, in pre-order.
    pub fn query(&self, region: &Rect) -> Vec<&TreeNode> {
        let mut out = Vec::new();
        self.root.query(region, &mut out);
        out
    }

    /// The leaf or leaves whose envelope contains the point. Normally a
    /// single leaf; two on a shared split boundary.
    pub fn query_point(&self, lon: f64, lat: f64) -> SmallVec<[&TreeNode; 2]> {
        let mut out = SmallVec::new();
        self.root.query_point(lon, lat, &mut out);
        out
    }
}

fn split_to_depth(node: &mut TreeNode, remaining: u32) {
    if remaining == 0 {
        return;
    }
    node.split();
    for child in &mut node.children {
        split_to_depth(child, remaining - 1);
    }
}

/// Projection from a leaf to the path of one of its entity files.
#[derive(Debug, Clone)]
pub struct DataTreeFiles {
    dir: PathBuf,
    file_name: String,
}

impl DataTreeFiles {
    pub fn new<P: AsRef<Path>>(dir: P, file_name: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            file_name: file_name.into(),
        }
    }

    /// The leaf's subdirectory.
    pub fn subdir(&self, leaf: &TreeNode) -> PathBuf {
        self.dir.join(leaf.name())
    }

    /// The full path of this projection's file inside the leaf directory.
    pub fn path(&self, leaf: &TreeNode) -> PathBuf {
        self.subdir(leaf).join(&self.file_name)
    }
}
