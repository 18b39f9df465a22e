//! Size-bounded batch accumulator for relation groups.

use crate::relgraph::Group;

/// Default ceiling on the summed member count of a batch.
pub const DEFAULT_MAX_MEMBERS: usize = 100_000;

/// Accumulates groups until their summed member counts reach a ceiling.
/// One flushed batch becomes one numbered output subdirectory.
#[derive(Debug)]
pub struct GroupBatch {
    max_members: usize,
    elements: Vec<Group>,
    size: usize,
}

impl GroupBatch {
    pub fn new(max_members: usize) -> Self {
        Self {
            max_members,
            elements: Vec::new(),
            size: 0,
        }
    }

    /// Whether `group` can be added without exceeding the ceiling. An empty
    /// batch accepts any group, so a single oversized group occupies a
    /// batch of its own.
    pub fn fits(&self, group: &Group) -> bool {
        self.elements.is_empty() || self.size + group.num_members() <= self.max_members
    }

    pub fn add(&mut self, group: Group) {
        self.size += group.num_members();
        self.elements.push(group);
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.max_members
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[Group] {
        &self.elements
    }

    /// Summed member count of the accumulated groups.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn clear(&mut self) {
        self.elements.clear();
        self.size = 0;
    }

    /// Drain the accumulated groups, leaving the batch empty.
    pub fn take(&mut self) -> Vec<Group> {
        self.size = 0;
        std::mem::take(&mut self.elements)
    }
}
