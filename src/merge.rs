//! K-way merge of sorted entity files into one globally sorted stream.
//!
//! Every input must be internally ordered nodes, then ways, then relations,
//! each kind strictly ascending by id. The merge selects the globally
//! smallest `(kind rank, id)` with a binary heap. Ids are globally unique
//! per kind across all inputs by construction of the partitioning scheme;
//! a duplicate or an out-of-order input is an invariant violation and
//! surfaces as an error, never as silent deduplication.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{Read, Write};

use crate::error::{GeoshardError, Result};
use crate::io::{EntityReader, EntityWriter};
use crate::model::Entity;

struct MergeInput<R: Read> {
    reader: EntityReader<R>,
    last_key: Option<(u8, i64)>,
}

impl<R: Read> MergeInput<R> {
    fn advance(&mut self, index: usize) -> Result<Option<Entity>> {
        let Some(entity) = self.reader.next_entity()? else {
            return Ok(None);
        };
        let key = entity.sort_key();
        if let Some(last) = self.last_key
            && key <= last
        {
            return Err(GeoshardError::MergeOrder(format!(
                "input {index} is not strictly ascending: {key:?} after {last:?}"
            )));
        }
        self.last_key = Some(key);
        Ok(Some(entity))
    }
}

/// Merge `inputs` into `output`. Returns the number of entities written.
pub fn sorted_merge<R: Read, W: Write>(
    inputs: Vec<EntityReader<R>>,
    output: &mut EntityWriter<W>,
) -> Result<u64> {
    let mut inputs: Vec<MergeInput<R>> = inputs
        .into_iter()
        .map(|reader| MergeInput {
            reader,
            last_key: None,
        })
        .collect();

    // Heap of (key, input index); Reverse turns the max-heap into min.
    let mut heap: BinaryHeap<Reverse<((u8, i64), usize)>> = BinaryHeap::new();
    let mut heads: Vec<Option<Entity>> = Vec::with_capacity(inputs.len());

    for index in 0..inputs.len() {
        let head = inputs[index].advance(index)?;
        if let Some(entity) = &head {
            heap.push(Reverse((entity.sort_key(), index)));
        }
        heads.push(head);
    }

    let mut written = 0u64;
    let mut last_emitted: Option<(u8, i64)> = None;

    while let Some(Reverse((key, index))) = heap.pop() {
        if last_emitted == Some(key) {
            return Err(GeoshardError::MergeOrder(format!(
                "duplicate entity {key:?} across merge inputs"
            )));
        }
        last_emitted = Some(key);

        let entity = heads[index]
            .take()
            .unwrap_or_else(|| unreachable!("heap entry without a head"));
        output.write(&entity)?;
        written += 1;

        let next = inputs[index].advance(index)?;
        if let Some(entity) = &next {
            heap.push(Reverse((entity.sort_key(), index)));
        }
        heads[index] = next;
    }

    output.finish()?;
    Ok(written)
}
