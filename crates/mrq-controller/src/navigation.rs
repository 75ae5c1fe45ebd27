//! Picks the record to present after one is resolved.

use mrq_core::pipeline::page_of_index;
use mrq_core::{Record, RecordId};

/// Next record awaiting review after `resolved` in `visible` (the full
/// filtered, sorted order across pages), wrapping to the start. `visible`
/// must reflect statuses from before the resolution.
pub fn next_after_resolving<'a>(resolved: &RecordId, visible: &[&'a Record]) -> Option<&'a Record> {
    let awaiting = visible
        .iter()
        .copied()
        .filter(|r| r.status.awaits_review())
        .collect::<Vec<_>>();
    let position = awaiting.iter().position(|r| &r.id == resolved);

    let (head, tail) = awaiting.split_at(position.map(|index| index + 1).unwrap_or(0));
    tail.iter()
        .chain(head.iter())
        .copied()
        .find(|r| &r.id != resolved)
}

/// 1-indexed page of `id` within `ordered`, if present.
pub fn locate(id: &RecordId, ordered: &[&Record], page_size: usize) -> Option<usize> {
    ordered
        .iter()
        .position(|r| &r.id == id)
        .map(|index| page_of_index(index, page_size))
}
