//! Step ordering rules shared by every store implementation.
//!
//! Stores call into this module inside their write transaction so the
//! permutation check and the renumbering see the same snapshot of steps.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::process::ProcessId;
use crate::domain::step::{ProcessStep, StepId};
use crate::errors::WorkflowError;

/// One `{id, order}` row as sent by a drag-and-drop client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderEntry {
    pub id: StepId,
    pub order: u32,
}

/// Turns client rows into the proposed id sequence. Rows are ranked by their
/// `order` value; the values themselves need not be contiguous.
pub fn sequence_from_entries(entries: &[ReorderEntry]) -> Result<Vec<StepId>, WorkflowError> {
    let mut seen = BTreeSet::new();
    if let Some(clash) = entries.iter().find(|entry| !seen.insert(entry.order)) {
        return Err(WorkflowError::validation(
            "steps",
            format!("order value {} is used by more than one step", clash.order),
        ));
    }

    let mut ranked = entries.to_vec();
    ranked.sort_by_key(|entry| entry.order);
    Ok(ranked.into_iter().map(|entry| entry.id).collect())
}

/// Fails with `InvalidReorder` unless `proposed` lists every id in `current`
/// exactly once and nothing else.
pub fn ensure_permutation(
    process: ProcessId,
    current: &[StepId],
    proposed: &[StepId],
) -> Result<(), WorkflowError> {
    let current_set: BTreeSet<StepId> = current.iter().copied().collect();

    let mut counts: BTreeMap<StepId, usize> = BTreeMap::new();
    for id in proposed {
        *counts.entry(*id).or_default() += 1;
    }

    let missing: Vec<StepId> =
        current_set.iter().filter(|id| !counts.contains_key(*id)).copied().collect();
    let extra: Vec<StepId> =
        counts.keys().filter(|id| !current_set.contains(*id)).copied().collect();
    let duplicates: Vec<StepId> =
        counts.iter().filter_map(|(id, count)| (*count > 1).then_some(*id)).collect();

    if missing.is_empty() && extra.is_empty() && duplicates.is_empty() {
        return Ok(());
    }

    Err(WorkflowError::InvalidReorder { process, missing, extra, duplicates })
}

/// Applies `proposed` to `steps`, returning them in their new order with
/// `order = index + 1`.
pub fn renumber(
    process: ProcessId,
    steps: Vec<ProcessStep>,
    proposed: &[StepId],
) -> Result<Vec<ProcessStep>, WorkflowError> {
    let current: Vec<StepId> = steps.iter().map(|step| step.id).collect();
    ensure_permutation(process, &current, proposed)?;

    let mut by_id: BTreeMap<StepId, ProcessStep> =
        steps.into_iter().map(|step| (step.id, step)).collect();

    let mut ordered = Vec::with_capacity(proposed.len());
    for (index, id) in proposed.iter().enumerate() {
        if let Some(mut step) = by_id.remove(id) {
            step.order = position_for(index);
            ordered.push(step);
        }
    }
    Ok(ordered)
}

/// Closes gaps left by a removal, keeping the relative order of the rest.
pub fn compact(mut steps: Vec<ProcessStep>) -> Vec<ProcessStep> {
    steps.sort_by_key(|step| (step.order, step.id));
    for (index, step) in steps.iter_mut().enumerate() {
        step.order = position_for(index);
    }
    steps
}

/// Ids in ascending `order`.
pub fn sequence_of(steps: &[ProcessStep]) -> Vec<StepId> {
    let mut sorted: Vec<&ProcessStep> = steps.iter().collect();
    sorted.sort_by_key(|step| step.order);
    sorted.into_iter().map(|step| step.id).collect()
}

/// True when the orders are exactly `1..=N`.
pub fn is_gap_free(steps: &[ProcessStep]) -> bool {
    let mut orders: Vec<u32> = steps.iter().map(|step| step.order).collect();
    orders.sort_unstable();
    orders.iter().enumerate().all(|(index, order)| *order == position_for(index))
}

fn position_for(index: usize) -> u32 {
    u32::try_from(index + 1).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proptest::prelude::*;

    use super::{
        compact, ensure_permutation, is_gap_free, renumber, sequence_from_entries, sequence_of,
        ReorderEntry,
    };
    use crate::domain::actor::UserId;
    use crate::domain::process::ProcessId;
    use crate::domain::step::{Approver, ProcessStep, StepId};
    use crate::errors::WorkflowError;

    fn step(id: i64, order: u32) -> ProcessStep {
        let now = Utc::now();
        ProcessStep {
            id: StepId(id),
            process_id: ProcessId(1),
            order,
            approver: Approver::User(UserId(id)),
            description: format!("step {id}"),
            timeout_days: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn ids(raw: &[i64]) -> Vec<StepId> {
        raw.iter().map(|id| StepId(*id)).collect()
    }

    #[test]
    fn drag_and_drop_rows_become_an_id_sequence() {
        let entries = [
            ReorderEntry { id: StepId(30), order: 1 },
            ReorderEntry { id: StepId(10), order: 2 },
            ReorderEntry { id: StepId(20), order: 3 },
        ];
        assert_eq!(sequence_from_entries(&entries), Ok(ids(&[30, 10, 20])));

        let sparse = [
            ReorderEntry { id: StepId(10), order: 40 },
            ReorderEntry { id: StepId(20), order: 5 },
        ];
        assert_eq!(sequence_from_entries(&sparse), Ok(ids(&[20, 10])));
    }

    #[test]
    fn duplicate_order_values_are_rejected() {
        let entries =
            [ReorderEntry { id: StepId(10), order: 1 }, ReorderEntry { id: StepId(20), order: 1 }];
        assert!(matches!(
            sequence_from_entries(&entries),
            Err(WorkflowError::Validation { field: "steps", .. })
        ));
    }

    #[test]
    fn reorder_moves_last_step_first() {
        let steps = vec![step(10, 1), step(20, 2), step(30, 3)];
        let reordered = renumber(ProcessId(1), steps, &ids(&[30, 10, 20])).expect("permutation");

        let view: Vec<(i64, u32)> = reordered.iter().map(|s| (s.id.0, s.order)).collect();
        assert_eq!(view, vec![(30, 1), (10, 2), (20, 3)]);
    }

    #[test]
    fn foreign_step_id_is_reported_as_extra() {
        let result = ensure_permutation(ProcessId(1), &ids(&[10, 20, 30]), &ids(&[10, 20, 99]));
        assert_eq!(
            result,
            Err(WorkflowError::InvalidReorder {
                process: ProcessId(1),
                missing: ids(&[30]),
                extra: ids(&[99]),
                duplicates: Vec::new(),
            })
        );
    }

    #[test]
    fn repeated_id_is_reported_as_duplicate() {
        let result = ensure_permutation(ProcessId(1), &ids(&[10, 20]), &ids(&[10, 10, 20]));
        assert!(matches!(
            result,
            Err(WorkflowError::InvalidReorder { ref duplicates, .. }) if duplicates == &ids(&[10])
        ));
    }

    #[test]
    fn compact_closes_gap_preserving_relative_order() {
        let remaining = vec![step(30, 3), step(10, 1), step(40, 4)];
        let compacted = compact(remaining);

        let view: Vec<(i64, u32)> = compacted.iter().map(|s| (s.id.0, s.order)).collect();
        assert_eq!(view, vec![(10, 1), (30, 2), (40, 3)]);
        assert!(is_gap_free(&compacted));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Add,
        Remove(usize),
        Reorder { rotate: usize, reverse: bool },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Add),
            any::<usize>().prop_map(Op::Remove),
            (any::<usize>(), any::<bool>())
                .prop_map(|(rotate, reverse)| Op::Reorder { rotate, reverse }),
        ]
    }

    proptest! {
        /// Property: any mix of add/remove/reorder leaves orders at exactly 1..=N
        #[test]
        fn orders_stay_gap_free(ops in proptest::collection::vec(op_strategy(), 0..40)) {
            let mut steps: Vec<ProcessStep> = Vec::new();
            let mut next_id = 1;

            for op in ops {
                match op {
                    Op::Add => {
                        let order = u32::try_from(steps.len() + 1).unwrap();
                        steps.push(step(next_id, order));
                        next_id += 1;
                    }
                    Op::Remove(index) if !steps.is_empty() => {
                        let sequence = sequence_of(&steps);
                        let victim = sequence[index % sequence.len()];
                        steps.retain(|s| s.id != victim);
                        steps = compact(steps);
                    }
                    Op::Reorder { rotate, reverse } if !steps.is_empty() => {
                        let mut sequence = sequence_of(&steps);
                        let len = sequence.len();
                        sequence.rotate_left(rotate % len);
                        if reverse {
                            sequence.reverse();
                        }
                        steps = renumber(ProcessId(1), steps, &sequence).unwrap();
                    }
                    _ => {}
                }
                prop_assert!(is_gap_free(&steps), "orders drifted: {:?}", sequence_of(&steps));
            }
        }

        /// Property: applying the same permutation twice is a no-op the second time
        #[test]
        fn reorder_is_idempotent(len in 1usize..12, rotate in any::<usize>()) {
            let steps: Vec<ProcessStep> =
                (0..len).map(|i| step(i as i64 + 1, u32::try_from(i + 1).unwrap())).collect();
            let mut sequence = sequence_of(&steps);
            sequence.rotate_left(rotate % len);

            let once = renumber(ProcessId(1), steps, &sequence).unwrap();
            let twice = renumber(ProcessId(1), once.clone(), &sequence).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
