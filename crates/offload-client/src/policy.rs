use std::{
    cmp::Ordering,
    sync::{Mutex, MutexGuard},
};

use rand::Rng;

use crate::SpawnError;

/// How the pool picks a node for each spawn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Placement {
    /// Uniform over every registered node.
    #[default]
    Random,
    /// Round-robin over registration order.
    Incremental,
    /// Round-robin restricted to nodes with a known load sample, ordered
    /// by descending mean per-core utilization — busiest first; ties stay
    /// in registration order. Falls back to the first registered node
    /// while no sample exists.
    Balancing,
}

/// Round-robin positions. Cursors only advance; the modulo keeps them
/// valid when the candidate set changes size between spawns.
#[derive(Debug, Default)]
pub(crate) struct PlacementCursors {
    incremental: Mutex<usize>,
    balancing: Mutex<usize>,
}

/// One registered node as the policy sees it, in registration order.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Candidate {
    pub mean_load: Option<f32>,
}

/// Picks the index of the node to spawn on.
pub(crate) fn pick(
    policy: Placement,
    cursors: &PlacementCursors,
    candidates: &[Candidate],
) -> Result<usize, SpawnError> {
    if candidates.is_empty() {
        return Err(SpawnError::NoNodeAvailable);
    }
    match policy {
        Placement::Random => Ok(rand::thread_rng().gen_range(0..candidates.len())),
        Placement::Incremental => {
            let mut cursor = lock(&cursors.incremental);
            let index = *cursor % candidates.len();
            *cursor = (index + 1) % candidates.len();
            Ok(index)
        }
        Placement::Balancing => {
            let mut sampled: Vec<(usize, f32)> = candidates
                .iter()
                .enumerate()
                .filter_map(|(index, candidate)| candidate.mean_load.map(|mean| (index, mean)))
                .collect();
            if sampled.is_empty() {
                return Ok(0);
            }
            // Descending by mean; the sort is stable, so equal means keep
            // registration order.
            sampled.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
            let mut cursor = lock(&cursors.balancing);
            let slot = *cursor % sampled.len();
            *cursor = (slot + 1) % sampled.len();
            Ok(sampled[slot].0)
        }
    }
}

fn lock(cursor: &Mutex<usize>) -> MutexGuard<'_, usize> {
    cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
