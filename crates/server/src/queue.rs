//! Three-state lifecycle queue over batch ids.
//!
//! `free` and `done` are min-heaps so the smallest id always pops first:
//! reissued (older) batches jump the line, and the client drains results
//! roughly in dispatch order. `working` maps each claimed id to the model
//! state version at dispatch time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Queue-side verdict on an adversarial submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Moved to `done`; caller must store the adversarial bytes.
    Accepted,
    /// Exceeded `max_patience` state ticks; id recycled to `free`.
    Stale,
    /// `done` is at `queue_limit`; id recycled to `free`.
    Dropped,
    /// Id is not in `working` (reaped, duplicate, or pre-reset); no-op.
    Unknown,
}

#[derive(Debug, Default)]
pub struct BatchQueue {
    free: BinaryHeap<Reverse<u64>>,
    working: HashMap<u64, u64>,
    done: BinaryHeap<Reverse<u64>>,
}

impl BatchQueue {
    pub fn enqueue_free(&mut self, id: u64) {
        self.free.push(Reverse(id));
    }

    /// Pops the smallest free id and records the dispatch-time state version.
    pub fn claim_clean(&mut self, current_state_id: u64) -> Option<u64> {
        let Reverse(id) = self.free.pop()?;
        self.working.insert(id, current_state_id);
        Some(id)
    }

    /// Admission check for a returned adversarial batch. Only moves ids
    /// between queues; byte replacement on `Accepted` is the caller's job.
    pub fn admit_adv(
        &mut self,
        id: u64,
        current_state_id: u64,
        max_patience: u64,
        done_limit: u64,
    ) -> SubmitOutcome {
        let Some(dispatched_at) = self.working.get(&id).copied() else {
            return SubmitOutcome::Unknown;
        };

        if current_state_id.saturating_sub(dispatched_at) > max_patience {
            self.working.remove(&id);
            self.free.push(Reverse(id));
            return SubmitOutcome::Stale;
        }
        if self.done.len() as u64 >= done_limit {
            self.working.remove(&id);
            self.free.push(Reverse(id));
            return SubmitOutcome::Dropped;
        }

        self.working.remove(&id);
        self.done.push(Reverse(id));
        SubmitOutcome::Accepted
    }

    pub fn take_done(&mut self) -> Option<u64> {
        self.done.pop().map(|Reverse(id)| id)
    }

    pub fn dispatch_version(&self, id: u64) -> Option<u64> {
        self.working.get(&id).copied()
    }

    /// Returns every `working` id whose dispatch version has fallen more than
    /// `max_patience` ticks behind, moving each back to `free`.
    pub fn reap_stale(&mut self, current_state_id: u64, max_patience: u64) -> Vec<u64> {
        let expired: Vec<u64> = self
            .working
            .iter()
            .filter(|(_, dispatched_at)| {
                current_state_id.saturating_sub(**dispatched_at) > max_patience
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.working.remove(id);
            self.free.push(Reverse(*id));
        }
        expired
    }

    /// Moves every working and done id back to `free`, returning the ids that
    /// were in `done` (their stored bytes are adversarial and must be
    /// restored from the shadow copies by the caller).
    pub fn reassign_all_to_free(&mut self) -> Vec<u64> {
        for (id, _) in self.working.drain() {
            self.free.push(Reverse(id));
        }
        let was_done: Vec<u64> = std::mem::take(&mut self.done)
            .into_iter()
            .map(|Reverse(id)| id)
            .collect();
        for id in &was_done {
            self.free.push(Reverse(*id));
        }
        was_done
    }

    pub fn clear(&mut self) {
        self.free.clear();
        self.working.clear();
        self.done.clear();
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn working_len(&self) -> usize {
        self.working.len()
    }

    pub fn done_len(&self) -> usize {
        self.done.len()
    }
}
