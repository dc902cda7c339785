//! Run counters.

use crate::event::{ApplyStatus, PruneStatus, WaitStatus};

/// Counters for one action kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActionStats {
    pub successful: usize,
    pub skipped: usize,
    pub failed: usize,
    pub timeout: usize,
}

impl ActionStats {
    pub fn total(&self) -> usize {
        self.successful + self.skipped + self.failed + self.timeout
    }
}

/// Cumulative counters of a run, attached to group-completion events and
/// used to derive the final exit state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub apply: ActionStats,
    pub prune: ActionStats,
    pub delete: ActionStats,
    pub wait: ActionStats,
}

impl RunStats {
    pub(crate) fn count_apply(&mut self, status: ApplyStatus) {
        match status {
            ApplyStatus::Successful => self.apply.successful += 1,
            ApplyStatus::Skipped => self.apply.skipped += 1,
            ApplyStatus::Failed => self.apply.failed += 1,
        }
    }

    pub(crate) fn count_prune(&mut self, status: PruneStatus) {
        match status {
            PruneStatus::Successful => self.prune.successful += 1,
            PruneStatus::Skipped => self.prune.skipped += 1,
            PruneStatus::Failed => self.prune.failed += 1,
        }
    }

    pub(crate) fn count_delete(&mut self, status: PruneStatus) {
        match status {
            PruneStatus::Successful => self.delete.successful += 1,
            PruneStatus::Skipped => self.delete.skipped += 1,
            PruneStatus::Failed => self.delete.failed += 1,
        }
    }

    pub(crate) fn count_wait(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::Successful => self.wait.successful += 1,
            WaitStatus::Skipped => self.wait.skipped += 1,
            WaitStatus::Failed => self.wait.failed += 1,
            WaitStatus::Timeout => self.wait.timeout += 1,
            WaitStatus::Pending => {}
        }
    }

    /// A run succeeded when nothing failed and nothing timed out.
    pub fn is_success(&self) -> bool {
        for stats in [self.apply, self.prune, self.delete, self.wait] {
            if stats.failed > 0 || stats.timeout > 0 {
                return false;
            }
        }
        true
    }
}
