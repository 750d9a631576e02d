//! Batch data type, §3 — tracks a flat set of task ids submitted together
//! (e.g. the children of a [`crate::canvas::Group`]) and derives overall state.

use uuid::Uuid;

use super::state::TaskState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    PartiallyComplete,
    Complete,
    CompleteWithFailures,
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub task_ids: Vec<Uuid>,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
}

impl Batch {
    pub fn new(task_ids: Vec<Uuid>) -> Self {
        let pending = task_ids.len();
        Self {
            id: Uuid::now_v7(),
            task_ids,
            completed: 0,
            failed: 0,
            pending,
        }
    }

    /// Record a terminal state observed for one member task.
    /// Returns `false` if `task_id` isn't a member of this batch.
    pub fn record(&mut self, task_id: Uuid, state: TaskState) -> bool {
        if !self.task_ids.contains(&task_id) {
            return false;
        }
        if !state.is_terminal() {
            return true;
        }
        self.pending = self.pending.saturating_sub(1);
        match state {
            TaskState::Success => self.completed += 1,
            _ => self.failed += 1,
        }
        true
    }

    pub fn progress_percent(&self) -> f64 {
        if self.task_ids.is_empty() {
            return 100.0;
        }
        let done = self.completed + self.failed;
        (done as f64 / self.task_ids.len() as f64) * 100.0
    }

    pub fn state(&self) -> BatchState {
        if self.pending == self.task_ids.len() {
            BatchState::Pending
        } else if self.pending > 0 {
            BatchState::PartiallyComplete
        } else if self.failed > 0 {
            BatchState::CompleteWithFailures
        } else {
            BatchState::Complete
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_tracks_completion_and_progress() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::now_v7()).collect();
        let mut batch = Batch::new(ids.clone());
        assert_eq!(batch.state(), BatchState::Pending);

        batch.record(ids[0], TaskState::Success);
        batch.record(ids[1], TaskState::Failure);
        assert_eq!(batch.state(), BatchState::PartiallyComplete);
        assert_eq!(batch.progress_percent(), 50.0);

        batch.record(ids[2], TaskState::Success);
        batch.record(ids[3], TaskState::Success);
        assert_eq!(batch.state(), BatchState::CompleteWithFailures);
        assert_eq!(batch.progress_percent(), 100.0);
    }

    #[test]
    fn record_ignores_non_terminal_states_and_unknown_ids() {
        let ids: Vec<Uuid> = (0..2).map(|_| Uuid::now_v7()).collect();
        let mut batch = Batch::new(ids.clone());
        assert!(batch.record(ids[0], TaskState::Started));
        assert_eq!(batch.pending, 2);
        assert!(!batch.record(Uuid::now_v7(), TaskState::Success));
    }
}
