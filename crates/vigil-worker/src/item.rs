//! Work item contract.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Status of a work item. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Queued,
    Launched,
    Done,
    Timeout,
}

impl ItemStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Launched => 1,
            Self::Done | Self::Timeout => 2,
        }
    }

    /// Done or timed out.
    pub fn is_final(self) -> bool {
        self.rank() == 2
    }

    /// Move to `next` if it is a later status. Returns whether it moved.
    pub fn advance(&mut self, next: ItemStatus) -> bool {
        if next.rank() > self.rank() {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Result of launching an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Running; poll it with `check_finished`
    Launched,
    /// Could not start; the item finalized itself
    Failed,
    /// Could not start because the process ran out of a local resource
    /// (file descriptors). The item finalized itself and the worker must
    /// stop taking work.
    ResourceExhausted,
}

/// An item a worker executes.
pub trait WorkItem: Send {
    fn status(&self) -> ItemStatus;

    /// Start a queued item.
    fn execute(&mut self) -> LaunchOutcome;

    /// Poll a launched item; may move it to `Done` or `Timeout`.
    fn check_finished(&mut self, max_output: usize);

    /// When a launched item should next be polled.
    fn next_check(&self) -> Option<Instant>;

    /// Give up on a launched item without reporting it.
    fn abort(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_moves_forward() {
        let mut status = ItemStatus::Queued;
        assert!(status.advance(ItemStatus::Launched));
        assert!(!status.advance(ItemStatus::Queued));
        assert!(status.advance(ItemStatus::Timeout));
        assert!(!status.advance(ItemStatus::Done));
        assert_eq!(status, ItemStatus::Timeout);
        assert!(status.is_final());
    }

    #[test]
    fn test_queued_can_finish_directly() {
        let mut status = ItemStatus::default();
        assert!(status.advance(ItemStatus::Done));
        assert!(!status.advance(ItemStatus::Launched));
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&ItemStatus::Timeout).unwrap(), "\"timeout\"");
    }
}
