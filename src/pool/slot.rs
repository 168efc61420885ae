// ABOUTME: Worker slot - one unit of pool concurrency owning one automation instance.
// ABOUTME: Status and counters live behind a sync mutex; the instance behind an async one.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::automation::Automation;

/// Exclusive use of a slot's instance, taken when the slot is claimed.
pub(crate) type AutomationGuard = OwnedMutexGuard<Box<dyn Automation>>;

/// Where a slot is in its work cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    Idle,
    Busy,
    /// Last task failed; the slot is reclaimed by the next dispatch.
    Errored,
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotStatus::Idle => write!(f, "idle"),
            SlotStatus::Busy => write!(f, "busy"),
            SlotStatus::Errored => write!(f, "errored"),
        }
    }
}

/// Point-in-time view of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub id: usize,
    pub status: SlotStatus,
    pub completed: u64,
    pub failed: u64,
    /// Session bound for the current task, if busy.
    pub session_id: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct SlotState {
    status: SlotStatus,
    completed: u64,
    failed: u64,
    session_id: Option<String>,
    last_error: Option<String>,
}

pub(crate) struct WorkerSlot {
    id: usize,
    state: Mutex<SlotState>,
    /// Held from claim to release; never shared with another slot.
    pub(crate) automation: Arc<tokio::sync::Mutex<Box<dyn Automation>>>,
}

impl WorkerSlot {
    pub(crate) fn new(id: usize, automation: Box<dyn Automation>) -> Self {
        Self {
            id,
            state: Mutex::new(SlotState {
                status: SlotStatus::Idle,
                completed: 0,
                failed: 0,
                session_id: None,
                last_error: None,
            }),
            automation: Arc::new(tokio::sync::Mutex::new(automation)),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn status(&self) -> SlotStatus {
        self.state.lock().status
    }

    /// Mark Busy if the slot is Idle or Errored and its instance is free.
    ///
    /// Returns the status it was in along with the instance, locked until
    /// the guard drops. A drain waiting on the instance therefore waits for
    /// the claimant's task.
    pub(crate) fn try_claim(&self, session_id: &str) -> Option<(SlotStatus, AutomationGuard)> {
        let mut state = self.state.lock();
        if state.status == SlotStatus::Busy {
            return None;
        }
        let automation = self.automation.clone().try_lock_owned().ok()?;

        let previous = state.status;
        state.status = SlotStatus::Busy;
        state.session_id = Some(session_id.to_string());
        Some((previous, automation))
    }

    /// Return the slot after a task.
    pub(crate) fn finish(&self, error: Option<String>) {
        let mut state = self.state.lock();
        state.session_id = None;
        match error {
            None => {
                state.completed += 1;
                state.status = SlotStatus::Idle;
                state.last_error = None;
            }
            Some(message) => {
                state.failed += 1;
                state.status = SlotStatus::Errored;
                state.last_error = Some(message);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> SlotSnapshot {
        let state = self.state.lock();
        SlotSnapshot {
            id: self.id,
            status: state.status,
            completed: state.completed,
            failed: state.failed,
            session_id: state.session_id.clone(),
            last_error: state.last_error.clone(),
        }
    }
}
