use crate::error::{RecoveryError, Result};
use crate::plan::ActionId;
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
enum Outcome {
    Pass,
    Fail(RecoveryError),
}

/// Per-run memo of action outcomes and of which recoveries each parent used.
#[derive(Debug, Default)]
pub struct RunCache {
    outcomes: HashMap<ActionId, Outcome>,
    used_recoveries: HashSet<(ActionId, ActionId)>,
}

impl RunCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the action has no cached outcome.
    pub fn get(&self, id: ActionId) -> Option<Result<()>> {
        self.outcomes.get(&id).map(|o| match o {
            Outcome::Pass => Ok(()),
            Outcome::Fail(e) => Err(e.duplicate()),
        })
    }

    pub fn record_pass(&mut self, id: ActionId) {
        self.outcomes.insert(id, Outcome::Pass);
    }

    pub fn record_fail(&mut self, id: ActionId, err: &RecoveryError) {
        self.outcomes.insert(id, Outcome::Fail(err.duplicate()));
    }

    pub fn invalidate(&mut self, id: ActionId) {
        self.outcomes.remove(&id);
    }

    pub fn is_recovery_used(&self, parent: ActionId, recovery: ActionId) -> bool {
        self.used_recoveries.contains(&(parent, recovery))
    }

    pub fn mark_recovery_used(&mut self, parent: ActionId, recovery: ActionId) {
        self.used_recoveries.insert((parent, recovery));
    }

    /// Forget recovery usage of every parent except `parent`.
    pub fn clear_recovery_usage_except(&mut self, parent: ActionId) {
        self.used_recoveries.retain(|(p, _)| *p == parent);
    }
}
