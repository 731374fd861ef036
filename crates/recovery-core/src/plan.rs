use std::collections::HashMap;
use std::time::Duration;

pub const PLAN_SERVO: &str = "servo";
pub const PLAN_CROS: &str = "cros";
pub const PLAN_PERIPHERAL: &str = "peripheral";
/// Runs last for every device, whatever happened before, and never fails the run.
pub const PLAN_CLOSE: &str = "close";

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Index of an action inside its plan's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub(crate) usize);

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub exec_name: String,
    pub exec_args: Vec<String>,
    pub exec_timeout: Duration,
    /// Must all pass for the action to run; otherwise it is skipped.
    pub conditions: Vec<ActionId>,
    pub dependencies: Vec<ActionId>,
    /// Tried in order when the exec fails.
    pub recoveries: Vec<ActionId>,
    pub allow_fail: bool,
    pub allow_cache: bool,
    pub docs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Validated plan: actions live in an arena and refer to each other by id.
#[derive(Debug, Clone)]
pub struct Plan {
    pub name: String,
    pub verifiers: Vec<ActionId>,
    pub allow_fail: bool,
    actions: Vec<Action>,
    index: HashMap<String, ActionId>,
}

impl Plan {
    pub(crate) fn new(
        name: String,
        verifiers: Vec<ActionId>,
        allow_fail: bool,
        actions: Vec<Action>,
    ) -> Self {
        let index = actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name.clone(), ActionId(i)))
            .collect();
        Self {
            name,
            verifiers,
            allow_fail,
            actions,
            index,
        }
    }

    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id.0]
    }

    pub fn find(&self, name: &str) -> Option<ActionId> {
        self.index.get(name).copied()
    }

    pub fn actions(&self) -> impl Iterator<Item = (ActionId, &Action)> {
        self.actions.iter().enumerate().map(|(i, a)| (ActionId(i), a))
    }

    /// `id` plus everything reachable through dependencies and conditions.
    pub fn dependency_closure(&self, id: ActionId) -> Vec<ActionId> {
        let mut seen = vec![false; self.actions.len()];
        let mut stack = vec![id];
        let mut out = Vec::new();
        while let Some(next) = stack.pop() {
            if std::mem::replace(&mut seen[next.0], true) {
                continue;
            }
            out.push(next);
            let action = self.action(next);
            stack.extend(action.dependencies.iter().copied());
            stack.extend(action.conditions.iter().copied());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Configuration {
    pub plan_names: Vec<String>,
    plans: HashMap<String, Plan>,
}

impl Configuration {
    pub(crate) fn new(plan_names: Vec<String>, plans: HashMap<String, Plan>) -> Self {
        Self { plan_names, plans }
    }

    pub fn plan(&self, name: &str) -> Option<&Plan> {
        self.plans.get(name)
    }
}
