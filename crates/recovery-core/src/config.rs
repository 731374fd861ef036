use crate::error::{RecoveryError, Result};
use crate::exec::ExecRegistry;
use crate::plan::{Action, ActionId, Configuration, Plan, DEFAULT_EXEC_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigFile
// ---------------------------------------------------------------------------

/// Plans as written in YAML. [`ConfigFile::validate`] turns this into the
/// [`Configuration`] the engine runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Run order. The closing plan always runs last wherever it is listed.
    #[serde(default)]
    pub plan_names: Vec<String>,
    #[serde(default)]
    pub plans: BTreeMap<String, PlanDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDef {
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_fail: bool,
    #[serde(default)]
    pub verifiers: Vec<String>,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDef {
    pub name: String,
    /// Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exec_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recoveries: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_fail: bool,
    #[serde(default = "default_allow_cache")]
    pub allow_cache: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docs: Vec<String>,
}

fn default_allow_cache() -> bool {
    true
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl ActionDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exec_name: None,
            exec_args: Vec::new(),
            exec_timeout_secs: None,
            conditions: Vec::new(),
            dependencies: Vec::new(),
            recoveries: Vec::new(),
            allow_fail: false,
            allow_cache: true,
            docs: Vec::new(),
        }
    }

    pub fn exec(mut self, exec_name: impl Into<String>) -> Self {
        self.exec_name = Some(exec_name.into());
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.exec_args = strings(args);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.exec_timeout_secs = Some(secs);
        self
    }

    pub fn conditions(mut self, names: &[&str]) -> Self {
        self.conditions = strings(names);
        self
    }

    pub fn deps(mut self, names: &[&str]) -> Self {
        self.dependencies = strings(names);
        self
    }

    pub fn recoveries(mut self, names: &[&str]) -> Self {
        self.recoveries = strings(names);
        self
    }

    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.allow_cache = false;
        self
    }

    pub fn doc(mut self, line: impl Into<String>) -> Self {
        self.docs.push(line.into());
        self
    }

    pub fn exec_name(&self) -> &str {
        self.exec_name.as_deref().unwrap_or(&self.name)
    }

    fn edges(&self) -> impl Iterator<Item = &String> {
        self.dependencies
            .iter()
            .chain(&self.recoveries)
            .chain(&self.conditions)
    }
}

impl PlanDef {
    pub fn new(verifiers: &[&str], actions: Vec<ActionDef>) -> Self {
        Self {
            allow_fail: false,
            verifiers: strings(verifiers),
            actions,
        }
    }

    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }
}

impl ConfigFile {
    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
            .map_err(|e| RecoveryError::Config(format!("{}: {e}", path.display())))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Check names, references, execs and cycles, and build the arena form.
    pub fn validate(&self, registry: &ExecRegistry) -> Result<Configuration> {
        for name in &self.plan_names {
            if !self.plans.contains_key(name) {
                return Err(RecoveryError::Config(format!(
                    "plan {name:?} is listed but not defined"
                )));
            }
        }
        let mut plans = HashMap::new();
        for (name, def) in &self.plans {
            let plan = validate_plan(name, def, registry)
                .map_err(|e| match e {
                    RecoveryError::Config(msg) => RecoveryError::Config(format!("plan {name}: {msg}")),
                    other => other,
                })?;
            plans.insert(name.clone(), plan);
        }
        Ok(Configuration::new(self.plan_names.clone(), plans))
    }
}

fn validate_plan(name: &str, def: &PlanDef, registry: &ExecRegistry) -> Result<Plan> {
    let mut index: HashMap<&str, ActionId> = HashMap::new();
    for (i, action) in def.actions.iter().enumerate() {
        if index.insert(action.name.as_str(), ActionId(i)).is_some() {
            return Err(RecoveryError::Config(format!(
                "action {:?} declared twice",
                action.name
            )));
        }
    }
    let resolve = |from: &str, target: &str| -> Result<ActionId> {
        index.get(target).copied().ok_or_else(|| {
            RecoveryError::Config(format!("{from} refers to unknown action {target:?}"))
        })
    };

    let verifiers = def
        .verifiers
        .iter()
        .map(|v| resolve("verifiers", v))
        .collect::<Result<Vec<_>>>()?;

    let mut actions = Vec::with_capacity(def.actions.len());
    for a in &def.actions {
        if !registry.contains(a.exec_name()) {
            return Err(RecoveryError::Config(format!(
                "action {:?} uses unknown exec {:?}",
                a.name,
                a.exec_name()
            )));
        }
        let refs = |names: &[String]| {
            names
                .iter()
                .map(|n| resolve(&a.name, n))
                .collect::<Result<Vec<_>>>()
        };
        actions.push(Action {
            name: a.name.clone(),
            exec_name: a.exec_name().to_string(),
            exec_args: a.exec_args.clone(),
            exec_timeout: a
                .exec_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_EXEC_TIMEOUT),
            conditions: refs(&a.conditions)?,
            dependencies: refs(&a.dependencies)?,
            recoveries: refs(&a.recoveries)?,
            allow_fail: a.allow_fail,
            allow_cache: a.allow_cache,
            docs: a.docs.clone(),
        });
    }
    check_cycles(def, &index)?;
    Ok(Plan::new(name.to_string(), verifiers, def.allow_fail, actions))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// DFS over dependency, recovery and condition edges.
fn check_cycles(def: &PlanDef, index: &HashMap<&str, ActionId>) -> Result<()> {
    fn visit(
        i: usize,
        def: &PlanDef,
        index: &HashMap<&str, ActionId>,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Result<()> {
        marks[i] = Mark::Grey;
        path.push(i);
        for target in def.actions[i].edges() {
            let j = index[target.as_str()].0;
            match marks[j] {
                Mark::Black => {}
                Mark::Grey => {
                    let start = path.iter().position(|&p| p == j).unwrap_or(0);
                    let mut names: Vec<&str> = path[start..]
                        .iter()
                        .map(|&p| def.actions[p].name.as_str())
                        .collect();
                    names.push(&def.actions[j].name);
                    return Err(RecoveryError::Config(format!(
                        "cycle: {}",
                        names.join(" -> ")
                    )));
                }
                Mark::White => visit(j, def, index, marks, path)?,
            }
        }
        path.pop();
        marks[i] = Mark::Black;
        Ok(())
    }

    let mut marks = vec![Mark::White; def.actions.len()];
    let mut path = Vec::new();
    for i in 0..def.actions.len() {
        if marks[i] == Mark::White {
            visit(i, def, index, &mut marks, &mut path)?;
        }
    }
    Ok(())
}
