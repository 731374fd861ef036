//! Scripted capability fakes shared by the unit tests.

use crate::dut::Dut;
use crate::error::{RecoveryError, Result};
use crate::tlw::{command_line, Access, Pinger, Runner, Servod, ServodValue};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Event log shared between fakes so a test can assert interleaving across
/// the runner and servod. Entries read `run <line>` and `set <control>:<value>`.
pub type Trace = Arc<Mutex<Vec<String>>>;

pub fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

// ---------------------------------------------------------------------------
// FakeRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Reply {
    Ok(String),
    Fail(i32, String),
    /// Non-zero exit after printing some output.
    FailWithOutput(i32, String),
    NoExitStatus,
    Timeout,
}

impl Reply {
    pub fn ok(out: &str) -> Self {
        Reply::Ok(out.to_string())
    }

    pub fn fail(code: i32) -> Self {
        Reply::Fail(code, "failed".to_string())
    }

    pub fn fail_with_output(code: i32, out: &str) -> Self {
        Reply::FailWithOutput(code, out.to_string())
    }

    fn into_result(self, line: &str) -> Result<String> {
        match self {
            Reply::Ok(out) => Ok(out),
            Reply::Fail(code, stderr) => Err(RecoveryError::RemoteExec {
                command: line.to_string(),
                exit_code: code,
                stdout: String::new(),
                stderr,
            }),
            Reply::FailWithOutput(code, stdout) => Err(RecoveryError::RemoteExec {
                command: line.to_string(),
                exit_code: code,
                stdout,
                stderr: "failed".to_string(),
            }),
            Reply::NoExitStatus => Err(RecoveryError::NoExitStatus {
                command: line.to_string(),
            }),
            Reply::Timeout => Err(RecoveryError::Timeout(line.to_string())),
        }
    }
}

struct Rule {
    prefix: String,
    replies: Vec<Reply>,
}

/// Matches command lines by prefix, first registered rule wins. A rule with
/// several replies hands them out in order and repeats the last one.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    trace: Mutex<Option<Trace>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, prefix: &str, reply: Reply) -> &Self {
        self.on_seq(prefix, vec![reply])
    }

    pub fn on_seq(&self, prefix: &str, replies: Vec<Reply>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            replies,
        });
        self
    }

    pub fn trace_to(&self, trace: &Trace) -> &Self {
        *self.trace.lock().unwrap() = Some(trace.clone());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }
}

#[async_trait]
impl Runner for FakeRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        _timeout: Duration,
        cmd: &str,
        args: &[&str],
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(RecoveryError::Cancelled);
        }
        let line = command_line(cmd, args);
        self.calls.lock().unwrap().push(line.clone());
        if let Some(trace) = self.trace.lock().unwrap().as_ref() {
            trace.lock().unwrap().push(format!("run {line}"));
        }
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if line.starts_with(&rule.prefix) {
                let reply = if rule.replies.len() > 1 {
                    rule.replies.remove(0)
                } else {
                    rule.replies[0].clone()
                };
                return reply.into_result(&line);
            }
        }
        Ok(String::new())
    }
}

// ---------------------------------------------------------------------------
// FakeServod
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeServod {
    controls: Mutex<HashMap<String, ServodValue>>,
    failing_sets: Mutex<HashSet<String>>,
    sets: Mutex<Vec<(String, ServodValue)>>,
    trace: Mutex<Option<Trace>>,
}

impl FakeServod {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(self: Arc<Self>, control: &str, value: impl Into<ServodValue>) -> Arc<Self> {
        self.controls
            .lock()
            .unwrap()
            .insert(control.to_string(), value.into());
        self
    }

    pub fn trace_to(self: Arc<Self>, trace: &Trace) -> Arc<Self> {
        *self.trace.lock().unwrap() = Some(trace.clone());
        self
    }

    pub fn fail_set(&self, control: &str) {
        self.failing_sets.lock().unwrap().insert(control.to_string());
    }

    pub fn value(&self, control: &str) -> Option<ServodValue> {
        self.controls.lock().unwrap().get(control).cloned()
    }

    /// Every successful `set`, in call order.
    pub fn sets(&self) -> Vec<(String, ServodValue)> {
        self.sets.lock().unwrap().clone()
    }
}

#[async_trait]
impl Servod for FakeServod {
    async fn get(&self, _cancel: &CancellationToken, control: &str) -> Result<ServodValue> {
        self.value(control)
            .ok_or_else(|| RecoveryError::ServodControlMissing(control.to_string()))
    }

    async fn set(
        &self,
        _cancel: &CancellationToken,
        control: &str,
        value: ServodValue,
    ) -> Result<()> {
        if self.failing_sets.lock().unwrap().contains(control) {
            return Err(RecoveryError::Servod(format!("set {control} failed")));
        }
        self.sets
            .lock()
            .unwrap()
            .push((control.to_string(), value.clone()));
        if let Some(trace) = self.trace.lock().unwrap().as_ref() {
            trace.lock().unwrap().push(format!("set {control}:{value}"));
        }
        self.controls
            .lock()
            .unwrap()
            .insert(control.to_string(), value);
        Ok(())
    }

    async fn has(&self, _cancel: &CancellationToken, control: &str) -> Result<()> {
        if self.controls.lock().unwrap().contains_key(control) {
            Ok(())
        } else {
            Err(RecoveryError::ServodControlMissing(control.to_string()))
        }
    }

    fn port(&self) -> u16 {
        9999
    }
}

// ---------------------------------------------------------------------------
// FakePinger
// ---------------------------------------------------------------------------

pub struct FakePinger {
    replies: Mutex<Vec<bool>>,
    count: Mutex<usize>,
}

impl FakePinger {
    /// Replies are consumed in order; the last one repeats.
    pub fn new(replies: Vec<bool>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies),
            count: Mutex::new(0),
        })
    }

    pub fn pings(&self) -> usize {
        *self.count.lock().unwrap()
    }
}

#[async_trait]
impl Pinger for FakePinger {
    async fn ping(&self, _cancel: &CancellationToken, _count: u32) -> Result<()> {
        *self.count.lock().unwrap() += 1;
        let mut replies = self.replies.lock().unwrap();
        let ok = if replies.len() > 1 {
            replies.remove(0)
        } else {
            replies.first().copied().unwrap_or(true)
        };
        if ok {
            Ok(())
        } else {
            Err(RecoveryError::failed("no ping reply"))
        }
    }
}

// ---------------------------------------------------------------------------
// FakeAccess
// ---------------------------------------------------------------------------

pub struct FakeAccess {
    pub runners: HashMap<String, Arc<FakeRunner>>,
    pub default_runner: Arc<FakeRunner>,
    pub pinger: Arc<FakePinger>,
    pub servod: Option<Arc<FakeServod>>,
    pub duts: Vec<Dut>,
}

impl FakeAccess {
    pub fn new(dut: Dut) -> Self {
        Self {
            runners: HashMap::new(),
            default_runner: FakeRunner::new(),
            pinger: FakePinger::new(vec![true]),
            servod: None,
            duts: vec![dut],
        }
    }
}

#[async_trait]
impl Access for FakeAccess {
    fn runner(&self, resource: &str) -> Arc<dyn Runner> {
        match self.runners.get(resource) {
            Some(r) => r.clone(),
            None => self.default_runner.clone(),
        }
    }

    fn pinger(&self, _resource: &str) -> Arc<dyn Pinger> {
        self.pinger.clone()
    }

    fn servod(&self, resource: &str) -> Result<Arc<dyn Servod>> {
        match &self.servod {
            Some(s) => Ok(s.clone()),
            None => Err(RecoveryError::Servod(format!("no servod for {resource}"))),
        }
    }

    async fn list_resources(&self, _unit: &str) -> Result<Vec<String>> {
        Ok(self.duts.iter().map(|d| d.name.clone()).collect())
    }

    async fn get_dut(&self, resource: &str) -> Result<Dut> {
        self.duts
            .iter()
            .find(|d| d.name == resource)
            .cloned()
            .ok_or_else(|| RecoveryError::failed(format!("device {resource} not found")))
    }
}
