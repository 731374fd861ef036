//! Plan engine: runs a plan's verifiers, resolving each action's conditions
//! and dependencies first and walking its recoveries when its exec fails.
//!
//! A recovery that succeeds makes the failing action return
//! `Flow::StartOver`; the plan loop then restarts from the first verifier.
//! Start-over is control flow and never surfaces as an error.

pub mod cache;

pub use cache::RunCache;

use crate::error::{RecoveryError, Result};
use crate::exec::{ActionArgs, ExecInfo, ExecRegistry, RunArgs};
use crate::metrics::Observation;
use crate::plan::{ActionId, Plan};
use crate::tlw::check_cancelled;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Start-overs one plan run may take before it is abandoned.
pub const MAX_RESTARTS: u32 = 100;

/// How long a stopped exec gets to run its cleanup before it is dropped.
pub const UNWIND_GRACE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    StartOver { parent: ActionId },
}

/// Counters reported with the plan metrics record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub restarts: u32,
    pub forgiven_failures: u32,
}

/// Run `plan` once with a fresh cache.
pub async fn run_plan(plan: &Plan, args: Arc<RunArgs>, registry: &ExecRegistry) -> Result<()> {
    let span = tracing::info_span!(parent: &args.span, "plan", plan = %plan.name);
    let record = args.start_metric(&format!("plan:{}", plan.name)).await;
    let mut engine = Engine::new(plan, args.clone(), registry);
    let result = engine.run().instrument(span).await;
    let stats = engine.stats;
    args.finish_metric(
        record,
        result.as_ref().map(|_| ()),
        &[
            Observation::int64("restarts", stats.restarts.into()),
            Observation::int64("forgiven_failures", stats.forgiven_failures.into()),
        ],
    )
    .await;
    result
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Engine<'a> {
    plan: &'a Plan,
    args: Arc<RunArgs>,
    registry: &'a ExecRegistry,
    cache: RunCache,
    stats: PlanStats,
}

impl<'a> Engine<'a> {
    fn new(plan: &'a Plan, args: Arc<RunArgs>, registry: &'a ExecRegistry) -> Self {
        Self {
            plan,
            args,
            registry,
            cache: RunCache::new(),
            stats: PlanStats::default(),
        }
    }

    async fn run(&mut self) -> Result<()> {
        let plan = self.plan;
        tracing::info!(resource = %self.args.resource_name, "plan started");
        'attempt: loop {
            for &verifier in &plan.verifiers {
                match self.run_action(verifier, self.args.enable_recovery).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::StartOver { parent }) => {
                        self.stats.restarts += 1;
                        tracing::info!(
                            restarts = self.stats.restarts,
                            "recovery succeeded, starting over"
                        );
                        if self.stats.restarts > MAX_RESTARTS {
                            return Err(RecoveryError::failed(format!(
                                "plan {}: more than {MAX_RESTARTS} restarts",
                                plan.name
                            )));
                        }
                        self.cache.clear_recovery_usage_except(parent);
                        continue 'attempt;
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        let action = plan.action(verifier);
                        if action.allow_fail {
                            tracing::info!(action = %action.name, error = %e, "verifier failed, allowed to fail");
                        } else if plan.allow_fail {
                            self.stats.forgiven_failures += 1;
                            tracing::info!(action = %action.name, error = %e, "verifier failed, plan allowed to fail");
                        } else {
                            return Err(e.context(format!("run plan {}", plan.name)));
                        }
                    }
                }
            }
            break;
        }
        tracing::info!(
            restarts = self.stats.restarts,
            forgiven_failures = self.stats.forgiven_failures,
            "plan finished"
        );
        Ok(())
    }

    fn run_action<'s>(
        &'s mut self,
        id: ActionId,
        enable_recovery: bool,
    ) -> BoxFuture<'s, Result<Flow>> {
        let plan = self.plan;
        let action = plan.action(id);
        let span = tracing::debug_span!(parent: &self.args.span, "action", name = %action.name);
        Box::pin(
            async move {
                check_cancelled(&self.args.cancel)?;
                if let Some(cached) = self.cache.get(id) {
                    tracing::debug!(pass = cached.is_ok(), "cached outcome");
                    return cached.map(|()| Flow::Continue);
                }

                for &condition in &action.conditions {
                    match self.run_action(condition, false).await {
                        Ok(Flow::Continue) => {}
                        Ok(flow) => return Ok(flow),
                        Err(e) if e.is_cancelled() => return Err(e),
                        Err(e) => {
                            tracing::info!(
                                condition = %plan.action(condition).name,
                                "condition failed, skipping"
                            );
                            let record = self.args.start_metric(&action.name).await;
                            self.args.skip_metric(record, &e).await;
                            return Ok(Flow::Continue);
                        }
                    }
                }

                for &dep in &action.dependencies {
                    match self.run_action(dep, enable_recovery).await {
                        Ok(Flow::Continue) => {}
                        Ok(flow) => return Ok(flow),
                        Err(e) if e.is_cancelled() => return Err(e),
                        Err(e) if plan.action(dep).allow_fail => {
                            tracing::debug!(
                                dependency = %plan.action(dep).name,
                                error = %e,
                                "dependency failed, allowed to fail"
                            );
                        }
                        Err(e) => {
                            return Err(e.context(format!(
                                "{}: dependency {}",
                                action.name,
                                plan.action(dep).name
                            )));
                        }
                    }
                }

                let err = match self.exec(id).await {
                    Ok(()) => {
                        if action.allow_cache {
                            self.cache.record_pass(id);
                        }
                        return Ok(Flow::Continue);
                    }
                    Err(e) => e,
                };
                if matches!(err, RecoveryError::Cancelled) {
                    return Err(err);
                }
                if enable_recovery
                    && self.args.enable_recovery
                    && !matches!(err, RecoveryError::Usage(_))
                {
                    for &recovery in &action.recoveries {
                        if self.cache.is_recovery_used(id, recovery) {
                            continue;
                        }
                        self.cache.mark_recovery_used(id, recovery);
                        let name = &plan.action(recovery).name;
                        tracing::info!(recovery = %name, "running recovery");
                        match self.run_action(recovery, false).await {
                            Ok(_) => {
                                for touched in plan.dependency_closure(id) {
                                    self.cache.invalidate(touched);
                                }
                                return Ok(Flow::StartOver { parent: id });
                            }
                            Err(e) if e.is_cancelled() => return Err(e),
                            Err(e) => {
                                tracing::debug!(recovery = %name, error = %e, "recovery failed");
                            }
                        }
                    }
                }
                if action.allow_cache {
                    self.cache.record_fail(id, &err);
                }
                Err(err)
            }
            .instrument(span),
        )
    }

    /// Invoke the action's exec under its timeout, racing cancellation.
    ///
    /// On timeout or run cancellation the exec's own token is cancelled and
    /// the exec is awaited, bounded by [`UNWIND_GRACE`], so cleanup it owns
    /// still runs.
    async fn exec(&self, id: ActionId) -> Result<()> {
        let action = self.plan.action(id);
        let exec = self.registry.get(&action.exec_name)?;
        let info = ExecInfo {
            run_args: self.args.clone(),
            cancel: self.args.cancel.child_token(),
            action_name: action.name.clone(),
            args: ActionArgs::parse(&action.exec_args),
            timeout: action.exec_timeout,
        };
        let step = self.args.steps.as_ref().map(|s| s.start_step(&action.name));
        let record = self.args.start_metric(&action.name).await;
        tracing::debug!(exec = %action.exec_name, "exec started");

        let mut run = exec.run(&info);
        let stopped = tokio::select! {
            res = &mut run => Ok(res),
            _ = self.args.cancel.cancelled() => Err(RecoveryError::Cancelled),
            _ = tokio::time::sleep(action.exec_timeout) => Err(RecoveryError::Timeout(format!(
                "exec {} exceeded {:?}",
                action.exec_name, action.exec_timeout
            ))),
        };
        let result = match stopped {
            Ok(res) => res,
            Err(reason) => {
                info.cancel().cancel();
                match tokio::time::timeout(UNWIND_GRACE, &mut run).await {
                    Ok(res) => tracing::debug!(
                        exec = %action.exec_name,
                        error = ?res.err(),
                        "exec unwound after stop"
                    ),
                    Err(_) => tracing::warn!(
                        exec = %action.exec_name,
                        "exec ignored stop, abandoning it"
                    ),
                }
                Err(reason)
            }
        };

        match &result {
            Ok(()) => tracing::info!(action = %action.name, "action passed"),
            Err(e) => tracing::info!(action = %action.name, error = %e, "action failed"),
        }
        self.args
            .finish_metric(record, result.as_ref().map(|_| ()), &[])
            .await;
        if let Some(step) = step {
            step.end(result.as_ref().err());
        }
        result
    }
}
