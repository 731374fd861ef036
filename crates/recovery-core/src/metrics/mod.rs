//! Metrics records emitted for every executed action and plan, their
//! translation to the record service wire form and the query surface.

pub mod filter;
pub mod karte;
pub mod memory;

pub use filter::ActionFilter;
pub use karte::{action_to_karte, karte_to_action, KarteAction, KarteStatus, Timestamp};
pub use memory::MemoryMetrics;

use crate::error::{RecoveryError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Page size used when a query does not set a limit.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

// ---------------------------------------------------------------------------
// ActionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Unspecified,
    Success,
    Fail,
    Skip,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Unspecified => "unspecified",
            ActionStatus::Success => "success",
            ActionStatus::Fail => "fail",
            ActionStatus::Skip => "skip",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unspecified" => Ok(ActionStatus::Unspecified),
            "success" => Ok(ActionStatus::Success),
            "fail" => Ok(ActionStatus::Fail),
            "skip" => Ok(ActionStatus::Skip),
            other => Err(RecoveryError::usage(format!("unknown action status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub metric_kind: String,
    /// `string`, `int64` or `float64`.
    pub value_type: String,
    pub value: String,
}

impl Observation {
    pub fn string(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            metric_kind: kind.into(),
            value_type: "string".to_string(),
            value: value.into(),
        }
    }

    pub fn int64(kind: impl Into<String>, value: i64) -> Self {
        Self {
            metric_kind: kind.into(),
            value_type: "int64".to_string(),
            value: value.to_string(),
        }
    }

    pub fn float64(kind: impl Into<String>, value: f64) -> Self {
        Self {
            metric_kind: kind.into(),
            value_type: "float64".to_string(),
            value: value.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// One metrics record. Absent times are the zero value and stay absent on the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub swarming_task_id: String,
    #[serde(default)]
    pub asset_tag: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default)]
    pub fail_reason: String,
    #[serde(default)]
    pub observations: Vec<Observation>,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Stamp the stop time and derive status from `result`.
    pub fn finish<E: fmt::Display>(&mut self, result: std::result::Result<(), E>) {
        self.stop_time = Some(Utc::now());
        match result {
            Ok(()) => self.status = ActionStatus::Success,
            Err(e) => {
                self.status = ActionStatus::Fail;
                self.fail_reason = e.to_string();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filter: ActionFilter,
    pub limit: Option<usize>,
    pub page_token: Option<String>,
}

impl Query {
    pub fn new(filter: ActionFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// A zero limit means the default page size.
    pub fn page_size(&self) -> usize {
        match self.limit {
            None | Some(0) => DEFAULT_PAGE_SIZE,
            Some(limit) => limit,
        }
    }

    /// Filter string the record service understands.
    pub fn lower(&self) -> String {
        self.filter.lower()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Empty when there are no further pages.
    pub page_token: String,
    /// Most recent first.
    pub actions: Vec<Action>,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Metrics: Send + Sync {
    /// Store a new record. The stored record, with any service-assigned name,
    /// replaces `action`.
    async fn create(&self, action: &mut Action) -> Result<()>;

    /// Replace an existing record; observations are left untouched.
    async fn update(&self, action: &Action) -> Result<()>;

    /// Append observations to an existing record.
    async fn add_observations(&self, action_name: &str, observations: &[Observation])
        -> Result<()>;

    async fn search(&self, query: &Query) -> Result<QueryResult>;
}
