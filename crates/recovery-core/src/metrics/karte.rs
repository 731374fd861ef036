//! Wire form of metrics records for the record service.

use super::{Action, ActionStatus, Observation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KarteStatus {
    #[default]
    StatusUnspecified,
    Success,
    Fail,
    Skip,
    #[serde(other)]
    Unknown,
}

impl KarteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            KarteStatus::StatusUnspecified | KarteStatus::Unknown => "STATUS_UNSPECIFIED",
            KarteStatus::Success => "SUCCESS",
            KarteStatus::Fail => "FAIL",
            KarteStatus::Skip => "SKIP",
        }
    }
}

impl From<ActionStatus> for KarteStatus {
    fn from(status: ActionStatus) -> Self {
        match status {
            ActionStatus::Unspecified => KarteStatus::StatusUnspecified,
            ActionStatus::Success => KarteStatus::Success,
            ActionStatus::Fail => KarteStatus::Fail,
            ActionStatus::Skip => KarteStatus::Skip,
        }
    }
}

impl From<KarteStatus> for ActionStatus {
    fn from(status: KarteStatus) -> Self {
        match status {
            KarteStatus::Success => ActionStatus::Success,
            KarteStatus::Fail => ActionStatus::Fail,
            KarteStatus::Skip => ActionStatus::Skip,
            KarteStatus::StatusUnspecified | KarteStatus::Unknown => ActionStatus::Unspecified,
        }
    }
}

/// Seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn from_datetime(t: DateTime<Utc>) -> Self {
        Self {
            seconds: t.timestamp(),
            nanos: t.timestamp_subsec_nanos() as i32,
        }
    }

    /// `None` when the value lies outside the representable range.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.seconds, u32::try_from(self.nanos).ok()?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KarteAction {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub swarming_task_id: String,
    #[serde(default)]
    pub asset_tag: String,
    #[serde(default)]
    pub start_time: Option<Timestamp>,
    #[serde(default)]
    pub stop_time: Option<Timestamp>,
    #[serde(default)]
    pub status: KarteStatus,
    #[serde(default)]
    pub fail_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KarteObservation {
    pub action_name: String,
    pub metric_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_number: Option<f64>,
}

pub fn action_to_karte(action: &Action) -> KarteAction {
    KarteAction {
        name: action.name.clone(),
        kind: action.kind.clone(),
        swarming_task_id: action.swarming_task_id.clone(),
        asset_tag: action.asset_tag.clone(),
        start_time: action.start_time.map(Timestamp::from_datetime),
        stop_time: action.stop_time.map(Timestamp::from_datetime),
        status: action.status.into(),
        fail_reason: action.fail_reason.clone(),
    }
}

/// Observations travel separately and come back empty.
pub fn karte_to_action(action: &KarteAction) -> Action {
    Action {
        name: action.name.clone(),
        kind: action.kind.clone(),
        swarming_task_id: action.swarming_task_id.clone(),
        asset_tag: action.asset_tag.clone(),
        start_time: action.start_time.and_then(Timestamp::to_datetime),
        stop_time: action.stop_time.and_then(Timestamp::to_datetime),
        status: action.status.into(),
        fail_reason: action.fail_reason.clone(),
        observations: Vec::new(),
    }
}

pub fn observation_to_karte(action_name: &str, obs: &Observation) -> KarteObservation {
    let number = match obs.value_type.as_str() {
        "int64" | "float64" => obs.value.parse::<f64>().ok(),
        _ => None,
    };
    KarteObservation {
        action_name: action_name.to_string(),
        metric_kind: obs.metric_kind.clone(),
        value_string: if number.is_none() {
            Some(obs.value.clone())
        } else {
            None
        },
        value_number: number,
    }
}
