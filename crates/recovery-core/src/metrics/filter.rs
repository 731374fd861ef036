use super::karte::KarteStatus;
use super::{Action, ActionStatus};
use chrono::{DateTime, SecondsFormat, Utc};

/// Typed search filter over metrics records.
///
/// Lowered to the record service's filter expression by [`ActionFilter::lower`]
/// and evaluated in-process by [`ActionFilter::matches`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ActionFilter {
    #[default]
    All,
    Kind(String),
    AssetTag(String),
    SwarmingTaskId(String),
    Status(ActionStatus),
    StartedAfter(DateTime<Utc>),
    StoppedBefore(DateTime<Utc>),
    And(Vec<ActionFilter>),
}

impl ActionFilter {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self::Kind(kind.into())
    }

    pub fn asset_tag(tag: impl Into<String>) -> Self {
        Self::AssetTag(tag.into())
    }

    pub fn swarming_task_id(id: impl Into<String>) -> Self {
        Self::SwarmingTaskId(id.into())
    }

    pub fn status(status: ActionStatus) -> Self {
        Self::Status(status)
    }

    pub fn and(self, other: ActionFilter) -> Self {
        match (self, other) {
            (Self::All, f) | (f, Self::All) => f,
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), f) => {
                left.push(f);
                Self::And(left)
            }
            (f, Self::And(mut right)) => {
                right.insert(0, f);
                Self::And(right)
            }
            (a, b) => Self::And(vec![a, b]),
        }
    }

    pub fn lower(&self) -> String {
        match self {
            Self::All => String::new(),
            Self::Kind(v) => format!("kind == {}", quote(v)),
            Self::AssetTag(v) => format!("asset_tag == {}", quote(v)),
            Self::SwarmingTaskId(v) => format!("swarming_task_id == {}", quote(v)),
            Self::Status(s) => format!("status == {}", KarteStatus::from(*s).as_str()),
            Self::StartedAfter(t) => format!("start_time > timestamp({})", quote(&rfc3339(t))),
            Self::StoppedBefore(t) => format!("stop_time < timestamp({})", quote(&rfc3339(t))),
            Self::And(parts) => parts
                .iter()
                .map(ActionFilter::lower)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" && "),
        }
    }

    pub fn matches(&self, action: &Action) -> bool {
        match self {
            Self::All => true,
            Self::Kind(v) => &action.kind == v,
            Self::AssetTag(v) => &action.asset_tag == v,
            Self::SwarmingTaskId(v) => &action.swarming_task_id == v,
            Self::Status(s) => action.status == *s,
            Self::StartedAfter(t) => action.start_time.is_some_and(|s| s > *t),
            Self::StoppedBefore(t) => action.stop_time.is_some_and(|s| s < *t),
            Self::And(parts) => parts.iter().all(|p| p.matches(action)),
        }
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn rfc3339(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
