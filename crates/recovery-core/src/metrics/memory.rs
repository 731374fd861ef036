use super::{Action, Metrics, Observation, Query, QueryResult};
use crate::error::{RecoveryError, Result};
use async_trait::async_trait;
use std::sync::Mutex;

/// In-process record store. Names are assigned on create.
#[derive(Default)]
pub struct MemoryMetrics {
    actions: Mutex<Vec<Action>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<Action> {
        self.lock().map(|a| a.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Action>>> {
        self.actions
            .lock()
            .map_err(|_| RecoveryError::Metrics("metrics store poisoned".into()))
    }
}

#[async_trait]
impl Metrics for MemoryMetrics {
    async fn create(&self, action: &mut Action) -> Result<()> {
        if action.name.is_empty() {
            action.name = uuid::Uuid::new_v4().to_string();
        }
        self.lock()?.push(action.clone());
        Ok(())
    }

    async fn update(&self, action: &Action) -> Result<()> {
        let mut actions = self.lock()?;
        let stored = actions
            .iter_mut()
            .find(|a| a.name == action.name)
            .ok_or_else(|| RecoveryError::Metrics(format!("action {} not found", action.name)))?;
        let observations = std::mem::take(&mut stored.observations);
        *stored = action.clone();
        stored.observations = observations;
        Ok(())
    }

    async fn add_observations(&self, action_name: &str, observations: &[Observation]) -> Result<()> {
        let mut actions = self.lock()?;
        let stored = actions
            .iter_mut()
            .find(|a| a.name == action_name)
            .ok_or_else(|| RecoveryError::Metrics(format!("action {action_name} not found")))?;
        stored.observations.extend_from_slice(observations);
        Ok(())
    }

    async fn search(&self, query: &Query) -> Result<QueryResult> {
        let offset = match query.page_token.as_deref() {
            None | Some("") => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| RecoveryError::Metrics(format!("bad page token {token:?}")))?,
        };
        let mut matched: Vec<Action> = self
            .lock()?
            .iter()
            .filter(|a| query.filter.matches(a))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        let size = query.page_size();
        let end = offset.saturating_add(size).min(matched.len());
        let page_token = if end < matched.len() {
            end.to_string()
        } else {
            String::new()
        };
        let actions = matched.get(offset..end).map(<[Action]>::to_vec).unwrap_or_default();
        Ok(QueryResult {
            page_token,
            actions,
        })
    }
}
