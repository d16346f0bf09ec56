use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{ApplicationRepository, Commit, StoredApplication, order_due};
use crate::audit::HistoryEntry;
use crate::error::RepositoryError;
use crate::outbox::OutboxEntry;
use crate::state_machine::{Application, ApplicationId};

/// Process-local repository. Version checks and writes happen under one
/// write lock, so commits are atomic and linearizable.
#[derive(Default)]
pub struct InMemoryRepository {
    records: RwLock<HashMap<ApplicationId, StoredApplication>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApplicationRepository for InMemoryRepository {
    async fn create(
        &self,
        application: &Application,
        entry: &HistoryEntry,
    ) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&application.id) {
            return Err(RepositoryError::AlreadyExists(application.id));
        }
        records.insert(application.id, StoredApplication::new(application, entry));
        Ok(())
    }

    async fn load(&self, id: ApplicationId) -> Result<Application, RepositoryError> {
        let records = self.records.read().await;
        records
            .get(&id)
            .map(|r| r.application.clone())
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn commit(&self, commit: Commit) -> Result<(), RepositoryError> {
        let id = commit.application.id;
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        record.apply(commit)
    }

    async fn history(&self, id: ApplicationId) -> Result<Vec<HistoryEntry>, RepositoryError> {
        let records = self.records.read().await;
        records
            .get(&id)
            .map(|r| r.history.clone())
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<Application>, RepositoryError> {
        let records = self.records.read().await;
        let mut apps: Vec<Application> = records.values().map(|r| r.application.clone()).collect();
        apps.sort_by_key(|a| a.created_at);
        Ok(apps)
    }

    async fn outbox(&self, id: ApplicationId) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let records = self.records.read().await;
        records
            .get(&id)
            .map(|r| r.outbox.clone())
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn due_outbox(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let records = self.records.read().await;
        let due = records.values().flat_map(|r| r.due(now).cloned()).collect();
        Ok(order_due(due, limit))
    }

    async fn update_outbox(&self, entry: &OutboxEntry) -> Result<(), RepositoryError> {
        let id = entry.application_id();
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        record.replace_outbox(entry)
    }
}
