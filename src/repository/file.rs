use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ApplicationRepository, Commit, StoredApplication, order_due};
use crate::audit::HistoryEntry;
use crate::error::RepositoryError;
use crate::outbox::OutboxEntry;
use crate::state_machine::{Application, ApplicationId};

const RECORD_EXTENSION: &str = "json";

/// Durable repository keeping one JSON document per application under a
/// directory. A commit rewrites the whole document through a temp file,
/// `fsync` and `rename`, so the aggregate, its history and its outbox change
/// together or not at all, and readers never see a half-written record.
///
/// Writers are serialized within the process; a single process owns the
/// directory.
pub struct FileRepository {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRepository {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "opened file repository");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, id: ApplicationId) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    async fn read(&self, id: ApplicationId) -> Result<StoredApplication, RepositoryError> {
        let path = self.record_path(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepositoryError::NotFound(id));
            }
            Err(e) => return Err(e.into()),
        };
        let record: StoredApplication = serde_json::from_slice(&bytes)?;
        if record.application.id != id {
            return Err(RepositoryError::Corrupt(format!(
                "{} holds application {}",
                path.display(),
                record.application.id
            )));
        }
        Ok(record)
    }

    async fn write(&self, record: &StoredApplication) -> Result<(), RepositoryError> {
        let path = self.record_path(record.application.id);
        let tmp = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
        let bytes = serde_json::to_vec_pretty(record)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<StoredApplication>, RepositoryError> {
        let mut records = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<StoredApplication>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable record");
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl ApplicationRepository for FileRepository {
    async fn create(
        &self,
        application: &Application,
        entry: &HistoryEntry,
    ) -> Result<(), RepositoryError> {
        let _guard = self.write_lock.lock().await;
        if fs::try_exists(self.record_path(application.id)).await? {
            return Err(RepositoryError::AlreadyExists(application.id));
        }
        self.write(&StoredApplication::new(application, entry)).await
    }

    async fn load(&self, id: ApplicationId) -> Result<Application, RepositoryError> {
        Ok(self.read(id).await?.application)
    }

    async fn commit(&self, commit: Commit) -> Result<(), RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.read(commit.application.id).await?;
        record.apply(commit)?;
        self.write(&record).await
    }

    async fn history(&self, id: ApplicationId) -> Result<Vec<HistoryEntry>, RepositoryError> {
        Ok(self.read(id).await?.history)
    }

    async fn list(&self) -> Result<Vec<Application>, RepositoryError> {
        let mut apps: Vec<Application> = self
            .read_all()
            .await?
            .into_iter()
            .map(|r| r.application)
            .collect();
        apps.sort_by_key(|a| a.created_at);
        Ok(apps)
    }

    async fn outbox(&self, id: ApplicationId) -> Result<Vec<OutboxEntry>, RepositoryError> {
        Ok(self.read(id).await?.outbox)
    }

    async fn due_outbox(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let due = self
            .read_all()
            .await?
            .iter()
            .flat_map(|r| r.due(now).cloned().collect::<Vec<_>>())
            .collect();
        Ok(order_due(due, limit))
    }

    async fn update_outbox(&self, entry: &OutboxEntry) -> Result<(), RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.read(entry.application_id()).await?;
        record.replace_outbox(entry)?;
        self.write(&record).await
    }
}
