use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{Approval, ApprovalStatus, Device, EventRecord, Run, Workspace};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{message}")]
    Persistence { message: String },
}

impl StoreError {
    pub(crate) fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }
}

/// Partial update applied to an approval by a decision. Fields left as
/// `None` keep their stored value.
#[derive(Clone, Debug, Default)]
pub struct ApprovalUpdate {
    pub status: Option<ApprovalStatus>,
    pub note: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by_device_id: Option<String>,
}

impl ApprovalUpdate {
    pub(crate) fn apply(self, approval: &mut Approval) {
        if let Some(status) = self.status {
            approval.status = status;
        }
        if let Some(note) = self.note {
            approval.note = Some(note);
        }
        if let Some(decided_at) = self.decided_at {
            approval.decided_at = Some(decided_at);
        }
        if let Some(device_id) = self.decided_by_device_id {
            approval.decided_by_device_id = Some(device_id);
        }
    }
}

/// The system of record for devices, workspaces, runs, events and
/// approvals: plain create/read/update/upsert keyed by opaque string ids.
/// Two implementations exist, selected at startup: [`MemoryStore`] for
/// development and tests, [`PgStore`] when a database URL is configured.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn driver_name(&self) -> &'static str;

    async fn create_device(&self, device: Device) -> Result<Device, StoreError>;
    async fn get_device(&self, id: &str) -> Result<Option<Device>, StoreError>;

    async fn create_workspace(&self, workspace: Workspace) -> Result<Workspace, StoreError>;
    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, StoreError>;

    async fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError>;
    async fn upsert_run(&self, run: Run) -> Result<Run, StoreError>;

    async fn append_event(&self, event: EventRecord) -> Result<EventRecord, StoreError>;

    async fn create_approval(&self, approval: Approval) -> Result<Approval, StoreError>;
    async fn get_approval(&self, id: &str) -> Result<Option<Approval>, StoreError>;
    async fn update_approval(
        &self,
        id: &str,
        update: ApprovalUpdate,
    ) -> Result<Option<Approval>, StoreError>;
}
