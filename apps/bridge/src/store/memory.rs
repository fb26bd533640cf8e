use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ApprovalUpdate, RecordStore, StoreError};
use crate::types::{Approval, Device, EventRecord, Run, Workspace};

#[derive(Default)]
struct MemoryTables {
    devices: HashMap<String, Device>,
    workspaces: HashMap<String, Workspace>,
    runs: HashMap<String, Run>,
    events: HashMap<String, EventRecord>,
    approvals: HashMap<String, Approval>,
}

/// In-process record store. The default when no database is configured, and
/// what the test suite runs against.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn driver_name(&self) -> &'static str {
        "memory"
    }

    async fn create_device(&self, device: Device) -> Result<Device, StoreError> {
        let mut tables = self.tables.write().await;
        tables.devices.insert(device.id.clone(), device.clone());
        Ok(device)
    }

    async fn get_device(&self, id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.tables.read().await.devices.get(id).cloned())
    }

    async fn create_workspace(&self, workspace: Workspace) -> Result<Workspace, StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .workspaces
            .insert(workspace.id.clone(), workspace.clone());
        Ok(workspace)
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, StoreError> {
        Ok(self.tables.read().await.workspaces.get(id).cloned())
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError> {
        Ok(self.tables.read().await.runs.get(id).cloned())
    }

    async fn upsert_run(&self, run: Run) -> Result<Run, StoreError> {
        let mut tables = self.tables.write().await;
        tables.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn append_event(&self, event: EventRecord) -> Result<EventRecord, StoreError> {
        let mut tables = self.tables.write().await;
        tables.events.insert(event.id.clone(), event.clone());
        Ok(event)
    }

    async fn create_approval(&self, approval: Approval) -> Result<Approval, StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .approvals
            .insert(approval.id.clone(), approval.clone());
        Ok(approval)
    }

    async fn get_approval(&self, id: &str) -> Result<Option<Approval>, StoreError> {
        Ok(self.tables.read().await.approvals.get(id).cloned())
    }

    async fn update_approval(
        &self,
        id: &str,
        update: ApprovalUpdate,
    ) -> Result<Option<Approval>, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(approval) = tables.approvals.get_mut(id) else {
            return Ok(None);
        };
        update.apply(approval);
        Ok(Some(approval.clone()))
    }
}
