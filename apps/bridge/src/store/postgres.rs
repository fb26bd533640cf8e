use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};

use super::{ApprovalUpdate, RecordStore, StoreError};
use crate::types::{
    Approval, ApprovalStatus, Device, EventRecord, Platform, Run, RunStatus, Workspace,
};

const BOOTSTRAP_SQL: &str = "
CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY,
    platform TEXT NOT NULL,
    push_token TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    machine_id TEXT NOT NULL,
    display_name TEXT NOT NULL,
    project_fingerprint TEXT NOT NULL,
    bridge_secret TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TIMESTAMPTZ,
    ended_at TIMESTAMPTZ,
    last_event_at TIMESTAMPTZ NOT NULL,
    last_message TEXT
);
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    payload JSONB NOT NULL
);
CREATE TABLE IF NOT EXISTS approvals (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    status TEXT NOT NULL,
    kind TEXT NOT NULL,
    command TEXT NOT NULL,
    cwd_hash TEXT NOT NULL,
    note TEXT,
    requested_at TIMESTAMPTZ NOT NULL,
    decided_at TIMESTAMPTZ,
    decided_by_device_id TEXT
);
";

/// Durable record store over Postgres. The connection task is spawned off
/// the way the runtime holds its database handle; schema bootstrap is
/// idempotent and runs once on connect.
pub struct PgStore {
    client: Arc<Mutex<Client>>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|error| StoreError::persistence(format!("connect to postgres: {error}")))?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "bridge postgres connection error");
            }
        });

        let store = Self {
            client: Arc::new(Mutex::new(client)),
        };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        self.client
            .lock()
            .await
            .batch_execute(BOOTSTRAP_SQL)
            .await
            .map_err(|error| StoreError::persistence(format!("bootstrap schema: {error}")))
    }
}

fn query_error(context: &'static str, error: tokio_postgres::Error) -> StoreError {
    StoreError::persistence(format!("{context}: {error}"))
}

fn device_from_row(row: &Row) -> Result<Device, StoreError> {
    let platform_raw: String = row
        .try_get("platform")
        .map_err(|error| query_error("read device.platform", error))?;
    let platform = Platform::parse(&platform_raw)
        .ok_or_else(|| StoreError::persistence(format!("unknown device platform {platform_raw}")))?;
    Ok(Device {
        id: row
            .try_get("id")
            .map_err(|error| query_error("read device.id", error))?,
        platform,
        push_token: row
            .try_get("push_token")
            .map_err(|error| query_error("read device.push_token", error))?,
        created_at: row
            .try_get("created_at")
            .map_err(|error| query_error("read device.created_at", error))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|error| query_error("read device.updated_at", error))?,
    })
}

fn workspace_from_row(row: &Row) -> Result<Workspace, StoreError> {
    Ok(Workspace {
        id: row
            .try_get("id")
            .map_err(|error| query_error("read workspace.id", error))?,
        device_id: row
            .try_get("device_id")
            .map_err(|error| query_error("read workspace.device_id", error))?,
        machine_id: row
            .try_get("machine_id")
            .map_err(|error| query_error("read workspace.machine_id", error))?,
        display_name: row
            .try_get("display_name")
            .map_err(|error| query_error("read workspace.display_name", error))?,
        project_fingerprint: row
            .try_get("project_fingerprint")
            .map_err(|error| query_error("read workspace.project_fingerprint", error))?,
        bridge_secret: row
            .try_get("bridge_secret")
            .map_err(|error| query_error("read workspace.bridge_secret", error))?,
        created_at: row
            .try_get("created_at")
            .map_err(|error| query_error("read workspace.created_at", error))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|error| query_error("read workspace.updated_at", error))?,
    })
}

fn run_from_row(row: &Row) -> Result<Run, StoreError> {
    let status_raw: String = row
        .try_get("status")
        .map_err(|error| query_error("read run.status", error))?;
    let status = RunStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::persistence(format!("unknown run status {status_raw}")))?;
    Ok(Run {
        id: row
            .try_get("id")
            .map_err(|error| query_error("read run.id", error))?,
        provider: row
            .try_get("provider")
            .map_err(|error| query_error("read run.provider", error))?,
        workspace_id: row
            .try_get("workspace_id")
            .map_err(|error| query_error("read run.workspace_id", error))?,
        status,
        started_at: row
            .try_get("started_at")
            .map_err(|error| query_error("read run.started_at", error))?,
        ended_at: row
            .try_get("ended_at")
            .map_err(|error| query_error("read run.ended_at", error))?,
        last_event_at: row
            .try_get("last_event_at")
            .map_err(|error| query_error("read run.last_event_at", error))?,
        last_message: row
            .try_get("last_message")
            .map_err(|error| query_error("read run.last_message", error))?,
    })
}

fn approval_from_row(row: &Row) -> Result<Approval, StoreError> {
    let status_raw: String = row
        .try_get("status")
        .map_err(|error| query_error("read approval.status", error))?;
    let status = ApprovalStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::persistence(format!("unknown approval status {status_raw}")))?;
    Ok(Approval {
        id: row
            .try_get("id")
            .map_err(|error| query_error("read approval.id", error))?,
        run_id: row
            .try_get("run_id")
            .map_err(|error| query_error("read approval.run_id", error))?,
        status,
        kind: row
            .try_get("kind")
            .map_err(|error| query_error("read approval.kind", error))?,
        command: row
            .try_get("command")
            .map_err(|error| query_error("read approval.command", error))?,
        cwd_hash: row
            .try_get("cwd_hash")
            .map_err(|error| query_error("read approval.cwd_hash", error))?,
        note: row
            .try_get("note")
            .map_err(|error| query_error("read approval.note", error))?,
        requested_at: row
            .try_get("requested_at")
            .map_err(|error| query_error("read approval.requested_at", error))?,
        decided_at: row
            .try_get("decided_at")
            .map_err(|error| query_error("read approval.decided_at", error))?,
        decided_by_device_id: row
            .try_get("decided_by_device_id")
            .map_err(|error| query_error("read approval.decided_by_device_id", error))?,
    })
}

#[async_trait]
impl RecordStore for PgStore {
    fn driver_name(&self) -> &'static str {
        "postgres"
    }

    async fn create_device(&self, device: Device) -> Result<Device, StoreError> {
        self.client
            .lock()
            .await
            .execute(
                "INSERT INTO devices (id, platform, push_token, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &device.id,
                    &device.platform.as_str(),
                    &device.push_token,
                    &device.created_at,
                    &device.updated_at,
                ],
            )
            .await
            .map_err(|error| query_error("insert device", error))?;
        Ok(device)
    }

    async fn get_device(&self, id: &str) -> Result<Option<Device>, StoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt("SELECT * FROM devices WHERE id = $1", &[&id])
            .await
            .map_err(|error| query_error("select device", error))?;
        row.as_ref().map(device_from_row).transpose()
    }

    async fn create_workspace(&self, workspace: Workspace) -> Result<Workspace, StoreError> {
        self.client
            .lock()
            .await
            .execute(
                "INSERT INTO workspaces
                     (id, device_id, machine_id, display_name, project_fingerprint,
                      bridge_secret, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &workspace.id,
                    &workspace.device_id,
                    &workspace.machine_id,
                    &workspace.display_name,
                    &workspace.project_fingerprint,
                    &workspace.bridge_secret,
                    &workspace.created_at,
                    &workspace.updated_at,
                ],
            )
            .await
            .map_err(|error| query_error("insert workspace", error))?;
        Ok(workspace)
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, StoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt("SELECT * FROM workspaces WHERE id = $1", &[&id])
            .await
            .map_err(|error| query_error("select workspace", error))?;
        row.as_ref().map(workspace_from_row).transpose()
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt("SELECT * FROM runs WHERE id = $1", &[&id])
            .await
            .map_err(|error| query_error("select run", error))?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn upsert_run(&self, run: Run) -> Result<Run, StoreError> {
        self.client
            .lock()
            .await
            .execute(
                "INSERT INTO runs
                     (id, provider, workspace_id, status, started_at, ended_at,
                      last_event_at, last_message)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (id) DO UPDATE SET
                     provider = EXCLUDED.provider,
                     workspace_id = EXCLUDED.workspace_id,
                     status = EXCLUDED.status,
                     started_at = EXCLUDED.started_at,
                     ended_at = EXCLUDED.ended_at,
                     last_event_at = EXCLUDED.last_event_at,
                     last_message = EXCLUDED.last_message",
                &[
                    &run.id,
                    &run.provider,
                    &run.workspace_id,
                    &run.status.as_str(),
                    &run.started_at,
                    &run.ended_at,
                    &run.last_event_at,
                    &run.last_message,
                ],
            )
            .await
            .map_err(|error| query_error("upsert run", error))?;
        Ok(run)
    }

    async fn append_event(&self, event: EventRecord) -> Result<EventRecord, StoreError> {
        self.client
            .lock()
            .await
            .execute(
                "INSERT INTO events (id, run_id, event_type, created_at, payload)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &event.id,
                    &event.run_id,
                    &event.event_type,
                    &event.created_at,
                    &event.payload,
                ],
            )
            .await
            .map_err(|error| query_error("insert event", error))?;
        Ok(event)
    }

    async fn create_approval(&self, approval: Approval) -> Result<Approval, StoreError> {
        self.client
            .lock()
            .await
            .execute(
                "INSERT INTO approvals
                     (id, run_id, status, kind, command, cwd_hash, note,
                      requested_at, decided_at, decided_by_device_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &approval.id,
                    &approval.run_id,
                    &approval.status.as_str(),
                    &approval.kind,
                    &approval.command,
                    &approval.cwd_hash,
                    &approval.note,
                    &approval.requested_at,
                    &approval.decided_at,
                    &approval.decided_by_device_id,
                ],
            )
            .await
            .map_err(|error| query_error("insert approval", error))?;
        Ok(approval)
    }

    async fn get_approval(&self, id: &str) -> Result<Option<Approval>, StoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt("SELECT * FROM approvals WHERE id = $1", &[&id])
            .await
            .map_err(|error| query_error("select approval", error))?;
        row.as_ref().map(approval_from_row).transpose()
    }

    async fn update_approval(
        &self,
        id: &str,
        update: ApprovalUpdate,
    ) -> Result<Option<Approval>, StoreError> {
        // Read-modify-write; the decision path is already idempotent above
        // this layer, so no row lock is taken.
        let Some(mut approval) = self.get_approval(id).await? else {
            return Ok(None);
        };
        update.apply(&mut approval);

        self.client
            .lock()
            .await
            .execute(
                "UPDATE approvals SET
                     status = $2,
                     note = $3,
                     decided_at = $4,
                     decided_by_device_id = $5
                 WHERE id = $1",
                &[
                    &approval.id,
                    &approval.status.as_str(),
                    &approval.note,
                    &approval.decided_at,
                    &approval.decided_by_device_id,
                ],
            )
            .await
            .map_err(|error| query_error("update approval", error))?;
        Ok(Some(approval))
    }
}
