use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::store::{RecordStore, StoreError};
use crate::types::{EventRecord, Run, RunStatus};

/// What an event type means for the run lifecycle: the status it implies and
/// whether it marks the run's start or end boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DerivedStatus {
    pub status: RunStatus,
    pub marks_start: bool,
    pub marks_end: bool,
}

/// Maps a free-text event type onto a run status. Case-insensitive substring
/// match in fixed priority order; the first match wins. Anything
/// unrecognized is UNKNOWN with no boundary, which tells the merge to keep
/// the run's previous status ("SUSPEND" lands here on purpose).
#[must_use]
pub fn derive_status(event_type: &str) -> DerivedStatus {
    let normalized = event_type.trim().to_uppercase();

    if normalized.contains("START") {
        return DerivedStatus {
            status: RunStatus::Running,
            marks_start: true,
            marks_end: false,
        };
    }

    if normalized.contains("FAIL") {
        return DerivedStatus {
            status: RunStatus::Failed,
            marks_start: false,
            marks_end: true,
        };
    }

    if normalized.contains("STOP") || normalized.contains("CANCEL") {
        return DerivedStatus {
            status: RunStatus::Stopped,
            marks_start: false,
            marks_end: true,
        };
    }

    if normalized.contains("FINISH") || normalized.contains("COMPLETE") || normalized.contains("END")
    {
        return DerivedStatus {
            status: RunStatus::Finished,
            marks_start: false,
            marks_end: true,
        };
    }

    DerivedStatus {
        status: RunStatus::Unknown,
        marks_start: false,
        marks_end: false,
    }
}

/// One ingested bridge event, already validated at the edge.
#[derive(Clone, Debug)]
pub struct RunEventInput {
    pub run_id: String,
    pub workspace_id: String,
    pub provider: String,
    pub event_type: String,
    pub event_ts: DateTime<Utc>,
    pub payload: Value,
}

fn payload_message(payload: &Value) -> Option<String> {
    ["message", "note", "error"]
        .iter()
        .find_map(|key| payload.get(key).and_then(Value::as_str))
        .map(|value| value.to_string())
}

/// Folds an event into the run it belongs to, creating the run on first
/// sight. Invariants:
/// - an UNKNOWN derivation preserves the previous status;
/// - `started_at`/`ended_at` are set by the first boundary-marking event and
///   preserved thereafter;
/// - `last_event_at` always advances to the event's timestamp.
#[must_use]
pub fn merge_event(existing: Option<&Run>, input: &RunEventInput) -> Run {
    let derived = derive_status(&input.event_type);

    let status = if derived.status == RunStatus::Unknown {
        existing.map_or(RunStatus::Unknown, |run| run.status)
    } else {
        derived.status
    };

    let started_at = existing
        .and_then(|run| run.started_at)
        .or_else(|| derived.marks_start.then_some(input.event_ts));
    let ended_at = existing
        .and_then(|run| run.ended_at)
        .or_else(|| derived.marks_end.then_some(input.event_ts));

    let last_message =
        payload_message(&input.payload).or_else(|| existing.and_then(|run| run.last_message.clone()));

    Run {
        id: input.run_id.clone(),
        provider: input.provider.clone(),
        workspace_id: input.workspace_id.clone(),
        status,
        started_at,
        ended_at,
        last_event_at: input.event_ts,
        last_message,
    }
}

/// Folds one verified bridge event into the record store: refreshes the run
/// it belongs to and appends the audit event. Read-modify-write, no
/// transaction; the event stream is the source of truth and replays
/// converge on the same run state.
pub async fn ingest(store: &dyn RecordStore, input: RunEventInput) -> Result<Run, StoreError> {
    let existing = store.get_run(&input.run_id).await?;
    let run = store
        .upsert_run(merge_event(existing.as_ref(), &input))
        .await?;

    store
        .append_event(EventRecord {
            id: Uuid::new_v4().to_string(),
            run_id: input.run_id,
            event_type: input.event_type,
            created_at: input.event_ts,
            payload: input.payload,
        })
        .await?;

    Ok(run)
}
