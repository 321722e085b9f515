use crate::types::{ExecutionRecord, OutputEvent, RunRequest};
use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

/// Redis key semantics - defines only semantics, not runtime logic.
/// Keeps every producer and consumer of the queue, the record store and the
/// live output channel agreeing on deterministic key names.

pub const QUEUE_KEY: &str = "dockyard:queue:runs";
pub const RECORD_PREFIX: &str = "dockyard:record";
pub const CANCEL_PREFIX: &str = "dockyard:cancel";
pub const EVENTS_PREFIX: &str = "dockyard:events";

/// Records and cancellation flags expire after 24 hours.
const RECORD_TTL_SECONDS: u64 = 86_400;

/// Generate the record key for an execution
pub fn record_key(execution_id: &Uuid) -> String {
    format!("{}:{}", RECORD_PREFIX, execution_id)
}

/// Generate the cancellation flag key for an execution
pub fn cancel_key(execution_id: &Uuid) -> String {
    format!("{}:{}", CANCEL_PREFIX, execution_id)
}

/// Generate the pub/sub channel carrying live output for an execution.
/// Subscribers are scoped per execution so output is only ever delivered
/// to the client that owns the run.
pub fn events_channel(execution_id: &Uuid) -> String {
    format!("{}:{}", EVENTS_PREFIX, execution_id)
}

fn serde_err(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "serialization error",
        e.to_string(),
    ))
}

/// Push a run request onto the queue. RPUSH for FIFO semantics.
pub async fn push_run(
    conn: &mut redis::aio::ConnectionManager,
    request: &RunRequest,
) -> RedisResult<()> {
    let payload = serde_json::to_string(request).map_err(serde_err)?;
    conn.rpush(QUEUE_KEY, payload).await
}

/// Pop a run request from the queue. BLPOP with a timeout so the worker
/// loop can poll its shutdown signal.
pub async fn pop_run(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<RunRequest>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;
    match result {
        Some((_key, payload)) => {
            let request: RunRequest = serde_json::from_str(&payload).map_err(serde_err)?;
            Ok(Some(request))
        }
        None => Ok(None),
    }
}

/// Persist an execution record (created on queue, updated on every status
/// transition; the orchestrator is the only writer during a run).
pub async fn store_record(
    conn: &mut redis::aio::ConnectionManager,
    record: &ExecutionRecord,
) -> RedisResult<()> {
    let payload = serde_json::to_string(record).map_err(serde_err)?;
    let _: () = conn
        .set_ex(record_key(&record.id), payload, RECORD_TTL_SECONDS)
        .await?;
    Ok(())
}

/// Fetch an execution record, if one exists.
pub async fn get_record(
    conn: &mut redis::aio::ConnectionManager,
    execution_id: &Uuid,
) -> RedisResult<Option<ExecutionRecord>> {
    let payload: Option<String> = conn.get(record_key(execution_id)).await?;
    match payload {
        Some(data) => {
            let record: ExecutionRecord = serde_json::from_str(&data).map_err(serde_err)?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Raise the cancellation flag for an execution. Covers the window where a
/// cancel arrives while the request is still queued and has no process yet.
pub async fn request_cancel(
    conn: &mut redis::aio::ConnectionManager,
    execution_id: &Uuid,
) -> RedisResult<()> {
    let _: () = conn
        .set_ex(cancel_key(execution_id), "1", RECORD_TTL_SECONDS)
        .await?;
    Ok(())
}

/// Check whether cancellation was requested for an execution.
pub async fn is_cancelled(
    conn: &mut redis::aio::ConnectionManager,
    execution_id: &Uuid,
) -> RedisResult<bool> {
    conn.exists(cancel_key(execution_id)).await
}

/// Publish a live output event on the execution's channel.
pub async fn publish_event(
    conn: &mut redis::aio::ConnectionManager,
    event: &OutputEvent,
) -> RedisResult<()> {
    let payload = serde_json::to_string(event).map_err(serde_err)?;
    let _: () = conn
        .publish(events_channel(&event.execution_id), payload)
        .await?;
    Ok(())
}
