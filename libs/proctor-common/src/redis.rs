// Redis persistence of finished jobs.
//
// Scheduling is in-process; Redis only keeps results so they outlive a
// restart and can be served by any replica. Each result is written as the
// full JSON document plus its bare overall status, both with the same TTL.

use crate::types::ExecutionResult;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, RedisResult};
use uuid::Uuid;

pub const RESULT_PREFIX: &str = "proctor:result";
pub const STATUS_PREFIX: &str = "proctor:status";

/// One day
pub const RESULT_TTL_SECONDS: u64 = 86_400;

pub fn result_key(job_id: &Uuid) -> String {
    format!("{RESULT_PREFIX}:{job_id}")
}

pub fn status_key(job_id: &Uuid) -> String {
    format!("{STATUS_PREFIX}:{job_id}")
}

fn json_error(context: &'static str, e: serde_json::Error) -> RedisError {
    RedisError::from((ErrorKind::TypeError, context, e.to_string()))
}

/// Write both keys in one MULTI/EXEC so readers never see one without the
/// other.
pub async fn store_result(conn: &mut ConnectionManager, result: &ExecutionResult) -> RedisResult<()> {
    let document = serde_json::to_string(result).map_err(|e| json_error("result encoding", e))?;
    let status =
        serde_json::to_string(&result.overall_status).map_err(|e| json_error("status encoding", e))?;

    redis::pipe()
        .atomic()
        .set_ex(result_key(&result.job_id), document, RESULT_TTL_SECONDS)
        .ignore()
        .set_ex(status_key(&result.job_id), status, RESULT_TTL_SECONDS)
        .ignore()
        .query_async(conn)
        .await
}

/// `None` when the job is unknown or its result has expired
pub async fn get_result(conn: &mut ConnectionManager, job_id: &Uuid) -> RedisResult<Option<ExecutionResult>> {
    let document: Option<String> = conn.get(result_key(job_id)).await?;

    document
        .map(|d| serde_json::from_str(&d).map_err(|e| json_error("result decoding", e)))
        .transpose()
}
