//! Deadlines for storage and inference calls.

use std::future::Future;
use std::time::Duration;

use crate::error::{WorkerError, WorkerResult};

/// Run `fut` with a deadline, converting its error into `WorkerError`.
pub(crate) async fn bounded<T, E, F>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> WorkerResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<WorkerError>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(WorkerError::timeout(operation, after)),
    }
}
