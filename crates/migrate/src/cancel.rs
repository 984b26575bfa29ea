//! Cancellation support for database awaits

use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::error::{MigrateError, MigrateResult};

/// Run `fut` unless `cancel` fires first, in which case `fut` is dropped and
/// [`MigrateError::Cancelled`] is returned. A token that is already cancelled
/// wins without polling `fut`.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> MigrateResult<T>
where
    F: Future<Output = MigrateResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MigrateError::Cancelled),
        res = fut => res,
    }
}
