pub mod clickhouse;

use std::future::Future;

use crate::batch::Batch;
use crate::errors::SinkError;

/// Destination table with identity-keyed, latest-`updated_at`-wins merge.
///
/// Redelivering a record that is the same as, or older than, the stored
/// version must not change what readers eventually see. This is what makes a
/// replay after a failed run safe.
pub trait SinkLoader {
    /// Creates the target table if it does not exist. Idempotent.
    fn prepare(&self) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Writes the whole batch or fails as a whole. An empty batch is a no-op.
    fn load(&self, batch: &Batch) -> impl Future<Output = Result<(), SinkError>> + Send;
}
