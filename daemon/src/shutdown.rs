use std::{future::Future, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::delivery::DeliveryPipeline;

/// Graceful-shutdown future for the HTTP server.
///
/// Once `signal` resolves, background tasks are cancelled and every queued
/// message is rejected before the server starts draining connections, so
/// callers parked on the queue answer immediately.
pub async fn on_signal(
    signal: impl Future<Output = ()>,
    pipeline: Arc<DeliveryPipeline>,
    background: CancellationToken,
) {
    signal.await;
    info!(queued = pipeline.queue_depth(), "shutdown requested");
    background.cancel();
    pipeline.shutdown();
}
