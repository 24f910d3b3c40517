use lib_chat::{BroadcastEngine, EngineError, MessageBus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs the broadcast engine against `bus` until shutdown or a fatal error.
pub async fn run(
    engine: Arc<BroadcastEngine>,
    bus: Arc<dyn MessageBus>,
    shutdown: CancellationToken,
) -> Result<(), EngineError> {
    log::info!("Upstream: relaying topic '{}'", engine.topic());

    match engine.start(bus.as_ref(), shutdown).await {
        Ok(()) => {
            log::info!("Upstream stopped.");
            Ok(())
        }
        Err(e) => {
            log::error!("Upstream failed: {}", e);
            Err(e)
        }
    }
}
