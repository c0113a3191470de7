//! Background streaming task.
//!
//! One task per table, spawned at startup and cancelled by shutdown. The
//! task holds only a weak handle to the engine: the engine exclusively owns
//! the task handle and deactivates it before dropping, so the weak upgrade
//! failing means the table is gone and the loop exits.

use std::sync::Weak;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::EngineInner;

pub(crate) async fn run_streaming_loop(engine: Weak<EngineInner>, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let Some(engine) = engine.upgrade() else {
            break;
        };
        let delay_ms = engine.tick().await;
        drop(engine);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }
    }
    debug!("Streaming task exited");
}
