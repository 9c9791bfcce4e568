//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// The dispatch loop. Admitted events and scheduled re-deliveries arrive over
// one mpsc command channel; each is processed on its own task so a slow or
// failing handler never stalls the loop or other events.
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::bus::BusCore;

/// Work items consumed by the dispatch loop.
#[derive(Debug)]
pub(crate) enum DispatchCommand {
    /// First delivery fan-out for an admitted event
    Dispatch { event_id: Uuid },
    /// Scheduled re-delivery to the one handler that failed
    Redeliver {
        event_id: Uuid,
        subscription_id: Uuid,
        attempt: u32,
    },
}

/// Starts the dispatch loop for a bus instance.
pub(crate) fn spawn_dispatcher(
    core: Arc<BusCore>,
    mut receiver: mpsc::Receiver<DispatchCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("event dispatcher started");

        while let Some(command) = receiver.recv().await {
            match command {
                DispatchCommand::Dispatch { event_id } => {
                    let core = Arc::clone(&core);
                    tokio::spawn(async move {
                        core.dispatch_event(event_id).await;
                    });
                }
                DispatchCommand::Redeliver {
                    event_id,
                    subscription_id,
                    attempt,
                } => {
                    let core = Arc::clone(&core);
                    tokio::spawn(async move {
                        core.redeliver(event_id, subscription_id, attempt).await;
                    });
                }
            }
        }

        info!("event dispatcher stopped");
    })
}
