//! Pairing decisions when no UI is attached.

use btsink_bluetooth::{PairingAgent, PairingEvent, PendingPairingRequest};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Follow pairing events, accepting every request when `auto_accept` is set.
///
/// Otherwise requests are only logged and run into their deadline.
pub fn spawn_headless_policy(agent: &PairingAgent, auto_accept: bool) -> JoinHandle<()> {
    tokio::spawn(run(agent.subscribe(), auto_accept))
}

async fn run(mut events: Receiver<PairingEvent>, auto_accept: bool) {
    loop {
        match events.recv().await {
            Ok(PairingEvent::Requested(request, handle)) => {
                if request.kind.is_display() {
                    info!("Pairing code for {}: {}", request.device_name, code(&request));
                } else if auto_accept {
                    info!("Auto-accepting {:?} from {}", request.kind, request.device_name);
                    handle.accept().await;
                } else {
                    info!(
                        "Pairing request from {} ({:?} {}) awaiting decision until {}",
                        request.device_name,
                        request.kind,
                        code(&request),
                        request.deadline.format("%H:%M:%S")
                    );
                }
            }
            Ok(PairingEvent::Resolved { address, outcome }) => {
                debug!("Pairing request for {} resolved: {:?}", address, outcome);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} pairing events", skipped);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn code(request: &PendingPairingRequest) -> &str {
    request.value.as_deref().unwrap_or("-")
}
