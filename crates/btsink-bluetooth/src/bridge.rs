//! Registers the pairing agent with BlueZ.
//!
//! Each BlueZ agent callback is forwarded to [`PairingAgent`]. The advertised
//! I/O capability follows from which callbacks are installed.

use bluer::agent::{
    Agent, AgentHandle, AuthorizeService, DisplayPasskey, DisplayPinCode, ReqError, ReqResult,
    RequestAuthorization, RequestConfirmation, RequestPasskey, RequestPinCode,
};
use bluer::Session;
use btsink_core::PairingError;
use tracing::{debug, info, warn};

use crate::adapter::from_bluer_address;
use crate::agent::{Capability, PairingAgent};
use crate::error::{BluetoothError, Result};

/// Live registration of the pairing agent.
///
/// Dropping it (or calling [`unregister`](Self::unregister)) removes the agent
/// from BlueZ and shuts the [`PairingAgent`] down.
pub struct AgentRegistration {
    handle: Option<AgentHandle>,
    agent: PairingAgent,
}

impl AgentRegistration {
    pub fn agent(&self) -> &PairingAgent {
        &self.agent
    }

    /// Cancel pending requests and unregister.
    pub async fn unregister(mut self) {
        self.agent.cancel_all().await;
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.agent.shutdown();
            drop(handle);
            info!("Pairing agent unregistered");
        }
    }
}

impl Drop for AgentRegistration {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Register `agent` as the default BlueZ pairing agent.
pub async fn register_agent(session: &Session, agent: PairingAgent) -> Result<AgentRegistration> {
    let capability = agent.config().capability;
    let bluez_agent = build_agent(session, &agent, capability);

    let handle = session
        .register_agent(bluez_agent)
        .await
        .map_err(|e| BluetoothError::AgentRegistration(e.to_string()))?;
    info!("Pairing agent registered ({})", capability);

    Ok(AgentRegistration {
        handle: Some(handle),
        agent,
    })
}

fn build_agent(session: &Session, agent: &PairingAgent, capability: Capability) -> Agent {
    let mut bluez = Agent {
        request_default: true,
        ..Default::default()
    };

    let a = agent.clone();
    bluez.display_passkey = Some(Box::new(move |req: DisplayPasskey| {
        let agent = a.clone();
        Box::pin(async move {
            let address = from_bluer_address(req.device);
            reply(agent.on_passkey_display(&address, req.passkey, req.entered).await)
        })
    }));

    let a = agent.clone();
    bluez.display_pin_code = Some(Box::new(move |req: DisplayPinCode| {
        let agent = a.clone();
        Box::pin(async move {
            let address = from_bluer_address(req.device);
            reply(agent.on_pin_display(&address, &req.pincode).await)
        })
    }));

    let (a, s) = (agent.clone(), session.clone());
    bluez.request_authorization = Some(Box::new(move |req: RequestAuthorization| {
        let (agent, session) = (a.clone(), s.clone());
        Box::pin(async move {
            let address = from_bluer_address(req.device);
            let result = agent.on_authorization_request(&address).await;
            if result.is_ok() && agent.config().auto_trust {
                trust_in_bluez(&session, &req.adapter, req.device).await;
            }
            reply(result)
        })
    }));

    let a = agent.clone();
    bluez.authorize_service = Some(Box::new(move |req: AuthorizeService| {
        let agent = a.clone();
        Box::pin(async move {
            let address = from_bluer_address(req.device);
            reply(agent.on_authorize_service(&address, &req.service.to_string()).await)
        })
    }));

    if capability == Capability::DisplayOnly {
        return bluez;
    }

    let (a, s) = (agent.clone(), session.clone());
    bluez.request_confirmation = Some(Box::new(move |req: RequestConfirmation| {
        let (agent, session) = (a.clone(), s.clone());
        Box::pin(async move {
            let address = from_bluer_address(req.device);
            let result = agent.on_confirm_request(&address, req.passkey).await;
            if result.is_ok() && agent.config().auto_trust {
                trust_in_bluez(&session, &req.adapter, req.device).await;
            }
            reply(result)
        })
    }));

    if capability == Capability::DisplayYesNo {
        return bluez;
    }

    let (a, s) = (agent.clone(), session.clone());
    bluez.request_pin_code = Some(Box::new(move |req: RequestPinCode| {
        let (agent, session) = (a.clone(), s.clone());
        Box::pin(async move {
            let address = from_bluer_address(req.device);
            let result = agent.on_pin_request(&address).await;
            if result.is_ok() && agent.config().auto_trust {
                trust_in_bluez(&session, &req.adapter, req.device).await;
            }
            reply(result)
        })
    }));

    let (a, s) = (agent.clone(), session.clone());
    bluez.request_passkey = Some(Box::new(move |req: RequestPasskey| {
        let (agent, session) = (a.clone(), s.clone());
        Box::pin(async move {
            let address = from_bluer_address(req.device);
            let result = agent.on_passkey_request(&address).await;
            if result.is_ok() && agent.config().auto_trust {
                trust_in_bluez(&session, &req.adapter, req.device).await;
            }
            reply(result)
        })
    }));

    bluez
}

/// Map an agent answer onto the D-Bus reply.
fn reply<T>(result: std::result::Result<T, PairingError>) -> ReqResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(PairingError::Cancelled) => Err(ReqError::Canceled),
        Err(e) => {
            debug!("Replying reject: {}", e);
            Err(ReqError::Rejected)
        }
    }
}

/// Set BlueZ's own trusted flag so the device may reconnect on its own.
async fn trust_in_bluez(session: &Session, adapter: &str, device: bluer::Address) {
    let result = match session.adapter(adapter).and_then(|a| a.device(device)) {
        Ok(device) => device.set_trusted(true).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!("Failed to trust {} in BlueZ: {}", device, e);
    }
}
