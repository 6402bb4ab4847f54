//! Callback registration
//!
//! The gateway identifies a callback by the md5 hex digest of its url, so
//! registering the same url twice is a no-op.

use log::info;

use crate::config::CallbackConfig;
use crate::error::Result;
use crate::gateway::{CallbackRegistration, FederationGateway};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Disabled,
    AlreadyRegistered,
    Registered { id: String },
}

pub fn callback_id(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

/// Register the configured callback url unless the gateway already lists it
pub async fn register_callback<G: FederationGateway + ?Sized>(
    gateway: &G,
    config: &CallbackConfig,
) -> Result<RegistrationOutcome> {
    if !config.enabled {
        info!("Callback registration is disabled");
        return Ok(RegistrationOutcome::Disabled);
    }

    let registered = gateway.list_callbacks().await?;
    if registered.iter().any(|callback| callback.url == config.url) {
        info!("Callback {} is already registered", config.url);
        return Ok(RegistrationOutcome::AlreadyRegistered);
    }

    let registration = CallbackRegistration {
        id: callback_id(&config.url),
        url: config.url.clone(),
    };
    gateway.put_callback(&registration).await?;
    info!("Registered callback {} as {}", registration.url, registration.id);
    Ok(RegistrationOutcome::Registered { id: registration.id })
}
