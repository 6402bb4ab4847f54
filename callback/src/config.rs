//! Configuration for the callback service

use std::net::SocketAddr;
use std::path::Path;

use keyfed_core::config::{load_json, save_json, StoreConfig};
use keyfed_core::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackServiceConfig {
    /// Address the HTTP listener binds to
    pub listen_addr: SocketAddr,

    /// Store the announced batches are recorded in
    pub store: StoreConfig,
}

impl Default for CallbackServiceConfig {
    fn default() -> Self {
        CallbackServiceConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            store: StoreConfig::default(),
        }
    }
}

impl CallbackServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        save_json(self, path)
    }
}
