//! Ephemeral onion services.
//!
//! Services are created with `ADD_ONION` and live as long as the daemon's
//! control session. The registry is the only record of them on this side:
//! it tracks handles, owns their key material, and hands back a stable
//! handle per onion address.

use crate::config::{HiddenServiceConfig, KeyMaterial};
use crate::error::{Error, Result};
use crate::logging::RedactedOnion;
use crate::onion::{OnionAddress, OnionSecretKey};
use crate::tor::ControlChannel;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// A live onion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenServiceHandle {
    /// Public address.
    pub onion_address: OnionAddress,
    /// Port on the onion address.
    pub virtual_port: u16,
    /// Local port traffic is forwarded to.
    pub target_port: u16,
    /// Daemon-side identifier used for `DEL_ONION`.
    pub control_label: String,
}

struct Entry {
    handle: HiddenServiceHandle,
    secret: Option<OnionSecretKey>,
}

#[derive(Default)]
struct Inner {
    /// Keyed by control label.
    entries: HashMap<String, Entry>,
    /// Target ports of live services and of creates in flight.
    reserved: HashSet<u16>,
}

/// Registry of onion services created through one control session.
#[derive(Clone, Default)]
pub struct HiddenServiceRegistry {
    inner: Arc<Mutex<Inner>>,
}

/// Releases a target port reservation unless the create completed.
struct PortReservation<'a> {
    registry: &'a HiddenServiceRegistry,
    port: u16,
    committed: bool,
}

impl Drop for PortReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.lock().reserved.remove(&self.port);
        }
    }
}

impl HiddenServiceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reserve(&self, port: u16) -> Result<PortReservation<'_>> {
        if !self.lock().reserved.insert(port) {
            return Err(Error::PortConflict(port));
        }
        Ok(PortReservation {
            registry: self,
            port,
            committed: false,
        })
    }

    /// Create an onion service forwarding `virtual_port` to
    /// `127.0.0.1:target_port`.
    ///
    /// Fails with [`Error::PortConflict`] before contacting the daemon if
    /// another live service already targets the port.
    pub async fn create(
        &self,
        channel: &ControlChannel,
        config: &HiddenServiceConfig,
    ) -> Result<HiddenServiceHandle> {
        let mut reservation = self.reserve(config.target_port)?;

        let key_arg = match &config.key_material {
            KeyMaterial::Provided(key) => key.to_control_blob(),
            KeyMaterial::Generated => format!("NEW:{}", crate::onion::KEY_TYPE),
        };
        let cmd = format!(
            "ADD_ONION {} Port={},127.0.0.1:{}",
            key_arg, config.virtual_port, config.target_port
        );

        let reply = channel.send_command(&cmd).await?;

        let service_id = reply.value("ServiceID").ok_or_else(|| Error::Protocol {
            code: reply.code,
            message: "no ServiceID in response".into(),
        })?;
        let onion_address = match OnionAddress::parse(&service_id) {
            Ok(address) => address,
            Err(e) => {
                // The daemon created something we cannot track; take it down again.
                if let Err(del) = channel.send_command(&format!("DEL_ONION {}", service_id)).await {
                    tracing::warn!(error = %del, "Failed to remove unparseable onion service");
                }
                return Err(e);
            }
        };

        let secret = match &config.key_material {
            KeyMaterial::Provided(key) => {
                let expected = key.onion_address();
                if expected != onion_address {
                    tracing::warn!(
                        expected = %RedactedOnion(expected.as_str()),
                        got = %RedactedOnion(onion_address.as_str()),
                        "Onion address mismatch - Tor derived a different address from the key"
                    );
                }
                Some(key.clone())
            }
            KeyMaterial::Generated => match reply.value("PrivateKey") {
                Some(blob) => match OnionSecretKey::from_control_blob(&blob) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        tracing::warn!(error = %e, "Unusable PrivateKey in ADD_ONION reply");
                        None
                    }
                },
                None => {
                    tracing::warn!("No PrivateKey in ADD_ONION reply");
                    None
                }
            },
        };

        let handle = HiddenServiceHandle {
            onion_address,
            virtual_port: config.virtual_port,
            target_port: config.target_port,
            control_label: service_id,
        };

        self.lock().entries.insert(
            handle.control_label.clone(),
            Entry {
                handle: handle.clone(),
                secret,
            },
        );
        reservation.committed = true;

        tracing::info!(
            service_id = %RedactedOnion(handle.onion_address.as_str()),
            virtual_port = handle.virtual_port,
            target_port = handle.target_port,
            "Created onion service"
        );
        Ok(handle)
    }

    /// Remove the service at `onion_address` (with or without `.onion`).
    ///
    /// [`Error::NotFound`] if this registry does not know the address. The
    /// handle is dropped only after the daemon confirms.
    pub async fn delete(&self, channel: &ControlChannel, onion_address: &str) -> Result<bool> {
        let label = self
            .find_label(onion_address)
            .ok_or_else(|| Error::NotFound(onion_address.to_string()))?;

        channel.send_command(&format!("DEL_ONION {}", label)).await?;

        let mut inner = self.lock();
        if let Some(entry) = inner.entries.remove(&label) {
            inner.reserved.remove(&entry.handle.target_port);
        }
        drop(inner);

        tracing::info!(service_id = %RedactedOnion(&label), "Removed onion service");
        Ok(true)
    }

    fn find_label(&self, onion_address: &str) -> Option<String> {
        let wanted = normalize(onion_address);
        self.lock()
            .entries
            .values()
            .find(|e| e.handle.onion_address.service_id() == wanted)
            .map(|e| e.handle.control_label.clone())
    }

    /// Handle for an address, if live.
    pub fn get(&self, onion_address: &str) -> Option<HiddenServiceHandle> {
        let wanted = normalize(onion_address);
        self.lock()
            .entries
            .values()
            .find(|e| e.handle.onion_address.service_id() == wanted)
            .map(|e| e.handle.clone())
    }

    /// All live handles.
    pub fn list(&self) -> Vec<HiddenServiceHandle> {
        let mut handles: Vec<_> = self.lock().entries.values().map(|e| e.handle.clone()).collect();
        handles.sort_by(|a, b| a.control_label.cmp(&b.control_label));
        handles
    }

    /// Secret key of a live service.
    pub fn secret_key(&self, onion_address: &str) -> Result<OnionSecretKey> {
        let wanted = normalize(onion_address);
        let inner = self.lock();
        let entry = inner
            .entries
            .values()
            .find(|e| e.handle.onion_address.service_id() == wanted)
            .ok_or_else(|| Error::NotFound(onion_address.to_string()))?;
        entry
            .secret
            .clone()
            .ok_or_else(|| Error::InvalidKey("daemon did not return key material".into()))
    }

    /// Number of live services.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no services are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort `DEL_ONION` of every live service, then forget them all.
    ///
    /// Returns whether every delete succeeded.
    pub async fn close_all(&self, channel: &ControlChannel) -> bool {
        let labels: Vec<String> = self.lock().entries.keys().cloned().collect();
        let mut ok = true;
        for label in labels {
            if let Err(e) = channel.send_command(&format!("DEL_ONION {}", label)).await {
                tracing::warn!(service_id = %RedactedOnion(&label), error = %e, "Failed to remove onion service");
                ok = false;
            }
        }
        self.invalidate();
        ok
    }

    /// Forget every handle without contacting the daemon.
    pub fn invalidate(&self) {
        let mut inner = self.lock();
        if !inner.entries.is_empty() {
            tracing::debug!(count = inner.entries.len(), "Invalidating onion service handles");
        }
        inner.entries.clear();
        inner.reserved.clear();
    }
}

fn normalize(onion_address: &str) -> String {
    let lower = onion_address.trim().to_ascii_lowercase();
    lower.strip_suffix(".onion").unwrap_or(&lower).to_string()
}
