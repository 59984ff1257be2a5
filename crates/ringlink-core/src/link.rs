//! Radio link setup and teardown
//!
//! Setup runs three stages in order: connect, service discovery and MTU
//! negotiation. Each stage is bounded by the configured timeout, and a failure in
//! any stage tears the link down before the error is reported.
//!
//! The link state obeys:
//! - services discovered implies connected
//! - connected implies both link handle and peripheral are set
//! - not connected implies both are unset

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkOperation, RadioError};
use crate::radio::{LinkHandle, RadioStack};
use crate::types::Peripheral;

/// MTU every link starts with before negotiation
pub const DEFAULT_MTU: u16 = 23;

/// ATT header bytes not available to payload
const ATT_OVERHEAD: usize = 3;

// ----------------------------------------------------------------------------
// Link State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LinkState {
    handle: Option<LinkHandle>,
    peripheral: Option<Peripheral>,
    services_discovered: bool,
    mtu: u16,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            handle: None,
            peripheral: None,
            services_discovered: false,
            mtu: DEFAULT_MTU,
        }
    }
}

/// Summary of an established link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub handle: LinkHandle,
    pub peripheral: Peripheral,
    pub mtu: u16,
}

// ----------------------------------------------------------------------------
// Link Manager
// ----------------------------------------------------------------------------

/// Owns the single radio link; clones share the same link
#[derive(Clone)]
pub struct LinkManager {
    radio: Arc<dyn RadioStack>,
    config: LinkConfig,
    state: Arc<Mutex<LinkState>>,
}

impl LinkManager {
    pub fn new(radio: Arc<dyn RadioStack>, config: LinkConfig) -> Self {
        Self {
            radio,
            config,
            state: Arc::new(Mutex::new(LinkState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run the full setup sequence for `peripheral`
    pub async fn connect(&self, peripheral: Option<&Peripheral>) -> Result<LinkInfo, LinkError> {
        let peripheral = peripheral.ok_or(LinkError::NoPeripheral {
            operation: LinkOperation::Connect,
        })?;

        // A stale link from an earlier session must not leak into this one
        let stale = self.lock().handle.is_some();
        if stale {
            self.teardown().await;
        }

        debug!("Connecting to {}", peripheral);
        let handle = self
            .stage(
                LinkOperation::Connect,
                self.radio.connect(&peripheral.address, self.config.auto_connect),
            )
            .await?;
        {
            let mut state = self.lock();
            state.handle = Some(handle);
            state.peripheral = Some(peripheral.clone());
        }

        if let Err(e) = self
            .stage(
                LinkOperation::DiscoverServices,
                self.radio.discover_services(handle),
            )
            .await
        {
            self.teardown().await;
            return Err(e);
        }
        self.lock().services_discovered = true;

        let mtu = match self
            .stage(
                LinkOperation::RequestMtu,
                self.radio.request_mtu(handle, self.config.preferred_mtu),
            )
            .await
        {
            Ok(mtu) => mtu.max(DEFAULT_MTU),
            Err(e) => {
                self.teardown().await;
                return Err(e);
            }
        };
        self.lock().mtu = mtu;

        info!("Link to {} ready ({}, MTU {})", peripheral, handle, mtu);
        Ok(LinkInfo {
            handle,
            peripheral: peripheral.clone(),
            mtu,
        })
    }

    async fn stage<T>(
        &self,
        operation: LinkOperation,
        call: impl std::future::Future<Output = Result<T, RadioError>>,
    ) -> Result<T, LinkError> {
        match timeout(self.stage_timeout(), call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("{} failed: {}", operation, e);
                Err(LinkError::OperationFailed {
                    operation,
                    status: e.status,
                })
            }
            Err(_) => {
                warn!("{} timed out", operation);
                Err(LinkError::Timeout { operation })
            }
        }
    }

    fn stage_timeout(&self) -> Duration {
        self.config.connect_timeout
    }

    /// Ask the radio to drop the link; state is reset by [`close`](Self::close)
    pub async fn disconnect(&self) {
        let handle = self.lock().handle;
        if let Some(handle) = handle {
            if let Err(e) = self.radio.disconnect(handle).await {
                debug!("Disconnect of {} reported: {}", handle, e);
            }
        }
    }

    /// Release the link and reset every field to its default; safe to repeat
    pub async fn close(&self) {
        let previous = std::mem::take(&mut *self.lock());
        if let Some(handle) = previous.handle {
            self.radio.close(handle).await;
            debug!("Closed {}", handle);
        }
    }

    /// Disconnect then close
    pub async fn teardown(&self) {
        self.disconnect().await;
        self.close().await;
    }

    /// Write a payload; only allowed once discovery completed
    pub async fn write(&self, payload: &[u8]) -> Result<(), LinkError> {
        let (handle, mtu) = self.ready()?;
        let max_size = usize::from(mtu).saturating_sub(ATT_OVERHEAD);
        if payload.len() > max_size {
            return Err(LinkError::PayloadTooLarge {
                size: payload.len(),
                max_size,
            });
        }
        self.radio
            .write(handle, payload)
            .await
            .map_err(|e| LinkError::OperationFailed {
                operation: LinkOperation::Write,
                status: e.status,
            })
    }

    /// Read from the link; only allowed once discovery completed
    pub async fn read(&self) -> Result<Vec<u8>, LinkError> {
        let (handle, _) = self.ready()?;
        self.radio
            .read(handle)
            .await
            .map_err(|e| LinkError::OperationFailed {
                operation: LinkOperation::Read,
                status: e.status,
            })
    }

    fn ready(&self) -> Result<(LinkHandle, u16), LinkError> {
        let state = self.lock();
        match (state.handle, state.services_discovered) {
            (Some(handle), true) => Ok((handle, state.mtu)),
            _ => Err(LinkError::NotReady),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().handle.is_some()
    }

    pub fn services_discovered(&self) -> bool {
        self.lock().services_discovered
    }

    pub fn mtu(&self) -> u16 {
        self.lock().mtu
    }

    pub fn handle(&self) -> Option<LinkHandle> {
        self.lock().handle
    }

    pub fn peripheral(&self) -> Option<Peripheral> {
        self.lock().peripheral.clone()
    }

    /// Check the link-state invariants
    pub fn is_consistent(&self) -> bool {
        let state = self.lock();
        let connected = state.handle.is_some();
        let discovery_ok = !state.services_discovered || connected;
        let refs_ok = connected == state.peripheral.is_some();
        discovery_ok && refs_ok
    }
}

impl std::fmt::Debug for LinkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkManager")
            .field("state", &*self.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RadioCall, SimulatedRadio};

    fn ring() -> Peripheral {
        Peripheral::parse("AA:BB:CC:DD:EE:01", Some("Q_Ring_1")).unwrap()
    }

    fn manager(radio: &Arc<SimulatedRadio>) -> LinkManager {
        LinkManager::new(radio.clone(), LinkConfig::default())
    }

    #[tokio::test]
    async fn test_full_setup_sequence() {
        let radio = Arc::new(SimulatedRadio::new());
        let link = manager(&radio);

        let info = link.connect(Some(&ring())).await.unwrap();
        assert_eq!(info.mtu, 247);
        assert!(link.is_connected());
        assert!(link.services_discovered());
        assert!(link.is_consistent());

        let calls = radio.calls();
        assert!(matches!(calls[0], RadioCall::Connect(_)));
        assert!(matches!(calls[1], RadioCall::DiscoverServices(_)));
        assert!(matches!(calls[2], RadioCall::RequestMtu(_, 247)));
    }

    #[tokio::test]
    async fn test_missing_peripheral_names_connect() {
        let radio = Arc::new(SimulatedRadio::new());
        let err = manager(&radio).connect(None).await.unwrap_err();
        assert_eq!(err.operation(), Some(LinkOperation::Connect));
        assert!(radio.calls().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_failure_tears_down_in_order() {
        let radio = Arc::new(SimulatedRadio::new());
        radio.fail_next(LinkOperation::DiscoverServices, 133);
        let link = manager(&radio);

        let err = link.connect(Some(&ring())).await.unwrap_err();
        assert_eq!(err.to_string(), "discoverServices failed: status 133");
        assert!(!link.is_connected());
        assert_eq!(link.mtu(), DEFAULT_MTU);
        assert!(link.is_consistent());

        let calls = radio.calls();
        let n = calls.len();
        assert!(matches!(calls[n - 2], RadioCall::Disconnect(_)));
        assert!(matches!(calls[n - 1], RadioCall::Close(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stage_times_out() {
        let radio = Arc::new(SimulatedRadio::new());
        radio.stall_next(LinkOperation::RequestMtu);
        let link = manager(&radio);

        let err = link.connect(Some(&ring())).await.unwrap_err();
        assert_eq!(
            err,
            LinkError::Timeout {
                operation: LinkOperation::RequestMtu
            }
        );
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let radio = Arc::new(SimulatedRadio::new());
        let link = manager(&radio);
        link.close().await;
        link.close().await;
        assert!(link.is_consistent());

        link.connect(Some(&ring())).await.unwrap();
        link.teardown().await;
        link.close().await;
        assert!(!link.is_connected());
        assert!(!link.services_discovered());
        assert_eq!(link.mtu(), DEFAULT_MTU);
    }

    #[tokio::test]
    async fn test_write_gated_on_discovery() {
        let radio = Arc::new(SimulatedRadio::new());
        let link = manager(&radio);
        assert_eq!(link.write(&[1, 2, 3]).await, Err(LinkError::NotReady));

        link.connect(Some(&ring())).await.unwrap();
        assert!(link.write(&[1, 2, 3]).await.is_ok());

        let oversized = vec![0u8; 245];
        assert_eq!(
            link.write(&oversized).await,
            Err(LinkError::PayloadTooLarge {
                size: 245,
                max_size: 244
            })
        );
    }
}
