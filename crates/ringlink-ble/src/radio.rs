//! btleplug implementation of the engine's radio stack

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{Stream, StreamExt};
use ringlink_core::{
    Advertisement, BondState, DeviceAddress, LinkHandle, RadioError, RadioEvent, RadioStack,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::BleRadioConfig;
use crate::error::BleRadioError;
use crate::protocol::{advertisement_bytes, STATUS_LINK_LOST};

const EVENT_CAPACITY: usize = 256;

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct LinkTable {
    next_handle: u64,
    open: HashMap<LinkHandle, (DeviceAddress, Peripheral)>,
}

struct Shared {
    adapter: Adapter,
    config: BleRadioConfig,
    events: broadcast::Sender<RadioEvent>,
    links: Mutex<LinkTable>,
    enabled: AtomicBool,
    scanning: AtomicBool,
}

impl Shared {
    fn links(&self) -> MutexGuard<'_, LinkTable> {
        self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    /// Translate a discovery or update into an advertisement
    async fn advertisement(&self, id: &PeripheralId) -> Option<Advertisement> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok()??;
        if self.config.filter_by_service && !properties.services.contains(&self.config.service_uuid) {
            return None;
        }
        // Without an RSSI the sighting is too stale to rank
        let rssi = properties.rssi?;
        let manufacturer: BTreeMap<u16, Vec<u8>> =
            properties.manufacturer_data.into_iter().collect();
        let raw = advertisement_bytes(properties.local_name.as_deref(), &manufacturer);
        Some(Advertisement {
            address: Some(properties.address.to_string()),
            name: properties.local_name,
            rssi,
            raw,
        })
    }

    fn address_of(&self, id: &PeripheralId) -> Option<DeviceAddress> {
        self.links()
            .open
            .values()
            .find(|(_, peripheral)| peripheral.id() == *id)
            .map(|(address, _)| address.clone())
    }
}

/// Forward adapter events to engine subscribers until the adapter goes away
async fn pump_events(shared: Arc<Shared>, mut events: CentralEvents) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if !shared.scanning.load(Ordering::Relaxed) {
                    continue;
                }
                if let Some(advertisement) = shared.advertisement(&id).await {
                    trace!("Advertisement from {:?}", advertisement.address);
                    shared.emit(RadioEvent::Advertisement(advertisement));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                if let Some(address) = shared.address_of(&id) {
                    info!("Ring {} disconnected", address);
                    shared.emit(RadioEvent::LinkLost {
                        address,
                        status: STATUS_LINK_LOST,
                    });
                }
            }
            _ => {}
        }
    }

    warn!("BLE adapter event stream ended");
    shared.enabled.store(false, Ordering::SeqCst);
    shared.scanning.store(false, Ordering::SeqCst);
    shared.emit(RadioEvent::RadioStateChanged { enabled: false });
}

// ----------------------------------------------------------------------------
// Radio Implementation
// ----------------------------------------------------------------------------

/// Radio stack backed by the host adapter through btleplug
///
/// Bonding is left to the host operating system, which pairs on first encrypted
/// access; every ring is therefore reported as already bonded.
pub struct BtleplugRadio {
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
    _manager: Manager,
}

impl BtleplugRadio {
    /// Open the configured adapter and start listening for its events
    pub async fn new(config: BleRadioConfig) -> Result<Self, BleRadioError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .nth(config.adapter_index)
            .ok_or(BleRadioError::AdapterNotAvailable)?;
        let central_events = adapter.events().await?;
        info!("BLE adapter {} initialized", config.adapter_index);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            adapter,
            config,
            events,
            links: Mutex::new(LinkTable::default()),
            enabled: AtomicBool::new(true),
            scanning: AtomicBool::new(false),
        });
        let pump = tokio::spawn(pump_events(shared.clone(), central_events));

        Ok(Self {
            shared,
            pump,
            _manager: manager,
        })
    }

    pub fn config(&self) -> &BleRadioConfig {
        &self.shared.config
    }

    /// The btleplug peripheral behind an open link
    pub fn peripheral(&self, link: LinkHandle) -> Result<Peripheral, BleRadioError> {
        self.shared
            .links()
            .open
            .get(&link)
            .map(|(_, peripheral)| peripheral.clone())
            .ok_or_else(|| BleRadioError::UnknownLink {
                link: link.to_string(),
            })
    }

    async fn find(&self, address: &DeviceAddress) -> Result<Peripheral, BleRadioError> {
        for peripheral in self.shared.adapter.peripherals().await? {
            if peripheral
                .address()
                .to_string()
                .eq_ignore_ascii_case(address.as_str())
            {
                return Ok(peripheral);
            }
        }
        Err(BleRadioError::DeviceNotFound {
            address: address.to_string(),
        })
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl RadioStack for BtleplugRadio {
    fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.shared.events.subscribe()
    }

    async fn start_scan(&self) -> Result<(), RadioError> {
        let filter = if self.shared.config.filter_by_service {
            ScanFilter {
                services: vec![self.shared.config.service_uuid],
            }
        } else {
            ScanFilter::default()
        };
        self.shared
            .adapter
            .start_scan(filter)
            .await
            .map_err(BleRadioError::from)?;
        self.shared.scanning.store(true, Ordering::SeqCst);
        debug!("Started BLE scan");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.shared.scanning.store(false, Ordering::SeqCst);
        self.shared
            .adapter
            .stop_scan()
            .await
            .map_err(BleRadioError::from)?;
        debug!("Stopped BLE scan");
        Ok(())
    }

    async fn connect(
        &self,
        address: &DeviceAddress,
        _auto_connect: bool,
    ) -> Result<LinkHandle, RadioError> {
        let peripheral = self.find(address).await?;
        if !peripheral.is_connected().await.map_err(BleRadioError::from)? {
            peripheral.connect().await.map_err(BleRadioError::from)?;
        }

        let mut links = self.shared.links();
        links.next_handle += 1;
        let handle = LinkHandle(links.next_handle);
        links.open.insert(handle, (address.clone(), peripheral));
        debug!("Opened {} to {}", handle, address);
        Ok(handle)
    }

    async fn discover_services(&self, link: LinkHandle) -> Result<(), RadioError> {
        let peripheral = self.peripheral(link)?;
        peripheral
            .discover_services()
            .await
            .map_err(BleRadioError::from)?;
        let characteristic = self.shared.config.write_characteristic;
        if !peripheral
            .characteristics()
            .iter()
            .any(|c| c.uuid == characteristic)
        {
            return Err(BleRadioError::CharacteristicNotFound {
                characteristic: characteristic.to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn request_mtu(&self, link: LinkHandle, mtu: u16) -> Result<u16, RadioError> {
        self.peripheral(link)?;
        // The host stack negotiates on its own; report what it is expected to settle on
        Ok(mtu.min(self.shared.config.assumed_mtu))
    }

    async fn write(&self, link: LinkHandle, payload: &[u8]) -> Result<(), RadioError> {
        let peripheral = self.peripheral(link)?;
        let uuid = self.shared.config.write_characteristic;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| BleRadioError::CharacteristicNotFound {
                characteristic: uuid.to_string(),
            })?;
        peripheral
            .write(
                &characteristic,
                payload,
                btleplug::api::WriteType::WithResponse,
            )
            .await
            .map_err(BleRadioError::from)?;
        Ok(())
    }

    async fn read(&self, link: LinkHandle) -> Result<Vec<u8>, RadioError> {
        let peripheral = self.peripheral(link)?;
        let uuid = self.shared.config.notify_characteristic;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| BleRadioError::CharacteristicNotFound {
                characteristic: uuid.to_string(),
            })?;
        Ok(peripheral
            .read(&characteristic)
            .await
            .map_err(BleRadioError::from)?)
    }

    async fn disconnect(&self, link: LinkHandle) -> Result<(), RadioError> {
        let peripheral = self.peripheral(link)?;
        // Forget the link first so the adapter's disconnect event is not reported as a loss
        self.shared.links().open.remove(&link);
        peripheral
            .disconnect()
            .await
            .map_err(BleRadioError::from)?;
        Ok(())
    }

    async fn close(&self, link: LinkHandle) {
        if self.shared.links().open.remove(&link).is_some() {
            debug!("Closed {}", link);
        }
    }

    async fn bond_state(&self, _address: &DeviceAddress) -> BondState {
        BondState::Bonded
    }

    async fn create_bond(&self, address: &DeviceAddress) -> Result<(), RadioError> {
        self.shared.emit(RadioEvent::BondStateChanged {
            address: address.clone(),
            previous: BondState::None,
            current: BondState::Bonded,
            reason: None,
        });
        Ok(())
    }
}

impl std::fmt::Debug for BtleplugRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugRadio")
            .field("config", &self.shared.config)
            .field("enabled", &self.is_enabled())
            .field("open_links", &self.shared.links().open.len())
            .finish()
    }
}
