//! Application wiring: radio backend, engine and status surface

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use ringlink_core::sim::{SimulatedExecutor, SimulatedRadio};
use ringlink_core::{
    Advertisement, CommandExecutor, ConnectionState, GrantSet, JsonFileStore, RadioStack,
    RingLinkHandle, RingLinkManager, Snapshot, StatusAction, StatusPresenter,
};

use crate::config::{AppConfig, RadioBackend, SimulationConfig};
use crate::error::{CliError, Result};
use crate::surface::TerminalSurface;

const ACTION_CAPACITY: usize = 8;

/// Concrete radio behind the engine, kept for backend-specific control
enum RadioHandle {
    Simulated(SimulatedRadio, SimulatedExecutor),
    #[cfg(feature = "ble")]
    Ble(Arc<ringlink_ble::BtleplugRadio>),
}

struct Backend {
    radio: Arc<dyn RadioStack>,
    executor: Arc<dyn CommandExecutor>,
    handle: RadioHandle,
}

/// Running engine plus everything the CLI attached to it
pub struct RingLinkApp {
    config: AppConfig,
    handle: RingLinkHandle,
    radio: RadioHandle,
    actions: mpsc::Sender<StatusAction>,
    status_task: JoinHandle<()>,
    advertiser: Option<JoinHandle<()>>,
}

impl RingLinkApp {
    /// Build the radio backend and start the engine
    pub async fn start(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let store_path = config.device_store_path()?;
        let store = JsonFileStore::open(&store_path)?;
        debug!("Device record at {}", store_path.display());

        let backend = match config.cli.backend {
            RadioBackend::Simulated => simulated_backend(),
            RadioBackend::Ble => ble_backend(&config).await?,
        };

        let handle = RingLinkManager::builder(config.engine.clone())
            .radio(backend.radio)
            .executor(backend.executor)
            .store(Box::new(store))
            .grants(GrantSet::all())
            .platform(config.platform())
            .spawn()?;

        let advertiser = match &backend.handle {
            RadioHandle::Simulated(radio, _) => Some(tokio::spawn(advertise(
                radio.clone(),
                config.simulation.clone(),
            ))),
            #[cfg(feature = "ble")]
            RadioHandle::Ble(_) => None,
        };

        let (actions, action_rx) = mpsc::channel(ACTION_CAPACITY);
        let status_task = tokio::spawn(StatusPresenter::new().run(
            handle.clone(),
            Box::new(TerminalSurface::new()),
            action_rx,
        ));

        info!("RingLink engine started ({:?} radio)", config.cli.backend);
        Ok(Self {
            config,
            handle,
            radio: backend.handle,
            actions,
            status_task,
            advertiser,
        })
    }

    pub fn handle(&self) -> &RingLinkHandle {
        &self.handle
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The simulated radio, when running without real hardware
    pub fn simulated_radio(&self) -> Option<&SimulatedRadio> {
        match &self.radio {
            RadioHandle::Simulated(radio, _) => Some(radio),
            #[cfg(feature = "ble")]
            RadioHandle::Ble(_) => None,
        }
    }

    pub fn simulated_executor(&self) -> Option<&SimulatedExecutor> {
        match &self.radio {
            RadioHandle::Simulated(_, executor) => Some(executor),
            #[cfg(feature = "ble")]
            RadioHandle::Ble(_) => None,
        }
    }

    /// Press the status surface's locate action
    pub async fn press_locate(&self) -> Result<()> {
        self.actions
            .send(StatusAction::Locate)
            .await
            .map_err(|_| CliError::Engine(ringlink_core::RingLinkError::EngineStopped))
    }

    /// Wait for `predicate` within the configured connect wait
    pub async fn wait_for(
        &self,
        what: &str,
        predicate: impl Fn(&Snapshot) -> bool,
    ) -> Result<Snapshot> {
        match timeout(self.config.cli.connect_wait, self.handle.wait_for(predicate)).await {
            Ok(snapshot) => Ok(snapshot?),
            Err(_) => Err(CliError::Timeout(what.to_string())),
        }
    }

    /// Wait until the link is up, failing fast if the engine lands in ERROR
    pub async fn wait_connected(&self) -> Result<Snapshot> {
        let snapshot = self
            .wait_for("connection", |s| {
                matches!(s.state, ConnectionState::Connected | ConnectionState::Error)
            })
            .await?;
        match snapshot.error {
            Some(record) if snapshot.state == ConnectionState::Error => {
                Err(CliError::Connection(format!("{}: {}", record.code, record.message)))
            }
            _ => Ok(snapshot),
        }
    }

    /// Reconnect to the remembered ring the way a boot-completed signal would
    pub async fn restore(&self) -> Result<Snapshot> {
        if self.handle.snapshot().device.is_none() {
            return Err(CliError::NoRememberedRing);
        }
        self.handle.notify_boot_completed()?;
        self.wait_for("restore", |s| s.state == ConnectionState::Connected)
            .await
    }

    /// Stop the engine and everything attached to it
    pub async fn stop(self) -> Result<()> {
        if let Some(advertiser) = self.advertiser {
            advertiser.abort();
        }
        self.handle.shutdown()?;
        if let Err(e) = self.handle.wait_for(|_| false).await {
            debug!("Engine stopped: {}", e);
        }
        self.status_task.abort();
        info!("RingLink engine stopped");
        Ok(())
    }
}

fn simulated_backend() -> Backend {
    let radio = SimulatedRadio::new();
    let executor = SimulatedExecutor::new();
    Backend {
        radio: Arc::new(radio.clone()),
        executor: Arc::new(executor.clone()),
        handle: RadioHandle::Simulated(radio, executor),
    }
}

#[cfg(feature = "ble")]
async fn ble_backend(config: &AppConfig) -> Result<Backend> {
    let radio = Arc::new(ringlink_ble::BtleplugRadio::new(config.ble.clone()).await?);
    Ok(Backend {
        radio: radio.clone(),
        executor: Arc::new(ringlink_ble::BtleplugExecutor::new(radio.clone())),
        handle: RadioHandle::Ble(radio),
    })
}

#[cfg(not(feature = "ble"))]
async fn ble_backend(_config: &AppConfig) -> Result<Backend> {
    Err(CliError::FeatureNotAvailable(
        "BLE backend requires building with the `ble` feature".into(),
    ))
}

/// Advertise the configured virtual rings while the simulated radio scans
async fn advertise(radio: SimulatedRadio, simulation: SimulationConfig) {
    if simulation.rings.is_empty() {
        warn!("Simulated radio has no rings to advertise");
        return;
    }
    let mut ticker = interval(simulation.advertise_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for ring in &simulation.rings {
            radio.emit_advertisement(Advertisement {
                address: Some(ring.address.clone()),
                name: ring.name.clone(),
                rssi: ring.rssi,
                raw: Vec::new(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ringlink_core::{DeviceCommand, Peripheral, ScannedPeripheral};

    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.cli.data_dir = Some(dir.path().to_path_buf());
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_sees_virtual_rings() {
        let dir = tempfile::tempdir().unwrap();
        let app = RingLinkApp::start(test_config(&dir)).await.unwrap();
        let mut sightings = app.handle().subscribe_sightings();

        app.handle().start_scan().await.unwrap();
        let mut seen: Vec<ScannedPeripheral> = Vec::new();
        while seen.len() < 2 {
            seen.push(sightings.recv().await.unwrap());
        }
        let mut names: Vec<_> = seen.iter().filter_map(|s| s.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["Q_Ring_01".to_string(), "R02_7A1C".to_string()]);

        app.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_remembers_ring_across_runs() {
        let dir = tempfile::tempdir().unwrap();

        let app = RingLinkApp::start(test_config(&dir)).await.unwrap();
        assert!(matches!(app.restore().await, Err(CliError::NoRememberedRing)));
        let ring = Peripheral::parse("C0:FF:EE:00:00:01", Some("Q_Ring_01")).unwrap();
        app.handle().connect(ring.clone()).await.unwrap();
        let snapshot = app.wait_connected().await.unwrap();
        assert_eq!(snapshot.device, Some(ring.clone()));
        app.stop().await.unwrap();

        let app = RingLinkApp::start(test_config(&dir)).await.unwrap();
        let snapshot = app.restore().await.unwrap();
        assert_eq!(snapshot.device, Some(ring));
        app.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_locate_action_reaches_executor() {
        let dir = tempfile::tempdir().unwrap();
        let app = RingLinkApp::start(test_config(&dir)).await.unwrap();
        let ring = Peripheral::parse("C0:FF:EE:00:00:02", None).unwrap();
        app.handle().connect(ring).await.unwrap();
        app.wait_connected().await.unwrap();

        app.press_locate().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let requests = app.simulated_executor().unwrap().requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].commands, vec![DeviceCommand::locate()]);
        app.stop().await.unwrap();
    }
}
