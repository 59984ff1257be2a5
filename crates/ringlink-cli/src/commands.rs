//! Command handlers for the RingLink CLI

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use ringlink_core::{
    CommandOutcome, ConnectionState, DeviceCommand, DeviceRecordStore, JsonFileStore,
    Peripheral, PersistenceRecord, ScannedPeripheral,
};

use crate::app::RingLinkApp;
use crate::cli::Commands;
use crate::config::{AppConfig, RadioBackend};
use crate::error::{CliError, Result};

/// Link-loss status the demo uses for its simulated walk-away
const DEMO_LINK_LOSS_STATUS: i32 = 8;

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    ///
    /// `config_path` is where `config --write` saves; the engine is only started
    /// for commands that talk to a ring.
    pub async fn execute(command: Commands, config: AppConfig, config_path: PathBuf) -> Result<()> {
        match command {
            Commands::Config { write } => Self::handle_config_command(&config, config_path, write),
            Commands::Status => Self::handle_status_command(&config, &config_path),
            Commands::Forget => Self::handle_forget_command(&config),
            Commands::Demo => {
                let mut config = config;
                config.cli.backend = RadioBackend::Simulated;
                let app = RingLinkApp::start(config).await?;
                let result = Self::handle_demo_command(&app).await;
                app.stop().await?;
                result
            }
            command => {
                let app = RingLinkApp::start(config).await?;
                let result = match command {
                    Commands::Scan { seconds } => Self::handle_scan_command(&app, seconds).await,
                    Commands::Connect {
                        address,
                        name,
                        watch,
                    } => Self::handle_connect_command(&app, &address, name, watch).await,
                    Commands::Locate => Self::handle_locate_command(&app).await,
                    Commands::Send { command, payload } => {
                        Self::handle_send_command(&app, &command, payload).await
                    }
                    _ => Ok(()),
                };
                app.stop().await?;
                result
            }
        }
    }

    /// Handle the scan command
    async fn handle_scan_command(app: &RingLinkApp, seconds: u64) -> Result<()> {
        let handle = app.handle();
        let mut sightings = handle.subscribe_sightings();
        handle.start_scan().await?;
        println!("Scanning for rings ({}s)...", seconds);

        let deadline = tokio::time::sleep(Duration::from_secs(seconds));
        tokio::pin!(deadline);
        let mut found = 0usize;
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = handle.wait_for(|s| s.state != ConnectionState::Scanning) => {
                    info!("Scan ended by the engine");
                    break;
                }
                sighting = sightings.recv() => match sighting {
                    Ok(sighting) => {
                        found += 1;
                        println!("{}", format_sighting(&sighting));
                    }
                    Err(RecvError::Lagged(n)) => warn!("Missed {} sightings", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        if handle.state() == ConnectionState::Scanning {
            handle.stop_scan().await?;
        }
        if found == 0 {
            println!("No rings found");
        }
        Ok(())
    }

    /// Handle the connect command
    async fn handle_connect_command(
        app: &RingLinkApp,
        address: &str,
        name: Option<String>,
        watch: bool,
    ) -> Result<()> {
        let peripheral = Peripheral::parse(address, name.as_deref())?;
        println!("Connecting to {}...", peripheral);
        app.handle().connect(peripheral).await?;
        let snapshot = app.wait_connected().await?;
        println!(
            "Connected to {} (MTU {})",
            snapshot
                .device
                .as_ref()
                .map(|d| d.display_name().to_string())
                .unwrap_or_default(),
            snapshot.mtu.unwrap_or_default()
        );

        if watch {
            Self::watch(app).await?;
        }
        Ok(())
    }

    /// Keep the link alive and react to typed commands until interrupted
    async fn watch(app: &RingLinkApp) -> Result<()> {
        let handle = app.handle();
        let mut errors = handle.subscribe_errors();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("Watching. Commands: locate, battery <0-100>, disconnect. Ctrl+C to quit.");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                error = errors.recv() => match error {
                    Ok(record) => println!("! {}: {}", record.code, record.message),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    let mut words = line.split_whitespace();
                    match (words.next(), words.next()) {
                        (Some("locate"), _) => app.press_locate().await?,
                        (Some("battery"), Some(level)) => match level.parse::<u8>() {
                            Ok(level) => handle.report_battery(Some(level))?,
                            Err(_) => println!("Battery level must be 0-100"),
                        },
                        (Some("disconnect"), _) => {
                            handle.disconnect().await?;
                            println!("Disconnected; the ring is forgotten");
                            break;
                        }
                        (Some(other), _) => println!("Unknown command: {}", other),
                        (None, _) => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Handle the locate command
    async fn handle_locate_command(app: &RingLinkApp) -> Result<()> {
        let snapshot = app.restore().await?;
        if let Some(device) = &snapshot.device {
            println!("Reconnected to {}", device);
        }
        let outcome = app.handle().locate_device().await?;
        println!("Locate: {}", format_outcome(&outcome));
        Ok(())
    }

    /// Handle the send command
    async fn handle_send_command(
        app: &RingLinkApp,
        command: &str,
        payload: Option<String>,
    ) -> Result<()> {
        let kind = app.handle().parse_command(command)?;
        let payload = match payload {
            Some(hex_payload) => hex::decode(hex_payload.trim())?,
            None => Vec::new(),
        };
        app.restore().await?;
        let outcome = app
            .handle()
            .send_command(DeviceCommand::new(kind, payload))
            .await?;
        println!("{}: {}", command, format_outcome(&outcome));
        Ok(())
    }

    /// Handle the forget command
    fn handle_forget_command(config: &AppConfig) -> Result<()> {
        let mut store = open_record_store(config)?;
        if store.load().is_none() {
            println!("No remembered ring");
            return Ok(());
        }
        if !store.clear() {
            return Err(CliError::Config("device record could not be cleared".into()));
        }
        println!("Remembered ring forgotten");
        Ok(())
    }

    /// Handle the status command
    fn handle_status_command(config: &AppConfig, config_path: &std::path::Path) -> Result<()> {
        println!("RingLink Status");
        println!("===============");
        println!("Configuration: {}", config_path.display());
        println!("Device record: {}", config.device_store_path()?.display());
        println!("Radio backend: {:?}", config.cli.backend);
        match open_record_store(config)?.load() {
            Some(record) => println!("{}", format_record(&record)),
            None => println!("Remembered ring: none"),
        }
        Ok(())
    }

    /// Handle the config command
    fn handle_config_command(config: &AppConfig, path: PathBuf, write: bool) -> Result<()> {
        if write {
            config.save_to_file(&path)?;
            println!("Configuration written to {}", path.display());
        } else {
            print!("{}", config.to_toml()?);
        }
        Ok(())
    }

    /// Scripted session against the simulated radio
    async fn handle_demo_command(app: &RingLinkApp) -> Result<()> {
        let handle = app.handle();
        let radio = app
            .simulated_radio()
            .ok_or_else(|| CliError::FeatureNotAvailable("demo needs the simulated radio".into()))?;

        let mut states = handle.subscribe_states();
        let printer = tokio::spawn(async move {
            while let Ok(change) = states.recv().await {
                println!("  state: {} -> {}", change.old, change.new);
            }
        });

        println!("1. Scanning");
        let mut sightings = handle.subscribe_sightings();
        handle.start_scan().await?;
        let first = tokio::time::timeout(app.config().cli.connect_wait, sightings.recv())
            .await
            .map_err(|_| CliError::Timeout("a ring to advertise".into()))?
            .map_err(|_| CliError::Timeout("a ring to advertise".into()))?;
        println!("{}", format_sighting(&first));

        println!("2. Connecting to {}", first.address);
        handle
            .connect(Peripheral::new(first.address.clone(), first.name.clone()))
            .await?;
        app.wait_connected().await?;
        handle.report_battery(Some(76))?;

        println!("3. Locating");
        let outcome = handle.locate_device().await?;
        println!("  locate: {}", format_outcome(&outcome));

        println!("4. Walking out of range");
        radio.drop_link(&first.address, DEMO_LINK_LOSS_STATUS);
        app.wait_for("reconnect", |s| s.state == ConnectionState::Reconnecting)
            .await?;
        app.wait_for("link recovery", |s| s.state == ConnectionState::Connected)
            .await?;

        println!("5. Disconnecting");
        handle.disconnect().await?;
        app.wait_for("disconnect", |s| s.state == ConnectionState::Disconnected)
            .await?;

        printer.abort();
        println!("Demo complete");
        Ok(())
    }
}

fn open_record_store(config: &AppConfig) -> Result<DeviceRecordStore> {
    let store = JsonFileStore::open(config.device_store_path()?)?;
    Ok(DeviceRecordStore::new(Box::new(store)))
}

fn format_sighting(sighting: &ScannedPeripheral) -> String {
    format!(
        "  {:<17}  {:>4} dBm  {}",
        sighting.address.as_str(),
        sighting.rssi,
        sighting.name.as_deref().unwrap_or("(unnamed)")
    )
}

fn format_outcome(outcome: &CommandOutcome) -> String {
    match outcome {
        CommandOutcome::Success(bytes) if bytes.is_empty() => "ok".to_string(),
        CommandOutcome::Success(bytes) => format!("ok {}", hex::encode(bytes)),
        CommandOutcome::Timeout => "timed out".to_string(),
        CommandOutcome::Failure(status) => format!("failed (status {})", status),
    }
}

fn format_record(record: &PersistenceRecord) -> String {
    format!(
        "Remembered ring: {} {}(auto-reconnect {})",
        record.address,
        record
            .name
            .as_deref()
            .map(|n| format!("\"{}\" ", n))
            .unwrap_or_default(),
        if record.auto_reconnect { "on" } else { "off" }
    )
}

#[cfg(test)]
mod tests {
    use ringlink_core::DeviceAddress;

    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.cli.data_dir = Some(dir.path().to_path_buf());
        config
    }

    #[test]
    fn test_format_outcome() {
        assert_eq!(format_outcome(&CommandOutcome::Success(Vec::new())), "ok");
        assert_eq!(
            format_outcome(&CommandOutcome::Success(vec![0x50, 0x01])),
            "ok 5001"
        );
        assert_eq!(format_outcome(&CommandOutcome::Failure(133)), "failed (status 133)");
    }

    #[test]
    fn test_format_sighting() {
        let sighting = ScannedPeripheral {
            address: DeviceAddress::parse("c0:ff:ee:00:00:01").unwrap(),
            name: None,
            rssi: -61,
            last_seen_ms: 0,
            raw_advertisement: None,
            raw_hex: None,
        };
        assert_eq!(
            format_sighting(&sighting),
            "  C0:FF:EE:00:00:01   -61 dBm  (unnamed)"
        );
    }

    #[test]
    fn test_forget_clears_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let mut store = open_record_store(&config).unwrap();
        let ring = Peripheral::parse("C0:FF:EE:00:00:01", Some("Q_Ring_01")).unwrap();
        assert!(store.save(&PersistenceRecord::new(&ring, 1_700_000_000_000, true)));

        CommandDispatcher::handle_forget_command(&config).unwrap();
        assert!(open_record_store(&config).unwrap().load().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let app = RingLinkApp::start(config_in(&dir)).await.unwrap();
        CommandDispatcher::handle_demo_command(&app).await.unwrap();
        assert_eq!(app.handle().state(), ConnectionState::Disconnected);
        assert!(!app.handle().is_auto_reconnect_armed());
        app.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_config_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = config_in(&dir);
        CommandDispatcher::execute(Commands::Config { write: true }, config.clone(), path.clone())
            .await
            .unwrap();
        assert_eq!(AppConfig::load_from_file(&path).unwrap(), config);
    }
}
