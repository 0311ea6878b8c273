//! Latchkey provisioning tool
//!
//! Finds Latchkey locks over Bluetooth, asks them for nearby WiFi networks
//! and pushes credentials. Acknowledged credentials are saved to the
//! Latchkey API.

mod config;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use latchkey_api::ApiClient;
use latchkey_ble::ble::BleTransport;
use latchkey_ble::{DeviceInfo, DiscoveryFilter, Transport};
use latchkey_engine::{
    LockId, NetworkObservation, ProvisioningError, RemoteConfig, RemoteStore, SaveOutcome,
    SessionHandle, Snapshot, StoreError, start_session,
};

use crate::config::Settings;

type BoxError = Box<dyn std::error::Error>;

#[derive(Parser)]
#[command(name = "latchkey")]
#[command(about = "Bluetooth provisioning tool for Latchkey locks")]
struct Cli {
    /// More output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration directory (default: $LATCHKEY_HOME or ~/.latchkey)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby Bluetooth devices
    Devices {
        /// Scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
        /// Show every device, not only Latchkey locks
        #[arg(short, long)]
        all: bool,
    },
    /// Ask a lock which WiFi networks it can see
    WifiScan {
        /// Lock id (UUID)
        #[arg(short, long)]
        lock: String,
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Send WiFi credentials to a lock and save them
    Provision {
        /// Lock id (UUID)
        #[arg(short, long)]
        lock: String,
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        #[arg(long, requires = "password", conflicts_with = "file")]
        ssid: Option<String>,
        #[arg(long, requires = "ssid", conflicts_with = "file")]
        password: Option<String>,
        /// WiFi credentials file (SSID on line 1, password on line 2)
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Bluetooth name to store with the configuration
        #[arg(long)]
        radio_name: Option<String>,
        /// Scan for networks first and check the SSID is visible
        #[arg(long)]
        scan: bool,
        /// Extra attempts when saving to the API fails
        #[arg(long, default_value = "2")]
        save_retries: u32,
        /// API root, overriding the configured one
        #[arg(long)]
        api_url: Option<String>,
    },
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let env_filter = EnvFilter::try_from_env("LATCHKEY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut settings = Settings::load(cli.home)?;
    debug!(config = %settings.config_path().display(), "settings loaded");

    match cli.command {
        Commands::Devices { duration, all } => {
            let window = duration.map(Duration::from_secs).unwrap_or(settings.discovery_window());
            list_devices(window, all).await?;
        }
        Commands::WifiScan { lock, device } => {
            let store = Store::connect(&settings, None)?;
            let networks = run_session(&settings, &lock, store.clone(), |handle| async move {
                let device = connect(&handle, device.as_deref()).await?;
                println!("Scanning for WiFi networks from {}...", device.name);
                Ok::<_, BoxError>(handle.request_scan().await?)
            })
            .await?;
            print_networks(&networks);
            store.persist_tokens(&mut settings).await;
        }
        Commands::Provision {
            lock,
            device,
            ssid,
            password,
            file,
            radio_name,
            scan,
            save_retries,
            api_url,
        } => {
            let (ssid, password) = match (ssid, password, file) {
                (Some(ssid), Some(password), _) => (ssid, password),
                (_, _, Some(file)) => read_wifi_credentials(&file)?,
                _ => return Err("give --ssid and --password, or --file".into()),
            };
            let store = Store::connect(&settings, api_url.as_deref())?;
            if matches!(store, Store::Offline) {
                warn!("no API URL configured; credentials will not be saved");
            }

            let result = run_session(&settings, &lock, store.clone(), |handle| async move {
                connect(&handle, device.as_deref()).await?;
                if scan {
                    let networks = handle.request_scan().await?;
                    print_networks(&networks);
                    if networks.iter().any(|n| n.ssid == ssid) {
                        handle.choose_network(&ssid).await?;
                    } else {
                        println!("Warning: {ssid} was not seen by the lock");
                    }
                }
                handle.set_radio_name(radio_name.as_deref()).await?;

                println!("Sending WiFi credentials...");
                println!("  SSID: {ssid}");
                let mut outcome = handle.submit_credentials(&ssid, &password).await;
                let mut attempts = 0;
                while let Err(ProvisioningError::Persistence(ref e)) = outcome {
                    if attempts == save_retries {
                        break;
                    }
                    attempts += 1;
                    println!("Saving failed ({e}), retrying...");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    outcome = handle.retry_save().await;
                }
                Ok::<_, BoxError>(outcome?)
            })
            .await;
            store.persist_tokens(&mut settings).await;

            let outcome = match result? {
                SaveOutcome::Created => "created",
                SaveOutcome::Updated => "updated",
            };
            println!("WiFi credentials accepted! Network config {outcome}.");
        }
    }

    Ok(())
}

fn read_wifi_credentials(file: &Path) -> Result<(String, String), BoxError> {
    let content = std::fs::read_to_string(file)?;
    let mut lines = content.lines();
    let ssid = lines.next().ok_or("Missing SSID in credentials file")?.trim().to_string();
    let password = lines.next().ok_or("Missing password in credentials file")?.trim().to_string();
    Ok((ssid, password))
}

async fn list_devices(window: Duration, all: bool) -> Result<(), BoxError> {
    println!("Scanning for Latchkey locks ({} seconds)...", window.as_secs());

    let transport = BleTransport::new().await?.with_scan_window(window);
    let devices = transport.discover(&DiscoveryFilter::default()).await?;
    let shown: Vec<_> = devices.iter().filter(|d| all || d.is_lock()).collect();

    println!("\nFound {} devices:", shown.len());
    for device in shown {
        let rssi = device.rssi.map(|r| format!("{r} dBm")).unwrap_or_else(|| "N/A".to_string());
        let marker = if device.is_lock() { " [LATCHKEY]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.id, rssi, marker);
    }
    Ok(())
}

fn print_networks(networks: &[NetworkObservation]) {
    println!("\nFound {} networks:", networks.len());
    for network in networks {
        let signal = network
            .signal_strength
            .map(|s| format!("{s} dBm"))
            .unwrap_or_else(|| "N/A".to_string());
        println!("  {:<32} {}", network.ssid, signal);
    }
}

/// Discover, pick the target and open its control channel
async fn connect(handle: &SessionHandle, target: Option<&str>) -> Result<DeviceInfo, BoxError> {
    println!("Scanning for Latchkey locks...");
    let devices = handle.discover().await?;
    let device = pick_device(&devices, target)
        .ok_or("No Latchkey lock found")?
        .clone();

    println!("Found device: {} ({})", device.name, device.id);
    println!("Connecting...");
    handle.connect(&device.id).await?;
    println!("Connected!");
    Ok(device)
}

/// Match by name or address, or take the first lock
fn pick_device<'a>(devices: &'a [DeviceInfo], target: Option<&str>) -> Option<&'a DeviceInfo> {
    match target {
        Some(target) => devices.iter().find(|d| d.matches(target)),
        None => devices.iter().find(|d| d.is_lock()),
    }
}

/// Run `script` against a fresh session, printing progress as it goes.
///
/// The session is torn down when the script finishes, whatever the result.
async fn run_session<T, F, Fut>(
    settings: &Settings,
    lock: &str,
    store: Store,
    script: F,
) -> Result<T, BoxError>
where
    F: FnOnce(SessionHandle) -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    let transport = BleTransport::new()
        .await?
        .with_scan_window(settings.discovery_window())
        .with_write_chunk(settings.write_chunk_size());
    let (handle, driver) = start_session(lock, transport, store, settings.engine_config())?;
    let progress = handle.subscribe();

    let script = async move {
        let result = script(handle.clone()).await;
        handle.teardown().await;
        drop(handle);
        result
    };

    let ((), (), result) = tokio::join!(driver.run(), print_progress(progress), script);
    result
}

async fn print_progress(mut snapshots: watch::Receiver<Snapshot>) {
    let mut last_status = String::new();
    let mut last_error = None;
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if snapshot.status_message != last_status {
            debug!(state = %snapshot.state, "{}", snapshot.status_message);
            last_status = snapshot.status_message;
        }
        if snapshot.error != last_error {
            if let Some(error) = &snapshot.error {
                println!("Error: {error}");
            }
            last_error = snapshot.error;
        }
    }
}

/// Where acknowledged configs are saved
#[derive(Clone)]
enum Store {
    Api(ApiClient),
    /// No API configured; every save fails
    Offline,
}

impl Store {
    fn connect(settings: &Settings, api_url: Option<&str>) -> Result<Self, BoxError> {
        match api_url.or(settings.file.api_url.as_deref()) {
            Some(url) => Ok(Store::Api(ApiClient::new(url, settings.tokens())?)),
            None => Ok(Store::Offline),
        }
    }

    /// Keep tokens rotated during the session
    async fn persist_tokens(&self, settings: &mut Settings) {
        let Store::Api(client) = self else { return };
        let tokens = client.tokens().await;
        if tokens == settings.tokens() {
            return;
        }
        if let Err(e) = settings.save_tokens(&tokens) {
            warn!("could not save refreshed tokens: {e}");
        }
    }
}

fn offline() -> StoreError {
    StoreError::Unavailable("no API URL configured".to_string())
}

impl RemoteStore for Store {
    async fn get(&self, lock: &LockId) -> Result<Option<RemoteConfig>, StoreError> {
        match self {
            Store::Api(client) => client.get(lock).await,
            Store::Offline => Err(offline()),
        }
    }

    async fn create(&self, lock: &LockId, config: &RemoteConfig) -> Result<(), StoreError> {
        match self {
            Store::Api(client) => client.create(lock, config).await,
            Store::Offline => Err(offline()),
        }
    }

    async fn update(&self, lock: &LockId, config: &RemoteConfig) -> Result<(), StoreError> {
        match self {
            Store::Api(client) => client.update(lock, config).await,
            Store::Offline => Err(offline()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, id: &str) -> DeviceInfo {
        DeviceInfo { id: id.to_string(), name: name.to_string(), rssi: None }
    }

    #[test]
    fn picks_first_lock_without_target() {
        let devices = [
            device("Headphones", "AA:00"),
            device("Latchkey-1", "AA:01"),
            device("Latchkey-2", "AA:02"),
        ];
        assert_eq!(pick_device(&devices, None).map(|d| d.id.as_str()), Some("AA:01"));
    }

    #[test]
    fn picks_target_by_name_or_address() {
        let devices = [device("Latchkey-1", "AA:01"), device("Latchkey-2", "AA:02")];
        assert_eq!(pick_device(&devices, Some("Latchkey-2")).map(|d| d.id.as_str()), Some("AA:02"));
        assert_eq!(pick_device(&devices, Some("AA:01")).map(|d| d.name.as_str()), Some("Latchkey-1"));
        assert!(pick_device(&devices, Some("Garage")).is_none());
    }

    #[test]
    fn reads_credentials_file() {
        let path = std::env::temp_dir().join(format!("latchkey-creds-{}", std::process::id()));
        std::fs::write(&path, "Home \nhunter2\n").unwrap();
        let (ssid, password) = read_wifi_credentials(&path).unwrap();
        assert_eq!((ssid.as_str(), password.as_str()), ("Home", "hunter2"));

        std::fs::write(&path, "Home\n").unwrap();
        assert!(read_wifi_credentials(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn offline_store_is_unavailable() {
        let lock = LockId::parse("6f1c1a52-3b8e-4a55-9f3e-2a6b1d0c9e11").unwrap();
        assert!(matches!(Store::Offline.get(&lock).await, Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn cli_rejects_file_with_ssid() {
        let parsed = Cli::try_parse_from([
            "latchkey", "provision", "--lock", "x", "--ssid", "a", "--password", "b", "--file", "c",
        ]);
        assert!(parsed.is_err());
    }
}
