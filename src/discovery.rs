use crate::client;
use crate::config::{jittered, DiscoveryConfig, NewDevicePolicy, SessionConfig};
use crate::device::Device;
use crate::endpoint::EndpointSet;
use crate::error::{Result, SensemeError};
use crate::registry::DeviceRegistry;
use crate::subscription::{callback, Callback, CallbackError, Subscribers, SubscriptionId};
use crate::types::{self, DeviceInfo};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout, Instant};

/// Discovery manager for SenseME devices
///
/// Broadcasts a discovery request on every local interface, collects the
/// replies and keeps the set of discovered devices. The broadcast cycle
/// repeats in the background until [`Discovery::stop`] is called.
///
/// # Example
///
/// ```no_run
/// use senseme::{Discovery, DiscoveryConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut discovery = Discovery::new(DiscoveryConfig::default());
///     discovery.start().await?;
///
///     // Wait a bit for discovery
///     tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
///
///     for device in discovery.devices() {
///         println!("Found {}", device);
///     }
///
///     discovery.stop().await;
///     Ok(())
/// }
/// ```
pub struct Discovery {
    shared: Arc<Shared>,
    stop_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

/// State shared between the coordinator handle and its tasks
struct Shared {
    config: DiscoveryConfig,
    registry: DeviceRegistry,
    subscribers: Subscribers<Vec<Device>>,
    /// Hardware ids being started or queried right now
    pending: Mutex<HashSet<String>>,
}

impl Shared {
    fn notify(&self) {
        self.subscribers.notify(self.registry.devices());
    }

    fn claim(&self, id: &str) -> Option<Claim<'_>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.registry.contains_id(id) || !pending.insert(id.to_string()) {
            return None;
        }
        Some(Claim {
            shared: self,
            id: id.to_string(),
        })
    }
}

/// Releases a pending hardware id when dropped
struct Claim<'a> {
    shared: &'a Shared,
    id: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Stops a started device unless it made it into the registry
struct Unregistered(Option<Device>);

impl Unregistered {
    fn keep(mut self) {
        self.0 = None;
    }
}

impl Drop for Unregistered {
    fn drop(&mut self) {
        if let Some(device) = self.0.take() {
            device.stop();
        }
    }
}

impl Discovery {
    /// Create a coordinator with its own device registry
    pub fn new(config: DiscoveryConfig) -> Self {
        Self::with_registry(config, DeviceRegistry::new())
    }

    /// Create a coordinator that shares `registry` with other coordinators
    pub fn with_registry(config: DiscoveryConfig, registry: DeviceRegistry) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                subscribers: Subscribers::new(),
                pending: Mutex::new(HashSet::new()),
            }),
            stop_tx: None,
            task_handle: None,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.shared.registry
    }

    /// Snapshot of the discovered devices
    pub fn devices(&self) -> Vec<Device> {
        self.shared.registry.devices()
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Register a handler for device-set changes
    ///
    /// The handler is offered the current set right away.
    pub fn add_callback(&self, callback: Callback<Vec<Device>>) -> SubscriptionId {
        let id = self.shared.subscribers.add(callback);
        self.shared.subscribers.notify_one(id, self.devices());
        id
    }

    pub fn remove_callback(&self, id: SubscriptionId) -> bool {
        self.shared.subscribers.remove(id)
    }

    /// Start the discovery process
    ///
    /// If discovery is already running, it will be stopped and restarted.
    /// The existing device set is preserved. Fails with
    /// [`SensemeError::NoInterfaces`] if no interface can be listened on for
    /// the first cycle; later cycles retry on their own.
    pub async fn start(&mut self) -> Result<()> {
        self.stop().await;
        let first = EndpointSet::open(&self.shared.config).await?;

        let (stop_tx, _) = broadcast::channel(1);
        self.stop_tx = Some(stop_tx.clone());

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut stop_rx = stop_tx.subscribe();
            let mut tasks = JoinSet::new();
            let mut opened = Some(first);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::info!("Discovery stopped");
                        break;
                    }
                    _ = async {
                        if let Err(e) = run_cycle(&shared, opened.take(), &mut tasks).await {
                            tracing::error!("Discovery cycle failed: {}", e);
                        }
                        while tasks.try_join_next().is_some() {}
                        let config = &shared.config;
                        sleep(jittered(config.refresh_interval, config.refresh_jitter)).await;
                    } => {}
                }
            }
        });

        self.task_handle = Some(handle);
        tracing::info!("Discovery started");
        Ok(())
    }

    /// Stop the broadcast cycle
    ///
    /// Discovered devices and their sessions are left alone.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            // Give it a moment to stop gracefully
            let abort = handle.abort_handle();
            if timeout(Duration::from_millis(500), handle).await.is_err() {
                tracing::debug!("Discovery task did not stop in time, aborting");
                abort.abort();
            }
        }
    }

    /// Stop every discovered device and forget it
    pub fn remove_discovered_devices(&self) {
        self.shared.registry.clear();
        self.shared.notify();
    }

    /// Look up the device at `address` directly and add it
    ///
    /// Returns `true` if the device is known afterwards.
    pub async fn add_by_ip_address(&self, address: &str) -> bool {
        let ip = match parse_address(address) {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!("{}", e);
                return false;
            }
        };
        let session = &self.shared.config.session;
        let reply = match client::fetch_identity(
            SocketAddr::new(ip, session.port),
            session.query_timeout,
        )
        .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!("No device answered at {}: {}", ip, e);
                return false;
            }
        };
        if types::is_ignored_model(&reply.model) {
            return false;
        }

        let device = Device::from_reply(&reply, ip, session.clone());
        if add_device(&self.shared, device).await {
            self.shared.notify();
        }
        self.shared.registry.contains_id(&reply.id)
    }

    /// Bring back a device from a saved [`DeviceInfo`] without broadcasting
    ///
    /// The device is started or queried according to the configured policy.
    /// Returns `true` if the device is known afterwards.
    pub async fn add_by_device_info(&self, info: &DeviceInfo) -> bool {
        if types::is_ignored_model(&info.base_model) {
            return false;
        }
        let device = Device::from_info(info, self.shared.config.session.clone());
        if add_device(&self.shared, device).await {
            self.shared.notify();
        }
        self.shared.registry.contains_id(&info.id)
    }
}

/// One broadcast-and-collect pass over every interface
async fn run_cycle(
    shared: &Arc<Shared>,
    opened: Option<EndpointSet>,
    tasks: &mut JoinSet<()>,
) -> Result<()> {
    let config = &shared.config;
    let mut endpoints = match opened {
        Some(endpoints) => endpoints,
        None => EndpointSet::open(config).await?,
    };
    tracing::debug!("Discovery cycle on {} endpoint(s)", endpoints.len());
    endpoints.broadcast().await;
    let started = Instant::now();

    loop {
        match timeout(config.reply_window, endpoints.recv()).await {
            Ok(Some(found)) => {
                if shared.registry.contains_id(&found.reply.id) {
                    shared.notify();
                    continue;
                }
                tracing::trace!(
                    "{} {} answered from {}",
                    found.device_type,
                    found.reply.name,
                    found.address
                );
                let shared = shared.clone();
                tasks.spawn(async move {
                    let session = shared.config.session.clone();
                    let device = Device::from_reply(&found.reply, found.address, session);
                    add_device(&shared, device).await;
                    shared.notify();
                });
            }
            Ok(None) => break,
            Err(_) if started.elapsed() < config.broadcast_window => {
                endpoints.broadcast().await;
            }
            Err(_) => break,
        }
    }

    shared.notify();
    Ok(())
}

/// Start the device or fetch its secondary info, bounded by `limit`
async fn bring_up(device: &Device, policy: NewDevicePolicy, limit: Duration) -> bool {
    match policy {
        NewDevicePolicy::StartFirst => device.update_within(limit).await,
        NewDevicePolicy::FillInfo => timeout(limit, device.fill_out_sec_info())
            .await
            .unwrap_or(false),
    }
}

/// Bring a newly found device up under the configured policy and register it
///
/// Returns `true` if this call added the device.
async fn add_device(shared: &Shared, device: Device) -> bool {
    let Some(_claim) = shared.claim(device.id()) else {
        return false;
    };
    let config = &shared.config;
    tracing::info!(
        "Discovered {} {} ({}) at {}",
        device.device_type(),
        device.name(),
        device.id(),
        device.address()
    );

    let guard = Unregistered((config.policy == NewDevicePolicy::StartFirst).then(|| device.clone()));
    if !bring_up(&device, config.policy, config.device_timeout).await {
        tracing::debug!("{}: Not added, device did not answer", device.name());
        return false;
    }

    let inserted = shared.registry.insert(device);
    if inserted {
        guard.keep();
    }
    inserted
}

fn parse_address(address: &str) -> Result<IpAddr> {
    address
        .trim()
        .parse()
        .map_err(|_| SensemeError::InvalidAddress(address.to_string()))
}

/// Fetch the device at `address` without starting its session
///
/// Returns `None` for an invalid address or when the device does not answer.
pub async fn get_device_by_ip_address(address: &str, config: SessionConfig) -> Option<Device> {
    let ip = match parse_address(address) {
        Ok(ip) => ip,
        Err(e) => {
            tracing::warn!("{}", e);
            return None;
        }
    };
    let reply = client::fetch_identity(SocketAddr::new(ip, config.port), config.query_timeout)
        .await
        .ok()?;
    let device = Device::from_reply(&reply, ip, config);
    device.fill_out_sec_info().await.then_some(device)
}

/// Rebuild a device from a saved [`DeviceInfo`] and bring it up under `policy`
///
/// Returns `None` if the device did not answer within `limit`.
pub async fn get_device_by_device_info(
    info: &DeviceInfo,
    policy: NewDevicePolicy,
    config: SessionConfig,
    limit: Duration,
) -> Option<Device> {
    let device = Device::from_info(info, config);
    if bring_up(&device, policy, limit).await {
        Some(device)
    } else {
        device.stop();
        None
    }
}

/// Snapshots from a running coordinator, fed through a subscriber
fn watch_devices(discovery: &Discovery) -> (mpsc::UnboundedReceiver<Vec<Device>>, SubscriptionId) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = discovery.add_callback(callback(move |devices: Vec<Device>| {
        let tx = tx.clone();
        async move {
            tx.send(devices)?;
            Ok::<(), CallbackError>(())
        }
    }));
    (rx, id)
}

fn lightweight() -> DiscoveryConfig {
    DiscoveryConfig::default().with_policy(NewDevicePolicy::FillInfo)
}

/// Find the device whose name, room name or IP address is `value`
///
/// The device's session is started and its first update awaited.
pub async fn discover(value: &str, limit: Duration) -> Option<Device> {
    discover_with(lightweight(), value, limit).await
}

/// [`discover`] with explicit settings
pub async fn discover_with(config: DiscoveryConfig, value: &str, limit: Duration) -> Option<Device> {
    let deadline = Instant::now() + limit;
    let mut discovery = Discovery::new(config);
    let (mut rx, _) = watch_devices(&discovery);
    discovery.start().await.ok()?;

    let mut found = None;
    while let Ok(Some(devices)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        if let Some(device) = devices.into_iter().find(|d| d.matches(value)) {
            found = Some(device);
            break;
        }
    }
    discovery.stop().await;

    let device = found?;
    if device.update().await {
        Some(device)
    } else {
        device.stop();
        None
    }
}

/// Every device that answered within `limit`
///
/// Always waits the full time.
pub async fn discover_all(limit: Duration) -> Vec<Device> {
    discover_all_with(lightweight(), limit).await
}

/// [`discover_all`] with explicit settings
pub async fn discover_all_with(config: DiscoveryConfig, limit: Duration) -> Vec<Device> {
    let mut discovery = Discovery::new(config);
    if let Err(e) = discovery.start().await {
        tracing::error!("Discovery failed to start: {}", e);
        return Vec::new();
    }
    sleep(limit).await;
    discovery.stop().await;
    discovery.devices()
}

/// `true` if any device answered within `limit`
pub async fn discover_any(limit: Duration) -> bool {
    discover_any_with(lightweight(), limit).await
}

/// [`discover_any`] with explicit settings
pub async fn discover_any_with(config: DiscoveryConfig, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    let mut discovery = Discovery::new(config);
    let (mut rx, _) = watch_devices(&discovery);
    if discovery.start().await.is_err() {
        return false;
    }

    let mut any = false;
    while let Ok(Some(devices)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        if !devices.is_empty() {
            any = true;
            break;
        }
    }
    discovery.stop().await;
    any
}
