use crate::client;
use crate::config::SessionConfig;
use crate::connection::CommandSender;
use crate::error::{Result, SensemeError};
use crate::fan::Fan;
use crate::light::Light;
use crate::protocol::{Command, DiscoveryReply};
use crate::session::{self, SessionHandle};
use crate::store::ParameterStore;
use crate::subscription::{Callback, Subscribers, SubscriptionId};
use crate::types::{
    self, on_off, DeviceEvent, DeviceId, DeviceInfo, DeviceType, ParamKey, SessionState,
};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

/// Attributes that are only known after talking to the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SecondaryInfo {
    pub(crate) fw_name: Option<String>,
    pub(crate) fw_version: Option<String>,
    pub(crate) has_light: Option<bool>,
    pub(crate) room_name: Option<String>,
    /// Raw numeric room type
    pub(crate) room_type: Option<String>,
}

impl SecondaryInfo {
    pub(crate) fn is_complete(&self) -> bool {
        self.fw_version.is_some() && self.has_light.is_some() && self.room_name.is_some()
    }

    pub(crate) fn light_present(value: &str) -> bool {
        matches!(value.to_uppercase().as_str(), "PRESENT" | "PRESENT;COLOR")
    }

    /// Copy a stored parameter into the typed field it backs, if any
    pub(crate) fn mirror(&mut self, key: &str, value: &str) {
        match key {
            "FW;NAME" => self.fw_name = Some(value.to_string()),
            "DEVICE;LIGHT" => self.has_light = Some(Self::light_present(value)),
            "GROUP;LIST" => self.room_name = Some(value.to_string()),
            "GROUP;ROOM;TYPE" => self.room_type = Some(value.to_string()),
            _ => {
                let is_version = self
                    .fw_name
                    .as_deref()
                    .and_then(|fw| key.strip_prefix("FW;").map(|rest| rest == fw))
                    .unwrap_or(false);
                if is_version {
                    self.fw_version = Some(value.to_string());
                }
            }
        }
    }
}

/// Mutable runtime state, guarded by one lock
pub(crate) struct DeviceState {
    pub(crate) params: ParameterStore,
    pub(crate) info: SecondaryInfo,
    pub(crate) session: SessionState,
    pub(crate) error_count: u32,
    pub(crate) sender: Option<CommandSender>,
    /// Bumped on every start and stop so a cancelled session cannot write
    pub(crate) epoch: u64,
}

pub(crate) struct DeviceInner {
    pub(crate) name: String,
    pub(crate) id: DeviceId,
    pub(crate) address: IpAddr,
    pub(crate) base_model: String,
    pub(crate) device_type: DeviceType,
    pub(crate) config: SessionConfig,
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) first_update: watch::Sender<bool>,
    pub(crate) subscribers: Subscribers<DeviceEvent>,
    pub(crate) session: Mutex<Option<SessionHandle>>,
}

impl DeviceInner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.config.port)
    }
}

/// A SenseME fan or light
///
/// Cloning is cheap and every clone shares the same session and state.
/// Identity is the hardware id. Sessions keep running until [`Device::stop`]
/// is called, even if every handle is dropped.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

/// Variant-specific view, selected from the base model at construction
pub enum DeviceVariant<'a> {
    Fan(Fan<'a>),
    Light(Light<'a>),
}

impl Device {
    /// Create an unstarted device
    pub fn new(
        name: impl Into<String>,
        id: impl Into<DeviceId>,
        address: IpAddr,
        base_model: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        let base_model = base_model.into();
        let (first_update, _) = watch::channel(false);
        Self {
            inner: Arc::new(DeviceInner {
                name: name.into(),
                id: id.into(),
                address,
                device_type: DeviceType::from_model(&base_model),
                base_model,
                config,
                state: Mutex::new(DeviceState {
                    params: ParameterStore::new(),
                    info: SecondaryInfo::default(),
                    session: SessionState::Stopped,
                    error_count: 0,
                    sender: None,
                    epoch: 0,
                }),
                first_update,
                subscribers: Subscribers::new(),
                session: Mutex::new(None),
            }),
        }
    }

    /// Rebuild an unstarted device from a saved [`DeviceInfo`]
    ///
    /// Identity and secondary info are taken over; parameters are not, they
    /// are requested fresh once the session starts.
    pub fn from_info(info: &DeviceInfo, config: SessionConfig) -> Self {
        let device = Self::new(&info.name, &info.id, info.address, &info.base_model, config);
        {
            let mut state = device.inner.lock();
            state.info = SecondaryInfo {
                fw_name: info.fw_name.clone(),
                fw_version: info.fw_version.clone(),
                has_light: info.has_light,
                room_name: info.room_name.clone(),
                room_type: info.room_type.as_deref().and_then(types::room_type_code),
            };
        }
        device
    }

    pub(crate) fn from_reply(reply: &DiscoveryReply, address: IpAddr, config: SessionConfig) -> Self {
        Self::new(&reply.name, &reply.id, address, &reply.model, config)
    }

    // ========== Identity ==========

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Hardware identifier, the MAC address
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn mac(&self) -> &str {
        &self.inner.id
    }

    pub fn address(&self) -> IpAddr {
        self.inner.address
    }

    /// Friendly model name
    pub fn model(&self) -> String {
        types::model_name(&self.inner.base_model)
    }

    pub fn base_model(&self) -> &str {
        &self.inner.base_model
    }

    pub fn device_type(&self) -> DeviceType {
        self.inner.device_type
    }

    pub fn is_fan(&self) -> bool {
        self.inner.device_type == DeviceType::Fan
    }

    pub fn is_light(&self) -> bool {
        self.inner.device_type == DeviceType::Light
    }

    /// Distinct friendly names of all known models
    pub fn models() -> Vec<&'static str> {
        types::model_names()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// True if `value` is this device's IP address, name or room name
    pub fn matches(&self, value: &str) -> bool {
        if let Ok(ip) = value.parse::<IpAddr>() {
            return ip == self.inner.address;
        }
        value == self.inner.name || self.room_name().as_deref() == Some(value)
    }

    pub fn variant(&self) -> DeviceVariant<'_> {
        match self.inner.device_type {
            DeviceType::Fan => DeviceVariant::Fan(Fan::new(self)),
            DeviceType::Light => DeviceVariant::Light(Light::new(self)),
        }
    }

    pub fn as_fan(&self) -> Option<Fan<'_>> {
        match self.variant() {
            DeviceVariant::Fan(fan) => Some(fan),
            DeviceVariant::Light(_) => None,
        }
    }

    pub fn as_light(&self) -> Option<Light<'_>> {
        match self.variant() {
            DeviceVariant::Light(light) => Some(light),
            DeviceVariant::Fan(_) => None,
        }
    }

    // ========== Secondary info ==========

    pub fn fw_name(&self) -> Option<String> {
        self.inner.lock().info.fw_name.clone()
    }

    pub fn fw_version(&self) -> Option<String> {
        self.inner.lock().info.fw_version.clone()
    }

    /// True if a light is installed; standalone lights always have one
    pub fn has_light(&self) -> Option<bool> {
        if self.is_light() {
            return Some(true);
        }
        self.inner.lock().info.has_light
    }

    /// Room name, `EMPTY` when the device is not in a room
    pub fn room_name(&self) -> Option<String> {
        self.inner.lock().info.room_name.clone()
    }

    pub fn room_type(&self) -> Option<&'static str> {
        self.inner
            .lock()
            .info
            .room_type
            .as_deref()
            .map(types::room_type_name)
    }

    /// True if the device has been added to a room
    pub fn room_status(&self) -> Option<bool> {
        let state = self.inner.lock();
        let name = state.info.room_name.as_deref()?;
        let kind = state.info.room_type.as_deref()?;
        Some(name != "EMPTY" && kind != "0")
    }

    pub fn is_sec_info_complete(&self) -> bool {
        self.inner.lock().info.is_complete()
    }

    /// Retrieve firmware, light and room info over a short-lived connection
    ///
    /// Returns immediately if the info is already known. Returns `false` if
    /// the device could not be queried within the configured query timeout.
    pub async fn fill_out_sec_info(&self) -> bool {
        if self.is_sec_info_complete() {
            return true;
        }
        let limit = self.inner.config.query_timeout;
        match client::fetch_secondary_info(&self.inner.name, self.inner.socket_addr(), limit).await {
            Ok(info) => {
                let mut state = self.inner.lock();
                state.info = info;
                true
            }
            Err(e) => {
                tracing::debug!("{}: Failed to retrieve secondary info: {}", self.inner.name, e);
                false
            }
        }
    }

    // ========== Session ==========

    /// Start the session task; no-op if it is already running
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(&self) {
        let mut slot = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let epoch = {
            let mut state = self.inner.lock();
            state.epoch += 1;
            state.session = SessionState::Disconnected;
            state.error_count = 0;
            state.sender = None;
            state.epoch
        };
        *slot = Some(session::spawn(self.inner.clone(), epoch));
        tracing::debug!("{}: Started", self.inner.name);
    }

    /// Cancel the session and its refresh task; safe to call repeatedly
    pub fn stop(&self) {
        let handle = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        handle.abort();

        let was_connected = {
            let mut state = self.inner.lock();
            state.epoch += 1;
            state.sender = None;
            let was_connected = state.session == SessionState::Connected;
            state.session = SessionState::Stopped;
            was_connected
        };
        if was_connected {
            self.inner.subscribers.notify(DeviceEvent::Disconnected);
        }
        tracing::debug!("{}: Stopped", self.inner.name);
    }

    /// True while the session task is alive
    pub fn is_running(&self) -> bool {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().session == SessionState::Connected
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.lock().session
    }

    pub fn error_count(&self) -> u32 {
        self.inner.lock().error_count
    }

    /// True once a full snapshot of the device has been received
    pub fn first_update_complete(&self) -> bool {
        *self.inner.first_update.borrow()
    }

    /// Start the session if needed and wait for the first full update
    ///
    /// Returns `false` if it did not arrive within the configured update
    /// timeout.
    pub async fn update(&self) -> bool {
        self.update_within(self.inner.config.update_timeout).await
    }

    /// Like [`Device::update`] with an explicit time limit
    pub async fn update_within(&self, limit: Duration) -> bool {
        if self.first_update_complete() {
            return true;
        }
        self.start();
        let mut rx = self.inner.first_update.subscribe();
        let done = matches!(timeout(limit, rx.wait_for(|done| *done)).await, Ok(Ok(_)));
        done
    }

    // ========== Subscribers ==========

    /// Register a change handler; registering the same handler twice is a no-op
    pub fn add_callback(&self, callback: Callback<DeviceEvent>) -> SubscriptionId {
        let id = self.inner.subscribers.add(callback);
        tracing::debug!("{}: Added callback", self.inner.name);
        id
    }

    pub fn remove_callback(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.subscribers.remove(id);
        if removed {
            tracing::debug!("{}: Removed callback", self.inner.name);
        }
        removed
    }

    // ========== Parameters ==========

    /// Raw value of a parameter
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .params
            .get(key)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    /// Copy of every known parameter
    pub fn params(&self) -> BTreeMap<ParamKey, String> {
        self.inner.lock().params.snapshot()
    }

    pub(crate) fn get_on(&self, key: &str) -> Option<bool> {
        self.get(key).map(|value| value == "ON")
    }

    pub(crate) fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key)?.trim().parse().ok()
    }

    /// Two-valued parameter such as bookends
    pub(crate) fn get_pair<T: FromStr>(&self, key: &str) -> Option<(T, T)> {
        let raw = self.get(key)?;
        let mut values = raw.split(';');
        let (Some(first), Some(second), None) = (values.next(), values.next(), values.next())
        else {
            return None;
        };
        Some((first.trim().parse().ok()?, second.trim().parse().ok()?))
    }

    fn network_param(&self, index: usize) -> Option<String> {
        self.get("NW;PARAMS;ACTUAL")?
            .split(';')
            .nth(index)
            .map(str::to_string)
    }

    /// Queue a command on the live session
    ///
    /// The device's answer, if any, arrives later through the session.
    pub fn send_command(&self, command: &Command) -> Result<()> {
        let sender = self
            .inner
            .lock()
            .sender
            .clone()
            .ok_or(SensemeError::NotConnected)?;
        sender.send(command)
    }

    pub(crate) fn set_on_off(&self, path: &str, state: bool) -> Result<()> {
        self.send_command(&Command::value(self.name(), path, on_off(state)))
    }

    pub(crate) fn set_value(&self, path: &str, value: impl fmt::Display) -> Result<()> {
        self.send_command(&Command::set(self.name(), path, value))
    }

    pub(crate) fn set_bookends(&self, path: &str, min: u8, max: u8) -> Result<()> {
        if min >= max {
            return Err(SensemeError::InvalidArgument(format!(
                "minimum {min} must be below maximum {max}"
            )));
        }
        self.set_value(path, format!("{min};{max}"))
    }

    // ========== Common properties ==========

    /// LED indicator enabled
    pub fn indicators(&self) -> Option<bool> {
        self.get_on("DEVICE;INDICATORS")
    }

    pub fn set_indicators(&self, enabled: bool) -> Result<()> {
        self.set_on_off("DEVICE;INDICATORS", enabled)
    }

    /// Audible beeper enabled
    pub fn beeper(&self) -> Option<bool> {
        self.get_on("DEVICE;BEEPER")
    }

    pub fn set_beeper(&self, enabled: bool) -> Result<()> {
        self.set_on_off("DEVICE;BEEPER", enabled)
    }

    /// Wireless access point running
    pub fn network_ap_on(&self) -> Option<bool> {
        self.get_on("NW;AP;STATUS")
    }

    /// Local DHCP service running
    pub fn network_dhcp_on(&self) -> Option<bool> {
        self.get_on("NW;DHCP")
    }

    /// IP address reported by the device, not necessarily the one used to reach it
    pub fn network_ip(&self) -> Option<String> {
        self.network_param(0)
    }

    pub fn network_gateway(&self) -> Option<String> {
        self.network_param(1)
    }

    pub fn network_subnet_mask(&self) -> Option<String> {
        self.network_param(2)
    }

    pub fn network_ssid(&self) -> Option<String> {
        self.get("NW;SSID")
    }

    pub fn network_token(&self) -> Option<String> {
        self.get("NW;TOKEN")
    }

    /// Light is on at any brightness
    pub fn light_on(&self) -> Option<bool> {
        self.get_on("LIGHT;PWR")
    }

    pub fn set_light_on(&self, on: bool) -> Result<()> {
        self.set_on_off("LIGHT;PWR", on)
    }

    pub fn light_brightness(&self) -> Option<u8> {
        self.get_parsed("LIGHT;LEVEL;ACTUAL")
    }

    /// Set brightness, clamped to 0..=16
    pub fn set_light_brightness(&self, level: u8) -> Result<()> {
        self.set_value("LIGHT;LEVEL", level.min(16))
    }

    pub fn light_brightness_min(&self) -> Option<u8> {
        self.get_parsed("LIGHT;LEVEL;MIN")
    }

    pub fn light_brightness_max(&self) -> Option<u8> {
        self.get_parsed("LIGHT;LEVEL;MAX")
    }

    /// Min/max brightness the room allows
    pub fn light_brightness_limits_room(&self) -> Option<(u8, u8)> {
        self.get_pair("LIGHT;BOOKENDS")
    }

    pub fn set_light_brightness_limits_room(&self, min: u8, max: u8) -> Result<()> {
        self.set_bookends("LIGHT;BOOKENDS", min, max)
    }

    /// True when the motion sensor reports the room as occupied
    pub fn motion_sensor(&self) -> Option<bool> {
        self.get("SNSROCC;STATUS").map(|status| status == "OCCUPIED")
    }

    // ========== Snapshot ==========

    pub fn info(&self) -> DeviceInfo {
        let state = self.inner.lock();
        DeviceInfo {
            name: self.inner.name.clone(),
            id: self.inner.id.clone(),
            address: self.inner.address,
            model: self.model(),
            base_model: self.inner.base_model.clone(),
            device_type: self.inner.device_type,
            fw_name: state.info.fw_name.clone(),
            fw_version: state.info.fw_version.clone(),
            has_light: if self.is_light() { Some(true) } else { state.info.has_light },
            room_name: state.info.room_name.clone(),
            room_type: state.info.room_type.as_deref().map(|t| types::room_type_name(t).to_string()),
            connected: state.session == SessionState::Connected,
            params: state.params.snapshot(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.info())?)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<DeviceInner> {
        &self.inner
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("device_type", &self.inner.device_type)
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name: {}", self.inner.name)?;
        if let Some(room) = self.room_name() {
            write!(f, ", Room Name: {room}")?;
        }
        write!(f, ", ID: {}, IP: {}, Model: {}", self.inner.id, self.inner.address, self.model())?;
        if let Some(version) = self.fw_version() {
            write!(f, ", FW Version: {version}")?;
        }
        if self.is_fan() {
            if let Some(has_light) = self.has_light() {
                write!(f, ", Has Light: {has_light}")?;
            }
        }
        Ok(())
    }
}
