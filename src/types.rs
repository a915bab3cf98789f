use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Hardware identifier (MAC address) of a device
pub type DeviceId = String;

/// Parameter key, the dotted command path such as `FAN;SPD;ACTUAL`
pub type ParamKey = String;

/// Base model string to friendly model name
const DEVICE_MODELS: &[(&str, &str)] = &[
    ("FAN,HAIKU,SENSEME", "Haiku Fan"),
    // H Series is now called plain Haiku
    ("FAN,HAIKU,HSERIES", "Haiku Fan"),
    ("FAN,LSERIES", "Haiku L Fan"),
    ("LIGHT,HAIKU", "Haiku Light"),
];

/// Base model string to device classification
const DEVICE_TYPES: &[(&str, DeviceType)] = &[
    ("FAN,HAIKU,SENSEME", DeviceType::Fan),
    ("FAN,HAIKU,HSERIES", DeviceType::Fan),
    ("FAN,LSERIES", DeviceType::Fan),
    ("LIGHT,HAIKU", DeviceType::Light),
];

/// Models that answer discovery but do not speak the session protocol
const IGNORE_MODELS: &[&str] = &["SWITCH,SENSEME"];

const ROOM_TYPES: &[&str] = &[
    "Undefined",
    "Other",
    "Master Bedroom",
    "Bedroom",
    "Den",
    "Family Room",
    "Living Room",
    "Kids Room",
    "Kitchen",
    "Dining Room",
    "Basement",
    "Office",
    "Patio",
    "Porch",
    "Hallway",
    "Entryway",
    "Bathroom",
    "Laundry",
    "Stairs",
    "Closet",
    "Sunroom",
    "Media Room",
    "Gym",
    "Garage",
    "Outside",
    "Loft",
    "Playroom",
    "Pantry",
    "Mudroom",
];

/// Friendly model name for a base model string
///
/// Unknown models are returned upper-cased.
pub fn model_name(base_model: &str) -> String {
    let upper = base_model.to_uppercase();
    DEVICE_MODELS
        .iter()
        .find(|(model, _)| *model == upper)
        .map(|(_, name)| (*name).to_string())
        .unwrap_or(upper)
}

/// Distinct friendly model names
pub fn model_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Vec::new();
    for &(_, name) in DEVICE_MODELS {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// True if devices of this base model should be skipped by discovery
pub fn is_ignored_model(base_model: &str) -> bool {
    let upper = base_model.to_uppercase();
    IGNORE_MODELS.iter().any(|m| *m == upper)
}

/// Room type name for the numeric `GROUP;ROOM;TYPE` value
///
/// Out of range and unparseable values map to "Undefined".
pub fn room_type_name(value: &str) -> &'static str {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|index| ROOM_TYPES.get(index).copied())
        .unwrap_or(ROOM_TYPES[0])
}

/// Numeric `GROUP;ROOM;TYPE` value for a room type name or number
pub(crate) fn room_type_code(value: &str) -> Option<String> {
    let value = value.trim();
    if value.parse::<usize>().is_ok() {
        return Some(value.to_string());
    }
    ROOM_TYPES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(value))
        .map(|index| index.to_string())
}

/// Device classification, fixed at construction from the base model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceType {
    Fan,
    Light,
}

impl DeviceType {
    /// Classify a base model string; unrecognized models are fans
    pub fn from_model(base_model: &str) -> Self {
        let upper = base_model.to_uppercase();
        DEVICE_TYPES
            .iter()
            .find(|(model, _)| *model == upper)
            .map(|(_, kind)| *kind)
            .unwrap_or(DeviceType::Fan)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Fan => f.write_str("FAN"),
            DeviceType::Light => f.write_str("LIGHT"),
        }
    }
}

/// Fan rotation direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "FWD")]
    Forward,
    #[serde(rename = "REV")]
    Reverse,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "FWD",
            Direction::Reverse => "REV",
        }
    }
}

impl FromStr for Direction {
    type Err = crate::error::SensemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "FWD" => Ok(Direction::Forward),
            "REV" => Ok(Direction::Reverse),
            other => Err(crate::error::SensemeError::InvalidArgument(format!(
                "{other} is not a valid direction"
            ))),
        }
    }
}

/// Auto comfort (smart mode) setting
///
/// - `Off`: no automatic adjustment
/// - `Cooling`: speed increases with temperature
/// - `Heating`: slow mixing while occupied, faster while unoccupied
/// - `FollowThermostat`: switch between cooling and heating from the thermostat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AutoComfort {
    Off,
    Cooling,
    Heating,
    #[serde(rename = "FOLLOWTSTAT")]
    FollowThermostat,
}

impl AutoComfort {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoComfort::Off => "OFF",
            AutoComfort::Cooling => "COOLING",
            AutoComfort::Heating => "HEATING",
            AutoComfort::FollowThermostat => "FOLLOWTSTAT",
        }
    }
}

impl FromStr for AutoComfort {
    type Err = crate::error::SensemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OFF" => Ok(AutoComfort::Off),
            "COOLING" => Ok(AutoComfort::Cooling),
            "HEATING" => Ok(AutoComfort::Heating),
            "FOLLOWTSTAT" => Ok(AutoComfort::FollowThermostat),
            other => Err(crate::error::SensemeError::InvalidArgument(format!(
                "{other} is not a valid auto comfort mode"
            ))),
        }
    }
}

/// Lifecycle of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Stopped explicitly, or gave up after too many errors
    Stopped,
}

/// Change notification delivered to device subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    Changed { key: ParamKey, value: String },
}

/// Serializable snapshot of a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub id: DeviceId,
    pub address: IpAddr,
    pub model: String,
    pub base_model: String,
    pub device_type: DeviceType,
    pub fw_name: Option<String>,
    pub fw_version: Option<String>,
    pub has_light: Option<bool>,
    pub room_name: Option<String>,
    pub room_type: Option<String>,
    pub connected: bool,
    pub params: BTreeMap<ParamKey, String>,
}

pub(crate) fn on_off(state: bool) -> &'static str {
    if state {
        "ON"
    } else {
        "OFF"
    }
}
