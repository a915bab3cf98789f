//! Rust library for discovering and controlling SenseME networked fans and lights
//!
//! This library provides an async API for Haiku fans and lights that speak the
//! SenseME protocol on the local network. It supports:
//!
//! - Discovery by UDP broadcast on every local interface
//! - A persistent session per device that mirrors every device parameter
//! - Automatic reconnection and periodic full refresh
//! - Typed getters and fire-and-forget setters for fans and lights
//! - Change subscriptions for devices and for the discovered device set
//!
//! # Quick Start
//!
//! ```no_run
//! use senseme::{callback, discover, CallbackError, DeviceEvent};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Find a device by name, room name or IP address
//!     let Some(device) = discover("Bedroom Fan", Duration::from_secs(5)).await else {
//!         return Ok(());
//!     };
//!
//!     // Subscribe to state updates
//!     device.add_callback(callback(|event: DeviceEvent| async move {
//!         println!("{:?}", event);
//!         Ok::<(), CallbackError>(())
//!     }));
//!
//!     if let Some(fan) = device.as_fan() {
//!         fan.set_on(true)?;
//!         fan.set_speed(3)?;
//!     }
//!
//!     device.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Direct Connection
//!
//! If you know the IP address of a device, you can look it up directly:
//!
//! ```no_run
//! use senseme::{get_device_by_ip_address, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     if let Some(device) = get_device_by_ip_address("192.168.1.100", SessionConfig::default()).await {
//!         if device.update().await {
//!             println!("{}", device);
//!         }
//!         device.stop();
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Discovery**: broadcast cycle, endpoint set and the shared device registry
//! - **Device**: common state core with `Fan` and `Light` views
//! - **Session**: connection loop, receive loop and periodic refresh
//! - **Connection**: persistent and short-lived TCP transports
//! - **Protocol**: record framing, message parsing and command encoding
//! - **Types**: model tables and domain types

mod client;
mod config;
mod connection;
mod device;
mod discovery;
mod endpoint;
mod error;
mod fan;
mod light;
mod protocol;
mod registry;
mod session;
mod store;
mod subscription;
mod types;

// Public exports
pub use config::{DiscoveryConfig, NewDevicePolicy, SessionConfig, DEFAULT_PORT};
pub use device::{Device, DeviceVariant};
pub use discovery::{
    discover, discover_all, discover_all_with, discover_any, discover_any_with, discover_with,
    get_device_by_device_info, get_device_by_ip_address, Discovery,
};
pub use error::{Result, SensemeError};
pub use fan::{Fan, COOL_TEMP_MAX, COOL_TEMP_MIN};
pub use light::Light;
pub use protocol::{value_count, Command, DiscoveryReply, FrameDecoder, Message};
pub use registry::DeviceRegistry;
pub use store::{ParameterStore, StoreUpdate};
pub use subscription::{
    callback, Callback, CallbackError, CallbackResult, Subscribers, SubscriptionId,
};
pub use types::{
    model_name, room_type_name, AutoComfort, DeviceEvent, DeviceId, DeviceInfo, DeviceType,
    Direction, ParamKey, SessionState,
};
