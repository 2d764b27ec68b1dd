//! viiper server library
//!
//! A user-space server that synthesizes virtual USB input devices and
//! exports them over the USB/IP protocol. External producers create and
//! drive devices through the management/stream port; any USB/IP-capable
//! initiator can list, import and poll them as if they were hardware on a
//! hub.
//!
//! The binary entry point is `viiper` (see `main.rs`); everything here is
//! also usable as a library, which is how the integration tests drive a
//! full in-process server.

pub mod config;
pub mod mgmt;
pub mod plugin;
pub mod proxy;
pub mod service;
pub mod usbip;
pub mod vbus;

pub use config::ServerConfig;
pub use plugin::{DevicePlugin, PluginSet};
pub use service::{Limits, ServerCtx, ServerHandle, bind};
pub use vbus::Registry;
