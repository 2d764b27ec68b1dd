//! Device plugin contract
//!
//! A plugin supplies everything device-kind-specific: the USB descriptor
//! bundle, the interrupt report sizes, and the codecs between the stream
//! client's framing and host-visible HID reports. Plugins are stateless
//! with respect to device instances; one plugin value serves every device
//! of its kind.
//!
//! Input framing is plugin-chosen and opaque to the core. The core reads
//! [`DevicePlugin::input_preamble`] bytes from the stream, asks the plugin
//! for the full frame length, reads the remainder, and hands the complete
//! frame to [`DevicePlugin::decode_input`] — exactly one message per call.

pub mod descriptors;
mod gamepad;
mod keyboard;
mod mouse;

pub use descriptors::DescriptorBundle;
pub use gamepad::GamepadPlugin;
pub use keyboard::KeyboardPlugin;
pub use mouse::MousePlugin;

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Transfer direction of an interrupt report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host (input reports)
    In,
    /// Host to device (feedback such as LEDs or rumble)
    Out,
}

#[derive(Debug, Error)]
pub enum PluginError {
    /// Client sent a frame the plugin cannot decode
    #[error("invalid input frame: {0}")]
    Input(String),
}

/// A device-kind codec registered under a string kind
pub trait DevicePlugin: Send + Sync {
    /// Registered kind, e.g. `"keyboard"`
    fn kind(&self) -> &'static str;

    /// The USB identity and descriptor bytes for devices of this kind
    fn descriptors(&self) -> DescriptorBundle;

    /// Size of the interrupt report in the given direction; 0 when the
    /// device has no report in that direction
    fn report_size(&self, direction: Direction) -> usize;

    /// Bytes the core must read before the input frame length is known
    fn input_preamble(&self) -> usize;

    /// Total input frame length implied by the preamble bytes
    fn input_frame_len(&self, preamble: &[u8]) -> Result<usize, PluginError>;

    /// Decode one complete input frame into the next interrupt-IN report
    fn decode_input(&self, frame: &[u8]) -> Result<Vec<u8>, PluginError>;

    /// Wrap a SET_REPORT / interrupt-OUT payload for the stream client
    fn encode_feedback(&self, payload: &[u8]) -> Vec<u8>;

    /// The report a device shows before any input arrives
    fn zero_report(&self) -> Vec<u8> {
        vec![0u8; self.report_size(Direction::In)]
    }
}

/// An explicit set of plugins handed to the server at construction.
///
/// Built-ins cover keyboard, mouse and gamepad; embedders may register
/// further kinds. Tests get a clean set per fixture with no global state
/// to tear down.
#[derive(Clone)]
pub struct PluginSet {
    plugins: HashMap<&'static str, Arc<dyn DevicePlugin>>,
}

impl PluginSet {
    /// An empty set
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// The built-in device kinds
    pub fn builtin() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(KeyboardPlugin));
        set.register(Arc::new(MousePlugin));
        set.register(Arc::new(GamepadPlugin));
        set
    }

    /// Register a plugin under its kind, replacing any previous one
    pub fn register(&mut self, plugin: Arc<dyn DevicePlugin>) {
        self.plugins.insert(plugin.kind(), plugin);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn DevicePlugin>> {
        self.plugins.get(kind).cloned()
    }

    /// Registered kinds in sorted order
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.plugins.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for PluginSet {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let set = PluginSet::builtin();
        assert_eq!(set.kinds(), vec!["gamepad", "keyboard", "mouse"]);
        assert!(set.get("keyboard").is_some());
        assert!(set.get("trackball").is_none());
    }

    #[test]
    fn test_zero_report_matches_in_size() {
        let set = PluginSet::builtin();
        for kind in set.kinds() {
            let plugin = set.get(kind).unwrap();
            assert_eq!(
                plugin.zero_report().len(),
                plugin.report_size(Direction::In),
                "kind {kind}"
            );
        }
    }
}
