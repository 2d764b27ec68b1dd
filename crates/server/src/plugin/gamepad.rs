//! Game controller plugin
//!
//! Input frames are fixed-width 8-byte reports: 16 buttons (little-endian
//! bitmap), two sticks (signed X/Y and Rx/Ry) and two unsigned triggers.
//! Feedback is a 2-byte rumble frame (left and right motor magnitude)
//! delivered through SET_REPORT or the interrupt-OUT endpoint.

use super::descriptors::{self, DescriptorBundle, HidDeviceSpec};
use super::{DevicePlugin, Direction, PluginError};

/// buttons (2), lx, ly, rx, ry, lt, rt
const IN_REPORT_LEN: usize = 8;
/// left motor, right motor
const OUT_REPORT_LEN: usize = 2;

#[rustfmt::skip]
const REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01,       // Usage Page (Generic Desktop)
    0x09, 0x05,       // Usage (Gamepad)
    0xA1, 0x01,       // Collection (Application)
    0x05, 0x09,       //   Usage Page (Button)
    0x19, 0x01,       //   Usage Minimum (1)
    0x29, 0x10,       //   Usage Maximum (16)
    0x15, 0x00,       //   Logical Minimum (0)
    0x25, 0x01,       //   Logical Maximum (1)
    0x75, 0x01,       //   Report Size (1)
    0x95, 0x10,       //   Report Count (16)
    0x81, 0x02,       //   Input (Data,Var,Abs)
    0x05, 0x01,       //   Usage Page (Generic Desktop)
    0x09, 0x30,       //   Usage (X)
    0x09, 0x31,       //   Usage (Y)
    0x09, 0x33,       //   Usage (Rx)
    0x09, 0x34,       //   Usage (Ry)
    0x15, 0x81,       //   Logical Minimum (-127)
    0x25, 0x7F,       //   Logical Maximum (127)
    0x75, 0x08,       //   Report Size (8)
    0x95, 0x04,       //   Report Count (4)
    0x81, 0x02,       //   Input (Data,Var,Abs)
    0x09, 0x32,       //   Usage (Z)
    0x09, 0x35,       //   Usage (Rz)
    0x15, 0x00,       //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x75, 0x08,       //   Report Size (8)
    0x95, 0x02,       //   Report Count (2)
    0x81, 0x02,       //   Input (Data,Var,Abs)
    0x05, 0x0F,       //   Usage Page (Physical Interface)
    0x09, 0x70,       //   Usage (Magnitude)
    0x15, 0x00,       //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x75, 0x08,       //   Report Size (8)
    0x95, 0x02,       //   Report Count (2)
    0x91, 0x02,       //   Output (Data,Var,Abs)
    0xC0,             // End Collection
];

pub struct GamepadPlugin;

impl DevicePlugin for GamepadPlugin {
    fn kind(&self) -> &'static str {
        "gamepad"
    }

    fn descriptors(&self) -> DescriptorBundle {
        descriptors::build_bundle(HidDeviceSpec {
            vendor_id: 0x1d50,
            product_id: 0x61a2,
            bcd_device: 0x0100,
            manufacturer: "viiper",
            product: "viiper gamepad",
            serial: "0001",
            interface_subclass: 0,
            interface_protocol: 0,
            report_descriptor: REPORT_DESCRIPTOR.to_vec(),
            in_report_len: IN_REPORT_LEN as u16,
            out_report_len: Some(OUT_REPORT_LEN as u16),
            interval_ms: 4,
        })
    }

    fn report_size(&self, direction: Direction) -> usize {
        match direction {
            Direction::In => IN_REPORT_LEN,
            Direction::Out => OUT_REPORT_LEN,
        }
    }

    fn input_preamble(&self) -> usize {
        IN_REPORT_LEN
    }

    fn input_frame_len(&self, _preamble: &[u8]) -> Result<usize, PluginError> {
        Ok(IN_REPORT_LEN)
    }

    fn decode_input(&self, frame: &[u8]) -> Result<Vec<u8>, PluginError> {
        if frame.len() != IN_REPORT_LEN {
            return Err(PluginError::Input(format!(
                "gamepad frame must be {IN_REPORT_LEN} bytes, got {}",
                frame.len()
            )));
        }
        Ok(frame.to_vec())
    }

    fn encode_feedback(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; OUT_REPORT_LEN];
        let n = payload.len().min(OUT_REPORT_LEN);
        frame[..n].copy_from_slice(&payload[..n]);
        frame
    }
}
