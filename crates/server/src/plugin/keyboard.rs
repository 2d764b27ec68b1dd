//! NKRO keyboard plugin
//!
//! Input frames are length-prefixed: a modifier byte, a count byte, then
//! `count` HID keycodes. The interrupt-IN report is 34 bytes: modifiers,
//! one reserved byte, and a 256-bit key bitmap, so any number of keys can
//! be held at once. Feedback is the 1-byte LED bitmap from SET_REPORT.

use super::descriptors::{self, DescriptorBundle, HidDeviceSpec};
use super::{DevicePlugin, Direction, PluginError};

/// Interrupt-IN report: modifiers + reserved + 256-bit bitmap
const IN_REPORT_LEN: usize = 34;
/// LED bitmap
const OUT_REPORT_LEN: usize = 1;
/// First bitmap byte inside the report
const BITMAP_OFFSET: usize = 2;

#[rustfmt::skip]
const REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01,       // Usage Page (Generic Desktop)
    0x09, 0x06,       // Usage (Keyboard)
    0xA1, 0x01,       // Collection (Application)
    0x05, 0x07,       //   Usage Page (Keyboard/Keypad)
    0x19, 0xE0,       //   Usage Minimum (Left Control)
    0x29, 0xE7,       //   Usage Maximum (Right GUI)
    0x15, 0x00,       //   Logical Minimum (0)
    0x25, 0x01,       //   Logical Maximum (1)
    0x75, 0x01,       //   Report Size (1)
    0x95, 0x08,       //   Report Count (8)
    0x81, 0x02,       //   Input (Data,Var,Abs)
    0x75, 0x08,       //   Report Size (8)
    0x95, 0x01,       //   Report Count (1)
    0x81, 0x01,       //   Input (Const)
    0x05, 0x08,       //   Usage Page (LEDs)
    0x19, 0x01,       //   Usage Minimum (Num Lock)
    0x29, 0x05,       //   Usage Maximum (Kana)
    0x75, 0x01,       //   Report Size (1)
    0x95, 0x05,       //   Report Count (5)
    0x91, 0x02,       //   Output (Data,Var,Abs)
    0x75, 0x03,       //   Report Size (3)
    0x95, 0x01,       //   Report Count (1)
    0x91, 0x01,       //   Output (Const)
    0x05, 0x07,       //   Usage Page (Keyboard/Keypad)
    0x19, 0x00,       //   Usage Minimum (0)
    0x2A, 0xFF, 0x00, //   Usage Maximum (255)
    0x15, 0x00,       //   Logical Minimum (0)
    0x25, 0x01,       //   Logical Maximum (1)
    0x75, 0x01,       //   Report Size (1)
    0x96, 0x00, 0x01, //   Report Count (256)
    0x81, 0x02,       //   Input (Data,Var,Abs)
    0xC0,             // End Collection
];

pub struct KeyboardPlugin;

impl DevicePlugin for KeyboardPlugin {
    fn kind(&self) -> &'static str {
        "keyboard"
    }

    fn descriptors(&self) -> DescriptorBundle {
        descriptors::build_bundle(HidDeviceSpec {
            vendor_id: 0x1d50,
            product_id: 0x61a0,
            bcd_device: 0x0100,
            manufacturer: "viiper",
            product: "viiper keyboard",
            serial: "0001",
            interface_subclass: 0,
            interface_protocol: 1,
            report_descriptor: REPORT_DESCRIPTOR.to_vec(),
            in_report_len: IN_REPORT_LEN as u16,
            out_report_len: Some(OUT_REPORT_LEN as u16),
            interval_ms: 8,
        })
    }

    fn report_size(&self, direction: Direction) -> usize {
        match direction {
            Direction::In => IN_REPORT_LEN,
            Direction::Out => OUT_REPORT_LEN,
        }
    }

    fn input_preamble(&self) -> usize {
        2
    }

    fn input_frame_len(&self, preamble: &[u8]) -> Result<usize, PluginError> {
        debug_assert_eq!(preamble.len(), 2);
        Ok(2 + preamble[1] as usize)
    }

    fn decode_input(&self, frame: &[u8]) -> Result<Vec<u8>, PluginError> {
        if frame.len() < 2 {
            return Err(PluginError::Input("keyboard frame shorter than header".into()));
        }
        let count = frame[1] as usize;
        if frame.len() != 2 + count {
            return Err(PluginError::Input(format!(
                "keyboard frame length {} does not match count {}",
                frame.len(),
                count
            )));
        }

        let mut report = vec![0u8; IN_REPORT_LEN];
        report[0] = frame[0];
        for &key in &frame[2..] {
            report[BITMAP_OFFSET + (key as usize) / 8] |= 1 << (key & 7);
        }
        Ok(report)
    }

    fn encode_feedback(&self, payload: &[u8]) -> Vec<u8> {
        // LED state is a single byte; tolerate longer SET_REPORT payloads
        // by forwarding only the bitmap.
        payload.iter().take(OUT_REPORT_LEN).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_a_press() {
        let plugin = KeyboardPlugin;
        // Shift held, one key: 0x04 ('a')
        let report = plugin.decode_input(&[0x02, 1, 0x04]).unwrap();
        assert_eq!(report.len(), 34);
        assert_eq!(report[0], 0x02);
        assert_eq!(report[2], 1 << 4);
        assert!(report[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_release_all() {
        let plugin = KeyboardPlugin;
        let report = plugin.decode_input(&[0x00, 0]).unwrap();
        assert_eq!(report, vec![0u8; 34]);
    }

    #[test]
    fn test_chord_sets_multiple_bits() {
        let plugin = KeyboardPlugin;
        let report = plugin.decode_input(&[0x00, 3, 0x04, 0x05, 0xFF]).unwrap();
        assert_eq!(report[2], (1 << 4) | (1 << 5));
        assert_eq!(report[2 + 31], 1 << 7);
    }

    #[test]
    fn test_frame_len_from_preamble() {
        let plugin = KeyboardPlugin;
        assert_eq!(plugin.input_frame_len(&[0x02, 0]).unwrap(), 2);
        assert_eq!(plugin.input_frame_len(&[0x02, 6]).unwrap(), 8);
        assert_eq!(plugin.input_frame_len(&[0x00, 0xFF]).unwrap(), 257);
    }

    #[test]
    fn test_count_mismatch_rejected() {
        let plugin = KeyboardPlugin;
        assert!(plugin.decode_input(&[0x00, 2, 0x04]).is_err());
        assert!(plugin.decode_input(&[0x00]).is_err());
    }

    #[test]
    fn test_led_feedback_passthrough() {
        let plugin = KeyboardPlugin;
        assert_eq!(plugin.encode_feedback(&[0x02]), vec![0x02]);
        assert_eq!(plugin.encode_feedback(&[0x03, 0x00]), vec![0x03]);
    }

    #[test]
    fn test_descriptor_sizes() {
        let plugin = KeyboardPlugin;
        let bundle = plugin.descriptors();
        assert_eq!(bundle.device.len(), 18);
        assert!(bundle.out_endpoint.is_some());
        assert_eq!(bundle.hid_report, REPORT_DESCRIPTOR);
    }
}
