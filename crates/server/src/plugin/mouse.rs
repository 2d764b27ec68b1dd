//! Relative mouse plugin
//!
//! Input frames are fixed-width: button bitmap, signed dx, dy, wheel and
//! horizontal pan, one byte each. The frame is the interrupt-IN report,
//! so decoding is a validated pass-through. The mouse produces no
//! feedback and has no OUT endpoint.

use super::descriptors::{self, DescriptorBundle, HidDeviceSpec};
use super::{DevicePlugin, Direction, PluginError};

/// buttons, dx, dy, wheel, pan
const REPORT_LEN: usize = 5;

#[rustfmt::skip]
const REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01,       // Usage Page (Generic Desktop)
    0x09, 0x02,       // Usage (Mouse)
    0xA1, 0x01,       // Collection (Application)
    0x09, 0x01,       //   Usage (Pointer)
    0xA1, 0x00,       //   Collection (Physical)
    0x05, 0x09,       //     Usage Page (Button)
    0x19, 0x01,       //     Usage Minimum (1)
    0x29, 0x08,       //     Usage Maximum (8)
    0x15, 0x00,       //     Logical Minimum (0)
    0x25, 0x01,       //     Logical Maximum (1)
    0x75, 0x01,       //     Report Size (1)
    0x95, 0x08,       //     Report Count (8)
    0x81, 0x02,       //     Input (Data,Var,Abs)
    0x05, 0x01,       //     Usage Page (Generic Desktop)
    0x09, 0x30,       //     Usage (X)
    0x09, 0x31,       //     Usage (Y)
    0x09, 0x38,       //     Usage (Wheel)
    0x15, 0x81,       //     Logical Minimum (-127)
    0x25, 0x7F,       //     Logical Maximum (127)
    0x75, 0x08,       //     Report Size (8)
    0x95, 0x03,       //     Report Count (3)
    0x81, 0x06,       //     Input (Data,Var,Rel)
    0x05, 0x0C,       //     Usage Page (Consumer)
    0x0A, 0x38, 0x02, //     Usage (AC Pan)
    0x15, 0x81,       //     Logical Minimum (-127)
    0x25, 0x7F,       //     Logical Maximum (127)
    0x75, 0x08,       //     Report Size (8)
    0x95, 0x01,       //     Report Count (1)
    0x81, 0x06,       //     Input (Data,Var,Rel)
    0xC0,             //   End Collection
    0xC0,             // End Collection
];

pub struct MousePlugin;

impl DevicePlugin for MousePlugin {
    fn kind(&self) -> &'static str {
        "mouse"
    }

    fn descriptors(&self) -> DescriptorBundle {
        descriptors::build_bundle(HidDeviceSpec {
            vendor_id: 0x1d50,
            product_id: 0x61a1,
            bcd_device: 0x0100,
            manufacturer: "viiper",
            product: "viiper mouse",
            serial: "0001",
            interface_subclass: 0,
            interface_protocol: 2,
            report_descriptor: REPORT_DESCRIPTOR.to_vec(),
            in_report_len: REPORT_LEN as u16,
            out_report_len: None,
            interval_ms: 8,
        })
    }

    fn report_size(&self, direction: Direction) -> usize {
        match direction {
            Direction::In => REPORT_LEN,
            Direction::Out => 0,
        }
    }

    fn input_preamble(&self) -> usize {
        REPORT_LEN
    }

    fn input_frame_len(&self, _preamble: &[u8]) -> Result<usize, PluginError> {
        Ok(REPORT_LEN)
    }

    fn decode_input(&self, frame: &[u8]) -> Result<Vec<u8>, PluginError> {
        if frame.len() != REPORT_LEN {
            return Err(PluginError::Input(format!(
                "mouse frame must be {REPORT_LEN} bytes, got {}",
                frame.len()
            )));
        }
        Ok(frame.to_vec())
    }

    fn encode_feedback(&self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_click_and_move_passthrough() {
        let plugin = MousePlugin;
        let frame = [0x01, 50, 50, 0, 0];
        assert_eq!(plugin.decode_input(&frame).unwrap(), frame.to_vec());
    }

    #[test]
    fn test_release_report() {
        let plugin = MousePlugin;
        let report = plugin.decode_input(&[0x00, 0, 0, 0, 0]).unwrap();
        assert_eq!(report, vec![0u8; 5]);
    }

    #[test]
    fn test_negative_motion_bytes() {
        let plugin = MousePlugin;
        // -10 as two's-complement byte
        let frame = [0x00, 0xF6, 0xF6, 0xFF, 0x00];
        let report = plugin.decode_input(&frame).unwrap();
        assert_eq!(report[1] as i8, -10);
        assert_eq!(report[3] as i8, -1);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let plugin = MousePlugin;
        assert!(plugin.decode_input(&[0x01, 50, 50, 0]).is_err());
        assert!(plugin.decode_input(&[0x01, 50, 50, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_no_out_endpoint() {
        let plugin = MousePlugin;
        assert_eq!(plugin.report_size(Direction::Out), 0);
        assert!(plugin.descriptors().out_endpoint.is_none());
    }
}
