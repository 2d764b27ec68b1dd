//! Endpoint-zero control transfers
//!
//! Serves standard device requests from the plugin's descriptor bundle and
//! the HID class requests an input device needs. Anything outside that set
//! stalls the endpoint, which the URB loop reports as `-EPIPE`.

use crate::vbus::VirtualDevice;
use protocol::SetupPacket;
use tracing::{debug, trace};

use crate::plugin::descriptors::{
    DT_CONFIGURATION, DT_DEVICE, DT_DEVICE_QUALIFIER, DT_HID, DT_HID_REPORT, DT_STRING,
};

// Standard request codes (USB 2.0 table 9-4)
const REQ_GET_STATUS: u8 = 0;
const REQ_CLEAR_FEATURE: u8 = 1;
const REQ_SET_FEATURE: u8 = 3;
const REQ_GET_DESCRIPTOR: u8 = 6;
const REQ_GET_CONFIGURATION: u8 = 8;
const REQ_SET_CONFIGURATION: u8 = 9;
const REQ_GET_INTERFACE: u8 = 10;
const REQ_SET_INTERFACE: u8 = 11;

// HID class request codes (HID 1.11 section 7.2)
const HID_GET_REPORT: u8 = 1;
const HID_GET_IDLE: u8 = 2;
const HID_GET_PROTOCOL: u8 = 3;
const HID_SET_REPORT: u8 = 9;
const HID_SET_IDLE: u8 = 10;
const HID_SET_PROTOCOL: u8 = 11;

/// Outcome of a control transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResult {
    /// IN data, already truncated to wLength
    In(Vec<u8>),
    /// Zero-data or OUT success
    Ok,
    /// Stall the endpoint
    Stall,
}

/// Dispatch one control transfer. `out_data` carries the data stage of an
/// OUT transfer (e.g. the SET_REPORT payload) and is empty otherwise.
pub fn handle_control(
    device: &VirtualDevice,
    setup: &SetupPacket,
    out_data: &[u8],
) -> ControlResult {
    let kind = setup.request_type & 0x60;
    let result = match kind {
        0x00 => handle_standard(device, setup),
        0x20 => handle_hid_class(device, setup, out_data),
        _ => ControlResult::Stall,
    };
    trace!(
        request_type = format_args!("{:#04x}", setup.request_type),
        request = setup.request,
        value = setup.value,
        ?result,
        "control transfer"
    );
    if let ControlResult::In(data) = result {
        // The device never answers with more than the host asked for.
        let limit = setup.length as usize;
        let mut data = data;
        data.truncate(limit);
        ControlResult::In(data)
    } else {
        result
    }
}

fn handle_standard(device: &VirtualDevice, setup: &SetupPacket) -> ControlResult {
    let bundle = device.bundle();
    let recipient = setup.request_type & 0x1F;
    match setup.request {
        REQ_GET_DESCRIPTOR => {
            let desc_type = (setup.value >> 8) as u8;
            let index = (setup.value & 0xFF) as u8;
            let data = match (recipient, desc_type) {
                (0, DT_DEVICE) => Some(bundle.device.clone()),
                (0, DT_CONFIGURATION) => Some(bundle.configuration.clone()),
                (0, DT_STRING) => bundle.string_descriptor(index),
                // Full-speed-only device: no high-speed alternate config.
                (0, DT_DEVICE_QUALIFIER) => None,
                (1, DT_HID_REPORT) => Some(bundle.hid_report.clone()),
                (1, DT_HID) => Some(bundle.hid_descriptor().to_vec()),
                _ => None,
            };
            match data {
                Some(data) => ControlResult::In(data),
                None => {
                    debug!(
                        desc_type,
                        index, recipient, "unsupported descriptor request, stalling"
                    );
                    ControlResult::Stall
                }
            }
        }
        REQ_GET_STATUS => ControlResult::In(vec![0, 0]),
        REQ_GET_CONFIGURATION => ControlResult::In(vec![1]),
        REQ_GET_INTERFACE => ControlResult::In(vec![0]),
        REQ_SET_CONFIGURATION | REQ_SET_INTERFACE | REQ_CLEAR_FEATURE | REQ_SET_FEATURE => {
            ControlResult::Ok
        }
        _ => ControlResult::Stall,
    }
}

fn handle_hid_class(device: &VirtualDevice, setup: &SetupPacket, out_data: &[u8]) -> ControlResult {
    match setup.request {
        HID_GET_REPORT => {
            let report_type = (setup.value >> 8) as u8;
            // 1 = input report; output and feature reports are not kept.
            if report_type == 1 {
                ControlResult::In((*device.current_report()).clone())
            } else {
                ControlResult::Stall
            }
        }
        HID_SET_REPORT => {
            let frame = device.plugin().encode_feedback(out_data);
            device.queue_feedback(frame);
            ControlResult::Ok
        }
        HID_GET_IDLE => ControlResult::In(vec![0]),
        HID_GET_PROTOCOL => ControlResult::In(vec![1]),
        HID_SET_IDLE | HID_SET_PROTOCOL => ControlResult::Ok,
        _ => ControlResult::Stall,
    }
}
