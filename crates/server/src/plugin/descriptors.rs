//! USB descriptor assembly for HID devices
//!
//! Builds the little-endian descriptor bytes a plugin hands to the core:
//! device descriptor, the full configuration descriptor (configuration +
//! interface + HID + endpoints), and string descriptors. Layouts follow
//! the USB 2.0 and HID 1.11 specifications; all multi-byte fields are
//! little-endian as required inside transfer buffers.

/// Descriptor type codes (USB 2.0 table 9-5, HID 1.11 section 7.1)
pub const DT_DEVICE: u8 = 1;
pub const DT_CONFIGURATION: u8 = 2;
pub const DT_STRING: u8 = 3;
pub const DT_INTERFACE: u8 = 4;
pub const DT_ENDPOINT: u8 = 5;
pub const DT_DEVICE_QUALIFIER: u8 = 6;
pub const DT_HID: u8 = 0x21;
pub const DT_HID_REPORT: u8 = 0x22;

/// USB/IP speed code for a full-speed device
pub const SPEED_FULL: u32 = 2;

/// Interrupt-IN endpoint number used by every built-in plugin
pub const IN_ENDPOINT: u8 = 1;
/// Interrupt-OUT endpoint number, when the device has one
pub const OUT_ENDPOINT: u8 = 1;

/// Everything a plugin declares about its USB identity
pub struct HidDeviceSpec {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer: &'static str,
    pub product: &'static str,
    pub serial: &'static str,
    /// bInterfaceSubClass (1 = boot interface)
    pub interface_subclass: u8,
    /// bInterfaceProtocol (1 = keyboard, 2 = mouse)
    pub interface_protocol: u8,
    pub report_descriptor: Vec<u8>,
    /// Interrupt-IN report length, also the endpoint max packet size
    pub in_report_len: u16,
    /// Interrupt-OUT report length; None for devices without an OUT endpoint
    pub out_report_len: Option<u16>,
    /// bInterval for the interrupt endpoints, in milliseconds at full speed
    pub interval_ms: u8,
}

/// Assembled descriptor bytes plus the identity fields the USB/IP
/// advertisement needs without parsing them back out.
#[derive(Debug, Clone)]
pub struct DescriptorBundle {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    /// USB/IP wire speed code
    pub speed: u32,
    /// 18-byte device descriptor
    pub device: Vec<u8>,
    /// Full configuration descriptor: configuration, interface, HID,
    /// endpoint(s)
    pub configuration: Vec<u8>,
    /// HID report descriptor
    pub hid_report: Vec<u8>,
    /// String descriptor contents for indices 1.. (manufacturer, product,
    /// serial)
    pub strings: Vec<String>,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub in_endpoint: u8,
    pub out_endpoint: Option<u8>,
}

impl DescriptorBundle {
    /// The 9-byte HID descriptor embedded in the configuration.
    pub fn hid_descriptor(&self) -> &[u8] {
        // configuration(9) + interface(9), then the HID descriptor
        &self.configuration[18..27]
    }

    /// Build a string descriptor for the given index.
    ///
    /// Index 0 is the language id table (US English); indices 1.. are the
    /// UTF-16LE encoded strings. Returns None for an unknown index.
    pub fn string_descriptor(&self, index: u8) -> Option<Vec<u8>> {
        if index == 0 {
            return Some(vec![4, DT_STRING, 0x09, 0x04]);
        }
        let s = self.strings.get(index as usize - 1)?;
        let mut desc = Vec::with_capacity(2 + s.len() * 2);
        desc.push(0);
        desc.push(DT_STRING);
        for unit in s.encode_utf16() {
            desc.extend_from_slice(&unit.to_le_bytes());
        }
        desc[0] = desc.len() as u8;
        Some(desc)
    }
}

/// Assemble the full descriptor bundle for a HID device spec.
pub fn build_bundle(spec: HidDeviceSpec) -> DescriptorBundle {
    let num_endpoints = if spec.out_report_len.is_some() { 2 } else { 1 };

    let mut device = Vec::with_capacity(18);
    device.push(18);
    device.push(DT_DEVICE);
    device.extend_from_slice(&0x0200u16.to_le_bytes()); // bcdUSB
    device.push(0); // class at interface level
    device.push(0);
    device.push(0);
    device.push(64); // bMaxPacketSize0
    device.extend_from_slice(&spec.vendor_id.to_le_bytes());
    device.extend_from_slice(&spec.product_id.to_le_bytes());
    device.extend_from_slice(&spec.bcd_device.to_le_bytes());
    device.push(1); // iManufacturer
    device.push(2); // iProduct
    device.push(3); // iSerialNumber
    device.push(1); // bNumConfigurations

    let total_len = 9 + 9 + 9 + 7 * num_endpoints as u16;
    let mut config = Vec::with_capacity(total_len as usize);
    config.push(9);
    config.push(DT_CONFIGURATION);
    config.extend_from_slice(&total_len.to_le_bytes());
    config.push(1); // bNumInterfaces
    config.push(1); // bConfigurationValue
    config.push(0); // iConfiguration
    config.push(0xA0); // bus powered, remote wakeup
    config.push(50); // 100 mA

    config.push(9);
    config.push(DT_INTERFACE);
    config.push(0); // bInterfaceNumber
    config.push(0); // bAlternateSetting
    config.push(num_endpoints);
    config.push(3); // HID class
    config.push(spec.interface_subclass);
    config.push(spec.interface_protocol);
    config.push(0); // iInterface

    config.push(9);
    config.push(DT_HID);
    config.extend_from_slice(&0x0111u16.to_le_bytes()); // bcdHID
    config.push(0); // bCountryCode
    config.push(1); // bNumDescriptors
    config.push(DT_HID_REPORT);
    config.extend_from_slice(&(spec.report_descriptor.len() as u16).to_le_bytes());

    config.push(7);
    config.push(DT_ENDPOINT);
    config.push(0x80 | IN_ENDPOINT);
    config.push(0x03); // interrupt
    config.extend_from_slice(&spec.in_report_len.to_le_bytes());
    config.push(spec.interval_ms);

    if let Some(out_len) = spec.out_report_len {
        config.push(7);
        config.push(DT_ENDPOINT);
        config.push(OUT_ENDPOINT);
        config.push(0x03);
        config.extend_from_slice(&out_len.to_le_bytes());
        config.push(spec.interval_ms);
    }

    DescriptorBundle {
        vendor_id: spec.vendor_id,
        product_id: spec.product_id,
        bcd_device: spec.bcd_device,
        speed: SPEED_FULL,
        device,
        configuration: config,
        hid_report: spec.report_descriptor,
        strings: vec![
            spec.manufacturer.to_string(),
            spec.product.to_string(),
            spec.serial.to_string(),
        ],
        interface_class: 3,
        interface_subclass: spec.interface_subclass,
        interface_protocol: spec.interface_protocol,
        in_endpoint: IN_ENDPOINT,
        out_endpoint: spec.out_report_len.map(|_| OUT_ENDPOINT),
    }
}
