//! USB/IP wire protocol
//!
//! Implements the device-side half of the Linux USB/IP protocol, as spoken
//! with `vhci-hcd` and the `usbip` tooling. The layout follows the kernel
//! header (drivers/usb/usbip/usbip_common.h) exactly:
//!
//! - All integers are big-endian (network byte order).
//! - The setup phase exchanges OP messages with an 8-byte header
//!   (version, code, status).
//! - The URB phase exchanges 48-byte messages: a 20-byte basic header
//!   (command, seqnum, devid, direction, ep) followed by a 28-byte
//!   command/return block, padded where the kernel pads.
//! - OUT submits append `transfer_buffer_length` bytes of data after the
//!   header; IN returns append `actual_length` bytes.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// USB/IP protocol version (1.1.1)
pub const USBIP_VERSION: u16 = 0x0111;

/// Request the list of exportable devices
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Reply to OP_REQ_DEVLIST
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Request import of one device by bus id
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Reply to OP_REQ_IMPORT
pub const OP_REP_IMPORT: u16 = 0x0003;

/// OP status: success
pub const OP_STATUS_OK: u32 = 0;
/// OP status: generic failure (device unavailable, bad request)
pub const OP_STATUS_ERROR: u32 = 1;

/// URB direction: host to device
pub const USBIP_DIR_OUT: u32 = 0;
/// URB direction: device to host
pub const USBIP_DIR_IN: u32 = 1;

/// Wire size of the OP header
pub const OP_HEADER_SIZE: usize = 8;
/// Wire size of every URB-phase message header
pub const URB_HEADER_SIZE: usize = 48;
/// Wire size of the fixed part of an exported-device record
pub const DEVICE_RECORD_SIZE: usize = 312;

/// URB completion status: success
pub const ST_OK: i32 = 0;
/// URB completion status for an unlinked submit (-ECONNRESET)
pub const ST_CONNRESET: i32 = -104;
/// URB completion status when the device is gone (-ENODEV)
pub const ST_NODEV: i32 = -19;
/// URB completion status for a stalled endpoint (-EPIPE)
pub const ST_PIPE: i32 = -32;

/// URB-phase command codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbCommand {
    /// Submit a URB
    CmdSubmit = 0x0000_0001,
    /// Cancel a previously submitted URB
    CmdUnlink = 0x0000_0002,
    /// Completion of a submit
    RetSubmit = 0x0000_0003,
    /// Completion of an unlink
    RetUnlink = 0x0000_0004,
}

impl UrbCommand {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0x0000_0001 => Ok(Self::CmdSubmit),
            0x0000_0002 => Ok(Self::CmdUnlink),
            0x0000_0003 => Ok(Self::RetSubmit),
            0x0000_0004 => Ok(Self::RetUnlink),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// OP-phase message header (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    /// Protocol version, [`USBIP_VERSION`]
    pub version: u16,
    /// OP code
    pub code: u16,
    /// Status, 0 on success
    pub status: u32,
}

impl OpHeader {
    pub fn request(code: u16) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status: OP_STATUS_OK,
        }
    }

    pub fn reply(code: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status,
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            version: reader.read_u16::<BigEndian>()?,
            code: reader.read_u16::<BigEndian>()?,
            status: reader.read_u32::<BigEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.code)?;
        writer.write_u32::<BigEndian>(self.status)?;
        Ok(())
    }
}

/// Per-interface record in an OP_REP_DEVLIST reply (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceRecord {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let class = reader.read_u8()?;
        let subclass = reader.read_u8()?;
        let protocol = reader.read_u8()?;
        let _pad = reader.read_u8()?;
        Ok(Self {
            class,
            subclass,
            protocol,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.class)?;
        writer.write_u8(self.subclass)?;
        writer.write_u8(self.protocol)?;
        writer.write_u8(0)?;
        Ok(())
    }
}

/// Exported-device record used by both OP_REP_DEVLIST and OP_REP_IMPORT
///
/// The devlist reply carries the interface records after the fixed part;
/// the import reply carries the fixed part only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// sysfs-style path, at most 255 bytes
    pub path: String,
    /// `<bus>-<dev>` identity, at most 31 bytes
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    /// USB/IP speed enum value (1 low, 2 full, 3 high)
    pub speed: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<InterfaceRecord>,
}

/// Write a string into a zero-padded fixed-width field
fn write_padded<W: Write>(writer: &mut W, field: &'static str, s: &str, width: usize) -> Result<()> {
    let bytes = s.as_bytes();
    // Reserve one byte for the NUL terminator
    if bytes.len() >= width {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: bytes.len(),
            max: width - 1,
        });
    }
    writer.write_all(bytes)?;
    let pad = vec![0u8; width - bytes.len()];
    writer.write_all(&pad)?;
    Ok(())
}

fn read_padded<R: Read>(reader: &mut R, width: usize) -> Result<String> {
    let mut buf = vec![0u8; width];
    reader.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(width);
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

impl DeviceRecord {
    /// Write the record; `with_interfaces` is true only in devlist replies.
    pub fn write_to<W: Write>(&self, writer: &mut W, with_interfaces: bool) -> Result<()> {
        write_padded(writer, "path", &self.path, 256)?;
        write_padded(writer, "busid", &self.busid, 32)?;
        writer.write_u32::<BigEndian>(self.busnum)?;
        writer.write_u32::<BigEndian>(self.devnum)?;
        writer.write_u32::<BigEndian>(self.speed)?;
        writer.write_u16::<BigEndian>(self.vendor_id)?;
        writer.write_u16::<BigEndian>(self.product_id)?;
        writer.write_u16::<BigEndian>(self.bcd_device)?;
        writer.write_u8(self.device_class)?;
        writer.write_u8(self.device_subclass)?;
        writer.write_u8(self.device_protocol)?;
        writer.write_u8(self.configuration_value)?;
        writer.write_u8(self.num_configurations)?;
        writer.write_u8(self.interfaces.len() as u8)?;
        if with_interfaces {
            for iface in &self.interfaces {
                iface.write_to(writer)?;
            }
        }
        Ok(())
    }

    /// Read the record; `with_interfaces` must match how it was written.
    pub fn read_from<R: Read>(reader: &mut R, with_interfaces: bool) -> Result<Self> {
        let path = read_padded(reader, 256)?;
        let busid = read_padded(reader, 32)?;
        let busnum = reader.read_u32::<BigEndian>()?;
        let devnum = reader.read_u32::<BigEndian>()?;
        let speed = reader.read_u32::<BigEndian>()?;
        let vendor_id = reader.read_u16::<BigEndian>()?;
        let product_id = reader.read_u16::<BigEndian>()?;
        let bcd_device = reader.read_u16::<BigEndian>()?;
        let device_class = reader.read_u8()?;
        let device_subclass = reader.read_u8()?;
        let device_protocol = reader.read_u8()?;
        let configuration_value = reader.read_u8()?;
        let num_configurations = reader.read_u8()?;
        let num_interfaces = reader.read_u8()?;
        let mut interfaces = Vec::with_capacity(num_interfaces as usize);
        if with_interfaces {
            for _ in 0..num_interfaces {
                interfaces.push(InterfaceRecord::read_from(reader)?);
            }
        }
        Ok(Self {
            path,
            busid,
            busnum,
            devnum,
            speed,
            vendor_id,
            product_id,
            bcd_device,
            device_class,
            device_subclass,
            device_protocol,
            configuration_value,
            num_configurations,
            interfaces,
        })
    }
}

/// URB-phase basic header (first 20 bytes of every 48-byte message)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderBasic {
    pub command: u32,
    /// Initiator-assigned sequence number
    pub seqnum: u32,
    /// `(busnum << 16) | devnum` of the imported device
    pub devid: u32,
    /// [`USBIP_DIR_OUT`] or [`USBIP_DIR_IN`]
    pub direction: u32,
    /// Endpoint number without the direction bit
    pub ep: u32,
}

impl HeaderBasic {
    pub const SIZE: usize = 20;

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            command: reader.read_u32::<BigEndian>()?,
            seqnum: reader.read_u32::<BigEndian>()?,
            devid: reader.read_u32::<BigEndian>()?,
            direction: reader.read_u32::<BigEndian>()?,
            ep: reader.read_u32::<BigEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.command)?;
        writer.write_u32::<BigEndian>(self.seqnum)?;
        writer.write_u32::<BigEndian>(self.devid)?;
        writer.write_u32::<BigEndian>(self.direction)?;
        writer.write_u32::<BigEndian>(self.ep)?;
        Ok(())
    }
}

/// CMD_SUBMIT block (28 bytes after the basic header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbCmdSubmit {
    pub transfer_flags: u32,
    pub transfer_buffer_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub interval: i32,
    /// Control-transfer setup packet, all zero for other endpoints
    pub setup: [u8; 8],
}

impl UrbCmdSubmit {
    pub const SIZE: usize = 28;

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let transfer_flags = reader.read_u32::<BigEndian>()?;
        let transfer_buffer_length = reader.read_i32::<BigEndian>()?;
        let start_frame = reader.read_i32::<BigEndian>()?;
        let number_of_packets = reader.read_i32::<BigEndian>()?;
        let interval = reader.read_i32::<BigEndian>()?;
        let mut setup = [0u8; 8];
        reader.read_exact(&mut setup)?;
        Ok(Self {
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.transfer_flags)?;
        writer.write_i32::<BigEndian>(self.transfer_buffer_length)?;
        writer.write_i32::<BigEndian>(self.start_frame)?;
        writer.write_i32::<BigEndian>(self.number_of_packets)?;
        writer.write_i32::<BigEndian>(self.interval)?;
        writer.write_all(&self.setup)?;
        Ok(())
    }

    /// True when the setup field carries a control request
    pub fn has_setup(&self) -> bool {
        self.setup != [0u8; 8]
    }
}

/// RET_SUBMIT block (28 bytes after the basic header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbRetSubmit {
    /// 0 on success, negative errno in wire units otherwise
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

impl UrbRetSubmit {
    pub const SIZE: usize = 28;

    pub fn success(actual_length: i32) -> Self {
        Self {
            status: ST_OK,
            actual_length,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
        }
    }

    pub fn error(status: i32) -> Self {
        Self {
            status,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let status = reader.read_i32::<BigEndian>()?;
        let actual_length = reader.read_i32::<BigEndian>()?;
        let start_frame = reader.read_i32::<BigEndian>()?;
        let number_of_packets = reader.read_i32::<BigEndian>()?;
        let error_count = reader.read_i32::<BigEndian>()?;
        let mut pad = [0u8; 8];
        reader.read_exact(&mut pad)?;
        Ok(Self {
            status,
            actual_length,
            start_frame,
            number_of_packets,
            error_count,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<BigEndian>(self.status)?;
        writer.write_i32::<BigEndian>(self.actual_length)?;
        writer.write_i32::<BigEndian>(self.start_frame)?;
        writer.write_i32::<BigEndian>(self.number_of_packets)?;
        writer.write_i32::<BigEndian>(self.error_count)?;
        writer.write_all(&[0u8; 8])?;
        Ok(())
    }
}

/// CMD_UNLINK block (28 bytes after the basic header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbCmdUnlink {
    /// Sequence number of the submit to cancel
    pub unlink_seqnum: u32,
}

impl UrbCmdUnlink {
    pub const SIZE: usize = 28;

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let unlink_seqnum = reader.read_u32::<BigEndian>()?;
        let mut pad = [0u8; 24];
        reader.read_exact(&mut pad)?;
        Ok(Self { unlink_seqnum })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.unlink_seqnum)?;
        writer.write_all(&[0u8; 24])?;
        Ok(())
    }
}

/// RET_UNLINK block (28 bytes after the basic header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbRetUnlink {
    pub status: i32,
}

impl UrbRetUnlink {
    pub const SIZE: usize = 28;

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let status = reader.read_i32::<BigEndian>()?;
        let mut pad = [0u8; 24];
        reader.read_exact(&mut pad)?;
        Ok(Self { status })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<BigEndian>(self.status)?;
        writer.write_all(&[0u8; 24])?;
        Ok(())
    }
}

/// An inbound URB-phase command, parsed from one 48-byte message
#[derive(Debug, Clone)]
pub enum UrbRequest {
    Submit(HeaderBasic, UrbCmdSubmit),
    Unlink(HeaderBasic, UrbCmdUnlink),
}

/// Parse one 48-byte URB-phase message received from an initiator.
///
/// RET codes are rejected here: initiators only ever send CMD messages.
pub fn parse_urb_request(buf: &[u8; URB_HEADER_SIZE]) -> Result<UrbRequest> {
    let mut cursor = &buf[..];
    let basic = HeaderBasic::read_from(&mut cursor)?;
    match UrbCommand::from_u32(basic.command)? {
        UrbCommand::CmdSubmit => Ok(UrbRequest::Submit(
            basic,
            UrbCmdSubmit::read_from(&mut cursor)?,
        )),
        UrbCommand::CmdUnlink => Ok(UrbRequest::Unlink(
            basic,
            UrbCmdUnlink::read_from(&mut cursor)?,
        )),
        other => Err(ProtocolError::UnknownCommand(other as u32)),
    }
}

/// Encode a RET_SUBMIT message; `data` is appended for IN completions.
pub fn encode_ret_submit(cmd: &HeaderBasic, ret: &UrbRetSubmit, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(URB_HEADER_SIZE + data.len());
    let basic = HeaderBasic {
        command: UrbCommand::RetSubmit as u32,
        seqnum: cmd.seqnum,
        devid: cmd.devid,
        direction: cmd.direction,
        ep: cmd.ep,
    };
    basic.write_to(&mut out).expect("vec write");
    ret.write_to(&mut out).expect("vec write");
    out.extend_from_slice(data);
    out
}

/// Encode a RET_UNLINK message.
pub fn encode_ret_unlink(cmd: &HeaderBasic, status: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(URB_HEADER_SIZE);
    let basic = HeaderBasic {
        command: UrbCommand::RetUnlink as u32,
        seqnum: cmd.seqnum,
        devid: cmd.devid,
        direction: cmd.direction,
        ep: cmd.ep,
    };
    basic.write_to(&mut out).expect("vec write");
    UrbRetUnlink { status }.write_to(&mut out).expect("vec write");
    out
}

/// Encode a complete OP_REP_DEVLIST reply.
pub fn encode_op_devlist_reply(devices: &[DeviceRecord]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    OpHeader::reply(OP_REP_DEVLIST, OP_STATUS_OK).write_to(&mut out)?;
    out.write_u32::<BigEndian>(devices.len() as u32)?;
    for device in devices {
        device.write_to(&mut out, true)?;
    }
    Ok(out)
}

/// Encode a complete OP_REP_IMPORT reply; `None` means failure status.
pub fn encode_op_import_reply(record: Option<&DeviceRecord>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match record {
        Some(record) => {
            OpHeader::reply(OP_REP_IMPORT, OP_STATUS_OK).write_to(&mut out)?;
            record.write_to(&mut out, false)?;
        }
        None => {
            OpHeader::reply(OP_REP_IMPORT, OP_STATUS_ERROR).write_to(&mut out)?;
        }
    }
    Ok(out)
}

/// Decode the 32-byte zero-padded bus id field of an OP_REQ_IMPORT.
pub fn decode_busid(field: &[u8; 32]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// USB control-transfer setup packet (the 8 setup bytes, little-endian words)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(setup: &[u8; 8]) -> Self {
        Self {
            request_type: setup[0],
            request: setup[1],
            value: u16::from_le_bytes([setup[2], setup[3]]),
            index: u16::from_le_bytes([setup[4], setup[5]]),
            length: u16::from_le_bytes([setup[6], setup[7]]),
        }
    }

    /// True when bit 7 of bmRequestType indicates device-to-host
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_op_header_roundtrip() {
        let header = OpHeader::request(OP_REQ_DEVLIST);
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), OP_HEADER_SIZE);
        assert_eq!(buf[0], 0x01);
        assert_eq!(buf[1], 0x11);
        assert_eq!(buf[2], 0x80);
        assert_eq!(buf[3], 0x05);

        let decoded = OpHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_device_record_roundtrip_with_interfaces() {
        let record = DeviceRecord {
            path: "/sys/devices/viiper/1-1".to_string(),
            busid: "1-1".to_string(),
            busnum: 1,
            devnum: 1,
            speed: 2,
            vendor_id: 0x1d50,
            product_id: 0x6189,
            bcd_device: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: vec![InterfaceRecord {
                class: 3,
                subclass: 1,
                protocol: 1,
            }],
        };

        let mut buf = Vec::new();
        record.write_to(&mut buf, true).unwrap();
        assert_eq!(buf.len(), DEVICE_RECORD_SIZE + 4);

        let decoded = DeviceRecord::read_from(&mut Cursor::new(buf), true).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_device_record_import_has_no_interfaces() {
        let record = DeviceRecord {
            path: "/sys/devices/viiper/2-1".to_string(),
            busid: "2-1".to_string(),
            busnum: 2,
            devnum: 1,
            speed: 2,
            vendor_id: 0x1234,
            product_id: 0x5678,
            bcd_device: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: vec![InterfaceRecord {
                class: 3,
                subclass: 0,
                protocol: 0,
            }],
        };

        let mut buf = Vec::new();
        record.write_to(&mut buf, false).unwrap();
        assert_eq!(buf.len(), DEVICE_RECORD_SIZE);
    }

    #[test]
    fn test_busid_too_long() {
        let record = DeviceRecord {
            path: "p".to_string(),
            busid: "x".repeat(32),
            busnum: 1,
            devnum: 1,
            speed: 2,
            vendor_id: 0,
            product_id: 0,
            bcd_device: 0,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: Vec::new(),
        };
        let mut buf = Vec::new();
        let err = record.write_to(&mut buf, false).unwrap_err();
        assert!(matches!(err, ProtocolError::FieldTooLong { field: "busid", .. }));
    }

    #[test]
    fn test_cmd_submit_roundtrip() {
        let basic = HeaderBasic {
            command: UrbCommand::CmdSubmit as u32,
            seqnum: 7,
            devid: (80000 << 16) | 1,
            direction: USBIP_DIR_IN,
            ep: 1,
        };
        let cmd = UrbCmdSubmit {
            transfer_flags: 0,
            transfer_buffer_length: 34,
            start_frame: 0,
            number_of_packets: 0,
            interval: 8,
            setup: [0u8; 8],
        };

        let mut buf = Vec::new();
        basic.write_to(&mut buf).unwrap();
        cmd.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), URB_HEADER_SIZE);

        let frame: [u8; URB_HEADER_SIZE] = buf.try_into().unwrap();
        let UrbRequest::Submit(decoded_basic, decoded_cmd) = parse_urb_request(&frame).unwrap()
        else {
            panic!("expected submit");
        };
        assert_eq!(decoded_basic, basic);
        assert_eq!(decoded_cmd, cmd);
    }

    #[test]
    fn test_cmd_unlink_roundtrip() {
        let basic = HeaderBasic {
            command: UrbCommand::CmdUnlink as u32,
            seqnum: 9,
            devid: 0x0001_0001,
            direction: USBIP_DIR_IN,
            ep: 1,
        };
        let unlink = UrbCmdUnlink { unlink_seqnum: 7 };

        let mut buf = Vec::new();
        basic.write_to(&mut buf).unwrap();
        unlink.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), URB_HEADER_SIZE);

        let frame: [u8; URB_HEADER_SIZE] = buf.try_into().unwrap();
        let UrbRequest::Unlink(decoded_basic, decoded) = parse_urb_request(&frame).unwrap() else {
            panic!("expected unlink");
        };
        assert_eq!(decoded_basic.seqnum, 9);
        assert_eq!(decoded.unlink_seqnum, 7);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut buf = vec![0u8; URB_HEADER_SIZE];
        buf[3] = 0x09;
        let frame: [u8; URB_HEADER_SIZE] = buf.try_into().unwrap();
        assert!(matches!(
            parse_urb_request(&frame),
            Err(ProtocolError::UnknownCommand(9))
        ));
    }

    #[test]
    fn test_ret_submit_encoding() {
        let cmd = HeaderBasic {
            command: UrbCommand::CmdSubmit as u32,
            seqnum: 42,
            devid: 0x0001_0002,
            direction: USBIP_DIR_IN,
            ep: 1,
        };
        let data = [0xAA, 0xBB, 0xCC];
        let frame = encode_ret_submit(&cmd, &UrbRetSubmit::success(3), &data);
        assert_eq!(frame.len(), URB_HEADER_SIZE + 3);

        let mut cursor = Cursor::new(&frame);
        let basic = HeaderBasic::read_from(&mut cursor).unwrap();
        assert_eq!(basic.command, UrbCommand::RetSubmit as u32);
        assert_eq!(basic.seqnum, 42);
        assert_eq!(basic.direction, USBIP_DIR_IN);
        assert_eq!(basic.ep, 1);
        let ret = UrbRetSubmit::read_from(&mut cursor).unwrap();
        assert_eq!(ret.status, ST_OK);
        assert_eq!(ret.actual_length, 3);
        assert_eq!(&frame[URB_HEADER_SIZE..], &data);
    }

    #[test]
    fn test_ret_unlink_encoding() {
        let cmd = HeaderBasic {
            command: UrbCommand::CmdUnlink as u32,
            seqnum: 43,
            devid: 0x0001_0002,
            direction: USBIP_DIR_OUT,
            ep: 0,
        };
        let frame = encode_ret_unlink(&cmd, 0);
        assert_eq!(frame.len(), URB_HEADER_SIZE);

        let mut cursor = Cursor::new(&frame);
        let basic = HeaderBasic::read_from(&mut cursor).unwrap();
        assert_eq!(basic.command, UrbCommand::RetUnlink as u32);
        let ret = UrbRetUnlink::read_from(&mut cursor).unwrap();
        assert_eq!(ret.status, 0);
    }

    #[test]
    fn test_devlist_reply_layout() {
        let record = DeviceRecord {
            path: "/sys/devices/viiper/3-1".to_string(),
            busid: "3-1".to_string(),
            busnum: 3,
            devnum: 1,
            speed: 2,
            vendor_id: 0x1d50,
            product_id: 0x61a0,
            bcd_device: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: vec![InterfaceRecord {
                class: 3,
                subclass: 0,
                protocol: 1,
            }],
        };
        let reply = encode_op_devlist_reply(std::slice::from_ref(&record)).unwrap();
        assert_eq!(reply.len(), OP_HEADER_SIZE + 4 + DEVICE_RECORD_SIZE + 4);

        let mut cursor = Cursor::new(&reply);
        let header = OpHeader::read_from(&mut cursor).unwrap();
        assert_eq!(header.code, OP_REP_DEVLIST);
        assert_eq!(header.status, OP_STATUS_OK);
        let count = cursor.read_u32::<BigEndian>().unwrap();
        assert_eq!(count, 1);
        let decoded = DeviceRecord::read_from(&mut cursor, true).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_import_reply_failure_is_header_only() {
        let reply = encode_op_import_reply(None).unwrap();
        assert_eq!(reply.len(), OP_HEADER_SIZE);
        let header = OpHeader::read_from(&mut Cursor::new(&reply)).unwrap();
        assert_eq!(header.code, OP_REP_IMPORT);
        assert_eq!(header.status, OP_STATUS_ERROR);
    }

    #[test]
    fn test_decode_busid() {
        let mut field = [0u8; 32];
        field[..7].copy_from_slice(b"80000-1");
        assert_eq!(decode_busid(&field), "80000-1");
        assert_eq!(decode_busid(&[0u8; 32]), "");
    }

    #[test]
    fn test_setup_packet_parse() {
        // GET_DESCRIPTOR(device), wLength 18
        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let packet = SetupPacket::parse(&setup);
        assert!(packet.is_in());
        assert_eq!(packet.request, 0x06);
        assert_eq!(packet.value, 0x0100);
        assert_eq!(packet.index, 0);
        assert_eq!(packet.length, 18);
    }
}
