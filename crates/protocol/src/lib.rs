//! Wire protocol library for viiper
//!
//! This crate defines the two wire surfaces of the server:
//!
//! - The USB/IP device-side protocol spoken with `vhci-hcd` initiators
//!   (48-byte command/return headers, network byte order, byte-exact).
//! - The management protocol spoken on the control port: NUL-terminated
//!   `<path>[SP<payload>]` requests answered with a single JSON line,
//!   including the RFC 7807 problem documents used for errors.
//!
//! Everything here is transport-agnostic: codecs read from and write to
//! plain byte slices and `std::io` streams, so they work identically over
//! a raw TCP connection and over the encrypted session layer.

pub mod error;
pub mod management;
pub mod problem;
pub mod usbip;

pub use error::{ProtocolError, Result};
pub use management::{
    MAX_REQUEST_SIZE, ParsedRequest, PathParams, PathPattern, encode_reply, parse_request,
};
pub use problem::Problem;
pub use usbip::{
    DeviceRecord, HeaderBasic, InterfaceRecord, OpHeader, SetupPacket, URB_HEADER_SIZE,
    UrbCmdSubmit, UrbCmdUnlink, UrbCommand, UrbRequest, UrbRetSubmit, UrbRetUnlink,
    USBIP_VERSION, decode_busid, encode_op_devlist_reply, encode_op_import_reply,
    encode_ret_submit, encode_ret_unlink, parse_urb_request,
};
