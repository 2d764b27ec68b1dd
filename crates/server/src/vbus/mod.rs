//! Virtual bus and device registry

pub mod bus;
pub mod device;

pub use bus::{
    Bus, DEFAULT_FEEDBACK_CAPACITY, MAX_BUS_ID, MIN_BUS_ID, Registry, RegistryError, parse_busid,
};
pub use device::{BindError, InputFrame, SessionId, VirtualDevice, next_input};
