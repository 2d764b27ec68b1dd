//! Common utilities for viiper
//!
//! This crate provides the runtime services shared by the server's
//! listeners: logging setup, the shared error type, server password
//! persistence, and the authenticated/encrypted session layer that wraps
//! every TCP connection.

pub mod error;
pub mod keys;
pub mod logging;
pub mod session;

pub use error::{Error, Result};
pub use keys::{default_key_path, load_or_generate_password};
pub use logging::setup_logging;
pub use session::{SecureReader, SecureWriter, SessionAuth, establish_client, establish_server};
