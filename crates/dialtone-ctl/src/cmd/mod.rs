//! CLI command modules.

pub mod fdo;
pub mod http;
pub mod status;
pub mod xfer;
