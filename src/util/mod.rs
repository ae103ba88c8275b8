//! Utility module
//!
//! Text codecs for frame payloads and small formatting helpers used in logs.

pub mod codepage;

pub use self::codepage::{Cp1251, TextCodec};

/// Formats bytes as space separated hex for frame traces
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
