// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Library error type.

use core::fmt;

/// A specialized [`Result`](core::result::Result) type for Modbus operations.
pub type Result<T> = core::result::Result<T, Error>;

/// A Modbus-level exception code, carried by [`Error::Exception`].
///
/// Valid codes per the Modbus Application Protocol are `1..=4`, `0x08`,
/// `0x0A` and `0x0B`; other values are accepted here as opaque bytes so
/// that a malformed exception response can still be reported faithfully.
pub type ExceptionCode = u8;

pub const EXC_ILLEGAL_FUNCTION: ExceptionCode = 0x01;
pub const EXC_ILLEGAL_DATA_ADDRESS: ExceptionCode = 0x02;
pub const EXC_ILLEGAL_DATA_VALUE: ExceptionCode = 0x03;
pub const EXC_SERVER_DEVICE_FAILURE: ExceptionCode = 0x04;
pub const EXC_MEMORY_PARITY_ERROR: ExceptionCode = 0x08;
pub const EXC_GATEWAY_PATH_UNAVAILABLE: ExceptionCode = 0x0A;
pub const EXC_GATEWAY_TARGET_DEVICE_FAILED: ExceptionCode = 0x0B;

/// Modbus core error taxonomy (`spec` §7). Finite and stable across the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Caller-side bug: null pointer, undersized buffer, out-of-range
    /// quantity, or wrong function code.
    InvalidArgument,
    /// Pool or queue is at capacity.
    NoResources,
    /// The engine is in a state that forbids the call (e.g. `submit` while
    /// the auto-heal supervisor's circuit is open).
    Busy,
    /// Response deadline exceeded with retries exhausted.
    Timeout,
    /// Frame checksum (CRC-16 or LRC-8) is invalid.
    Crc,
    /// The transport reported a fatal condition, or a partial send
    /// occurred where a full send was required.
    Io,
    /// The transaction was withdrawn by `cancel` or a poison pill.
    Cancelled,
    /// A Modbus-level exception response was received from the peer.
    Exception(ExceptionCode),
    /// The frame is structurally invalid, distinct from a CRC failure.
    DecodingError,
    /// An operation requiring prior `init` was called before it.
    NotInitialised,
    /// `init` was called on an engine that is already initialised.
    AlreadyInitialised,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::NoResources => f.write_str("no resources available"),
            Self::Busy => f.write_str("busy"),
            Self::Timeout => f.write_str("timeout"),
            Self::Crc => f.write_str("checksum mismatch"),
            Self::Io => f.write_str("I/O error"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Exception(code) => write!(f, "modbus exception 0x{code:02X}"),
            Self::DecodingError => f.write_str("decoding error"),
            Self::NotInitialised => f.write_str("not initialised"),
            Self::AlreadyInitialised => f.write_str("already initialised"),
        }
    }
}

impl core::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn display_is_stable_text() {
        assert_eq!(Error::Timeout.to_string(), "timeout");
        assert_eq!(
            Error::Exception(EXC_ILLEGAL_DATA_ADDRESS).to_string(),
            "modbus exception 0x02"
        );
    }

    #[test]
    fn error_is_copy() {
        let e = Error::Crc;
        let e2 = e;
        assert_eq!(e, e2);
    }
}
