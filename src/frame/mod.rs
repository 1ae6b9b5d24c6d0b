// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Application Data Unit framing: RTU (with CRC-16 and silence-gap
//! reassembly) and TCP/MBAP (with length-prefixed reassembly).

#[cfg(feature = "rtu")]
pub mod rtu;

#[cfg(feature = "tcp")]
pub mod tcp;

#[cfg(feature = "ascii")]
pub mod ascii;

/// A Modbus function code: 7 bits of code, bit 7 set on exception
/// responses.
pub type FunctionCode = u8;

/// A borrowed view of one reassembled ADU: the unit/slave id plus the
/// PDU bytes (function code + payload), borrowed from the framer's
/// internal reassembly buffer.
///
/// The lifetime of the view is the caller's call frame; the framer
/// overwrites its buffer on the next `poll`.
#[derive(Debug, Clone, Copy)]
pub struct AduView<'a> {
    pub unit_id: u8,
    pub pdu: &'a [u8],
}

/// Result of one framer `poll`/reassembly step.
#[derive(Debug)]
pub enum FrameEvent<'a> {
    /// No complete frame yet; more bytes are needed.
    Incomplete,
    /// A complete, checksum-valid frame is available.
    Adu(AduView<'a>),
    /// A complete frame arrived but failed structural validation
    /// (length, `protocol_id`, byte-count) — distinct from a checksum
    /// failure.
    Invalid,
    /// A complete frame arrived but failed its checksum (RTU CRC-16 or
    /// ASCII LRC-8).
    ChecksumError,
}

/// `{CLIENT, SERVER} x {RTU, TCP, ASCII}`, used by `init` to auto-select
/// the framer unless `use_override` requests user-supplied framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Rtu,
    Tcp,
    Ascii,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleFraming {
    pub role: Role,
    pub framing: Framing,
}
