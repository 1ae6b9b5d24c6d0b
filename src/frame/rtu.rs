// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU framing: `[unit_id | fc | payload(0..252)] || crc16_le`, with
//! silence-gap reassembly and byte-slide resync.

use heapless::Vec as HVec;

use crate::crc;
use crate::error::{Error, Result};
use crate::frame::{AduView, FrameEvent, Role};
use crate::transport::{has_elapsed, Instant, Transport};

/// Modbus RTU frames never exceed 256 bytes on the wire.
pub const MAX_FRAME_LEN: usize = 256;

/// Floor for the inter-frame silence gap, regardless of configured baud
/// rate (`spec` §6).
pub const MIN_SILENCE_MS: u32 = 1;

/// Byte-slide resync ceiling, mirroring the teacher's `MAX_RETRIES` in
/// its RTU decode loop.
const MAX_RESYNC_ATTEMPTS: usize = 20;

fn is_plausible_unit_id(unit_id: u8) -> bool {
    (1..=247).contains(&unit_id)
}

/// `None` -> more bytes needed before the length is known.
/// `Some(Err)` -> the function code cannot plausibly start a PDU.
/// `Some(Ok(len))` -> total PDU length (including the function-code byte).
pub(crate) fn request_pdu_len(pdu_prefix: &[u8]) -> Result<Option<usize>> {
    let Some(&fc) = pdu_prefix.first() else {
        return Ok(None);
    };
    let len = match fc {
        0x01..=0x06 => 5,
        0x07 | 0x11 => 1,
        0x16 => 7,
        0x0F | 0x10 => {
            return Ok(pdu_prefix.get(5).map(|&bc| 6 + usize::from(bc)));
        }
        0x17 => {
            return Ok(pdu_prefix.get(9).map(|&bc| 10 + usize::from(bc)));
        }
        _ => return Err(Error::DecodingError),
    };
    Ok(Some(len))
}

pub(crate) fn response_pdu_len(pdu_prefix: &[u8]) -> Result<Option<usize>> {
    let Some(&fc) = pdu_prefix.first() else {
        return Ok(None);
    };
    if fc & 0x80 != 0 {
        return Ok(Some(2));
    }
    let len = match fc {
        0x01..=0x04 | 0x17 | 0x11 => {
            return Ok(pdu_prefix.get(1).map(|&bc| 2 + usize::from(bc)));
        }
        0x05 | 0x06 | 0x0F | 0x10 => 5,
        0x07 => 2,
        0x16 => 7,
        _ => return Err(Error::DecodingError),
    };
    Ok(Some(len))
}

fn pdu_len(role: Role, pdu_prefix: &[u8]) -> Result<Option<usize>> {
    match role {
        Role::Server => request_pdu_len(pdu_prefix),
        Role::Client => response_pdu_len(pdu_prefix),
    }
}

/// RTU reassembly state machine. One instance handles either the
/// client's (response) or the server's (request) side, selected at
/// construction.
#[derive(Debug)]
pub struct RtuFramer {
    role: Role,
    rx: HVec<u8, MAX_FRAME_LEN>,
    last_rx_at: Option<Instant>,
    silence_ms: u32,
    last_tx_at: Option<Instant>,
    guard_ms: u32,
    dropped_bytes: u32,
    resyncs: u32,
    overflows: u32,
}

impl RtuFramer {
    #[must_use]
    pub fn new(role: Role, silence_ms: u32) -> Self {
        let silence_ms = silence_ms.max(MIN_SILENCE_MS);
        Self {
            role,
            rx: HVec::new(),
            last_rx_at: None,
            silence_ms,
            last_tx_at: None,
            guard_ms: silence_ms,
            dropped_bytes: 0,
            resyncs: 0,
            overflows: 0,
        }
    }

    #[must_use]
    pub fn dropped_bytes(&self) -> u32 {
        self.dropped_bytes
    }

    #[must_use]
    pub fn resyncs(&self) -> u32 {
        self.resyncs
    }

    #[must_use]
    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    fn drop_front(&mut self, n: usize) {
        let n = n.min(self.rx.len());
        self.dropped_bytes += n as u32;
        let remaining = self.rx.len() - n;
        for i in 0..remaining {
            self.rx[i] = self.rx[i + n];
        }
        self.rx.truncate(remaining);
    }

    fn clear(&mut self) {
        self.dropped_bytes += self.rx.len() as u32;
        self.rx.clear();
    }

    /// Attempts to decode one frame out of `self.rx`, sliding the
    /// window forward on checksum/length failure (`spec` §4.3).
    ///
    /// `end_of_frame` is `true` once the silence gap has elapsed: a
    /// sub-4-byte `rx` is then a genuinely short frame (`Invalid`), not
    /// one still filling up (`Incomplete`).
    fn try_decode(&mut self, end_of_frame: bool) -> FrameEvent<'_> {
        let mut attempts = 0usize;
        loop {
            if self.rx.len() < 4 {
                if end_of_frame {
                    self.clear();
                    return FrameEvent::Invalid;
                }
                return FrameEvent::Incomplete;
            }
            if !is_plausible_unit_id(self.rx[0]) {
                self.drop_front(1);
                self.resyncs += 1;
                attempts += 1;
                if attempts >= MAX_RESYNC_ATTEMPTS {
                    self.clear();
                    return FrameEvent::Invalid;
                }
                continue;
            }
            let plen = match pdu_len(self.role, &self.rx[1..]) {
                Ok(Some(n)) => n,
                Ok(None) => return FrameEvent::Incomplete,
                Err(_) => {
                    self.drop_front(1);
                    self.resyncs += 1;
                    attempts += 1;
                    if attempts >= MAX_RESYNC_ATTEMPTS {
                        self.clear();
                        return FrameEvent::Invalid;
                    }
                    continue;
                }
            };
            let adu_len = 1 + plen;
            if adu_len > MAX_FRAME_LEN - 2 {
                self.drop_front(1);
                self.resyncs += 1;
                attempts += 1;
                if attempts >= MAX_RESYNC_ATTEMPTS {
                    self.clear();
                    return FrameEvent::Invalid;
                }
                continue;
            }
            if self.rx.len() < adu_len + 2 {
                return FrameEvent::Incomplete;
            }
            if !crc::crc16_validate(&self.rx[..adu_len + 2]) {
                self.drop_front(1);
                self.resyncs += 1;
                attempts += 1;
                if attempts >= MAX_RESYNC_ATTEMPTS {
                    self.clear();
                    return FrameEvent::ChecksumError;
                }
                continue;
            }
            let unit_id = self.rx[0];
            return FrameEvent::Adu(AduView {
                unit_id,
                pdu: &self.rx[1..adu_len],
            });
        }
    }

    /// Consumes the currently-decoded frame (if any) so the next `poll`
    /// starts reassembly fresh. Must be called after the caller is done
    /// reading an `Adu` event's borrowed view.
    pub fn consume(&mut self) {
        self.rx.clear();
    }

    /// Pulls any available bytes from `transport`, applies silence-gap
    /// end-of-frame detection, and attempts to decode one frame.
    pub fn poll_recv<T: Transport>(&mut self, transport: &mut T) -> Result<FrameEvent<'_>> {
        let now = transport.now();
        let mut scratch = [0u8; MAX_FRAME_LEN];
        let free = MAX_FRAME_LEN - self.rx.len();
        if free > 0 {
            let n = transport.recv(&mut scratch[..free])?;
            if n > 0 {
                for &b in &scratch[..n] {
                    let _ = self.rx.push(b);
                }
                self.last_rx_at = Some(now);
            }
        } else {
            // Buffer saturated without a silence gap: overflow per §4.3.
            self.overflows += 1;
            self.clear();
            self.last_rx_at = None;
            return Ok(FrameEvent::Invalid);
        }

        if self.rx.is_empty() {
            return Ok(FrameEvent::Incomplete);
        }

        let silence_elapsed = match self.last_rx_at {
            None => true,
            Some(t) => has_elapsed(now, t.wrapping_add(self.silence_ms)),
        };
        if !silence_elapsed {
            return Ok(FrameEvent::Incomplete);
        }

        Ok(self.try_decode(true))
    }

    /// Encodes `[unit_id | pdu] || crc16_le` into `out`, returning the
    /// byte count. Fails with `InvalidArgument` if `out` is too small or
    /// the PDU would push the frame past 256 bytes.
    pub fn encode(out: &mut [u8], unit_id: u8, pdu: &[u8]) -> Result<usize> {
        let adu_len = 1 + pdu.len();
        if adu_len > MAX_FRAME_LEN - 2 || out.len() < adu_len + 2 {
            return Err(Error::InvalidArgument);
        }
        out[0] = unit_id;
        out[1..adu_len].copy_from_slice(pdu);
        let crc = crc::crc16(&out[..adu_len]);
        out[adu_len..adu_len + 2].copy_from_slice(&crc.to_le_bytes());
        Ok(adu_len + 2)
    }

    /// Sends a pre-built frame, honouring the transmit guard time
    /// (`spec` §4.3): rejects with `Busy` if called again before
    /// `T_silence` has elapsed since the previous completed send.
    /// Partial sends surface as `Io` without silent truncation.
    pub fn send<T: Transport>(&mut self, transport: &mut T, frame: &[u8]) -> Result<()> {
        let now = transport.now();
        if let Some(t) = self.last_tx_at {
            if !has_elapsed(now, t.wrapping_add(self.guard_ms)) {
                return Err(Error::Busy);
            }
        }
        let sent = transport.send(frame)?;
        if sent != frame.len() {
            return Err(Error::Io);
        }
        self.last_tx_at = Some(transport.now());
        Ok(())
    }
}
