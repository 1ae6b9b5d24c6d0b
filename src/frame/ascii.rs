// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! ASCII framing: a thin variant of [`RtuFramer`](crate::frame::rtu::RtuFramer)
//! reassembly (`spec` §6) with the 1-byte LRC-8 trailer replacing the
//! 2-byte CRC-16, sharing the same silence-gap end-of-frame detection
//! so two back-to-back PDUs with no inter-frame gap are never folded
//! into one.

use heapless::Vec as HVec;

use crate::crc;
use crate::error::{Error, Result};
use crate::frame::rtu::MAX_FRAME_LEN;
use crate::frame::{AduView, FrameEvent, Role};
use crate::transport::{has_elapsed, Instant, Transport};

fn pdu_len(role: Role, pdu_prefix: &[u8]) -> Result<Option<usize>> {
    match role {
        Role::Server => super::rtu::request_pdu_len(pdu_prefix),
        Role::Client => super::rtu::response_pdu_len(pdu_prefix),
    }
}

fn is_plausible_unit_id(unit_id: u8) -> bool {
    (1..=247).contains(&unit_id)
}

/// ASCII reassembly state machine, sharing the RTU framer's byte-slide
/// resync but validating with `lrc8` instead of `crc16`.
#[derive(Debug)]
pub struct AsciiFramer {
    role: Role,
    rx: HVec<u8, MAX_FRAME_LEN>,
    dropped_bytes: u32,
    resyncs: u32,
    silence_ms: u32,
    last_rx_at: Option<Instant>,
}

impl AsciiFramer {
    #[must_use]
    pub fn new(role: Role, silence_ms: u32) -> Self {
        Self {
            role,
            rx: HVec::new(),
            dropped_bytes: 0,
            resyncs: 0,
            silence_ms,
            last_rx_at: None,
        }
    }

    #[must_use]
    pub fn resyncs(&self) -> u32 {
        self.resyncs
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

    pub fn consume(&mut self) {
        self.rx.clear();
    }

    fn try_decode(&mut self, end_of_frame: bool) -> FrameEvent<'_> {
        const MAX_ATTEMPTS: usize = 20;
        let mut attempts = 0usize;
        loop {
            if self.rx.len() < 3 {
                if end_of_frame {
                    self.rx.clear();
                    return FrameEvent::Invalid;
                }
                return FrameEvent::Incomplete;
            }
            if !is_plausible_unit_id(self.rx[0]) {
                self.drop_front(1);
                self.resyncs += 1;
                attempts += 1;
                if attempts >= MAX_ATTEMPTS {
                    self.rx.clear();
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
                    if attempts >= MAX_ATTEMPTS {
                        self.rx.clear();
                        return FrameEvent::Invalid;
                    }
                    continue;
                }
            };
            let adu_len = 1 + plen;
            if self.rx.len() < adu_len + 1 {
                return FrameEvent::Incomplete;
            }
            let expected = crc::lrc8(&self.rx[..adu_len]);
            if expected != self.rx[adu_len] {
                self.drop_front(1);
                self.resyncs += 1;
                attempts += 1;
                if attempts >= MAX_ATTEMPTS {
                    self.rx.clear();
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

    pub fn poll_recv<T: Transport>(&mut self, transport: &mut T) -> Result<FrameEvent<'_>> {
        let now = transport.now();
        let free = MAX_FRAME_LEN - self.rx.len();
        if free == 0 {
            self.rx.clear();
            self.last_rx_at = None;
            return Ok(FrameEvent::Invalid);
        }
        let mut scratch = [0u8; MAX_FRAME_LEN];
        let n = transport.recv(&mut scratch[..free])?;
        if n > 0 {
            for &b in &scratch[..n] {
                let _ = self.rx.push(b);
            }
            self.last_rx_at = Some(now);
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

    pub fn encode(out: &mut [u8], unit_id: u8, pdu: &[u8]) -> Result<usize> {
        let adu_len = 1 + pdu.len();
        if adu_len > MAX_FRAME_LEN - 1 || out.len() < adu_len + 1 {
            return Err(Error::InvalidArgument);
        }
        out[0] = unit_id;
        out[1..adu_len].copy_from_slice(pdu);
        out[adu_len] = crc::lrc8(&out[..adu_len]);
        Ok(adu_len + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockTransport {
        rx: HVec<u8, 512>,
        now: Instant,
    }

    impl MockTransport {
        fn advance(&mut self, ms: u32) {
            self.now += ms;
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = self.rx.len().min(buf.len());
            buf[..n].copy_from_slice(&self.rx[..n]);
            let remaining = self.rx.len() - n;
            for i in 0..remaining {
                self.rx[i] = self.rx[i + n];
            }
            self.rx.truncate(remaining);
            Ok(n)
        }

        fn now(&self) -> Instant {
            self.now
        }
    }

    #[test]
    fn decodes_valid_frame_after_silence() {
        let mut buf = [0u8; 16];
        let n = AsciiFramer::encode(&mut buf, 0x11, &[0x03, 0x00, 0x00, 0x00, 0x02]).unwrap();
        let mut t = MockTransport {
            rx: HVec::new(),
            now: 0,
        };
        t.rx.extend_from_slice(&buf[..n]).unwrap();
        let mut framer = AsciiFramer::new(Role::Server, 5);
        assert!(matches!(
            framer.poll_recv(&mut t).unwrap(),
            FrameEvent::Incomplete
        ));
        t.advance(10);
        match framer.poll_recv(&mut t).unwrap() {
            FrameEvent::Adu(view) => assert_eq!(view.unit_id, 0x11),
            other => panic!("expected Adu, got {other:?}"),
        }
    }

    #[test]
    fn bytes_arriving_before_the_silence_gap_elapses_stay_incomplete() {
        let mut buf = [0u8; 16];
        let n = AsciiFramer::encode(&mut buf, 0x11, &[0x03, 0x00, 0x00, 0x00, 0x02]).unwrap();
        let mut t = MockTransport {
            rx: HVec::new(),
            now: 0,
        };
        let mut framer = AsciiFramer::new(Role::Server, 5);
        t.rx.extend_from_slice(&buf[..n]).unwrap();
        assert!(matches!(
            framer.poll_recv(&mut t).unwrap(),
            FrameEvent::Incomplete
        ));
        t.advance(2);
        // Still short of the 5ms silence gap: must not decode yet, even
        // though the full frame is already sitting in `rx`.
        assert!(matches!(
            framer.poll_recv(&mut t).unwrap(),
            FrameEvent::Incomplete
        ));
    }
}
