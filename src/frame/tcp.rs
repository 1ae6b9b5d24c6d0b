// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP/MBAP framing: 7-byte header
//! `[transaction_id(2) | protocol_id(2)=0 | length(2) | unit_id(1)]`
//! followed by `length - 1` PDU bytes, with length-prefixed reassembly
//! across multiple `poll` calls.

use heapless::Vec as HVec;

use crate::error::{Error, Result};
use crate::pdu::MAX_PDU_PAYLOAD_LEN;
use crate::transport::Transport;

pub const HEADER_LEN: usize = 7;
/// Largest PDU this framer accepts, one byte short of the MBAP `length`
/// field's own ceiling (`length` also counts the unit id byte).
pub const MAX_PDU_LEN: usize = MAX_PDU_PAYLOAD_LEN + 1;
const MAX_ADU_LEN: usize = HEADER_LEN + MAX_PDU_LEN;

/// A reassembled MBAP ADU, borrowed from the framer's internal buffer.
#[derive(Debug, Clone, Copy)]
pub struct TcpAduView<'a> {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: &'a [u8],
}

#[derive(Debug)]
pub enum TcpFrameEvent<'a> {
    Incomplete,
    Adu(TcpAduView<'a>),
    /// `protocol_id != 0`, or `length == 0` / `length > MAX_PDU_LEN + 1`.
    Invalid,
}

#[derive(Debug)]
pub struct TcpFramer {
    buf: HVec<u8, MAX_ADU_LEN>,
}

impl Default for TcpFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpFramer {
    #[must_use]
    pub fn new() -> Self {
        Self { buf: HVec::new() }
    }

    /// Discards the currently-decoded frame so the next `poll` starts a
    /// fresh reassembly.
    pub fn consume(&mut self) {
        self.buf.clear();
    }

    fn want(&self) -> Option<usize> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let length = u16::from(self.buf[4]) << 8 | u16::from(self.buf[5]);
        Some(HEADER_LEN + length.saturating_sub(1) as usize)
    }

    fn try_decode(&mut self) -> Result<TcpFrameEvent<'_>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(TcpFrameEvent::Incomplete);
        }
        let protocol_id = u16::from(self.buf[2]) << 8 | u16::from(self.buf[3]);
        let length = u16::from(self.buf[4]) << 8 | u16::from(self.buf[5]);
        if protocol_id != 0 {
            self.buf.clear();
            return Ok(TcpFrameEvent::Invalid);
        }
        if length == 0 || length as usize > MAX_PDU_LEN + 1 {
            self.buf.clear();
            return Ok(TcpFrameEvent::Invalid);
        }
        let adu_len = HEADER_LEN + (length as usize - 1);
        if self.buf.len() < adu_len {
            return Ok(TcpFrameEvent::Incomplete);
        }
        let transaction_id = u16::from(self.buf[0]) << 8 | u16::from(self.buf[1]);
        let unit_id = self.buf[6];
        Ok(TcpFrameEvent::Adu(TcpAduView {
            transaction_id,
            unit_id,
            pdu: &self.buf[HEADER_LEN..adu_len],
        }))
    }

    pub fn poll_recv<T: Transport>(&mut self, transport: &mut T) -> Result<TcpFrameEvent<'_>> {
        let cap = self.want().unwrap_or(MAX_ADU_LEN);
        let free = cap.saturating_sub(self.buf.len());
        if free > 0 {
            let mut scratch = [0u8; MAX_ADU_LEN];
            let n = transport.recv(&mut scratch[..free])?;
            for &b in &scratch[..n] {
                if self.buf.push(b).is_err() {
                    self.buf.clear();
                    return Ok(TcpFrameEvent::Invalid);
                }
            }
        }
        self.try_decode()
    }

    /// Encodes `[tid|pid=0|len|unit_id] || pdu` into `out`, returning
    /// the byte count written.
    pub fn encode(out: &mut [u8], transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Result<usize> {
        if pdu.is_empty() || pdu.len() > MAX_PDU_LEN {
            return Err(Error::InvalidArgument);
        }
        let adu_len = HEADER_LEN + pdu.len();
        if out.len() < adu_len {
            return Err(Error::InvalidArgument);
        }
        let length = (pdu.len() + 1) as u16;
        out[0] = (transaction_id >> 8) as u8;
        out[1] = transaction_id as u8;
        out[2] = 0;
        out[3] = 0;
        out[4] = (length >> 8) as u8;
        out[5] = length as u8;
        out[6] = unit_id;
        out[HEADER_LEN..adu_len].copy_from_slice(pdu);
        Ok(adu_len)
    }

    pub fn send<T: Transport>(&mut self, transport: &mut T, frame: &[u8]) -> Result<()> {
        let sent = transport.send(frame)?;
        if sent != frame.len() {
            return Err(Error::Io);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Instant;

    struct MockTransport {
        rx: HVec<u8, 512>,
        now: Instant,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                rx: HVec::new(),
                now: 0,
            }
        }

        fn push_rx(&mut self, bytes: &[u8]) {
            self.rx.extend_from_slice(bytes).unwrap();
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, _buf: &[u8]) -> Result<usize> {
            Ok(_buf.len())
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
    fn decodes_full_adu_in_one_shot() {
        let mut buf = [0u8; 64];
        let n = TcpFramer::encode(&mut buf, 0x1234, 0x11, &[0x03, 0x00, 0x00, 0x00, 0x02]).unwrap();
        let mut t = MockTransport::new();
        t.push_rx(&buf[..n]);
        let mut framer = TcpFramer::new();
        match framer.poll_recv(&mut t).unwrap() {
            TcpFrameEvent::Adu(view) => {
                assert_eq!(view.transaction_id, 0x1234);
                assert_eq!(view.unit_id, 0x11);
                assert_eq!(view.pdu, &[0x03, 0x00, 0x00, 0x00, 0x02]);
            }
            other => panic!("expected Adu, got {other:?}"),
        }
    }

    #[test]
    fn decodes_across_partial_reads() {
        let mut buf = [0u8; 64];
        let n = TcpFramer::encode(&mut buf, 0x0001, 0xFF, &[0x03, 0x00, 0x00, 0x00, 0x02]).unwrap();
        let mut t = MockTransport::new();
        let mut framer = TcpFramer::new();
        t.push_rx(&buf[..4]);
        assert!(matches!(
            framer.poll_recv(&mut t).unwrap(),
            TcpFrameEvent::Incomplete
        ));
        t.push_rx(&buf[4..n]);
        assert!(matches!(
            framer.poll_recv(&mut t).unwrap(),
            TcpFrameEvent::Adu(_)
        ));
    }

    #[test]
    fn rejects_nonzero_protocol_id() {
        let mut buf = [0u8; 64];
        let n = TcpFramer::encode(&mut buf, 1, 1, &[0x03, 0, 0, 0, 1]).unwrap();
        buf[3] = 0x01;
        let mut t = MockTransport::new();
        t.push_rx(&buf[..n]);
        let mut framer = TcpFramer::new();
        assert!(matches!(
            framer.poll_recv(&mut t).unwrap(),
            TcpFrameEvent::Invalid
        ));
    }

    #[test]
    fn rejects_zero_length() {
        let mut buf = [0u8; HEADER_LEN];
        buf[4] = 0;
        buf[5] = 0;
        let mut t = MockTransport::new();
        t.push_rx(&buf);
        let mut framer = TcpFramer::new();
        assert!(matches!(
            framer.poll_recv(&mut t).unwrap(),
            TcpFrameEvent::Invalid
        ));
    }
}
