// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A byte-queue [`Transport`] shared by the integration test binaries,
//! mirroring the in-memory mock used by each module's own unit tests.

use heapless::Vec as HVec;
use modbus_core::error::{Error, Result};
use modbus_core::transport::{Instant, Transport};

pub struct LoopbackTransport {
    pub rx: HVec<u8, 1024>,
    pub tx: HVec<u8, 1024>,
    pub now: Instant,
    pub drop_sends: bool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            rx: HVec::new(),
            tx: HVec::new(),
            now: 0,
            drop_sends: false,
        }
    }

    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx.extend_from_slice(bytes).unwrap();
    }

    pub fn take_tx(&mut self) -> HVec<u8, 1024> {
        core::mem::replace(&mut self.tx, HVec::new())
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        if self.drop_sends {
            return Ok(0);
        }
        self.tx.extend_from_slice(buf).map_err(|()| Error::Io)?;
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
