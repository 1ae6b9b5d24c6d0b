// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The non-blocking transport abstraction consumed by the framers.
//!
//! This is a capability bundle, not a trait object hierarchy: a single
//! narrow trait the engine is generic over, matching §9's rejection of
//! dynamic dispatch at this seam.

use crate::error::{Error, Result};

/// Monotonic milliseconds, as returned by [`Transport::now`].
///
/// Deadlines are computed as modular (wrapping) differences so that a
/// 32-bit clock wrapping from `0xFFFF_FFFF` to `0` never spuriously
/// fires a pending timeout.
pub type Instant = u32;

/// Computes `now - deadline >= 0` under wraparound-safe modular
/// arithmetic: true once `now` has reached or passed `deadline`.
#[must_use]
pub fn has_elapsed(now: Instant, deadline: Instant) -> bool {
    (now.wrapping_sub(deadline) as i32) >= 0
}

/// The non-blocking transport interface (`spec` §6).
///
/// Implementations are provided by the integrator (POSIX sockets, UART
/// drivers, in-memory mocks for tests); this crate only consumes the
/// trait.
pub trait Transport {
    /// Attempts to send `buf`. May be partial: `Ok(n)` with `n < buf.len()`
    /// means "would-block, retry later", never a silent truncation.
    fn send(&mut self, buf: &[u8]) -> Result<usize>;

    /// Attempts to fill as much of `buf` as is available without
    /// blocking. `Ok(0)` means "no data yet".
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// The current value of a monotonic millisecond clock.
    fn now(&self) -> Instant;

    /// Optionally cedes the CPU / advances time. Must never call back
    /// into the engine that owns this transport.
    fn yield_now(&mut self) {}
}

/// Reports a fatal, non-recoverable transport condition (e.g. a closed
/// socket) distinct from an ordinary `Io` error during a single `poll`.
pub trait TransportStatus {
    fn is_disconnected(&self) -> bool {
        false
    }
}

pub(crate) fn map_send_result(requested: usize, processed: usize) -> Result<usize> {
    if processed > requested {
        return Err(Error::Io);
    }
    Ok(processed)
}
