// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Diagnostics counters and the synchronous event sink (`spec` C9).

use crate::error::Error;
use crate::pdu::fc;

/// Number of function-code slots tracked by [`Diagnostics`], indexed by
/// the 7-bit function code (bit 7, the exception flag, is masked off).
const FC_SLOTS: usize = 128;

/// One slot per [`Error`] discriminant that can be attributed to a
/// transaction outcome. `Exception` codes collapse into a single slot;
/// the offending code is recoverable from `last_error`.
const ERROR_SLOTS: usize = 9;

fn error_slot(err: Error) -> usize {
    match err {
        Error::InvalidArgument => 0,
        Error::NoResources => 1,
        Error::Busy => 2,
        Error::Timeout => 3,
        Error::Crc => 4,
        Error::Io => 5,
        Error::Cancelled => 6,
        Error::Exception(_) => 7,
        Error::DecodingError | Error::NotInitialised | Error::AlreadyInitialised => 8,
    }
}

/// Per-function-code success counters, per-error-slot counters, and the
/// most recent error observed by an engine.
#[derive(Debug, Clone, Copy)]
pub struct Diagnostics {
    fc_success: [u32; FC_SLOTS],
    error_counts: [u32; ERROR_SLOTS],
    last_error: Option<Error>,
    submitted: u32,
    completed: u32,
    cancelled: u32,
    timeouts: u32,
    retries: u32,
    exceptions: u32,
    dropped: u32,
    broadcast: u32,
    poison_triggers: u32,
    bytes_tx: u32,
    bytes_rx: u32,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fc_success: [0; FC_SLOTS],
            error_counts: [0; ERROR_SLOTS],
            last_error: None,
            submitted: 0,
            completed: 0,
            cancelled: 0,
            timeouts: 0,
            retries: 0,
            exceptions: 0,
            dropped: 0,
            broadcast: 0,
            poison_triggers: 0,
            bytes_tx: 0,
            bytes_rx: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn record_submitted(&mut self) {
        self.submitted += 1;
    }

    pub fn record_success(&mut self, function_code: u8) {
        self.completed += 1;
        let slot = usize::from(function_code & !fc::EXCEPTION_BIT);
        if let Some(c) = self.fc_success.get_mut(slot) {
            *c += 1;
        }
    }

    pub fn record_error(&mut self, err: Error) {
        self.error_counts[error_slot(err)] += 1;
        self.last_error = Some(err);
        match err {
            Error::Timeout => self.timeouts += 1,
            Error::Cancelled => self.cancelled += 1,
            Error::Exception(_) => self.exceptions += 1,
            _ => {}
        }
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub fn record_dropped(&mut self) {
        self.dropped += 1;
    }

    /// Counts a broadcast request (`unit_id == 0`) that applied its side
    /// effect without a response, distinct from a unicast completion.
    pub fn record_broadcast(&mut self) {
        self.broadcast += 1;
    }

    pub fn record_poison_trigger(&mut self) {
        self.poison_triggers += 1;
    }

    pub fn record_tx_bytes(&mut self, n: usize) {
        self.bytes_tx = self.bytes_tx.saturating_add(n as u32);
    }

    pub fn record_rx_bytes(&mut self, n: usize) {
        self.bytes_rx = self.bytes_rx.saturating_add(n as u32);
    }

    #[must_use]
    pub fn fc_success_count(&self, function_code: u8) -> u32 {
        self.fc_success[usize::from(function_code & !fc::EXCEPTION_BIT)]
    }

    #[must_use]
    pub fn error_count(&self, err: Error) -> u32 {
        self.error_counts[error_slot(err)]
    }

    #[must_use]
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    #[must_use]
    pub fn submitted(&self) -> u32 {
        self.submitted
    }

    #[must_use]
    pub fn completed(&self) -> u32 {
        self.completed
    }

    #[must_use]
    pub fn cancelled(&self) -> u32 {
        self.cancelled
    }

    #[must_use]
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    #[must_use]
    pub fn exceptions(&self) -> u32 {
        self.exceptions
    }

    #[must_use]
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    #[must_use]
    pub fn broadcast(&self) -> u32 {
        self.broadcast
    }

    #[must_use]
    pub fn poison_triggers(&self) -> u32 {
        self.poison_triggers
    }

    #[must_use]
    pub fn bytes_tx(&self) -> u32 {
        self.bytes_tx
    }

    #[must_use]
    pub fn bytes_rx(&self) -> u32 {
        self.bytes_rx
    }
}

/// A state a client or server engine can be in, used by
/// [`Event::ClientStateEnter`]/[`Event::ServerStateEnter`] and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Ready,
    Waiting,
    Backoff,
    Processing,
    Scheduled,
    CircuitOpen,
}

/// The tagged event stream emitted synchronously by client/server
/// engines (`spec` §3). Never emitted from interrupt context; the core
/// does not retain the event past the callback invocation.
#[derive(Debug, Clone, Copy)]
pub enum Event {
    ClientStateEnter(EngineState),
    ClientStateExit(EngineState),
    ClientTxSubmit,
    ClientTxComplete,
    ServerStateEnter(EngineState),
    ServerStateExit(EngineState),
    ServerRequestAccept,
    ServerRequestComplete,
    EngineInitialised,
    StepBegin,
    StepEnd,
    RxReady,
    PduReady,
    TxSent,
    Timeout,
    StateChange,
}

/// A synchronous, non-reentrant event sink: `(callback, user context)`.
/// The core never retains `ctx` or the event beyond the call.
#[derive(Clone, Copy)]
pub struct EventSink {
    callback: Option<fn(Event, *mut ()) -> ()>,
    ctx: *mut (),
}

impl core::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventSink")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::none()
    }
}

impl EventSink {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            callback: None,
            ctx: core::ptr::null_mut(),
        }
    }

    /// # Safety
    /// `ctx` must remain valid for as long as the sink is installed and
    /// may be called back into; the core never stores `ctx` beyond a
    /// single synchronous call.
    pub fn set(&mut self, callback: fn(Event, *mut ()), ctx: *mut ()) {
        self.callback = Some(callback);
        self.ctx = ctx;
    }

    pub fn clear(&mut self) {
        self.callback = None;
        self.ctx = core::ptr::null_mut();
    }

    pub fn emit(&self, event: Event) {
        if let Some(cb) = self.callback {
            cb(event, self.ctx);
        }
        #[cfg(feature = "log")]
        log::trace!("modbus event: {event:?}");
    }
}

// SAFETY: the sink only ever calls `callback` synchronously from the
// engine's own `poll`, never concurrently; callers are responsible for
// `ctx`'s validity for the sink's lifetime.
unsafe impl Send for EventSink {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fc_success_counts_strip_exception_bit() {
        let mut diag = Diagnostics::new();
        diag.record_success(fc::READ_HOLDING_REGISTERS);
        assert_eq!(diag.fc_success_count(fc::READ_HOLDING_REGISTERS), 1);
    }

    #[test]
    fn record_error_updates_last_error_and_counts() {
        let mut diag = Diagnostics::new();
        diag.record_error(Error::Timeout);
        diag.record_error(Error::Timeout);
        diag.record_error(Error::Crc);
        assert_eq!(diag.error_count(Error::Timeout), 2);
        assert_eq!(diag.error_count(Error::Crc), 1);
        assert_eq!(diag.last_error(), Some(Error::Crc));
        assert_eq!(diag.timeouts(), 2);
    }

    #[test]
    fn reset_clears_everything() {
        let mut diag = Diagnostics::new();
        diag.record_submitted();
        diag.record_error(Error::Busy);
        diag.reset();
        assert_eq!(diag.submitted(), 0);
        assert_eq!(diag.error_count(Error::Busy), 0);
        assert_eq!(diag.last_error(), None);
    }

    #[test]
    fn event_sink_invokes_callback_with_ctx() {
        static mut SEEN: Option<EngineState> = None;
        fn cb(event: Event, _ctx: *mut ()) {
            if let Event::ClientStateEnter(s) = event {
                unsafe {
                    SEEN = Some(s);
                }
            }
        }
        let mut sink = EventSink::none();
        sink.set(cb, core::ptr::null_mut());
        sink.emit(Event::ClientStateEnter(EngineState::Waiting));
        assert_eq!(unsafe { SEEN }, Some(EngineState::Waiting));
    }
}
