// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The client engine (`spec` C6): a cooperative state machine that
//! submits PDUs, matches responses, and retries with backoff, driven
//! entirely by repeated calls to [`ClientEngine::poll`].

use heapless::Deque;
use heapless::Vec as HVec;

use crate::diag::{Diagnostics, EngineState, Event, EventSink};
use crate::error::{Error, Result};
use crate::frame::{Framing, Role};
#[cfg(feature = "ascii")]
use crate::frame::ascii::AsciiFramer;
#[cfg(feature = "rtu")]
use crate::frame::rtu::RtuFramer;
#[cfg(feature = "tcp")]
use crate::frame::tcp::TcpFramer;
use crate::pdu::MAX_PDU_PAYLOAD_LEN;
use crate::pool::Slab;
use crate::transport::{has_elapsed, Instant, Transport};

pub const DEFAULT_RESPONSE_TIMEOUT_MS: u32 = 1_000;
pub const DEFAULT_RETRY_BACKOFF_MS: u32 = 50;
pub const DEFAULT_MAX_RETRIES: u8 = 2;
const MAX_FRAME_BUF: usize = 256;
const FC_TIMEOUT_SLOTS: usize = 128;

/// Stable index into the transaction pool, returned by [`ClientEngine::submit`].
pub type Handle = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Sent,
    AwaitingResponse,
    Complete,
    TimedOut,
    Cancelled,
}

/// Invoked synchronously from [`ClientEngine::poll`] when a transaction
/// reaches a terminal state. The response slice, if present, borrows
/// from the transaction's own buffer and is only valid for the
/// duration of the call.
pub type CompletionFn = fn(Handle, core::result::Result<&[u8], Error>, *mut ());

struct Transaction {
    request_pdu: HVec<u8, MAX_PDU_PAYLOAD_LEN>,
    response: HVec<u8, MAX_PDU_PAYLOAD_LEN>,
    unit_id: u8,
    function_code: u8,
    timeout_ms: u32,
    retry_backoff_ms: u32,
    retries_remaining: u8,
    transaction_id: u16,
    deadline: Instant,
    backoff_until: Instant,
    status: TransactionStatus,
    high_priority: bool,
    callback: Option<CompletionFn>,
    ctx: *mut (),
}

// SAFETY: `ctx` is only ever dereferenced inside the caller-supplied
// `callback`, invoked synchronously from `poll` on the same thread
// that owns the engine.
unsafe impl Send for Transaction {}

impl Transaction {
    fn fire(&self, handle: Handle, result: core::result::Result<&[u8], Error>) {
        if let Some(cb) = self.callback {
            cb(handle, result, self.ctx);
        }
    }
}

/// A request to submit: the encoded PDU (function code + payload) plus
/// per-request overrides. Build the PDU with [`crate::pdu`]'s
/// `build_*_request` functions first.
#[derive(Debug, Clone, Copy)]
pub struct SubmitRequest<'a> {
    pub unit_id: u8,
    pub pdu: &'a [u8],
    /// `0` defers to the function-code timeout table, then the engine default.
    pub timeout_ms: u32,
    pub max_retries: u8,
    /// Initial backoff before the first retry, doubling on each
    /// subsequent one. `0` defers to the engine's configured default
    /// (see [`ClientEngine::set_retry_backoff_ms`]).
    pub retry_backoff_ms: u32,
    pub high_priority: bool,
    pub callback: Option<CompletionFn>,
    pub ctx: *mut (),
}

enum ClientFramer {
    #[cfg(feature = "rtu")]
    Rtu(RtuFramer),
    #[cfg(feature = "tcp")]
    Tcp(TcpFramer),
    #[cfg(feature = "ascii")]
    Ascii(AsciiFramer),
}

struct MatchedFrame<'a> {
    unit_id: u8,
    transaction_id: Option<u16>,
    pdu: &'a [u8],
}

impl ClientFramer {
    fn new(framing: Framing, silence_ms: u32) -> Self {
        match framing {
            #[cfg(feature = "rtu")]
            Framing::Rtu => Self::Rtu(RtuFramer::new(Role::Client, silence_ms)),
            #[cfg(feature = "tcp")]
            Framing::Tcp => Self::Tcp(TcpFramer::new()),
            #[cfg(feature = "ascii")]
            Framing::Ascii => Self::Ascii(AsciiFramer::new(Role::Client, silence_ms)),
            #[allow(unreachable_patterns)]
            _ => panic!("framing variant not compiled in"),
        }
    }

    fn poll_match<T: Transport>(&mut self, transport: &mut T) -> Result<Option<MatchedFrame<'_>>> {
        match self {
            #[cfg(feature = "rtu")]
            Self::Rtu(f) => match f.poll_recv(transport)? {
                crate::frame::FrameEvent::Adu(view) => Ok(Some(MatchedFrame {
                    unit_id: view.unit_id,
                    transaction_id: None,
                    pdu: view.pdu,
                })),
                _ => Ok(None),
            },
            #[cfg(feature = "tcp")]
            Self::Tcp(f) => match f.poll_recv(transport)? {
                crate::frame::tcp::TcpFrameEvent::Adu(view) => Ok(Some(MatchedFrame {
                    unit_id: view.unit_id,
                    transaction_id: Some(view.transaction_id),
                    pdu: view.pdu,
                })),
                _ => Ok(None),
            },
            #[cfg(feature = "ascii")]
            Self::Ascii(f) => match f.poll_recv(transport)? {
                crate::frame::FrameEvent::Adu(view) => Ok(Some(MatchedFrame {
                    unit_id: view.unit_id,
                    transaction_id: None,
                    pdu: view.pdu,
                })),
                _ => Ok(None),
            },
        }
    }

    fn consume(&mut self) {
        match self {
            #[cfg(feature = "rtu")]
            Self::Rtu(f) => f.consume(),
            #[cfg(feature = "tcp")]
            Self::Tcp(f) => f.consume(),
            #[cfg(feature = "ascii")]
            Self::Ascii(f) => f.consume(),
        }
    }

    fn encode(&self, out: &mut [u8], unit_id: u8, transaction_id: u16, pdu: &[u8]) -> Result<usize> {
        match self {
            #[cfg(feature = "rtu")]
            Self::Rtu(_) => RtuFramer::encode(out, unit_id, pdu),
            #[cfg(feature = "tcp")]
            Self::Tcp(_) => TcpFramer::encode(out, transaction_id, unit_id, pdu),
            #[cfg(feature = "ascii")]
            Self::Ascii(_) => AsciiFramer::encode(out, unit_id, pdu),
        }
    }

    fn send<T: Transport>(&mut self, transport: &mut T, frame: &[u8]) -> Result<()> {
        match self {
            #[cfg(feature = "rtu")]
            Self::Rtu(f) => f.send(transport, frame),
            #[cfg(feature = "tcp")]
            Self::Tcp(f) => f.send(transport, frame),
            #[cfg(feature = "ascii")]
            Self::Ascii(_) => {
                let sent = transport.send(frame)?;
                if sent != frame.len() {
                    return Err(Error::Io);
                }
                Ok(())
            }
        }
    }

    #[allow(unreachable_patterns)]
    fn uses_transaction_id(&self) -> bool {
        match self {
            #[cfg(feature = "tcp")]
            Self::Tcp(_) => true,
            _ => false,
        }
    }
}

/// The cooperative client state machine, `spec` §4.5:
/// `Idle -> Ready -> Waiting -> {Idle, Backoff -> Ready}`.
pub struct ClientEngine<const POOL: usize, const QUEUE: usize> {
    state: EngineState,
    framer: ClientFramer,
    pool: Slab<Transaction, POOL>,
    priority_queue: Deque<Handle, QUEUE>,
    fifo_queue: Deque<Handle, QUEUE>,
    queue_capacity: usize,
    active: Option<Handle>,
    poison_pending: bool,
    next_tid: u16,
    watchdog_ms: u32,
    default_timeout_ms: u32,
    default_retry_backoff_ms: u32,
    fc_timeout: [u32; FC_TIMEOUT_SLOTS],
    tx_buf: [u8; MAX_FRAME_BUF],
    diagnostics: Diagnostics,
    events: EventSink,
}

impl<const POOL: usize, const QUEUE: usize> ClientEngine<POOL, QUEUE> {
    #[must_use]
    pub fn new(framing: Framing, silence_ms: u32) -> Self {
        let mut engine = Self {
            state: EngineState::Idle,
            framer: ClientFramer::new(framing, silence_ms),
            pool: Slab::new(),
            priority_queue: Deque::new(),
            fifo_queue: Deque::new(),
            queue_capacity: QUEUE,
            active: None,
            poison_pending: false,
            next_tid: 1,
            watchdog_ms: 0,
            default_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            default_retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            fc_timeout: [0; FC_TIMEOUT_SLOTS],
            tx_buf: [0; MAX_FRAME_BUF],
            diagnostics: Diagnostics::new(),
            events: EventSink::none(),
        };
        engine.events.emit(Event::EngineInitialised);
        engine
    }

    pub fn set_watchdog(&mut self, ms: u32) {
        self.watchdog_ms = ms;
    }

    pub fn set_queue_capacity(&mut self, n: usize) {
        self.queue_capacity = n.min(QUEUE);
    }

    pub fn set_fc_timeout(&mut self, function_code: u8, ms: u32) {
        if let Some(slot) = self.fc_timeout.get_mut(usize::from(function_code & 0x7F)) {
            *slot = ms;
        }
    }

    /// Sets the engine-wide default initial retry backoff, used by any
    /// submission whose `retry_backoff_ms` is `0`.
    pub fn set_retry_backoff_ms(&mut self, ms: u32) {
        self.default_retry_backoff_ms = ms;
    }

    pub fn set_event_callback(&mut self, callback: fn(Event, *mut ()), ctx: *mut ()) {
        self.events.set(callback, ctx);
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == EngineState::Idle && self.active.is_none() && self.queue_len() == 0
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue_len() + usize::from(self.active.is_some())
    }

    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    #[must_use]
    pub fn get_metrics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn reset_metrics(&mut self) {
        self.diagnostics.reset();
    }

    #[must_use]
    pub fn get_diag(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn reset_diag(&mut self) {
        self.diagnostics.reset();
    }

    fn queue_len(&self) -> usize {
        self.priority_queue.len() + self.fifo_queue.len()
    }

    fn resolved_timeout(&self, function_code: u8, requested: u32) -> u32 {
        if requested != 0 {
            return requested;
        }
        let fc_slot = self.fc_timeout[usize::from(function_code & 0x7F)];
        if fc_slot != 0 {
            return fc_slot;
        }
        self.default_timeout_ms
    }

    /// Enqueues `request` for sending. Returns [`Error::NoResources`] if
    /// the transaction pool or the target queue is at capacity.
    pub fn submit(&mut self, request: SubmitRequest<'_>) -> Result<Handle> {
        if request.pdu.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let in_target_queue = if request.high_priority {
            self.priority_queue.len()
        } else {
            self.fifo_queue.len()
        };
        if self.queue_len() >= self.queue_capacity || in_target_queue >= self.queue_capacity {
            return Err(Error::NoResources);
        }
        let function_code = request.pdu[0];
        let mut request_pdu = HVec::new();
        request_pdu
            .extend_from_slice(request.pdu)
            .map_err(|()| Error::InvalidArgument)?;
        let timeout_ms = self.resolved_timeout(function_code, request.timeout_ms);
        let retry_backoff_ms = if request.retry_backoff_ms != 0 {
            request.retry_backoff_ms
        } else {
            self.default_retry_backoff_ms
        };
        let txn = Transaction {
            request_pdu,
            response: HVec::new(),
            unit_id: request.unit_id,
            function_code,
            timeout_ms,
            retry_backoff_ms,
            retries_remaining: request.max_retries,
            transaction_id: 0,
            deadline: 0,
            backoff_until: 0,
            status: TransactionStatus::Pending,
            high_priority: request.high_priority,
            callback: request.callback,
            ctx: request.ctx,
        };
        let handle = self.pool.acquire(txn).ok_or(Error::NoResources)?;
        let queue = if request.high_priority {
            &mut self.priority_queue
        } else {
            &mut self.fifo_queue
        };
        if queue.push_back(handle).is_err() {
            self.pool.release(handle);
            return Err(Error::NoResources);
        }
        self.diagnostics.record_submitted();
        self.events.emit(Event::ClientTxSubmit);
        Ok(handle)
    }

    /// Submits a capacity-exempt poison pill: the next `poll` call
    /// drains and cancels every queued transaction.
    pub fn submit_poison(&mut self) {
        self.poison_pending = true;
    }

    /// Cancels `handle`, synchronously invoking its callback with
    /// [`Error::Cancelled`] before returning.
    pub fn cancel(&mut self, handle: Handle) -> Result<()> {
        if self.active == Some(handle) {
            self.complete(handle, Err(Error::Cancelled));
            self.active = None;
            self.enter_state(EngineState::Idle);
            return Ok(());
        }
        if Self::remove_from_deque(&mut self.priority_queue, handle)
            || Self::remove_from_deque(&mut self.fifo_queue, handle)
        {
            self.complete(handle, Err(Error::Cancelled));
            return Ok(());
        }
        Err(Error::InvalidArgument)
    }

    fn remove_from_deque(deque: &mut Deque<Handle, QUEUE>, handle: Handle) -> bool {
        let mut found = false;
        let len = deque.len();
        for _ in 0..len {
            let h = deque.pop_front().unwrap();
            if h == handle && !found {
                found = true;
                continue;
            }
            let _ = deque.push_back(h);
        }
        found
    }

    fn enter_state(&mut self, state: EngineState) {
        self.events.emit(Event::ClientStateExit(self.state));
        self.state = state;
        self.events.emit(Event::ClientStateEnter(state));
    }

    fn complete(&mut self, handle: Handle, result: core::result::Result<(), Error>) {
        if let Some(txn) = self.pool.get_mut(handle) {
            txn.status = match &result {
                Ok(()) => TransactionStatus::Complete,
                Err(Error::Timeout) => TransactionStatus::TimedOut,
                Err(Error::Cancelled) => TransactionStatus::Cancelled,
                Err(_) => TransactionStatus::Complete,
            };
            let fc = txn.function_code;
            match result {
                Ok(()) => {
                    txn.fire(handle, Ok(&txn.response));
                    self.diagnostics.record_success(fc);
                }
                Err(err) => {
                    txn.fire(handle, Err(err));
                    self.diagnostics.record_error(err);
                }
            }
            self.events.emit(Event::ClientTxComplete);
        }
        self.pool.release(handle);
    }

    /// Drives the state machine forward by one logical step.
    pub fn poll<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        self.events.emit(Event::StepBegin);
        let result = self.poll_inner(transport);
        self.events.emit(Event::StepEnd);
        result
    }

    /// Drives the state machine for up to `budget` steps, stopping
    /// early once idle with an empty queue.
    pub fn poll_with_budget<T: Transport>(&mut self, transport: &mut T, budget: usize) -> Result<()> {
        for _ in 0..budget {
            self.poll(transport)?;
            if self.is_idle() {
                break;
            }
        }
        Ok(())
    }

    fn poll_inner<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        if self.poison_pending && self.state == EngineState::Idle {
            self.poison_pending = false;
            self.diagnostics.record_poison_trigger();
            while let Some(h) = self.priority_queue.pop_front() {
                self.complete(h, Err(Error::Cancelled));
            }
            while let Some(h) = self.fifo_queue.pop_front() {
                self.complete(h, Err(Error::Cancelled));
            }
            return Ok(());
        }

        match self.state {
            EngineState::Idle => self.step_idle(),
            EngineState::Ready => self.step_ready(transport),
            EngineState::Waiting => self.step_waiting(transport),
            EngineState::Backoff => self.step_backoff(transport),
            _ => Ok(()),
        }
    }

    fn step_idle(&mut self) -> Result<()> {
        let handle = self
            .priority_queue
            .pop_front()
            .or_else(|| self.fifo_queue.pop_front());
        if let Some(handle) = handle {
            self.active = Some(handle);
            self.enter_state(EngineState::Ready);
        }
        Ok(())
    }

    fn step_ready<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        let Some(handle) = self.active else {
            self.enter_state(EngineState::Idle);
            return Ok(());
        };
        let uses_tid = self.framer.uses_transaction_id();
        let (tid, unit_id, frame_len) = {
            let Some(txn) = self.pool.get_mut(handle) else {
                self.active = None;
                self.enter_state(EngineState::Idle);
                return Ok(());
            };
            if uses_tid && txn.transaction_id == 0 {
                txn.transaction_id = self.next_tid;
                self.next_tid = if self.next_tid == 0xFFFF { 1 } else { self.next_tid + 1 };
            }
            let n = self
                .framer
                .encode(&mut self.tx_buf, txn.unit_id, txn.transaction_id, &txn.request_pdu)?;
            (txn.transaction_id, txn.unit_id, n)
        };
        let _ = unit_id;
        match self.framer.send(transport, &self.tx_buf[..frame_len]) {
            Ok(()) => {
                self.diagnostics.record_tx_bytes(frame_len);
                let now = transport.now();
                if let Some(txn) = self.pool.get_mut(handle) {
                    txn.status = TransactionStatus::AwaitingResponse;
                    txn.transaction_id = tid;
                    txn.deadline = now.wrapping_add(txn.timeout_ms);
                }
                self.events.emit(Event::TxSent);
                self.enter_state(EngineState::Waiting);
                Ok(())
            }
            Err(err) => {
                self.active = None;
                self.complete(handle, Err(err));
                self.enter_state(EngineState::Idle);
                Ok(())
            }
        }
    }

    fn step_waiting<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        let Some(handle) = self.active else {
            self.enter_state(EngineState::Idle);
            return Ok(());
        };
        if let Some(frame) = self.framer.poll_match(transport)? {
            self.diagnostics.record_rx_bytes(frame.pdu.len());
            self.events.emit(Event::RxReady);
            let matches = {
                let Some(txn) = self.pool.get(handle) else {
                    self.framer.consume();
                    self.active = None;
                    self.enter_state(EngineState::Idle);
                    return Ok(());
                };
                match frame.transaction_id {
                    Some(tid) => tid == txn.transaction_id && frame.unit_id == txn.unit_id,
                    None => {
                        frame.unit_id == txn.unit_id
                            && (frame.pdu.first() == Some(&txn.function_code)
                                || frame.pdu.first() == Some(&(txn.function_code | 0x80)))
                    }
                }
            };
            if matches {
                self.events.emit(Event::PduReady);
                if let Some(txn) = self.pool.get_mut(handle) {
                    txn.response.clear();
                    let _ = txn.response.extend_from_slice(frame.pdu);
                }
                self.framer.consume();
                self.active = None;
                self.complete(handle, Ok(()));
                self.enter_state(EngineState::Idle);
                return Ok(());
            }
            // Stale or foreign frame (e.g. a late TCP response after a
            // retry reused the slot): drop it silently and keep waiting.
            self.framer.consume();
            self.diagnostics.record_dropped();
            return Ok(());
        }

        let now = transport.now();
        let timed_out = self
            .pool
            .get(handle)
            .is_some_and(|txn| has_elapsed(now, txn.deadline));
        if timed_out {
            self.events.emit(Event::Timeout);
            let retry = self.pool.get_mut(handle).map(|txn| {
                if txn.retries_remaining > 0 {
                    txn.retries_remaining -= 1;
                    txn.backoff_until = now.wrapping_add(txn.retry_backoff_ms);
                    txn.retry_backoff_ms = txn.retry_backoff_ms.saturating_mul(2);
                    true
                } else {
                    false
                }
            });
            match retry {
                Some(true) => {
                    self.diagnostics.record_retry();
                    self.enter_state(EngineState::Backoff);
                }
                Some(false) => {
                    self.active = None;
                    self.complete(handle, Err(Error::Timeout));
                    self.enter_state(EngineState::Idle);
                }
                None => {
                    self.active = None;
                    self.enter_state(EngineState::Idle);
                }
            }
        }
        Ok(())
    }

    fn step_backoff<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        let Some(handle) = self.active else {
            self.enter_state(EngineState::Idle);
            return Ok(());
        };
        let now = transport.now();
        let ready = self
            .pool
            .get(handle)
            .is_some_and(|txn| has_elapsed(now, txn.backoff_until));
        if ready {
            self.enter_state(EngineState::Ready);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::Vec as HV;

    struct MockTransport {
        rx: HV<u8, 512>,
        now: Instant,
        fail_send: bool,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                rx: HV::new(),
                now: 0,
                fail_send: false,
            }
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, buf: &[u8]) -> Result<usize> {
            if self.fail_send {
                return Err(Error::Io);
            }
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
    fn submit_send_and_match_completes_transaction() {
        static mut RESULT: Option<bool> = None;
        fn cb(_h: Handle, res: core::result::Result<&[u8], Error>, _ctx: *mut ()) {
            unsafe {
                RESULT = Some(res.is_ok());
            }
        }
        let mut engine: ClientEngine<4, 4> = ClientEngine::new(Framing::Tcp, 0);
        let mut t = MockTransport::new();
        let req_pdu = [0x03u8, 0x00, 0x00, 0x00, 0x02];
        let handle = engine
            .submit(SubmitRequest {
                unit_id: 1,
                pdu: &req_pdu,
                timeout_ms: 100,
                max_retries: 1,
                retry_backoff_ms: 0,
                high_priority: false,
                callback: Some(cb),
                ctx: core::ptr::null_mut(),
            })
            .unwrap();
        engine.poll(&mut t).unwrap(); // Idle -> Ready
        engine.poll(&mut t).unwrap(); // Ready -> Waiting (sends frame)

        let tid = engine.pool.get(handle).unwrap().transaction_id;
        let mut resp_buf = [0u8; 64];
        let resp_pdu = [0x03u8, 0x04, 0x00, 0x05, 0x00, 0x06];
        let n = crate::frame::tcp::TcpFramer::encode(&mut resp_buf, tid, 1, &resp_pdu).unwrap();
        t.rx.extend_from_slice(&resp_buf[..n]).unwrap();

        engine.poll(&mut t).unwrap(); // Waiting -> Idle (matched)
        assert_eq!(unsafe { RESULT }, Some(true));
        assert!(engine.is_idle());
    }

    #[test]
    fn timeout_retries_then_gives_up() {
        let mut engine: ClientEngine<4, 4> = ClientEngine::new(Framing::Tcp, 0);
        let mut t = MockTransport::new();
        let req_pdu = [0x03u8, 0x00, 0x00, 0x00, 0x02];
        engine
            .submit(SubmitRequest {
                unit_id: 1,
                pdu: &req_pdu,
                timeout_ms: 10,
                max_retries: 1,
                retry_backoff_ms: 0,
                high_priority: false,
                callback: None,
                ctx: core::ptr::null_mut(),
            })
            .unwrap();
        engine.poll(&mut t).unwrap(); // Idle -> Ready
        engine.poll(&mut t).unwrap(); // Ready -> Waiting
        t.now = 11;
        engine.poll(&mut t).unwrap(); // Waiting -> Backoff (retry 1)
        assert_eq!(engine.get_diag().retries(), 1);
        t.now = 100;
        engine.poll(&mut t).unwrap(); // Backoff -> Ready
        engine.poll(&mut t).unwrap(); // Ready -> Waiting
        t.now = 200;
        engine.poll(&mut t).unwrap(); // Waiting -> Idle (Timeout, no retries left)
        assert_eq!(engine.get_diag().timeouts(), 1);
        assert!(engine.is_idle());
    }

    #[test]
    fn stale_tcp_transaction_id_is_dropped_silently() {
        let mut engine: ClientEngine<4, 4> = ClientEngine::new(Framing::Tcp, 0);
        let mut t = MockTransport::new();
        let req_pdu = [0x03u8, 0x00, 0x00, 0x00, 0x02];
        engine
            .submit(SubmitRequest {
                unit_id: 1,
                pdu: &req_pdu,
                timeout_ms: 1000,
                max_retries: 0,
                retry_backoff_ms: 0,
                high_priority: false,
                callback: None,
                ctx: core::ptr::null_mut(),
            })
            .unwrap();
        engine.poll(&mut t).unwrap();
        engine.poll(&mut t).unwrap();

        let mut resp_buf = [0u8; 64];
        let resp_pdu = [0x03u8, 0x02, 0x00, 0x00];
        let n = TcpFramer::encode(&mut resp_buf, 0xFFFF, 1, &resp_pdu).unwrap();
        t.rx.extend_from_slice(&resp_buf[..n]).unwrap();
        engine.poll(&mut t).unwrap();
        assert_eq!(engine.state, EngineState::Waiting);
    }

    #[test]
    fn queue_capacity_rejects_overflow() {
        let mut engine: ClientEngine<2, 1> = ClientEngine::new(Framing::Tcp, 0);
        let pdu = [0x03u8, 0, 0, 0, 1];
        engine
            .submit(SubmitRequest {
                unit_id: 1,
                pdu: &pdu,
                timeout_ms: 10,
                max_retries: 0,
                retry_backoff_ms: 0,
                high_priority: false,
                callback: None,
                ctx: core::ptr::null_mut(),
            })
            .unwrap();
        let err = engine
            .submit(SubmitRequest {
                unit_id: 1,
                pdu: &pdu,
                timeout_ms: 10,
                max_retries: 0,
                retry_backoff_ms: 0,
                high_priority: false,
                callback: None,
                ctx: core::ptr::null_mut(),
            })
            .unwrap_err();
        assert_eq!(err, Error::NoResources);
    }
}
