// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The auto-heal supervisor (`spec` C8): a thin state machine wrapping
//! [`ClientEngine`] with exponential backoff and a circuit breaker,
//! `spec` §4.8:
//! `Idle -> Waiting -> {Idle, Scheduled -> Waiting, CircuitOpen -> Idle}`.

use heapless::Deque;
use heapless::Vec as HVec;

use crate::client::{ClientEngine, CompletionFn, Handle, SubmitRequest};
use crate::diag::{Diagnostics, EngineState, Event, EventSink};
use crate::error::{Error, Result};
use crate::frame::Framing;
use crate::pdu::MAX_PDU_PAYLOAD_LEN;
use crate::transport::{has_elapsed, Instant, Transport};

pub const DEFAULT_INITIAL_BACKOFF_MS: u32 = 50;
pub const DEFAULT_MAX_BACKOFF_MS: u32 = 5_000;
pub const DEFAULT_MAX_RETRIES: u8 = 4;
pub const DEFAULT_COOLDOWN_MS: u32 = 10_000;

/// Backoff and circuit-breaker parameters, set once at [`AutoHeal::new`]
/// or updated later with [`AutoHeal::set_config`].
#[derive(Debug, Clone, Copy)]
pub struct AutoHealConfig {
    pub initial_backoff_ms: u32,
    pub max_backoff_ms: u32,
    pub max_retries: u8,
    pub cooldown_ms: u32,
}

impl Default for AutoHealConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
        }
    }
}

struct Supervised {
    pdu: HVec<u8, MAX_PDU_PAYLOAD_LEN>,
    unit_id: u8,
    timeout_ms: u32,
    high_priority: bool,
    callback: Option<CompletionFn>,
    ctx: *mut (),
    retries_done: u8,
    backoff_ms: u32,
}

// SAFETY: `ctx` is only ever dereferenced inside the caller-supplied
// callback, invoked synchronously from `poll` on the same thread that
// owns the supervisor.
unsafe impl Send for Supervised {}

/// Outcome delivered synchronously from the wrapped [`ClientEngine`]'s
/// completion callback, stashed here until the next `poll_inner` step
/// picks it up.
enum Outcome {
    Success(HVec<u8, MAX_PDU_PAYLOAD_LEN>),
    Failure(Error),
}

/// Wraps a [`ClientEngine`] with bounded retries, exponential backoff,
/// and a circuit breaker: `spec` §4.8.
pub struct AutoHeal<const POOL: usize, const QUEUE: usize> {
    client: ClientEngine<POOL, QUEUE>,
    state: EngineState,
    config: AutoHealConfig,
    queue: Deque<Supervised, QUEUE>,
    active: Option<Supervised>,
    active_handle: Option<Handle>,
    outcome: Option<Outcome>,
    scheduled_until: Instant,
    circuit_until: Instant,
    diagnostics: Diagnostics,
    events: EventSink,
}

impl<const POOL: usize, const QUEUE: usize> AutoHeal<POOL, QUEUE> {
    #[must_use]
    pub fn new(framing: Framing, silence_ms: u32, config: AutoHealConfig) -> Self {
        let mut supervisor = Self {
            client: ClientEngine::new(framing, silence_ms),
            state: EngineState::Idle,
            config,
            queue: Deque::new(),
            active: None,
            active_handle: None,
            outcome: None,
            scheduled_until: 0,
            circuit_until: 0,
            diagnostics: Diagnostics::new(),
            events: EventSink::none(),
        };
        supervisor.events.emit(Event::EngineInitialised);
        supervisor
    }

    pub fn set_config(&mut self, config: AutoHealConfig) {
        self.config = config;
    }

    pub fn set_event_callback(&mut self, callback: fn(Event, *mut ()), ctx: *mut ()) {
        self.events.set(callback, ctx);
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == EngineState::Idle && self.active.is_none() && self.queue.is_empty()
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

    /// Enqueues `request` for supervised delivery. Rejected with
    /// [`Error::Busy`] while the circuit is open, or
    /// [`Error::NoResources`] if the wait queue is full.
    pub fn submit(&mut self, request: SubmitRequest<'_>) -> Result<()> {
        if self.state == EngineState::CircuitOpen {
            return Err(Error::Busy);
        }
        if request.pdu.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut pdu = HVec::new();
        pdu.extend_from_slice(request.pdu).map_err(|()| Error::InvalidArgument)?;
        let supervised = Supervised {
            pdu,
            unit_id: request.unit_id,
            timeout_ms: request.timeout_ms,
            high_priority: request.high_priority,
            callback: request.callback,
            ctx: request.ctx,
            retries_done: 0,
            backoff_ms: self.config.initial_backoff_ms,
        };
        self.queue.push_back(supervised).map_err(|_| Error::NoResources)?;
        self.diagnostics.record_submitted();
        Ok(())
    }

    /// Submits a poison pill: the next `poll` call drains the wait
    /// queue and cancels the active supervised request, if any.
    pub fn submit_poison(&mut self) {
        if let Some(handle) = self.active_handle.take() {
            let _ = self.client.cancel(handle);
        }
        while let Some(s) = self.queue.pop_front() {
            Self::fire(&s, Err(Error::Cancelled));
        }
        if let Some(s) = self.active.take() {
            Self::fire(&s, Err(Error::Cancelled));
            self.enter_state(EngineState::Idle);
        }
        self.diagnostics.record_poison_trigger();
    }

    fn fire(s: &Supervised, result: core::result::Result<&[u8], Error>) {
        if let Some(cb) = s.callback {
            cb(0, result, s.ctx);
        }
    }

    fn enter_state(&mut self, state: EngineState) {
        self.events.emit(Event::ClientStateExit(self.state));
        self.state = state;
        self.events.emit(Event::ClientStateEnter(state));
    }

    fn on_complete(_handle: Handle, result: core::result::Result<&[u8], Error>, ctx: *mut ()) {
        // SAFETY: `ctx` points at the `AutoHeal` that submitted this
        // transaction and outlives the synchronous `poll` call that
        // invokes this callback.
        let this = unsafe { &mut *ctx.cast::<Self>() };
        this.outcome = Some(match result {
            Ok(pdu) => {
                let mut owned = HVec::new();
                let _ = owned.extend_from_slice(pdu);
                Outcome::Success(owned)
            }
            Err(err) => Outcome::Failure(err),
        });
    }

    /// Drives the supervisor and its wrapped client engine forward by
    /// one logical step.
    pub fn poll<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        self.client.poll(transport)?;
        self.events.emit(Event::StepBegin);
        let result = self.poll_inner(transport);
        self.events.emit(Event::StepEnd);
        result
    }

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
        match self.state {
            EngineState::Idle => self.step_idle(transport),
            EngineState::Waiting => self.step_waiting(),
            EngineState::Scheduled => self.step_scheduled(transport),
            EngineState::CircuitOpen => self.step_circuit_open(transport),
            _ => Ok(()),
        }
    }

    fn step_idle<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        if self.active.is_none() {
            self.active = self.queue.pop_front();
        }
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        self.dispatch(transport, active.unit_id, active.timeout_ms, active.high_priority)
    }

    fn dispatch<T: Transport>(
        &mut self,
        transport: &mut T,
        unit_id: u8,
        timeout_ms: u32,
        high_priority: bool,
    ) -> Result<()> {
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        let request = SubmitRequest {
            unit_id,
            pdu: &active.pdu,
            timeout_ms,
            max_retries: 0,
            retry_backoff_ms: 0,
            high_priority,
            callback: Some(Self::on_complete),
            ctx: core::ptr::from_mut(self).cast::<()>(),
        };
        match self.client.submit(request) {
            Ok(handle) => {
                self.active_handle = Some(handle);
                self.client.poll(transport)?;
                self.enter_state(EngineState::Waiting);
                Ok(())
            }
            Err(err) => {
                let active = self.active.take().expect("active checked above");
                Self::fire(&active, Err(err));
                self.diagnostics.record_error(err);
                Ok(())
            }
        }
    }

    fn step_waiting(&mut self) -> Result<()> {
        let Some(outcome) = self.outcome.take() else {
            return Ok(());
        };
        let Some(mut active) = self.active.take() else {
            self.enter_state(EngineState::Idle);
            return Ok(());
        };
        self.active_handle = None;
        match outcome {
            Outcome::Success(response) => {
                Self::fire(&active, Ok(&response));
                self.diagnostics.record_success(active.pdu.first().copied().unwrap_or(0));
                self.enter_state(EngineState::Idle);
            }
            Outcome::Failure(err) => {
                self.diagnostics.record_error(err);
                if active.retries_done < self.config.max_retries {
                    active.retries_done += 1;
                    active.backoff_ms = active.backoff_ms.saturating_mul(2).min(self.config.max_backoff_ms);
                    self.diagnostics.record_retry();
                    self.active = Some(active);
                    self.enter_state(EngineState::Scheduled);
                } else {
                    Self::fire(&active, Err(err));
                    self.enter_state(EngineState::CircuitOpen);
                }
            }
        }
        Ok(())
    }

    fn step_scheduled<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        let Some(active) = self.active.as_ref() else {
            self.enter_state(EngineState::Idle);
            return Ok(());
        };
        let now = transport.now();
        if self.scheduled_until == 0 {
            self.scheduled_until = now.wrapping_add(active.backoff_ms);
            return Ok(());
        }
        if has_elapsed(now, self.scheduled_until) {
            self.scheduled_until = 0;
            let (unit_id, timeout_ms, high_priority) = {
                let active = self.active.as_ref().expect("checked above");
                (active.unit_id, active.timeout_ms, active.high_priority)
            };
            self.dispatch(transport, unit_id, timeout_ms, high_priority)?;
        }
        Ok(())
    }

    fn step_circuit_open<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        let now = transport.now();
        if self.circuit_until == 0 {
            self.circuit_until = now.wrapping_add(self.config.cooldown_ms);
            return Ok(());
        }
        if has_elapsed(now, self.circuit_until) {
            self.circuit_until = 0;
            self.enter_state(EngineState::Idle);
        }
        Ok(())
    }
}
