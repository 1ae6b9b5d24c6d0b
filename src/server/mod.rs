// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The server engine (`spec` C7): decodes incoming ADUs, dispatches
//! reads/writes against a caller-owned register map, and answers every
//! unicast request (malformed requests get an exception, never
//! silence); broadcasts apply their side effect without a response.

use heapless::Deque;
use heapless::Vec as HVec;

use crate::diag::{Diagnostics, EngineState, Event, EventSink};
use crate::error::{
    Error, Result, EXC_ILLEGAL_DATA_ADDRESS, EXC_ILLEGAL_FUNCTION, EXC_SERVER_DEVICE_FAILURE,
};
#[cfg(feature = "ascii")]
use crate::frame::ascii::AsciiFramer;
#[cfg(feature = "rtu")]
use crate::frame::rtu::RtuFramer;
#[cfg(feature = "tcp")]
use crate::frame::tcp::TcpFramer;
use crate::frame::{Framing, Role};
use crate::pdu::{self, fc, MAX_PDU_PAYLOAD_LEN};
use crate::pool::Slab;
use crate::transport::{has_elapsed, Instant, Transport};

const MAX_FRAME_BUF: usize = 256;
const FC_TIMEOUT_SLOTS: usize = 128;

fn is_high_priority(function_code: u8) -> bool {
    fc::is_write(function_code)
}

/// One of the four Modbus data models a [`Bank`] can back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankKind {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

/// The caller-owned backing storage for one [`Bank`]: bit-packed bytes
/// for coil/discrete-input banks, or a register array for
/// holding/input-register banks.
pub enum BankStorage<'a> {
    Bits(&'a mut [u8]),
    Registers(&'a mut [u16]),
}

/// A contiguous window `[start, start + count)` of one data model,
/// backed by caller-owned storage. Banks must not overlap and a
/// request must be fully contained in exactly one bank; there is no
/// virtual merging across banks.
pub struct Bank<'a> {
    pub kind: BankKind,
    pub start: u16,
    pub count: u16,
    pub read_only: bool,
    pub storage: BankStorage<'a>,
}

impl<'a> Bank<'a> {
    fn contains(&self, address: u16, quantity: u16) -> bool {
        let end = u32::from(address) + u32::from(quantity);
        u32::from(address) >= u32::from(self.start) && end <= u32::from(self.start) + u32::from(self.count)
    }

    fn bit(&self, address: u16) -> Option<bool> {
        match &self.storage {
            BankStorage::Bits(bytes) => Some(pdu::unpack_bit(bytes, address - self.start)),
            BankStorage::Registers(_) => None,
        }
    }

    fn set_bit(&mut self, address: u16, value: bool) -> bool {
        match &mut self.storage {
            BankStorage::Bits(bytes) => {
                let index = address - self.start;
                let byte = usize::from(index / 8);
                let bit = index % 8;
                if value {
                    bytes[byte] |= 1 << bit;
                } else {
                    bytes[byte] &= !(1 << bit);
                }
                true
            }
            BankStorage::Registers(_) => false,
        }
    }

    fn register(&self, address: u16) -> Option<u16> {
        match &self.storage {
            BankStorage::Registers(regs) => regs.get(usize::from(address - self.start)).copied(),
            BankStorage::Bits(_) => None,
        }
    }

    fn set_register(&mut self, address: u16, value: u16) -> bool {
        match &mut self.storage {
            BankStorage::Registers(regs) => {
                if let Some(slot) = regs.get_mut(usize::from(address - self.start)) {
                    *slot = value;
                    true
                } else {
                    false
                }
            }
            BankStorage::Bits(_) => false,
        }
    }
}

struct PendingRequest {
    unit_id: u8,
    pdu: HVec<u8, MAX_PDU_PAYLOAD_LEN>,
    transaction_id: Option<u16>,
    received_at: Instant,
}

enum ServerFramer {
    #[cfg(feature = "rtu")]
    Rtu(RtuFramer),
    #[cfg(feature = "tcp")]
    Tcp(TcpFramer),
    #[cfg(feature = "ascii")]
    Ascii(AsciiFramer),
}

struct IncomingFrame<'a> {
    unit_id: u8,
    transaction_id: Option<u16>,
    pdu: &'a [u8],
}

impl ServerFramer {
    fn new(framing: Framing, silence_ms: u32) -> Self {
        match framing {
            #[cfg(feature = "rtu")]
            Framing::Rtu => Self::Rtu(RtuFramer::new(Role::Server, silence_ms)),
            #[cfg(feature = "tcp")]
            Framing::Tcp => Self::Tcp(TcpFramer::new()),
            #[cfg(feature = "ascii")]
            Framing::Ascii => Self::Ascii(AsciiFramer::new(Role::Server, silence_ms)),
            #[allow(unreachable_patterns)]
            _ => panic!("framing variant not compiled in"),
        }
    }

    fn poll_recv<T: Transport>(&mut self, transport: &mut T) -> Result<Option<IncomingFrame<'_>>> {
        match self {
            #[cfg(feature = "rtu")]
            Self::Rtu(f) => match f.poll_recv(transport)? {
                crate::frame::FrameEvent::Adu(view) => Ok(Some(IncomingFrame {
                    unit_id: view.unit_id,
                    transaction_id: None,
                    pdu: view.pdu,
                })),
                _ => Ok(None),
            },
            #[cfg(feature = "tcp")]
            Self::Tcp(f) => match f.poll_recv(transport)? {
                crate::frame::tcp::TcpFrameEvent::Adu(view) => Ok(Some(IncomingFrame {
                    unit_id: view.unit_id,
                    transaction_id: Some(view.transaction_id),
                    pdu: view.pdu,
                })),
                _ => Ok(None),
            },
            #[cfg(feature = "ascii")]
            Self::Ascii(f) => match f.poll_recv(transport)? {
                crate::frame::FrameEvent::Adu(view) => Ok(Some(IncomingFrame {
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
}

/// The cooperative server state machine, `spec` §4.6:
/// `Idle -> Processing -> Idle`.
pub struct ServerEngine<'a, const POOL: usize, const QUEUE: usize, const MAX_BANKS: usize> {
    state: EngineState,
    framer: ServerFramer,
    unit_id: u8,
    banks: HVec<Bank<'a>, MAX_BANKS>,
    pool: Slab<PendingRequest, POOL>,
    priority_queue: Deque<usize, QUEUE>,
    fifo_queue: Deque<usize, QUEUE>,
    queue_capacity: usize,
    poison_pending: bool,
    fc_timeout: [u32; FC_TIMEOUT_SLOTS],
    tx_buf: [u8; MAX_FRAME_BUF],
    diagnostics: Diagnostics,
    events: EventSink,
}

impl<'a, const POOL: usize, const QUEUE: usize, const MAX_BANKS: usize>
    ServerEngine<'a, POOL, QUEUE, MAX_BANKS>
{
    #[must_use]
    pub fn init(framing: Framing, unit_id: u8, silence_ms: u32) -> Self {
        let mut engine = Self {
            state: EngineState::Idle,
            framer: ServerFramer::new(framing, silence_ms),
            unit_id,
            banks: HVec::new(),
            pool: Slab::new(),
            priority_queue: Deque::new(),
            fifo_queue: Deque::new(),
            queue_capacity: QUEUE,
            poison_pending: false,
            fc_timeout: [0; FC_TIMEOUT_SLOTS],
            tx_buf: [0; MAX_FRAME_BUF],
            diagnostics: Diagnostics::new(),
            events: EventSink::none(),
        };
        engine.events.emit(Event::EngineInitialised);
        engine
    }

    pub fn mapping_init(&mut self, banks: HVec<Bank<'a>, MAX_BANKS>) {
        self.banks = banks;
    }

    pub fn set_queue_capacity(&mut self, n: usize) {
        self.queue_capacity = n.min(QUEUE);
    }

    pub fn set_fc_timeout(&mut self, function_code: u8, ms: u32) {
        if let Some(slot) = self.fc_timeout.get_mut(usize::from(function_code & 0x7F)) {
            *slot = ms;
        }
    }

    pub fn set_event_callback(&mut self, callback: fn(Event, *mut ()), ctx: *mut ()) {
        self.events.set(callback, ctx);
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

    pub fn submit_poison(&mut self) {
        self.poison_pending = true;
    }

    fn find_bank_mut(&mut self, kind: BankKind, address: u16, quantity: u16) -> Option<&mut Bank<'a>> {
        self.banks
            .iter_mut()
            .find(|b| b.kind == kind && b.contains(address, quantity))
    }

    fn find_bank(&self, kind: BankKind, address: u16, quantity: u16) -> Option<&Bank<'a>> {
        self.banks
            .iter()
            .find(|b| b.kind == kind && b.contains(address, quantity))
    }

    /// Feeds an already-reassembled ADU directly into the engine,
    /// bypassing the framer (e.g. for injected fault tests).
    pub fn inject_adu(&mut self, unit_id: u8, pdu: &[u8]) -> Result<()> {
        self.accept(unit_id, None, pdu, 0)
    }

    fn accept(&mut self, unit_id: u8, transaction_id: Option<u16>, pdu: &[u8], now: Instant) -> Result<()> {
        if unit_id != 0 && unit_id != self.unit_id {
            self.diagnostics.record_dropped();
            return Ok(());
        }
        let Some(&function_code) = pdu.first() else {
            self.diagnostics.record_dropped();
            return Ok(());
        };
        let mut request_pdu = HVec::new();
        if request_pdu.extend_from_slice(pdu).is_err() {
            self.diagnostics.record_dropped();
            return Ok(());
        }
        let req = PendingRequest {
            unit_id,
            pdu: request_pdu,
            transaction_id,
            received_at: now,
        };
        let handle = match self.pool.acquire(req) {
            Some(h) => h,
            None => {
                self.diagnostics.record_dropped();
                return Ok(());
            }
        };
        let queue = if is_high_priority(function_code) {
            &mut self.priority_queue
        } else {
            &mut self.fifo_queue
        };
        if queue.push_back(handle).is_err() {
            self.pool.release(handle);
            self.diagnostics.record_dropped();
            return Ok(());
        }
        self.events.emit(Event::ServerRequestAccept);
        Ok(())
    }

    /// Drives the state machine forward by one logical step.
    pub fn poll<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        self.events.emit(Event::StepBegin);
        let result = self.poll_inner(transport);
        self.events.emit(Event::StepEnd);
        result
    }

    pub fn poll_with_budget<T: Transport>(&mut self, transport: &mut T, budget: usize) -> Result<()> {
        for _ in 0..budget {
            self.poll(transport)?;
        }
        Ok(())
    }

    fn poll_inner<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        if self.poison_pending {
            self.poison_pending = false;
            self.diagnostics.record_poison_trigger();
            while let Some(h) = self.priority_queue.pop_front() {
                self.pool.release(h);
            }
            while let Some(h) = self.fifo_queue.pop_front() {
                self.pool.release(h);
            }
            return Ok(());
        }

        match self.state {
            EngineState::Idle => self.step_idle(transport),
            EngineState::Processing => self.step_processing(transport),
            _ => Ok(()),
        }
    }

    fn enter_state(&mut self, state: EngineState) {
        self.events.emit(Event::ServerStateExit(self.state));
        self.state = state;
        self.events.emit(Event::ServerStateEnter(state));
    }

    fn step_idle<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        let now = transport.now();
        let accepted = match self.framer.poll_recv(transport)? {
            Some(frame) => {
                self.diagnostics.record_rx_bytes(frame.pdu.len());
                self.events.emit(Event::RxReady);
                let unit_id = frame.unit_id;
                let transaction_id = frame.transaction_id;
                let mut owned = HVec::<u8, MAX_PDU_PAYLOAD_LEN>::new();
                let ok = owned.extend_from_slice(frame.pdu).is_ok();
                self.framer.consume();
                if ok {
                    Some((unit_id, transaction_id, owned))
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some((unit_id, transaction_id, owned)) = accepted {
            self.accept(unit_id, transaction_id, &owned, now)?;
        }
        if self.priority_queue.front().is_some() || self.fifo_queue.front().is_some() {
            self.enter_state(EngineState::Processing);
        }
        Ok(())
    }

    fn step_processing<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        let Some(handle) = self.priority_queue.pop_front().or_else(|| self.fifo_queue.pop_front()) else {
            self.enter_state(EngineState::Idle);
            return Ok(());
        };
        let Some(req) = self.pool.release(handle) else {
            self.enter_state(EngineState::Idle);
            return Ok(());
        };

        let function_code = req.pdu[0];
        let fc_timeout = self.fc_timeout[usize::from(function_code & 0x7F)];
        let broadcast = req.unit_id == 0;
        if fc_timeout != 0 && has_elapsed(transport.now(), req.received_at.wrapping_add(fc_timeout)) {
            self.diagnostics.record_dropped();
            self.diagnostics.record_error(Error::Timeout);
            if !broadcast {
                let mut resp_pdu = [0u8; MAX_PDU_PAYLOAD_LEN];
                let resp_len =
                    pdu::build_exception(&mut resp_pdu, function_code, EXC_ILLEGAL_FUNCTION)
                        .unwrap_or(0);
                let frame_len = self.framer.encode(
                    &mut self.tx_buf,
                    self.unit_id,
                    req.transaction_id.unwrap_or(0),
                    &resp_pdu[..resp_len],
                )?;
                match self.framer.send(transport, &self.tx_buf[..frame_len]) {
                    Ok(()) => {
                        self.diagnostics.record_tx_bytes(frame_len);
                        self.events.emit(Event::TxSent);
                    }
                    Err(err) => {
                        self.diagnostics.record_error(err);
                    }
                }
            }
            self.enter_state(EngineState::Idle);
            return Ok(());
        }

        let mut resp_pdu = [0u8; MAX_PDU_PAYLOAD_LEN];
        let resp_len = self.dispatch(&req.pdu, &mut resp_pdu);

        if !broadcast {
            let frame_len = self.framer.encode(
                &mut self.tx_buf,
                self.unit_id,
                req.transaction_id.unwrap_or(0),
                &resp_pdu[..resp_len],
            )?;
            match self.framer.send(transport, &self.tx_buf[..frame_len]) {
                Ok(()) => {
                    self.diagnostics.record_tx_bytes(frame_len);
                    self.events.emit(Event::TxSent);
                    self.diagnostics.record_success(function_code);
                }
                Err(err) => {
                    self.diagnostics.record_error(err);
                }
            }
        } else {
            self.diagnostics.record_broadcast();
        }
        self.events.emit(Event::ServerRequestComplete);
        self.enter_state(EngineState::Idle);
        Ok(())
    }

    /// Decodes and dispatches one request PDU, writing the response PDU
    /// (success or exception) into `out` and returning its length.
    fn dispatch(&mut self, req: &[u8], out: &mut [u8]) -> usize {
        match self.dispatch_inner(req, out) {
            Ok(n) => n,
            Err(Error::Exception(code)) => pdu::build_exception(out, req[0], code).unwrap_or(0),
            Err(_) => pdu::build_exception(out, req[0], EXC_SERVER_DEVICE_FAILURE).unwrap_or(0),
        }
    }

    fn dispatch_inner(&mut self, req: &[u8], out: &mut [u8]) -> Result<usize> {
        let function_code = *req.first().ok_or(Error::DecodingError)?;
        match function_code {
            fc::READ_COILS => self.dispatch_read_bits(req, out, BankKind::Coils, true),
            fc::READ_DISCRETE_INPUTS => self.dispatch_read_bits(req, out, BankKind::DiscreteInputs, false),
            fc::READ_HOLDING_REGISTERS => self.dispatch_read_registers(req, out, BankKind::HoldingRegisters, true),
            fc::READ_INPUT_REGISTERS => self.dispatch_read_registers(req, out, BankKind::InputRegisters, false),
            fc::WRITE_SINGLE_COIL => self.dispatch_write_single_coil(req, out),
            fc::WRITE_SINGLE_REGISTER => self.dispatch_write_single_register(req, out),
            fc::WRITE_MULTIPLE_COILS => self.dispatch_write_multiple_coils(req, out),
            fc::WRITE_MULTIPLE_REGISTERS => self.dispatch_write_multiple_registers(req, out),
            fc::MASK_WRITE_REGISTER => self.dispatch_mask_write_register(req, out),
            fc::READ_WRITE_MULTIPLE_REGISTERS => self.dispatch_read_write_multiple_registers(req, out),
            fc::READ_EXCEPTION_STATUS => {
                let n = pdu::build_read_exception_status_response(out, 0)?;
                Ok(n)
            }
            fc::REPORT_SERVER_ID => {
                let n = pdu::build_report_server_id_response(out, &[self.unit_id], 0xFF)?;
                Ok(n)
            }
            _ => Err(Error::Exception(EXC_ILLEGAL_FUNCTION)),
        }
    }

    fn dispatch_read_bits(
        &mut self,
        req: &[u8],
        out: &mut [u8],
        kind: BankKind,
        writable_kind: bool,
    ) -> Result<usize> {
        let request = if writable_kind {
            pdu::parse_read_coils_request(req)?
        } else {
            pdu::parse_read_discrete_inputs_request(req)?
        };
        let bank = self
            .find_bank(kind, request.address, request.quantity)
            .ok_or(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS))?;
        let mut bits = [false; pdu::MAX_READ_COILS_QTY as usize];
        for i in 0..request.quantity {
            bits[usize::from(i)] = bank.bit(request.address + i).unwrap_or(false);
        }
        if writable_kind {
            pdu::build_read_coils_response(out, &bits[..usize::from(request.quantity)])
        } else {
            pdu::build_read_discrete_inputs_response(out, &bits[..usize::from(request.quantity)])
        }
    }

    fn dispatch_read_registers(
        &mut self,
        req: &[u8],
        out: &mut [u8],
        kind: BankKind,
        holding: bool,
    ) -> Result<usize> {
        let request = if holding {
            pdu::parse_read_holding_registers_request(req)?
        } else {
            pdu::parse_read_input_registers_request(req)?
        };
        let bank = self
            .find_bank(kind, request.address, request.quantity)
            .ok_or(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS))?;
        let mut regs = [0u16; pdu::MAX_READ_REGISTERS_QTY as usize];
        for i in 0..request.quantity {
            regs[usize::from(i)] = bank.register(request.address + i).unwrap_or(0);
        }
        let view = &regs[..usize::from(request.quantity)];
        if holding {
            pdu::build_read_holding_registers_response(out, view)
        } else {
            pdu::build_read_input_registers_response(out, view)
        }
    }

    fn dispatch_write_single_coil(&mut self, req: &[u8], out: &mut [u8]) -> Result<usize> {
        let w = pdu::parse_write_single_coil_request(req)?;
        let bank = self
            .find_bank_mut(BankKind::Coils, w.address, 1)
            .ok_or(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS))?;
        if bank.read_only {
            return Err(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS));
        }
        bank.set_bit(w.address, w.value);
        pdu::build_write_single_coil_response(out, w)
    }

    fn dispatch_write_single_register(&mut self, req: &[u8], out: &mut [u8]) -> Result<usize> {
        let w = pdu::parse_write_single_register_request(req)?;
        let bank = self
            .find_bank_mut(BankKind::HoldingRegisters, w.address, 1)
            .ok_or(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS))?;
        if bank.read_only {
            return Err(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS));
        }
        bank.set_register(w.address, w.value);
        pdu::build_write_single_register_response(out, w)
    }

    fn dispatch_write_multiple_coils(&mut self, req: &[u8], out: &mut [u8]) -> Result<usize> {
        let w = pdu::parse_write_multiple_coils_request(req)?;
        let bank = self
            .find_bank_mut(BankKind::Coils, w.address, w.quantity)
            .ok_or(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS))?;
        if bank.read_only {
            return Err(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS));
        }
        for i in 0..w.quantity {
            bank.set_bit(w.address + i, w.get(i));
        }
        pdu::build_write_multiple_coils_response(
            out,
            pdu::WriteMultipleAck {
                address: w.address,
                quantity: w.quantity,
            },
        )
    }

    fn dispatch_write_multiple_registers(&mut self, req: &[u8], out: &mut [u8]) -> Result<usize> {
        let w = pdu::parse_write_multiple_registers_request(req)?;
        let bank = self
            .find_bank_mut(BankKind::HoldingRegisters, w.address, w.quantity())
            .ok_or(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS))?;
        if bank.read_only {
            return Err(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS));
        }
        for i in 0..w.quantity() {
            bank.set_register(w.address + i, w.get(i));
        }
        pdu::build_write_multiple_registers_response(
            out,
            pdu::WriteMultipleAck {
                address: w.address,
                quantity: w.quantity(),
            },
        )
    }

    fn dispatch_mask_write_register(&mut self, req: &[u8], out: &mut [u8]) -> Result<usize> {
        let m = pdu::parse_mask_write_register_request(req)?;
        let bank = self
            .find_bank_mut(BankKind::HoldingRegisters, m.address, 1)
            .ok_or(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS))?;
        if bank.read_only {
            return Err(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS));
        }
        let current = bank.register(m.address).unwrap_or(0);
        let updated = pdu::apply_mask_write(current, m.and_mask, m.or_mask);
        bank.set_register(m.address, updated);
        pdu::build_mask_write_register_response(out, m)
    }

    fn dispatch_read_write_multiple_registers(&mut self, req: &[u8], out: &mut [u8]) -> Result<usize> {
        let rw = pdu::parse_read_write_multiple_registers_request(req)?;
        {
            let write_bank = self
                .find_bank_mut(BankKind::HoldingRegisters, rw.write_address, rw.write_quantity())
                .ok_or(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS))?;
            if write_bank.read_only {
                return Err(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS));
            }
            for i in 0..rw.write_quantity() {
                write_bank.set_register(rw.write_address + i, rw.write_value(i));
            }
        }
        let read_bank = self
            .find_bank(BankKind::HoldingRegisters, rw.read_address, rw.read_quantity)
            .ok_or(Error::Exception(EXC_ILLEGAL_DATA_ADDRESS))?;
        let mut regs = [0u16; pdu::MAX_READ_REGISTERS_QTY as usize];
        for i in 0..rw.read_quantity {
            regs[usize::from(i)] = read_bank.register(rw.read_address + i).unwrap_or(0);
        }
        pdu::build_read_write_multiple_registers_response(out, &regs[..usize::from(rw.read_quantity)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::Vec as HV;

    struct MockTransport {
        rx: HV<u8, 512>,
        tx: HV<u8, 512>,
        now: Instant,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                rx: HV::new(),
                tx: HV::new(),
                now: 0,
            }
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, buf: &[u8]) -> Result<usize> {
            self.tx.extend_from_slice(buf).unwrap();
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
    fn read_holding_registers_success() {
        let mut storage = [0x1234u16, 0x5678, 0x9ABC];
        let mut engine: ServerEngine<4, 4, 2> = ServerEngine::init(Framing::Tcp, 1, 0);
        let mut banks = HVec::new();
        banks
            .push(Bank {
                kind: BankKind::HoldingRegisters,
                start: 0,
                count: 3,
                read_only: false,
                storage: BankStorage::Registers(&mut storage),
            })
            .map_err(|_| ())
            .unwrap();
        engine.mapping_init(banks);

        let mut t = MockTransport::new();
        let mut req_buf = [0u8; 16];
        let n = pdu::build_read_holding_registers_request(
            &mut req_buf,
            pdu::ReadRequest { address: 0, quantity: 2 },
        )
        .unwrap();
        let mut frame_buf = [0u8; 32];
        let fl = TcpFramer::encode(&mut frame_buf, 7, 1, &req_buf[..n]).unwrap();
        t.rx.extend_from_slice(&frame_buf[..fl]).unwrap();

        engine.poll(&mut t).unwrap();
        engine.poll(&mut t).unwrap();

        assert_eq!(engine.get_diag().completed(), 1);
        assert!(!t.tx.is_empty());
    }

    #[test]
    fn write_to_read_only_bank_is_rejected() {
        let mut storage = [0u16; 1];
        let mut engine: ServerEngine<4, 4, 2> = ServerEngine::init(Framing::Tcp, 1, 0);
        let mut banks = HVec::new();
        banks
            .push(Bank {
                kind: BankKind::HoldingRegisters,
                start: 0,
                count: 1,
                read_only: true,
                storage: BankStorage::Registers(&mut storage),
            })
            .map_err(|_| ())
            .unwrap();
        engine.mapping_init(banks);

        let mut out = [0u8; 16];
        let mut req_buf = [0u8; 16];
        let n = pdu::build_write_single_register_request(
            &mut req_buf,
            pdu::WriteSingleRegister {
                address: 0,
                value: 42,
            },
        )
        .unwrap();
        let written = engine.dispatch(&req_buf[..n], &mut out);
        let exc = pdu::parse_exception(&out[..written]).unwrap();
        assert_eq!(exc.code, EXC_ILLEGAL_DATA_ADDRESS);
    }

    #[test]
    fn broadcast_applies_side_effect_without_response() {
        let mut storage = [0u16; 1];
        let mut engine: ServerEngine<4, 4, 2> = ServerEngine::init(Framing::Rtu, 1, 0);
        let mut banks = HVec::new();
        banks
            .push(Bank {
                kind: BankKind::HoldingRegisters,
                start: 0,
                count: 1,
                read_only: false,
                storage: BankStorage::Registers(&mut storage),
            })
            .map_err(|_| ())
            .unwrap();
        engine.mapping_init(banks);

        let mut t = MockTransport::new();
        let mut req_buf = [0u8; 16];
        let n = pdu::build_write_single_register_request(
            &mut req_buf,
            pdu::WriteSingleRegister {
                address: 0,
                value: 99,
            },
        )
        .unwrap();
        let mut frame_buf = [0u8; 32];
        let fl = RtuFramer::encode(&mut frame_buf, 0, &req_buf[..n]).unwrap();
        t.now = 10;
        t.rx.extend_from_slice(&frame_buf[..fl]).unwrap();

        engine.poll(&mut t).unwrap();
        t.now = 20;
        engine.poll(&mut t).unwrap();
        engine.poll(&mut t).unwrap();

        assert!(t.tx.is_empty());
    }
}
