// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-function-code PDU builders and parsers.
//!
//! A PDU is `[function_code | payload]`, independent of framing. Every
//! builder writes into a caller-owned buffer and returns the number of
//! bytes written; every parser borrows into the caller-owned input and
//! returns a view plus decoded counts. Nothing here allocates.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

pub mod fc {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const READ_EXCEPTION_STATUS: u8 = 0x07;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
    pub const REPORT_SERVER_ID: u8 = 0x11;
    pub const MASK_WRITE_REGISTER: u8 = 0x16;
    pub const READ_WRITE_MULTIPLE_REGISTERS: u8 = 0x17;

    pub const EXCEPTION_BIT: u8 = 0x80;

    /// True for the write FCs the server engine promotes ahead of reads.
    #[must_use]
    pub const fn is_write(fc: u8) -> bool {
        matches!(
            fc,
            WRITE_SINGLE_COIL
                | WRITE_SINGLE_REGISTER
                | WRITE_MULTIPLE_COILS
                | WRITE_MULTIPLE_REGISTERS
                | MASK_WRITE_REGISTER
        )
    }
}

pub const MAX_READ_COILS_QTY: u16 = 2000;
pub const MAX_READ_REGISTERS_QTY: u16 = 125;
pub const MAX_WRITE_COILS_QTY: u16 = 1968;
pub const MAX_WRITE_REGISTERS_QTY: u16 = 123;
/// Largest payload a PDU may carry so that a full RTU ADU (unit + fc +
/// payload + 2 CRC bytes) still fits the 256-byte frame budget.
pub const MAX_PDU_PAYLOAD_LEN: usize = 253;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

#[must_use]
pub const fn packed_len(bit_count: u16) -> usize {
    (bit_count as usize + 7) / 8
}

/// Packs `bits` LSB-first into `out`, zeroing unused trailing bits.
/// Returns the number of bytes written.
pub fn pack_bits(bits: &[bool], out: &mut [u8]) -> Result<usize> {
    let len = packed_len(bits.len() as u16);
    let dst = out.get_mut(..len).ok_or(Error::InvalidArgument)?;
    dst.fill(0);
    for (i, &b) in bits.iter().enumerate() {
        if b {
            dst[i / 8] |= 1 << (i % 8);
        }
    }
    Ok(len)
}

/// Reads the `index`-th LSB-first packed bit out of `packed`.
#[must_use]
pub fn unpack_bit(packed: &[u8], index: u16) -> bool {
    let byte = packed[(index / 8) as usize];
    (byte >> (index % 8)) & 0x01 != 0
}

fn coil_value_to_bool(v: u16) -> Result<bool> {
    match v {
        COIL_ON => Ok(true),
        COIL_OFF => Ok(false),
        _ => Err(Error::InvalidArgument),
    }
}

fn bool_to_coil_value(v: bool) -> u16 {
    if v {
        COIL_ON
    } else {
        COIL_OFF
    }
}

fn take_fc(pdu: &[u8], expected: u8) -> Result<&[u8]> {
    match pdu.split_first() {
        Some((&f, rest)) if f == expected => Ok(rest),
        _ => Err(Error::InvalidArgument),
    }
}

fn write_header(buf: &mut [u8], fc: u8) -> Result<&mut [u8]> {
    let first = buf.first_mut().ok_or(Error::InvalidArgument)?;
    *first = fc;
    Ok(&mut buf[1..])
}

// ---------------------------------------------------------------------
// FC01/02/04, FC03: read requests share one shape: address + quantity.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: u16,
    pub quantity: u16,
}

fn build_read_request(buf: &mut [u8], fc: u8, req: ReadRequest, max_qty: u16) -> Result<usize> {
    if req.quantity == 0 || req.quantity > max_qty {
        return Err(Error::InvalidArgument);
    }
    let body = write_header(buf, fc)?;
    if body.len() < 4 {
        return Err(Error::InvalidArgument);
    }
    BigEndian::write_u16(&mut body[0..2], req.address);
    BigEndian::write_u16(&mut body[2..4], req.quantity);
    Ok(5)
}

fn parse_read_request(pdu: &[u8], fc: u8, max_qty: u16) -> Result<ReadRequest> {
    let body = take_fc(pdu, fc)?;
    if body.len() != 4 {
        return Err(Error::InvalidArgument);
    }
    let address = BigEndian::read_u16(&body[0..2]);
    let quantity = BigEndian::read_u16(&body[2..4]);
    if quantity == 0 || quantity > max_qty {
        return Err(Error::InvalidArgument);
    }
    Ok(ReadRequest { address, quantity })
}

pub fn build_read_coils_request(buf: &mut [u8], req: ReadRequest) -> Result<usize> {
    build_read_request(buf, fc::READ_COILS, req, MAX_READ_COILS_QTY)
}
pub fn parse_read_coils_request(pdu: &[u8]) -> Result<ReadRequest> {
    parse_read_request(pdu, fc::READ_COILS, MAX_READ_COILS_QTY)
}
pub fn build_read_discrete_inputs_request(buf: &mut [u8], req: ReadRequest) -> Result<usize> {
    build_read_request(buf, fc::READ_DISCRETE_INPUTS, req, MAX_READ_COILS_QTY)
}
pub fn parse_read_discrete_inputs_request(pdu: &[u8]) -> Result<ReadRequest> {
    parse_read_request(pdu, fc::READ_DISCRETE_INPUTS, MAX_READ_COILS_QTY)
}
pub fn build_read_holding_registers_request(buf: &mut [u8], req: ReadRequest) -> Result<usize> {
    build_read_request(buf, fc::READ_HOLDING_REGISTERS, req, MAX_READ_REGISTERS_QTY)
}
pub fn parse_read_holding_registers_request(pdu: &[u8]) -> Result<ReadRequest> {
    parse_read_request(pdu, fc::READ_HOLDING_REGISTERS, MAX_READ_REGISTERS_QTY)
}
pub fn build_read_input_registers_request(buf: &mut [u8], req: ReadRequest) -> Result<usize> {
    build_read_request(buf, fc::READ_INPUT_REGISTERS, req, MAX_READ_REGISTERS_QTY)
}
pub fn parse_read_input_registers_request(pdu: &[u8]) -> Result<ReadRequest> {
    parse_read_request(pdu, fc::READ_INPUT_REGISTERS, MAX_READ_REGISTERS_QTY)
}

// ---------------------------------------------------------------------
// FC01/02/04/03 responses: coil bit-views / register views.
// ---------------------------------------------------------------------

/// Borrowed view over a packed-bit response payload (FC01/FC02).
#[derive(Debug, Clone, Copy)]
pub struct CoilsView<'a> {
    packed: &'a [u8],
    quantity: u16,
}

impl<'a> CoilsView<'a> {
    #[must_use]
    pub fn quantity(&self) -> u16 {
        self.quantity
    }

    #[must_use]
    pub fn get(&self, index: u16) -> bool {
        unpack_bit(self.packed, index)
    }

    #[must_use]
    pub fn packed_bytes(&self) -> &'a [u8] {
        self.packed
    }
}

fn build_coils_response(buf: &mut [u8], fc: u8, coils: &[bool]) -> Result<usize> {
    if coils.is_empty() || coils.len() > MAX_READ_COILS_QTY as usize {
        return Err(Error::InvalidArgument);
    }
    let body = write_header(buf, fc)?;
    let len = packed_len(coils.len() as u16);
    if body.len() < 1 + len || len > u8::MAX as usize {
        return Err(Error::InvalidArgument);
    }
    body[0] = len as u8;
    pack_bits(coils, &mut body[1..1 + len])?;
    Ok(2 + len)
}

fn parse_coils_response(pdu: &[u8], fc: u8, expected_quantity: u16) -> Result<CoilsView<'_>> {
    let body = take_fc(pdu, fc)?;
    let byte_count = *body.first().ok_or(Error::InvalidArgument)? as usize;
    let packed = body.get(1..).ok_or(Error::InvalidArgument)?;
    if packed.len() != byte_count || byte_count != packed_len(expected_quantity) {
        return Err(Error::InvalidArgument);
    }
    Ok(CoilsView {
        packed,
        quantity: expected_quantity,
    })
}

pub fn build_read_coils_response(buf: &mut [u8], coils: &[bool]) -> Result<usize> {
    build_coils_response(buf, fc::READ_COILS, coils)
}
pub fn parse_read_coils_response(pdu: &[u8], expected_quantity: u16) -> Result<CoilsView<'_>> {
    parse_coils_response(pdu, fc::READ_COILS, expected_quantity)
}
pub fn build_read_discrete_inputs_response(buf: &mut [u8], coils: &[bool]) -> Result<usize> {
    build_coils_response(buf, fc::READ_DISCRETE_INPUTS, coils)
}
pub fn parse_read_discrete_inputs_response(
    pdu: &[u8],
    expected_quantity: u16,
) -> Result<CoilsView<'_>> {
    parse_coils_response(pdu, fc::READ_DISCRETE_INPUTS, expected_quantity)
}

/// Borrowed view over a big-endian register response payload
/// (FC03/FC04/FC17).
#[derive(Debug, Clone, Copy)]
pub struct RegistersView<'a> {
    bytes: &'a [u8],
}

impl<'a> RegistersView<'a> {
    #[must_use]
    pub fn quantity(&self) -> u16 {
        (self.bytes.len() / 2) as u16
    }

    #[must_use]
    pub fn get(&self, index: u16) -> u16 {
        let i = index as usize * 2;
        BigEndian::read_u16(&self.bytes[i..i + 2])
    }

    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

fn build_registers_response(buf: &mut [u8], fc: u8, registers: &[u16]) -> Result<usize> {
    if registers.is_empty() || registers.len() > MAX_READ_REGISTERS_QTY as usize {
        return Err(Error::InvalidArgument);
    }
    let body = write_header(buf, fc)?;
    let len = registers.len() * 2;
    if body.len() < 1 + len || len > u8::MAX as usize {
        return Err(Error::InvalidArgument);
    }
    body[0] = len as u8;
    for (i, &r) in registers.iter().enumerate() {
        BigEndian::write_u16(&mut body[1 + i * 2..3 + i * 2], r);
    }
    Ok(2 + len)
}

fn parse_registers_response(pdu: &[u8], fc: u8) -> Result<RegistersView<'_>> {
    let body = take_fc(pdu, fc)?;
    let byte_count = *body.first().ok_or(Error::InvalidArgument)? as usize;
    let bytes = body.get(1..).ok_or(Error::InvalidArgument)?;
    if bytes.len() != byte_count || byte_count == 0 || byte_count % 2 != 0 {
        return Err(Error::InvalidArgument);
    }
    Ok(RegistersView { bytes })
}

pub fn build_read_holding_registers_response(buf: &mut [u8], registers: &[u16]) -> Result<usize> {
    build_registers_response(buf, fc::READ_HOLDING_REGISTERS, registers)
}
pub fn parse_read_holding_registers_response(pdu: &[u8]) -> Result<RegistersView<'_>> {
    parse_registers_response(pdu, fc::READ_HOLDING_REGISTERS)
}
pub fn build_read_input_registers_response(buf: &mut [u8], registers: &[u16]) -> Result<usize> {
    build_registers_response(buf, fc::READ_INPUT_REGISTERS, registers)
}
pub fn parse_read_input_registers_response(pdu: &[u8]) -> Result<RegistersView<'_>> {
    parse_registers_response(pdu, fc::READ_INPUT_REGISTERS)
}

// ---------------------------------------------------------------------
// FC05 Write Single Coil
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSingleCoil {
    pub address: u16,
    pub value: bool,
}

pub fn build_write_single_coil_request(buf: &mut [u8], req: WriteSingleCoil) -> Result<usize> {
    let body = write_header(buf, fc::WRITE_SINGLE_COIL)?;
    if body.len() < 4 {
        return Err(Error::InvalidArgument);
    }
    BigEndian::write_u16(&mut body[0..2], req.address);
    BigEndian::write_u16(&mut body[2..4], bool_to_coil_value(req.value));
    Ok(5)
}

pub fn parse_write_single_coil_request(pdu: &[u8]) -> Result<WriteSingleCoil> {
    let body = take_fc(pdu, fc::WRITE_SINGLE_COIL)?;
    if body.len() != 4 {
        return Err(Error::InvalidArgument);
    }
    let address = BigEndian::read_u16(&body[0..2]);
    let value = coil_value_to_bool(BigEndian::read_u16(&body[2..4]))?;
    Ok(WriteSingleCoil { address, value })
}

/// The response to FC05 is a byte-exact echo of the request.
pub fn build_write_single_coil_response(buf: &mut [u8], rsp: WriteSingleCoil) -> Result<usize> {
    build_write_single_coil_request(buf, rsp)
}
pub fn parse_write_single_coil_response(pdu: &[u8]) -> Result<WriteSingleCoil> {
    parse_write_single_coil_request(pdu)
}

// ---------------------------------------------------------------------
// FC06 Write Single Register
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSingleRegister {
    pub address: u16,
    pub value: u16,
}

pub fn build_write_single_register_request(
    buf: &mut [u8],
    req: WriteSingleRegister,
) -> Result<usize> {
    let body = write_header(buf, fc::WRITE_SINGLE_REGISTER)?;
    if body.len() < 4 {
        return Err(Error::InvalidArgument);
    }
    BigEndian::write_u16(&mut body[0..2], req.address);
    BigEndian::write_u16(&mut body[2..4], req.value);
    Ok(5)
}

pub fn parse_write_single_register_request(pdu: &[u8]) -> Result<WriteSingleRegister> {
    let body = take_fc(pdu, fc::WRITE_SINGLE_REGISTER)?;
    if body.len() != 4 {
        return Err(Error::InvalidArgument);
    }
    Ok(WriteSingleRegister {
        address: BigEndian::read_u16(&body[0..2]),
        value: BigEndian::read_u16(&body[2..4]),
    })
}

pub fn build_write_single_register_response(
    buf: &mut [u8],
    rsp: WriteSingleRegister,
) -> Result<usize> {
    build_write_single_register_request(buf, rsp)
}
pub fn parse_write_single_register_response(pdu: &[u8]) -> Result<WriteSingleRegister> {
    parse_write_single_register_request(pdu)
}

// ---------------------------------------------------------------------
// FC07 Read Exception Status
// ---------------------------------------------------------------------

pub fn build_read_exception_status_request(buf: &mut [u8]) -> Result<usize> {
    write_header(buf, fc::READ_EXCEPTION_STATUS)?;
    Ok(1)
}
pub fn parse_read_exception_status_request(pdu: &[u8]) -> Result<()> {
    let body = take_fc(pdu, fc::READ_EXCEPTION_STATUS)?;
    if !body.is_empty() {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}
pub fn build_read_exception_status_response(buf: &mut [u8], status: u8) -> Result<usize> {
    let body = write_header(buf, fc::READ_EXCEPTION_STATUS)?;
    if body.is_empty() {
        return Err(Error::InvalidArgument);
    }
    body[0] = status;
    Ok(2)
}
pub fn parse_read_exception_status_response(pdu: &[u8]) -> Result<u8> {
    let body = take_fc(pdu, fc::READ_EXCEPTION_STATUS)?;
    match body {
        [status] => Ok(*status),
        _ => Err(Error::InvalidArgument),
    }
}

// ---------------------------------------------------------------------
// FC0F Write Multiple Coils
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct WriteMultipleCoilsRequest<'a> {
    pub address: u16,
    pub quantity: u16,
    pub packed: &'a [u8],
}

impl<'a> WriteMultipleCoilsRequest<'a> {
    #[must_use]
    pub fn get(&self, index: u16) -> bool {
        unpack_bit(self.packed, index)
    }
}

pub fn build_write_multiple_coils_request(
    buf: &mut [u8],
    address: u16,
    coils: &[bool],
) -> Result<usize> {
    let quantity = coils.len() as u16;
    if coils.is_empty() || coils.len() > MAX_WRITE_COILS_QTY as usize {
        return Err(Error::InvalidArgument);
    }
    let body = write_header(buf, fc::WRITE_MULTIPLE_COILS)?;
    let len = packed_len(quantity);
    if body.len() < 5 + len || len > u8::MAX as usize {
        return Err(Error::InvalidArgument);
    }
    BigEndian::write_u16(&mut body[0..2], address);
    BigEndian::write_u16(&mut body[2..4], quantity);
    body[4] = len as u8;
    pack_bits(coils, &mut body[5..5 + len])?;
    Ok(6 + len)
}

pub fn parse_write_multiple_coils_request(pdu: &[u8]) -> Result<WriteMultipleCoilsRequest<'_>> {
    let body = take_fc(pdu, fc::WRITE_MULTIPLE_COILS)?;
    if body.len() < 5 {
        return Err(Error::InvalidArgument);
    }
    let address = BigEndian::read_u16(&body[0..2]);
    let quantity = BigEndian::read_u16(&body[2..4]);
    let byte_count = body[4] as usize;
    let packed = &body[5..];
    if quantity == 0
        || quantity > MAX_WRITE_COILS_QTY
        || byte_count != packed_len(quantity)
        || packed.len() != byte_count
    {
        return Err(Error::InvalidArgument);
    }
    Ok(WriteMultipleCoilsRequest {
        address,
        quantity,
        packed,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMultipleAck {
    pub address: u16,
    pub quantity: u16,
}

fn build_write_multiple_ack(buf: &mut [u8], fc: u8, ack: WriteMultipleAck) -> Result<usize> {
    let body = write_header(buf, fc)?;
    if body.len() < 4 {
        return Err(Error::InvalidArgument);
    }
    BigEndian::write_u16(&mut body[0..2], ack.address);
    BigEndian::write_u16(&mut body[2..4], ack.quantity);
    Ok(5)
}

fn parse_write_multiple_ack(pdu: &[u8], fc: u8) -> Result<WriteMultipleAck> {
    let body = take_fc(pdu, fc)?;
    if body.len() != 4 {
        return Err(Error::InvalidArgument);
    }
    Ok(WriteMultipleAck {
        address: BigEndian::read_u16(&body[0..2]),
        quantity: BigEndian::read_u16(&body[2..4]),
    })
}

pub fn build_write_multiple_coils_response(
    buf: &mut [u8],
    ack: WriteMultipleAck,
) -> Result<usize> {
    build_write_multiple_ack(buf, fc::WRITE_MULTIPLE_COILS, ack)
}
pub fn parse_write_multiple_coils_response(pdu: &[u8]) -> Result<WriteMultipleAck> {
    parse_write_multiple_ack(pdu, fc::WRITE_MULTIPLE_COILS)
}

// ---------------------------------------------------------------------
// FC10 Write Multiple Registers
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteMultipleRegistersRequest<'a> {
    pub address: u16,
    quantity: u16,
    values: &'a [u8],
}

impl<'a> WriteMultipleRegistersRequest<'a> {
    #[must_use]
    pub fn quantity(&self) -> u16 {
        self.quantity
    }

    #[must_use]
    pub fn get(&self, index: u16) -> u16 {
        let i = index as usize * 2;
        BigEndian::read_u16(&self.values[i..i + 2])
    }
}

pub fn build_write_multiple_registers_request(
    buf: &mut [u8],
    address: u16,
    registers: &[u16],
) -> Result<usize> {
    let quantity = registers.len() as u16;
    if registers.is_empty() || registers.len() > MAX_WRITE_REGISTERS_QTY as usize {
        return Err(Error::InvalidArgument);
    }
    let body = write_header(buf, fc::WRITE_MULTIPLE_REGISTERS)?;
    let len = registers.len() * 2;
    if body.len() < 5 + len || len > u8::MAX as usize {
        return Err(Error::InvalidArgument);
    }
    BigEndian::write_u16(&mut body[0..2], address);
    BigEndian::write_u16(&mut body[2..4], quantity);
    body[4] = len as u8;
    for (i, &r) in registers.iter().enumerate() {
        BigEndian::write_u16(&mut body[5 + i * 2..7 + i * 2], r);
    }
    Ok(6 + len)
}

pub fn parse_write_multiple_registers_request(
    pdu: &[u8],
) -> Result<WriteMultipleRegistersRequest<'_>> {
    let body = take_fc(pdu, fc::WRITE_MULTIPLE_REGISTERS)?;
    if body.len() < 5 {
        return Err(Error::InvalidArgument);
    }
    let address = BigEndian::read_u16(&body[0..2]);
    let quantity = BigEndian::read_u16(&body[2..4]);
    let byte_count = body[4] as usize;
    let values = &body[5..];
    if quantity == 0
        || quantity > MAX_WRITE_REGISTERS_QTY
        || byte_count != quantity as usize * 2
        || values.len() != byte_count
    {
        return Err(Error::InvalidArgument);
    }
    Ok(WriteMultipleRegistersRequest {
        address,
        quantity,
        values,
    })
}

pub fn build_write_multiple_registers_response(
    buf: &mut [u8],
    ack: WriteMultipleAck,
) -> Result<usize> {
    build_write_multiple_ack(buf, fc::WRITE_MULTIPLE_REGISTERS, ack)
}
pub fn parse_write_multiple_registers_response(pdu: &[u8]) -> Result<WriteMultipleAck> {
    parse_write_multiple_ack(pdu, fc::WRITE_MULTIPLE_REGISTERS)
}

// ---------------------------------------------------------------------
// FC11 Report Server Id
// ---------------------------------------------------------------------

pub fn build_report_server_id_request(buf: &mut [u8]) -> Result<usize> {
    write_header(buf, fc::REPORT_SERVER_ID)?;
    Ok(1)
}
pub fn parse_report_server_id_request(pdu: &[u8]) -> Result<()> {
    let body = take_fc(pdu, fc::REPORT_SERVER_ID)?;
    if !body.is_empty() {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

/// Borrowed view over a Report Server Id response: `[id_bytes.., run_status]`.
#[derive(Debug, Clone, Copy)]
pub struct ServerIdView<'a> {
    pub id: &'a [u8],
    pub run_status: u8,
}

pub fn build_report_server_id_response(
    buf: &mut [u8],
    id: &[u8],
    run_status: u8,
) -> Result<usize> {
    let body = write_header(buf, fc::REPORT_SERVER_ID)?;
    let len = id.len() + 1;
    if body.len() < 1 + len || len > u8::MAX as usize {
        return Err(Error::InvalidArgument);
    }
    body[0] = len as u8;
    body[1..1 + id.len()].copy_from_slice(id);
    body[1 + id.len()] = run_status;
    Ok(2 + len)
}

pub fn parse_report_server_id_response(pdu: &[u8]) -> Result<ServerIdView<'_>> {
    let body = take_fc(pdu, fc::REPORT_SERVER_ID)?;
    let byte_count = *body.first().ok_or(Error::InvalidArgument)? as usize;
    let rest = body.get(1..).ok_or(Error::InvalidArgument)?;
    if rest.len() != byte_count || byte_count == 0 {
        return Err(Error::InvalidArgument);
    }
    let (id, status) = rest.split_at(rest.len() - 1);
    Ok(ServerIdView {
        id,
        run_status: status[0],
    })
}

// ---------------------------------------------------------------------
// FC16 Mask Write Register
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskWriteRegister {
    pub address: u16,
    pub and_mask: u16,
    pub or_mask: u16,
}

pub fn build_mask_write_register_request(
    buf: &mut [u8],
    req: MaskWriteRegister,
) -> Result<usize> {
    let body = write_header(buf, fc::MASK_WRITE_REGISTER)?;
    if body.len() < 6 {
        return Err(Error::InvalidArgument);
    }
    BigEndian::write_u16(&mut body[0..2], req.address);
    BigEndian::write_u16(&mut body[2..4], req.and_mask);
    BigEndian::write_u16(&mut body[4..6], req.or_mask);
    Ok(7)
}

pub fn parse_mask_write_register_request(pdu: &[u8]) -> Result<MaskWriteRegister> {
    let body = take_fc(pdu, fc::MASK_WRITE_REGISTER)?;
    if body.len() != 6 {
        return Err(Error::InvalidArgument);
    }
    Ok(MaskWriteRegister {
        address: BigEndian::read_u16(&body[0..2]),
        and_mask: BigEndian::read_u16(&body[2..4]),
        or_mask: BigEndian::read_u16(&body[4..6]),
    })
}

pub fn build_mask_write_register_response(
    buf: &mut [u8],
    rsp: MaskWriteRegister,
) -> Result<usize> {
    build_mask_write_register_request(buf, rsp)
}
pub fn parse_mask_write_register_response(pdu: &[u8]) -> Result<MaskWriteRegister> {
    parse_mask_write_register_request(pdu)
}

/// Applies a Mask Write Register operation: `(current AND and_mask) OR (or_mask AND NOT and_mask)`.
#[must_use]
pub fn apply_mask_write(current: u16, and_mask: u16, or_mask: u16) -> u16 {
    (current & and_mask) | (or_mask & !and_mask)
}

// ---------------------------------------------------------------------
// FC17 Read/Write Multiple Registers
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ReadWriteMultipleRegistersRequest<'a> {
    pub read_address: u16,
    pub read_quantity: u16,
    pub write_address: u16,
    write_quantity: u16,
    write_values: &'a [u8],
}

impl<'a> ReadWriteMultipleRegistersRequest<'a> {
    #[must_use]
    pub fn write_quantity(&self) -> u16 {
        self.write_quantity
    }

    #[must_use]
    pub fn write_value(&self, index: u16) -> u16 {
        let i = index as usize * 2;
        BigEndian::read_u16(&self.write_values[i..i + 2])
    }
}

pub fn build_read_write_multiple_registers_request(
    buf: &mut [u8],
    read_address: u16,
    read_quantity: u16,
    write_address: u16,
    write_values: &[u16],
) -> Result<usize> {
    let write_quantity = write_values.len() as u16;
    if read_quantity == 0
        || read_quantity > MAX_READ_REGISTERS_QTY
        || write_values.is_empty()
        || write_values.len() > MAX_WRITE_REGISTERS_QTY as usize
    {
        return Err(Error::InvalidArgument);
    }
    let body = write_header(buf, fc::READ_WRITE_MULTIPLE_REGISTERS)?;
    let len = write_values.len() * 2;
    if body.len() < 9 + len || len > u8::MAX as usize {
        return Err(Error::InvalidArgument);
    }
    BigEndian::write_u16(&mut body[0..2], read_address);
    BigEndian::write_u16(&mut body[2..4], read_quantity);
    BigEndian::write_u16(&mut body[4..6], write_address);
    BigEndian::write_u16(&mut body[6..8], write_quantity);
    body[8] = len as u8;
    for (i, &r) in write_values.iter().enumerate() {
        BigEndian::write_u16(&mut body[9 + i * 2..11 + i * 2], r);
    }
    Ok(10 + len)
}

pub fn parse_read_write_multiple_registers_request(
    pdu: &[u8],
) -> Result<ReadWriteMultipleRegistersRequest<'_>> {
    let body = take_fc(pdu, fc::READ_WRITE_MULTIPLE_REGISTERS)?;
    if body.len() < 9 {
        return Err(Error::InvalidArgument);
    }
    let read_address = BigEndian::read_u16(&body[0..2]);
    let read_quantity = BigEndian::read_u16(&body[2..4]);
    let write_address = BigEndian::read_u16(&body[4..6]);
    let write_quantity = BigEndian::read_u16(&body[6..8]);
    let byte_count = body[8] as usize;
    let write_values = &body[9..];
    if read_quantity == 0
        || read_quantity > MAX_READ_REGISTERS_QTY
        || write_quantity == 0
        || write_quantity > MAX_WRITE_REGISTERS_QTY
        || byte_count != write_quantity as usize * 2
        || write_values.len() != byte_count
    {
        return Err(Error::InvalidArgument);
    }
    Ok(ReadWriteMultipleRegistersRequest {
        read_address,
        read_quantity,
        write_address,
        write_quantity,
        write_values,
    })
}

pub fn build_read_write_multiple_registers_response(
    buf: &mut [u8],
    registers: &[u16],
) -> Result<usize> {
    build_registers_response(buf, fc::READ_WRITE_MULTIPLE_REGISTERS, registers)
}
pub fn parse_read_write_multiple_registers_response(pdu: &[u8]) -> Result<RegistersView<'_>> {
    parse_registers_response(pdu, fc::READ_WRITE_MULTIPLE_REGISTERS)
}

// ---------------------------------------------------------------------
// Exceptions
// ---------------------------------------------------------------------

/// Valid Modbus exception codes.
#[must_use]
pub const fn is_valid_exception_code(code: u8) -> bool {
    matches!(code, 0x01..=0x04 | 0x08 | 0x0A | 0x0B)
}

pub fn build_exception(buf: &mut [u8], original_fc: u8, code: u8) -> Result<usize> {
    if original_fc & fc::EXCEPTION_BIT != 0 || !is_valid_exception_code(code) {
        return Err(Error::InvalidArgument);
    }
    if buf.len() < 2 {
        return Err(Error::InvalidArgument);
    }
    buf[0] = original_fc | fc::EXCEPTION_BIT;
    buf[1] = code;
    Ok(2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedException {
    pub original_fc: u8,
    pub code: u8,
}

pub fn parse_exception(pdu: &[u8]) -> Result<ParsedException> {
    match pdu {
        [f, code] if f & fc::EXCEPTION_BIT != 0 => Ok(ParsedException {
            original_fc: f & !fc::EXCEPTION_BIT,
            code: *code,
        }),
        _ => Err(Error::InvalidArgument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_holding_registers_request_round_trip() {
        let mut buf = [0u8; 5];
        let n = build_read_holding_registers_request(
            &mut buf,
            ReadRequest {
                address: 0x082B,
                quantity: 2,
            },
        )
        .unwrap();
        assert_eq!(&buf[..n], &[0x03, 0x08, 0x2B, 0x00, 0x02]);
        let parsed = parse_read_holding_registers_request(&buf[..n]).unwrap();
        assert_eq!(parsed.address, 0x082B);
        assert_eq!(parsed.quantity, 2);
    }

    #[test]
    fn read_holding_registers_quantity_zero_is_invalid() {
        let mut buf = [0u8; 5];
        assert_eq!(
            build_read_holding_registers_request(
                &mut buf,
                ReadRequest {
                    address: 0,
                    quantity: 0
                }
            ),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn read_holding_registers_quantity_126_is_invalid() {
        let mut buf = [0u8; 5];
        assert_eq!(
            build_read_holding_registers_request(
                &mut buf,
                ReadRequest {
                    address: 0,
                    quantity: 126
                }
            ),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn read_holding_registers_response_round_trip() {
        let mut buf = [0u8; 6];
        let n = build_read_holding_registers_response(&mut buf, &[0x0001, 0x0002]).unwrap();
        assert_eq!(&buf[..n], &[0x03, 0x04, 0x00, 0x01, 0x00, 0x02]);
        let view = parse_read_holding_registers_response(&buf[..n]).unwrap();
        assert_eq!(view.quantity(), 2);
        assert_eq!(view.get(0), 1);
        assert_eq!(view.get(1), 2);
    }

    #[test]
    fn write_multiple_registers_byte_count_mismatch_is_invalid() {
        let pdu = [0x10, 0x00, 0x06, 0x00, 0x02, 0x05, 0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(
            parse_write_multiple_registers_request(&pdu),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn write_multiple_coils_round_trip() {
        let mut buf = [0u8; 8];
        let coils = [true, false, true, true];
        let n = build_write_multiple_coils_request(&mut buf, 0x3311, &coils).unwrap();
        assert_eq!(&buf[..n], &[0x0F, 0x33, 0x11, 0x00, 0x04, 0x01, 0b_0000_1101]);
        let parsed = parse_write_multiple_coils_request(&buf[..n]).unwrap();
        assert_eq!(parsed.address, 0x3311);
        assert_eq!(parsed.quantity, 4);
        assert!(parsed.get(0));
        assert!(!parsed.get(1));
    }

    #[test]
    fn write_single_coil_rejects_bad_value() {
        let pdu = [0x05, 0x00, 0x01, 0x12, 0x34];
        assert_eq!(
            parse_write_single_coil_request(&pdu),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn mask_write_applies_bits() {
        assert_eq!(apply_mask_write(0x0012, 0x00F2, 0x0025), 0x0017);
    }

    #[test]
    fn exception_round_trip() {
        let mut buf = [0u8; 2];
        let n = build_exception(&mut buf, 0x03, 0x02).unwrap();
        assert_eq!(&buf[..n], &[0x83, 0x02]);
        let parsed = parse_exception(&buf[..n]).unwrap();
        assert_eq!(parsed.original_fc, 0x03);
        assert_eq!(parsed.code, 0x02);
    }

    #[test]
    fn exception_rejects_fc_with_bit_set() {
        assert_eq!(
            build_exception(&mut [0u8; 2], 0x83, 0x02),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn parse_exception_requires_exception_bit() {
        assert_eq!(parse_exception(&[0x03, 0x02]), Err(Error::InvalidArgument));
    }

    #[test]
    fn read_write_multiple_registers_round_trip() {
        let mut buf = [0u8; 14];
        let n = build_read_write_multiple_registers_request(
            &mut buf,
            0x05,
            51,
            0x03,
            &[0xABCD, 0xEF12],
        )
        .unwrap();
        let parsed = parse_read_write_multiple_registers_request(&buf[..n]).unwrap();
        assert_eq!(parsed.read_address, 0x05);
        assert_eq!(parsed.read_quantity, 51);
        assert_eq!(parsed.write_address, 0x03);
        assert_eq!(parsed.write_quantity(), 2);
        assert_eq!(parsed.write_value(0), 0xABCD);
        assert_eq!(parsed.write_value(1), 0xEF12);
    }
}
