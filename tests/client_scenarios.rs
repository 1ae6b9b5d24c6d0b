// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end client-engine scenarios (`spec` §8, S1-S3, S6), driven
//! against an in-memory loopback transport rather than a real socket.

mod common;

use common::LoopbackTransport;
use modbus_core::client::{ClientEngine, Handle, SubmitRequest};
use modbus_core::error::Error;
use modbus_core::frame::rtu::RtuFramer;
use modbus_core::frame::tcp::TcpFramer;
use modbus_core::frame::Framing;

static mut LAST_RESULT: Option<([u8; 32], usize, bool)> = None;

fn record_cb(_handle: Handle, result: core::result::Result<&[u8], Error>, _ctx: *mut ()) {
    let mut buf = [0u8; 32];
    let (len, ok) = match result {
        Ok(pdu) => {
            let n = pdu.len().min(buf.len());
            buf[..n].copy_from_slice(&pdu[..n]);
            (n, true)
        }
        Err(_) => (0, false),
    };
    unsafe {
        LAST_RESULT = Some((buf, len, ok));
    }
}

fn take_last() -> Option<([u8; 32], usize, bool)> {
    unsafe { LAST_RESULT.take() }
}

// S1: FC03 round trip over RTU, unit 0x11, address 0, quantity 2.
#[test]
fn s1_read_holding_registers_round_trip() {
    unsafe {
        LAST_RESULT = None;
    }
    let mut engine: ClientEngine<4, 4> = ClientEngine::new(Framing::Rtu, 0);
    let mut t = LoopbackTransport::new();

    let request_pdu = [0x03u8, 0x00, 0x00, 0x00, 0x02];
    engine
        .submit(SubmitRequest {
            unit_id: 0x11,
            pdu: &request_pdu,
            timeout_ms: 100,
            max_retries: 0,
            retry_backoff_ms: 0,
            high_priority: false,
            callback: Some(record_cb),
            ctx: core::ptr::null_mut(),
        })
        .unwrap();

    engine.poll(&mut t).unwrap(); // Idle -> Ready
    engine.poll(&mut t).unwrap(); // Ready -> Waiting (sends request)
    assert!(!t.tx.is_empty());

    let mut frame_buf = [0u8; 32];
    let response_pdu = [0x03u8, 0x04, 0x00, 0x01, 0x00, 0x02];
    let n = RtuFramer::encode(&mut frame_buf, 0x11, &response_pdu).unwrap();
    t.push_rx(&frame_buf[..n]);

    engine.poll(&mut t).unwrap(); // Waiting -> Idle (matched)
    assert!(engine.is_idle());

    let (buf, len, ok) = take_last().expect("callback fired");
    assert!(ok);
    assert_eq!(&buf[..len], &response_pdu[..]);
}

// S2: FC06 write-single-register, peer echoes the request verbatim.
#[test]
fn s2_write_single_register_echo() {
    unsafe {
        LAST_RESULT = None;
    }
    let mut engine: ClientEngine<4, 4> = ClientEngine::new(Framing::Rtu, 0);
    let mut t = LoopbackTransport::new();

    let request_pdu = [0x06u8, 0x00, 0x20, 0xAB, 0xCD];
    engine
        .submit(SubmitRequest {
            unit_id: 0x11,
            pdu: &request_pdu,
            timeout_ms: 100,
            max_retries: 0,
            retry_backoff_ms: 0,
            high_priority: false,
            callback: Some(record_cb),
            ctx: core::ptr::null_mut(),
        })
        .unwrap();

    engine.poll(&mut t).unwrap();
    engine.poll(&mut t).unwrap();

    let mut frame_buf = [0u8; 32];
    let n = RtuFramer::encode(&mut frame_buf, 0x11, &request_pdu).unwrap();
    t.push_rx(&frame_buf[..n]);
    engine.poll(&mut t).unwrap();

    let (buf, len, ok) = take_last().expect("callback fired");
    assert!(ok);
    assert_eq!(&buf[..len], &request_pdu[..]);
}

// S3: silent peer, one retry with doubled backoff, then a hard timeout.
#[test]
fn s3_timeout_after_one_retry() {
    let mut engine: ClientEngine<4, 4> = ClientEngine::new(Framing::Rtu, 0);
    let mut t = LoopbackTransport::new();

    let request_pdu = [0x03u8, 0x00, 0x00, 0x00, 0x02];
    engine
        .submit(SubmitRequest {
            unit_id: 0x11,
            pdu: &request_pdu,
            timeout_ms: 10,
            max_retries: 1,
            retry_backoff_ms: 40,
            high_priority: false,
            callback: None,
            ctx: core::ptr::null_mut(),
        })
        .unwrap();

    engine.poll(&mut t).unwrap(); // Idle -> Ready
    engine.poll(&mut t).unwrap(); // Ready -> Waiting, deadline = 10

    t.now = 11;
    engine.poll(&mut t).unwrap(); // deadline exceeded, retries_remaining 1 -> 0, Backoff until 11+40=51
    assert_eq!(engine.get_diag().retries(), 1);

    t.now = 51;
    engine.poll(&mut t).unwrap(); // Backoff -> Ready
    engine.poll(&mut t).unwrap(); // Ready -> Waiting again, deadline = 51+10=61

    t.now = 62;
    engine.poll(&mut t).unwrap(); // no retries left, TIMEOUT
    assert_eq!(engine.get_diag().timeouts(), 1);
    assert!(engine.is_idle());
}

// S6: TCP transaction-id match, a spurious foreign reply is ignored.
#[test]
fn s6_tcp_transaction_id_matches_and_ignores_spurious_reply() {
    unsafe {
        LAST_RESULT = None;
    }
    let mut engine: ClientEngine<4, 4> = ClientEngine::new(Framing::Tcp, 0);
    let mut t = LoopbackTransport::new();

    let request_pdu = [0x03u8, 0x00, 0x00, 0x00, 0x01];
    engine
        .submit(SubmitRequest {
            unit_id: 1,
            pdu: &request_pdu,
            timeout_ms: 1000,
            max_retries: 0,
            retry_backoff_ms: 0,
            high_priority: false,
            callback: Some(record_cb),
            ctx: core::ptr::null_mut(),
        })
        .unwrap();

    engine.poll(&mut t).unwrap();
    engine.poll(&mut t).unwrap();
    // The engine allocates TCP transaction ids starting at 1 for a
    // freshly constructed engine's first submission.
    let assigned_tid = 1u16;

    // A spurious response carrying an unrelated transaction id must be
    // dropped silently without completing the transaction.
    let spurious_tid = 0x9999;
    let mut spurious = [0u8; 32];
    let spurious_pdu = [0x03u8, 0x02, 0x00, 0x00];
    let n = TcpFramer::encode(&mut spurious, spurious_tid, 1, &spurious_pdu).unwrap();
    t.push_rx(&spurious[..n]);
    engine.poll(&mut t).unwrap();
    assert!(take_last().is_none());

    let mut real = [0u8; 32];
    let real_pdu = [0x03u8, 0x02, 0x12, 0x34];
    let n = TcpFramer::encode(&mut real, assigned_tid, 1, &real_pdu).unwrap();
    t.push_rx(&real[..n]);
    engine.poll(&mut t).unwrap();

    let (buf, len, ok) = take_last().expect("callback fired");
    assert!(ok);
    assert_eq!(&buf[..len], &real_pdu[..]);
    assert!(engine.is_idle());
}
