// SPDX-FileCopyrightText: Copyright (c) 2017-2022 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_std]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![warn(clippy::cast_lossless)]
#![warn(clippy::explicit_deref_methods)]
#![warn(clippy::explicit_into_iter_loop)]
#![warn(clippy::explicit_iter_loop)]
#![cfg_attr(not(test), warn(clippy::panic_in_result_fn))]
#![cfg_attr(not(test), warn(clippy::cast_possible_truncation))]
#![warn(rustdoc::broken_intra_doc_links)]
#![doc = include_str!("../README.md")]

//! A `no_std`, allocation-free Modbus protocol core: PDU codec, RTU/TCP/ASCII
//! framing, and cooperative client/server engines, driven entirely by an
//! external `poll` loop over a caller-supplied [`transport::Transport`].

#[cfg(test)]
extern crate std;

pub mod crc;
pub mod error;
pub mod pdu;
pub mod pool;
pub mod slave;
pub mod transport;

pub mod frame;

pub mod diag;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "autoheal")]
pub mod autoheal;
