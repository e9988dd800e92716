// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lib.rs

// <>

//! Bytecode interpreter for boot loader menus
//!
//! Programs are compiled elsewhere into the compact instruction stream
//! described in [`vm::code`]; this crate loads and runs them, and
//! offers a line based console for poking at a running machine.

pub mod vm;

pub use vm::{repl, run_file, Assembler, Config, Console, DumpStyle, Host, StdHost, Trace, Vm};
pub use vm::{ObjId, VmErr, VmResult};
