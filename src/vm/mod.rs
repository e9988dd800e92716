// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/mod.rs

// <>

//! The gfxboot virtual machine
//!
//! A stack machine running compact bytecode over a reference counted
//! object heap. Hosts hand it a program and a `Host` implementation;
//! the machine does the rest.

use std::io::{self, BufRead, Read, Write};
use std::time::Duration;

use thiserror::Error;

pub mod array;
pub mod code;
pub mod context;
pub mod core;
pub mod debug;
pub mod eval;
pub mod hash;
pub mod mem;
pub mod memmgt;
pub mod num;
pub mod obj;
pub mod prim;

pub use self::code::Assembler;
pub use self::core::{BaseType, ObjId, SubType, VmErr, VmResult};
pub use self::obj::{DumpStyle, Store};

use self::memmgt::MIN_ZONE_SIZE;
use self::obj::MIN_OLIST_SIZE;

/// Callbacks into whatever embeds the machine
pub trait Host {
    fn read_file(&mut self, _name: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// Console output; `text` holds complete lines
    fn log(&mut self, _text: &str) {}

    /// Output of the `show` primitive
    fn show(&mut self, _text: &[u8]) {}

    /// Redraw a screen region
    fn screen_update(&mut self, _x: i32, _y: i32, _w: i32, _h: i32) {}

    /// Next key for the debug console; 0 when there is no more input
    fn get_key(&mut self) -> u32 {
        0
    }
}

/// Filesystem and stdout backed host
#[derive(Debug, Default)]
pub struct StdHost;

impl Host for StdHost {
    fn read_file(&mut self, name: &[u8]) -> Option<Vec<u8>> {
        let name = String::from_utf8_lossy(name);

        match std::fs::read(name.as_ref()) {
            Ok(data) => Some(data),
            Err(e) => {
                log::warn!("{}: {}", name, e);
                None
            }
        }
    }

    fn log(&mut self, text: &str) {
        print!("{}", text);
    }

    fn show(&mut self, text: &[u8]) {
        let mut out = io::stdout();
        let _ = out.write_all(text).and_then(|_| out.flush());
    }

    fn get_key(&mut self) -> u32 {
        let mut stdin = io::stdin().lock();
        let mut buf = [0u8; 6];

        if stdin.read_exact(&mut buf[..1]).is_err() {
            return 0;
        }

        let len = match buf[0] {
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => 1,
        };
        if len > 1 && stdin.read_exact(&mut buf[1..len]).is_err() {
            return 0;
        }

        match prim::utf8_decode(&buf[..len]) {
            (c, _) if c > 0 => c as u32,
            _ => u32::from(buf[0]),
        }
    }
}

/// Debug console state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Console {
    #[default]
    Off,
    /// commands run, no keyboard input
    Shown,
    /// reading command lines through `Host::get_key`
    Input,
}

/// Runtime trace switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trace {
    pub ip: bool,
    pub pstack: bool,
    pub context: bool,
    pub gc: bool,
    pub time: bool,
    pub memcheck: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// arena size in bytes
    pub mem_size: u32,
    /// initial object table slots
    pub olist_size: u32,
    /// step budget; 0 is unlimited
    pub steps: u32,
    pub trace: Trace,
    /// echo debug commands along with the current ip
    pub log_prompt: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mem_size: 0x100000,
            olist_size: MIN_OLIST_SIZE,
            steps: 0,
            trace: Trace::default(),
            log_prompt: true,
        }
    }
}

/// Failures outside the machine itself
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1}")]
    Io(String, #[source] io::Error),
    #[error("arena size {0:#x} is below the minimum of {min:#x}", min = MIN_ZONE_SIZE)]
    MemSize(u32),
    #[error(transparent)]
    Vm(#[from] VmErr),
}

/// Machine state
pub struct Vm {
    pub store: Store,
    /// data stack
    pub pstack: ObjId,
    /// innermost running context
    pub context: ObjId,
    /// global dictionary
    pub dict: ObjId,
    /// error register
    pub error: Option<VmErr>,
    /// the current error has been reported
    pub error_shown: bool,
    pub stop: bool,
    /// step budget for the next run; 0 is unlimited
    pub debug_steps: u32,
    /// instructions decoded so far
    pub steps: u64,
    pub time: Duration,
    pub trace: Trace,
    pub log_prompt: bool,
    pub console: Console,
    /// console line being typed
    pub(crate) console_line: Vec<u8>,
    /// stop running once this context is current again
    pub(crate) wait_for_context: ObjId,
    pub(crate) array_start: ObjId,
    pub(crate) hash_start: ObjId,
    pub(crate) host: Box<dyn Host>,
}

impl Vm {
    pub fn new(config: Config, host: Box<dyn Host>) -> VmResult<Self> {
        let store = Store::new(config.mem_size, config.olist_size)?;

        let mut vm = Vm {
            store,
            pstack: ObjId::NIL,
            context: ObjId::NIL,
            dict: ObjId::NIL,
            error: None,
            error_shown: false,
            stop: false,
            debug_steps: config.steps,
            steps: 0,
            time: Duration::ZERO,
            trace: Trace::default(),
            log_prompt: config.log_prompt,
            console: Console::Off,
            console_line: Vec::new(),
            wait_for_context: ObjId::NIL,
            array_start: ObjId::NIL,
            hash_start: ObjId::NIL,
            host,
        };

        vm.set_trace(config.trace);
        vm.setup_dict()?;

        Ok(vm)
    }

    /// Switch trace flags, passing the heap related ones to the store
    pub fn set_trace(&mut self, trace: Trace) {
        self.trace = trace;
        self.store.trace_gc = trace.gc;
        self.store.memcheck = trace.memcheck;
    }

    /// Fresh global dictionary holding every primitive
    pub fn setup_dict(&mut self) -> VmResult<()> {
        let old = self.dict;
        self.dict = self.store.hash_new(0)?;
        self.store.ref_dec(old);

        for (idx, (name, _)) in prim::PRIMS.iter().enumerate() {
            let key = self.store.const_new(name.as_bytes(), SubType::Ref)?;
            let val = self.store.num_new(idx as i64, SubType::Prim)?;
            self.store.hash_set(self.dict, key, val, false)?;

            match idx as u32 {
                prim::PRIM_ARRAY_START => self.array_start = val,
                prim::PRIM_HASH_START => self.hash_start = val,
                _ => {}
            }
        }

        if self.array_start.is_nil() || self.hash_start.is_nil() {
            return Err(VmErr::Internal);
        }

        Ok(())
    }

    pub(crate) fn set_error(&mut self, err: VmErr) {
        self.error = Some(err);
        self.error_shown = false;
    }

    /// Current ip as `#code:0xip`, plus the position inside the
    /// original object when the code is an alias
    pub fn ip_string(&self) -> String {
        let (code, ip) = match self.store.context(self.context) {
            Some(c) => (
                c.code,
                if self.error.is_some() {
                    c.current_ip
                } else {
                    c.ip
                },
            ),
            None => (ObjId::NIL, 0),
        };

        let mut out = format!("#{}:{:#x}", code.idx(), ip);

        let code_obj = self.store.typed(code, BaseType::Mem);
        let ref_id = code_obj.map_or(ObjId::NIL, |o| o.ref_id());

        if !ref_id.is_nil() {
            let code_ofs = code_obj.and_then(|o| o.span()).map_or(0, |(o, _)| o);
            let ref_ip = match self.store.span(ref_id) {
                Some((ref_ofs, _)) if code_ofs >= ref_ofs => ip + code_ofs - ref_ofs,
                _ => 0,
            };
            out += &format!("[#{}:{:#x}]", ref_id.idx(), ref_ip);
        }

        out
    }

    /// Report the pending error once
    pub fn show_error(&mut self) {
        if let Some(err) = self.error {
            if !self.error_shown {
                let text = format!("error {} ({}), ip {}\n", err.code(), err, self.ip_string());
                self.host.log(&text);
                self.error_shown = true;
            }
        }
    }

    /// Console output, one line
    pub(crate) fn say(&mut self, text: &str) {
        self.host.log(&format!("{}\n", text));
    }

    /// Load a program and make it the root context; the program bytes
    /// are copied into the heap
    pub fn load(&mut self, program: &[u8]) -> VmResult<ObjId> {
        let id = self.store.const_new(program, SubType::Skip)?;
        log::debug!("program loaded {} ({} bytes)", self.store.id2str(id), program.len());

        let res = self.program_init(id);
        // the root context holds its own reference
        self.store.ref_dec(id);

        res.map(|_| id)
    }

    /// Load and run `program`. A program that stopped itself with
    /// `debug` gets the console until the host runs out of keys.
    pub fn run_program(&mut self, program: &[u8]) {
        match self.load(program) {
            Ok(_) => {
                self.run();
                if self.console == Console::Input {
                    self.debug_console();
                }
            }
            Err(e) => self.set_error(e),
        }

        self.show_error();
    }

    pub fn host_mut(&mut self) -> &mut dyn Host {
        self.host.as_mut()
    }
}

fn config_check(config: &Config) -> Result<(), Error> {
    if config.mem_size < MIN_ZONE_SIZE {
        return Err(Error::MemSize(config.mem_size));
    }

    Ok(())
}

/// Run a program file to completion; the machine is returned for
/// inspection
pub fn run_file(path: &str, config: Config) -> Result<Vm, Error> {
    config_check(&config)?;

    let program = std::fs::read(path).map_err(|e| Error::Io(path.to_string(), e))?;

    let mut vm = Vm::new(config, Box::new(StdHost))?;
    vm.run_program(&program);

    Ok(vm)
}

/// Debug console on `stream_in`; the program is loaded but not started
pub fn repl(path: &str, config: Config, stream_in: impl BufRead) -> Result<Vm, Error> {
    config_check(&config)?;

    let program = std::fs::read(path).map_err(|e| Error::Io(path.to_string(), e))?;

    let mut vm = Vm::new(config, Box::new(StdHost))?;

    if let Err(e) = vm.load(&program) {
        vm.set_error(e);
        vm.show_error();
    }

    for line in stream_in.lines() {
        let line = line.map_err(|e| Error::Io("stdin".to_string(), e))?;
        let line = line.trim_end();

        if line == "quit" || line == "q" {
            break;
        }

        vm.debug_cmd(line);
    }

    Ok(vm)
}
