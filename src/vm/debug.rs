// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/debug.rs

// Line oriented debug console. A line is either a command (dump, run,
// trace switches) or a list of values and words applied to the stack.

// <>

use super::core::{Data, ObjId, SubType, VmErr};
use super::mem::hex_dump;
use super::obj::DumpStyle;
use super::prim::utf8_encode;
use super::{Console, Trace, Vm};

const MAX_TOKENS: usize = 15;

/// Longest line the console accepts from the keyboard
const MAX_CONSOLE_LINE: usize = 255;

/// Split a line at whitespace; a quoted string is one token even when
/// it holds spaces
fn tokenize(line: &str) -> Vec<&str> {
    let mut tokens = vec![];
    let mut rest = line;

    while tokens.len() < MAX_TOKENS {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }

        let end = if let Some(quoted) = rest.strip_prefix('"') {
            quoted.find('"').map_or(rest.len(), |pos| pos + 2)
        } else {
            rest.find(char::is_whitespace).unwrap_or(rest.len())
        };

        tokens.push(&rest[..end]);
        rest = &rest[end..];
    }

    tokens
}

/// Integer in C notation: decimal, `0x` hex or leading zero octal
fn parse_num(text: &str) -> Option<i64> {
    let (neg, digits) = match text.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let val = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok()?
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };

    Some(if neg { val.wrapping_neg() } else { val })
}

fn is_num(text: Option<&&str>) -> bool {
    text.map_or(false, |t| t.starts_with(|c: char| c.is_ascii_digit()))
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

impl Vm {
    /// Read keys from the host and run the lines they form, until `^D`
    /// closes the console or there are no keys left
    pub fn debug_console(&mut self) {
        self.show_error();

        while self.console == Console::Input {
            match self.host.get_key() {
                0 => break,
                key => self.console_key(key),
            }
        }
    }

    /// Line editing: return runs the line, backspace drops the last
    /// character, `^D` closes the console
    pub fn console_key(&mut self, key: u32) {
        match key {
            0x04 => {
                self.console = Console::Off;
                self.console_line.clear();
            }
            0x0a | 0x0d => {
                let line = std::mem::take(&mut self.console_line);
                self.debug_cmd(&String::from_utf8_lossy(&line));
            }
            0x08 | 0x7f => {
                // whole characters go
                while let Some(b) = self.console_line.pop() {
                    if b & 0xc0 != 0x80 {
                        break;
                    }
                }
            }
            k if k < 0x20 => {}
            k => {
                let mut buf = Vec::with_capacity(6);
                utf8_encode(k, &mut buf);
                if self.console_line.len() + buf.len() <= MAX_CONSOLE_LINE {
                    self.console_line.extend_from_slice(&buf);
                }
            }
        }
    }

    /// Execute one console line
    pub fn debug_cmd(&mut self, line: &str) {
        if self.log_prompt {
            let prompt = format!("{}>{}", self.ip_string(), line);
            self.say(&prompt);
        }

        if line.starts_with("# ") {
            self.say(line);
            return;
        }

        let argv = tokenize(line);
        let cmd = match argv.first() {
            Some(&cmd) => cmd,
            None => return,
        };

        if !line.starts_with(' ') {
            match cmd {
                "d" | "dump" | "i" | "inspect" | "p" | "print" => return self.cmd_dump(&argv),
                "defrag" => return self.cmd_defrag(&argv),
                "log" => return self.cmd_log(&argv),
                "hex" => return self.cmd_hex(&argv),
                "find" => return self.cmd_find(&argv),
                "r" | "run" | "s" | "step" | "f" | "t" | "trace" => return self.cmd_run(&argv),
                "set" => return self.cmd_set(&argv),
                _ => {}
            }
        }

        let mut failed = false;

        for arg in argv {
            if let Err(e) = self.debug_value(arg) {
                match e {
                    None => failed = true,
                    Some(e) => self.set_error(e),
                }
            }
        }

        if !failed {
            let trace = self.trace_text();
            if !trace.is_empty() {
                self.host.log(&trace);
            }
            self.show_error();
        }
    }

    /// Apply one value token; `Err(None)` marks an unknown word
    fn debug_value(&mut self, arg: &str) -> Result<(), Option<VmErr>> {
        let (is_id, num) = match arg.strip_prefix('#') {
            Some(rest) => (true, parse_num(rest)),
            None => (false, parse_num(arg)),
        };

        match (arg, num) {
            ("nil", _) => self.push(ObjId::NIL, false)?,
            ("true", _) | ("false", _) => {
                let num = self.store.num_new((arg == "true") as i64, SubType::Bool)?;
                self.push_new(num)?;
            }
            (_, Some(val)) if is_id => {
                let id = self.id_from_index(val);
                self.push(id, true)?;
            }
            (_, Some(val)) => {
                let num = self.store.num_new(val, SubType::Int)?;
                self.push_new(num)?;
            }
            _ => {
                if let Some(text) = arg.strip_prefix('"') {
                    let text = text.strip_suffix('"').unwrap_or(text);
                    self.push_bytes(text.as_bytes(), SubType::String)?;
                } else if let Some(name) = arg.strip_prefix('/') {
                    self.push_bytes(name.as_bytes(), SubType::Ref)?;
                } else if let Some(key) = arg.strip_prefix('.') {
                    let before = self.context;
                    self.wait_for_context = before;
                    self.get_x(key.as_bytes())?;

                    // a plain value needs no run
                    if self.context == before {
                        self.wait_for_context = ObjId::NIL;
                    } else {
                        self.run();
                    }
                } else if let Some(key) = arg.strip_prefix('=') {
                    let key = self.store.const_new(key.as_bytes(), SubType::Ref)?;
                    let res = self.put_x(key);
                    self.store.ref_dec(key);
                    res?;
                } else {
                    match self.lookup_dict(arg.as_bytes()) {
                        Some((_, id)) => {
                            let text = format!("{} -> {}", arg, self.store.id2str(id));
                            self.say(&text);
                            self.exec_id(ObjId::NIL, id, false)?;
                        }
                        None => {
                            let text = format!("unknown command: {}", arg);
                            self.say(&text);
                            return Err(None);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Push a writable copy of `bytes`
    fn push_bytes(&mut self, bytes: &[u8], sub_type: SubType) -> Result<(), VmErr> {
        let len = u32::try_from(bytes.len()).map_err(|_| VmErr::NoMemory)?;
        let id = self.store.mem_new(len, sub_type)?;

        if let Some((offset, _)) = self.store.span(id) {
            self.store.zone.bytes_mut(offset, len).copy_from_slice(bytes);
        }

        self.push_new(id)
    }

    /// Live id for a slot index, using the slot's current generation
    fn id_from_index(&self, val: i64) -> ObjId {
        let raw = ObjId(val as u32);

        match self.store.get_nocheck(raw) {
            Some(obj) if !raw.is_nil() => ObjId::new(raw.idx(), obj.gen),
            _ => ObjId::NIL,
        }
    }

    /// Trace output for the current state, as configured
    fn trace_text(&self) -> String {
        let mut out = String::new();

        if self.trace.context {
            out += &self.bt_dump(DumpStyle::default());
        }
        if self.trace.pstack {
            out += &self.stack_dump(DumpStyle::default());
        }

        out
    }

    /// Stack listing, top element first
    pub fn stack_dump(&self, style: DumpStyle) -> String {
        let mut out = format!("== stack ({}) ==\n", self.store.id2str(self.pstack));
        let inspect = DumpStyle {
            inspect: true,
            ..DumpStyle::default()
        };

        for (u, &id) in self.stack_items().iter().rev().enumerate() {
            if style.max != 0 && u as u32 >= style.max {
                break;
            }
            out += &format!("  [{}] {}", u, self.store.dump(id, inspect));
        }

        out
    }

    /// Context chain, innermost first
    pub fn bt_dump(&self, style: DumpStyle) -> String {
        let mut out = String::from("== backtrace ==\n");
        let inspect = DumpStyle {
            inspect: true,
            ..DumpStyle::default()
        };

        let mut id = self.context;
        let mut u = 0;

        while let Some(ctx) = self.store.context(id) {
            if (style.max != 0 && u >= style.max) || u >= self.store.capacity() {
                break;
            }
            out += &format!("  [{}] {}", u, self.store.dump(id, inspect));
            id = ctx.parent;
            u += 1;
        }

        out
    }

    fn status_dump(&self) -> String {
        let inspect = DumpStyle {
            inspect: true,
            ..DumpStyle::default()
        };
        let err = self.error;
        let steps = self.steps.max(1);

        format!(
            "program:\n  ip = {}\n  global dict = {}  stack = {}  context = {}  \
             garbage collector = {} pending\n  error {} ({})\n  \
             time = {:?}, steps = {}, avg = {:?}/step\n",
            self.ip_string(),
            self.store.dump(self.dict, inspect),
            self.store.dump(self.pstack, inspect),
            self.store.dump(self.context, inspect),
            self.store.gc_pending().len(),
            err.map_or(0, VmErr::code),
            err.map_or_else(|| "ok".to_string(), |e| e.to_string()),
            self.time,
            self.steps,
            self.time / u32::try_from(steps).unwrap_or(u32::MAX),
        )
    }

    fn vm_dump(&self) -> String {
        let t = self.trace;
        let flags: String = [
            (t.ip, " ip"),
            (t.pstack, " stack"),
            (t.context, " context"),
            (t.gc, " gc"),
            (t.time, " time"),
            (t.memcheck, " memcheck"),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, name)| *name)
        .collect();

        format!(
            "vm\n  size = {:#x}, objects = {}, first free = {:#x}\n\
             debug\n  prompt = {}\n  trace ={}\n",
            self.store.zone.size(),
            self.store.capacity(),
            self.store.zone.first_free(),
            on_off(self.log_prompt),
            flags
        )
    }

    fn mem_dump(&self, style: DumpStyle) -> String {
        let mut out = format!("== memory ({:#x} bytes) ==\n", self.store.zone.size());

        for (u, chunk) in self.store.zone.chunks().enumerate() {
            if style.max != 0 && u as u32 >= style.max {
                break;
            }

            let owner = if chunk.is_free() {
                "free".to_string()
            } else {
                self.store.id2str(chunk.id)
            };
            out += &format!("  {:#010x}  {:#8x}  {}\n", chunk.offset, chunk.next, owner);
        }

        out
    }

    fn cmd_dump(&mut self, argv: &[&str]) {
        let mut target = match argv.get(1) {
            Some(&t) => t,
            None => return,
        };

        let mut style = DumpStyle {
            inspect: argv[0] == "i",
            dump: argv[0] == "d",
            ..DumpStyle::default()
        };

        if let Some(t) = target.strip_prefix('*') {
            style.refs = true;
            target = t;
        }
        target = target.strip_prefix('#').unwrap_or(target);

        if let Some(max) = argv.get(2).and_then(|m| parse_num(m)) {
            style.max = max as u32;
        }

        let text = match target {
            "st" => self.status_dump(),
            "vm" => self.vm_dump(),
            "mem" => self.mem_dump(style),
            "stack" => self.stack_dump(style),
            "bt" => self.bt_dump(style),
            "context" => self.store.dump(self.context, style),
            "dict" => self.store.dump(self.dict, style),
            "gc" => {
                let ids: Vec<String> = self
                    .store
                    .gc_pending()
                    .iter()
                    .map(|&id| self.store.id2str(id))
                    .collect();
                format!("gc = [{}]\n", ids.join(", "))
            }
            "ip" => format!("ip = {}\n", self.ip_string()),
            "err" => {
                self.show_error();
                return;
            }
            _ => match parse_num(target) {
                Some(idx) => {
                    let id = self.id_from_index(idx);
                    if id.is_nil() {
                        return;
                    }
                    self.store.dump(id, style)
                }
                None => match self.lookup_dict(target.as_bytes()) {
                    Some((_, id)) => self.store.dump(id, style),
                    None => return,
                },
            },
        };

        self.host.log(&text);
    }

    fn cmd_hex(&mut self, argv: &[&str]) {
        let mut target = match argv.get(1) {
            Some(&t) => t,
            None => return,
        };

        let record = target.starts_with('*');
        if record {
            target = &target[1..];
        }
        target = target.strip_prefix('#').unwrap_or(target);

        let len = argv.get(2).and_then(|l| parse_num(l)).unwrap_or(0);
        let ofs = argv.get(3).and_then(|o| parse_num(o)).unwrap_or(0);

        let obj = match parse_num(target).and_then(|idx| self.store.get_nocheck(ObjId(idx as u32))) {
            Some(obj) => *obj,
            None => return,
        };

        if record {
            let text = format!("{:?}\n", obj);
            self.host.log(&text);
            return;
        }

        let bytes = match obj.data {
            Data::Ptr { offset, size, .. } => {
                let zone_size = i64::from(self.store.zone.size());
                let start = (i64::from(offset) + ofs).clamp(0, zone_size);
                let len = if len > 0 { len } else { i64::from(size) };
                let end = (start + len).clamp(start, zone_size);
                self.store
                    .zone
                    .bytes(start as u32, (end - start) as u32)
                    .to_vec()
            }
            Data::Value(val) => {
                let bytes = val.to_le_bytes();
                let start = ofs.clamp(0, 8) as usize;
                let end = if len > 0 {
                    (start + len as usize).min(8)
                } else {
                    8
                };
                bytes[start..end.max(start)].to_vec()
            }
        };

        let text = hex_dump(&bytes);
        self.host.log(&text);
    }

    fn cmd_log(&mut self, argv: &[&str]) {
        let mut trace = self.trace;
        let mut args = argv[1..].iter().peekable();

        while let Some(&name) = args.next() {
            let val = if is_num(args.peek().copied()) {
                args.next().and_then(|v| parse_num(v)).unwrap_or(0) != 0
            } else {
                true
            };

            match name {
                "ip" => trace.ip = val,
                "stack" => trace.pstack = val,
                "context" => trace.context = val,
                "gc" => trace.gc = val,
                "time" => trace.time = val,
                "memcheck" => trace.memcheck = val,
                "prompt" => self.log_prompt = val,
                "all" => {
                    trace = Trace {
                        ip: val,
                        pstack: val,
                        context: val,
                        gc: val,
                        time: val,
                        memcheck: val,
                    };
                    self.log_prompt = val;
                }
                // output levels belong to the host logger
                "serial" | "console" | "pointer" => {}
                _ => {}
            }
        }

        self.set_trace(trace);
    }

    fn cmd_find(&mut self, argv: &[&str]) {
        let id = match argv.get(1).and_then(|i| parse_num(i)) {
            Some(idx) if idx != 0 => self.id_from_index(idx),
            _ => return,
        };
        if id.is_nil() {
            return;
        }

        let holders: Vec<ObjId> = self
            .store
            .objects()
            .map(|(oid, _)| oid)
            .filter(|&oid| self.store.contains(oid, id))
            .collect();

        for holder in holders {
            let text = self.store.id2str(holder);
            self.say(&text);
        }
    }

    fn cmd_defrag(&mut self, argv: &[&str]) {
        let max = match argv.get(1).and_then(|m| parse_num(m)) {
            Some(max) if max > 0 => max as u32,
            _ => u32::MAX,
        };

        if let Err(e) = self.store.defrag(max) {
            self.set_error(e);
            self.show_error();
        }
    }

    fn cmd_run(&mut self, argv: &[&str]) {
        let mut steps = 0;

        match argv[0].as_bytes()[0] {
            b't' => steps = 1,
            b's' => self.wait_for_context = self.context,
            b'f' => {
                self.wait_for_context = self
                    .store
                    .context(self.context)
                    .map_or(ObjId::NIL, |c| c.parent);
            }
            _ => {}
        }

        if let Some(n) = argv.get(1).and_then(|n| parse_num(n)) {
            steps = n as u32;
        }

        self.debug_steps = steps;
        self.error_shown = false;

        self.run();

        self.show_error();
    }

    fn cmd_set(&mut self, argv: &[&str]) {
        let (what, val) = match (argv.get(1), argv.get(2).and_then(|v| parse_num(v))) {
            (Some(&what), Some(val)) => (what, val),
            _ => return,
        };

        let id = self.id_from_index(val);

        match what {
            "stack" => {
                self.store.ref_inc(id);
                let old = std::mem::replace(&mut self.pstack, id);
                self.store.ref_dec(old);
            }
            "context" => self.assign_context(id),
            "dict" => {
                self.store.ref_inc(id);
                let old = std::mem::replace(&mut self.dict, id);
                self.store.ref_dec(old);
            }
            "ip" => {
                if let Some(mut ctx) = self.store.context(self.context) {
                    ctx.ip = val as u32;
                    if let Err(e) = self.store.set_context(self.context, &ctx) {
                        self.set_error(e);
                    }
                }
                let text = format!("ip = {}", self.ip_string());
                self.say(&text);
            }
            "err" => {
                match VmErr::from_code(val as u32) {
                    Some(e) => self.set_error(e),
                    None => self.error = None,
                }
                self.show_error();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::vm::Assembler;

    fn console() -> (Vm, std::rc::Rc<std::cell::RefCell<Output>>) {
        let (mut vm, out) = vm();
        vm.load(&Assembler::new().int(1).int(2).finish()).unwrap();
        (vm, out)
    }

    #[test]
    fn tokens() {
        assert_eq!(vec!["a", "\"b c\"", "d"], tokenize("  a \"b c\"  d "));
        assert_eq!(vec!["\"open"], tokenize("\"open"));
        assert_eq!(MAX_TOKENS, tokenize(&"x ".repeat(20)).len());
    }

    #[test]
    fn numbers() {
        assert_eq!(Some(255), parse_num("0xff"));
        assert_eq!(Some(-10), parse_num("-10"));
        assert_eq!(Some(8), parse_num("010"));
        assert_eq!(Some(0), parse_num("0"));
        assert_eq!(None, parse_num("x1"));
    }

    #[test]
    fn values_and_words() {
        let (mut vm, out) = console();

        vm.debug_cmd("3 4 add");
        assert_eq!(vec![7], stack_ints(&vm));
        assert!(out.borrow().log.contains(">3 4 add\n"));
        assert!(out.borrow().log.contains("add -> #"));

        vm.debug_cmd("\"a b\" /x nil true");
        let items = vm.stack_items();
        assert_eq!(b"a b", vm.store.mem_bytes(items[1]));
        assert_eq!(b"x", vm.store.mem_bytes(items[2]));
        assert!(items[3].is_nil());
        assert_eq!(Some(1), vm.store.num_subtype_value(items[4], SubType::Bool));

        vm.debug_cmd("bogus");
        assert!(out.borrow().log.contains("unknown command: bogus\n"));
    }

    #[test]
    fn hash_get_and_set() {
        let (mut vm, _) = console();

        // the binding consumes the hash, so keep a copy
        vm.debug_cmd("( ) dup 5 =x");
        assert_eq!(1, vm.stack_len());

        vm.debug_cmd(".x");
        assert_eq!(None, vm.error);
        assert_eq!(vec![5], stack_ints(&vm));
        assert!(vm.wait_for_context.is_nil());
    }

    #[test]
    fn stack_listing() {
        let (mut vm, out) = console();

        vm.debug_cmd("10 20");
        vm.debug_cmd("p stack");

        let log = out.borrow().log.clone();
        assert!(log.contains("== stack ("));
        assert!(log.contains("  [0] "));
        assert!(log.contains("<20 (0x14)>"));
        assert!(log.contains("  [1] "));
    }

    #[test]
    fn comments_are_echoed() {
        let (mut vm, out) = console();
        vm.log_prompt = false;

        vm.debug_cmd("# hello there");
        assert_eq!("# hello there\n", out.borrow().log);
        assert_eq!(0, vm.stack_len());
    }

    #[test]
    fn log_switches() {
        let (mut vm, _) = console();

        vm.debug_cmd("log ip stack 0 gc");
        assert!(vm.trace.ip);
        assert!(!vm.trace.pstack);
        assert!(vm.trace.gc);
        assert!(vm.store.trace_gc);

        vm.debug_cmd("log all 0");
        assert_eq!(Trace::default(), vm.trace);
        assert!(!vm.log_prompt);
    }

    #[test]
    fn single_steps() {
        let (mut vm, _) = console();

        // the magic comment
        vm.debug_cmd("t");
        assert_eq!(0, vm.stack_len());

        vm.debug_cmd("t");
        assert_eq!(vec![1], stack_ints(&vm));

        vm.debug_cmd("r");
        assert_eq!(vec![1, 2], stack_ints(&vm));
    }

    #[test]
    fn step_over_call() {
        let (mut vm, _) = vm();
        vm.load(&Assembler::new()
            .begin()
            .int(1)
            .int(2)
            .end()
            .op("exec")
            .int(3)
            .finish())
            .unwrap();

        vm.debug_cmd("t 2");
        assert_eq!(1, vm.stack_len());

        // runs the called block, stops back in the caller
        vm.debug_cmd("s");
        assert_eq!(vec![1, 2], stack_ints(&vm));
        assert!(vm.wait_for_context.is_nil());
    }

    #[test]
    fn find_holders() {
        let (mut vm, out) = console();

        vm.debug_cmd("[ 7 ]");
        let arr = vm.stack_items()[0];
        let elem = vm.store.array_get(arr, 0);

        vm.debug_cmd(&format!("find {}", elem.idx()));
        let expected = format!("{}\n", vm.store.id2str(arr));
        assert!(out.borrow().log.contains(&expected));
    }

    #[test]
    fn hex_and_errors() {
        let (mut vm, out) = console();

        vm.debug_cmd("\"abc\"");
        let id = vm.stack_items()[0];
        vm.debug_cmd(&format!("hex #{}", id.idx()));
        assert!(out.borrow().log.contains(" 61 62 63"));

        vm.debug_cmd("set err 14");
        assert_eq!(Some(VmErr::DivByZero), vm.error);
        assert!(out.borrow().log.contains("error 14 (div by zero)"));

        vm.debug_cmd("set err 0");
        assert_eq!(None, vm.error);
    }

    #[test]
    fn status_dumps() {
        let (mut vm, out) = console();

        vm.debug_cmd("d st");
        vm.debug_cmd("d vm");
        vm.debug_cmd("d mem 2");
        vm.debug_cmd("d ip");

        let log = out.borrow().log.clone();
        assert!(log.contains("program:\n  ip = #"));
        assert!(log.contains("vm\n  size = 0x10000"));
        assert!(log.contains("== memory (0x10000 bytes) =="));
        assert!(log.contains("ip = #"));
    }

    #[test]
    fn console_line_editing() {
        let (mut vm, _) = console();
        vm.console = Console::Input;

        for key in "12\u{8}3\n".chars() {
            vm.console_key(u32::from(key));
        }
        assert_eq!(vec![13], stack_ints(&vm));

        for key in "\"\u{e9}\u{7f}a\"\u{1}\n".chars() {
            vm.console_key(u32::from(key));
        }
        let items = vm.stack_items();
        assert_eq!(b"a", vm.store.mem_bytes(items[1]));

        vm.console_key(0x04);
        assert_eq!(Console::Off, vm.console);
    }
}
