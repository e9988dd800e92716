// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/eval.rs

// Fetch, decode and dispatch. Control flow lives in the context chain:
// entering a block, function or loop pushes a context, and the code end
// instruction decides whether to repeat the body or return to the
// parent.

// <>

use std::time::Instant;

use super::code::{self, Instr};
use super::context::Context;
use super::core::{BaseType, ObjId, SubType, VmErr, VmResult};
use super::obj::{DumpStyle, Yield};
use super::{prim, Vm};

/// A decoded instruction together with where its bytes live
#[derive(Debug, Clone, Copy)]
struct Fetched {
    instr: Instr,
    code: ObjId,
    /// arena offset the instruction was decoded from
    base: u32,
}

impl Vm {
    /// Reset the machine state and make `program` the root function
    pub fn program_init(&mut self, program: ObjId) -> VmResult<()> {
        self.error = None;
        self.error_shown = false;
        self.steps = 0;

        let old = std::mem::replace(&mut self.pstack, ObjId::NIL);
        self.store.ref_dec(old);
        let old = std::mem::replace(&mut self.context, ObjId::NIL);
        self.store.ref_dec(old);

        self.pstack = self.store.array_new(0)?;

        if !self.is_code(program) {
            return Err(VmErr::InvalidCode);
        }

        let id = self.store.context_new(SubType::CtxFunc)?;
        let mut ctx = Context::new(SubType::CtxFunc);
        ctx.dict = self.store.ref_inc(self.dict);
        ctx.code = self.store.ref_inc(program);
        self.store.set_context(id, &ctx)?;

        self.context = id;

        Ok(())
    }

    /// Read-only memory that is either a code block or a whole program
    pub fn is_code(&self, id: ObjId) -> bool {
        match self.store.typed(id, BaseType::Mem) {
            Some(obj) if obj.flags.ro => {
                obj.sub_type == SubType::Code || code::has_magic(self.store.mem_bytes(id))
            }
            _ => false,
        }
    }

    fn fetch(&mut self) -> VmResult<Option<Fetched>> {
        if self.stop || self.error.is_some() {
            return Ok(None);
        }

        self.steps += 1;

        if self.context.is_nil() {
            return Ok(None);
        }

        let mut ctx = self.store.context(self.context).ok_or(VmErr::Internal)?;
        let ip = ctx.ip;
        ctx.current_ip = ip;
        self.store.set_context(self.context, &ctx)?;

        let code_obj = *self
            .store
            .typed(ctx.code, BaseType::Mem)
            .ok_or(VmErr::InvalidCode)?;
        let (offset, size) = code_obj.span().ok_or(VmErr::InvalidCode)?;

        // falling off the end is not an error
        if ip == size {
            return Ok(None);
        }
        if ip > size {
            return Err(VmErr::InvalidCode);
        }

        let mut base = offset + ip;
        let mut instr = code::decode(self.store.zone.bytes(base, size - ip))?;

        if instr.kind == SubType::Xref {
            // the target may precede an alias and lie in its owner
            let owner = match code_obj.ref_id() {
                ObjId::NIL => ctx.code,
                owner => owner,
            };
            let (o_offset, o_size) = self.store.span(owner).ok_or(VmErr::InvalidCode)?;
            let target = i64::from(base) - instr.arg1;

            if target < i64::from(o_offset) || target >= i64::from(o_offset + o_size) {
                return Err(VmErr::InvalidCode);
            }

            let own_size = instr.size;
            base = target as u32;
            instr = code::decode(self.store.zone.bytes(base, o_offset + o_size - base))?;
            instr.size = own_size;
        }

        if self.trace.ip {
            match instr.payload {
                Some(p) => log::trace!(
                    "IP: #{}:{:#x}, type {}, {}[{}]",
                    ctx.code.idx(),
                    ip,
                    instr.kind as u8,
                    i64::from(base + p) - i64::from(offset),
                    instr.arg1
                ),
                None => log::trace!(
                    "IP: #{}:{:#x}, type {}, {} ({:#x})",
                    ctx.code.idx(),
                    ip,
                    instr.kind as u8,
                    instr.arg1,
                    instr.arg1
                ),
            }
        }

        let next_ip = ip + instr.size;
        if next_ip > size {
            return Err(VmErr::InvalidCode);
        }

        ctx.ip = next_ip;
        self.store.set_context(self.context, &ctx)?;

        Ok(Some(Fetched {
            instr,
            code: ctx.code,
            base,
        }))
    }

    fn payload(&self, f: &Fetched) -> VmResult<(u32, u32)> {
        let p = f.instr.payload.ok_or(VmErr::Internal)?;
        let len = u32::try_from(f.instr.arg1).map_err(|_| VmErr::InvalidCode)?;

        Ok((f.base + p, len))
    }

    fn dispatch(&mut self, f: Fetched) -> VmResult<()> {
        match f.instr.kind {
            SubType::Int | SubType::Bool => {
                let num = self.store.num_new(f.instr.arg1, f.instr.kind)?;
                self.push_new(num)
            }
            SubType::Nil => self.push(ObjId::NIL, false),
            SubType::String | SubType::Ref | SubType::Code => {
                let (offset, len) = self.payload(&f)?;
                let id = self.store.alias_new(offset, len, f.instr.kind, f.code)?;
                self.push_new(id)
            }
            SubType::Prim => self.run_prim(f.instr.arg1),
            SubType::Word => {
                let (offset, len) = self.payload(&f)?;
                let key = self.store.zone.bytes(offset, len).to_vec();
                let (_, val) = self.lookup_dict(&key).ok_or(VmErr::InvalidCode)?;
                self.exec_id(ObjId::NIL, val, false)
            }
            SubType::Get => {
                let (offset, len) = self.payload(&f)?;
                let key = self.store.zone.bytes(offset, len).to_vec();
                self.get_x(&key)
            }
            SubType::Set => {
                let (offset, len) = self.payload(&f)?;
                let key = self.store.alias_new(offset, len, SubType::Ref, f.code)?;
                let res = self.put_x(key);
                self.store.ref_dec(key);
                res
            }
            SubType::Comment => Ok(()),
            _ => Err(VmErr::InvalidCode),
        }
    }

    pub(crate) fn run_prim(&mut self, idx: i64) -> VmResult<()> {
        let (_, f) = usize::try_from(idx)
            .ok()
            .and_then(|idx| prim::PRIMS.get(idx))
            .ok_or(VmErr::InvalidCode)?;

        f(self)
    }

    /// Execute until the program ends, stops, fails or uses up the step
    /// budget
    pub fn run(&mut self) {
        let start = Instant::now();
        let mut last = start;

        self.stop = false;

        let limited = self.debug_steps != 0;
        let mut budget = self.debug_steps;

        while !limited || budget > 0 {
            let fetched = match self.fetch() {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    self.set_error(e);
                    break;
                }
            };

            if let Err(e) = self.dispatch(fetched) {
                self.set_error(e);
            }

            if let Some(e) = self.store.fault.take() {
                if self.error.is_none() {
                    self.set_error(e);
                }
            }

            self.show_trace();

            if self.trace.time {
                let now = Instant::now();
                log::trace!("TIME: {:?}", now - last);
                last = now;
            }

            if !self.wait_for_context.is_nil() && self.wait_for_context == self.context {
                self.wait_for_context = ObjId::NIL;
                break;
            }

            budget = budget.saturating_sub(1);
        }

        self.time += start.elapsed();
    }

    pub(crate) fn show_trace(&mut self) {
        if self.trace.context {
            log::trace!("{}", self.bt_dump(DumpStyle::default()));
        }

        if self.trace.pstack || cfg!(feature = "stkdbg") {
            log::trace!("{}", self.stack_dump(DumpStyle::default()));
        }
    }

    /// Search the dictionaries along the context chain, then the global
    /// one; yields the dictionary holding the key and the bound value
    pub fn lookup_dict(&self, key: &[u8]) -> Option<(ObjId, ObjId)> {
        let mut ctx = self.store.context(self.context);

        // a context chain is never longer than the object table
        for _ in 0..self.store.capacity() {
            let c = match ctx {
                Some(c) => c,
                None => break,
            };

            if !c.dict.is_nil() {
                if let Some(found) = self.store.hash_get(c.dict, key) {
                    return Some(found);
                }
            }

            ctx = self.store.context(c.parent);
        }

        self.store.hash_get(self.dict, key)
    }

    /// Run a primitive, call a code block or push a value. A non-nil
    /// `dict` gives a called function a fresh local dictionary chained to
    /// it. With `on_stack` the object on top of the stack is consumed.
    pub(crate) fn exec_id(&mut self, dict: ObjId, id: ObjId, on_stack: bool) -> VmResult<()> {
        if let Some(idx) = self.store.num_subtype_value(id, SubType::Prim) {
            if on_stack {
                self.pop_n(1)?;
            }
            return self.run_prim(idx);
        }

        let is_code = self
            .store
            .typed(id, BaseType::Mem)
            .map_or(false, |o| o.sub_type == SubType::Code);

        if is_code {
            let mut ctx = Context::new(SubType::CtxFunc);

            if !dict.is_nil() {
                ctx.dict = self.store.hash_new(0)?;
                if let Err(e) = self.store.hash_set_parent(ctx.dict, dict) {
                    self.store.ref_dec(ctx.dict);
                    return Err(e);
                }
            }

            if let Err(e) = self.enter(ctx, id) {
                self.store.ref_dec(ctx.dict);
                return Err(e);
            }

            if on_stack {
                self.pop_n(1)?;
            }

            return Ok(());
        }

        self.store.ref_inc(id);
        if on_stack {
            if let Err(e) = self.pop_n(1) {
                self.store.ref_dec(id);
                return Err(e);
            }
        }

        self.push_new(id)
    }

    /// Make a new context running `code` current. The template provides
    /// kind, loop state, dict and iterate; the dict reference moves into
    /// the context, code and iterate gain one.
    pub(crate) fn enter(&mut self, mut ctx: Context, code: ObjId) -> VmResult<()> {
        let id = self.store.context_new(ctx.kind)?;

        ctx.code = self.store.ref_inc(code);
        ctx.iterate = self.store.ref_inc(ctx.iterate);
        // the old context is now referenced by the new one
        ctx.parent = self.context;
        ctx.ip = 0;
        ctx.current_ip = 0;

        if let Err(e) = self.store.set_context(id, &ctx) {
            self.store.ref_dec(id);
            return Err(e);
        }

        self.context = id;

        Ok(())
    }

    pub(crate) fn assign_context(&mut self, id: ObjId) {
        self.store.ref_inc(id);
        let old = std::mem::replace(&mut self.context, id);
        self.store.ref_dec(old);
    }

    /// End of a code block: leave it or run it again
    pub(crate) fn code_end(&mut self) -> VmResult<()> {
        let id = self.context;
        let mut ctx = self
            .store
            .context(id)
            .ok_or(VmErr::InvalidInstruction)?;

        match ctx.kind {
            SubType::CtxBlock | SubType::CtxFunc => {
                self.assign_context(ctx.parent);
                Ok(())
            }

            SubType::CtxLoop => {
                ctx.ip = 0;
                self.store.set_context(id, &ctx)
            }

            SubType::CtxRepeat => {
                ctx.index = ctx.index.wrapping_sub(1);

                if ctx.index != 0 {
                    ctx.ip = 0;
                    self.store.set_context(id, &ctx)
                } else {
                    self.assign_context(ctx.parent);
                    Ok(())
                }
            }

            SubType::CtxFor => match ctx.index.checked_add(ctx.inc) {
                Some(index)
                    if (ctx.inc > 0 && index <= ctx.max) || (ctx.inc < 0 && index >= ctx.max) =>
                {
                    ctx.index = index;
                    ctx.ip = 0;
                    self.store.set_context(id, &ctx)?;

                    let num = self.store.num_new(index, SubType::Int)?;
                    self.push_new(num)
                }
                _ => {
                    self.assign_context(ctx.parent);
                    Ok(())
                }
            },

            SubType::CtxForall => {
                let mut idx = u32::try_from(ctx.index).unwrap_or(u32::MAX);
                let next = self.store.iterate(ctx.iterate, &mut idx)?;
                ctx.index = i64::from(idx);

                if next == Yield::Done {
                    self.assign_context(ctx.parent);
                    return Ok(());
                }

                ctx.ip = 0;
                self.store.set_context(id, &ctx)?;
                self.push_yield(next)
            }

            _ => Err(VmErr::InvalidInstruction),
        }
    }

    /// Push what an iteration step produced; the items come with their
    /// own references
    pub(crate) fn push_yield(&mut self, item: Yield) -> VmResult<()> {
        match item {
            Yield::Done => Ok(()),
            Yield::One(val) => self.push_new(val),
            Yield::Two(key, val) => {
                if let Err(e) = self.push_new(key) {
                    self.store.ref_dec(val);
                    return Err(e);
                }
                self.push_new(val)
            }
        }
    }

    /// Leave the innermost loop; blocks are skipped, functions are a
    /// barrier
    pub(crate) fn exit_loop(&mut self) -> VmResult<()> {
        let mut ctx = self.store.context(self.context).ok_or(VmErr::Internal)?;

        loop {
            match ctx.kind {
                SubType::CtxBlock => {}
                SubType::CtxFunc => return Err(VmErr::NoLoopContext),
                _ => {
                    self.assign_context(ctx.parent);
                    return Ok(());
                }
            }

            ctx = self
                .store
                .context(ctx.parent)
                .ok_or(VmErr::NoLoopContext)?;
        }
    }

    /// Leave the innermost function; without one the program stops
    pub(crate) fn return_func(&mut self) -> VmResult<()> {
        let mut ctx = self.store.context(self.context).ok_or(VmErr::Internal)?;

        loop {
            if ctx.kind == SubType::CtxFunc {
                self.assign_context(ctx.parent);
                return Ok(());
            }

            match self.store.context(ctx.parent) {
                Some(parent) => ctx = parent,
                None => {
                    self.stop = true;
                    self.assign_context(ObjId::NIL);
                    return Ok(());
                }
            }
        }
    }

    /// Look `key` up in the hash on top of the stack and execute the
    /// value with the hash as the function's outer dictionary
    pub(crate) fn get_x(&mut self, key: &[u8]) -> VmResult<()> {
        let [hash] = self.args([prim::ArgType::of(BaseType::Hash)])?;
        let (_, val) = self
            .store
            .hash_get(hash, key)
            .ok_or(VmErr::InvalidArguments)?;

        self.exec_id(hash, val, true)
    }

    /// `hash value` on the stack: bind `key` to value in hash
    pub(crate) fn put_x(&mut self, key: ObjId) -> VmResult<()> {
        let [hash, val] = self.args([
            prim::ArgType::of(BaseType::Hash).rw(),
            prim::ArgType::ANY.or_nil(),
        ])?;

        self.store
            .hash_set(hash, key, val, true)
            .map_err(|_| VmErr::InvalidHashKey)?;

        self.pop_n(2)
    }

    pub fn stack_len(&self) -> u32 {
        self.store.array_len(self.pstack).unwrap_or(0)
    }

    /// Stack contents, bottom first
    pub fn stack_items(&self) -> Vec<ObjId> {
        match self.store.get(self.pstack) {
            Some(obj) => self.store.array_items(obj),
            None => vec![],
        }
    }

    /// Stack element `depth` places below the top
    pub(crate) fn peek(&self, depth: u32) -> ObjId {
        self.store.array_get(self.pstack, -1 - i64::from(depth))
    }

    pub(crate) fn need(&self, n: u32) -> VmResult<()> {
        if self.stack_len() < n {
            Err(VmErr::StackUnderflow)
        } else {
            Ok(())
        }
    }

    pub(crate) fn push(&mut self, id: ObjId, do_ref: bool) -> VmResult<()> {
        self.store.array_push(self.pstack, id, do_ref)
    }

    /// Push an object whose reference the stack takes over; it is
    /// released if that fails
    pub(crate) fn push_new(&mut self, id: ObjId) -> VmResult<()> {
        let res = self.push(id, false);
        if res.is_err() {
            self.store.ref_dec(id);
        }
        res
    }

    pub(crate) fn pop_n(&mut self, n: u32) -> VmResult<()> {
        self.store.array_pop_n(self.pstack, n, true)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::vm::Assembler;

    #[test]
    fn hello() {
        let (vm, out) = run(Assembler::new().string(b"Hello!").op("show"));

        assert_eq!(None, vm.error);
        assert_eq!(b"Hello!", out.borrow().shown.as_slice());
        assert_eq!(0, vm.stack_len());
    }

    #[test]
    fn literals() {
        let (vm, _) = run(Assembler::new().int(-7).bool(true).nil().string(b"x"));

        let items = vm.stack_items();
        assert_eq!(4, items.len());
        assert_eq!(Some(-7), vm.store.num_subtype_value(items[0], SubType::Int));
        assert_eq!(Some(1), vm.store.num_subtype_value(items[1], SubType::Bool));
        assert!(items[2].is_nil());
        assert_eq!(b"x", vm.store.mem_bytes(items[3]));
        assert!(vm.store.get(items[3]).unwrap().flags.ro);
    }

    #[test]
    fn for_counts_up() {
        let (vm, _) = run(Assembler::new()
            .int(0)
            .int(1)
            .int(4)
            .begin()
            .end()
            .op("for"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![0, 1, 2, 3, 4], stack_ints(&vm));
    }

    #[test]
    fn for_counts_down() {
        let (vm, _) = run(Assembler::new()
            .int(0)
            .int(-2)
            .int(-5)
            .begin()
            .end()
            .op("for"));

        assert_eq!(vec![0, -2, -4], stack_ints(&vm));
    }

    #[test]
    fn for_empty_range() {
        let (vm, _) = run(Assembler::new()
            .int(5)
            .int(1)
            .int(4)
            .begin()
            .end()
            .op("for")
            .int(0)
            .int(0)
            .int(4)
            .begin()
            .end()
            .op("for"));

        assert_eq!(None, vm.error);
        assert_eq!(0, vm.stack_len());
    }

    #[test]
    fn repeat_runs_body() {
        let (vm, _) = run(Assembler::new()
            .int(0)
            .int(3)
            .begin()
            .int(1)
            .op("add")
            .end()
            .op("repeat")
            .int(0)
            .begin()
            .int(100)
            .end()
            .op("repeat"));

        assert_eq!(vec![3], stack_ints(&vm));
    }

    #[test]
    fn forall_in_order() {
        let (vm, _) = run(Assembler::new()
            .op("[")
            .int(10)
            .int(20)
            .int(30)
            .op("]")
            .begin()
            .end()
            .op("forall"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![10, 20, 30], stack_ints(&vm));
    }

    #[test]
    fn forall_over_hash() {
        let (vm, _) = run(Assembler::new()
            .op("(")
            .string(b"b")
            .int(2)
            .string(b"a")
            .int(1)
            .op(")")
            .begin()
            .op("exch")
            .op("pop")
            .end()
            .op("forall"));

        assert_eq!(vec![1, 2], stack_ints(&vm));
    }

    #[test]
    fn loop_and_exit() {
        let (vm, _) = run(Assembler::new()
            .int(0)
            .begin()
            .int(1)
            .op("add")
            .op("dup")
            .int(5)
            .op("eq")
            .begin()
            .op("exit")
            .end()
            .op("if")
            .end()
            .op("loop")
            .int(99));

        assert_eq!(None, vm.error);
        assert_eq!(vec![5, 99], stack_ints(&vm));
    }

    #[test]
    fn exit_needs_loop() {
        let (vm, _) = run(Assembler::new().op("exit"));
        assert_eq!(Some(VmErr::NoLoopContext), vm.error);

        // functions are a barrier
        let (vm, _) = run(Assembler::new()
            .begin()
            .begin()
            .op("exit")
            .end()
            .op("exec")
            .end()
            .op("loop"));
        assert_eq!(Some(VmErr::NoLoopContext), vm.error);
    }

    #[test]
    fn functions_and_return() {
        let (vm, _) = run(Assembler::new()
            .reference("f")
            .begin()
            .int(1)
            .op("return")
            .int(2)
            .end()
            .op("def")
            .word("f")
            .word("f")
            .int(3)
            .op("return")
            .int(4));

        assert_eq!(None, vm.error);
        assert_eq!(vec![1, 1, 3], stack_ints(&vm));
        assert!(vm.context.is_nil());
    }

    #[test]
    fn lookup_walks_contexts() {
        let (vm, _) = run(Assembler::new()
            .reference("x")
            .int(10)
            .op("def")
            .reference("f")
            .begin()
            .reference("y")
            .int(1)
            .op("ldef")
            .word("x")
            .end()
            .op("def")
            .word("f"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![10], stack_ints(&vm));
        assert!(vm.store.hash_get(vm.dict, b"y").is_none());
    }

    #[test]
    fn get_and_set_instructions() {
        let (vm, _) = run(Assembler::new()
            .op("(")
            .string(b"a")
            .int(5)
            .op(")")
            .reference("h")
            .op("exch")
            .op("def")
            .word("h")
            .int(6)
            .set("b")
            .word("h")
            .get("a")
            .word("h")
            .get("b"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![5, 6], stack_ints(&vm));
    }

    #[test]
    fn method_sees_its_hash() {
        let (vm, _) = run(Assembler::new()
            .op("(")
            .string(b"v")
            .int(42)
            .string(b"m")
            .begin()
            .word("v")
            .end()
            .op(")")
            .get("m"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![42], stack_ints(&vm));
    }

    #[test]
    fn unknown_word() {
        let (vm, _) = run(Assembler::new().int(1).word("nope").int(2));

        assert_eq!(Some(VmErr::InvalidCode), vm.error);
        assert_eq!(vec![1], stack_ints(&vm));
    }

    #[test]
    fn xref_reuses_instruction() {
        let mut asm = Assembler::new();
        asm.string(b"abc");
        let distance = asm.pos() - 8;
        asm.xref(distance as u32);

        let (vm, _) = run(&asm);

        assert_eq!(None, vm.error);
        let items = vm.stack_items();
        assert_eq!(2, items.len());
        assert_eq!(b"abc", vm.store.mem_bytes(items[1]));
    }

    #[test]
    fn bad_xref() {
        let (vm, _) = run(Assembler::new().xref(100));
        assert_eq!(Some(VmErr::InvalidCode), vm.error);
    }

    #[test]
    fn rejects_non_code() {
        let (mut vm, _) = vm();
        assert_eq!(Err(VmErr::InvalidCode), vm.load(b"no magic here").map(|_| ()));
    }

    #[test]
    fn step_budget() {
        let (mut vm, _) = vm();
        vm.load(&Assembler::new().int(1).int(2).int(3).finish())
            .unwrap();

        vm.debug_steps = 2;
        vm.run();
        // the magic comment is the first step
        assert_eq!(vec![1], stack_ints(&vm));

        vm.run();
        assert_eq!(vec![1, 2, 3], stack_ints(&vm));
        assert_eq!(None, vm.error);
    }

    #[test]
    fn program_frees_everything() {
        let (mut vm, _) = vm();
        let before = vm.store.objects().count();

        vm.load(&Assembler::new()
            .op("[")
            .int(1)
            .string(b"s")
            .op("]")
            .reference("a")
            .op("exch")
            .op("def")
            .op("pop")
            .finish())
            .unwrap();
        vm.run();
        assert_eq!(Some(VmErr::StackUnderflow), vm.error);

        // drop the definition, the stack and the root context
        vm.store.hash_del(vm.dict, b"a", true).unwrap();
        vm.load(&Assembler::new().finish()).unwrap();
        vm.run();

        // new stack and root context plus the program
        assert_eq!(before + 3, vm.store.objects().count());
        vm.store.check_heap().unwrap();
    }
}
