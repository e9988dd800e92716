// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/prim.rs

// Primitive words. The position of an entry in PRIMS is its primitive
// number in bytecode, so new entries go at the end.

// <>

use std::cmp::Ordering;

use super::context::Context;
use super::core::{BaseType, Data, ObjId, SubType, VmErr, VmResult};
use super::mem::mem_cmp;
use super::obj::Yield;
use super::{Console, Vm};

pub type PrimFn = fn(&mut Vm) -> VmResult<()>;

pub const PRIM_CODE_END: u32 = 1;
pub const PRIM_ARRAY_START: u32 = 2;
pub const PRIM_HASH_START: u32 = 4;

/// Longest debug command a program may issue
const MAX_DEBUGCMD_LEN: usize = 255;

/// Primitive number for a name
pub fn prim_index(name: &str) -> Option<u32> {
    PRIMS
        .iter()
        .position(|(n, _)| *n == name)
        .map(|idx| idx as u32)
}

/// Expected type of a stack argument
#[derive(Debug, Clone, Copy)]
pub struct ArgType {
    base: Option<BaseType>,
    rw: bool,
    nil: bool,
}

impl ArgType {
    pub const ANY: ArgType = ArgType {
        base: None,
        rw: false,
        nil: false,
    };

    pub const fn of(base: BaseType) -> Self {
        ArgType {
            base: Some(base),
            rw: false,
            nil: false,
        }
    }

    /// Must be writable
    pub const fn rw(self) -> Self {
        ArgType { rw: true, ..self }
    }

    pub const fn or_nil(self) -> Self {
        ArgType { nil: true, ..self }
    }
}

impl Vm {
    /// Check the top `N` stack elements against `types`, deepest first,
    /// without consuming them
    pub(crate) fn args<const N: usize>(&self, types: [ArgType; N]) -> VmResult<[ObjId; N]> {
        let n = N as u32;
        self.need(n)?;

        let mut ids = [ObjId::NIL; N];

        for (u, ty) in types.iter().enumerate() {
            let id = self.peek(n - 1 - u as u32);

            match self.store.get(id) {
                None if ty.nil => {}
                None => return Err(VmErr::InvalidArguments),
                Some(obj) => {
                    if ty.base.map_or(false, |b| b != obj.base_type) {
                        return Err(VmErr::InvalidArguments);
                    }
                    if ty.rw && obj.flags.ro {
                        return Err(VmErr::Readonly);
                    }
                }
            }

            ids[u] = id;
        }

        Ok(ids)
    }

    fn is_code_block(&self, id: ObjId) -> bool {
        self.store
            .typed(id, BaseType::Mem)
            .map_or(false, |o| o.sub_type == SubType::Code)
    }

    /// Condition value: nil is false, nums by value, anything else true
    fn is_true(&self, id: ObjId) -> bool {
        match self.store.get(id) {
            None => false,
            Some(_) => self.store.num_value(id).map_or(true, |v| v != 0),
        }
    }

    /// Replace the top `n` stack elements with `id`, whose reference
    /// moves to the stack
    fn replace_top(&mut self, n: u32, id: ObjId) -> VmResult<()> {
        if let Err(e) = self.pop_n(n) {
            self.store.ref_dec(id);
            return Err(e);
        }
        self.push_new(id)
    }

    fn drop_yield(&mut self, item: Yield) {
        match item {
            Yield::Done => {}
            Yield::One(val) => self.store.ref_dec(val),
            Yield::Two(key, val) => {
                self.store.ref_dec(key);
                self.store.ref_dec(val);
            }
        }
    }

    /// Stack index of the innermost collection marker
    fn find_marker(&self, marker: ObjId) -> Option<u32> {
        self.stack_items()
            .iter()
            .rposition(|&id| id == marker)
            .map(|pos| pos as u32)
    }

    fn array_end(&mut self) -> VmResult<()> {
        let start = self
            .find_marker(self.array_start)
            .ok_or(VmErr::NoArrayStart)?;
        let items = self.stack_items().split_off(start as usize + 1);
        let n = items.len() as u32;

        let arr = self.store.array_new(n)?;

        for (u, &item) in items.iter().enumerate() {
            if let Err(e) = self.store.array_set(arr, item, u as i64, true) {
                self.store.ref_dec(arr);
                return Err(e);
            }
        }

        self.replace_top(n + 1, arr)
    }

    fn hash_end(&mut self) -> VmResult<()> {
        let start = self
            .find_marker(self.hash_start)
            .ok_or(VmErr::NoHashStart)?;
        let items = self.stack_items().split_off(start as usize + 1);
        let n = items.len() as u32;

        let keys_ok = items
            .iter()
            .step_by(2)
            .all(|&key| self.store.typed(key, BaseType::Mem).is_some());
        if !keys_ok {
            return Err(VmErr::InvalidHashKey);
        }

        let hash = self.store.hash_new((n + 1) / 2)?;

        for pair in items.chunks(2) {
            let val = pair.get(1).copied().unwrap_or(ObjId::NIL);

            if let Err(e) = self.store.hash_set(hash, pair[0], val, true) {
                self.store.ref_dec(hash);
                return Err(e);
            }
        }

        self.replace_top(n + 1, hash)
    }

    /// Dictionary of a context, created on first use
    fn context_dict(&mut self, id: ObjId) -> VmResult<ObjId> {
        let mut ctx = self.store.context(id).ok_or(VmErr::Internal)?;

        if ctx.dict.is_nil() {
            ctx.dict = self.store.hash_new(0)?;
            self.store.set_context(id, &ctx)?;
        }

        Ok(ctx.dict)
    }

    fn root_context(&self) -> VmResult<ObjId> {
        let mut id = self.context;

        for _ in 0..self.store.capacity() {
            let ctx = self.store.context(id).ok_or(VmErr::Internal)?;
            if ctx.parent.is_nil() {
                return Ok(id);
            }
            id = ctx.parent;
        }

        Err(VmErr::Internal)
    }

    fn def_at(&mut self, scope: DefScope) -> VmResult<()> {
        self.need(2)?;
        let key = self.peek(1);
        let val = self.peek(0);

        let is_ref = self
            .store
            .typed(key, BaseType::Mem)
            .map_or(false, |o| o.sub_type == SubType::Ref);
        if !is_ref {
            return Err(VmErr::InvalidInstruction);
        }

        let existing = match scope {
            DefScope::Existing => {
                let name = self.store.mem_bytes(key).to_vec();
                self.lookup_dict(&name).map(|(dict, _)| dict)
            }
            _ => None,
        };

        let dict = match (existing, scope) {
            (Some(dict), _) => dict,
            (None, DefScope::Global) => {
                let root = self.root_context()?;
                self.context_dict(root)?
            }
            (None, _) => self.context_dict(self.context)?,
        };

        if self.store.get(dict).map_or(false, |o| o.flags.ro) {
            return Err(VmErr::Readonly);
        }

        self.store.hash_set(dict, key, val, true)?;

        self.pop_n(2)
    }

    fn if_else(&mut self, with_else: bool) -> VmResult<()> {
        let n = if with_else { 3 } else { 2 };
        self.need(n)?;

        let cond = self.peek(n - 1);
        let code = if with_else {
            let (code_true, code_false) = (self.peek(1), self.peek(0));
            if !self.is_code_block(code_true) || !self.is_code_block(code_false) {
                return Err(VmErr::InvalidCode);
            }
            if self.is_true(cond) {
                code_true
            } else {
                code_false
            }
        } else {
            let code = self.peek(0);
            if !self.is_code_block(code) {
                return Err(VmErr::InvalidCode);
            }
            if self.is_true(cond) {
                code
            } else {
                ObjId::NIL
            }
        };

        if !code.is_nil() {
            self.enter(Context::new(SubType::CtxBlock), code)?;
        }

        self.pop_n(n)
    }

    fn loop_forever(&mut self) -> VmResult<()> {
        self.need(1)?;
        let code = self.peek(0);

        if !self.is_code_block(code) {
            return Err(VmErr::InvalidCode);
        }

        self.enter(Context::new(SubType::CtxLoop), code)?;
        self.pop_n(1)
    }

    fn repeat(&mut self) -> VmResult<()> {
        self.need(2)?;
        let code = self.peek(0);
        let count = self
            .store
            .num_subtype_value(self.peek(1), SubType::Int)
            .ok_or(VmErr::InvalidCode)?;

        if !self.is_code_block(code) {
            return Err(VmErr::InvalidCode);
        }

        if count > 0 {
            let mut ctx = Context::new(SubType::CtxRepeat);
            ctx.index = count;
            self.enter(ctx, code)?;
        }

        self.pop_n(2)
    }

    fn for_range(&mut self) -> VmResult<()> {
        self.need(4)?;
        let code = self.peek(0);
        let int = |depth| self.store.num_subtype_value(self.peek(depth), SubType::Int);

        let (start, inc, max) = match (int(3), int(2), int(1)) {
            (Some(start), Some(inc), Some(max)) if self.is_code_block(code) => (start, inc, max),
            _ => return Err(VmErr::InvalidArguments),
        };

        if (inc > 0 && start <= max) || (inc < 0 && start >= max) {
            let mut ctx = Context::new(SubType::CtxFor);
            ctx.index = start;
            ctx.inc = inc;
            ctx.max = max;
            self.enter(ctx, code)?;

            // the start value stays as the first index
            self.pop_n(3)
        } else {
            self.pop_n(4)
        }
    }

    fn for_all(&mut self) -> VmResult<()> {
        self.need(2)?;
        let code = self.peek(0);
        let container = self.peek(1);

        let iterable = matches!(
            self.store.get(container).map(|o| o.base_type),
            Some(BaseType::Array | BaseType::Hash | BaseType::Mem)
        );
        if !iterable || !self.is_code_block(code) {
            return Err(VmErr::InvalidArguments);
        }

        let mut idx = 0;
        let first = self.store.iterate(container, &mut idx)?;

        if first == Yield::Done {
            return self.pop_n(2);
        }

        let mut ctx = Context::new(SubType::CtxForall);
        ctx.iterate = container;
        ctx.index = i64::from(idx);

        if let Err(e) = self.enter(ctx, code) {
            self.drop_yield(first);
            return Err(e);
        }

        if let Err(e) = self.pop_n(2) {
            self.drop_yield(first);
            return Err(e);
        }

        self.push_yield(first)
    }

    fn string(&mut self) -> VmResult<()> {
        let [arg] = self.args([ArgType::ANY])?;

        let id = match self.store.get(arg).map(|o| o.base_type) {
            Some(BaseType::Num) => {
                let size = self.store.num_value(arg).unwrap_or(0);
                let size = u32::try_from(size).map_err(|_| VmErr::InvalidRange)?;
                self.store.mem_new(size, SubType::String)?
            }
            Some(BaseType::Mem) => self.store.mem_dup(arg, 0)?,
            _ => return Err(VmErr::InvalidArguments),
        };

        self.replace_top(1, id)
    }

    fn get(&mut self) -> VmResult<()> {
        self.need(2)?;
        let container = self.peek(1);
        let index = self.peek(0);
        let pos = self.store.num_value(index);

        let val = match self.store.get(container).map(|o| o.base_type) {
            Some(BaseType::Array) => {
                let pos = pos.ok_or(VmErr::InvalidRange)?;
                let val = self.store.array_get(container, pos);
                self.store.ref_inc(val)
            }
            Some(BaseType::Hash) => {
                if self.store.typed(index, BaseType::Mem).is_none() {
                    return Err(VmErr::InvalidHashKey);
                }
                let key = self.store.mem_bytes(index).to_vec();
                match self.store.hash_get(container, &key) {
                    Some((_, val)) => self.store.ref_inc(val),
                    None => ObjId::NIL,
                }
            }
            Some(BaseType::Mem) => {
                let pos = pos.ok_or(VmErr::InvalidRange)?;
                match self.store.mem_get(container, pos) {
                    Some(byte) => self.store.num_new(i64::from(byte), SubType::Int)?,
                    None => ObjId::NIL,
                }
            }
            _ => return Err(VmErr::InvalidArguments),
        };

        self.replace_top(2, val)
    }

    /// `put` and `insert`: container index value
    fn store_at(&mut self, insert: bool) -> VmResult<()> {
        self.need(3)?;

        let range_err = |e: VmErr| match e {
            VmErr::NoMemory => e,
            _ => VmErr::InvalidRange,
        };

        match self.store.get(self.peek(2)).map(|o| o.base_type) {
            Some(BaseType::Array) => {
                let [arr, pos, val] = self.args([
                    ArgType::of(BaseType::Array).rw(),
                    ArgType::of(BaseType::Num),
                    ArgType::ANY.or_nil(),
                ])?;
                let pos = self.store.num_value(pos).unwrap_or(0);

                let res = if insert {
                    self.store.array_insert(arr, val, pos, true)
                } else {
                    self.store.array_set(arr, val, pos, true)
                };
                res.map_err(range_err)?;
            }
            Some(BaseType::Hash) => {
                let [hash, key, val] = self.args([
                    ArgType::of(BaseType::Hash).rw(),
                    ArgType::of(BaseType::Mem),
                    ArgType::ANY.or_nil(),
                ])?;

                self.store
                    .hash_set(hash, key, val, true)
                    .map_err(|e| match e {
                        VmErr::NoMemory => e,
                        _ => VmErr::InvalidHashKey,
                    })?;
            }
            Some(BaseType::Mem) => {
                let [mem, pos, val] = self.args([
                    ArgType::of(BaseType::Mem).rw(),
                    ArgType::of(BaseType::Num),
                    ArgType::of(BaseType::Num),
                ])?;
                let pos = self.store.num_value(pos).unwrap_or(0);
                let val = self.store.num_value(val).unwrap_or(0) as u8;

                let res = if insert {
                    self.store.mem_insert(mem, val, pos)
                } else {
                    self.store.mem_set(mem, val, pos)
                };
                res.map_err(range_err)?;
            }
            _ => return Err(VmErr::InvalidArguments),
        }

        self.pop_n(3)
    }

    fn delete(&mut self) -> VmResult<()> {
        self.need(2)?;
        let container = self.peek(1);
        let index = self.peek(0);

        let obj = *self
            .store
            .get(container)
            .ok_or(VmErr::InvalidArguments)?;
        if obj.flags.ro {
            return Err(VmErr::Readonly);
        }

        match obj.base_type {
            BaseType::Array => {
                let pos = self.store.num_value(index).ok_or(VmErr::InvalidRange)?;
                self.store.array_del(container, pos, true)?;
            }
            BaseType::Mem => {
                let pos = self.store.num_value(index).ok_or(VmErr::InvalidRange)?;
                self.store.mem_del(container, pos)?;
            }
            BaseType::Hash => {
                if self.store.typed(index, BaseType::Mem).is_none() {
                    return Err(VmErr::InvalidHashKey);
                }
                let key = self.store.mem_bytes(index).to_vec();
                self.store.hash_del(container, &key, true)?;
            }
            _ => return Err(VmErr::InvalidArguments),
        }

        self.pop_n(2)
    }

    fn length(&mut self) -> VmResult<()> {
        let [arg] = self.args([ArgType::ANY])?;

        let len = match self.store.get(arg).map(|o| o.base_type) {
            Some(BaseType::Array) => self.store.array_len(arg).unwrap_or(0),
            Some(BaseType::Hash) => self.store.hash_len(arg).unwrap_or(0),
            Some(BaseType::Mem) => self.store.mem_bytes(arg).len() as u32,
            _ => return Err(VmErr::InvalidArguments),
        };

        let num = self.store.num_new(i64::from(len), SubType::Int)?;
        self.replace_top(1, num)
    }

    /// Overwrite stack slots counted from the top without touching
    /// reference counts
    fn stack_write(&mut self, depth: u32, id: ObjId) -> VmResult<()> {
        self.store
            .array_set(self.pstack, id, -1 - i64::from(depth), false)
    }

    fn exch(&mut self) -> VmResult<()> {
        self.need(2)?;
        let (a, b) = (self.peek(1), self.peek(0));

        self.stack_write(1, b)?;
        self.stack_write(0, a)
    }

    fn rot(&mut self) -> VmResult<()> {
        self.need(3)?;
        let (a, b, c) = (self.peek(2), self.peek(1), self.peek(0));

        self.stack_write(2, b)?;
        self.stack_write(1, c)?;
        self.stack_write(0, a)
    }

    fn roll(&mut self) -> VmResult<()> {
        self.need(2)?;

        let len = self.store.num_value(self.peek(1));
        let ofs = self.store.num_value(self.peek(0));
        let (len, ofs) = match (len, ofs) {
            (Some(len), Some(ofs)) if len >= 0 => (len, ofs),
            _ => return Err(VmErr::InvalidArguments),
        };

        let size = i64::from(self.stack_len());
        if len + 2 > size {
            return Err(VmErr::StackUnderflow);
        }

        self.pop_n(2)?;

        if len == 0 {
            return Ok(());
        }

        let mut items = self.stack_items().split_off((size - 2 - len) as usize);
        items.rotate_right(ofs.rem_euclid(len) as usize);

        for (u, &id) in items.iter().rev().enumerate() {
            self.stack_write(u as u32, id)?;
        }

        Ok(())
    }

    fn index(&mut self) -> VmResult<()> {
        self.need(1)?;

        let idx = self
            .store
            .num_value(self.peek(0))
            .ok_or(VmErr::InvalidArguments)?;
        if idx < 0 {
            return Err(VmErr::InvalidRange);
        }
        if idx + 2 > i64::from(self.stack_len()) {
            return Err(VmErr::StackUnderflow);
        }

        let id = self.peek(idx as u32 + 1);
        self.pop_n(1)?;
        self.push(id, true)
    }

    fn exec(&mut self) -> VmResult<()> {
        self.need(1)?;
        let mut id = self.peek(0);

        let obj = match self.store.get(id) {
            Some(obj) => *obj,
            None if id.is_nil() => return self.exec_id(ObjId::NIL, id, true),
            None => return Ok(()),
        };

        if obj.base_type == BaseType::Mem && matches!(obj.sub_type, SubType::Word | SubType::Ref) {
            let name = self.store.mem_bytes(id).to_vec();
            id = self.lookup_dict(&name).map_or(ObjId::NIL, |(_, val)| val);
        }

        self.exec_id(ObjId::NIL, id, true)
    }

    fn add(&mut self, in_place: bool) -> VmResult<()> {
        let [arg1, id2] = self.args([ArgType::ANY, ArgType::ANY])?;

        // `add!` updates the value bound to a name
        let (target, id1) = if in_place {
            let is_ref = self
                .store
                .typed(arg1, BaseType::Mem)
                .map_or(false, |o| o.sub_type == SubType::Ref);
            if !is_ref {
                return Err(VmErr::InvalidArguments);
            }

            let name = self.store.mem_bytes(arg1).to_vec();
            let (dict, val) = self.lookup_dict(&name).ok_or(VmErr::InvalidHashKey)?;
            (Some(dict), val)
        } else {
            (None, arg1)
        };

        let obj1 = *self.store.get(id1).ok_or(VmErr::InvalidArguments)?;
        let obj2 = *self.store.get(id2).ok_or(VmErr::InvalidArguments)?;

        if obj1.base_type != obj2.base_type {
            return Err(VmErr::InvalidArguments);
        }
        if in_place && obj1.flags.ro {
            return Err(VmErr::Readonly);
        }

        let result = match obj1.base_type {
            BaseType::Num => {
                let v1 = obj1.value().unwrap_or(0);
                let v2 = obj2.value().unwrap_or(0);
                let mut sum = v1.wrapping_add(v2);
                if obj1.sub_type == SubType::Bool {
                    sum &= 1;
                }

                if in_place {
                    if let Some(obj) = self.store.get_mut(id1) {
                        obj.data = Data::Value(sum);
                    }
                    self.store.ref_inc(id1)
                } else {
                    self.store.num_new(sum, obj1.sub_type)?
                }
            }

            BaseType::Mem => {
                let tail = self.store.mem_bytes(id2).to_vec();

                let id = if in_place {
                    self.store.ref_inc(id1)
                } else {
                    self.store.mem_dup(id1, 0)?
                };

                if let Err(e) = self.mem_append(id, &tail) {
                    self.store.ref_dec(id);
                    return Err(e);
                }

                id
            }

            BaseType::Array => {
                let items2 = self.store.array_items(&obj2);

                let id = if in_place {
                    self.store.ref_inc(id1)
                } else {
                    let items1 = self.store.array_items(&obj1);
                    let len = items1.len() + items2.len() + 0x10;
                    let id = self.store.array_new(len as u32)?;
                    if let Err(e) = self.array_append(id, &items1) {
                        self.store.ref_dec(id);
                        return Err(e);
                    }
                    id
                };

                if let Err(e) = self.array_append(id, &items2) {
                    self.store.ref_dec(id);
                    return Err(e);
                }

                id
            }

            BaseType::Hash => {
                let pairs2 = self.store.hash_pairs(id2);

                let id = if in_place {
                    self.store.ref_inc(id1)
                } else {
                    let pairs1 = self.store.hash_pairs(id1);
                    let id = self
                        .store
                        .hash_new((pairs1.len() + pairs2.len()) as u32)?;
                    if let Err(e) = self.hash_append(id, &pairs1) {
                        self.store.ref_dec(id);
                        return Err(e);
                    }
                    id
                };

                if let Err(e) = self.hash_append(id, &pairs2) {
                    self.store.ref_dec(id);
                    return Err(e);
                }

                id
            }

            _ => return Err(VmErr::InvalidArguments),
        };

        match target {
            Some(dict) => {
                let res = self
                    .store
                    .hash_set(dict, arg1, result, true)
                    .and_then(|_| self.pop_n(2));
                self.store.ref_dec(result);
                res
            }
            None => self.replace_top(2, result),
        }
    }

    fn mem_append(&mut self, id: ObjId, tail: &[u8]) -> VmResult<()> {
        let (_, size) = self.store.span(id).ok_or(VmErr::Internal)?;
        let len = u32::try_from(tail.len()).map_err(|_| VmErr::NoMemory)?;
        let new_size = size.checked_add(len).ok_or(VmErr::NoMemory)?;

        self.store.realloc(id, new_size)?;

        let (offset, _) = self.store.span(id).ok_or(VmErr::Internal)?;
        self.store
            .zone
            .bytes_mut(offset + size, len)
            .copy_from_slice(tail);

        Ok(())
    }

    fn array_append(&mut self, id: ObjId, items: &[ObjId]) -> VmResult<()> {
        for &item in items {
            self.store.array_push(id, item, true)?;
        }

        Ok(())
    }

    fn hash_append(&mut self, id: ObjId, pairs: &[(ObjId, ObjId)]) -> VmResult<()> {
        for &(key, val) in pairs {
            self.store.hash_set(id, key, val, true)?;
        }

        Ok(())
    }

    fn binary_op(&mut self, op: Op) -> VmResult<()> {
        let [id1, id2] = self.args([ArgType::of(BaseType::Num), ArgType::of(BaseType::Num)])?;

        let sub1 = self.store.get(id1).map_or(SubType::Int, |o| o.sub_type);
        let sub2 = self.store.get(id2).map_or(SubType::Int, |o| o.sub_type);
        let sub_type = if sub1 == SubType::Bool && sub2 == SubType::Bool {
            SubType::Bool
        } else {
            SubType::Int
        };

        let v1 = self.store.num_value(id1).unwrap_or(0);
        let v2 = self.store.num_value(id2).unwrap_or(0);

        let result = do_op(op, sub_type, v1, v2)?;
        let num = self.store.num_new(result, sub_type)?;

        self.replace_top(2, num)
    }

    fn unary_op(&mut self, op: Op) -> VmResult<()> {
        let [id] = self.args([ArgType::of(BaseType::Num)])?;

        let sub_type = match self.store.get(id).map(|o| o.sub_type) {
            Some(SubType::Bool) => SubType::Bool,
            _ => SubType::Int,
        };
        let v = self.store.num_value(id).unwrap_or(0);

        let result = do_op(op, sub_type, v, 0)?;
        let num = self.store.num_new(result, sub_type)?;

        self.replace_top(1, num)
    }

    fn compare(&mut self, op: Cmp) -> VmResult<()> {
        let [id1, id2] = self.args([ArgType::ANY.or_nil(), ArgType::ANY.or_nil()])?;

        let ord = match (self.store.get(id1), self.store.get(id2)) {
            (Some(o1), Some(o2)) if o1.base_type != o2.base_type => {
                (o1.base_type as u8).cmp(&(o2.base_type as u8))
            }
            (Some(o1), Some(o2)) if o1.base_type == BaseType::Num => o1
                .sub_type
                .cmp(&o2.sub_type)
                .then(o1.value().cmp(&o2.value())),
            (Some(o1), Some(o2)) if o1.base_type == BaseType::Mem => o1
                .sub_type
                .cmp(&o2.sub_type)
                .then_with(|| mem_cmp(self.store.mem_bytes(id1), self.store.mem_bytes(id2))),
            _ => id1.0.cmp(&id2.0),
        };

        let (value, sub_type) = match op {
            Cmp::Eq => (ord == Ordering::Equal, SubType::Bool),
            Cmp::Ne => (ord != Ordering::Equal, SubType::Bool),
            Cmp::Gt => (ord == Ordering::Greater, SubType::Bool),
            Cmp::Ge => (ord != Ordering::Less, SubType::Bool),
            Cmp::Lt => (ord == Ordering::Less, SubType::Bool),
            Cmp::Le => (ord != Ordering::Greater, SubType::Bool),
            Cmp::Cmp => {
                let num = self.store.num_new(ord as i64, SubType::Int)?;
                return self.replace_top(2, num);
            }
        };

        let num = self.store.num_new(value as i64, sub_type)?;
        self.replace_top(2, num)
    }

    fn get_parent(&mut self) -> VmResult<()> {
        let [id] = self.args([ArgType::ANY])?;

        let parent = match self.store.get(id).map(|o| o.base_type) {
            Some(BaseType::Hash) => self.store.hash_parent(id),
            Some(BaseType::Context) => self.store.context(id).map_or(ObjId::NIL, |c| c.parent),
            _ => return Err(VmErr::InvalidArguments),
        };

        self.store.ref_inc(parent);
        self.replace_top(1, parent)
    }

    fn set_parent(&mut self) -> VmResult<()> {
        let [id, parent] = self.args([ArgType::ANY, ArgType::ANY.or_nil()])?;

        let obj = *self.store.get(id).ok_or(VmErr::InvalidArguments)?;
        let parent_type = self.store.get(parent).map(|o| o.base_type);

        match (obj.base_type, parent_type) {
            (BaseType::Hash, None | Some(BaseType::Hash)) => {
                if obj.flags.ro {
                    return Err(VmErr::Readonly);
                }
                self.store.hash_set_parent(id, parent)?;
            }
            (BaseType::Context, None | Some(BaseType::Context)) => {
                if obj.flags.ro {
                    return Err(VmErr::Readonly);
                }
                let mut ctx = self.store.context(id).ok_or(VmErr::Internal)?;
                let old = ctx.parent;
                ctx.parent = self.store.ref_inc(parent);
                self.store.set_context(id, &ctx)?;
                self.store.ref_dec(old);
            }
            _ => return Err(VmErr::InvalidArguments),
        }

        self.pop_n(2)
    }

    fn get_dict(&mut self) -> VmResult<()> {
        let ctx = self.store.context(self.context).ok_or(VmErr::Internal)?;
        self.push(ctx.dict, true)
    }

    fn set_dict(&mut self) -> VmResult<()> {
        let [dict] = self.args([ArgType::of(BaseType::Hash).or_nil()])?;

        let mut ctx = self.store.context(self.context).ok_or(VmErr::Internal)?;
        let old = ctx.dict;
        ctx.dict = self.store.ref_inc(dict);
        self.store.set_context(self.context, &ctx)?;
        self.store.ref_dec(old);

        self.pop_n(1)
    }

    fn show(&mut self) -> VmResult<()> {
        let [id] = self.args([ArgType::ANY])?;

        match self.store.get(id).map(|o| o.base_type) {
            Some(BaseType::Num) => {
                let c = self.store.num_value(id).unwrap_or(0);
                let c = u32::try_from(c).unwrap_or(0xfffd);
                let mut buf = Vec::with_capacity(6);
                utf8_encode(c, &mut buf);
                self.host.show(&buf);
            }
            Some(BaseType::Mem) => self.host.show(self.store.mem_bytes(id)),
            _ => return Err(VmErr::InvalidArguments),
        }

        self.pop_n(1)
    }

    fn run_code(&mut self) -> VmResult<()> {
        let [code] = self.args([ArgType::of(BaseType::Mem)])?;

        if !self.is_code(code) {
            return Err(VmErr::InvalidCode);
        }

        let mut ctx = self.store.context(self.context).ok_or(VmErr::Internal)?;
        let old = ctx.code;
        ctx.code = self.store.ref_inc(code);
        ctx.ip = 0;
        ctx.current_ip = 0;
        self.store.set_context(self.context, &ctx)?;
        self.store.ref_dec(old);

        self.pop_n(1)
    }

    fn read_file(&mut self) -> VmResult<()> {
        let [name] = self.args([ArgType::of(BaseType::Mem)])?;
        let name = self.store.mem_bytes(name).to_vec();

        let id = match self.host.read_file(&name) {
            Some(data) => {
                let len = u32::try_from(data.len()).map_err(|_| VmErr::NoMemory)?;
                let id = self.store.mem_new(len, SubType::Skip)?;
                if let Some((offset, _)) = self.store.span(id) {
                    self.store.zone.bytes_mut(offset, len).copy_from_slice(&data);
                }
                log::debug!(
                    "{}: {} bytes as {}",
                    String::from_utf8_lossy(&name),
                    len,
                    self.store.id2str(id)
                );
                id
            }
            None => ObjId::NIL,
        };

        self.replace_top(1, id)
    }

    fn debug_command(&mut self) -> VmResult<()> {
        let [arg] = self.args([ArgType::ANY])?;

        match self.store.get(arg).map(|o| o.base_type) {
            Some(BaseType::Num) => {
                self.console = if self.store.num_value(arg).unwrap_or(0) != 0 {
                    Console::Shown
                } else {
                    Console::Off
                };
                self.pop_n(1)
            }
            Some(BaseType::Mem) => {
                let bytes = self.store.mem_bytes(arg);
                let line = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_DEBUGCMD_LEN)])
                    .into_owned();

                self.pop_n(1)?;
                self.console = Console::Shown;
                self.debug_cmd(&line);

                Ok(())
            }
            _ => Err(VmErr::InvalidArguments),
        }
    }

    fn decode_utf8(&mut self) -> VmResult<()> {
        let [mem] = self.args([ArgType::of(BaseType::Mem)])?;

        let mut chars = vec![];
        let mut bytes = self.store.mem_bytes(mem);
        while !bytes.is_empty() {
            let (c, len) = utf8_decode(bytes);
            chars.push(c);
            bytes = &bytes[len..];
        }

        let arr = self.store.array_new(chars.len() as u32)?;
        for c in chars {
            let res = self.store.num_new(c, SubType::Int).and_then(|num| {
                let res = self.store.array_push(arr, num, false);
                if res.is_err() {
                    self.store.ref_dec(num);
                }
                res
            });

            if let Err(e) = res {
                self.store.ref_dec(arr);
                return Err(e);
            }
        }

        self.replace_top(1, arr)
    }

    fn encode_utf8(&mut self) -> VmResult<()> {
        let [arr] = self.args([ArgType::of(BaseType::Array)])?;

        let items = self
            .store
            .get(arr)
            .map_or(vec![], |obj| self.store.array_items(obj));

        let mut buf = vec![];
        for id in items {
            let c = self.store.num_value(id).ok_or(VmErr::InvalidData)?;

            if c <= 0 {
                // undecodable bytes come back as they were
                buf.push(c.wrapping_neg() as u8);
            } else {
                utf8_encode((c & 0x7fff_ffff) as u32, &mut buf);
            }
        }

        let len = u32::try_from(buf.len()).map_err(|_| VmErr::NoMemory)?;
        let id = self.store.mem_new(len, SubType::String)?;
        if let Some((offset, _)) = self.store.span(id) {
            self.store.zone.bytes_mut(offset, len).copy_from_slice(&buf);
        }

        self.replace_top(1, id)
    }

    /// `name hash parent class`: freeze `hash` into a class named
    /// `name`, deriving from `parent` (a class or nil)
    fn make_class(&mut self) -> VmResult<()> {
        let [name, hash, parent] = self.args([
            ArgType::of(BaseType::Mem),
            ArgType::of(BaseType::Hash),
            ArgType::of(BaseType::Hash).or_nil(),
        ])?;

        let is_ref = self
            .store
            .get(name)
            .map_or(false, |o| o.sub_type == SubType::Ref);
        let parent_ok = self.store.get(parent).map_or(true, |o| o.flags.class);
        if !is_ref || !parent_ok {
            return Err(VmErr::InvalidArguments);
        }

        let class_name = self.store.mem_dup(name, 0)?;
        if let Some(obj) = self.store.get_mut(class_name) {
            obj.sub_type = SubType::String;
            obj.flags.ro = true;
        }

        let key = match self.store.const_new(b"class", SubType::Ref) {
            Ok(key) => key,
            Err(e) => {
                self.store.ref_dec(class_name);
                return Err(e);
            }
        };

        if let Err(e) = self.store.hash_set(hash, key, class_name, false) {
            self.store.ref_dec(key);
            self.store.ref_dec(class_name);
            return Err(e);
        }

        self.store.hash_set_parent(hash, parent)?;

        if let Some(obj) = self.store.get_mut(hash) {
            obj.flags.ro = true;
            obj.flags.class = true;
        }

        self.pop_n(1)
    }

    /// `class vars new`: an instance dictionary holding a copy of `vars`
    /// and inheriting from `class`; its `init` runs right away
    fn new_instance(&mut self) -> VmResult<()> {
        let [class, vars] = self.args([ArgType::of(BaseType::Hash), ArgType::of(BaseType::Hash)])?;

        if !self.store.get(class).map_or(false, |o| o.flags.class) {
            return Err(VmErr::InvalidArguments);
        }

        let pairs = self.store.hash_pairs(vars);
        let dict = self.store.hash_new(pairs.len() as u32)?;

        let res = self
            .hash_append(dict, &pairs)
            .and_then(|_| self.store.hash_set_parent(dict, class));
        if let Err(e) = res {
            self.store.ref_dec(dict);
            return Err(e);
        }

        if let Some(obj) = self.store.get_mut(dict) {
            obj.flags.sticky = true;
            obj.flags.class = true;
        }

        self.replace_top(2, dict)?;

        match self.store.hash_get(dict, b"init") {
            Some((_, init)) => self.exec_id(dict, init, false),
            None => Ok(()),
        }
    }

    /// `format array format`: printf style formatting, see
    /// [`format_bytes`]
    fn format_string(&mut self) -> VmResult<()> {
        let [fmt, arr] = self.args([ArgType::of(BaseType::Mem), ArgType::of(BaseType::Array)])?;

        let items = self
            .store
            .get(arr)
            .map_or(vec![], |obj| self.store.array_items(obj));

        let args: Vec<FormatArg> = items
            .iter()
            .map(|&id| match self.store.get(id).map(|o| o.base_type) {
                Some(BaseType::Num) => FormatArg::Num(self.store.num_value(id).unwrap_or(0)),
                Some(BaseType::Mem) => FormatArg::Bytes(self.store.mem_bytes(id)),
                _ => FormatArg::Nil,
            })
            .collect();

        let text = format_bytes(self.store.mem_bytes(fmt), &args);

        let len = u32::try_from(text.len()).map_err(|_| VmErr::NoMemory)?;
        let id = self.store.mem_new(len, SubType::String)?;
        if let Some((offset, _)) = self.store.span(id) {
            self.store.zone.bytes_mut(offset, len).copy_from_slice(&text);
        }

        self.replace_top(2, id)
    }

    fn update_screen(&mut self) -> VmResult<()> {
        let args = self.args([ArgType::of(BaseType::Num); 4])?;

        let [x, y, w, h] = args.map(|id| {
            let val = self.store.num_value(id).unwrap_or(0);
            val.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
        });
        self.host.screen_update(x, y, w, h);

        self.pop_n(4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefScope {
    /// where the name is already bound, else local
    Existing,
    Local,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Neg,
    Abs,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Cmp,
}

/// Integer arithmetic; bools are single bit values
fn do_op(op: Op, sub_type: SubType, v1: i64, v2: i64) -> VmResult<i64> {
    let is_bool = sub_type == SubType::Bool;

    let result = match op {
        Op::Sub => v1.wrapping_sub(v2),
        Op::Mul if is_bool => v1 & v2,
        Op::Mul => v1.wrapping_mul(v2),
        Op::Div | Op::Mod if is_bool && v2 & 1 == 0 => return Err(VmErr::DivByZero),
        Op::Div if is_bool => v1,
        Op::Mod if is_bool => 0,
        Op::Div => v1.checked_div(v2).ok_or(VmErr::DivByZero)?,
        Op::Mod if v2 == 0 => return Err(VmErr::DivByZero),
        Op::Mod => v1.wrapping_rem(v2),
        Op::Min => v1.min(v2),
        Op::Max => v1.max(v2),
        Op::And => v1 & v2,
        Op::Or => v1 | v2,
        Op::Xor => v1 ^ v2,
        Op::Shl => u32::try_from(v2)
            .ok()
            .and_then(|s| v1.checked_shl(s))
            .unwrap_or(0),
        Op::Shr => u32::try_from(v2)
            .ok()
            .and_then(|s| v1.checked_shr(s))
            .unwrap_or(if v1 < 0 { -1 } else { 0 }),
        Op::Neg => v1.wrapping_neg(),
        Op::Abs => v1.wrapping_abs(),
        Op::Not => !v1,
    };

    Ok(if is_bool { result & 1 } else { result })
}

/// Decode one character. Bytes that don't start a valid sequence come
/// back negated and consume one byte.
pub fn utf8_decode(bytes: &[u8]) -> (i64, usize) {
    let lead = match bytes.first() {
        Some(&b) => b,
        None => return (0, 0),
    };

    if lead < 0x80 {
        return (i64::from(lead), 1);
    }
    if !(0xc0..0xfe).contains(&lead) {
        return (-i64::from(lead), 1);
    }

    let follow = (lead << 1).leading_ones() as usize;
    let mut c = i64::from(lead & (0x3f >> follow));

    for u in 1..=follow {
        match bytes.get(u) {
            Some(&b) if b & 0xc0 == 0x80 => c = (c << 6) | i64::from(b & 0x3f),
            _ => return (-i64::from(lead), 1),
        }
    }

    (c, follow + 1)
}

/// Append the up to six byte encoding of `c`
pub fn utf8_encode(c: u32, out: &mut Vec<u8>) {
    if c < 0x80 {
        out.push(c as u8);
        return;
    }

    let len = match c {
        0..=0x7ff => 2,
        0x800..=0xffff => 3,
        0x1_0000..=0x1f_ffff => 4,
        0x20_0000..=0x3ff_ffff => 5,
        _ => 6,
    };

    let lead = (0xff00_u32 >> len) as u8;
    out.push(lead | (c >> (6 * (len - 1))) as u8);

    for u in (0..len - 1).rev() {
        out.push(0x80 | ((c >> (6 * u)) & 0x3f) as u8);
    }
}

/// Argument of a `format` conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg<'a> {
    Num(i64),
    Bytes(&'a [u8]),
    Nil,
}

/// Widths and precisions beyond this are cut down
const MAX_FORMAT_WIDTH: usize = 0x1000;

/// One `%` conversion being parsed
#[derive(Debug, Default)]
struct FormatSpec {
    zero: bool,
    left: bool,
    with_precision: bool,
    width: usize,
    precision: usize,
    sign: Option<u8>,
}

impl FormatSpec {
    fn pad(&self, text: &[u8], out: &mut Vec<u8>) {
        let fill = if self.zero { b'0' } else { b' ' };
        let gap = self.width.saturating_sub(text.len());

        if !self.left {
            out.resize(out.len() + gap, fill);
        }
        out.extend_from_slice(text);
        if self.left {
            out.resize(out.len() + gap, fill);
        }
    }
}

/// Expand `%d`, `%u`, `%x` and `%s` conversions (with `-`, `+`, space,
/// `0`, width and `.precision` modifiers), each taking the next argument.
/// A missing or mistyped argument prints as `nil`; an unknown
/// conversion prints nothing but still takes its argument.
pub fn format_bytes(fmt: &[u8], args: &[FormatArg<'_>]) -> Vec<u8> {
    let mut out = vec![];
    let mut conv: Option<FormatSpec> = None;
    let mut arg_pos = 0;

    for &c in fmt {
        let s = match conv.as_mut() {
            Some(s) => s,
            None => {
                if c == b'%' {
                    conv = Some(FormatSpec::default());
                } else {
                    out.push(c);
                }
                continue;
            }
        };

        match c {
            b'%' => {
                out.push(b'%');
                conv = None;
                continue;
            }
            b' ' | b'+' => {
                s.sign = Some(c);
                continue;
            }
            b'-' => {
                s.left = true;
                continue;
            }
            b'.' => {
                s.with_precision = true;
                continue;
            }
            b'0'..=b'9' => {
                let digit = usize::from(c - b'0');
                if s.with_precision {
                    s.precision = (s.precision * 10 + digit).min(MAX_FORMAT_WIDTH);
                } else if c == b'0' && s.width == 0 {
                    s.zero = true;
                } else {
                    s.width = (s.width * 10 + digit).min(MAX_FORMAT_WIDTH);
                }
                continue;
            }
            b's' => {
                let mut text = match args.get(arg_pos) {
                    Some(FormatArg::Bytes(bytes)) => *bytes,
                    _ => &b"nil"[..],
                };
                if s.precision > 0 && s.precision < text.len() {
                    text = &text[..s.precision];
                }
                s.pad(text, &mut out);
            }
            b'd' | b'u' | b'x' => {
                let num = match args.get(arg_pos) {
                    Some(FormatArg::Num(val)) => Some(*val),
                    _ => None,
                };

                if s.precision > 0 {
                    // nil is never zero padded
                    s.zero |= num.is_some();
                    s.width = s.width.max(s.precision);
                }

                let text = match num {
                    Some(val) => {
                        let digits = match c {
                            b'd' => val.to_string(),
                            b'u' => (val as u64).to_string(),
                            _ => format!("{:x}", val as u64),
                        };
                        match s.sign {
                            Some(sign) if c == b'd' && val >= 0 => format!("{}{}", sign as char, digits),
                            _ => digits,
                        }
                    }
                    None => "nil".to_string(),
                };
                s.pad(text.as_bytes(), &mut out);
            }
            _ => {}
        }

        conv = None;
        arg_pos += 1;
    }

    out
}

macro_rules! prim_fn {
    ( const $array:ident; $vm:ident;
      $( $name:literal $body:block )+
    ) => {
        pub const $array: &[(&str, PrimFn)] =
            &[$(($name, |$vm: &mut Vm| -> VmResult<()> { $body })),+];
    };
}

prim_fn! {
    const PRIMS;
    vm;

    // blocks are assembled by the compiler
    "{" { Ok(()) }
    "}" { vm.code_end() }
    "[" {
        let marker = vm.array_start;
        vm.push(marker, true)
    }
    "]" { vm.array_end() }
    "(" {
        let marker = vm.hash_start;
        vm.push(marker, true)
    }
    ")" { vm.hash_end() }

    "def" { vm.def_at(DefScope::Existing) }
    "ldef" { vm.def_at(DefScope::Local) }
    "gdef" { vm.def_at(DefScope::Global) }

    "if" { vm.if_else(false) }
    "ifelse" { vm.if_else(true) }
    "loop" { vm.loop_forever() }
    "repeat" { vm.repeat() }
    "for" { vm.for_range() }
    "forall" { vm.for_all() }
    "exit" { vm.exit_loop() }
    "return" { vm.return_func() }

    "string" { vm.string() }
    "get" { vm.get() }
    "put" { vm.store_at(false) }
    "insert" { vm.store_at(true) }
    "delete" { vm.delete() }
    "length" { vm.length() }

    "dup" {
        vm.need(1)?;
        let id = vm.peek(0);
        vm.push(id, true)
    }
    "pop" {
        vm.need(1)?;
        vm.pop_n(1)
    }
    "exch" { vm.exch() }
    "rot" { vm.rot() }
    "roll" { vm.roll() }
    "over" {
        vm.need(2)?;
        let id = vm.peek(1);
        vm.push(id, true)
    }
    "index" { vm.index() }

    "exec" { vm.exec() }

    "add" { vm.add(false) }
    "add!" { vm.add(true) }
    "sub" { vm.binary_op(Op::Sub) }
    "mul" { vm.binary_op(Op::Mul) }
    "div" { vm.binary_op(Op::Div) }
    "mod" { vm.binary_op(Op::Mod) }
    "neg" { vm.unary_op(Op::Neg) }
    "abs" { vm.unary_op(Op::Abs) }
    "min" { vm.binary_op(Op::Min) }
    "max" { vm.binary_op(Op::Max) }
    "and" { vm.binary_op(Op::And) }
    "or" { vm.binary_op(Op::Or) }
    "xor" { vm.binary_op(Op::Xor) }
    "not" { vm.unary_op(Op::Not) }
    "shl" { vm.binary_op(Op::Shl) }
    "shr" { vm.binary_op(Op::Shr) }

    "eq" { vm.compare(Cmp::Eq) }
    "ne" { vm.compare(Cmp::Ne) }
    "gt" { vm.compare(Cmp::Gt) }
    "ge" { vm.compare(Cmp::Ge) }
    "lt" { vm.compare(Cmp::Lt) }
    "le" { vm.compare(Cmp::Le) }
    "cmp" { vm.compare(Cmp::Cmp) }

    "getparent" { vm.get_parent() }
    "setparent" { vm.set_parent() }
    "getdict" { vm.get_dict() }
    "setdict" { vm.set_dict() }
    "freeze" {
        let [id] = vm.args([ArgType::ANY.or_nil()])?;
        if let Some(obj) = vm.store.get_mut(id) {
            obj.flags.ro = true;
        }
        Ok(())
    }
    "sticky" {
        let [id] = vm.args([ArgType::of(BaseType::Hash)])?;
        if let Some(obj) = vm.store.get_mut(id) {
            obj.flags.sticky = true;
        }
        Ok(())
    }

    "show" { vm.show() }
    "run" { vm.run_code() }
    "readfile" { vm.read_file() }
    "debug" {
        vm.stop = true;
        vm.console = Console::Input;
        Ok(())
    }
    "debugcmd" { vm.debug_command() }

    "decodeutf8" { vm.decode_utf8() }
    "encodeutf8" { vm.encode_utf8() }

    "class" { vm.make_class() }
    "new" { vm.new_instance() }
    "format" { vm.format_string() }
    "updatescreen" { vm.update_screen() }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::vm::Assembler;

    fn ints(vm: &Vm, id: ObjId) -> Vec<i64> {
        let obj = vm.store.get(id).unwrap();
        vm.store
            .array_items(obj)
            .into_iter()
            .map(|id| vm.store.num_value(id).unwrap())
            .collect()
    }

    #[test]
    fn fixed_positions() {
        assert_eq!("}", PRIMS[PRIM_CODE_END as usize].0);
        assert_eq!("[", PRIMS[PRIM_ARRAY_START as usize].0);
        assert_eq!("(", PRIMS[PRIM_HASH_START as usize].0);
        assert_eq!(Some(PRIM_CODE_END), prim_index("}"));
        assert_eq!(None, prim_index("nope"));
    }

    #[test]
    fn arithmetic() {
        let (vm, _) = run(Assembler::new()
            .int(7)
            .int(3)
            .op("sub")
            .int(7)
            .int(3)
            .op("mod")
            .int(-7)
            .int(2)
            .op("div")
            .int(1)
            .int(70)
            .op("shl")
            .int(-8)
            .int(70)
            .op("shr")
            .int(5)
            .op("neg")
            .int(3)
            .op("not")
            .int(2)
            .int(9)
            .op("max")
            .int(i64::MAX)
            .int(1)
            .op("add"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![4, 1, -3, 0, -1, -5, -4, 9, i64::MIN], stack_ints(&vm));
    }

    #[test]
    fn div_by_zero_keeps_operands() {
        let (vm, _) = run(Assembler::new().int(1).int(0).op("div"));
        assert_eq!(Some(VmErr::DivByZero), vm.error);
        assert_eq!(vec![1, 0], stack_ints(&vm));

        let (vm, _) = run(Assembler::new().int(i64::MIN).int(-1).op("div"));
        assert_eq!(Some(VmErr::DivByZero), vm.error);

        let (vm, _) = run(Assembler::new().int(3).int(0).op("mod"));
        assert_eq!(Some(VmErr::DivByZero), vm.error);
    }

    #[test]
    fn bool_arithmetic() {
        let (vm, _) = run(Assembler::new()
            .bool(true)
            .bool(true)
            .op("add")
            .bool(true)
            .op("not")
            .bool(true)
            .bool(false)
            .op("div"));

        assert_eq!(Some(VmErr::DivByZero), vm.error);
        let items = vm.stack_items();
        assert_eq!(Some(0), vm.store.num_subtype_value(items[0], SubType::Bool));
        assert_eq!(Some(0), vm.store.num_subtype_value(items[1], SubType::Bool));
    }

    #[test]
    fn non_numbers_rejected() {
        let (vm, _) = run(Assembler::new().string(b"a").int(1).op("sub"));
        assert_eq!(Some(VmErr::InvalidArguments), vm.error);

        let (vm, _) = run(Assembler::new().int(1).op("sub"));
        assert_eq!(Some(VmErr::StackUnderflow), vm.error);
    }

    #[test]
    fn comparisons() {
        let (vm, _) = run(Assembler::new()
            .int(1)
            .int(2)
            .op("cmp")
            .string(b"b")
            .string(b"a")
            .op("cmp")
            .nil()
            .nil()
            .op("eq")
            .int(1)
            .bool(true)
            .op("eq")
            .int(3)
            .int(3)
            .op("ge")
            .string(b"x")
            .int(1)
            .op("gt"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![-1, 1, 1, 0, 1, 0], stack_ints(&vm));
    }

    #[test]
    fn utf8_round_trip() {
        let (vm, _) = run(Assembler::new()
            .string(b"a\xc3\xa9\xff\xe2\x82")
            .op("decodeutf8")
            .op("dup")
            .op("encodeutf8"));

        assert_eq!(None, vm.error);
        let items = vm.stack_items();
        assert_eq!(vec![0x61, 0xe9, -0xff, -0xe2, -0x82], ints(&vm, items[0]));
        assert_eq!(b"a\xc3\xa9\xff\xe2\x82", vm.store.mem_bytes(items[1]));
    }

    #[test]
    fn utf8_long_forms() {
        let mut buf = vec![];
        utf8_encode(0x7fff_ffff, &mut buf);
        assert_eq!(6, buf.len());
        assert_eq!((0x7fff_ffff, 6), utf8_decode(&buf));

        let mut buf = vec![];
        utf8_encode(0x1f600, &mut buf);
        assert_eq!("😀".as_bytes(), buf.as_slice());
    }

    #[test]
    fn encode_needs_numbers() {
        let (vm, _) = run(Assembler::new()
            .op("[")
            .string(b"x")
            .op("]")
            .op("encodeutf8"));

        assert_eq!(Some(VmErr::InvalidData), vm.error);
    }

    #[test]
    fn show_chars() {
        let (_, out) = run(Assembler::new().int(0x263a).op("show").int(-1).op("show"));
        assert_eq!("☺\u{fffd}".as_bytes(), out.borrow().shown.as_slice());
    }

    #[test]
    fn stack_shuffles() {
        let (vm, _) = run(Assembler::new()
            .int(1)
            .int(2)
            .int(3)
            .int(4)
            .int(3)
            .int(1)
            .op("roll"));
        assert_eq!(vec![1, 4, 2, 3], stack_ints(&vm));

        let (vm, _) = run(Assembler::new()
            .int(1)
            .int(2)
            .int(3)
            .int(3)
            .int(-1)
            .op("roll"));
        assert_eq!(vec![2, 3, 1], stack_ints(&vm));

        let (vm, _) = run(Assembler::new()
            .int(10)
            .int(20)
            .int(30)
            .int(2)
            .op("index")
            .op("rot")
            .op("over")
            .op("exch"));
        assert_eq!(vec![10, 30, 10, 10, 20], stack_ints(&vm));

        let (vm, _) = run(Assembler::new().int(1).int(5).int(0).op("roll"));
        assert_eq!(Some(VmErr::StackUnderflow), vm.error);
    }

    #[test]
    fn array_literals() {
        let (vm, _) = run(Assembler::new()
            .op("[")
            .int(1)
            .op("[")
            .int(2)
            .op("]")
            .int(3)
            .op("]")
            .op("dup")
            .op("length")
            .op("exch")
            .int(1)
            .op("get")
            .int(0)
            .op("get"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![3, 2], stack_ints(&vm));

        let (vm, _) = run(Assembler::new().int(1).op("]"));
        assert_eq!(Some(VmErr::NoArrayStart), vm.error);
    }

    #[test]
    fn hash_literals() {
        let (vm, _) = run(Assembler::new()
            .op("(")
            .string(b"b")
            .int(2)
            .string(b"a")
            .int(1)
            .string(b"c")
            .op(")"));

        assert_eq!(None, vm.error);
        let hash = vm.stack_items()[0];
        assert_eq!(Some(3), vm.store.hash_len(hash));
        assert_eq!(Some(ObjId::NIL), vm.store.hash_get(hash, b"c").map(|(_, v)| v));

        let (vm, _) = run(Assembler::new().op("(").int(1).int(2).op(")"));
        assert_eq!(Some(VmErr::InvalidHashKey), vm.error);

        let (vm, _) = run(Assembler::new().op(")"));
        assert_eq!(Some(VmErr::NoHashStart), vm.error);
    }

    #[test]
    fn container_updates() {
        let (vm, _) = run(Assembler::new()
            .op("[")
            .int(1)
            .int(2)
            .int(3)
            .op("]")
            .op("dup")
            .int(0)
            .int(9)
            .op("put")
            .op("dup")
            .int(1)
            .op("delete")
            .op("dup")
            .int(1)
            .op("get")
            .op("exch")
            .int(0)
            .op("get"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![3, 9], stack_ints(&vm));

        let (vm, _) = run(Assembler::new()
            .string(b"ac")
            .op("string")
            .op("dup")
            .int(1)
            .int(b'b' as i64)
            .op("insert")
            .op("dup")
            .int(-1)
            .op("get")
            .op("exch")
            .int(9)
            .op("get"));

        assert_eq!(None, vm.error);
        let items = vm.stack_items();
        assert_eq!(Some(b'c' as i64), vm.store.num_value(items[0]));
        assert!(items[1].is_nil());
    }

    #[test]
    fn readonly_objects() {
        let (vm, _) = run(Assembler::new().string(b"abc").int(0).int(65).op("put"));
        assert_eq!(Some(VmErr::Readonly), vm.error);

        let (vm, _) = run(Assembler::new()
            .op("[")
            .op("]")
            .op("freeze")
            .int(0)
            .int(1)
            .op("put"));
        assert_eq!(Some(VmErr::Readonly), vm.error);
    }

    #[test]
    fn strings() {
        let (vm, _) = run(Assembler::new().int(3).op("string"));
        let id = vm.stack_items()[0];
        assert_eq!(&[0, 0, 0], vm.store.mem_bytes(id));
        assert!(!vm.store.get(id).unwrap().flags.ro);

        let (vm, _) = run(Assembler::new().int(-1).op("string"));
        assert_eq!(Some(VmErr::InvalidRange), vm.error);
    }

    #[test]
    fn concatenation() {
        let (vm, _) = run(Assembler::new()
            .string(b"ab")
            .string(b"cd")
            .op("add")
            .op("[")
            .int(1)
            .op("]")
            .op("[")
            .int(2)
            .op("]")
            .op("add"));

        assert_eq!(None, vm.error);
        let items = vm.stack_items();
        assert_eq!(b"abcd", vm.store.mem_bytes(items[0]));
        assert_eq!(vec![1, 2], ints(&vm, items[1]));

        let (vm, _) = run(Assembler::new().string(b"a").int(1).op("add"));
        assert_eq!(Some(VmErr::InvalidArguments), vm.error);
    }

    #[test]
    fn add_in_place() {
        let (vm, _) = run(Assembler::new()
            .reference("x")
            .int(1)
            .op("def")
            .reference("x")
            .int(5)
            .op("add!")
            .word("x")
            .reference("s")
            .string(b"ab")
            .op("string")
            .op("def")
            .reference("s")
            .string(b"cd")
            .op("add!")
            .word("s"));

        assert_eq!(None, vm.error);
        let items = vm.stack_items();
        assert_eq!(Some(6), vm.store.num_value(items[0]));
        assert_eq!(b"abcd", vm.store.mem_bytes(items[1]));

        let (vm, _) = run(Assembler::new().reference("nope").int(1).op("add!"));
        assert_eq!(Some(VmErr::InvalidHashKey), vm.error);
    }

    #[test]
    fn conditionals() {
        let (vm, _) = run(Assembler::new()
            .bool(true)
            .begin()
            .int(1)
            .end()
            .op("if")
            .bool(false)
            .begin()
            .int(2)
            .end()
            .op("if")
            .int(0)
            .begin()
            .int(3)
            .end()
            .begin()
            .int(4)
            .end()
            .op("ifelse"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![1, 4], stack_ints(&vm));

        let (vm, _) = run(Assembler::new().bool(true).int(1).op("if"));
        assert_eq!(Some(VmErr::InvalidCode), vm.error);
    }

    #[test]
    fn definition_scopes() {
        let (vm, _) = run(Assembler::new()
            .reference("v")
            .int(1)
            .op("def")
            .reference("f")
            .begin()
            .reference("v")
            .int(2)
            .op("def")
            .reference("g")
            .int(7)
            .op("gdef")
            .reference("l")
            .int(8)
            .op("ldef")
            .end()
            .op("def")
            .word("f")
            .word("v")
            .word("g"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![2, 7], stack_ints(&vm));
        assert!(vm.store.hash_get(vm.dict, b"l").is_none());

        let (vm, _) = run(Assembler::new().string(b"k").int(1).op("def"));
        assert_eq!(Some(VmErr::InvalidInstruction), vm.error);
    }

    #[test]
    fn exec_values() {
        let (vm, _) = run(Assembler::new()
            .reference("x")
            .int(3)
            .op("def")
            .reference("x")
            .op("exec")
            .begin()
            .int(5)
            .end()
            .op("exec")
            .int(6)
            .op("exec"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![3, 5, 6], stack_ints(&vm));
    }

    #[test]
    fn parents_and_dicts() {
        let (vm, _) = run(Assembler::new()
            .reference("p")
            .op("(")
            .string(b"a")
            .int(1)
            .op(")")
            .op("def")
            .reference("c")
            .op("(")
            .op(")")
            .op("def")
            .word("c")
            .word("p")
            .op("setparent")
            .word("c")
            .get("a")
            .word("c")
            .op("getparent")
            .word("p")
            .op("eq"));

        assert_eq!(None, vm.error);
        assert_eq!(vec![1, 1], stack_ints(&vm));

        let (vm, _) = run(Assembler::new().op("getdict"));
        assert_eq!(vec![vm.dict], vm.stack_items());
    }

    #[test]
    fn read_files() {
        let (mut vm, out) = vm();
        out.borrow_mut()
            .files
            .push((b"f.txt".to_vec(), b"data".to_vec()));

        vm.load(&Assembler::new()
            .string(b"f.txt")
            .op("readfile")
            .string(b"nope")
            .op("readfile")
            .finish())
            .unwrap();
        vm.run();

        assert_eq!(None, vm.error);
        let items = vm.stack_items();
        assert_eq!(b"data", vm.store.mem_bytes(items[0]));
        assert!(items[1].is_nil());
    }

    #[test]
    fn debug_stops() {
        let (mut vm, _) = run(Assembler::new().op("debug").int(1));

        assert!(vm.stop);
        assert_eq!(Console::Input, vm.console);
        assert_eq!(0, vm.stack_len());

        vm.run();
        assert_eq!(vec![1], stack_ints(&vm));

        let (vm, _) = run(Assembler::new().int(0).op("debugcmd"));
        assert_eq!(Console::Off, vm.console);
    }

    fn class_foo(asm: &mut Assembler) -> &mut Assembler {
        asm.reference("Foo")
            .op("(")
            .string(b"x")
            .int(0)
            .string(b"init")
            .begin()
            .reference("x")
            .word("x")
            .int(1)
            .op("add")
            .op("def")
            .end()
            .string(b"get")
            .begin()
            .word("x")
            .end()
            .op(")")
            .nil()
            .op("class")
            .op("def")
    }

    #[test]
    fn classes_and_instances() {
        let mut asm = Assembler::new();
        class_foo(&mut asm)
            .reference("foo")
            .word("Foo")
            .op("(")
            .string(b"x")
            .int(41)
            .op(")")
            .op("new")
            .op("def")
            .word("foo")
            .get("get")
            .word("foo")
            .get("class");

        let (vm, _) = run(&asm);

        assert_eq!(None, vm.error);
        let items = vm.stack_items();
        assert_eq!(Some(42), vm.store.num_value(items[0]));
        assert_eq!(b"Foo", vm.store.mem_bytes(items[1]));

        let (_, class) = vm.lookup_dict(b"Foo").unwrap();
        let flags = vm.store.get(class).unwrap().flags;
        assert!(flags.class && flags.ro);

        let (_, foo) = vm.lookup_dict(b"foo").unwrap();
        let flags = vm.store.get(foo).unwrap().flags;
        assert!(flags.class && flags.sticky && !flags.ro);
        assert_eq!(class, vm.store.hash_parent(foo));
    }

    #[test]
    fn derived_classes() {
        let mut asm = Assembler::new();
        class_foo(&mut asm)
            .reference("Bar")
            .op("(")
            .string(b"baz")
            .begin()
            .int(5)
            .end()
            .op(")")
            .word("Foo")
            .op("class")
            .op("def")
            .reference("b")
            .word("Bar")
            .op("(")
            .string(b"x")
            .int(9)
            .op(")")
            .op("new")
            .op("def")
            .word("b")
            .get("get")
            .word("b")
            .get("baz")
            .word("b")
            .get("class");

        let (vm, _) = run(&asm);

        assert_eq!(None, vm.error);
        let items = vm.stack_items();
        assert_eq!(Some(10), vm.store.num_value(items[0]));
        assert_eq!(Some(5), vm.store.num_value(items[1]));
        assert_eq!(b"Bar", vm.store.mem_bytes(items[2]));
    }

    #[test]
    fn classes_need_classes() {
        // a plain hash is no parent class
        let (vm, _) = run(Assembler::new()
            .reference("C")
            .op("(")
            .op(")")
            .op("(")
            .op(")")
            .op("class"));
        assert_eq!(Some(VmErr::InvalidArguments), vm.error);

        let (vm, _) = run(Assembler::new()
            .string(b"C")
            .op("(")
            .op(")")
            .nil()
            .op("class"));
        assert_eq!(Some(VmErr::InvalidArguments), vm.error);

        let (vm, _) = run(Assembler::new()
            .op("(")
            .op(")")
            .op("(")
            .op(")")
            .op("new"));
        assert_eq!(Some(VmErr::InvalidArguments), vm.error);
        assert_eq!(2, vm.stack_len());
    }

    fn fmt(text: &str, args: &[FormatArg]) -> String {
        String::from_utf8(format_bytes(text.as_bytes(), args)).unwrap()
    }

    #[test]
    fn format_conversions() {
        use FormatArg::*;

        assert_eq!("int = 200", fmt("int = %d", &[Num(200)]));
        assert_eq!("string = foo", fmt("string = %s", &[Bytes(b"foo")]));
        assert_eq!("bar: 33", fmt("%s: %d", &[Bytes(b"bar"), Num(33)]));
        assert_eq!("ff 18446744073709551615", fmt("%x %u", &[Num(255), Num(-1)]));
        assert_eq!("-12", fmt("%d", &[Num(-12)]));
    }

    #[test]
    fn format_modifiers() {
        use FormatArg::*;

        assert_eq!(
            "    1|2    |00003",
            fmt("%5d|%-5d|%05d", &[Num(1), Num(2), Num(3)])
        );
        assert_eq!("+5  5 -5", fmt("%+d % d %+d", &[Num(5), Num(5), Num(-5)]));
        // signs only apply to %d
        assert_eq!("ff", fmt("%+x", &[Num(255)]));
        assert_eq!("007", fmt("%.3d", &[Num(7)]));
        assert_eq!("ab|  abc", fmt("%.2s|%5s", &[Bytes(b"abcdef"), Bytes(b"abc")]));
        assert_eq!("x   |", fmt("%-4s|", &[Bytes(b"x")]));
    }

    #[test]
    fn format_odd_input() {
        use FormatArg::*;

        assert_eq!("nil nil", fmt("%d %s", &[]));
        assert_eq!("nil|nil", fmt("%s|%d", &[Num(1), Bytes(b"1")]));
        assert_eq!("  nil", fmt("%.5d", &[Nil]));
        assert_eq!("100% 1", fmt("100%% %d", &[Num(1)]));
        // unknown conversions swallow their argument
        assert_eq!("2", fmt("%q%d", &[Num(1), Num(2)]));
        assert_eq!("", fmt("%", &[Num(1)]));
    }

    #[test]
    fn format_primitive() {
        let (vm, _) = run(Assembler::new()
            .string(b"%s=%03d")
            .op("[")
            .string(b"a")
            .int(7)
            .op("]")
            .op("format"));

        assert_eq!(None, vm.error);
        let id = vm.stack_items()[0];
        assert_eq!(b"a=007", vm.store.mem_bytes(id));
        assert!(!vm.store.get(id).unwrap().flags.ro);

        let (vm, _) = run(Assembler::new().string(b"%d").int(1).op("format"));
        assert_eq!(Some(VmErr::InvalidArguments), vm.error);
    }

    #[test]
    fn screen_updates_reach_the_host() {
        let (vm, out) = run(Assembler::new()
            .int(10)
            .int(20)
            .int(300)
            .int(400)
            .op("updatescreen"));

        assert_eq!(None, vm.error);
        assert_eq!(0, vm.stack_len());
        assert_eq!(vec![(10, 20, 300, 400)], out.borrow().updates);
    }
}
