// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/array.rs

// Array objects: a size, a capacity and a vector of ids stored as one
// arena payload. The data stack is an array too.

// <>

use super::core::{BaseType, Obj, ObjId, VmErr, VmResult};
use super::obj::{DumpStyle, Store, Yield};

const ARRAY_HEAD: u32 = 8;

/// Payload bytes needed for an array of capacity `max`
pub fn array_payload_size(max: u32) -> Option<u32> {
    max.checked_mul(4)?.checked_add(ARRAY_HEAD)
}

/// Turn a possibly negative (counted from the end) position into an index
pub(crate) fn resolve_pos(pos: i64, size: u32) -> VmResult<u32> {
    let pos = if pos < 0 { size as i64 + pos } else { pos };

    if pos < 0 || pos > i32::MAX as i64 {
        return Err(VmErr::InvalidRange);
    }

    Ok(pos as u32)
}

fn grow_to(pos: u32) -> u32 {
    pos.saturating_add(pos >> 3).saturating_add(0x10)
}

/// Decoded array header
#[derive(Clone, Copy)]
struct Head {
    offset: u32,
    size: u32,
    max: u32,
}

impl Head {
    fn elem(&self, idx: u32) -> u32 {
        self.offset + ARRAY_HEAD + idx * 4
    }
}

impl Store {
    /// New empty array; a capacity of 0 picks the default
    pub fn array_new(&mut self, max: u32) -> VmResult<ObjId> {
        let max = if max == 0 { 0x10 } else { max };
        let size = array_payload_size(max).ok_or(VmErr::NoMemory)?;

        let id = self.alloc_obj(BaseType::Array, size)?;
        if let Some((offset, _)) = self.span(id) {
            self.zone.write_u32(offset + 4, max);
        }

        Ok(id)
    }

    fn array_head(&self, obj: &Obj) -> Option<Head> {
        if obj.base_type != BaseType::Array {
            return None;
        }

        let (offset, len) = obj.span()?;
        let size = self.zone.read_u32(offset);
        let max = self.zone.read_u32(offset + 4);

        (array_payload_size(max) == Some(len) && size <= max).then_some(Head { offset, size, max })
    }

    fn array_head_of(&self, id: ObjId) -> Option<Head> {
        self.array_head(self.typed(id, BaseType::Array)?)
    }

    fn array_head_rw(&self, id: ObjId) -> VmResult<Head> {
        let obj = self
            .typed_rw(id, BaseType::Array)?
            .ok_or(VmErr::InvalidArguments)?;

        self.array_head(obj).ok_or(VmErr::Internal)
    }

    /// Number of elements
    pub fn array_len(&self, id: ObjId) -> Option<u32> {
        self.array_head_of(id).map(|h| h.size)
    }

    pub(crate) fn array_items(&self, obj: &Obj) -> Vec<ObjId> {
        match self.array_head(obj) {
            Some(h) => (0..h.size)
                .map(|u| ObjId(self.zone.read_u32(h.elem(u))))
                .collect(),
            None => vec![],
        }
    }

    /// Element at `pos`; nil when out of range
    pub fn array_get(&self, id: ObjId, pos: i64) -> ObjId {
        let head = match self.array_head_of(id) {
            Some(h) => h,
            None => return ObjId::NIL,
        };

        match resolve_pos(pos, head.size) {
            Ok(pos) if pos < head.size => ObjId(self.zone.read_u32(head.elem(pos))),
            _ => ObjId::NIL,
        }
    }

    fn array_grow(&mut self, id: ObjId, max: u32) -> VmResult<Head> {
        let size = array_payload_size(max).ok_or(VmErr::NoMemory)?;
        self.realloc(id, size)?;

        let (offset, _) = self.span(id).ok_or(VmErr::Internal)?;
        self.zone.write_u32(offset + 4, max);

        self.array_head_of(id).ok_or(VmErr::Internal)
    }

    /// Store `item` at `pos`, growing the array as needed; with
    /// `do_ref` the array takes a reference and drops the old element's
    pub fn array_set(&mut self, id: ObjId, item: ObjId, pos: i64, do_ref: bool) -> VmResult<()> {
        let mut head = self.array_head_rw(id)?;
        let pos = resolve_pos(pos, head.size)?;

        if pos >= head.max {
            head = self.array_grow(id, grow_to(pos))?;
        }

        if pos >= head.size {
            for u in head.size..=pos {
                self.zone.write_u32(head.elem(u), 0);
            }
            self.zone.write_u32(head.offset, pos + 1);
        }

        self.array_store(head, pos, item, do_ref);

        Ok(())
    }

    fn array_store(&mut self, head: Head, pos: u32, item: ObjId, do_ref: bool) {
        let old = ObjId(self.zone.read_u32(head.elem(pos)));
        self.zone.write_u32(head.elem(pos), item.0);

        if do_ref {
            self.ref_inc(item);
            self.ref_dec(old);
        }
    }

    /// Insert `item` before `pos`, shifting later elements up
    pub fn array_insert(
        &mut self,
        id: ObjId,
        item: ObjId,
        pos: i64,
        do_ref: bool,
    ) -> VmResult<()> {
        let mut head = self.array_head_rw(id)?;
        let pos = resolve_pos(pos, head.size)?;

        let max = if pos >= head.max {
            grow_to(pos)
        } else if head.size + 1 > head.max {
            grow_to(head.max)
        } else {
            head.max
        };

        if max > head.max {
            head = self.array_grow(id, max)?;
        }

        if pos >= head.size {
            for u in head.size..=pos {
                self.zone.write_u32(head.elem(u), 0);
            }
            self.zone.write_u32(head.offset, pos + 1);
        } else {
            self.zone
                .copy(head.elem(pos), head.elem(pos + 1), (head.size - pos) * 4);
            self.zone.write_u32(head.offset, head.size + 1);
            self.zone.write_u32(head.elem(pos), 0);
        }

        self.array_store(head, pos, item, do_ref);

        Ok(())
    }

    /// Remove the element at `pos`; out of range positions are ignored
    pub fn array_del(&mut self, id: ObjId, pos: i64, do_ref: bool) -> VmResult<()> {
        let head = self.array_head_rw(id)?;

        let pos = match resolve_pos(pos, head.size) {
            Ok(pos) if pos < head.size => pos,
            _ => return Ok(()),
        };

        let old = ObjId(self.zone.read_u32(head.elem(pos)));
        let size = head.size - 1;

        if size > pos {
            self.zone
                .copy(head.elem(pos + 1), head.elem(pos), (size - pos) * 4);
        }
        self.zone.write_u32(head.elem(size), 0);
        self.zone.write_u32(head.offset, size);

        if do_ref {
            self.ref_dec(old);
        }

        Ok(())
    }

    pub fn array_push(&mut self, id: ObjId, item: ObjId, do_ref: bool) -> VmResult<()> {
        let size = self.array_len(id).ok_or(VmErr::InvalidArguments)?;
        self.array_set(id, item, size as i64, do_ref)
    }

    /// Remove and return the last element; nil when empty
    pub fn array_pop(&mut self, id: ObjId, do_ref: bool) -> VmResult<ObjId> {
        let head = self.array_head_rw(id)?;

        if head.size == 0 {
            return Ok(ObjId::NIL);
        }

        let size = head.size - 1;
        let item = ObjId(self.zone.read_u32(head.elem(size)));
        self.zone.write_u32(head.elem(size), 0);
        self.zone.write_u32(head.offset, size);

        if do_ref {
            self.ref_dec(item);
        }

        Ok(item)
    }

    pub fn array_pop_n(&mut self, id: ObjId, n: u32, do_ref: bool) -> VmResult<()> {
        for _ in 0..n {
            self.array_pop(id, do_ref)?;
        }

        Ok(())
    }

    /// Append `item` unless it is already present
    pub fn array_add(&mut self, id: ObjId, item: ObjId, do_ref: bool) -> VmResult<()> {
        let obj = *self
            .typed(id, BaseType::Array)
            .ok_or(VmErr::InvalidArguments)?;

        if self.array_items(&obj).contains(&item) {
            return Ok(());
        }

        self.array_push(id, item, do_ref)
    }

    pub(crate) fn array_iterate(&mut self, obj: &Obj, idx: &mut u32) -> VmResult<Yield> {
        let head = self.array_head(obj).ok_or(VmErr::Internal)?;

        if *idx >= head.size {
            return Ok(Yield::Done);
        }

        let item = ObjId(self.zone.read_u32(head.elem(*idx)));
        self.ref_inc(item);
        *idx += 1;

        Ok(Yield::One(item))
    }

    pub(crate) fn array_dump(&self, obj: &Obj, style: DumpStyle, out: &mut String) -> bool {
        let head = match self.array_head(obj) {
            Some(h) => h,
            None => {
                *out += "<invalid array>";
                if style.refs {
                    out.push('\n');
                }
                return true;
            }
        };

        if !style.refs {
            if !style.inspect {
                return false;
            }
            *out += &format!("size {}, max {}", head.size, head.max);
            return true;
        }

        for u in 0..head.size {
            if style.max != 0 && u >= style.max {
                break;
            }

            let item = ObjId(self.zone.read_u32(head.elem(u)));
            if style.dump {
                *out += "    ";
            }
            *out += &format!("[{:2}] ", u);
            *out += &self.dump(
                item,
                DumpStyle {
                    inspect: style.inspect,
                    no_nl: true,
                    ..DumpStyle::default()
                },
            );
            out.push('\n');
        }

        true
    }
}
