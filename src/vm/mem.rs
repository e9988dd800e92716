// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/mem.rs

// Mem objects are plain byte strings: program text, strings, words and
// references. An alias is a read-only window into another mem object's
// bytes and keeps that object alive.

// <>

use std::cmp::Ordering;

use super::array::resolve_pos;
use super::core::{BaseType, Data, Obj, ObjId, SubType, VmErr, VmResult};
use super::obj::{DumpStyle, Store, Yield};

/// Byte order used for hash keys and string comparison: bytewise, with
/// a proper prefix sorting first
pub fn mem_cmp(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

impl Store {
    pub fn mem_new(&mut self, size: u32, sub_type: SubType) -> VmResult<ObjId> {
        let id = self.alloc_obj(BaseType::Mem, size)?;

        if let Some(obj) = self.get_mut(id) {
            obj.sub_type = sub_type;
        }

        Ok(id)
    }

    /// Read-only copy of `bytes`
    pub fn const_new(&mut self, bytes: &[u8], sub_type: SubType) -> VmResult<ObjId> {
        let len = u32::try_from(bytes.len()).map_err(|_| VmErr::NoMemory)?;
        let id = self.mem_new(len, sub_type)?;

        if let Some((offset, _)) = self.span(id) {
            self.zone.bytes_mut(offset, len).copy_from_slice(bytes);
        }
        if let Some(obj) = self.get_mut(id) {
            obj.flags.ro = true;
        }

        Ok(id)
    }

    /// Read-only view of `len` bytes at arena `offset`, which must lie
    /// inside `ref_id`'s data
    pub fn alias_new(
        &mut self,
        offset: u32,
        len: u32,
        sub_type: SubType,
        ref_id: ObjId,
    ) -> VmResult<ObjId> {
        let mut ref_id = ref_id;

        // always point at the object owning the bytes
        while let Some(obj) = self.typed(ref_id, BaseType::Mem) {
            match obj.ref_id() {
                ObjId::NIL => break,
                owner => ref_id = owner,
            }
        }

        match self.get_mut(ref_id) {
            Some(obj) if obj.base_type == BaseType::Mem => obj.flags.has_ref = true,
            _ => return Err(VmErr::Internal),
        }

        let id = self.new_obj(BaseType::Mem)?;

        if let Some(obj) = self.get_mut(id) {
            obj.data = Data::Ptr {
                offset,
                size: len,
                ref_id,
            };
            obj.flags.ro = true;
            obj.flags.nofree = true;
            obj.sub_type = sub_type;
        }

        self.ref_inc(ref_id);

        Ok(id)
    }

    /// Writable copy with `extra` zero bytes appended
    pub fn mem_dup(&mut self, id: ObjId, extra: u32) -> VmResult<ObjId> {
        let obj = *self
            .typed(id, BaseType::Mem)
            .ok_or(VmErr::InvalidArguments)?;
        let (offset, size) = obj.span().ok_or(VmErr::Internal)?;

        let new_size = size.checked_add(extra).ok_or(VmErr::NoMemory)?;
        let new_id = self.mem_new(new_size, obj.sub_type)?;

        if let Some((new_offset, _)) = self.span(new_id) {
            self.zone.copy(offset, new_offset, size);
        }

        Ok(new_id)
    }

    /// Bytes of a mem object; empty for anything else
    pub fn mem_bytes(&self, id: ObjId) -> &[u8] {
        match self.typed(id, BaseType::Mem).and_then(Obj::span) {
            Some((offset, size)) => self.zone.bytes(offset, size),
            None => &[],
        }
    }

    /// Byte at `pos`; `None` when out of range
    pub fn mem_get(&self, id: ObjId, pos: i64) -> Option<u8> {
        let bytes = self.mem_bytes(id);
        let pos = resolve_pos(pos, bytes.len() as u32).ok()?;

        bytes.get(pos as usize).copied()
    }

    fn mem_span_rw(&self, id: ObjId) -> VmResult<(u32, u32)> {
        self.typed_rw(id, BaseType::Mem)?
            .and_then(Obj::span)
            .ok_or(VmErr::InvalidArguments)
    }

    /// Remove the byte at `pos`; out of range positions are ignored
    pub fn mem_del(&mut self, id: ObjId, pos: i64) -> VmResult<()> {
        let (offset, size) = self.mem_span_rw(id)?;

        let pos = match resolve_pos(pos, size) {
            Ok(pos) if pos < size => pos,
            _ => return Ok(()),
        };

        let size = size - 1;
        if size > pos {
            self.zone.copy(offset + pos + 1, offset + pos, size - pos);
        }
        self.zone.fill(offset + size, 1, 0);

        if let Some(Obj {
            data: Data::Ptr { size: s, .. },
            ..
        }) = self.get_mut(id)
        {
            *s = size;
        }

        Ok(())
    }

    /// Overwrite the byte at `pos`, growing the object if needed
    pub fn mem_set(&mut self, id: ObjId, val: u8, pos: i64) -> VmResult<()> {
        let (_, size) = self.mem_span_rw(id)?;
        let pos = resolve_pos(pos, size)?;

        if pos >= size {
            self.realloc(id, pos + 1)?;
        }

        let (offset, _) = self.span(id).ok_or(VmErr::Internal)?;
        self.zone.bytes_mut(offset + pos, 1).fill(val);

        Ok(())
    }

    /// Insert a byte before `pos`
    pub fn mem_insert(&mut self, id: ObjId, val: u8, pos: i64) -> VmResult<()> {
        let (_, size) = self.mem_span_rw(id)?;
        let pos = resolve_pos(pos, size)?;

        if pos >= size {
            self.realloc(id, pos + 1)?;
        } else {
            self.realloc(id, size + 1)?;
            let (offset, _) = self.span(id).ok_or(VmErr::Internal)?;
            self.zone.copy(offset + pos, offset + pos + 1, size - pos);
        }

        let (offset, _) = self.span(id).ok_or(VmErr::Internal)?;
        self.zone.bytes_mut(offset + pos, 1).fill(val);

        Ok(())
    }

    pub(crate) fn mem_iterate(&mut self, obj: &Obj, idx: &mut u32) -> VmResult<Yield> {
        let (offset, size) = obj.span().ok_or(VmErr::Internal)?;

        if *idx >= size {
            return Ok(Yield::Done);
        }

        let byte = self.zone.bytes(offset + *idx, 1).first().copied().unwrap_or(0);
        let num = self.num_new(byte as i64, SubType::Int)?;
        *idx += 1;

        Ok(Yield::One(num))
    }

    pub(crate) fn mem_dump(&self, obj: &Obj, style: DumpStyle, out: &mut String) -> bool {
        let (offset, size) = match obj.span() {
            Some(span) => span,
            None => return true,
        };
        let bytes = self.zone.bytes(offset, size);

        if style.dump {
            let len = if style.max != 0 {
                size.min(style.max)
            } else {
                size
            };
            *out += &hex_dump(&bytes[..len as usize]);
            return true;
        }

        if style.refs {
            return true;
        }

        if style.inspect {
            let ref_id = obj.ref_id();
            if !ref_id.is_nil() {
                *out += &format!("{}, ", self.id2str(ref_id));
                if let Some((ref_offset, _)) = self.span(ref_id) {
                    if offset >= ref_offset {
                        *out += &format!("ofs {:#x}, ", offset - ref_offset);
                    }
                }
            }
            *out += &format!("size {}", size);
        }

        if matches!(
            obj.sub_type,
            SubType::String | SubType::Word | SubType::Ref
        ) {
            if style.inspect {
                *out += ", ";
            }
            out.push('"');
            out.extend(
                bytes
                    .iter()
                    .map(|&b| if b < 0x20 { ' ' } else { b as char }),
            );
            out.push('"');
            true
        } else {
            style.inspect
        }
    }
}

/// Classic 16 bytes per line hex plus ASCII rendering
pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();

    for line in bytes.chunks(16) {
        out += "   ";
        for b in line {
            out += &format!(" {:02x}", b);
        }
        out += &"   ".repeat(16 - line.len());
        out += "  ";
        out.extend(line.iter().map(|&b| {
            if (0x20..0x7f).contains(&b) {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }

    if bytes.is_empty() {
        out.push('\n');
    }

    out
}
