// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/context.rs

// Context objects are activation records: one per running function,
// conditional body or loop. Linked through their parent ids they form
// the interpreter's call stack.

// <>

use super::core::{BaseType, Obj, ObjId, SubType, VmErr, VmResult};
use super::obj::{DumpStyle, Store};

pub const CONTEXT_PAYLOAD_SIZE: u32 = 52;

/// Decoded context record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub kind: SubType,
    pub ip: u32,
    /// start of the instruction being executed
    pub current_ip: u32,
    pub parent: ObjId,
    pub code: ObjId,
    pub dict: ObjId,
    /// container walked by a forall loop
    pub iterate: ObjId,
    pub index: i64,
    pub max: i64,
    pub inc: i64,
}

impl Context {
    pub fn new(kind: SubType) -> Self {
        Context {
            kind,
            ip: 0,
            current_ip: 0,
            parent: ObjId::NIL,
            code: ObjId::NIL,
            dict: ObjId::NIL,
            iterate: ObjId::NIL,
            index: 0,
            max: 0,
            inc: 0,
        }
    }
}

impl Store {
    pub fn context_new(&mut self, kind: SubType) -> VmResult<ObjId> {
        let id = self.alloc_obj(BaseType::Context, CONTEXT_PAYLOAD_SIZE)?;

        if let Some(obj) = self.get_mut(id) {
            obj.sub_type = kind;
        }
        self.set_context(id, &Context::new(kind))?;

        Ok(id)
    }

    fn context_decode(&self, obj: &Obj) -> Option<Context> {
        if obj.base_type != BaseType::Context {
            return None;
        }

        let (o, size) = obj.span()?;
        if size != CONTEXT_PAYLOAD_SIZE {
            return None;
        }

        let z = &self.zone;
        let kind = u8::try_from(z.read_u32(o)).ok()?;

        Some(Context {
            kind: SubType::try_from(kind).ok()?,
            ip: z.read_u32(o + 4),
            current_ip: z.read_u32(o + 8),
            parent: ObjId(z.read_u32(o + 12)),
            code: ObjId(z.read_u32(o + 16)),
            dict: ObjId(z.read_u32(o + 20)),
            iterate: ObjId(z.read_u32(o + 24)),
            index: z.read_i64(o + 28),
            max: z.read_i64(o + 36),
            inc: z.read_i64(o + 44),
        })
    }

    /// Snapshot of a context; `None` for anything that isn't one
    pub fn context(&self, id: ObjId) -> Option<Context> {
        self.context_decode(self.get(id)?)
    }

    /// Write a context record back; reference counts are the caller's
    /// business
    pub fn set_context(&mut self, id: ObjId, ctx: &Context) -> VmResult<()> {
        let o = match self.typed(id, BaseType::Context).and_then(Obj::span) {
            Some((offset, CONTEXT_PAYLOAD_SIZE)) => offset,
            _ => return Err(VmErr::Internal),
        };

        let z = &mut self.zone;
        z.write_u32(o, ctx.kind as u32);
        z.write_u32(o + 4, ctx.ip);
        z.write_u32(o + 8, ctx.current_ip);
        z.write_u32(o + 12, ctx.parent.0);
        z.write_u32(o + 16, ctx.code.0);
        z.write_u32(o + 20, ctx.dict.0);
        z.write_u32(o + 24, ctx.iterate.0);
        z.write_i64(o + 28, ctx.index);
        z.write_i64(o + 36, ctx.max);
        z.write_i64(o + 44, ctx.inc);

        Ok(())
    }

    pub(crate) fn context_children(&self, obj: &Obj) -> Vec<ObjId> {
        match self.context_decode(obj) {
            Some(c) => [c.parent, c.code, c.dict, c.iterate]
                .into_iter()
                .filter(|id| !id.is_nil())
                .collect(),
            None => vec![],
        }
    }

    pub(crate) fn context_dump(&self, obj: &Obj, style: DumpStyle, out: &mut String) -> bool {
        let c = match self.context_decode(obj) {
            Some(c) => c,
            None => {
                *out += if style.refs {
                    "      <invalid data>\n"
                } else {
                    "<invalid data>"
                };
                return true;
            }
        };

        if !style.refs {
            if !style.inspect {
                return false;
            }

            *out += &format!(
                "code {}, ip {:#x} ({:#x})",
                self.id2str(c.code),
                c.ip,
                c.current_ip
            );

            match c.kind {
                SubType::CtxRepeat => *out += &format!(", index {}", c.index),
                SubType::CtxFor => {
                    *out += &format!(", index {}, inc {}, max {}", c.index, c.inc, c.max)
                }
                SubType::CtxForall => {
                    *out += &format!(", index {}, iterate {}", c.index, self.id2str(c.iterate))
                }
                _ => {}
            }

            if !c.dict.is_nil() {
                *out += &format!(", dict {}", self.id2str(c.dict));
            }

            return true;
        }

        if style.dump {
            *out += &format!(
                "    type {}, ip {:#x} ({:#x})\n",
                c.kind as u8, c.ip, c.current_ip
            );
            *out += &format!("    code {}\n", self.id2str(c.code));
            *out += &format!("    parent {}\n", self.id2str(c.parent));
            *out += &format!("    dict {}\n", self.id2str(c.dict));
            *out += &format!("    iterate {}\n", self.id2str(c.iterate));
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let mut s = Store::new(0x1000, 2).unwrap();
        let id = s.context_new(SubType::CtxFor).unwrap();

        let mut c = s.context(id).unwrap();
        assert_eq!(Context::new(SubType::CtxFor), c);

        c.ip = 0x20;
        c.index = -5;
        c.max = i64::MAX;
        c.inc = -1;
        s.set_context(id, &c).unwrap();

        assert_eq!(c, s.context(id).unwrap());
        assert_eq!(SubType::CtxFor, s.get(id).unwrap().sub_type);
    }

    #[test]
    fn releases_links() {
        let mut s = Store::new(0x1000, 2).unwrap();
        let parent = s.context_new(SubType::CtxFunc).unwrap();
        let child = s.context_new(SubType::CtxBlock).unwrap();
        let dict = s.hash_new(0).unwrap();

        let mut c = s.context(child).unwrap();
        c.parent = parent;
        c.dict = dict;
        s.set_context(child, &c).unwrap();

        assert!(s.contains(child, dict));
        s.ref_dec(child);

        assert!(s.get(parent).is_none());
        assert!(s.get(dict).is_none());
    }
}
