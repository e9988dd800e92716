// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/obj.rs

// The object store: a growable table of tagged object slots addressed
// by generation-checked ids, reference counting with a deferred
// collection work list, and the per-type dispatch (children, iterate,
// dump) every container kind plugs into.

// <>

use super::core::{
    BaseType, Data, Flags, Obj, ObjId, SubType, VmErr, VmResult, OBJ_ID_MAX_IDX, REF_CNT_STICKY,
};
use super::memmgt::{Zone, CHUNK_HEADER};

/// Id of the table-describing object in slot 0
pub const OLIST_ID: ObjId = ObjId::new(0, 1);

/// Smallest initial object table
pub const MIN_OLIST_SIZE: u32 = 2;

/// Items produced by one iteration step; references are already taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Yield {
    Done,
    One(ObjId),
    Two(ObjId, ObjId),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DumpStyle {
    /// show type details rather than the bare value
    pub inspect: bool,
    /// full dump with header and hex
    pub dump: bool,
    /// list referenced children
    pub refs: bool,
    pub no_nl: bool,
    pub no_head: bool,
    /// element limit; 0 is unlimited
    pub max: u32,
}

/// Object table plus the arena holding object payloads
pub struct Store {
    pub(crate) zone: Zone,
    objs: Vec<Obj>,
    next: u32,
    gc_list: Vec<ObjId>,
    /// log every refcount change
    pub trace_gc: bool,
    /// check the heap after every mutation
    pub memcheck: bool,
    /// error raised where no result can carry it (collection, checks)
    pub(crate) fault: Option<VmErr>,
}

impl Store {
    pub fn new(mem_size: u32, olist_size: u32) -> VmResult<Self> {
        let zone = Zone::new(mem_size)?;
        let size = olist_size.max(MIN_OLIST_SIZE);

        let mut objs = vec![Obj::vacant(0); size as usize];
        objs[0] = Obj {
            base_type: BaseType::OList,
            sub_type: SubType::Skip,
            ref_cnt: REF_CNT_STICKY,
            gen: OLIST_ID.gen(),
            flags: Flags::default(),
            data: Data::Value(size as i64),
        };

        log::debug!("object store: {} slots, {:#x} bytes arena", size, zone.size());

        Ok(Store {
            zone,
            objs,
            next: 1,
            gc_list: Vec::new(),
            trace_gc: false,
            memcheck: false,
            fault: None,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.objs.len() as u32
    }

    /// The backing arena
    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    /// Claim a free slot for a new object with refcount 1
    pub fn new_obj(&mut self, base_type: BaseType) -> VmResult<ObjId> {
        if matches!(base_type, BaseType::None | BaseType::Invalid) {
            return Err(VmErr::Internal);
        }

        let max = self.capacity();
        let end = self.zone.size();

        for u in 0..max {
            let idx = (self.next + u) % max;
            let slot = &mut self.objs[idx as usize];

            if slot.is_vacant() {
                let gen = match slot.gen.wrapping_add(1) {
                    0 => 1,
                    g => g,
                };

                *slot = Obj {
                    base_type,
                    sub_type: SubType::Skip,
                    ref_cnt: 1,
                    gen,
                    flags: Flags::default(),
                    data: if base_type.data_is_ptr() {
                        Data::Ptr {
                            offset: end,
                            size: 0,
                            ref_id: ObjId::NIL,
                        }
                    } else {
                        Data::Value(0)
                    },
                };

                self.next = (idx + 1) % max;

                return Ok(ObjId::new(idx, gen));
            }
        }

        self.grow()?;
        self.new_obj(base_type)
    }

    fn grow(&mut self) -> VmResult<()> {
        let max = self.capacity();
        let size = (max + (max >> 3) + 0x100).min(OBJ_ID_MAX_IDX + 1);

        if size <= max {
            return Err(VmErr::NoMemory);
        }

        self.objs.resize(size as usize, Obj::vacant(0));
        self.objs[0].data = Data::Value(size as i64);

        log::debug!("object table grown to {} slots", size);

        Ok(())
    }

    /// New object with `size` zeroed bytes of arena-backed payload
    pub fn alloc_obj(&mut self, base_type: BaseType, size: u32) -> VmResult<ObjId> {
        let id = self.new_obj(base_type)?;

        match self.zone.alloc(size, id) {
            Some(offset) => {
                if let Some(obj) = self.get_mut(id) {
                    obj.data = Data::Ptr {
                        offset,
                        size,
                        ref_id: ObjId::NIL,
                    };
                }
            }
            None => {
                self.clear_slot(id);
                return Err(VmErr::NoMemory);
            }
        }

        self.memcheck_after("alloc")?;

        Ok(id)
    }

    /// Empty a slot, keeping its generation
    pub(crate) fn clear_slot(&mut self, id: ObjId) {
        if let Some(slot) = self.objs.get_mut(id.idx() as usize) {
            *slot = Obj::vacant(slot.gen);
        }
    }

    /// Resize an object's payload; the id stays the same and objects
    /// aliasing the old payload follow it
    pub fn realloc(&mut self, id: ObjId, size: u32) -> VmResult<()> {
        let obj = *self.get(id).ok_or(VmErr::Internal)?;

        let (old_offset, old_size) = match obj.data {
            Data::Ptr { .. } if obj.flags.nofree => return Err(VmErr::Readonly),
            Data::Ptr { offset, size, .. } => (offset, size),
            Data::Value(_) => return Err(VmErr::Internal),
        };

        let offset = self.zone.alloc(size, id).ok_or(VmErr::NoMemory)?;

        self.zone.copy(old_offset, offset, old_size.min(size));

        if let Some(o) = self.get_mut(id) {
            o.data = Data::Ptr {
                offset,
                size,
                ref_id: ObjId::NIL,
            };
        }

        self.zone.free(old_offset)?;

        if obj.flags.has_ref {
            for alias in self.objs.iter_mut() {
                if let Data::Ptr {
                    offset: a_ofs,
                    size: a_size,
                    ref_id,
                } = &mut alias.data
                {
                    if *ref_id == id && *a_ofs >= old_offset && *a_ofs <= old_offset + old_size {
                        let rel = *a_ofs - old_offset;
                        *a_ofs = offset + rel.min(size);
                        *a_size = (*a_size).min(size - rel.min(size));
                    }
                }
            }
        }

        self.memcheck_after("realloc")
    }

    /// Object record for a live id; stale or vacant ids give `None`
    pub fn get(&self, id: ObjId) -> Option<&Obj> {
        if id.is_nil() {
            return None;
        }

        self.objs
            .get(id.idx() as usize)
            .filter(|o| !o.is_vacant() && o.gen == id.gen())
    }

    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut Obj> {
        if id.is_nil() {
            return None;
        }

        self.objs
            .get_mut(id.idx() as usize)
            .filter(|o| !o.is_vacant() && o.gen == id.gen())
    }

    /// Slot behind an id's index, ignoring generation and liveness
    pub fn get_nocheck(&self, id: ObjId) -> Option<&Obj> {
        self.objs.get(id.idx() as usize)
    }

    /// Live object of the given base type
    pub fn typed(&self, id: ObjId, base_type: BaseType) -> Option<&Obj> {
        self.get(id).filter(|o| o.base_type == base_type)
    }

    /// Like `typed`, but a read-only object is an error
    pub fn typed_rw(&self, id: ObjId, base_type: BaseType) -> VmResult<Option<&Obj>> {
        match self.typed(id, base_type) {
            Some(o) if o.flags.ro => Err(VmErr::Readonly),
            o => Ok(o),
        }
    }

    /// Live slots in table order
    pub fn objects(&self) -> impl Iterator<Item = (ObjId, &Obj)> {
        self.objs
            .iter()
            .enumerate()
            .filter(|(_, o)| !o.is_vacant())
            .map(|(idx, o)| (ObjId::new(idx as u32, o.gen), o))
    }

    pub fn ref_inc(&mut self, id: ObjId) -> ObjId {
        if let Some(obj) = self.get_mut(id) {
            if obj.ref_cnt < REF_CNT_STICKY - 1 {
                obj.ref_cnt += 1;
            }

            if self.trace_gc {
                log::trace!("GC: ++{}", self.id2str(id));
            }
        }

        id
    }

    /// Drop a reference, collecting whatever became unreachable
    pub fn ref_dec(&mut self, id: ObjId) {
        if self.ref_dec_delay_gc(id) {
            self.run_gc();
        }
    }

    /// Drop a reference; an object reaching zero is queued for the next
    /// `run_gc` and `true` is returned
    pub fn ref_dec_delay_gc(&mut self, id: ObjId) -> bool {
        let trace = self.trace_gc;

        let obj = match self.get_mut(id) {
            Some(obj) => obj,
            None => return false,
        };

        if obj.ref_cnt != 0 && obj.ref_cnt != REF_CNT_STICKY {
            obj.ref_cnt -= 1;
        }

        let dead = obj.ref_cnt == 0;

        if trace {
            log::trace!("GC: --{}", self.id2str(id));
        }

        if dead {
            self.gc_list.push(id);
        }

        dead
    }

    /// Drain the collection list; entries appended while draining are
    /// handled in the same pass
    pub fn run_gc(&mut self) {
        let mut idx = 0;

        while idx < self.gc_list.len() {
            let id = self.gc_list[idx];
            idx += 1;

            let obj = match self.get(id) {
                Some(obj) => *obj,
                None => continue,
            };

            if self.trace_gc {
                log::trace!("GC: free {}", self.id2str(id));
            }

            for child in self.children(&obj) {
                self.ref_dec_delay_gc(child);
            }

            if let Data::Ptr { offset, .. } = obj.data {
                if !obj.flags.nofree {
                    if let Err(e) = self.zone.free(offset) {
                        self.fault = Some(e);
                    }
                }
            }

            self.clear_slot(id);
        }

        self.gc_list.clear();

        if let Err(e) = self.memcheck_after("gc") {
            self.fault = Some(e);
        }
    }

    /// Ids queued for collection but not yet reclaimed
    pub fn gc_pending(&self) -> &[ObjId] {
        &self.gc_list
    }

    /// Ids an object holds references to
    pub fn children(&self, obj: &Obj) -> Vec<ObjId> {
        match obj.base_type {
            BaseType::Mem => match obj.ref_id() {
                ObjId::NIL => vec![],
                ref_id => vec![ref_id],
            },
            BaseType::Array => self.array_items(obj),
            BaseType::Hash => self.hash_children(obj),
            BaseType::Context => self.context_children(obj),
            BaseType::OList
            | BaseType::Font
            | BaseType::Canvas
            | BaseType::Num
            | BaseType::None
            | BaseType::Invalid => vec![],
        }
    }

    /// Whether object `id` references `child`
    pub fn contains(&self, id: ObjId, child: ObjId) -> bool {
        if child.is_nil() {
            return false;
        }

        self.get(id)
            .map_or(false, |obj| self.children(obj).contains(&child))
    }

    /// Step through a container; `idx` is the caller-held cursor
    pub fn iterate(&mut self, id: ObjId, idx: &mut u32) -> VmResult<Yield> {
        let obj = match self.get(id) {
            Some(obj) => *obj,
            None => {
                *idx = 0;
                return Ok(Yield::Done);
            }
        };

        match obj.base_type {
            BaseType::Array => self.array_iterate(&obj, idx),
            BaseType::Hash => self.hash_iterate(&obj, idx),
            BaseType::Mem => self.mem_iterate(&obj, idx),
            BaseType::OList
            | BaseType::Font
            | BaseType::Canvas
            | BaseType::Context
            | BaseType::Num
            | BaseType::None
            | BaseType::Invalid => Ok(Yield::Done),
        }
    }

    /// Offset and size of an object's payload; `None` for scalars
    pub fn span(&self, id: ObjId) -> Option<(u32, u32)> {
        self.get(id).and_then(Obj::span)
    }

    /// Payload bytes of any pointer-backed object
    pub fn data(&self, id: ObjId) -> &[u8] {
        match self.span(id) {
            Some((offset, size)) => self.zone.bytes(offset, size),
            None => &[],
        }
    }

    /// `#idx.gen.refcnt.type[.sub][.ro][.sticky]`
    pub fn id2str(&self, id: ObjId) -> String {
        let (name, refs, sub, ro, sticky) = match self.get_nocheck(id) {
            Some(o) if !id.is_nil() => (
                o.base_type.name(),
                if o.ref_cnt == REF_CNT_STICKY {
                    ".*".to_string()
                } else {
                    format!(".{}", o.ref_cnt)
                },
                if o.sub_type == SubType::Skip {
                    String::new()
                } else {
                    format!(".{}", o.sub_type.name())
                },
                if o.flags.ro { ".ro" } else { "" },
                if o.flags.sticky { ".sticky" } else { "" },
            ),
            _ => (
                if id.is_nil() { "nil" } else { "?" },
                String::new(),
                String::new(),
                "",
                "",
            ),
        };

        format!(
            "#{}.{}{}.{}{}{}{}",
            id.idx(),
            id.gen(),
            refs,
            name,
            sub,
            ro,
            sticky
        )
    }

    /// Render an object the way the debug console shows it
    pub fn dump(&self, id: ObjId, style: DumpStyle) -> String {
        let mut out = String::new();

        let obj = match self.get(id) {
            Some(obj) => *obj,
            None => {
                if style.dump {
                    out += &format!("= object dump (id {}): not found\n", self.id2str(id));
                } else {
                    if style.inspect {
                        out += &format!(
                            "{} <{}>",
                            self.id2str(id),
                            if id.is_nil() { "nil" } else { "undef" }
                        );
                    } else {
                        out += if id.is_nil() { "nil" } else { "undef" };
                    }
                    if !style.no_nl {
                        out.push('\n');
                    }
                }
                return out;
            }
        };

        if style.dump && !style.no_head {
            out += &format!("== object dump (id {}) ==\n", self.id2str(id));
        }

        let id_str = self.id2str(id);
        let plain = DumpStyle {
            inspect: true,
            max: style.max,
            ..DumpStyle::default()
        };

        if style.dump {
            out += &format!("  {} <", id_str);
            self.dump_payload(&obj, plain, &mut out);
            out += ">\n";
            self.dump_payload(
                &obj,
                DumpStyle {
                    refs: true,
                    dump: true,
                    ..plain
                },
                &mut out,
            );
        } else if style.refs {
            self.dump_payload(
                &obj,
                DumpStyle {
                    inspect: style.inspect,
                    refs: true,
                    max: style.max,
                    ..DumpStyle::default()
                },
                &mut out,
            );
        } else {
            if style.inspect {
                out += &format!("{} <", id_str);
                self.dump_payload(&obj, plain, &mut out);
                out.push('>');
            } else if !self.dump_payload(
                &obj,
                DumpStyle {
                    max: style.max,
                    ..DumpStyle::default()
                },
                &mut out,
            ) {
                out += &id_str;
            }
            if !style.no_nl {
                out.push('\n');
            }
        }

        out
    }

    /// Type-specific part of a dump; `false` when nothing was written
    pub(crate) fn dump_payload(&self, obj: &Obj, style: DumpStyle, out: &mut String) -> bool {
        match obj.base_type {
            BaseType::None => true,
            BaseType::Mem => self.mem_dump(obj, style, out),
            BaseType::OList => self.olist_dump(style, out),
            BaseType::Array => self.array_dump(obj, style, out),
            BaseType::Hash => self.hash_dump(obj, style, out),
            BaseType::Context => self.context_dump(obj, style, out),
            BaseType::Num => self.num_dump(obj, style, out),
            BaseType::Font | BaseType::Canvas => {
                if style.refs || !style.inspect {
                    return style.refs;
                }
                if let Some((_, size)) = obj.span() {
                    *out += &format!("size {}", size);
                }
                true
            }
            BaseType::Invalid => {
                *out += "      <invalid type>\n";
                true
            }
        }
    }

    fn olist_dump(&self, style: DumpStyle, out: &mut String) -> bool {
        if !style.refs {
            if style.inspect {
                let used = self.objects().count();
                *out += &format!("size {}, next {}, max {}", used, self.next, self.capacity());
                return true;
            }
            return false;
        }

        if style.dump {
            *out += "  ";
        }

        for (id, _) in self.objects() {
            let s = DumpStyle {
                inspect: style.inspect,
                no_head: true,
                dump: style.dump && id.idx() != 0,
                ..DumpStyle::default()
            };
            *out += &self.dump(id, s);
        }

        true
    }

    /// Chunk chain check plus owner validation for each used chunk
    pub fn check_chain(&self) -> VmResult<()> {
        self.zone.check_chain()?;

        for (idx, chunk) in self.zone.chunks().enumerate() {
            if chunk.is_free() {
                continue;
            }

            let obj = match self.get(chunk.id) {
                Some(obj) => obj,
                None => {
                    log::error!("-- malloc chain corrupt (entry {}): dead owner", idx);
                    return Err(VmErr::MemoryCorruption);
                }
            };

            if obj.flags.nofree {
                continue;
            }

            match obj.span() {
                Some((offset, size))
                    if offset >= chunk.data() && offset + size <= chunk.end() => {}
                _ => {
                    log::error!(
                        "-- referenced object #{} not inside malloc chunk",
                        chunk.id.idx()
                    );
                    return Err(VmErr::MemoryCorruption);
                }
            }
        }

        Ok(())
    }

    /// Every owned payload must sit inside a chunk tagged with its owner
    pub fn check_objects(&self) -> VmResult<()> {
        let end = self.zone.size();

        for (id, obj) in self.objects() {
            let (offset, size, ref_id) = match obj.data {
                Data::Ptr {
                    offset,
                    size,
                    ref_id,
                } => (offset, size, ref_id),
                Data::Value(_) => continue,
            };

            if obj.flags.nofree || (size == 0 && offset == end) {
                continue;
            }

            let chunk = match self.zone.find_chunk(offset) {
                Some(c) if !c.is_free() && offset + size <= c.end() => c,
                _ => {
                    log::error!("-- object store corrupt (id #{})", id.idx());
                    return Err(VmErr::MemoryCorruption);
                }
            };

            let owner = if ref_id.is_nil() { id } else { ref_id };

            if chunk.id != owner {
                log::error!(
                    "-- malloc chunk id mismatch (malloc id #{}, obj id #{})",
                    chunk.id.idx(),
                    owner.idx()
                );
                return Err(VmErr::MemoryCorruption);
            }
        }

        Ok(())
    }

    pub fn check_heap(&self) -> VmResult<()> {
        self.check_chain()?;
        self.check_objects()
    }

    fn memcheck_after(&self, op: &str) -> VmResult<()> {
        if self.memcheck || cfg!(feature = "memdbg") {
            if let Err(e) = self.check_heap() {
                log::error!("-- error in {}", op);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Compact the arena, moving at most `max` chunks; returns how many
    /// chunks moved
    pub fn defrag(&mut self, max: u32) -> VmResult<u32> {
        let moves = self.zone.defrag(max);

        for m in &moves {
            let delta = m.from - m.to;

            for (idx, obj) in self.objs.iter_mut().enumerate() {
                if obj.is_vacant() {
                    continue;
                }

                let own = ObjId::new(idx as u32, obj.gen);

                if let Data::Ptr { offset, ref_id, .. } = &mut obj.data {
                    let owner = if ref_id.is_nil() { own } else { *ref_id };

                    if owner == m.id && *offset >= m.from + CHUNK_HEADER && *offset <= m.from + m.len
                    {
                        *offset -= delta;
                    }
                }
            }
        }

        log::debug!("defrag: {} chunks moved", moves.len());

        self.check_heap()?;

        Ok(moves.len() as u32)
    }
}
