// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/memmgt.rs

// Memory management for the VM. A single fixed-size byte arena is cut
// into a chain of variable-size chunks; each chunk records the distance
// to its neighbors and the id of the object that owns it. Includes the
// chain consistency check and the sliding compaction used by defrag.

// <>

use super::core::{ObjId, VmErr, VmResult};

/// Chunk header: prev (u32), next (u32), owner id (u32)
pub const CHUNK_HEADER: u32 = 12;

/// Smallest arena the VM will run in
pub const MIN_ZONE_SIZE: u32 = 0x1000;

/// One link of the chunk chain, decoded from its header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Arena offset of the header
    pub offset: u32,
    /// Distance back to the previous header; 0 for the first chunk
    pub prev: u32,
    /// Size of this chunk including its header
    pub next: u32,
    pub id: ObjId,
}

impl Chunk {
    pub fn is_free(&self) -> bool {
        self.id.is_nil()
    }

    /// Arena offset of the first payload byte
    pub fn data(&self) -> u32 {
        self.offset + CHUNK_HEADER
    }

    pub fn end(&self) -> u32 {
        self.offset + self.next
    }
}

/// A chunk moved by `Zone::defrag`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub id: ObjId,
    pub from: u32,
    pub to: u32,
    pub len: u32,
}

/// Byte arena holding every heap-backed object payload
pub struct Zone {
    mem: Vec<u8>,
    /// At or before the earliest free chunk
    first_free: u32,
}

impl Zone {
    /// Set up an arena of `size` bytes holding one free chunk
    pub fn new(size: u32) -> VmResult<Self> {
        if size < MIN_ZONE_SIZE {
            return Err(VmErr::NoMemory);
        }

        let size = size & !3;

        let mut zone = Zone {
            mem: vec![0; size as usize],
            first_free: 0,
        };

        zone.write_header(0, 0, size, ObjId::NIL);

        Ok(zone)
    }

    pub fn size(&self) -> u32 {
        self.mem.len() as u32
    }

    pub fn first_free(&self) -> u32 {
        self.first_free
    }

    /// Claim `size` zeroed bytes for object `id`, returning the payload
    /// offset; a zero size yields the end-of-arena offset
    pub fn alloc(&mut self, size: u32, id: ObjId) -> Option<u32> {
        if id.is_nil() || size > self.size() {
            return None;
        }

        if size == 0 {
            return Some(self.size());
        }

        let need = (size + CHUNK_HEADER + 3) & !3;

        let mut pos = self.first_free;
        let mut earliest_free = None;

        while pos < self.size() {
            let chunk = self.chunk(pos);
            if chunk.next < CHUNK_HEADER {
                break;
            }

            if chunk.is_free() {
                if chunk.next >= need {
                    self.claim(chunk, need, id);

                    self.first_free = match earliest_free {
                        Some(ofs) => ofs,
                        None => chunk.offset + self.chunk(chunk.offset).next,
                    };

                    if cfg!(feature = "memdbg") {
                        log::debug!("alloc {:?}: {} bytes at {:#x}", id, size, chunk.data());
                        self.debug_check();
                    }

                    return Some(chunk.data());
                } else if earliest_free.is_none() {
                    earliest_free = Some(pos);
                }
            }

            pos = chunk.end();
        }

        None
    }

    fn claim(&mut self, chunk: Chunk, need: u32, id: ObjId) {
        self.write_u32(chunk.offset + 8, id.0);
        self.fill(chunk.data(), chunk.next - CHUNK_HEADER, 0);

        if chunk.next > need + CHUNK_HEADER {
            let rest = chunk.next - need;
            self.write_u32(chunk.offset + 4, need);
            self.write_header(chunk.offset + need, need, rest, ObjId::NIL);

            if chunk.end() < self.size() {
                self.write_u32(chunk.end(), rest);
            }
        }
    }

    /// Release the chunk whose payload starts at `data`, merging it
    /// with free neighbors
    pub fn free(&mut self, data: u32) -> VmResult<()> {
        if data < CHUNK_HEADER || data >= self.size() {
            return Ok(());
        }

        let mut at = data - CHUNK_HEADER;
        let chunk = self.chunk(at);
        let mut next = chunk.next;

        if chunk.prev != 0 {
            if chunk.prev > at || self.read_u32(at - chunk.prev + 4) != chunk.prev {
                return Err(self.corrupt("free", at));
            }

            let prev = self.chunk(at - chunk.prev);
            if prev.is_free() {
                next += prev.next;
                at = prev.offset;
                self.write_u32(at + 4, next);
                if at + next < self.size() {
                    self.write_u32(at + next, next);
                }
            }
        }

        let end = at + next;

        if end <= at || end > self.size() || (end < self.size() && self.read_u32(end) != next) {
            return Err(self.corrupt("free", at));
        }

        if end != self.size() {
            let following = self.chunk(end);
            if following.is_free() {
                next += following.next;
                self.write_u32(at + 4, next);
                if at + next < self.size() {
                    self.write_u32(at + next, next);
                }
            }
        }

        self.write_u32(at + 8, 0);

        if at < self.first_free {
            self.first_free = at;
        }

        if cfg!(feature = "memdbg") {
            log::debug!("free chunk at {:#x}, {} bytes", at, next);
            self.debug_check();
        }

        Ok(())
    }

    fn corrupt(&self, op: &str, at: u32) -> VmErr {
        log::error!("-- {}: malloc chain corrupt at {:#x}", op, at);
        VmErr::MemoryCorruption
    }

    fn debug_check(&self) {
        if let Err(e) = self.check_chain() {
            log::error!("-- chain check after allocator mutation: {}", e);
        }
    }

    pub fn chunk(&self, offset: u32) -> Chunk {
        Chunk {
            offset,
            prev: self.read_u32(offset),
            next: self.read_u32(offset + 4),
            id: ObjId(self.read_u32(offset + 8)),
        }
    }

    /// Walk the chain from the start; stops early on a broken link
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks { zone: self, pos: 0 }
    }

    /// The chunk containing arena offset `ptr`; `None` when `ptr` falls
    /// into a header or outside the arena
    pub fn find_chunk(&self, ptr: u32) -> Option<Chunk> {
        let chunk = self.chunks().find(|c| ptr >= c.offset && ptr < c.end())?;

        if ptr - chunk.offset < CHUNK_HEADER {
            None
        } else {
            Some(chunk)
        }
    }

    /// Verify links and bounds of the whole chain
    pub fn check_chain(&self) -> VmResult<()> {
        let mut pos = 0;
        let mut prev_next = 0;
        let mut idx = 0;

        while pos < self.size() {
            let chunk = self.chunk(pos);

            if chunk.next < CHUNK_HEADER || chunk.end() > self.size() || chunk.prev != prev_next {
                log::error!("-- malloc chain corrupt (entry {})", idx);
                return Err(VmErr::MemoryCorruption);
            }

            prev_next = chunk.next;
            pos = chunk.end();
            idx += 1;
        }

        if pos != self.size() {
            log::error!("-- malloc chain corrupt (entry {})", idx);
            return Err(VmErr::MemoryCorruption);
        }

        Ok(())
    }

    /// Slide runs of occupied chunks down over the free gaps before
    /// them, moving at most `max` chunks
    pub fn defrag(&mut self, max: u32) -> Vec<Relocation> {
        let mut moved = Vec::new();

        while (moved.len() as u32) < max {
            let gap = match self.chunks().find(|c| c.is_free()) {
                Some(c) => c,
                None => break,
            };

            let run_start = gap.end();
            let mut run_end = run_start;
            let mut last_len = 0;
            let before = moved.len();

            while run_end < self.size() && (moved.len() as u32) < max {
                let c = self.chunk(run_end);
                if c.is_free() || c.next < CHUNK_HEADER {
                    break;
                }
                moved.push(Relocation {
                    id: c.id,
                    from: c.offset,
                    to: c.offset - gap.next,
                    len: c.next,
                });
                last_len = c.next;
                run_end = c.end();
            }

            if moved.len() == before {
                break;
            }

            self.mem.copy_within(
                run_start as usize..run_end as usize,
                gap.offset as usize,
            );
            self.write_u32(gap.offset, gap.prev);

            let hole = run_end - gap.next;
            let mut hole_len = gap.next;

            if run_end < self.size() {
                let following = self.chunk(run_end);
                if following.is_free() {
                    hole_len += following.next;
                }
            }

            self.write_header(hole, last_len, hole_len, ObjId::NIL);
            if hole + hole_len < self.size() {
                self.write_u32(hole + hole_len, hole_len);
            }

            if cfg!(feature = "memdbg") {
                log::debug!(
                    "defrag: slid {} chunks down by {} bytes",
                    moved.len() - before,
                    gap.next
                );
            }
        }

        self.first_free = self
            .chunks()
            .find(|c| c.is_free())
            .map_or(self.size(), |c| c.offset);

        moved
    }

    fn write_header(&mut self, at: u32, prev: u32, next: u32, id: ObjId) {
        self.write_u32(at, prev);
        self.write_u32(at + 4, next);
        self.write_u32(at + 8, id.0);
    }

    /// `len` bytes at `offset`; empty when out of range
    pub fn bytes(&self, offset: u32, len: u32) -> &[u8] {
        let (start, end) = (offset as usize, offset as usize + len as usize);
        self.mem.get(start..end).unwrap_or(&[])
    }

    pub fn bytes_mut(&mut self, offset: u32, len: u32) -> &mut [u8] {
        let (start, end) = (offset as usize, offset as usize + len as usize);
        self.mem.get_mut(start..end).unwrap_or(&mut [])
    }

    pub fn fill(&mut self, offset: u32, len: u32, val: u8) {
        self.bytes_mut(offset, len).fill(val);
    }

    /// Overlap-safe copy inside the arena
    pub fn copy(&mut self, from: u32, to: u32, len: u32) {
        let src = from as usize..from as usize + len as usize;
        if src.end <= self.mem.len() && to as usize + len as usize <= self.mem.len() {
            self.mem.copy_within(src, to as usize);
        }
    }

    pub fn read_u32(&self, offset: u32) -> u32 {
        self.bytes(offset, 4)
            .try_into()
            .map_or(0, u32::from_le_bytes)
    }

    pub fn write_u32(&mut self, offset: u32, val: u32) {
        let dst = self.bytes_mut(offset, 4);
        if dst.len() == 4 {
            dst.copy_from_slice(&val.to_le_bytes());
        }
    }

    pub fn read_i64(&self, offset: u32) -> i64 {
        self.bytes(offset, 8)
            .try_into()
            .map_or(0, i64::from_le_bytes)
    }

    pub fn write_i64(&mut self, offset: u32, val: i64) {
        let dst = self.bytes_mut(offset, 8);
        if dst.len() == 8 {
            dst.copy_from_slice(&val.to_le_bytes());
        }
    }
}

pub struct Chunks<'a> {
    zone: &'a Zone,
    pos: u32,
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.pos >= self.zone.size() {
            return None;
        }

        let chunk = self.zone.chunk(self.pos);
        if chunk.next < CHUNK_HEADER || chunk.end() > self.zone.size() {
            self.pos = self.zone.size();
        } else {
            self.pos = chunk.end();
        }

        Some(chunk)
    }
}
