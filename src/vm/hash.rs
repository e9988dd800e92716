// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/hash.rs

// Hash objects map string keys to values. Pairs are kept sorted by key
// bytes so lookups can binary search; a parent hash is searched when a
// key is missing, which is how dictionaries inherit from each other.

// <>

use std::cmp::Ordering;

use super::core::{BaseType, Obj, ObjId, VmErr, VmResult};
use super::obj::{DumpStyle, Store, Yield};

const HASH_HEAD: u32 = 12;

/// How many parents a lookup follows before giving up
const MAX_PARENT_DEPTH: u32 = 100;

pub fn hash_payload_size(max: u32) -> Option<u32> {
    max.checked_mul(8)?.checked_add(HASH_HEAD)
}

#[derive(Clone, Copy)]
struct Head {
    offset: u32,
    size: u32,
    max: u32,
    parent: ObjId,
}

impl Head {
    fn key(&self, idx: u32) -> u32 {
        self.offset + HASH_HEAD + idx * 8
    }

    fn value(&self, idx: u32) -> u32 {
        self.key(idx) + 4
    }
}

impl Store {
    pub fn hash_new(&mut self, max: u32) -> VmResult<ObjId> {
        let max = if max == 0 { 0x10 } else { max };
        let size = hash_payload_size(max).ok_or(VmErr::NoMemory)?;

        let id = self.alloc_obj(BaseType::Hash, size)?;
        if let Some((offset, _)) = self.span(id) {
            self.zone.write_u32(offset + 4, max);
        }

        Ok(id)
    }

    fn hash_head(&self, obj: &Obj) -> Option<Head> {
        if obj.base_type != BaseType::Hash {
            return None;
        }

        let (offset, len) = obj.span()?;
        let size = self.zone.read_u32(offset);
        let max = self.zone.read_u32(offset + 4);
        let parent = ObjId(self.zone.read_u32(offset + 8));

        (hash_payload_size(max) == Some(len) && size <= max).then_some(Head {
            offset,
            size,
            max,
            parent,
        })
    }

    fn hash_head_of(&self, id: ObjId) -> Option<Head> {
        self.hash_head(self.typed(id, BaseType::Hash)?)
    }

    pub fn hash_len(&self, id: ObjId) -> Option<u32> {
        self.hash_head_of(id).map(|h| h.size)
    }

    /// Binary search for `key`: the matching index, or where it would go
    fn find_key(&self, head: &Head, key: &[u8]) -> (u32, bool) {
        let (mut lo, mut hi) = (0, head.size);

        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_key = self.mem_bytes(ObjId(self.zone.read_u32(head.key(mid))));

            match key.cmp(mid_key) {
                Ordering::Equal => return (mid, true),
                Ordering::Greater => lo = mid + 1,
                Ordering::Less => hi = mid,
            }
        }

        (lo, false)
    }

    /// Bind `key` to `value`. A writable key is copied so the hash owns
    /// an immutable key; with `do_ref` the hash takes its own references
    pub fn hash_set(&mut self, id: ObjId, key: ObjId, value: ObjId, do_ref: bool) -> VmResult<()> {
        let mut head = self.hash_head_of(id).ok_or(VmErr::InvalidArguments)?;
        let key_obj = *self
            .typed(key, BaseType::Mem)
            .ok_or(VmErr::InvalidHashKey)?;

        let (pos, found) = self.find_key(&head, self.mem_bytes(key));

        // no slot is opened until the key to store exists
        let stored_key = if key_obj.flags.ro {
            key
        } else {
            let copy = self.mem_dup(key, 0)?;
            if let Some(obj) = self.get_mut(copy) {
                obj.flags.ro = true;
            }
            copy
        };

        if !found {
            if head.size + 1 > head.max {
                head = match self.hash_grow(id, head.max) {
                    Ok(head) => head,
                    Err(e) => {
                        if stored_key != key {
                            self.ref_dec(stored_key);
                        }
                        return Err(e);
                    }
                };
            }

            if pos < head.size {
                self.zone
                    .copy(head.key(pos), head.key(pos + 1), (head.size - pos) * 8);
            }
            self.zone.write_u32(head.key(pos), 0);
            self.zone.write_u32(head.value(pos), 0);
            head.size += 1;
            self.zone.write_u32(head.offset, head.size);
        }

        if stored_key == key && do_ref {
            self.ref_inc(key);
        }

        let old_key = ObjId(self.zone.read_u32(head.key(pos)));
        let old_value = ObjId(self.zone.read_u32(head.value(pos)));

        self.zone.write_u32(head.key(pos), stored_key.0);
        self.zone.write_u32(head.value(pos), value.0);

        if do_ref {
            self.ref_inc(value);
        }
        // a replaced entry was owned by the hash either way
        self.ref_dec(old_key);
        self.ref_dec(old_value);

        // uncounted sets hand the caller's reference over; the copy replaces it
        if stored_key != key && !do_ref {
            self.ref_dec(key);
        }

        Ok(())
    }

    /// Make room for more pairs; the payload may move
    fn hash_grow(&mut self, id: ObjId, max: u32) -> VmResult<Head> {
        let max = max + (max >> 3) + 0x10;
        self.realloc(id, hash_payload_size(max).ok_or(VmErr::NoMemory)?)?;

        let (offset, _) = self.span(id).ok_or(VmErr::Internal)?;
        self.zone.write_u32(offset + 4, max);

        self.hash_head_of(id).ok_or(VmErr::Internal)
    }

    /// Look `key` up in `id` and then its parents; yields the hash the
    /// key was found in and the bound value
    pub fn hash_get(&self, id: ObjId, key: &[u8]) -> Option<(ObjId, ObjId)> {
        let mut hash = id;

        for _ in 0..=MAX_PARENT_DEPTH {
            let head = self.hash_head_of(hash)?;
            let (pos, found) = self.find_key(&head, key);

            if found {
                return Some((hash, ObjId(self.zone.read_u32(head.value(pos)))));
            }

            if head.parent.is_nil() {
                break;
            }
            hash = head.parent;
        }

        None
    }

    pub fn hash_del(&mut self, id: ObjId, key: &[u8], do_ref: bool) -> VmResult<()> {
        let head = self.hash_head_of(id).ok_or(VmErr::InvalidArguments)?;
        let (pos, found) = self.find_key(&head, key);

        if !found {
            return Ok(());
        }

        let old_key = ObjId(self.zone.read_u32(head.key(pos)));
        let old_value = ObjId(self.zone.read_u32(head.value(pos)));
        let size = head.size - 1;

        if pos < size {
            self.zone
                .copy(head.key(pos + 1), head.key(pos), (size - pos) * 8);
        }
        self.zone.write_u32(head.key(size), 0);
        self.zone.write_u32(head.value(size), 0);
        self.zone.write_u32(head.offset, size);

        if do_ref {
            self.ref_dec(old_key);
            self.ref_dec(old_value);
        }

        Ok(())
    }

    pub fn hash_parent(&self, id: ObjId) -> ObjId {
        self.hash_head_of(id).map_or(ObjId::NIL, |h| h.parent)
    }

    /// Replace the parent link, adjusting references
    pub fn hash_set_parent(&mut self, id: ObjId, parent: ObjId) -> VmResult<()> {
        let head = self.hash_head_of(id).ok_or(VmErr::InvalidArguments)?;

        self.zone.write_u32(head.offset + 8, parent.0);
        self.ref_inc(parent);
        self.ref_dec(head.parent);

        Ok(())
    }

    /// Key/value pairs in stored order
    pub fn hash_pairs(&self, id: ObjId) -> Vec<(ObjId, ObjId)> {
        match self.hash_head_of(id) {
            Some(h) => (0..h.size)
                .map(|u| {
                    (
                        ObjId(self.zone.read_u32(h.key(u))),
                        ObjId(self.zone.read_u32(h.value(u))),
                    )
                })
                .collect(),
            None => vec![],
        }
    }

    pub(crate) fn hash_children(&self, obj: &Obj) -> Vec<ObjId> {
        let head = match self.hash_head(obj) {
            Some(h) => h,
            None => return vec![],
        };

        let mut ids = vec![head.parent];
        for u in 0..head.size {
            ids.push(ObjId(self.zone.read_u32(head.key(u))));
            ids.push(ObjId(self.zone.read_u32(head.value(u))));
        }
        ids.retain(|id| !id.is_nil());

        ids
    }

    pub(crate) fn hash_iterate(&mut self, obj: &Obj, idx: &mut u32) -> VmResult<Yield> {
        let head = match self.hash_head(obj) {
            Some(h) => h,
            None => {
                *idx = 0;
                return Err(VmErr::Internal);
            }
        };

        if *idx >= head.size {
            return Ok(Yield::Done);
        }

        let key = ObjId(self.zone.read_u32(head.key(*idx)));
        let value = ObjId(self.zone.read_u32(head.value(*idx)));
        self.ref_inc(key);
        self.ref_inc(value);
        *idx += 1;

        Ok(Yield::Two(key, value))
    }

    pub(crate) fn hash_dump(&self, obj: &Obj, style: DumpStyle, out: &mut String) -> bool {
        let head = match self.hash_head(obj) {
            Some(h) => h,
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
            *out += &format!("size {}, max {}", head.size, head.max);
            if !head.parent.is_nil() {
                *out += &format!(", parent {}", self.id2str(head.parent));
            }
            return true;
        }

        let item = DumpStyle {
            inspect: style.inspect,
            no_nl: true,
            ..DumpStyle::default()
        };

        for u in 0..head.size {
            if style.max != 0 && u >= style.max {
                break;
            }

            let key = ObjId(self.zone.read_u32(head.key(u)));
            if key.is_nil() {
                continue;
            }
            let value = ObjId(self.zone.read_u32(head.value(u)));

            if style.dump {
                *out += "    ";
            }
            *out += &self.dump(key, item);
            *out += " => ";
            *out += &self.dump(value, item);
            out.push('\n');
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::core::SubType;
    use super::*;

    fn keys(s: &Store, h: ObjId) -> Vec<Vec<u8>> {
        s.hash_pairs(h)
            .into_iter()
            .map(|(k, _)| s.mem_bytes(k).to_vec())
            .collect()
    }

    fn set_int(s: &mut Store, h: ObjId, key: &[u8], val: i64) {
        let k = s.const_new(key, SubType::String).unwrap();
        let v = s.num_new(val, SubType::Int).unwrap();
        s.hash_set(h, k, v, false).unwrap();
    }

    fn get_int(s: &Store, h: ObjId, key: &[u8]) -> Option<i64> {
        s.hash_get(h, key).and_then(|(_, v)| s.get(v)?.value())
    }

    #[test]
    fn sorted_keys() {
        let mut s = Store::new(0x4000, 2).unwrap();
        let h = s.hash_new(2).unwrap();

        for (n, k) in [&b"foo"[..], b"bar", b"ba", b"zz", b"a", b"bar"]
            .iter()
            .enumerate()
        {
            set_int(&mut s, h, k, n as i64);
        }

        assert_eq!(
            vec![
                b"a".to_vec(),
                b"ba".to_vec(),
                b"bar".to_vec(),
                b"foo".to_vec(),
                b"zz".to_vec()
            ],
            keys(&s, h)
        );
        assert_eq!(Some(5), get_int(&s, h, b"bar"));
        assert_eq!(None, get_int(&s, h, b"b"));
        s.check_heap().unwrap();
    }

    #[test]
    fn delete_keeps_order() {
        let mut s = Store::new(0x4000, 2).unwrap();
        let h = s.hash_new(0).unwrap();

        for (n, k) in [&b"c"[..], b"a", b"b"].iter().enumerate() {
            set_int(&mut s, h, k, n as i64);
        }

        s.hash_del(h, b"b", true).unwrap();
        s.hash_del(h, b"missing", true).unwrap();

        assert_eq!(vec![b"a".to_vec(), b"c".to_vec()], keys(&s, h));
        assert_eq!(Some(0), get_int(&s, h, b"c"));
    }

    #[test]
    fn parent_chain() {
        let mut s = Store::new(0x4000, 2).unwrap();
        let parent = s.hash_new(0).unwrap();
        let child = s.hash_new(0).unwrap();

        set_int(&mut s, parent, b"x", 10);
        set_int(&mut s, child, b"y", 20);
        s.hash_set_parent(child, parent).unwrap();

        assert_eq!(Some(10), get_int(&s, child, b"x"));
        assert_eq!(Some(parent), s.hash_get(child, b"x").map(|(h, _)| h));
        assert_eq!(Some(child), s.hash_get(child, b"y").map(|(h, _)| h));
        assert!(s.contains(child, parent));
    }

    #[test]
    fn cyclic_parents_terminate() {
        let mut s = Store::new(0x4000, 2).unwrap();
        let a = s.hash_new(0).unwrap();
        let b = s.hash_new(0).unwrap();

        s.hash_set_parent(a, b).unwrap();
        s.hash_set_parent(b, a).unwrap();

        assert_eq!(None, s.hash_get(a, b"nope"));
    }

    #[test]
    fn writable_key_is_copied() {
        let mut s = Store::new(0x4000, 2).unwrap();
        let h = s.hash_new(0).unwrap();

        let k = s.mem_new(1, SubType::String).unwrap();
        s.mem_set(k, b'k', 0).unwrap();
        let v = s.num_new(1, SubType::Int).unwrap();

        s.hash_set(h, k, v, true).unwrap();

        let (stored, _) = s.hash_pairs(h)[0];
        assert_ne!(k, stored);
        assert_eq!(b"k", s.mem_bytes(stored));
        assert_eq!(1, s.get(k).unwrap().ref_cnt);
        assert_eq!(2, s.get(v).unwrap().ref_cnt);
    }

    #[test]
    fn failed_key_copy_adds_nothing() {
        let mut s = Store::new(0x4000, 2).unwrap();
        let h = s.hash_new(4).unwrap();
        set_int(&mut s, h, b"a", 1);

        let k = s.mem_new(0x400, SubType::String).unwrap();
        let v = s.num_new(2, SubType::Int).unwrap();

        // leave no room for a copy of the key
        while s.mem_new(0x40, SubType::String).is_ok() {}

        assert_eq!(Err(VmErr::NoMemory), s.hash_set(h, k, v, true));

        assert_eq!(vec![b"a".to_vec()], keys(&s, h));
        assert_eq!(Some(1), get_int(&s, h, b"a"));
        assert_eq!(1, s.get(k).unwrap().ref_cnt);
        assert_eq!(1, s.get(v).unwrap().ref_cnt);
        s.check_heap().unwrap();
    }

    #[test]
    fn iterate_pairs() {
        let mut s = Store::new(0x4000, 2).unwrap();
        let h = s.hash_new(0).unwrap();
        set_int(&mut s, h, b"b", 2);
        set_int(&mut s, h, b"a", 1);

        let mut idx = 0;
        match s.iterate(h, &mut idx).unwrap() {
            Yield::Two(k, v) => {
                assert_eq!(b"a", s.mem_bytes(k));
                assert_eq!(Some(1), s.get(v).unwrap().value());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(s.iterate(h, &mut idx).unwrap(), Yield::Two(..)));
        assert_eq!(Yield::Done, s.iterate(h, &mut idx).unwrap());
    }
}
