// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// tests/properties.rs

// <>

use gfxboot::vm::code::decode;
use gfxboot::vm::memmgt::Zone;
use gfxboot::vm::{Assembler, BaseType, ObjId, Store, SubType};

use proptest::collection::vec;
use proptest::prelude::*;

fn store() -> Store {
    Store::new(0x10000, 2).unwrap()
}

proptest! {
    #[test]
    fn ints_decode_to_themselves(val in any::<i64>()) {
        let bytes = Assembler::bare().int(val).finish();
        let instr = decode(&bytes).unwrap();

        prop_assert_eq!(SubType::Int, instr.kind);
        prop_assert_eq!(val, instr.arg1);
        prop_assert_eq!(bytes.len() as u32, instr.size);
        prop_assert_eq!(None, instr.payload);
        prop_assert_eq!(bytes, Assembler::bare().int(instr.arg1).finish());
    }

    #[test]
    fn strings_keep_their_payload(text in vec(any::<u8>(), 0..400)) {
        let bytes = Assembler::bare().string(&text).finish();
        let instr = decode(&bytes).unwrap();
        let start = instr.payload.unwrap() as usize;

        prop_assert_eq!(SubType::String, instr.kind);
        prop_assert_eq!(text.len() as i64, instr.arg1);
        prop_assert_eq!(bytes.len() as u32, instr.size);
        prop_assert_eq!(&text[..], &bytes[start..]);
    }

    #[test]
    fn truncated_instructions_are_rejected(text in vec(any::<u8>(), 1..40), cut in 1usize..40) {
        let bytes = Assembler::bare().string(&text).finish();
        let cut = cut.min(bytes.len() - 1);

        prop_assert!(decode(&bytes[..bytes.len() - cut]).is_err());
    }

    #[test]
    fn freeing_everything_leaves_one_chunk(
        sizes in vec(0u32..300, 1..50),
        order in any::<proptest::sample::Index>(),
    ) {
        let mut zone = Zone::new(0x8000).unwrap();
        let mut live = Vec::new();

        for (n, size) in sizes.iter().enumerate() {
            let id = ObjId::new(n as u32 + 1, 1);
            live.push(zone.alloc(*size, id).unwrap());
        }

        // rotated so merges happen on both sides
        let start = order.index(live.len());
        live.rotate_left(start);
        for data in live {
            zone.free(data).unwrap();
        }

        let chunks: Vec<_> = zone.chunks().collect();
        prop_assert_eq!(1, chunks.len());
        prop_assert!(chunks[0].is_free());
        prop_assert_eq!(0, chunks[0].offset);
        prop_assert_eq!(zone.size(), chunks[0].next);
        zone.check_chain().unwrap();
    }

    #[test]
    fn hash_keys_stay_sorted(keys in vec(vec(b'a'..=b'e', 0..4), 1..40)) {
        let mut s = store();
        let hash = s.hash_new(4).unwrap();

        for (n, key) in keys.iter().enumerate() {
            let k = s.mem_new(key.len() as u32, SubType::Ref).unwrap();
            for (pos, b) in key.iter().enumerate() {
                s.mem_set(k, *b, pos as i64).unwrap();
            }

            let v = s.num_new(n as i64, SubType::Int).unwrap();
            s.hash_set(hash, k, v, false).unwrap();
        }

        let stored: Vec<Vec<u8>> = s
            .hash_pairs(hash)
            .iter()
            .map(|(k, _)| s.mem_bytes(*k).to_vec())
            .collect();

        let mut expected = keys.clone();
        expected.sort();
        expected.dedup();
        prop_assert_eq!(expected, stored);

        // the last binding of a key wins
        for (n, key) in keys.iter().enumerate() {
            if keys[n + 1..].contains(key) {
                continue;
            }
            let (found, value) = s.hash_get(hash, key).unwrap();
            prop_assert_eq!(hash, found);
            prop_assert_eq!(Some(n as i64), s.num_value(value));
        }

        s.check_heap().unwrap();
    }

    #[test]
    fn freeing_and_compacting_keeps_data(
        objs in vec((0u32..200, any::<bool>()), 1..40),
        steps in 1u32..64,
    ) {
        let mut s = store();
        let mut kept = Vec::new();

        for (n, (size, keep)) in objs.iter().enumerate() {
            let id = s.mem_new(*size, SubType::String).unwrap();
            for pos in 0..*size {
                s.mem_set(id, n as u8, pos as i64).unwrap();
            }

            if *keep {
                kept.push((id, *size, n as u8));
            } else {
                s.ref_dec(id);
                prop_assert!(s.get(id).is_none());
            }
        }

        s.check_heap().unwrap();
        s.defrag(steps).unwrap();
        s.defrag(u32::MAX).unwrap();

        for (id, size, fill) in &kept {
            let obj = s.typed(*id, BaseType::Mem).unwrap();
            prop_assert_eq!(SubType::String, obj.sub_type);

            let bytes = s.mem_bytes(*id);
            prop_assert_eq!(*size as usize, bytes.len());
            prop_assert!(bytes.iter().all(|b| b == fill));
        }

        // compacted: everything free sits in one trailing chunk
        let free: Vec<_> = s.zone().chunks().filter(|c| c.is_free()).collect();
        prop_assert!(free.len() <= 1);
    }

    #[test]
    fn stale_ids_never_resolve(rounds in 1usize..20) {
        let mut s = store();
        let mut stale = Vec::new();

        for n in 0..rounds {
            let id = s.num_new(n as i64, SubType::Int).unwrap();
            s.ref_dec(id);
            stale.push(id);

            let live = s.num_new(-1, SubType::Int).unwrap();
            for old in &stale {
                prop_assert!(s.get(*old).is_none());
            }
            prop_assert_eq!(Some(-1), s.num_value(live));
            s.ref_dec(live);
        }
    }
}
