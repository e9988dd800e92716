// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/code.rs

// Binary instruction format. Every instruction is a header byte, with
// the type in the low nibble and a small argument in the high nibble,
// followed by up to eight little endian extension bytes and, for the
// data carrying types, a payload.

// <>

use super::core::{SubType, VmErr, VmResult, GFXBOOT_MAGIC};
use super::prim;

/// One decoded instruction; `payload` is relative to the decoded slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub kind: SubType,
    /// value for scalar types, payload length for data types
    pub arg1: i64,
    pub payload: Option<u32>,
    /// encoded size, payload included
    pub size: u32,
}

fn decode_number(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0, |val, &b| (val << 8) + b as u64)
}

/// Decode the instruction at the start of `bytes`
pub fn decode(bytes: &[u8]) -> VmResult<Instr> {
    let head = *bytes.first().ok_or(VmErr::InvalidCode)?;
    let kind = SubType::try_from(head & 0x0f).map_err(|_| VmErr::InvalidCode)?;
    let mut n = (head >> 4) as usize;
    let mut size = 1;

    if kind.expects_data() {
        let len = if n >= 12 {
            n -= 11;
            let ext = bytes.get(1..1 + n).ok_or(VmErr::InvalidCode)?;
            size += n;
            decode_number(ext) as usize
        } else {
            n
        };

        let end = size.checked_add(len).ok_or(VmErr::InvalidCode)?;
        if end > bytes.len() {
            return Err(VmErr::InvalidCode);
        }

        return Ok(Instr {
            kind,
            arg1: len as i64,
            payload: Some(size as u32),
            size: end as u32,
        });
    }

    let arg1 = if n >= 8 {
        n -= 7;
        let ext = bytes.get(1..1 + n).ok_or(VmErr::InvalidCode)?;
        size += n;
        let val = decode_number(ext) as i64;

        // only ints are signed
        if kind == SubType::Int && n < 8 {
            let shift = 8 * (8 - n) as u32;
            (val << shift) >> shift
        } else {
            val
        }
    } else {
        n as i64
    };

    Ok(Instr {
        kind,
        arg1,
        payload: None,
        size: size as u32,
    })
}

/// Whether `bytes` start with the program magic
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 8
        && decode_number(&bytes[..8]) == (GFXBOOT_MAGIC << 8) + 0x70 + SubType::Comment as u64
}

/// Smallest little endian width holding `val`
fn unsigned_width(val: u64) -> usize {
    (1..8).find(|&n| val >> (8 * n) == 0).unwrap_or(8)
}

/// Smallest width whose sign extension gives back `val`
fn signed_width(val: i64) -> usize {
    (1..8)
        .find(|&n| {
            let shift = 8 * (8 - n) as u32;
            (val << shift) >> shift == val
        })
        .unwrap_or(8)
}

/// Builds bytecode; used for tests and for embedding small programs
#[derive(Debug, Default, Clone)]
pub struct Assembler {
    buf: Vec<u8>,
    blocks: Vec<usize>,
}

impl Assembler {
    /// A new program, already carrying the magic comment
    pub fn new() -> Self {
        let mut asm = Assembler::default();
        asm.magic();
        asm
    }

    /// Empty stream without magic, for code fragments
    pub fn bare() -> Self {
        Assembler::default()
    }

    pub fn magic(&mut self) -> &mut Self {
        self.comment(&GFXBOOT_MAGIC.to_le_bytes()[..7])
    }

    /// Encode a scalar instruction in its shortest form
    pub fn scalar(&mut self, kind: SubType, val: i64) -> &mut Self {
        if (0..8).contains(&val) {
            self.buf.push(((val as u8) << 4) | kind as u8);
            return self;
        }

        let n = if kind == SubType::Int {
            signed_width(val)
        } else {
            unsigned_width(val as u64)
        };

        self.buf.push((((n + 7) as u8) << 4) | kind as u8);
        self.buf.extend_from_slice(&val.to_le_bytes()[..n]);
        self
    }

    /// Encode a data instruction; payloads are limited to 32 bit lengths
    pub fn data(&mut self, kind: SubType, payload: &[u8]) -> &mut Self {
        let len = payload.len();

        if len < 12 {
            self.buf.push(((len as u8) << 4) | kind as u8);
        } else {
            let n = unsigned_width(len as u64).min(4);
            self.buf.push((((n + 11) as u8) << 4) | kind as u8);
            self.buf.extend_from_slice(&(len as u64).to_le_bytes()[..n]);
        }

        self.buf.extend_from_slice(payload);
        self
    }

    pub fn int(&mut self, val: i64) -> &mut Self {
        self.scalar(SubType::Int, val)
    }

    pub fn bool(&mut self, val: bool) -> &mut Self {
        self.scalar(SubType::Bool, val as i64)
    }

    pub fn nil(&mut self) -> &mut Self {
        self.scalar(SubType::Nil, 0)
    }

    pub fn string(&mut self, text: &[u8]) -> &mut Self {
        self.data(SubType::String, text)
    }

    pub fn word(&mut self, name: &str) -> &mut Self {
        self.data(SubType::Word, name.as_bytes())
    }

    /// `/name`
    pub fn reference(&mut self, name: &str) -> &mut Self {
        self.data(SubType::Ref, name.as_bytes())
    }

    /// `.name`
    pub fn get(&mut self, name: &str) -> &mut Self {
        self.data(SubType::Get, name.as_bytes())
    }

    /// `=name`
    pub fn set(&mut self, name: &str) -> &mut Self {
        self.data(SubType::Set, name.as_bytes())
    }

    pub fn comment(&mut self, text: &[u8]) -> &mut Self {
        self.data(SubType::Comment, text)
    }

    pub fn prim(&mut self, idx: u32) -> &mut Self {
        self.scalar(SubType::Prim, idx as i64)
    }

    /// A primitive by name, or a dictionary lookup for anything else
    pub fn op(&mut self, name: &str) -> &mut Self {
        match prim::prim_index(name) {
            Some(idx) => self.prim(idx),
            None => self.word(name),
        }
    }

    /// Repeat the instruction `distance` bytes back
    pub fn xref(&mut self, distance: u32) -> &mut Self {
        self.scalar(SubType::Xref, distance as i64)
    }

    /// Open a `{` block; close it with `end`
    pub fn begin(&mut self) -> &mut Self {
        self.blocks.push(self.buf.len());
        self
    }

    /// Close the innermost block; the body, `}` included, becomes the
    /// payload of a code instruction
    pub fn end(&mut self) -> &mut Self {
        self.prim(prim::PRIM_CODE_END);

        if let Some(start) = self.blocks.pop() {
            let body = self.buf.split_off(start);
            self.data(SubType::Code, &body);
        }

        self
    }

    /// Current length, handy for computing xref distances
    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(&self) -> Vec<u8> {
        self.buf.clone()
    }
}

/// Human readable listing of a code stream
pub fn disassemble(bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut ip = 0;

    while ip < bytes.len() {
        let instr = match decode(&bytes[ip..]) {
            Ok(instr) => instr,
            Err(_) => {
                out += &format!("{:#06x}  <invalid {:#04x}>\n", ip, bytes[ip]);
                break;
            }
        };

        out += &format!("{:#06x}  {:<8}", ip, instr.kind.name());

        match (instr.kind, instr.payload) {
            (SubType::Code, Some(_)) => {
                // descend into the block instead of skipping it
                out += &format!("[{}]\n", instr.arg1);
                ip += (instr.size as i64 - instr.arg1) as usize;
                continue;
            }
            (_, Some(p)) => {
                let text = &bytes[ip + p as usize..ip + instr.size as usize];
                out += &format!("\"{}\"\n", String::from_utf8_lossy(text).escape_debug());
            }
            (SubType::Prim, None) => {
                let name = prim::PRIMS
                    .get(instr.arg1 as usize)
                    .map_or("?", |(name, _)| *name);
                out += &format!("{} ({})\n", instr.arg1, name);
            }
            (_, None) => out += &format!("{}\n", instr.arg1),
        }

        ip += instr.size as usize;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_forms() {
        let code = Assembler::bare().int(5).nil().bool(true).finish();
        assert_eq!(vec![0x52, 0x01, 0x13], code);

        assert_eq!(
            Instr {
                kind: SubType::Int,
                arg1: 5,
                payload: None,
                size: 1
            },
            decode(&code).unwrap()
        );
    }

    #[test]
    fn sign_extension() {
        let code = Assembler::bare().int(-1).finish();
        assert_eq!(vec![0x82, 0xff], code);
        assert_eq!(-1, decode(&code).unwrap().arg1);

        let code = Assembler::bare().int(200).finish();
        assert_eq!(vec![0x92, 0xc8, 0x00], code);
        assert_eq!(200, decode(&code).unwrap().arg1);

        // non-int scalars stay unsigned
        let code = Assembler::bare().prim(200).finish();
        assert_eq!(vec![0x89, 0xc8], code);
        assert_eq!(200, decode(&code).unwrap().arg1);

        for val in [i64::MIN, i64::MAX, -129, 128, 1 << 40] {
            let code = Assembler::bare().int(val).finish();
            assert_eq!(val, decode(&code).unwrap().arg1);
        }
    }

    #[test]
    fn payloads() {
        let code = Assembler::bare().string(b"Hello!").finish();
        let instr = decode(&code).unwrap();
        assert_eq!(SubType::String, instr.kind);
        assert_eq!(6, instr.arg1);
        assert_eq!(Some(1), instr.payload);
        assert_eq!(7, instr.size);

        let long = vec![b'x'; 300];
        let code = Assembler::bare().string(&long).finish();
        assert_eq!(&[0xd4, 0x2c, 0x01], &code[..3]);
        let instr = decode(&code).unwrap();
        assert_eq!(300, instr.arg1);
        assert_eq!(Some(3), instr.payload);
    }

    #[test]
    fn truncated_input() {
        assert_eq!(Err(VmErr::InvalidCode), decode(&[]));
        assert_eq!(Err(VmErr::InvalidCode), decode(&[0x34, b'a']));
        assert_eq!(Err(VmErr::InvalidCode), decode(&[0xa2, 0x01]));
        assert_eq!(Err(VmErr::InvalidCode), decode(&[0x0d]));
    }

    #[test]
    fn magic_header() {
        let code = Assembler::new().finish();
        assert_eq!(8, code.len());
        assert_eq!(0x7b, code[0]);
        assert!(has_magic(&code));
        assert!(!has_magic(&code[..7]));
        assert!(!has_magic(&Assembler::bare().comment(b"1234567").finish()));
    }

    #[test]
    fn blocks() {
        let code = Assembler::bare().begin().int(1).end().finish();
        let instr = decode(&code).unwrap();

        assert_eq!(SubType::Code, instr.kind);
        assert_eq!(2, instr.arg1);
        assert_eq!(code.len() as u32, instr.size);

        let close = decode(&code[2..]).unwrap();
        assert_eq!(SubType::Prim, close.kind);
        assert_eq!(prim::PRIM_CODE_END as i64, close.arg1);
    }

    #[test]
    fn named_ops() {
        let code = Assembler::bare().op("dup").op("no-such-prim").finish();
        let first = decode(&code).unwrap();

        assert_eq!(SubType::Prim, first.kind);
        assert_eq!(prim::prim_index("dup"), Some(first.arg1 as u32));
        assert_eq!(SubType::Word, decode(&code[first.size as usize..]).unwrap().kind);
    }

    #[test]
    fn listing() {
        let code = Assembler::new().string(b"hi").op("show").finish();
        let text = disassemble(&code);

        assert!(text.contains("string  \"hi\""));
        assert!(text.contains("(show)"));
    }
}
