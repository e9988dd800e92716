// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/core.rs

// Core definitions shared by every part of the VM: object ids, object
// records, base and sub type tags, and the error taxonomy.

// <>

use std::fmt;

use thiserror::Error;

/// Declares a `u8`-backed enum along with a `TryFrom<u8>` conversion
macro_rules! enum_and_tryfrom {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($(#[$vmeta:meta])* $vname:ident $(= $val:expr)?,)*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $vname $(= $val)?,)*
        }

        impl std::convert::TryFrom<u8> for $name {
            type Error = ();

            #[inline(always)]
            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $(x if x == $name::$vname as u8 => Ok($name::$vname),)*
                    _ => Err(()),
                }
            }
        }
    }
}

/// Value of the 7 byte comment every program starts with
pub const GFXBOOT_MAGIC: u64 = 0x4a_a7_7b_c3_9f_10_2e;

/// Generation counter width; the generation sits in the top bits of an id
pub const OBJ_ID_GEN_BITS: u32 = 8;
const OBJ_ID_IDX_BITS: u32 = 32 - OBJ_ID_GEN_BITS;
const OBJ_ID_IDX_MASK: u32 = (1 << OBJ_ID_IDX_BITS) - 1;

/// Largest number of object slots an id can address
pub const OBJ_ID_MAX_IDX: u32 = OBJ_ID_IDX_MASK;

/// Handle to an object table slot, checked against the slot's
/// generation on every dereference
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjId(pub u32);

impl ObjId {
    pub const NIL: ObjId = ObjId(0);

    pub const fn new(idx: u32, gen: u8) -> Self {
        ObjId((idx & OBJ_ID_IDX_MASK) | ((gen as u32) << OBJ_ID_IDX_BITS))
    }

    pub const fn idx(self) -> u32 {
        self.0 & OBJ_ID_IDX_MASK
    }

    pub const fn gen(self) -> u8 {
        (self.0 >> OBJ_ID_IDX_BITS) as u8
    }

    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.idx(), self.gen())
    }
}

enum_and_tryfrom! {
    /// Payload kind of an object
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    pub enum BaseType {
        None = 0,
        Mem = 1,
        OList = 2,
        Font = 3,
        Canvas = 4,
        Array = 5,
        Hash = 6,
        Context = 7,
        Num = 8,
        Invalid = 9,
    }
}

impl BaseType {
    /// Maps any tag value to a base type; unknown tags become `Invalid`
    pub fn from_tag(tag: u8) -> Self {
        BaseType::try_from(tag).unwrap_or(BaseType::Invalid)
    }

    pub fn name(self) -> &'static str {
        match self {
            BaseType::None => "nil",
            BaseType::Mem => "mem",
            BaseType::OList => "olist",
            BaseType::Font => "font",
            BaseType::Canvas => "canv",
            BaseType::Array => "array",
            BaseType::Hash => "hash",
            BaseType::Context => "ctx",
            BaseType::Num => "num",
            BaseType::Invalid => "???",
        }
    }

    /// Whether objects of this type keep their payload in the allocator
    pub fn data_is_ptr(self) -> bool {
        match self {
            BaseType::Mem
            | BaseType::OList
            | BaseType::Font
            | BaseType::Canvas
            | BaseType::Array
            | BaseType::Hash
            | BaseType::Context => true,
            BaseType::None | BaseType::Num | BaseType::Invalid => false,
        }
    }
}

enum_and_tryfrom! {
    /// Semantic tag; instruction types and value sub types share one
    /// numbering so a decoded literal keeps its instruction type as tag
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    #[repr(u8)]
    pub enum SubType {
        Skip = 0,
        Nil = 1,
        Int = 2,
        Bool = 3,
        String = 4,
        Word = 5,
        Ref = 6,
        Get = 7,
        Set = 8,
        Prim = 9,
        Code = 10,
        Comment = 11,
        Xref = 12,
        CtxBlock = 16,
        CtxFunc = 17,
        CtxLoop = 18,
        CtxRepeat = 19,
        CtxFor = 20,
        CtxForall = 21,
    }
}

impl SubType {
    pub fn name(self) -> &'static str {
        match self {
            SubType::Skip => "skip",
            SubType::Nil => "nil",
            SubType::Int => "int",
            SubType::Bool => "bool",
            SubType::String => "string",
            SubType::Word => "word",
            SubType::Ref => "ref",
            SubType::Get => "get",
            SubType::Set => "set",
            SubType::Prim => "prim",
            SubType::Code => "code",
            SubType::Comment => "comment",
            SubType::Xref => "xref",
            SubType::CtxBlock => "block",
            SubType::CtxFunc => "func",
            SubType::CtxLoop => "loop",
            SubType::CtxRepeat => "repeat",
            SubType::CtxFor => "for",
            SubType::CtxForall => "forall",
        }
    }

    /// Instruction types followed by a byte payload
    pub fn expects_data(self) -> bool {
        matches!(
            self,
            SubType::String
                | SubType::Word
                | SubType::Ref
                | SubType::Get
                | SubType::Set
                | SubType::Code
                | SubType::Comment
        )
    }
}

/// Error register contents; "ok" is the absence of a `VmErr`
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VmErr {
    #[error("invalid code")]
    InvalidCode = 1,
    #[error("invalid instruction")]
    InvalidInstruction = 2,
    #[error("no array start")]
    NoArrayStart = 3,
    #[error("no hash start")]
    NoHashStart = 4,
    #[error("no memory")]
    NoMemory = 5,
    #[error("invalid hash key")]
    InvalidHashKey = 6,
    #[error("stack underflow")]
    StackUnderflow = 7,
    #[error("internal")]
    Internal = 8,
    #[error("no loop context")]
    NoLoopContext = 9,
    #[error("invalid range")]
    InvalidRange = 10,
    #[error("invalid data")]
    InvalidData = 11,
    #[error("readonly")]
    Readonly = 12,
    #[error("invalid arguments")]
    InvalidArguments = 13,
    #[error("div by zero")]
    DivByZero = 14,
    #[error("memory corruption")]
    MemoryCorruption = 15,
}

impl VmErr {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Converts a numeric error code back; 0 (ok) and unknown codes give `None`
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => VmErr::InvalidCode,
            2 => VmErr::InvalidInstruction,
            3 => VmErr::NoArrayStart,
            4 => VmErr::NoHashStart,
            5 => VmErr::NoMemory,
            6 => VmErr::InvalidHashKey,
            7 => VmErr::StackUnderflow,
            8 => VmErr::Internal,
            9 => VmErr::NoLoopContext,
            10 => VmErr::InvalidRange,
            11 => VmErr::InvalidData,
            12 => VmErr::Readonly,
            13 => VmErr::InvalidArguments,
            14 => VmErr::DivByZero,
            15 => VmErr::MemoryCorruption,
            _ => return None,
        })
    }
}

pub type VmResult<T> = Result<T, VmErr>;

/// Object payload: a slice of allocator memory or an inline scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Data {
    /// `offset` is absolute within the allocator arena; `ref_id`, when
    /// set, names the object whose chunk actually holds the bytes
    Ptr { offset: u32, size: u32, ref_id: ObjId },
    Value(i64),
}

impl Default for Data {
    fn default() -> Self {
        Data::Value(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// read only
    pub ro: bool,
    /// data is not owned; never hand it back to the allocator
    pub nofree: bool,
    /// some other object aliases this object's data
    pub has_ref: bool,
    pub sticky: bool,
    /// hash is a class or a class instance
    pub class: bool,
}

/// Reference count sentinel for objects that are never collected
pub const REF_CNT_STICKY: u32 = u32::MAX;

/// One object table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Obj {
    pub base_type: BaseType,
    pub sub_type: SubType,
    pub ref_cnt: u32,
    pub gen: u8,
    pub flags: Flags,
    pub data: Data,
}

impl Obj {
    /// An empty slot that remembers its last generation
    pub const fn vacant(gen: u8) -> Self {
        Obj {
            base_type: BaseType::None,
            sub_type: SubType::Skip,
            ref_cnt: 0,
            gen,
            flags: Flags {
                ro: false,
                nofree: false,
                has_ref: false,
                sticky: false,
                class: false,
            },
            data: Data::Value(0),
        }
    }

    pub fn is_vacant(&self) -> bool {
        self.base_type == BaseType::None
    }

    pub fn data_is_ptr(&self) -> bool {
        matches!(self.data, Data::Ptr { .. })
    }

    /// `(offset, size)` of pointer-backed data
    pub fn span(&self) -> Option<(u32, u32)> {
        match self.data {
            Data::Ptr { offset, size, .. } => Some((offset, size)),
            Data::Value(_) => None,
        }
    }

    pub fn ref_id(&self) -> ObjId {
        match self.data {
            Data::Ptr { ref_id, .. } => ref_id,
            Data::Value(_) => ObjId::NIL,
        }
    }

    pub fn value(&self) -> Option<i64> {
        match self.data {
            Data::Value(v) => Some(v),
            Data::Ptr { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_fields() {
        let id = ObjId::new(0x12345, 7);
        assert_eq!(0x12345, id.idx());
        assert_eq!(7, id.gen());
        assert_eq!(0x0701_2345, id.0);
        assert!(ObjId::NIL.is_nil());
        assert!(!ObjId::new(0, 1).is_nil());
    }

    #[test]
    fn error_codes() {
        for code in 1..=15 {
            let err = VmErr::from_code(code).unwrap();
            assert_eq!(code, err.code());
        }
        assert_eq!(None, VmErr::from_code(0));
        assert_eq!(None, VmErr::from_code(16));
        assert_eq!("div by zero", VmErr::DivByZero.to_string());
    }

    #[test]
    fn type_tags() {
        assert_eq!(BaseType::Invalid, BaseType::from_tag(200));
        assert_eq!(BaseType::Hash, BaseType::from_tag(6));
        assert_eq!(Ok(SubType::Xref), SubType::try_from(12));
        assert!(SubType::try_from(13).is_err());
        assert!(SubType::Code.expects_data());
        assert!(!SubType::Int.expects_data());
    }
}
