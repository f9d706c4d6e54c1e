//! Engine-wide fundamental type ids
//!
//! Modules describe primitive types with their own local ids and translate
//! them into this fixed space through their fundamental map. Each entry
//! names its ABI type and the converters used in each direction.

use crate::convert::{ids, ConverterId};
use crate::interop::AbiType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Fundamental {
    Void,
    Bool,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Int64,
    UInt64,
    SizeT,
    SSizeT,
    Float,
    Double,
    Enum,
    Flags,
    /// Untyped or typed data pointer
    Pointer,
    /// `char*`
    String,
    /// Structure by value
    Struct,
    /// Pointer to a structure
    Object,
    /// Function pointer
    Callback,
    /// Marker consuming every remaining script argument
    Vararg,
}

/// Static metadata for one fundamental type
#[derive(Debug)]
pub struct FundamentalInfo {
    pub name: &'static str,
    pub abi: Option<AbiType>,
    pub forward: Option<ConverterId>,
    pub reverse: Option<ConverterId>,
    pub field_get: Option<ConverterId>,
    pub field_set: Option<ConverterId>,
}

const fn entry(
    name: &'static str,
    abi: Option<AbiType>,
    forward: Option<ConverterId>,
    reverse: Option<ConverterId>,
    field_get: Option<ConverterId>,
    field_set: Option<ConverterId>,
) -> FundamentalInfo {
    FundamentalInfo {
        name,
        abi,
        forward,
        reverse,
        field_get,
        field_set,
    }
}

const fn scalar(name: &'static str, abi: AbiType, id: ConverterId) -> FundamentalInfo {
    entry(name, Some(abi), Some(id), Some(id), Some(id), Some(id))
}

static FUNDAMENTALS: [FundamentalInfo; 24] = [
    entry("void", Some(AbiType::Void), None, Some(ids::VOID), None, None),
    scalar("bool", AbiType::U8, ids::BOOL),
    scalar("char", AbiType::I8, ids::SIGNED),
    scalar("unsigned char", AbiType::U8, ids::UNSIGNED),
    scalar("short", AbiType::I16, ids::SIGNED),
    scalar("unsigned short", AbiType::U16, ids::UNSIGNED),
    scalar("int", AbiType::I32, ids::SIGNED),
    scalar("unsigned int", AbiType::U32, ids::UNSIGNED),
    scalar("long", AbiType::LONG, ids::SIGNED),
    scalar("unsigned long", AbiType::ULONG, ids::UNSIGNED),
    scalar("int64_t", AbiType::I64, ids::SIGNED),
    scalar("uint64_t", AbiType::U64, ids::UNSIGNED),
    scalar("size_t", AbiType::USIZE, ids::UNSIGNED),
    scalar("ssize_t", AbiType::ISIZE, ids::SIGNED),
    scalar("float", AbiType::F32, ids::FLOAT),
    scalar("double", AbiType::F64, ids::FLOAT),
    scalar("enum", AbiType::I32, ids::ENUM),
    scalar("flags", AbiType::U32, ids::ENUM),
    scalar("pointer", AbiType::Pointer, ids::POINTER),
    entry(
        "string",
        Some(AbiType::Pointer),
        Some(ids::STRING),
        Some(ids::STRING),
        Some(ids::STRING),
        None,
    ),
    entry("struct", None, None, None, Some(ids::STRUCT), None),
    scalar("object", AbiType::Pointer, ids::OBJECT),
    scalar("callback", AbiType::Pointer, ids::CALLBACK),
    entry("vararg", None, Some(ids::VARARG), None, None, None),
];

impl Fundamental {
    #[inline]
    pub fn info(self) -> &'static FundamentalInfo {
        &FUNDAMENTALS[self as usize]
    }

    #[inline]
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Kinds a value of this fundamental may be read back as a plain number
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Bool
                | Self::Char
                | Self::UChar
                | Self::Short
                | Self::UShort
                | Self::Int
                | Self::UInt
                | Self::Long
                | Self::ULong
                | Self::Int64
                | Self::UInt64
                | Self::SizeT
                | Self::SSizeT
                | Self::Float
                | Self::Double
                | Self::Enum
                | Self::Flags
        )
    }
}
