//! The closed, single-byte-discriminated well-known/builtin type table
//! (spec §4.10, §6.2): types whose identity is a single byte and that are
//! never memoized, plus the small set of builtins whose `TypeInfo` is
//! derived locally instead of negotiated over the stream (spec §4.3).
//!
//! Grounded on `llvm-bitcode::schema::blocks::BlockId` /
//! `schema::enums::*` — closed `#[repr(u8)] enum` + `TryFromPrimitive`
//! tables of stable wire ordinals, one per concern.

use std::rc::Rc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::typeinfo::{TypeFlags, TypeInfo, TypeMode};

/// Stable, single-byte ordinals for builtin/well-known types (spec §6.2's
/// "…well-known types…" tail of the `TypeOperation` enum, split out here
/// because `num_enum` wants one coherent discriminant space per enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
#[non_exhaustive]
pub enum WellKnownType {
    Void = 0,
    Object = 1,
    Boolean = 2,
    Char = 3,
    SByte = 4,
    Byte = 5,
    Int16 = 6,
    UInt16 = 7,
    Int32 = 8,
    UInt32 = 9,
    Int64 = 10,
    UInt64 = 11,
    Single = 12,
    Double = 13,
    Decimal = 14,
    String = 15,
    /// `System.Type`, i.e. a boxed reflection handle naming a type.
    TypeOfType = 16,
    Assembly = 17,
    Module = 18,
    MethodBase = 19,
    FieldInfo = 20,
    PropertyInfo = 21,
    EventInfo = 22,
    DBNull = 23,
}

impl WellKnownType {
    #[must_use]
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            Self::Boolean
                | Self::Char
                | Self::SByte
                | Self::Byte
                | Self::Int16
                | Self::UInt16
                | Self::Int32
                | Self::UInt32
                | Self::Int64
                | Self::UInt64
                | Self::Single
                | Self::Double
        )
    }

    /// Fixed width in bytes for the array fast path (spec §4.6); `None` for
    /// non-fixed-width builtins (strings, reflection handles).
    #[must_use]
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Boolean | Self::SByte | Self::Byte => Some(1),
            Self::Char | Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Single => Some(4),
            Self::Int64 | Self::UInt64 | Self::Double => Some(8),
            Self::Decimal => Some(16),
            _ => None,
        }
    }

    #[must_use]
    fn cached_type_info(self) -> Rc<TypeInfo> {
        let mut flags = TypeFlags::empty();
        if self.is_primitive() || matches!(self, Self::Decimal) {
            flags |= TypeFlags::IS_VALUE_TYPE | TypeFlags::IS_SEALED;
        }
        if matches!(self, Self::String | Self::TypeOfType) {
            flags |= TypeFlags::IS_SEALED;
        }
        Rc::new(TypeInfo {
            flags,
            mode: TypeMode::Builtin,
            serialized_fields: Vec::new(),
            element: None,
            tuple_arguments: Vec::new(),
            type_code: None,
            error: None,
            builtin: Some(self),
            type_handle: None,
        })
    }
}

// `TypeInfo` nests `Rc`s, so it can't live behind a `Sync` `static`. The
// engine is single-threaded, so a thread-local cache of `OnceCell`s gives
// each builtin a `TypeInfo` that's derived once and reused for the rest of
// the process without requiring `Send`/`Sync`.
thread_local! {
    static CACHE: [std::cell::OnceCell<Rc<TypeInfo>>; 24] = const { [const { std::cell::OnceCell::new() }; 24] };
}

/// Process-wide (practically: per-thread) cached `TypeInfo` for a builtin
/// (spec §3 invariant: "builtins use a process-wide cached `TypeInfo`").
#[must_use]
pub fn cached_type_info(kind: WellKnownType) -> Rc<TypeInfo> {
    CACHE.with(|cache| {
        cache[u8::from(kind) as usize]
            .get_or_init(|| kind.cached_type_info())
            .clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_widths_match_spec_array_fast_path() {
        assert_eq!(WellKnownType::Boolean.fixed_width(), Some(1));
        assert_eq!(WellKnownType::Char.fixed_width(), Some(2));
        assert_eq!(WellKnownType::Int32.fixed_width(), Some(4));
        assert_eq!(WellKnownType::Double.fixed_width(), Some(8));
        assert_eq!(WellKnownType::String.fixed_width(), None);
    }

    #[test]
    fn cache_is_stable_across_calls() {
        let a = cached_type_info(WellKnownType::Int32);
        let b = cached_type_info(WellKnownType::Int32);
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn wire_ordinal_roundtrip() {
        let byte: u8 = WellKnownType::Int64.into();
        assert_eq!(WellKnownType::try_from(byte).unwrap(), WellKnownType::Int64);
    }
}
