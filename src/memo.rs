//! The memo table (spec §3, §4.2): append-only, 1-based ids, giving every
//! memoized object a stream-stable identity so back-references and cycles
//! round-trip.
//!
//! Grounded on `llvm-bitcode::read::BitStreamReader`'s `global_abbrevs:
//! HashMap<u32, Vec<Arc<Abbreviation>>>` — the same "hand out a small
//! integer id for something that would otherwise be duplicated wholesale"
//! shape, just keyed by physical identity instead of block id.

use std::collections::HashMap;

use crate::error::Error;
use crate::model::RuntimeValue;

/// The byte preceding most reference-typed values (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectOperation {
    Null = 0,
    Memo = 1,
    Object = 2,
}

impl ObjectOperation {
    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0 => Ok(Self::Null),
            1 => Ok(Self::Memo),
            2 => Ok(Self::Object),
            _ => Err(Error::UnknownOperation {
                what: "object",
                byte,
            }),
        }
    }
}

/// Encode-side memo: physical identity -> id. `memo_id`s are handed out in
/// first-publish order starting at 1; `0` never appears here ("no memo").
#[derive(Default)]
pub struct EncodeMemo {
    ids: HashMap<usize, u32>,
    next_id: u32,
}

impl EncodeMemo {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            next_id: 1,
        }
    }

    /// Returns the existing id for `value`'s identity, if any.
    #[must_use]
    pub fn lookup(&self, value: &RuntimeValue) -> Option<u32> {
        value.identity().and_then(|ptr| self.ids.get(&ptr).copied())
    }

    /// Publishes a brand-new identity and returns its freshly allocated id.
    /// Panics if `value` has no physical identity to memoize, or if it is
    /// already published — callers must check [`EncodeMemo::lookup`] first.
    pub fn publish(&mut self, value: &RuntimeValue) -> u32 {
        let ptr = value
            .identity()
            .expect("only reference-identity values are memoized");
        let id = self.next_id;
        self.next_id += 1;
        let prior = self.ids.insert(ptr, id);
        debug_assert!(prior.is_none(), "value published twice");
        log::trace!("memo publish: id {id} -> identity {ptr:#x}");
        id
    }
}

/// Decode-side memo: id -> reconstructed value, append-only in stream order.
#[derive(Default)]
pub struct DecodeMemo {
    values: Vec<RuntimeValue>,
}

impl DecodeMemo {
    #[must_use]
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Reserves the next id and stores `value` for it (the "pre-publish"
    /// step of spec §4.2/§9: this happens *before* fields are filled in for
    /// self-referential aggregates, which is why callers pass a clone of a
    /// reference-counted handle and mutate through it afterward).
    pub fn publish(&mut self, value: RuntimeValue) -> u32 {
        self.values.push(value);
        let id = self.values.len() as u32;
        log::trace!("memo publish: id {id}");
        id
    }

    /// Looks up a previously published id. `0` is never a valid argument —
    /// callers check for "no memo" before calling this.
    pub fn get(&self, id: u32) -> Result<RuntimeValue, Error> {
        let value = self
            .values
            .get(id.checked_sub(1).ok_or(Error::BadMemo(0))? as usize)
            .cloned()
            .ok_or(Error::BadMemo(id))?;
        log::trace!("memo back-reference: id {id}");
        Ok(value)
    }

    #[must_use]
    pub fn next_id(&self) -> u32 {
        self.values.len() as u32 + 1
    }

    /// Overwrites an already-published slot. Used when a placeholder handed
    /// out before a value's body was fully read (to support self-referential
    /// cycles) turns out not to be the final value — the reducer path builds
    /// the real instance only after the placeholder was already published and
    /// possibly observed by a back-reference earlier in the same object's own
    /// argument list.
    pub fn replace(&mut self, id: u32, value: RuntimeValue) {
        let index = (id - 1) as usize;
        debug_assert!(index < self.values.len(), "replace called on an unpublished id");
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }
}
