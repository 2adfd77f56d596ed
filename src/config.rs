//! Injectable engine policy (spec §1: "Assembly filter policy... is an
//! injectable predicate"; design note (b): a target with no code emitter
//! may refuse `Def` and become pure data-pickling).
//!
//! There is no config-file format here — this is an embeddable engine, not
//! a service — so a plain struct with a `Default` impl and builder-style
//! setters, constructed once and passed to `Pickler::new`/`Unpickler::new`,
//! is the idiomatic substitute.

use crate::reflect::{AssemblyFilter, AssemblyHandle};

/// The stream version fields written/checked by the header (spec §6.1).
/// `major` is the only field the decoder enforces; the rest are
/// informational and carried through for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub runtime_major: u32,
    pub runtime_minor: u32,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self {
            major: 1,
            minor: 0,
            runtime_major: 0,
            runtime_minor: 0,
        }
    }
}

/// Policy shared by both the pickler and unpickler.
pub struct EngineOptions {
    pub version: ProtocolVersion,
    /// Decides whether an assembly is embedded (`ByValue`) or left for the
    /// receiver to resolve (`ByReference`); defaults to always-by-reference,
    /// matching the conservative default a façade without special assembly
    /// knowledge should pick.
    assembly_filter: Box<dyn Fn(AssemblyHandle) -> AssemblyFilter>,
    /// Whether `Def` operations (dynamic assembly/type/method creation) are
    /// permitted at all. A host with no code-generation back end sets this
    /// to `false` and the engine becomes pure data-pickling: any incoming
    /// `Def` is rejected with [`crate::error::Error::Construction`].
    pub allow_dynamic_definitions: bool,
}

impl EngineOptions {
    #[must_use]
    pub fn assembly_filter(&self, assembly: AssemblyHandle) -> AssemblyFilter {
        (self.assembly_filter)(assembly)
    }

    #[must_use]
    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_assembly_filter(mut self, filter: impl Fn(AssemblyHandle) -> AssemblyFilter + 'static) -> Self {
        self.assembly_filter = Box::new(filter);
        self
    }

    #[must_use]
    pub fn with_dynamic_definitions(mut self, allow: bool) -> Self {
        self.allow_dynamic_definitions = allow;
        self
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::default(),
            assembly_filter: Box::new(|_| AssemblyFilter::ByReference),
            allow_dynamic_definitions: true,
        }
    }
}
