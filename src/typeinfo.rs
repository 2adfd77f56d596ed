//! The type-info cache and negotiation protocol (spec §3, §4.3).
//!
//! Grounded on `llvm-bitcode::read::BitStreamReader::read_block_info_block`:
//! that function accumulates a `BlockInfo` record (name, per-record names)
//! while scanning, tolerating records it doesn't recognize rather than
//! aborting the whole block. `TypeInfo` negotiation generalizes the same
//! "accumulate facts, defer hard failure" shape: mismatches during field
//! reconciliation are collected onto `TypeInfo.error` instead of aborting
//! the stream (spec §4.3 step 4, §7).

use std::collections::HashMap;
use std::rc::Rc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::Error;
use crate::reflect::{FieldHandle, HostTypeDescriptor, ReflectionFacade, TypeHandle};
use crate::wellknown::WellKnownType;

bitflags::bitflags! {
    /// Low nibble of the one-byte type descriptor exchanged during
    /// negotiation (spec §4.3, §6.2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u8 {
        const IS_ABSTRACT       = 0b0001;
        const IS_SEALED         = 0b0010;
        const IS_VALUE_TYPE     = 0b0100;
        const HAS_ELEMENT_TYPE  = 0b1000;
    }
}

/// High nibble of the descriptor: how values of this type are serialized
/// (spec §4.3, §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TypeMode {
    Builtin = 0,
    Enum = 1,
    Delegate = 2,
    AutoSerializedObject = 3,
    Reduced = 4,
    Error = 5,
}

/// Per-stream record of how a runtime type serializes (spec §3's `TypeInfo`
/// table). Immutable once published into a [`TypeInfoCache`].
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub flags: TypeFlags,
    pub mode: TypeMode,
    /// For `AutoSerializedObject`: the instance, non-literal fields in
    /// declared order, each paired with the local field to stream into.
    pub serialized_fields: Vec<(Rc<TypeInfo>, FieldHandle)>,
    /// For arrays/nullables: the element `TypeInfo`.
    pub element: Option<Rc<TypeInfo>>,
    /// For tuple types: the argument `TypeInfo`s.
    pub tuple_arguments: Vec<Rc<TypeInfo>>,
    /// For enums: the underlying integer type's well-known ordinal.
    pub type_code: Option<u8>,
    /// Set when this type cannot be deserialized; raised only once an
    /// instance is actually encountered (spec §4.3 step 4, §7).
    pub error: Option<String>,
    /// Which fixed-shape builtin this is, when `mode == Builtin`; lets the
    /// value codec pick the right scalar read/write without re-deriving it
    /// from the host on every call.
    pub builtin: Option<WellKnownType>,
    /// The runtime type handle this `TypeInfo` was derived for; `None` for
    /// process-wide cached builtins, which aren't tied to any one host
    /// handle. Lets decode recover a concrete `TypeHandle` for inline
    /// `Enum` values without threading one through every recursive call.
    pub type_handle: Option<TypeHandle>,
}

impl TypeInfo {
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        self.flags.contains(TypeFlags::IS_VALUE_TYPE)
    }

    /// Spec §4.2: "Value types are never memoized by default; reference
    /// types, arrays, strings, and boxed reflection handles are."
    #[must_use]
    pub fn should_memo(&self) -> bool {
        !self.is_value_type()
    }

    pub fn check_usable(&self) -> Result<(), Error> {
        match &self.error {
            Some(msg) => Err(Error::TypeMismatch(msg.clone())),
            None => Ok(()),
        }
    }
}

/// Per-call, per-runtime-type cache (spec §3 invariant: "within one stream,
/// any runtime type resolves to exactly one `TypeInfo`").
#[derive(Default)]
pub struct TypeInfoCache {
    entries: HashMap<TypeHandle, Rc<TypeInfo>>,
}

impl TypeInfoCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, ty: TypeHandle) -> Option<Rc<TypeInfo>> {
        self.entries.get(&ty).cloned()
    }

    #[must_use]
    pub fn contains(&self, ty: TypeHandle) -> bool {
        self.entries.contains_key(&ty)
    }

    pub fn insert(&mut self, ty: TypeHandle, info: Rc<TypeInfo>) {
        self.entries.insert(ty, info);
    }

    /// Encode-side: derive (and cache) the `TypeInfo` for `ty` from the
    /// host's descriptor. Returns the cached entry on repeat calls without
    /// re-deriving (spec's "type-info stability" testable property).
    pub fn derive(&mut self, host: &dyn ReflectionFacade, ty: TypeHandle) -> Rc<TypeInfo> {
        if let Some(existing) = self.get(ty) {
            return existing;
        }
        if host.is_builtin(ty) {
            let info = builtin_info_for(host, ty);
            self.insert(ty, info.clone());
            return info;
        }
        let descriptor = host.describe_type(ty);
        let info = Rc::new(self.build_from_descriptor(host, ty, &descriptor));
        self.insert(ty, info.clone());
        info
    }

    fn build_from_descriptor(
        &mut self,
        host: &dyn ReflectionFacade,
        ty: TypeHandle,
        descriptor: &HostTypeDescriptor,
    ) -> TypeInfo {
        let mut flags = TypeFlags::empty();
        flags.set(TypeFlags::IS_ABSTRACT, descriptor.is_abstract);
        flags.set(TypeFlags::IS_SEALED, descriptor.is_sealed);
        flags.set(TypeFlags::IS_VALUE_TYPE, descriptor.is_value_type);
        flags.set(TypeFlags::HAS_ELEMENT_TYPE, descriptor.has_element_type);

        let serialized_fields = descriptor
            .fields
            .iter()
            .map(|(name, field_type)| {
                let field_info = self.derive(host, *field_type);
                // Field handles are looked up by name against the
                // declaring type, not the field's own type.
                let handle = host.get_field_by_name(ty, name).unwrap_or(FieldHandle(0));
                (field_info, handle)
            })
            .collect();

        TypeInfo {
            flags,
            mode: descriptor.mode,
            serialized_fields,
            element: descriptor.element.map(|e| self.derive(host, e)),
            tuple_arguments: descriptor
                .tuple_arguments
                .iter()
                .map(|t| self.derive(host, *t))
                .collect(),
            type_code: descriptor.enum_underlying_code,
            error: None,
            builtin: None,
            type_handle: Some(ty),
        }
    }

    /// Decode-side negotiation (spec §4.3): reconcile a sender-declared
    /// shape against the local type, accumulating errors onto the result
    /// instead of failing immediately.
    pub fn negotiate(
        &mut self,
        host: &dyn ReflectionFacade,
        ty: TypeHandle,
        sender_flags: TypeFlags,
        sender_mode: TypeMode,
        sender_fields: &[(String, TypeHandle)],
        sender_type_code: Option<u8>,
    ) -> Rc<TypeInfo> {
        if host.is_builtin(ty) {
            let info = builtin_info_for(host, ty);
            self.insert(ty, info.clone());
            return info;
        }
        let local = host.describe_type(ty);
        let mut error = None;

        match sender_mode {
            TypeMode::AutoSerializedObject => {
                let mut local_fields = local.fields.iter();
                let mut mismatches = Vec::new();
                for (name, sender_field_ty) in sender_fields {
                    match local_fields.next() {
                        Some((local_name, local_field_ty)) if local_name == name => {
                            let local_info = self.derive(host, *local_field_ty);
                            let sender_info = self.derive(host, *sender_field_ty);
                            if !type_info_compatible(&local_info, &sender_info) {
                                mismatches.push(format!(
                                    "field `{name}`: expected {} but was {}",
                                    host.type_display_name(*local_field_ty),
                                    host.type_display_name(*sender_field_ty)
                                ));
                            }
                        }
                        Some((local_name, _)) => {
                            mismatches.push(format!(
                                "expected field `{local_name}` but stream had `{name}`"
                            ));
                        }
                        None => {
                            mismatches.push(format!("missing field `{name}` on local type"));
                        }
                    }
                }
                if mismatches.is_empty() && local_fields.next().is_some() {
                    mismatches.push("local type declares more fields than the stream".into());
                }
                if !mismatches.is_empty() {
                    error = Some(format!(
                        "type `{}` failed field reconciliation: {}",
                        host.type_display_name(ty),
                        mismatches.join("; ")
                    ));
                }
            }
            TypeMode::Enum => {
                if sender_type_code != local.enum_underlying_code {
                    error = Some(format!(
                        "expected underlying type code {:?} but was {:?}",
                        local.enum_underlying_code, sender_type_code
                    ));
                }
            }
            TypeMode::Delegate => {
                if local.mode != TypeMode::Delegate {
                    error = Some(format!(
                        "type `{}` is not assignable to the delegate root",
                        host.type_display_name(ty)
                    ));
                }
            }
            TypeMode::Error => {
                error = Some(format!(
                    "type `{}` was marked unserializable by the sender",
                    host.type_display_name(ty)
                ));
            }
            TypeMode::Builtin | TypeMode::Reduced => {}
        }

        let serialized_fields = if sender_mode == TypeMode::AutoSerializedObject && error.is_none()
        {
            sender_fields
                .iter()
                .filter_map(|(name, field_ty)| {
                    host.get_field_by_name(ty, name)
                        .map(|handle| (self.derive(host, *field_ty), handle))
                })
                .collect()
        } else {
            Vec::new()
        };

        if let Some(message) = &error {
            log::warn!("type `{}` quarantined during negotiation: {message}", host.type_display_name(ty));
        }
        let info = Rc::new(TypeInfo {
            flags: sender_flags,
            mode: sender_mode,
            serialized_fields,
            element: local.element.map(|e| self.derive(host, e)),
            tuple_arguments: local
                .tuple_arguments
                .iter()
                .map(|t| self.derive(host, *t))
                .collect(),
            type_code: sender_type_code,
            error,
            builtin: None,
            type_handle: Some(ty),
        });
        self.insert(ty, info.clone());
        info
    }
}

fn type_info_compatible(a: &TypeInfo, b: &TypeInfo) -> bool {
    a.mode == b.mode && a.flags == b.flags && a.type_code == b.type_code
}

/// The façade maps its own builtin handles onto our closed well-known
/// table via `describe_type().enum_underlying_code`; an unrecognized code
/// still gets a usable (if generic) `TypeInfo` rather than failing.
fn builtin_info_for(host: &dyn ReflectionFacade, ty: TypeHandle) -> Rc<TypeInfo> {
    let descriptor = host.describe_type(ty);
    match descriptor
        .enum_underlying_code
        .and_then(|code| WellKnownType::try_from(code).ok())
    {
        Some(kind) => crate::wellknown::cached_type_info(kind),
        None => crate::wellknown::cached_type_info(WellKnownType::Object),
    }
}
