//! The reflection façade (spec §6.3): the only point where core pickling
//! logic reaches into a host's runtime type system. Everything here is an
//! opaque handle or a trait; no concrete reflection implementation lives in
//! this crate.
//!
//! Grounded on `llvm-bitcode::visitor::BitStreamVisitor`: the one place the
//! teacher crate defines a trait for an external collaborator to implement,
//! rather than doing the work itself.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::signature::Signature;

macro_rules! opaque_handle {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            #[must_use]
            pub fn id(self) -> u64 {
                self.0
            }
        }
    };
}

opaque_handle!(AssemblyHandle);
opaque_handle!(ModuleHandle);
opaque_handle!(TypeHandle);
opaque_handle!(MethodHandle);
opaque_handle!(FieldHandle);
opaque_handle!(PropertyHandle);
opaque_handle!(EventHandle);

/// Whether an assembly should be pickled by value (its contents are
/// embedded, recreated with a `Def`) or by reference (the receiver must
/// already have it loaded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyFilter {
    ByValue,
    ByReference,
}

/// `kind` of a type being constructed dynamically (spec §3, `PickledType::Def`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TypeDefKind {
    Enum = 0,
    Delegate = 1,
    Struct = 2,
    Class = 3,
    Interface = 4,
}

bitflags::bitflags! {
    /// Attributes carried alongside a `Def` type (visibility, sealed/abstract…).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeAttributes: u32 {
        const PUBLIC    = 0x0001;
        const SEALED    = 0x0002;
        const ABSTRACT  = 0x0004;
        const NESTED    = 0x0008;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldAttributes: u32 {
        const PUBLIC    = 0x0001;
        const STATIC    = 0x0002;
        const INIT_ONLY = 0x0004;
        const LITERAL   = 0x0008;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodAttributes: u32 {
        const PUBLIC    = 0x0001;
        const STATIC    = 0x0002;
        const VIRTUAL   = 0x0004;
        const ABSTRACT  = 0x0008;
    }
}

/// A named, declaring-type-scoped key identifying a member without owning
/// its code (spec §3, `PickledMember::Ref`).
#[derive(Debug, Clone, PartialEq)]
pub enum MemberKey {
    Field { declaring: TypeHandle, name: String },
    Property { declaring: TypeHandle, signature: Signature },
    Event { declaring: TypeHandle, name: String },
    Method { declaring: TypeHandle, signature: Signature },
    Constructor { declaring: TypeHandle, signature: Signature },
}

/// One constructed member, owning its own code (spec §3, `PickledMember::Def`).
#[derive(Debug, Clone)]
pub enum MemberDef {
    Field {
        name: String,
        field_type: crate::dispatch::PickledType,
        attrs: FieldAttributes,
        default_value: Option<crate::model::RuntimeValue>,
    },
    Property {
        name: String,
        signature: Signature,
        getter: Option<MethodHandle>,
        setter: Option<MethodHandle>,
    },
    Event {
        name: String,
        handler_type: crate::dispatch::PickledType,
        add: Option<MethodHandle>,
        remove: Option<MethodHandle>,
    },
    Method {
        name: String,
        signature: Signature,
        attrs: MethodAttributes,
        body: Option<crate::il::MethodBody>,
    },
    Constructor {
        signature: Signature,
        body: Option<crate::il::MethodBody>,
    },
}

/// A custom attribute attached to a member, spec §9 design note (c): core
/// never serializes this to a metadata blob itself, it hands the triple to
/// the façade.
#[derive(Debug, Clone)]
pub struct CustomAttribute {
    pub constructor: MethodHandle,
    pub positional_args: Vec<crate::model::RuntimeValue>,
    pub named_args: Vec<(String, crate::model::RuntimeValue)>,
}

/// The negotiation-relevant facts about a runtime type that the host
/// supplies during `TypeInfo` negotiation (spec §4.3).
#[derive(Debug, Clone)]
pub struct HostTypeDescriptor {
    pub is_value_type: bool,
    pub is_sealed: bool,
    pub is_abstract: bool,
    pub has_element_type: bool,
    pub mode: crate::typeinfo::TypeMode,
    /// Declared instance fields in order, skipping literals/statics.
    pub fields: Vec<(String, TypeHandle)>,
    pub element: Option<TypeHandle>,
    pub tuple_arguments: Vec<TypeHandle>,
    pub enum_underlying_code: Option<u8>,
}

/// The `(method_ref, target_or_null, args[])` triple a reducer hands back
/// in place of a plain field-by-field object (spec §4.7): `target` is
/// `Some` when `constructor` is an instance method invoked on an already-
/// existing object rather than a constructor, `None` for ordinary
/// constructor-based reduction.
#[derive(Debug, Clone)]
pub struct ReducedForm {
    pub constructor: MethodHandle,
    pub target: Option<crate::model::RuntimeValue>,
    pub args: Vec<crate::model::RuntimeValue>,
}

/// The collaborator interface the core engine needs (spec §6.3). A portable
/// implementation on a target with no dynamic-code emitter may implement
/// every `define_*`/`create_type` method as `Err(Error::Construction(..))`
/// and still serve pure data pickling (spec §9 design note, item 3).
pub trait ReflectionFacade {
    fn resolve_assembly_by_name(&mut self, name: &str) -> Result<AssemblyHandle, crate::error::Error>;
    fn current_loaded_assemblies(&self) -> Vec<AssemblyHandle>;
    fn assembly_display_name(&self, asm: AssemblyHandle) -> String;
    fn is_mscorlib(&self, asm: AssemblyHandle) -> bool;

    fn define_dynamic_assembly(
        &mut self,
        name: &str,
        collectible: bool,
    ) -> Result<AssemblyHandle, crate::error::Error>;
    fn define_dynamic_module(
        &mut self,
        asm: AssemblyHandle,
        name: &str,
    ) -> Result<ModuleHandle, crate::error::Error>;

    fn define_type(
        &mut self,
        module: ModuleHandle,
        name: &str,
        kind: TypeDefKind,
        attrs: TypeAttributes,
    ) -> Result<TypeHandle, crate::error::Error>;
    fn define_nested_type(
        &mut self,
        outer: TypeHandle,
        name: &str,
        kind: TypeDefKind,
        attrs: TypeAttributes,
    ) -> Result<TypeHandle, crate::error::Error>;

    fn define_field(
        &mut self,
        ty: TypeHandle,
        name: &str,
        field_type: TypeHandle,
        attrs: FieldAttributes,
    ) -> Result<FieldHandle, crate::error::Error>;
    fn define_method(
        &mut self,
        ty: TypeHandle,
        name: &str,
        signature: &Signature,
        attrs: MethodAttributes,
    ) -> Result<MethodHandle, crate::error::Error>;
    fn define_constructor(
        &mut self,
        ty: TypeHandle,
        signature: &Signature,
    ) -> Result<MethodHandle, crate::error::Error>;
    fn define_property(
        &mut self,
        ty: TypeHandle,
        name: &str,
        signature: &Signature,
    ) -> Result<PropertyHandle, crate::error::Error>;
    fn define_event(
        &mut self,
        ty: TypeHandle,
        name: &str,
        handler_type: TypeHandle,
    ) -> Result<EventHandle, crate::error::Error>;
    fn define_generic_parameters(
        &mut self,
        ty: TypeHandle,
        names: &[String],
    ) -> Result<(), crate::error::Error>;
    fn set_parent(&mut self, ty: TypeHandle, parent: TypeHandle) -> Result<(), crate::error::Error>;
    fn add_interface(&mut self, ty: TypeHandle, iface: TypeHandle) -> Result<(), crate::error::Error>;
    fn define_method_override(
        &mut self,
        ty: TypeHandle,
        method: MethodHandle,
        declaration: MethodHandle,
    ) -> Result<(), crate::error::Error>;
    fn create_type(&mut self, ty: TypeHandle) -> Result<(), crate::error::Error>;
    fn apply_custom_attribute(
        &mut self,
        target: TypeHandle,
        attribute: &CustomAttribute,
    ) -> Result<(), crate::error::Error>;

    fn get_field_by_name(&self, ty: TypeHandle, name: &str) -> Option<FieldHandle>;
    fn get_method_by_signature(&self, ty: TypeHandle, signature: &Signature) -> Option<MethodHandle>;
    fn get_property_by_signature(
        &self,
        ty: TypeHandle,
        signature: &Signature,
    ) -> Option<PropertyHandle>;
    fn get_event_by_name(&self, ty: TypeHandle, name: &str) -> Option<EventHandle>;
    fn get_constructor_by_signature(
        &self,
        ty: TypeHandle,
        signature: &Signature,
    ) -> Option<MethodHandle>;

    /// Negotiation-time facts about `ty` (spec §4.3).
    fn describe_type(&self, ty: TypeHandle) -> HostTypeDescriptor;
    /// Whether `ty` is one of the builtins/well-knowns whose `TypeInfo` is
    /// derived locally without stream cost (spec §4.3).
    fn is_builtin(&self, ty: TypeHandle) -> bool;
    fn type_display_name(&self, ty: TypeHandle) -> String;
    /// The host's handle for `System.Object`, the static type the top-level
    /// pickled value is always encoded/decoded against (spec §6.1).
    fn object_type_handle(&self) -> TypeHandle;

    /// Assembly filter policy (spec §1): by-value vs. by-reference.
    fn assembly_filter(&self, asm: AssemblyHandle) -> AssemblyFilter {
        let _ = asm;
        AssemblyFilter::ByReference
    }

    /// Encode-side: does `value`'s type prefer reducer-based construction
    /// over plain field serialization (spec §4.7), and if so with what
    /// constructor and arguments?
    fn reduce_for_encode(
        &self,
        ty: TypeHandle,
        value: &crate::model::RuntimeValue,
    ) -> Option<ReducedForm> {
        let _ = (ty, value);
        None
    }
    /// Decode-side: invoke the reducer's constructor to rebuild the object.
    fn construct_from_reducer(
        &mut self,
        reduced: &ReducedForm,
    ) -> Result<crate::model::RuntimeValue, crate::error::Error> {
        let _ = reduced;
        Err(crate::error::Error::Construction(
            "this host does not support reducer-based construction".into(),
        ))
    }

    /// Encode-side: the `PickledType` a top-level type reference should
    /// carry for `ty` (spec §3, feeding `dispatch::write_pickled_type`).
    /// The default reads the same `HostTypeDescriptor` negotiation already
    /// uses: a builtin's well-known ordinal is recovered from
    /// `describe_type().enum_underlying_code` the way
    /// `typeinfo::builtin_info_for` does, an array-shaped descriptor becomes
    /// `ArrayOf` at rank 1 (the descriptor can't distinguish array from
    /// by-ref/pointer, so richer hosts that need that distinction must
    /// override this), and a type with tuple arguments becomes
    /// `Constructed` with its own handle standing in as `definition` (the
    /// descriptor has no way to name a closed generic's separate open
    /// definition handle). Anything else is a plain `Ref`.
    fn pickled_type_of(&self, ty: TypeHandle) -> crate::dispatch::PickledType {
        let descriptor = self.describe_type(ty);
        if self.is_builtin(ty) {
            if let Some(kind) = descriptor
                .enum_underlying_code
                .and_then(|code| crate::wellknown::WellKnownType::try_from(code).ok())
            {
                return crate::dispatch::PickledType::WellKnown(kind);
            }
        }
        if descriptor.has_element_type {
            if let Some(element) = descriptor.element {
                return crate::dispatch::PickledType::ArrayOf {
                    element: Box::new(self.pickled_type_of(element)),
                    rank: 1,
                };
            }
        }
        if !descriptor.tuple_arguments.is_empty() {
            return crate::dispatch::PickledType::Constructed {
                definition: ty,
                arguments: descriptor
                    .tuple_arguments
                    .iter()
                    .map(|t| self.pickled_type_of(*t))
                    .collect(),
            };
        }
        crate::dispatch::PickledType::Ref(ty)
    }

    /// Decode-side inverse of [`ReflectionFacade::pickled_type_of`]: recover
    /// a `TypeHandle` for a `PickledType` read off the wire. `Ref` and
    /// `Constructed` resolve trivially since both already carry a handle;
    /// `WellKnown`/`ArrayOf`/`ByRef`/`Pointer` have no default because this
    /// trait exposes no "synthesize a type from a shape" operation — a host
    /// that wants those to resolve must override this alongside
    /// `pickled_type_of`.
    fn resolve_pickled_type(&mut self, ty: &crate::dispatch::PickledType) -> Result<TypeHandle, crate::error::Error> {
        match ty {
            crate::dispatch::PickledType::Ref(handle) => Ok(*handle),
            crate::dispatch::PickledType::Constructed { definition, .. } => Ok(*definition),
            other => Err(crate::error::Error::Construction(format!(
                "this host cannot resolve a bare {other:?} type reference without a type-construction API"
            ))),
        }
    }

    /// Encode-side: is `ty` a dynamically created type whose definition must
    /// travel with it (spec §3 `PickledType::Def`)? Most hosts hold only
    /// statically compiled types, so the default is `None`; a host that
    /// tracks its own dynamically emitted types overrides this.
    fn dynamic_definition_of(&self, ty: TypeHandle) -> Option<crate::dispatch::TypeDef> {
        let _ = ty;
        None
    }

    /// Decode-side: the module new dynamic type definitions land in when the
    /// stream embeds one. The default creates a single throwaway dynamic
    /// assembly/module pair on first use via `define_dynamic_assembly`/
    /// `define_dynamic_module`; hosts with a real dynamic-code backend
    /// generally want to override this to reuse an existing module instead.
    fn dynamic_definition_module(&mut self) -> Result<ModuleHandle, crate::error::Error> {
        let assembly = self.define_dynamic_assembly("Pikala.Dynamic", true)?;
        self.define_dynamic_module(assembly, "Pikala.Dynamic")
    }
}
