//! A minimal in-memory `ReflectionFacade` used to drive integration tests.
//!
//! Real hosts sit on top of a live runtime type system; this one is a flat
//! table the test builds up by hand, giving tests full control over what
//! `describe_type` reports without needing a dynamic-code backend.

use std::collections::HashMap;

use pikala::error::Error;
use pikala::model::RuntimeValue;
use pikala::reflect::{
    AssemblyFilter, AssemblyHandle, CustomAttribute, EventHandle, FieldAttributes, FieldHandle,
    HostTypeDescriptor, MethodAttributes, MethodHandle, ModuleHandle, PropertyHandle,
    ReducedForm, ReflectionFacade, TypeAttributes, TypeDefKind, TypeHandle,
};
use pikala::signature::Signature;
use pikala::typeinfo::TypeMode;
use pikala::wellknown::WellKnownType;

/// One entry in [`FakeHost`]'s type table.
#[derive(Clone)]
pub struct TypeRecord {
    pub mode: TypeMode,
    pub is_value_type: bool,
    pub is_sealed: bool,
    pub is_abstract: bool,
    pub has_element_type: bool,
    pub fields: Vec<(String, TypeHandle)>,
    pub element: Option<TypeHandle>,
    pub tuple_arguments: Vec<TypeHandle>,
    pub enum_underlying_code: Option<u8>,
}

impl Default for TypeRecord {
    /// Stands in for "unregistered type" in [`FakeHost::describe_type`];
    /// `TypeMode::Error` guarantees a test that forgot to register a type
    /// fails loudly instead of silently auto-serializing as empty.
    fn default() -> Self {
        Self {
            mode: TypeMode::Error,
            is_value_type: false,
            is_sealed: false,
            is_abstract: false,
            has_element_type: false,
            fields: Vec::new(),
            element: None,
            tuple_arguments: Vec::new(),
            enum_underlying_code: None,
        }
    }
}

type Reducer = Box<dyn Fn(&RuntimeValue) -> Option<ReducedForm>>;
type Constructor = Box<dyn Fn(&ReducedForm) -> Result<RuntimeValue, Error>>;

#[derive(Default)]
pub struct FakeHost {
    types: HashMap<TypeHandle, TypeRecord>,
    names: HashMap<TypeHandle, String>,
    field_handles: HashMap<(TypeHandle, String), FieldHandle>,
    next_user_type_id: u64,
    next_field_id: u64,
    reducers: HashMap<TypeHandle, (Reducer, Constructor)>,
}

/// Well-known ordinals double as their `TypeHandle` id, matching
/// `WellKnownType`'s own discriminants (spec §4.3: builtins resolve to a
/// process-wide `TypeInfo` without needing a describe-type round trip).
const FIRST_USER_TYPE_ID: u64 = 1000;

impl FakeHost {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_user_type_id: FIRST_USER_TYPE_ID,
            next_field_id: 1,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn builtin(kind: WellKnownType) -> TypeHandle {
        TypeHandle(u8::from(kind) as u64)
    }

    /// Registers a plain, auto-serialized reference or value type.
    pub fn register_object_type(
        &mut self,
        name: &str,
        is_value_type: bool,
        fields: Vec<(&str, TypeHandle)>,
    ) -> TypeHandle {
        let ty = self.alloc_type();
        for (field_name, _) in &fields {
            let handle = self.alloc_field();
            self.field_handles.insert((ty, (*field_name).to_string()), handle);
        }
        self.types.insert(
            ty,
            TypeRecord {
                mode: TypeMode::AutoSerializedObject,
                is_value_type,
                is_sealed: true,
                is_abstract: false,
                has_element_type: false,
                fields: fields
                    .into_iter()
                    .map(|(n, t)| (n.to_string(), t))
                    .collect(),
                element: None,
                tuple_arguments: Vec::new(),
                enum_underlying_code: None,
            },
        );
        self.names.insert(ty, name.to_string());
        ty
    }

    /// Registers an enum type with the given underlying well-known code.
    pub fn register_enum_type(&mut self, name: &str, underlying: WellKnownType) -> TypeHandle {
        let ty = self.alloc_type();
        self.types.insert(
            ty,
            TypeRecord {
                mode: TypeMode::Enum,
                is_value_type: true,
                is_sealed: true,
                is_abstract: false,
                has_element_type: false,
                fields: Vec::new(),
                element: None,
                tuple_arguments: Vec::new(),
                enum_underlying_code: Some(underlying.into()),
            },
        );
        self.names.insert(ty, name.to_string());
        ty
    }

    pub fn register_reducer(
        &mut self,
        name: &str,
        reduce: impl Fn(&RuntimeValue) -> Option<ReducedForm> + 'static,
        construct: impl Fn(&ReducedForm) -> Result<RuntimeValue, Error> + 'static,
    ) -> TypeHandle {
        let ty = self.alloc_type();
        self.types.insert(
            ty,
            TypeRecord {
                mode: TypeMode::Reduced,
                is_value_type: false,
                is_sealed: true,
                is_abstract: false,
                has_element_type: false,
                fields: Vec::new(),
                element: None,
                tuple_arguments: Vec::new(),
                enum_underlying_code: None,
            },
        );
        self.names.insert(ty, name.to_string());
        self.reducers.insert(ty, (Box::new(reduce), Box::new(construct)));
        ty
    }

    fn alloc_type(&mut self) -> TypeHandle {
        let ty = TypeHandle(self.next_user_type_id);
        self.next_user_type_id += 1;
        ty
    }

    fn alloc_field(&mut self) -> FieldHandle {
        let handle = FieldHandle(self.next_field_id);
        self.next_field_id += 1;
        handle
    }
}

impl ReflectionFacade for FakeHost {
    fn resolve_assembly_by_name(&mut self, _name: &str) -> Result<AssemblyHandle, Error> {
        Ok(AssemblyHandle(1))
    }

    fn current_loaded_assemblies(&self) -> Vec<AssemblyHandle> {
        vec![AssemblyHandle(1)]
    }

    fn assembly_display_name(&self, _asm: AssemblyHandle) -> String {
        "test-assembly".into()
    }

    fn is_mscorlib(&self, _asm: AssemblyHandle) -> bool {
        false
    }

    fn define_dynamic_assembly(&mut self, _name: &str, _collectible: bool) -> Result<AssemblyHandle, Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn define_dynamic_module(&mut self, _asm: AssemblyHandle, _name: &str) -> Result<ModuleHandle, Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn define_type(
        &mut self,
        _module: ModuleHandle,
        _name: &str,
        _kind: TypeDefKind,
        _attrs: TypeAttributes,
    ) -> Result<TypeHandle, Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn define_nested_type(
        &mut self,
        _outer: TypeHandle,
        _name: &str,
        _kind: TypeDefKind,
        _attrs: TypeAttributes,
    ) -> Result<TypeHandle, Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn define_field(
        &mut self,
        _ty: TypeHandle,
        _name: &str,
        _field_type: TypeHandle,
        _attrs: FieldAttributes,
    ) -> Result<FieldHandle, Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn define_method(
        &mut self,
        _ty: TypeHandle,
        _name: &str,
        _signature: &Signature,
        _attrs: MethodAttributes,
    ) -> Result<MethodHandle, Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn define_constructor(&mut self, _ty: TypeHandle, _signature: &Signature) -> Result<MethodHandle, Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn define_property(
        &mut self,
        _ty: TypeHandle,
        _name: &str,
        _signature: &Signature,
    ) -> Result<PropertyHandle, Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn define_event(&mut self, _ty: TypeHandle, _name: &str, _handler_type: TypeHandle) -> Result<EventHandle, Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn define_generic_parameters(&mut self, _ty: TypeHandle, _names: &[String]) -> Result<(), Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn set_parent(&mut self, _ty: TypeHandle, _parent: TypeHandle) -> Result<(), Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn add_interface(&mut self, _ty: TypeHandle, _iface: TypeHandle) -> Result<(), Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn define_method_override(
        &mut self,
        _ty: TypeHandle,
        _method: MethodHandle,
        _declaration: MethodHandle,
    ) -> Result<(), Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn create_type(&mut self, _ty: TypeHandle) -> Result<(), Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn apply_custom_attribute(&mut self, _target: TypeHandle, _attribute: &CustomAttribute) -> Result<(), Error> {
        Err(Error::Construction("fake host has no dynamic-code backend".into()))
    }

    fn get_field_by_name(&self, ty: TypeHandle, name: &str) -> Option<FieldHandle> {
        self.field_handles.get(&(ty, name.to_string())).copied()
    }

    fn get_method_by_signature(&self, _ty: TypeHandle, _signature: &Signature) -> Option<MethodHandle> {
        None
    }

    fn get_property_by_signature(&self, _ty: TypeHandle, _signature: &Signature) -> Option<PropertyHandle> {
        None
    }

    fn get_event_by_name(&self, _ty: TypeHandle, _name: &str) -> Option<EventHandle> {
        None
    }

    fn get_constructor_by_signature(&self, _ty: TypeHandle, _signature: &Signature) -> Option<MethodHandle> {
        None
    }

    fn describe_type(&self, ty: TypeHandle) -> HostTypeDescriptor {
        if ty.id() < FIRST_USER_TYPE_ID {
            if let Ok(kind) = WellKnownType::try_from(ty.id() as u8) {
                return HostTypeDescriptor {
                    is_value_type: kind.is_primitive() || matches!(kind, WellKnownType::Decimal),
                    is_sealed: true,
                    is_abstract: false,
                    has_element_type: false,
                    mode: TypeMode::Builtin,
                    fields: Vec::new(),
                    element: None,
                    tuple_arguments: Vec::new(),
                    enum_underlying_code: Some(kind.into()),
                };
            }
        }
        let record = self.types.get(&ty).cloned().unwrap_or_default();
        HostTypeDescriptor {
            is_value_type: record.is_value_type,
            is_sealed: record.is_sealed,
            is_abstract: record.is_abstract,
            has_element_type: record.has_element_type,
            mode: record.mode,
            fields: record.fields,
            element: record.element,
            tuple_arguments: record.tuple_arguments,
            enum_underlying_code: record.enum_underlying_code,
        }
    }

    fn is_builtin(&self, ty: TypeHandle) -> bool {
        ty.id() < FIRST_USER_TYPE_ID && ty != self.object_type_handle()
    }

    fn type_display_name(&self, ty: TypeHandle) -> String {
        self.names.get(&ty).cloned().unwrap_or_else(|| format!("<type {}>", ty.id()))
    }

    fn object_type_handle(&self) -> TypeHandle {
        Self::builtin(WellKnownType::Object)
    }

    fn assembly_filter(&self, _asm: AssemblyHandle) -> AssemblyFilter {
        AssemblyFilter::ByReference
    }

    fn reduce_for_encode(&self, ty: TypeHandle, value: &RuntimeValue) -> Option<ReducedForm> {
        self.reducers.get(&ty).and_then(|(reduce, _)| reduce(value))
    }

    fn construct_from_reducer(&mut self, reduced: &ReducedForm) -> Result<RuntimeValue, Error> {
        for (_, construct) in self.reducers.values() {
            if let Ok(value) = construct(reduced) {
                return Ok(value);
            }
        }
        Err(Error::Construction("no reducer recognized this constructor".into()))
    }
}
