//! Top-level operation dispatch for assemblies, modules, and types
//! (spec §4.10): one-byte discriminants selecting how much of each is
//! embedded in the stream versus resolved against the receiving host.
//!
//! Grounded on `llvm-bitcode::schema::blocks::BlockId` /
//! `schema::enums::*`: closed, `#[repr(u8)]` + `num_enum` discriminant
//! tables that a reader matches on before doing anything block-specific.

use std::rc::Rc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::Error;
use crate::model::RuntimeValue;
use crate::reflect::{
    AssemblyHandle, CustomAttribute, FieldAttributes, FieldHandle, MemberDef, MemberKey,
    MethodAttributes, MethodHandle, ModuleHandle, ReflectionFacade, TypeAttributes, TypeDefKind,
    TypeHandle,
};
use crate::scheduler::{Scheduler, Stage};
use crate::signature::{self, Signature};
use crate::varint::{ByteReader, ByteWriter};
use crate::wellknown::WellKnownType;

/// Spec §4.10: how an assembly reference is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AssemblyOperation {
    /// Resolve against an assembly the receiver already has loaded.
    Reference = 0,
    /// The assembly's contents are embedded and must be (re)created.
    Def = 1,
    MscorlibReference = 2,
    /// Back-reference to an assembly already named earlier in this stream.
    Memo = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ModuleOperation {
    Reference = 0,
    Def = 1,
    ManifestModule = 2,
}

/// Spec §4.10's `TypeOperation`: the low nibble carries the discriminant
/// below, the high bit (0x80) is the "nested" flag folded in at the wire
/// layer rather than given its own variant, so a nested `Def` round-trips
/// through the same [`TypeDefKind`] set as a top-level one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TypeOperationKind {
    WellKnown = 0,
    Ref = 1,
    Def = 2,
    Generic = 3,
    ArrayOf = 4,
    ByRef = 5,
    Pointer = 6,
    TVar = 7,
    MVar = 8,
}

const NESTED_FLAG: u8 = 0x80;
const KIND_MASK: u8 = 0x7f;

#[derive(Debug, Clone, Copy)]
pub struct TypeOperation {
    pub kind: TypeOperationKind,
    pub nested: bool,
}

impl TypeOperation {
    #[must_use]
    pub fn to_byte(self) -> u8 {
        let kind: u8 = self.kind.into();
        kind | if self.nested { NESTED_FLAG } else { 0 }
    }

    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        let nested = byte & NESTED_FLAG != 0;
        let kind = TypeOperationKind::try_from(byte & KIND_MASK).map_err(|_| {
            Error::UnknownOperation {
                what: "type",
                byte,
            }
        })?;
        Ok(Self { kind, nested })
    }
}

/// A fully resolved type reference flowing through signatures and field
/// types once generic variables have been substituted (spec §3
/// `PickledType`, minus the `TVar`/`MVar` cases which only ever appear
/// inside a [`crate::signature::SignatureElement`] before resolution).
#[derive(Debug, Clone, PartialEq)]
pub enum PickledType {
    WellKnown(WellKnownType),
    Ref(TypeHandle),
    Constructed {
        definition: TypeHandle,
        arguments: Vec<PickledType>,
    },
    ArrayOf {
        element: Box<PickledType>,
        rank: u32,
    },
    ByRef(Box<PickledType>),
    Pointer(Box<PickledType>),
}

/// Writes a resolved type reference (spec §4.10's `TypeOperation`, minus the
/// `Def`/`TVar`/`MVar` cases which never appear once generics are resolved
/// and a type def is embedded separately by its caller).
pub fn write_pickled_type(writer: &mut ByteWriter, ty: &PickledType) {
    match ty {
        PickledType::WellKnown(kind) => {
            writer.write_u8(TypeOperation { kind: TypeOperationKind::WellKnown, nested: false }.to_byte());
            writer.write_u8((*kind).into());
        }
        PickledType::Ref(handle) => {
            writer.write_u8(TypeOperation { kind: TypeOperationKind::Ref, nested: false }.to_byte());
            writer.write_u64(handle.id());
        }
        PickledType::Constructed { definition, arguments } => {
            writer.write_u8(TypeOperation { kind: TypeOperationKind::Generic, nested: false }.to_byte());
            writer.write_u64(definition.id());
            writer.write_varint7(arguments.len() as u32);
            for argument in arguments {
                write_pickled_type(writer, argument);
            }
        }
        PickledType::ArrayOf { element, rank } => {
            writer.write_u8(TypeOperation { kind: TypeOperationKind::ArrayOf, nested: false }.to_byte());
            writer.write_varint7(*rank);
            write_pickled_type(writer, element);
        }
        PickledType::ByRef(inner) => {
            writer.write_u8(TypeOperation { kind: TypeOperationKind::ByRef, nested: false }.to_byte());
            write_pickled_type(writer, inner);
        }
        PickledType::Pointer(inner) => {
            writer.write_u8(TypeOperation { kind: TypeOperationKind::Pointer, nested: false }.to_byte());
            write_pickled_type(writer, inner);
        }
    }
}

/// Mirrors [`write_pickled_type`]. Reads the leading operation byte, then
/// delegates to [`read_pickled_type_from_op`], which [`read_type_ref_payload`]
/// also uses once it has peeked a byte of its own.
pub fn read_pickled_type(reader: &mut ByteReader) -> Result<PickledType, Error> {
    let op = TypeOperation::from_byte(reader.read_u8()?)?;
    read_pickled_type_from_op(reader, op)
}

fn read_pickled_type_from_op(reader: &mut ByteReader, op: TypeOperation) -> Result<PickledType, Error> {
    Ok(match op.kind {
        TypeOperationKind::WellKnown => {
            let byte = reader.read_u8()?;
            let kind = WellKnownType::try_from(byte).map_err(|_| Error::UnknownOperation {
                what: "well-known-type",
                byte,
            })?;
            PickledType::WellKnown(kind)
        }
        TypeOperationKind::Ref => PickledType::Ref(TypeHandle(reader.read_u64()?)),
        TypeOperationKind::Generic => {
            let definition = TypeHandle(reader.read_u64()?);
            let count = reader.read_varint7()? as usize;
            let mut arguments = Vec::with_capacity(count);
            for _ in 0..count {
                arguments.push(read_pickled_type(reader)?);
            }
            PickledType::Constructed { definition, arguments }
        }
        TypeOperationKind::ArrayOf => {
            let rank = reader.read_varint7()?;
            let element = Box::new(read_pickled_type(reader)?);
            PickledType::ArrayOf { element, rank }
        }
        TypeOperationKind::ByRef => PickledType::ByRef(Box::new(read_pickled_type(reader)?)),
        TypeOperationKind::Pointer => PickledType::Pointer(Box::new(read_pickled_type(reader)?)),
        other @ (TypeOperationKind::Def | TypeOperationKind::TVar | TypeOperationKind::MVar) => {
            return Err(Error::UnknownOperation {
                what: "resolved-type-operation",
                byte: other.into(),
            })
        }
    })
}

/// What a top-level type-reference slot carries (spec §3, §4.10): almost
/// always an already-resolved shape, but a top-level reference (never a
/// nested one — array elements, generic arguments, field types inside a
/// `Def` all stay `Def`-free) may instead carry a whole dynamically
/// constructed type definition.
pub enum TypeRefPayload {
    Resolved(PickledType),
    Def(TypeDef),
}

/// Peeks the leading operation byte once and either resolves a plain
/// [`PickledType`] or reads a full [`TypeDef`], without ever routing a `Def`
/// through [`read_pickled_type`] (which continues to reject it).
pub fn read_type_ref_payload(reader: &mut ByteReader) -> Result<TypeRefPayload, Error> {
    let op = TypeOperation::from_byte(reader.read_u8()?)?;
    if op.kind == TypeOperationKind::Def {
        return Ok(TypeRefPayload::Def(read_type_def(reader)?));
    }
    Ok(TypeRefPayload::Resolved(read_pickled_type_from_op(reader, op)?))
}

/// A member carried by value or by reference (spec §3 `PickledMember`).
#[derive(Debug, Clone)]
pub enum PickledMember {
    Ref(MemberKey),
    Def(MemberDef),
}

pub fn write_pickled_member(writer: &mut ByteWriter, member: &PickledMember) -> Result<(), Error> {
    match member {
        PickledMember::Ref(key) => {
            writer.write_u8(0);
            write_member_key(writer, key);
            Ok(())
        }
        PickledMember::Def(def) => {
            writer.write_u8(1);
            write_member_def(writer, def)
        }
    }
}

pub fn read_pickled_member(reader: &mut ByteReader) -> Result<PickledMember, Error> {
    Ok(match reader.read_u8()? {
        0 => PickledMember::Ref(read_member_key(reader)?),
        1 => PickledMember::Def(read_member_def(reader)?),
        other => return Err(Error::UnknownOperation { what: "pickled-member", byte: other }),
    })
}

fn write_member_key(writer: &mut ByteWriter, key: &MemberKey) {
    match key {
        MemberKey::Field { declaring, name } => {
            writer.write_u8(0);
            writer.write_u64(declaring.id());
            writer.write_string(name);
        }
        MemberKey::Property { declaring, signature } => {
            writer.write_u8(1);
            writer.write_u64(declaring.id());
            signature::write_signature(writer, signature);
        }
        MemberKey::Event { declaring, name } => {
            writer.write_u8(2);
            writer.write_u64(declaring.id());
            writer.write_string(name);
        }
        MemberKey::Method { declaring, signature } => {
            writer.write_u8(3);
            writer.write_u64(declaring.id());
            signature::write_signature(writer, signature);
        }
        MemberKey::Constructor { declaring, signature } => {
            writer.write_u8(4);
            writer.write_u64(declaring.id());
            signature::write_signature(writer, signature);
        }
    }
}

fn read_member_key(reader: &mut ByteReader) -> Result<MemberKey, Error> {
    Ok(match reader.read_u8()? {
        0 => MemberKey::Field {
            declaring: TypeHandle(reader.read_u64()?),
            name: reader.read_string()?,
        },
        1 => MemberKey::Property {
            declaring: TypeHandle(reader.read_u64()?),
            signature: signature::read_signature(reader)?,
        },
        2 => MemberKey::Event {
            declaring: TypeHandle(reader.read_u64()?),
            name: reader.read_string()?,
        },
        3 => MemberKey::Method {
            declaring: TypeHandle(reader.read_u64()?),
            signature: signature::read_signature(reader)?,
        },
        4 => MemberKey::Constructor {
            declaring: TypeHandle(reader.read_u64()?),
            signature: signature::read_signature(reader)?,
        },
        other => return Err(Error::UnknownOperation { what: "member-key", byte: other }),
    })
}

fn write_optional_method_handle(writer: &mut ByteWriter, handle: Option<MethodHandle>) {
    match handle {
        Some(handle) => {
            writer.write_bool(true);
            writer.write_u64(handle.id());
        }
        None => writer.write_bool(false),
    }
}

fn read_optional_method_handle(reader: &mut ByteReader) -> Result<Option<MethodHandle>, Error> {
    if reader.read_bool()? {
        Ok(Some(MethodHandle(reader.read_u64()?)))
    } else {
        Ok(None)
    }
}

fn write_optional_method_body(writer: &mut ByteWriter, body: &Option<crate::il::MethodBody>) -> Result<(), Error> {
    match body {
        None => {
            writer.write_bool(false);
            Ok(())
        }
        Some(body) => {
            writer.write_bool(true);
            crate::il::write_method_body(
                writer,
                body,
                |w, ty| write_pickled_type(w, ty),
                |w, field: FieldHandle| w.write_u64(field.id()),
                |w, method: MethodHandle| w.write_u64(method.id()),
            )
        }
    }
}

fn read_optional_method_body(
    reader: &mut ByteReader,
    signature: Signature,
) -> Result<Option<crate::il::MethodBody>, Error> {
    if !reader.read_bool()? {
        return Ok(None);
    }
    Ok(Some(crate::il::read_method_body(
        reader,
        signature,
        |r| read_pickled_type(r),
        |r| Ok(FieldHandle(r.read_u64()?)),
        |r| Ok(MethodHandle(r.read_u64()?)),
    )?))
}

fn write_member_def(writer: &mut ByteWriter, def: &MemberDef) -> Result<(), Error> {
    match def {
        MemberDef::Field { name, field_type, attrs, default_value } => {
            writer.write_u8(0);
            writer.write_string(name);
            write_pickled_type(writer, field_type);
            writer.write_u32(attrs.bits());
            write_optional_constant(writer, default_value.as_ref())
        }
        MemberDef::Property { name, signature, getter, setter } => {
            writer.write_u8(1);
            writer.write_string(name);
            signature::write_signature(writer, signature);
            write_optional_method_handle(writer, *getter);
            write_optional_method_handle(writer, *setter);
            Ok(())
        }
        MemberDef::Event { name, handler_type, add, remove } => {
            writer.write_u8(2);
            writer.write_string(name);
            write_pickled_type(writer, handler_type);
            write_optional_method_handle(writer, *add);
            write_optional_method_handle(writer, *remove);
            Ok(())
        }
        MemberDef::Method { name, signature, attrs, body } => {
            writer.write_u8(3);
            writer.write_string(name);
            signature::write_signature(writer, signature);
            writer.write_u32(attrs.bits());
            write_optional_method_body(writer, body)
        }
        MemberDef::Constructor { signature, body } => {
            writer.write_u8(4);
            signature::write_signature(writer, signature);
            write_optional_method_body(writer, body)
        }
    }
}

fn read_member_def(reader: &mut ByteReader) -> Result<MemberDef, Error> {
    Ok(match reader.read_u8()? {
        0 => {
            let name = reader.read_string()?;
            let field_type = read_pickled_type(reader)?;
            let attrs = FieldAttributes::from_bits_truncate(reader.read_u32()?);
            let default_value = read_optional_constant(reader)?;
            MemberDef::Field { name, field_type, attrs, default_value }
        }
        1 => {
            let name = reader.read_string()?;
            let signature = signature::read_signature(reader)?;
            let getter = read_optional_method_handle(reader)?;
            let setter = read_optional_method_handle(reader)?;
            MemberDef::Property { name, signature, getter, setter }
        }
        2 => {
            let name = reader.read_string()?;
            let handler_type = read_pickled_type(reader)?;
            let add = read_optional_method_handle(reader)?;
            let remove = read_optional_method_handle(reader)?;
            MemberDef::Event { name, handler_type, add, remove }
        }
        3 => {
            let name = reader.read_string()?;
            let signature = signature::read_signature(reader)?;
            let attrs = MethodAttributes::from_bits_truncate(reader.read_u32()?);
            let body = read_optional_method_body(reader, signature.clone())?;
            MemberDef::Method { name, signature, attrs, body }
        }
        4 => {
            let signature = signature::read_signature(reader)?;
            let body = read_optional_method_body(reader, signature.clone())?;
            MemberDef::Constructor { signature, body }
        }
        other => return Err(Error::UnknownOperation { what: "member-def", byte: other }),
    })
}

fn constant_kind_of(value: &RuntimeValue) -> Result<WellKnownType, Error> {
    Ok(match value {
        RuntimeValue::Null => WellKnownType::Void,
        RuntimeValue::Bool(_) => WellKnownType::Boolean,
        RuntimeValue::I8(_) => WellKnownType::SByte,
        RuntimeValue::U8(_) => WellKnownType::Byte,
        RuntimeValue::I16(_) => WellKnownType::Int16,
        RuntimeValue::U16(_) => WellKnownType::UInt16,
        RuntimeValue::I32(_) => WellKnownType::Int32,
        RuntimeValue::U32(_) => WellKnownType::UInt32,
        RuntimeValue::I64(_) => WellKnownType::Int64,
        RuntimeValue::U64(_) => WellKnownType::UInt64,
        RuntimeValue::F32(_) => WellKnownType::Single,
        RuntimeValue::F64(_) => WellKnownType::Double,
        RuntimeValue::Char(_) => WellKnownType::Char,
        RuntimeValue::String(_) => WellKnownType::String,
        RuntimeValue::Type(_) => WellKnownType::TypeOfType,
        other => {
            return Err(Error::TypeMismatch(format!(
                "{other:?} cannot be carried as a custom-attribute or default-value constant"
            )))
        }
    })
}

/// A restricted literal subset of [`RuntimeValue`] (spec §3, custom
/// attributes and field default values): enough for the scalars ECMA-335
/// constants actually allow, not the full object graph a field's own
/// declared type might otherwise hold.
pub fn write_constant(writer: &mut ByteWriter, value: &RuntimeValue) -> Result<(), Error> {
    let kind = constant_kind_of(value)?;
    writer.write_u8(kind.into());
    match (kind, value) {
        (WellKnownType::Void, RuntimeValue::Null) => {}
        (WellKnownType::Boolean, RuntimeValue::Bool(b)) => writer.write_bool(*b),
        (WellKnownType::SByte, RuntimeValue::I8(v)) => writer.write_u8(*v as u8),
        (WellKnownType::Byte, RuntimeValue::U8(v)) => writer.write_u8(*v),
        (WellKnownType::Int16, RuntimeValue::I16(v)) => writer.write_bytes(&v.to_le_bytes()),
        (WellKnownType::UInt16, RuntimeValue::U16(v)) => writer.write_bytes(&v.to_le_bytes()),
        (WellKnownType::Int32, RuntimeValue::I32(v)) => writer.write_i32(*v),
        (WellKnownType::UInt32, RuntimeValue::U32(v)) => writer.write_u32(*v),
        (WellKnownType::Int64, RuntimeValue::I64(v)) => writer.write_i64(*v),
        (WellKnownType::UInt64, RuntimeValue::U64(v)) => writer.write_u64(*v),
        (WellKnownType::Single, RuntimeValue::F32(v)) => writer.write_f32(*v),
        (WellKnownType::Double, RuntimeValue::F64(v)) => writer.write_f64(*v),
        (WellKnownType::Char, RuntimeValue::Char(c)) => writer.write_char(*c),
        (WellKnownType::String, RuntimeValue::String(s)) => writer.write_string(s),
        (WellKnownType::TypeOfType, RuntimeValue::Type(handle)) => writer.write_u64(handle.id()),
        _ => unreachable!("constant_kind_of already validated this pairing"),
    }
    Ok(())
}

/// Mirrors [`write_constant`].
pub fn read_constant(reader: &mut ByteReader) -> Result<RuntimeValue, Error> {
    let byte = reader.read_u8()?;
    let kind = WellKnownType::try_from(byte).map_err(|_| Error::UnknownOperation { what: "constant", byte })?;
    Ok(match kind {
        WellKnownType::Void => RuntimeValue::Null,
        WellKnownType::Boolean => RuntimeValue::Bool(reader.read_bool()?),
        WellKnownType::SByte => RuntimeValue::I8(reader.read_u8()? as i8),
        WellKnownType::Byte => RuntimeValue::U8(reader.read_u8()?),
        WellKnownType::Int16 => RuntimeValue::I16(i16::from_le_bytes(reader.read_array::<2>()?)),
        WellKnownType::UInt16 => RuntimeValue::U16(u16::from_le_bytes(reader.read_array::<2>()?)),
        WellKnownType::Int32 => RuntimeValue::I32(reader.read_i32()?),
        WellKnownType::UInt32 => RuntimeValue::U32(reader.read_u32()?),
        WellKnownType::Int64 => RuntimeValue::I64(reader.read_i64()?),
        WellKnownType::UInt64 => RuntimeValue::U64(reader.read_u64()?),
        WellKnownType::Single => RuntimeValue::F32(reader.read_f32()?),
        WellKnownType::Double => RuntimeValue::F64(reader.read_f64()?),
        WellKnownType::Char => RuntimeValue::Char(reader.read_char()?),
        WellKnownType::String => RuntimeValue::String(Rc::from(reader.read_string()?.as_str())),
        WellKnownType::TypeOfType => RuntimeValue::Type(TypeHandle(reader.read_u64()?)),
        other => {
            return Err(Error::UnknownOperation {
                what: "constant",
                byte: other.into(),
            })
        }
    })
}

fn write_optional_constant(writer: &mut ByteWriter, value: Option<&RuntimeValue>) -> Result<(), Error> {
    match value {
        None => {
            writer.write_bool(false);
            Ok(())
        }
        Some(value) => {
            writer.write_bool(true);
            write_constant(writer, value)
        }
    }
}

fn read_optional_constant(reader: &mut ByteReader) -> Result<Option<RuntimeValue>, Error> {
    if reader.read_bool()? {
        Ok(Some(read_constant(reader)?))
    } else {
        Ok(None)
    }
}

pub fn write_custom_attribute(writer: &mut ByteWriter, attribute: &CustomAttribute) -> Result<(), Error> {
    writer.write_u64(attribute.constructor.id());
    writer.write_varint7(attribute.positional_args.len() as u32);
    for arg in &attribute.positional_args {
        write_constant(writer, arg)?;
    }
    writer.write_varint7(attribute.named_args.len() as u32);
    for (name, arg) in &attribute.named_args {
        writer.write_string(name);
        write_constant(writer, arg)?;
    }
    Ok(())
}

pub fn read_custom_attribute(reader: &mut ByteReader) -> Result<CustomAttribute, Error> {
    let constructor = MethodHandle(reader.read_u64()?);
    let positional_count = reader.read_varint7()? as usize;
    let mut positional_args = Vec::with_capacity(positional_count);
    for _ in 0..positional_count {
        positional_args.push(read_constant(reader)?);
    }
    let named_count = reader.read_varint7()? as usize;
    let mut named_args = Vec::with_capacity(named_count);
    for _ in 0..named_count {
        let name = reader.read_string()?;
        named_args.push((name, read_constant(reader)?));
    }
    Ok(CustomAttribute { constructor, positional_args, named_args })
}

/// A dynamically constructed type, embedded by value (spec §3
/// `PickledType::Def`, spec §4.10's `Def` `TypeOperation`).
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeDefKind,
    pub attrs: TypeAttributes,
    pub generic_parameter_names: Vec<String>,
    pub parent: Option<PickledType>,
    pub interfaces: Vec<PickledType>,
    pub members: Vec<PickledMember>,
    pub custom_attributes: Vec<CustomAttribute>,
}

pub fn write_type_def(writer: &mut ByteWriter, def: &TypeDef) -> Result<(), Error> {
    writer.write_string(&def.name);
    writer.write_u8(def.kind.into());
    writer.write_u32(def.attrs.bits());
    writer.write_varint7(def.generic_parameter_names.len() as u32);
    for name in &def.generic_parameter_names {
        writer.write_string(name);
    }
    match &def.parent {
        Some(parent) => {
            writer.write_bool(true);
            write_pickled_type(writer, parent);
        }
        None => writer.write_bool(false),
    }
    writer.write_varint7(def.interfaces.len() as u32);
    for iface in &def.interfaces {
        write_pickled_type(writer, iface);
    }
    writer.write_varint7(def.members.len() as u32);
    for member in &def.members {
        write_pickled_member(writer, member)?;
    }
    writer.write_varint7(def.custom_attributes.len() as u32);
    for attr in &def.custom_attributes {
        write_custom_attribute(writer, attr)?;
    }
    Ok(())
}

/// Mirrors [`write_type_def`].
pub fn read_type_def(reader: &mut ByteReader) -> Result<TypeDef, Error> {
    let name = reader.read_string()?;
    let kind_byte = reader.read_u8()?;
    let kind = TypeDefKind::try_from(kind_byte)
        .map_err(|_| Error::UnknownOperation { what: "type-def-kind", byte: kind_byte })?;
    let attrs = TypeAttributes::from_bits_truncate(reader.read_u32()?);
    let generic_count = reader.read_varint7()? as usize;
    let mut generic_parameter_names = Vec::with_capacity(generic_count);
    for _ in 0..generic_count {
        generic_parameter_names.push(reader.read_string()?);
    }
    let parent = if reader.read_bool()? {
        Some(read_pickled_type(reader)?)
    } else {
        None
    };
    let interface_count = reader.read_varint7()? as usize;
    let mut interfaces = Vec::with_capacity(interface_count);
    for _ in 0..interface_count {
        interfaces.push(read_pickled_type(reader)?);
    }
    let member_count = reader.read_varint7()? as usize;
    let mut members = Vec::with_capacity(member_count);
    for _ in 0..member_count {
        members.push(read_pickled_member(reader)?);
    }
    let attribute_count = reader.read_varint7()? as usize;
    let mut custom_attributes = Vec::with_capacity(attribute_count);
    for _ in 0..attribute_count {
        custom_attributes.push(read_custom_attribute(reader)?);
    }
    Ok(TypeDef {
        name,
        kind,
        attrs,
        generic_parameter_names,
        parent,
        interfaces,
        members,
        custom_attributes,
    })
}

impl TypeDef {
    /// Creates the skeleton with the host, in the order spec §4.10 requires:
    /// declare the type first (so self-referential fields/members can name
    /// it), then defer the rest — parent/interfaces, then members, then the
    /// seal — onto `scheduler`, so a field or parent typed as another type
    /// still being defined resolves once that type's own `Declare` work has
    /// run rather than while it is still being torn down by the recursive
    /// call that produced it.
    pub fn materialize(
        self: Rc<Self>,
        host: &mut dyn ReflectionFacade,
        module: ModuleHandle,
        outer: Option<TypeHandle>,
        scheduler: &mut Scheduler<'static>,
    ) -> Result<TypeHandle, Error> {
        let handle = match outer {
            Some(outer) => host.define_nested_type(outer, &self.name, self.kind, self.attrs)?,
            None => host.define_type(module, &self.name, self.kind, self.attrs)?,
        };
        if !self.generic_parameter_names.is_empty() {
            host.define_generic_parameters(handle, &self.generic_parameter_names)?;
        }

        let shape = Rc::clone(&self);
        scheduler.defer(Stage::Shape, move |host| {
            if let Some(parent) = &shape.parent {
                let parent_handle = host.resolve_pickled_type(parent)?;
                host.set_parent(handle, parent_handle)?;
            }
            for iface in &shape.interfaces {
                let iface_handle = host.resolve_pickled_type(iface)?;
                host.add_interface(handle, iface_handle)?;
            }
            Ok(())
        })?;

        let members = Rc::clone(&self);
        scheduler.defer(Stage::Members, move |host| {
            for member in &members.members {
                materialize_member(host, handle, member)?;
            }
            Ok(())
        })?;

        let seal = Rc::clone(&self);
        scheduler.defer(Stage::Seal, move |host| {
            for attr in &seal.custom_attributes {
                host.apply_custom_attribute(handle, attr)?;
            }
            host.create_type(handle)
        })?;

        Ok(handle)
    }
}

fn materialize_member(
    host: &mut dyn ReflectionFacade,
    ty: TypeHandle,
    member: &PickledMember,
) -> Result<(), Error> {
    let PickledMember::Def(def) = member else {
        // References are resolved lazily by whoever consumes the member
        // list (signature/body decoding); nothing to materialize here.
        return Ok(());
    };
    match def {
        MemberDef::Field {
            name,
            field_type,
            attrs,
            ..
        } => {
            let field_ty = host.resolve_pickled_type(field_type)?;
            host.define_field(ty, name, field_ty, *attrs)?;
        }
        MemberDef::Method { name, signature, attrs, .. } => {
            host.define_method(ty, name, signature, *attrs)?;
        }
        MemberDef::Constructor { signature, .. } => {
            host.define_constructor(ty, signature)?;
        }
        MemberDef::Property { name, signature, .. } => {
            host.define_property(ty, name, signature)?;
        }
        MemberDef::Event {
            name, handler_type, ..
        } => {
            let handler = host.resolve_pickled_type(handler_type)?;
            host.define_event(ty, name, handler)?;
        }
    }
    Ok(())
}

/// Per-stream memo of handles seen so far (spec §4.10: assembly references),
/// modeled on [`crate::memo::EncodeMemo`]/[`crate::memo::DecodeMemo`] but
/// keyed by the handle's own value rather than a `RuntimeValue`'s pointer
/// identity — assembly counts per stream are small, so a linear scan is
/// simpler than maintaining a hash index.
#[derive(Default)]
pub struct HandleMemo<H> {
    seen: Vec<H>,
}

impl<H: PartialEq + Copy> HandleMemo<H> {
    #[must_use]
    pub fn new() -> Self {
        Self { seen: Vec::new() }
    }

    #[must_use]
    pub fn lookup(&self, handle: H) -> Option<u32> {
        self.seen
            .iter()
            .position(|&seen| seen == handle)
            .map(|index| index as u32 + 1)
    }

    pub fn publish(&mut self, handle: H) -> u32 {
        self.seen.push(handle);
        self.seen.len() as u32
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<H> {
        id.checked_sub(1).and_then(|index| self.seen.get(index as usize).copied())
    }
}

/// Writes an assembly reference (spec §4.10): the mscorlib-equivalent
/// shortcut first, then a per-stream memo, then a fresh by-name reference.
pub fn write_assembly_ref(
    writer: &mut ByteWriter,
    host: &dyn ReflectionFacade,
    memo: &mut HandleMemo<AssemblyHandle>,
    asm: AssemblyHandle,
) {
    if host.is_mscorlib(asm) {
        writer.write_u8(AssemblyOperation::MscorlibReference as u8);
        return;
    }
    if let Some(id) = memo.lookup(asm) {
        writer.write_u8(AssemblyOperation::Memo as u8);
        writer.write_varint7(id);
        return;
    }
    writer.write_u8(AssemblyOperation::Reference as u8);
    memo.publish(asm);
    writer.write_string(&host.assembly_display_name(asm));
}

/// Mirrors [`write_assembly_ref`]. An embedded `Def` is rejected: this crate
/// has no assembly-construction API on [`ReflectionFacade`], only
/// type-construction (spec §9 design note, item 3).
pub fn read_assembly_ref(
    reader: &mut ByteReader,
    host: &mut dyn ReflectionFacade,
    memo: &mut HandleMemo<AssemblyHandle>,
) -> Result<AssemblyHandle, Error> {
    let byte = reader.read_u8()?;
    match AssemblyOperation::try_from(byte).map_err(|_| Error::UnknownOperation { what: "assembly", byte })? {
        AssemblyOperation::MscorlibReference => host
            .current_loaded_assemblies()
            .into_iter()
            .find(|asm| host.is_mscorlib(*asm))
            .ok_or_else(|| Error::Construction("host has no mscorlib-equivalent assembly loaded".into())),
        AssemblyOperation::Reference => {
            let name = reader.read_string()?;
            let handle = host.resolve_assembly_by_name(&name)?;
            memo.publish(handle);
            Ok(handle)
        }
        AssemblyOperation::Memo => {
            let id = reader.read_varint7()?;
            memo.get(id).ok_or(Error::BadMemo(id))
        }
        AssemblyOperation::Def => Err(Error::Construction(
            "embedded assembly definitions are not supported".into(),
        )),
    }
}

/// Writes a module reference. This crate tracks no module-level registry
/// beyond the manifest module a dynamic assembly is given on creation, so
/// every module reference is written as that one well-known slot rather
/// than negotiated like an assembly or a type.
pub fn write_module_ref(writer: &mut ByteWriter, module: ModuleHandle) {
    writer.write_u8(ModuleOperation::ManifestModule as u8);
    writer.write_u64(module.id());
}

/// Mirrors [`write_module_ref`].
pub fn read_module_ref(reader: &mut ByteReader) -> Result<ModuleHandle, Error> {
    let byte = reader.read_u8()?;
    match ModuleOperation::try_from(byte).map_err(|_| Error::UnknownOperation { what: "module", byte })? {
        ModuleOperation::ManifestModule => Ok(ModuleHandle(reader.read_u64()?)),
        ModuleOperation::Reference | ModuleOperation::Def => Err(Error::Construction(
            "this crate tracks no module-level registry beyond the manifest module".into(),
        )),
    }
}
