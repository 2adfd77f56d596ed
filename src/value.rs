//! The value codec (spec §4.4–§4.8): the single recursive dispatch point
//! that every other module's payload bottoms out in.
//!
//! Every call site supplies the *static* type of the slot being read or
//! written (a field's declared type, an array's element type, a tuple
//! argument) exactly like `llvm-bitcode::read::BlockIter::next` dispatches
//! on a cached abbreviation descriptor it already resolved once, rather
//! than re-deriving structure on every record: here the already-derived
//! `TypeInfo` tells the codec whether the slot is inline (no envelope) or
//! reference-identity (null/memo/object envelope) and, for builtins,
//! exactly which scalar shape to read or write.

use std::cell::RefCell;
use std::rc::Rc;

use crate::array;
use crate::delegatev;
use crate::dispatch;
use crate::error::Error;
use crate::generics::GenericContext;
use crate::memo::{DecodeMemo, EncodeMemo, ObjectOperation};
use crate::model::{ArrayData, DelegateData, ObjectData, RuntimeValue};
use crate::reducer;
use crate::reflect::{AssemblyHandle, MethodHandle, ReflectionFacade, TypeHandle};
use crate::scheduler::Scheduler;
use crate::tuplev;
use crate::typeinfo::{TypeInfo, TypeInfoCache, TypeMode};
use crate::varint::{ByteReader, ByteWriter};
use crate::wellknown::WellKnownType;

/// Threaded through one whole pickle call: the memo table, the per-stream
/// `TypeInfo` cache, and whatever generic-variable context is currently in
/// scope (spec §3).
pub struct EncodeContext<'h> {
    pub host: &'h mut dyn ReflectionFacade,
    pub memo: EncodeMemo,
    pub types: TypeInfoCache,
    pub generics: GenericContext,
    pub assembly_memo: dispatch::HandleMemo<AssemblyHandle>,
}

impl<'h> EncodeContext<'h> {
    #[must_use]
    pub fn new(host: &'h mut dyn ReflectionFacade) -> Self {
        Self {
            host,
            memo: EncodeMemo::new(),
            types: TypeInfoCache::new(),
            generics: GenericContext::new(),
            assembly_memo: dispatch::HandleMemo::new(),
        }
    }

    fn type_info(&mut self, ty: TypeHandle) -> Rc<TypeInfo> {
        self.types.derive(self.host, ty)
    }
}

/// Threaded through one whole unpickle call.
pub struct DecodeContext<'h> {
    pub host: &'h mut dyn ReflectionFacade,
    pub memo: DecodeMemo,
    pub types: TypeInfoCache,
    pub generics: GenericContext,
    pub assembly_memo: dispatch::HandleMemo<AssemblyHandle>,
    /// Stage-deferred work produced by a top-level `Def` type reference
    /// (spec §4.9); drained once by [`crate::unpickler::Unpickler::unpickle`]
    /// after the whole value tree has been decoded.
    pub scheduler: Scheduler<'static>,
    /// Mirrors `EngineOptions::allow_dynamic_definitions` (spec §4.10):
    /// whether a top-level type reference is even allowed to carry an
    /// embedded `Def` rather than resolving against the host's own types.
    pub allow_dynamic_definitions: bool,
}

impl<'h> DecodeContext<'h> {
    #[must_use]
    pub fn new(host: &'h mut dyn ReflectionFacade, allow_dynamic_definitions: bool) -> Self {
        Self {
            host,
            memo: DecodeMemo::new(),
            types: TypeInfoCache::new(),
            generics: GenericContext::new(),
            assembly_memo: dispatch::HandleMemo::new(),
            scheduler: Scheduler::new(),
            allow_dynamic_definitions,
        }
    }

    /// Negotiates (or reuses the cached) `TypeInfo` for `ty` against a
    /// sender-declared shape already read off the wire (used when a header
    /// processes an incoming `TypeOperation::Def`, not by the value codec
    /// itself, which only ever sees already-negotiated types).
    pub(crate) fn negotiated(
        &mut self,
        ty: TypeHandle,
        sender_flags: crate::typeinfo::TypeFlags,
        mode: TypeMode,
        fields: &[(String, TypeHandle)],
        type_code: Option<u8>,
    ) -> Rc<TypeInfo> {
        self.types
            .negotiate(self.host, ty, sender_flags, mode, fields, type_code)
    }

    fn type_info_get_or_derive(&mut self, ty: TypeHandle) -> Rc<TypeInfo> {
        if let Some(info) = self.types.get(ty) {
            return info;
        }
        self.types.derive(self.host, ty)
    }
}

/// One byte identifying which reference-identity shape an `Object`
/// envelope contains (spec §4.4): written right after
/// [`ObjectOperation::Object`], before the type reference, so decode never
/// has to guess from `TypeInfo` alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ReferenceKind {
    String = 0,
    RefTuple = 1,
    Array = 2,
    Object = 3,
    Delegate = 4,
}

impl ReferenceKind {
    fn of(value: &RuntimeValue) -> Self {
        match value {
            RuntimeValue::String(_) => Self::String,
            RuntimeValue::RefTuple(_) => Self::RefTuple,
            RuntimeValue::Array(_) => Self::Array,
            RuntimeValue::Object(_) => Self::Object,
            RuntimeValue::Delegate(_) => Self::Delegate,
            _ => unreachable!("only reference-identity values have a ReferenceKind"),
        }
    }

    fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0 => Ok(Self::String),
            1 => Ok(Self::RefTuple),
            2 => Ok(Self::Array),
            3 => Ok(Self::Object),
            4 => Ok(Self::Delegate),
            other => Err(Error::UnknownOperation {
                what: "reference-kind",
                byte: other,
            }),
        }
    }
}

/// Writes a type reference (spec §4.10): most slots just carry the
/// already-negotiated `PickledType` shape, but a type the host is itself
/// holding dynamically gets its whole definition embedded instead, so a
/// receiver with no prior knowledge of it can still materialize one.
fn write_type_ref(ctx: &mut EncodeContext, writer: &mut ByteWriter, ty: TypeHandle) -> Result<(), Error> {
    if let Some(def) = ctx.host.dynamic_definition_of(ty) {
        writer.write_u8(
            dispatch::TypeOperation {
                kind: dispatch::TypeOperationKind::Def,
                nested: false,
            }
            .to_byte(),
        );
        return dispatch::write_type_def(writer, &def);
    }
    let pickled = ctx.host.pickled_type_of(ty);
    dispatch::write_pickled_type(writer, &pickled);
    Ok(())
}

/// Mirrors [`write_type_ref`]. A `Def` payload is only honored when the
/// engine's options permit embedded dynamic definitions; materializing one
/// defers its shape/members/seal work onto `ctx.scheduler` rather than doing
/// it inline (spec §4.9).
fn read_type_ref(ctx: &mut DecodeContext, reader: &mut ByteReader) -> Result<TypeHandle, Error> {
    match dispatch::read_type_ref_payload(reader)? {
        dispatch::TypeRefPayload::Resolved(pickled) => ctx.host.resolve_pickled_type(&pickled),
        dispatch::TypeRefPayload::Def(def) => {
            if !ctx.allow_dynamic_definitions {
                return Err(Error::Construction(
                    "embedded dynamic type definitions are not permitted by this engine's options".into(),
                ));
            }
            let module = ctx.host.dynamic_definition_module()?;
            Rc::new(def).materialize(ctx.host, module, None, &mut ctx.scheduler)
        }
    }
}

/// Encodes `value`, whose declared slot type is `static_type` (spec
/// §4.2–§4.4): value types with no physical identity are written inline
/// with no envelope; everything else goes through the null/memo/object
/// envelope.
pub fn encode_value(
    ctx: &mut EncodeContext,
    writer: &mut ByteWriter,
    static_type: TypeHandle,
    value: &RuntimeValue,
) -> Result<(), Error> {
    // A slot statically typed `object` can hold anything assignable to it,
    // including boxed primitives with no reference identity of their own;
    // it gets the same self-describing treatment as a tuple argument or
    // delegate target rather than a `TypeInfo` negotiated for `object`
    // itself (spec §6.1: the top-level value is always one of these).
    if static_type == ctx.host.object_type_handle() {
        return encode_dynamic(ctx, writer, value);
    }
    let info = ctx.type_info(static_type);
    encode_inline_or_envelope(ctx, writer, &info, value)
}

fn encode_inline(
    ctx: &mut EncodeContext,
    writer: &mut ByteWriter,
    info: &TypeInfo,
    value: &RuntimeValue,
) -> Result<(), Error> {
    if let Some(builtin) = info.builtin {
        return encode_builtin_scalar(ctx, writer, builtin, value);
    }
    match (info.mode, value) {
        (TypeMode::AutoSerializedObject, RuntimeValue::ValueTuple(elements)) => {
            if elements.len() != info.serialized_fields.len() {
                return Err(Error::InvalidData(format!(
                    "value-type instance has {} fields but its type info expects {}",
                    elements.len(),
                    info.serialized_fields.len()
                )));
            }
            let mut fields = info.serialized_fields.iter();
            tuplev::write_value_tuple(writer, elements, |w, element| {
                let (field_info, _) = fields.next().expect("field count already checked above");
                encode_inline_or_envelope(ctx, w, field_info, element)
            })
        }
        (TypeMode::Enum, RuntimeValue::Enum { value, .. }) => {
            writer.write_i64(*value);
            Ok(())
        }
        _ => Err(Error::TypeMismatch(format!(
            "value {value:?} does not match inline type info {info:?}"
        ))),
    }
}

/// Recurses into a nested `TypeInfo` directly (used for tuple/struct
/// fields, where we already hold the field's `TypeInfo` and shouldn't pay
/// for another `TypeHandle` round trip).
fn encode_inline_or_envelope(
    ctx: &mut EncodeContext,
    writer: &mut ByteWriter,
    info: &Rc<TypeInfo>,
    value: &RuntimeValue,
) -> Result<(), Error> {
    if !info.should_memo() {
        return encode_inline(ctx, writer, info, value);
    }
    if value.is_null() {
        writer.write_u8(ObjectOperation::Null as u8);
        return Ok(());
    }
    if let Some(memo_id) = ctx.memo.lookup(value) {
        writer.write_u8(ObjectOperation::Memo as u8);
        writer.write_varint15(memo_id as u16);
        return Ok(());
    }
    writer.write_u8(ObjectOperation::Object as u8);
    writer.write_u8(ReferenceKind::of(value) as u8);
    ctx.memo.publish(value);
    encode_reference_body(ctx, writer, value)
}

fn encode_builtin_scalar(
    ctx: &mut EncodeContext,
    writer: &mut ByteWriter,
    builtin: WellKnownType,
    value: &RuntimeValue,
) -> Result<(), Error> {
    match (builtin, value) {
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
        (WellKnownType::Decimal, RuntimeValue::Decimal(bytes)) => writer.write_decimal(*bytes),
        (WellKnownType::Char, RuntimeValue::Char(c)) => writer.write_char(*c),
        (WellKnownType::TypeOfType, RuntimeValue::Type(handle)) => write_type_ref(ctx, writer, *handle)?,
        (WellKnownType::Assembly, RuntimeValue::Assembly(handle)) => {
            dispatch::write_assembly_ref(writer, ctx.host, &mut ctx.assembly_memo, *handle)
        }
        (WellKnownType::Module, RuntimeValue::Module(handle)) => dispatch::write_module_ref(writer, *handle),
        (WellKnownType::MethodBase, RuntimeValue::MethodRef(handle)) => writer.write_u64(handle.id()),
        (WellKnownType::FieldInfo, RuntimeValue::FieldRef(handle)) => writer.write_u64(handle.id()),
        (WellKnownType::Void, RuntimeValue::Null) => {}
        _ => {
            return Err(Error::TypeMismatch(format!(
                "value {value:?} does not match builtin {builtin:?}"
            )))
        }
    }
    Ok(())
}

fn encode_reference_body(ctx: &mut EncodeContext, writer: &mut ByteWriter, value: &RuntimeValue) -> Result<(), Error> {
    match value {
        RuntimeValue::String(s) => {
            writer.write_string(s);
            Ok(())
        }
        RuntimeValue::RefTuple(cell) => {
            let elements = cell.borrow();
            writer.write_varint7(elements.len() as u32);
            for element in elements.iter() {
                // Reference-tuple arguments are self-describing: without a
                // stored per-argument `TypeHandle`, each is written through
                // the same dynamic path used for `System.Object`-typed
                // slots (a byte-for-byte superset of the static path).
                encode_dynamic(ctx, writer, element)?;
            }
            Ok(())
        }
        RuntimeValue::Array(cell) => {
            let data = cell.borrow();
            write_type_ref(ctx, writer, data.element_type)?;
            array::write_shape(writer, &data.shape);
            let fast_path = array::fast_path_width(ctx.host, data.element_type);
            let element_info = ctx.type_info(data.element_type);
            array::write_elements(writer, fast_path, &data, |w, v| {
                encode_inline_or_envelope(ctx, w, &element_info, v)
            })
        }
        RuntimeValue::Object(cell) => {
            let data = cell.borrow();
            write_type_ref(ctx, writer, data.type_handle)?;
            let info = ctx.type_info(data.type_handle);
            let reduced = ctx.host.reduce_for_encode(data.type_handle, value);
            if let Some(reduced) = reduced {
                log::trace!(
                    "reducer dispatch: constructor {} with {} args",
                    reduced.constructor.id(),
                    reduced.args.len()
                );
                writer.write_u8(1); // reduced; constructor + args follow
                reducer::write_reduced_form(
                    writer,
                    &reduced,
                    |w, m| {
                        w.write_u64(m.id());
                        Ok(())
                    },
                    |w, v| encode_dynamic(ctx, w, v),
                )?;
                return Ok(());
            }
            writer.write_u8(0); // not reduced; fields follow
            if info.serialized_fields.len() != data.fields.len() {
                return Err(Error::InvalidData(format!(
                    "object has {} fields but its type info expects {}",
                    data.fields.len(),
                    info.serialized_fields.len()
                )));
            }
            let fields: Vec<_> = info.serialized_fields.clone();
            for (field_value, (field_info, _)) in data.fields.iter().zip(&fields) {
                encode_inline_or_envelope(ctx, writer, field_info, field_value)?;
            }
            Ok(())
        }
        RuntimeValue::Delegate(cell) => {
            let data = cell.borrow();
            write_type_ref(ctx, writer, data.type_handle)?;
            delegatev::write_invocation_list(
                writer,
                &data,
                |w, target| encode_dynamic(ctx, w, target),
                |w, method| {
                    w.write_u64(method.id());
                    Ok(())
                },
            )
        }
        _ => unreachable!("only reference-identity values reach encode_reference_body"),
    }
}

/// One byte fronting a dynamically (`System.Object`-)typed slot, where the
/// caller has no `TypeHandle` to hand `encode_value`/`decode_value`: reuses
/// [`ObjectOperation`]'s Null/Memo/Object ordinals for reference-identity
/// values and adds two more cases so primitives and boxed enums stay
/// self-describing without being forced through the memo table.
const DYNAMIC_PRIMITIVE: u8 = 3;
const DYNAMIC_ENUM: u8 = 4;

fn well_known_kind_of(value: &RuntimeValue) -> Result<WellKnownType, Error> {
    Ok(match value {
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
        RuntimeValue::Decimal(_) => WellKnownType::Decimal,
        RuntimeValue::Char(_) => WellKnownType::Char,
        RuntimeValue::Type(_) => WellKnownType::TypeOfType,
        RuntimeValue::Assembly(_) => WellKnownType::Assembly,
        RuntimeValue::Module(_) => WellKnownType::Module,
        RuntimeValue::MethodRef(_) => WellKnownType::MethodBase,
        RuntimeValue::FieldRef(_) => WellKnownType::FieldInfo,
        other => {
            return Err(Error::TypeMismatch(format!(
                "value {other:?} has no boxed-primitive well-known type"
            )))
        }
    })
}

/// Writes a value whose static type is not known ahead of time — used for
/// `System.Object`-typed slots (reference-tuple arguments, delegate
/// targets): each value carries its own discriminant rather than relying on
/// a declared slot type (spec §4.4).
fn encode_dynamic(ctx: &mut EncodeContext, writer: &mut ByteWriter, value: &RuntimeValue) -> Result<(), Error> {
    if value.is_null() {
        writer.write_u8(ObjectOperation::Null as u8);
        return Ok(());
    }
    if value.identity().is_some() {
        if let Some(memo_id) = ctx.memo.lookup(value) {
            writer.write_u8(ObjectOperation::Memo as u8);
            writer.write_varint15(memo_id as u16);
            return Ok(());
        }
        writer.write_u8(ObjectOperation::Object as u8);
        writer.write_u8(ReferenceKind::of(value) as u8);
        ctx.memo.publish(value);
        return encode_reference_body(ctx, writer, value);
    }
    if let RuntimeValue::Enum { type_handle, value: v } = value {
        writer.write_u8(DYNAMIC_ENUM);
        write_type_ref(ctx, writer, *type_handle)?;
        writer.write_i64(*v);
        return Ok(());
    }
    let kind = well_known_kind_of(value)?;
    writer.write_u8(DYNAMIC_PRIMITIVE);
    writer.write_u8(kind.into());
    encode_builtin_scalar(ctx, writer, kind, value)
}

/// Decodes a value whose declared slot type is `static_type`, mirroring
/// [`encode_value`].
pub fn decode_value(ctx: &mut DecodeContext, reader: &mut ByteReader, static_type: TypeHandle) -> Result<RuntimeValue, Error> {
    if static_type == ctx.host.object_type_handle() {
        return decode_dynamic(ctx, reader);
    }
    let info = ctx.type_info_get_or_derive(static_type);
    decode_inline_or_envelope(ctx, reader, &info)
}

fn decode_inline(ctx: &mut DecodeContext, reader: &mut ByteReader, info: &Rc<TypeInfo>) -> Result<RuntimeValue, Error> {
    if let Some(builtin) = info.builtin {
        return decode_builtin_scalar(ctx, reader, builtin);
    }
    match info.mode {
        TypeMode::AutoSerializedObject => {
            let fields: Vec<_> = info.serialized_fields.clone();
            let mut remaining = fields.iter();
            let elements = tuplev::read_value_tuple(reader, fields.len(), |r| {
                let (field_info, _) = remaining.next().expect("arity already fixed above");
                decode_inline_or_envelope(ctx, r, field_info)
            })?;
            Ok(RuntimeValue::ValueTuple(elements))
        }
        TypeMode::Enum => Ok(RuntimeValue::Enum {
            type_handle: info
                .type_handle
                .ok_or_else(|| Error::TypeMismatch("enum TypeInfo missing its type handle".into()))?,
            value: reader.read_i64()?,
        }),
        other => Err(Error::TypeMismatch(format!(
            "no inline decoding defined for type mode {other:?}"
        ))),
    }
}

fn decode_inline_or_envelope(
    ctx: &mut DecodeContext,
    reader: &mut ByteReader,
    info: &Rc<TypeInfo>,
) -> Result<RuntimeValue, Error> {
    if !info.should_memo() {
        return decode_inline(ctx, reader, info);
    }
    decode_envelope(ctx, reader)
}

fn decode_builtin_scalar(ctx: &mut DecodeContext, reader: &mut ByteReader, builtin: WellKnownType) -> Result<RuntimeValue, Error> {
    Ok(match builtin {
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
        WellKnownType::Decimal => RuntimeValue::Decimal(reader.read_decimal()?),
        WellKnownType::Char => RuntimeValue::Char(reader.read_char()?),
        WellKnownType::TypeOfType => RuntimeValue::Type(read_type_ref(ctx, reader)?),
        WellKnownType::Assembly => {
            RuntimeValue::Assembly(dispatch::read_assembly_ref(reader, ctx.host, &mut ctx.assembly_memo)?)
        }
        WellKnownType::Module => RuntimeValue::Module(dispatch::read_module_ref(reader)?),
        WellKnownType::MethodBase => RuntimeValue::MethodRef(MethodHandle(reader.read_u64()?)),
        WellKnownType::FieldInfo => RuntimeValue::FieldRef(crate::reflect::FieldHandle(reader.read_u64()?)),
        other => {
            return Err(Error::TypeMismatch(format!(
                "no inline decoding defined for builtin {other:?}"
            )))
        }
    })
}

fn decode_envelope(ctx: &mut DecodeContext, reader: &mut ByteReader) -> Result<RuntimeValue, Error> {
    match ObjectOperation::from_byte(reader.read_u8()?)? {
        ObjectOperation::Null => Ok(RuntimeValue::Null),
        ObjectOperation::Memo => {
            let id = reader.read_varint15()? as u32;
            ctx.memo.get(id)
        }
        ObjectOperation::Object => {
            let kind = ReferenceKind::from_byte(reader.read_u8()?)?;
            decode_reference_body(ctx, reader, kind)
        }
    }
}

/// Dynamic counterpart of [`encode_dynamic`]: decodes a `System.Object`
/// slot whose concrete type is carried on the wire rather than known from
/// context ahead of time.
fn decode_dynamic(ctx: &mut DecodeContext, reader: &mut ByteReader) -> Result<RuntimeValue, Error> {
    let tag = reader.read_u8()?;
    match tag {
        DYNAMIC_PRIMITIVE => {
            let kind = WellKnownType::try_from(reader.read_u8()?)
                .map_err(|_| Error::InvalidData("unrecognized boxed-primitive well-known type".into()))?;
            decode_builtin_scalar(ctx, reader, kind)
        }
        DYNAMIC_ENUM => {
            let type_handle = read_type_ref(ctx, reader)?;
            let value = reader.read_i64()?;
            Ok(RuntimeValue::Enum { type_handle, value })
        }
        other => match ObjectOperation::from_byte(other)? {
            ObjectOperation::Null => Ok(RuntimeValue::Null),
            ObjectOperation::Memo => {
                let id = reader.read_varint15()? as u32;
                ctx.memo.get(id)
            }
            ObjectOperation::Object => {
                let kind = ReferenceKind::from_byte(reader.read_u8()?)?;
                decode_reference_body(ctx, reader, kind)
            }
        },
    }
}

fn decode_reference_body(
    ctx: &mut DecodeContext,
    reader: &mut ByteReader,
    kind: ReferenceKind,
) -> Result<RuntimeValue, Error> {
    match kind {
        ReferenceKind::String => {
            let value = RuntimeValue::String(Rc::from(reader.read_string()?.as_str()));
            ctx.memo.publish(value.clone());
            Ok(value)
        }
        ReferenceKind::RefTuple => {
            let placeholder = Rc::new(RefCell::new(Vec::new()));
            let handle = RuntimeValue::RefTuple(placeholder.clone());
            ctx.memo.publish(handle.clone());
            let arity = reader.read_varint7()? as usize;
            let mut elements = Vec::with_capacity(arity);
            for _ in 0..arity {
                elements.push(decode_dynamic(ctx, reader)?);
            }
            *placeholder.borrow_mut() = elements;
            Ok(handle)
        }
        ReferenceKind::Array => {
            let element_type = read_type_ref(ctx, reader)?;
            let shape = array::read_shape(reader)?;
            let fast_path = array::fast_path_width(ctx.host, element_type);
            let element_info = ctx.type_info_get_or_derive(element_type);
            let placeholder = Rc::new(RefCell::new(ArrayData {
                element_type,
                shape: shape.clone(),
                elements: Vec::new(),
            }));
            let handle = RuntimeValue::Array(placeholder.clone());
            ctx.memo.publish(handle.clone());
            let elements = array::read_elements(reader, &shape, fast_path, |r| {
                decode_inline_or_envelope(ctx, r, &element_info)
            })?;
            placeholder.borrow_mut().elements = elements;
            Ok(handle)
        }
        ReferenceKind::Object => {
            let type_handle = read_type_ref(ctx, reader)?;
            let info = ctx.type_info_get_or_derive(type_handle);
            info.check_usable()?;
            let placeholder = Rc::new(RefCell::new(ObjectData {
                type_handle,
                fields: Vec::new(),
            }));
            let handle = RuntimeValue::Object(placeholder.clone());
            let memo_id = ctx.memo.publish(handle.clone());
            let reduced_flag = reader.read_u8()?;
            if reduced_flag == 1 {
                let reduced = reducer::read_reduced_form(
                    reader,
                    |r| Ok(MethodHandle(r.read_u64()?)),
                    |r| decode_dynamic(ctx, r),
                )?;
                let reconstructed = ctx.host.construct_from_reducer(&reduced)?;
                if reconstructed.is_null() {
                    return Err(Error::ReducerReturnedNull {
                        type_name: ctx.host.type_display_name(type_handle),
                    });
                }
                // The placeholder published above stood in for this object so
                // any argument that referenced it back (a self-referential
                // reducer constructor) would resolve; now that the real value
                // exists, later back-references in the stream must resolve to
                // it instead of the empty placeholder.
                ctx.memo.replace(memo_id, reconstructed.clone());
                return Ok(reconstructed);
            }
            let fields: Vec<_> = info.serialized_fields.clone();
            let mut values = Vec::with_capacity(fields.len());
            for (field_info, _) in &fields {
                values.push(decode_inline_or_envelope(ctx, reader, field_info)?);
            }
            placeholder.borrow_mut().fields = values;
            Ok(handle)
        }
        ReferenceKind::Delegate => {
            let type_handle = read_type_ref(ctx, reader)?;
            let placeholder = Rc::new(RefCell::new(DelegateData {
                type_handle,
                invocations: Vec::new(),
            }));
            let handle = RuntimeValue::Delegate(placeholder.clone());
            ctx.memo.publish(handle.clone());
            let invocations = delegatev::read_invocation_list(
                reader,
                |r| decode_dynamic(ctx, r),
                |r| Ok(MethodHandle(r.read_u64()?)),
            )?;
            placeholder.borrow_mut().invocations = invocations;
            Ok(handle)
        }
    }
}
