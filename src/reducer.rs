//! Reducer-based construction (spec §4.7): some types opt out of
//! field-by-field serialization in favor of handing the pickler a
//! `(constructor, args)` pair that reconstructs an equivalent instance.
//!
//! Grounded on `llvm-bitcode::Record::blob()`'s "take the payload once, as
//! a unit" shape: a reduced object's argument list is written and read as
//! one unit produced by the façade, not walked field-by-field by core.

use crate::error::Error;
use crate::model::RuntimeValue;
use crate::reflect::{ReducedForm, ReflectionFacade, TypeHandle};
use crate::varint::{ByteReader, ByteWriter};

/// Encode-side: ask the façade whether `value` prefers reducer construction;
/// if so, write its constructor reference and argument list.
///
/// Takes `host` by itself (not bundled with the closures) precisely so
/// callers whose `encode_value` closure needs to re-borrow the same host
/// mutably through other state can resolve `reduce_for_encode` first and
/// call [`write_reduced_form`] afterward instead, once that borrow is gone.
pub fn try_write_reduced(
    writer: &mut ByteWriter,
    host: &dyn ReflectionFacade,
    ty: TypeHandle,
    value: &RuntimeValue,
    encode_method: impl FnMut(&mut ByteWriter, crate::reflect::MethodHandle) -> Result<(), Error>,
    encode_value: impl FnMut(&mut ByteWriter, &RuntimeValue) -> Result<(), Error>,
) -> Result<bool, Error> {
    let Some(reduced) = host.reduce_for_encode(ty, value) else {
        return Ok(false);
    };
    log::trace!("reducer dispatch: constructor {} with {} args", reduced.constructor.id(), reduced.args.len());
    write_reduced_form(writer, &reduced, encode_method, encode_value)?;
    Ok(true)
}

/// Writes an already-resolved reduced form: constructor reference, the
/// target object (or null for plain construction), then the argument list.
pub fn write_reduced_form(
    writer: &mut ByteWriter,
    reduced: &crate::reflect::ReducedForm,
    mut encode_method: impl FnMut(&mut ByteWriter, crate::reflect::MethodHandle) -> Result<(), Error>,
    mut encode_value: impl FnMut(&mut ByteWriter, &RuntimeValue) -> Result<(), Error>,
) -> Result<(), Error> {
    encode_method(writer, reduced.constructor)?;
    match &reduced.target {
        Some(target) => {
            writer.write_bool(true);
            encode_value(writer, target)?;
        }
        None => writer.write_bool(false),
    }
    writer.write_varint7(reduced.args.len() as u32);
    for arg in &reduced.args {
        encode_value(writer, arg)?;
    }
    Ok(())
}

/// Reads an already-framed reduced form without touching the host, so
/// callers whose `decode_value` closure needs the host mutably (to keep
/// decoding through the same context) can call
/// [`ReflectionFacade::construct_from_reducer`] themselves afterward.
pub fn read_reduced_form(
    reader: &mut ByteReader,
    mut decode_method: impl FnMut(&mut ByteReader) -> Result<crate::reflect::MethodHandle, Error>,
    mut decode_value: impl FnMut(&mut ByteReader) -> Result<RuntimeValue, Error>,
) -> Result<ReducedForm, Error> {
    let constructor = decode_method(reader)?;
    let target = if reader.read_bool()? {
        Some(decode_value(reader)?)
    } else {
        None
    };
    let count = reader.read_varint7()? as usize;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(decode_value(reader)?);
    }
    Ok(ReducedForm { constructor, target, args })
}

pub fn read_reduced(
    reader: &mut ByteReader,
    host: &mut dyn ReflectionFacade,
    decode_method: impl FnMut(&mut ByteReader) -> Result<crate::reflect::MethodHandle, Error>,
    decode_value: impl FnMut(&mut ByteReader) -> Result<RuntimeValue, Error>,
) -> Result<RuntimeValue, Error> {
    let reduced = read_reduced_form(reader, decode_method, decode_value)?;
    host.construct_from_reducer(&reduced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::{
        AssemblyFilter, AssemblyHandle, CustomAttribute, FieldAttributes, FieldHandle,
        HostTypeDescriptor, MemberDef, MemberKey, MethodAttributes, MethodHandle, ModuleHandle,
        PropertyHandle, TypeAttributes, TypeDefKind, EventHandle,
    };
    use crate::signature::Signature;
    use crate::typeinfo::TypeMode;

    struct StubHost;

    impl ReflectionFacade for StubHost {
        fn resolve_assembly_by_name(&mut self, _: &str) -> Result<AssemblyHandle, Error> {
            unimplemented!()
        }
        fn current_loaded_assemblies(&self) -> Vec<AssemblyHandle> {
            Vec::new()
        }
        fn assembly_display_name(&self, _: AssemblyHandle) -> String {
            String::new()
        }
        fn is_mscorlib(&self, _: AssemblyHandle) -> bool {
            false
        }
        fn define_dynamic_assembly(&mut self, _: &str, _: bool) -> Result<AssemblyHandle, Error> {
            unimplemented!()
        }
        fn define_dynamic_module(&mut self, _: AssemblyHandle, _: &str) -> Result<ModuleHandle, Error> {
            unimplemented!()
        }
        fn define_type(
            &mut self,
            _: ModuleHandle,
            _: &str,
            _: TypeDefKind,
            _: TypeAttributes,
        ) -> Result<TypeHandle, Error> {
            unimplemented!()
        }
        fn define_nested_type(
            &mut self,
            _: TypeHandle,
            _: &str,
            _: TypeDefKind,
            _: TypeAttributes,
        ) -> Result<TypeHandle, Error> {
            unimplemented!()
        }
        fn define_field(
            &mut self,
            _: TypeHandle,
            _: &str,
            _: TypeHandle,
            _: FieldAttributes,
        ) -> Result<FieldHandle, Error> {
            unimplemented!()
        }
        fn define_method(
            &mut self,
            _: TypeHandle,
            _: &str,
            _: &Signature,
            _: MethodAttributes,
        ) -> Result<MethodHandle, Error> {
            unimplemented!()
        }
        fn define_constructor(&mut self, _: TypeHandle, _: &Signature) -> Result<MethodHandle, Error> {
            unimplemented!()
        }
        fn define_property(&mut self, _: TypeHandle, _: &str, _: &Signature) -> Result<PropertyHandle, Error> {
            unimplemented!()
        }
        fn define_event(&mut self, _: TypeHandle, _: &str, _: TypeHandle) -> Result<EventHandle, Error> {
            unimplemented!()
        }
        fn define_generic_parameters(&mut self, _: TypeHandle, _: &[String]) -> Result<(), Error> {
            unimplemented!()
        }
        fn set_parent(&mut self, _: TypeHandle, _: TypeHandle) -> Result<(), Error> {
            unimplemented!()
        }
        fn add_interface(&mut self, _: TypeHandle, _: TypeHandle) -> Result<(), Error> {
            unimplemented!()
        }
        fn define_method_override(&mut self, _: TypeHandle, _: MethodHandle, _: MethodHandle) -> Result<(), Error> {
            unimplemented!()
        }
        fn create_type(&mut self, _: TypeHandle) -> Result<(), Error> {
            unimplemented!()
        }
        fn apply_custom_attribute(&mut self, _: TypeHandle, _: &CustomAttribute) -> Result<(), Error> {
            unimplemented!()
        }
        fn get_field_by_name(&self, _: TypeHandle, _: &str) -> Option<FieldHandle> {
            None
        }
        fn get_method_by_signature(&self, _: TypeHandle, _: &Signature) -> Option<MethodHandle> {
            None
        }
        fn get_property_by_signature(&self, _: TypeHandle, _: &Signature) -> Option<PropertyHandle> {
            None
        }
        fn get_event_by_name(&self, _: TypeHandle, _: &str) -> Option<EventHandle> {
            None
        }
        fn get_constructor_by_signature(&self, _: TypeHandle, _: &Signature) -> Option<MethodHandle> {
            None
        }
        fn describe_type(&self, _: TypeHandle) -> HostTypeDescriptor {
            HostTypeDescriptor {
                is_value_type: false,
                is_sealed: true,
                is_abstract: false,
                has_element_type: false,
                mode: TypeMode::Reduced,
                fields: Vec::new(),
                element: None,
                tuple_arguments: Vec::new(),
                enum_underlying_code: None,
            }
        }
        fn is_builtin(&self, _: TypeHandle) -> bool {
            false
        }
        fn type_display_name(&self, _: TypeHandle) -> String {
            "Stub".into()
        }
        fn object_type_handle(&self) -> TypeHandle {
            unimplemented!()
        }
        fn assembly_filter(&self, _: AssemblyHandle) -> AssemblyFilter {
            AssemblyFilter::ByReference
        }
        fn reduce_for_encode(&self, _: TypeHandle, _: &RuntimeValue) -> Option<ReducedForm> {
            Some(ReducedForm {
                constructor: MethodHandle(42),
                target: None,
                args: vec![RuntimeValue::I32(7)],
            })
        }
        fn construct_from_reducer(&mut self, reduced: &ReducedForm) -> Result<RuntimeValue, Error> {
            assert_eq!(reduced.constructor, MethodHandle(42));
            Ok(RuntimeValue::I32(7))
        }
    }

    #[test]
    fn reduced_form_roundtrips() {
        let host = StubHost;
        let mut writer = ByteWriter::new();
        let wrote = try_write_reduced(
            &mut writer,
            &host,
            TypeHandle(1),
            &RuntimeValue::Null,
            |w, m| {
                w.write_u64(m.id());
                Ok(())
            },
            |w, v| {
                match v {
                    RuntimeValue::I32(n) => w.write_i32(*n),
                    _ => unreachable!(),
                }
                Ok(())
            },
        )
        .unwrap();
        assert!(wrote);

        let mut host = host;
        let mut reader = ByteReader::new(writer.as_bytes());
        let value = read_reduced(
            &mut reader,
            &mut host,
            |r| Ok(MethodHandle(r.read_u64()?)),
            |r| Ok(RuntimeValue::I32(r.read_i32()?)),
        )
        .unwrap();
        assert!(matches!(value, RuntimeValue::I32(7)));
    }
}
