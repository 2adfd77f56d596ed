//! Method/property signatures as a flat, recursive element tree (spec §3
//! `Signature`, `SignatureElement`).
//!
//! Grounded on `llvm-bitcode::bitstream::Operand`: a small recursive enum
//! describing the *shape* of something (an abbreviation operand encoding)
//! without being the encoding itself. `SignatureElement` plays the same
//! role for method/property shapes.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::dispatch::PickledType;
use crate::error::Error;
use crate::reflect::TypeHandle;
use crate::varint::{ByteReader, ByteWriter};

/// How arguments are passed to a method (spec §3): almost always `Default`;
/// `VarArg` and `Generic` change how the receiver must match a signature
/// during negotiation rather than how any individual element is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CallingConvention {
    Default = 0,
    VarArg = 1,
    Generic = 2,
}

/// One element of a flattened signature tree (spec §3): either a concrete
/// type reference or one of the two generic-variable placeholders.
#[derive(Debug, Clone, PartialEq)]
pub enum SignatureElement {
    Type(TypeHandle),
    TVar(u32),
    MVar(u32),
    Generic {
        definition: TypeHandle,
        arguments: Vec<SignatureElement>,
    },
    Array {
        element: Box<SignatureElement>,
        rank: u32,
    },
    ByRef(Box<SignatureElement>),
    Pointer(Box<SignatureElement>),
}

impl SignatureElement {
    #[must_use]
    pub fn resolve(&self, ctx: &crate::generics::GenericContext) -> Result<PickledType, crate::error::Error> {
        Ok(match self {
            Self::Type(handle) => PickledType::Ref(*handle),
            Self::TVar(index) => ctx.resolve_type_var(*index)?,
            Self::MVar(index) => ctx.resolve_method_var(*index)?,
            Self::Generic {
                definition,
                arguments,
            } => PickledType::Constructed {
                definition: *definition,
                arguments: arguments
                    .iter()
                    .map(|a| a.resolve(ctx))
                    .collect::<Result<Vec<_>, _>>()?,
            },
            Self::Array { element, rank } => PickledType::ArrayOf {
                element: Box::new(element.resolve(ctx)?),
                rank: *rank,
            },
            Self::ByRef(inner) => PickledType::ByRef(Box::new(inner.resolve(ctx)?)),
            Self::Pointer(inner) => PickledType::Pointer(Box::new(inner.resolve(ctx)?)),
        })
    }
}

/// Where a parameter lives: by value, `ref`/`out`, generic variable, etc.
/// Kept separate from [`SignatureElement`] because location is a
/// calling-convention fact, not a type-shape fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    ByValue,
    ByRef,
    Out,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub element: SignatureElement,
    pub location: Location,
    /// ECMA-335 `modreq`/`modopt` custom modifiers, in the order they must
    /// be applied; almost always empty outside of interop scenarios.
    pub required_modifiers: Vec<TypeHandle>,
    pub optional_modifiers: Vec<TypeHandle>,
}

impl Parameter {
    #[must_use]
    pub fn by_value(element: SignatureElement) -> Self {
        Self {
            element,
            location: Location::ByValue,
            required_modifiers: Vec::new(),
            optional_modifiers: Vec::new(),
        }
    }
}

/// A method/property/constructor signature (spec §3): a flat list so
/// reconciliation can walk sender and local signatures element-by-element.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    /// The method/property name the signature was negotiated against;
    /// `None` for anonymous/synthetic signatures (e.g. a delegate's
    /// `Invoke` shape built for reconciliation rather than lookup).
    pub name: Option<String>,
    pub calling_convention: CallingConvention,
    pub return_type: Option<SignatureElement>,
    pub parameters: Vec<Parameter>,
    pub generic_parameter_count: u32,
}

impl Signature {
    #[must_use]
    pub fn property(element: SignatureElement) -> Self {
        Self {
            name: None,
            calling_convention: CallingConvention::Default,
            return_type: Some(element),
            parameters: Vec::new(),
            generic_parameter_count: 0,
        }
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.parameters.len()
    }
}

fn write_signature_element(writer: &mut ByteWriter, element: &SignatureElement) {
    match element {
        SignatureElement::Type(handle) => {
            writer.write_u8(0);
            writer.write_u64(handle.id());
        }
        SignatureElement::TVar(index) => {
            writer.write_u8(1);
            writer.write_varint7(*index);
        }
        SignatureElement::MVar(index) => {
            writer.write_u8(2);
            writer.write_varint7(*index);
        }
        SignatureElement::Generic { definition, arguments } => {
            writer.write_u8(3);
            writer.write_u64(definition.id());
            writer.write_varint7(arguments.len() as u32);
            for argument in arguments {
                write_signature_element(writer, argument);
            }
        }
        SignatureElement::Array { element, rank } => {
            writer.write_u8(4);
            writer.write_varint7(*rank);
            write_signature_element(writer, element);
        }
        SignatureElement::ByRef(inner) => {
            writer.write_u8(5);
            write_signature_element(writer, inner);
        }
        SignatureElement::Pointer(inner) => {
            writer.write_u8(6);
            write_signature_element(writer, inner);
        }
    }
}

fn read_signature_element(reader: &mut ByteReader) -> Result<SignatureElement, Error> {
    Ok(match reader.read_u8()? {
        0 => SignatureElement::Type(TypeHandle(reader.read_u64()?)),
        1 => SignatureElement::TVar(reader.read_varint7()?),
        2 => SignatureElement::MVar(reader.read_varint7()?),
        3 => {
            let definition = TypeHandle(reader.read_u64()?);
            let count = reader.read_varint7()? as usize;
            let mut arguments = Vec::with_capacity(count);
            for _ in 0..count {
                arguments.push(read_signature_element(reader)?);
            }
            SignatureElement::Generic { definition, arguments }
        }
        4 => {
            let rank = reader.read_varint7()?;
            let element = Box::new(read_signature_element(reader)?);
            SignatureElement::Array { element, rank }
        }
        5 => SignatureElement::ByRef(Box::new(read_signature_element(reader)?)),
        6 => SignatureElement::Pointer(Box::new(read_signature_element(reader)?)),
        other => {
            return Err(Error::UnknownOperation {
                what: "signature-element",
                byte: other,
            })
        }
    })
}

fn write_location(writer: &mut ByteWriter, location: Location) {
    writer.write_u8(location as u8);
}

fn read_location(reader: &mut ByteReader) -> Result<Location, Error> {
    match reader.read_u8()? {
        0 => Ok(Location::ByValue),
        1 => Ok(Location::ByRef),
        2 => Ok(Location::Out),
        other => Err(Error::UnknownOperation {
            what: "parameter-location",
            byte: other,
        }),
    }
}

fn write_modifiers(writer: &mut ByteWriter, modifiers: &[TypeHandle]) {
    writer.write_varint7(modifiers.len() as u32);
    for modifier in modifiers {
        writer.write_u64(modifier.id());
    }
}

fn read_modifiers(reader: &mut ByteReader) -> Result<Vec<TypeHandle>, Error> {
    let count = reader.read_varint7()? as usize;
    let mut modifiers = Vec::with_capacity(count);
    for _ in 0..count {
        modifiers.push(TypeHandle(reader.read_u64()?));
    }
    Ok(modifiers)
}

/// Writes a whole signature (spec §3): name, calling convention, optional
/// return element, then each parameter with its location and modifiers.
pub fn write_signature(writer: &mut ByteWriter, signature: &Signature) {
    writer.write_nullable_string(signature.name.as_deref());
    writer.write_u8(signature.calling_convention.into());
    match &signature.return_type {
        Some(element) => {
            writer.write_bool(true);
            write_signature_element(writer, element);
        }
        None => writer.write_bool(false),
    }
    writer.write_varint7(signature.generic_parameter_count);
    writer.write_varint7(signature.parameters.len() as u32);
    for parameter in &signature.parameters {
        write_signature_element(writer, &parameter.element);
        write_location(writer, parameter.location);
        write_modifiers(writer, &parameter.required_modifiers);
        write_modifiers(writer, &parameter.optional_modifiers);
    }
}

/// Mirrors [`write_signature`].
pub fn read_signature(reader: &mut ByteReader) -> Result<Signature, Error> {
    let name = reader.read_nullable_string()?;
    let convention_byte = reader.read_u8()?;
    let calling_convention = CallingConvention::try_from(convention_byte).map_err(|_| Error::UnknownOperation {
        what: "calling-convention",
        byte: convention_byte,
    })?;
    let return_type = if reader.read_bool()? {
        Some(read_signature_element(reader)?)
    } else {
        None
    };
    let generic_parameter_count = reader.read_varint7()?;
    let parameter_count = reader.read_varint7()? as usize;
    let mut parameters = Vec::with_capacity(parameter_count);
    for _ in 0..parameter_count {
        let element = read_signature_element(reader)?;
        let location = read_location(reader)?;
        let required_modifiers = read_modifiers(reader)?;
        let optional_modifiers = read_modifiers(reader)?;
        parameters.push(Parameter {
            element,
            location,
            required_modifiers,
            optional_modifiers,
        });
    }
    Ok(Signature {
        name,
        calling_convention,
        return_type,
        parameters,
        generic_parameter_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_tvar_against_context() {
        let ctx = crate::generics::GenericContext::with_type_params(vec![PickledType::Ref(
            TypeHandle(7),
        )]);
        let element = SignatureElement::TVar(0);
        assert_eq!(element.resolve(&ctx).unwrap(), PickledType::Ref(TypeHandle(7)));
    }

    #[test]
    fn signature_roundtrips_through_wire_format() {
        let signature = Signature {
            name: Some("Add".into()),
            calling_convention: CallingConvention::Generic,
            return_type: Some(SignatureElement::Type(TypeHandle(1))),
            parameters: vec![
                Parameter::by_value(SignatureElement::TVar(0)),
                Parameter {
                    element: SignatureElement::ByRef(Box::new(SignatureElement::Type(TypeHandle(2)))),
                    location: Location::ByRef,
                    required_modifiers: vec![TypeHandle(9)],
                    optional_modifiers: Vec::new(),
                },
            ],
            generic_parameter_count: 1,
        };
        let mut writer = crate::varint::ByteWriter::new();
        write_signature(&mut writer, &signature);
        let mut reader = crate::varint::ByteReader::new(writer.as_bytes());
        assert_eq!(read_signature(&mut reader).unwrap(), signature);
    }

    #[test]
    fn array_of_mvar_resolves_recursively() {
        let ctx = crate::generics::GenericContext::new().enter_method(vec![PickledType::Ref(
            TypeHandle(3),
        )]);
        let element = SignatureElement::Array {
            element: Box::new(SignatureElement::MVar(0)),
            rank: 1,
        };
        let resolved = element.resolve(&ctx).unwrap();
        assert!(matches!(resolved, PickledType::ArrayOf { rank: 1, .. }));
    }
}
