//! Array encoding (spec §4.6): vectors and multi-dimensional arrays, with a
//! fast path that writes fixed-width primitive elements as a raw byte run
//! instead of one value-codec call per element.
//!
//! Grounded on `llvm-bitcode::Record::array()`/`Record::string()`: those
//! read a length-prefixed run of same-width elements directly into a `Vec`
//! rather than decoding element-by-element through the general value path,
//! which is exactly the shape of the builtin-primitive fast path here.

use crate::error::Error;
use crate::model::{ArrayData, ArrayShape, Dimension, RuntimeValue};
use crate::reflect::TypeHandle;
use crate::varint::{ByteReader, ByteWriter};
use crate::wellknown::WellKnownType;

/// Whether `element_type` is one of the fixed-width builtins eligible for
/// the raw-byte-run fast path (spec §4.6). Callers resolve this once,
/// up front, and thread the result through so the hot per-element loop
/// never needs to borrow the host again.
#[must_use]
pub fn fast_path_width(host: &dyn crate::reflect::ReflectionFacade, element_type: TypeHandle) -> Option<(WellKnownType, usize)> {
    if !host.is_builtin(element_type) {
        return None;
    }
    // The façade is responsible for telling core builtin-ness; mapping that
    // back onto a concrete `WellKnownType` ordinal is also the façade's job
    // via `describe_type().enum_underlying_code`, reused here as a builtin
    // tag channel. A façade that can't supply one simply forfeits the fast
    // path — still correct, just slower.
    let descriptor = host.describe_type(element_type);
    let code = descriptor.enum_underlying_code?;
    let kind = WellKnownType::try_from(code).ok()?;
    let width = kind.fixed_width()?;
    Some((kind, width))
}

pub fn write_shape(writer: &mut ByteWriter, shape: &ArrayShape) {
    match shape {
        ArrayShape::Vector => {
            writer.write_u8(0);
        }
        ArrayShape::MultiDim(dims) => {
            writer.write_u8(1);
            writer.write_varint7(dims.len() as u32);
            for dim in dims {
                writer.write_varint7(dim.length);
                writer.write_varint7_signed(dim.lower_bound);
            }
        }
    }
}

pub fn read_shape(reader: &mut ByteReader) -> Result<ArrayShape, Error> {
    match reader.read_u8()? {
        0 => Ok(ArrayShape::Vector),
        1 => {
            let rank = reader.read_varint7()? as usize;
            let mut dims = Vec::with_capacity(rank);
            for _ in 0..rank {
                let length = reader.read_varint7()?;
                let lower_bound = reader.read_varint7_signed()?;
                dims.push(Dimension { length, lower_bound });
            }
            Ok(ArrayShape::MultiDim(dims))
        }
        other => Err(Error::UnknownOperation {
            what: "array-shape",
            byte: other,
        }),
    }
}

fn shape_len(shape: &ArrayShape) -> usize {
    match shape {
        ArrayShape::Vector => 0, // caller supplies the actual element count separately
        ArrayShape::MultiDim(dims) => dims.iter().map(|d| d.length as usize).product(),
    }
}

/// Encodes array contents, using the raw fast path when every element is a
/// fixed-width primitive and takes up no memo slot of its own.
pub fn write_elements(
    writer: &mut ByteWriter,
    fast_path: Option<(WellKnownType, usize)>,
    data: &ArrayData,
    mut encode_value: impl FnMut(&mut ByteWriter, &RuntimeValue) -> Result<(), Error>,
) -> Result<(), Error> {
    if let Some((_, width)) = fast_path {
        writer.write_u8(1);
        writer.write_varint7(data.elements.len() as u32);
        for element in &data.elements {
            write_fixed_width_primitive(writer, element, width)?;
        }
        return Ok(());
    }
    writer.write_u8(0);
    writer.write_varint7(data.elements.len() as u32);
    for element in &data.elements {
        encode_value(writer, element)?;
    }
    Ok(())
}

pub fn read_elements(
    reader: &mut ByteReader,
    shape: &ArrayShape,
    fast_path: Option<(WellKnownType, usize)>,
    mut decode_value: impl FnMut(&mut ByteReader) -> Result<RuntimeValue, Error>,
) -> Result<Vec<RuntimeValue>, Error> {
    let is_fast = reader.read_u8()? == 1;
    let count = reader.read_varint7()? as usize;
    if let ArrayShape::MultiDim(_) = shape {
        let expected = shape_len(shape);
        if expected != count {
            return Err(Error::InvalidData(format!(
                "array shape implies {expected} elements but stream declared {count}"
            )));
        }
    }
    if is_fast {
        let (kind, width) = fast_path.ok_or_else(|| {
            Error::InvalidData("stream used the primitive array fast path for a non-primitive element type".into())
        })?;
        (0..count)
            .map(|_| read_fixed_width_primitive(reader, kind, width))
            .collect()
    } else {
        (0..count).map(|_| decode_value(reader)).collect()
    }
}

fn write_fixed_width_primitive(writer: &mut ByteWriter, value: &RuntimeValue, width: usize) -> Result<(), Error> {
    match (value, width) {
        (RuntimeValue::Bool(b), 1) => writer.write_u8(u8::from(*b)),
        (RuntimeValue::I8(v), 1) => writer.write_u8(*v as u8),
        (RuntimeValue::U8(v), 1) => writer.write_u8(*v),
        (RuntimeValue::Char(c), 2) => writer.write_char(*c),
        (RuntimeValue::I16(v), 2) => writer.write_bytes(&v.to_le_bytes()),
        (RuntimeValue::U16(v), 2) => writer.write_bytes(&v.to_le_bytes()),
        (RuntimeValue::I32(v), 4) => writer.write_i32(*v),
        (RuntimeValue::U32(v), 4) => writer.write_u32(*v),
        (RuntimeValue::F32(v), 4) => writer.write_f32(*v),
        (RuntimeValue::I64(v), 8) => writer.write_i64(*v),
        (RuntimeValue::U64(v), 8) => writer.write_u64(*v),
        (RuntimeValue::F64(v), 8) => writer.write_f64(*v),
        (RuntimeValue::Decimal(bytes), 16) => {
            for b in bytes {
                writer.write_u8(*b);
            }
        }
        _ => {
            return Err(Error::TypeMismatch(format!(
                "value {value:?} does not match declared fast-path width {width}"
            )))
        }
    }
    Ok(())
}

fn read_fixed_width_primitive(reader: &mut ByteReader, kind: WellKnownType, width: usize) -> Result<RuntimeValue, Error> {
    Ok(match (kind, width) {
        (WellKnownType::Boolean, 1) => RuntimeValue::Bool(reader.read_bool()?),
        (WellKnownType::SByte, 1) => RuntimeValue::I8(reader.read_u8()? as i8),
        (WellKnownType::Byte, 1) => RuntimeValue::U8(reader.read_u8()?),
        (WellKnownType::Char, 2) => RuntimeValue::Char(reader.read_char()?),
        (WellKnownType::Int16, 2) => RuntimeValue::I16(i16::from_le_bytes(reader.read_array::<2>()?)),
        (WellKnownType::UInt16, 2) => RuntimeValue::U16(u16::from_le_bytes(reader.read_array::<2>()?)),
        (WellKnownType::Int32, 4) => RuntimeValue::I32(reader.read_i32()?),
        (WellKnownType::UInt32, 4) => RuntimeValue::U32(reader.read_u32()?),
        (WellKnownType::Single, 4) => RuntimeValue::F32(reader.read_f32()?),
        (WellKnownType::Int64, 8) => RuntimeValue::I64(reader.read_i64()?),
        (WellKnownType::UInt64, 8) => RuntimeValue::U64(reader.read_u64()?),
        (WellKnownType::Double, 8) => RuntimeValue::F64(reader.read_f64()?),
        (WellKnownType::Decimal, 16) => RuntimeValue::Decimal(reader.read_decimal()?),
        (other, width) => {
            return Err(Error::InvalidData(format!(
                "unsupported fast-path element kind {other:?} at width {width}"
            )))
        }
    })
}
