//! Tuple encoding (spec §4.5): value tuples serialize inline; reference
//! tuples participate in memoization like any other reference type.
//!
//! Grounded on `llvm-bitcode::Record::blob()`: a payload whose shape (how
//! many sub-values, in what order) is already known from context, so the
//! reader just pulls exactly that many values off in sequence rather than
//! re-deriving a length.

use crate::error::Error;
use crate::model::RuntimeValue;
use crate::varint::{ByteReader, ByteWriter};

/// Writes a value tuple's arguments in order; the tuple's own identity is
/// never memoized since value tuples have none (spec §4.2, §4.5).
pub fn write_value_tuple(
    writer: &mut ByteWriter,
    elements: &[RuntimeValue],
    mut encode_value: impl FnMut(&mut ByteWriter, &RuntimeValue) -> Result<(), Error>,
) -> Result<(), Error> {
    for element in elements {
        encode_value(writer, element)?;
    }
    Ok(())
}

pub fn read_value_tuple(
    reader: &mut ByteReader,
    arity: usize,
    mut decode_value: impl FnMut(&mut ByteReader) -> Result<RuntimeValue, Error>,
) -> Result<Vec<RuntimeValue>, Error> {
    (0..arity).map(|_| decode_value(reader)).collect()
}
