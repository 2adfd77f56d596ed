//! Delegate encoding (spec §4.8): a single-cast delegate is one
//! `(target, method)` pair; a multicast delegate is a memoized list of them,
//! invoked in list order.
//!
//! Grounded on `llvm-bitcode::Record::array()`: a length-prefixed
//! homogeneous run, reused here for the invocation list instead of raw
//! bytes.

use crate::error::Error;
use crate::model::{DelegateData, RuntimeValue};
use crate::reflect::MethodHandle;
use crate::varint::{ByteReader, ByteWriter};

pub fn write_invocation_list(
    writer: &mut ByteWriter,
    data: &DelegateData,
    mut encode_target: impl FnMut(&mut ByteWriter, &RuntimeValue) -> Result<(), Error>,
    mut encode_method: impl FnMut(&mut ByteWriter, MethodHandle) -> Result<(), Error>,
) -> Result<(), Error> {
    writer.write_varint7(data.invocations.len() as u32);
    for (target, method) in &data.invocations {
        encode_target(writer, target)?;
        encode_method(writer, *method)?;
    }
    Ok(())
}

pub fn read_invocation_list(
    reader: &mut ByteReader,
    mut decode_target: impl FnMut(&mut ByteReader) -> Result<RuntimeValue, Error>,
    mut decode_method: impl FnMut(&mut ByteReader) -> Result<MethodHandle, Error>,
) -> Result<Vec<(RuntimeValue, MethodHandle)>, Error> {
    let count = reader.read_varint7()? as usize;
    if count == 0 {
        return Err(Error::InvalidData(
            "a delegate must have at least one invocation".into(),
        ));
    }
    (0..count)
        .map(|_| Ok((decode_target(reader)?, decode_method(reader)?)))
        .collect()
}
