//! Decode-side driver (spec §2, §6.1): validates the stream header, decodes
//! the top-level value — which may itself defer type-construction work onto
//! the staged scheduler when it runs into an embedded `TypeOperation::Def`
//! (spec §4.9) — then drains that scheduler before handing the value back.

use crate::config::EngineOptions;
use crate::error::Error;
use crate::model::RuntimeValue;
use crate::pickler::MAGIC;
use crate::reflect::ReflectionFacade;
use crate::value::{self, DecodeContext};
use crate::varint::ByteReader;

pub struct Unpickler<'h> {
    host: &'h mut dyn ReflectionFacade,
    options: EngineOptions,
}

impl<'h> Unpickler<'h> {
    #[must_use]
    pub fn new(host: &'h mut dyn ReflectionFacade, options: EngineOptions) -> Self {
        Self { host, options }
    }

    pub fn unpickle(&mut self, bytes: &[u8]) -> Result<RuntimeValue, Error> {
        let mut reader = ByteReader::new(bytes);
        read_header(&mut reader, self.options.version.major)?;
        let object_type = self.host.object_type_handle();
        let mut ctx = DecodeContext::new(self.host, self.options.allow_dynamic_definitions);
        let value = value::decode_value(&mut ctx, &mut reader, object_type)?;
        ctx.scheduler.run(&mut *ctx.host)?;
        Ok(value)
    }
}

fn read_header(reader: &mut ByteReader, expected_major: u32) -> Result<(), Error> {
    let magic = reader.read_u32()?;
    if magic != MAGIC {
        return Err(Error::InvalidData(format!(
            "bad stream magic {magic:#010x}, expected {MAGIC:#010x}"
        )));
    }
    let major = reader.read_varint7()?;
    if major != expected_major {
        return Err(Error::InvalidData(format!(
            "stream major version {major} does not match supported version {expected_major}"
        )));
    }
    let _minor = reader.read_varint7()?;
    let _runtime_major = reader.read_varint7()?;
    let _runtime_minor = reader.read_varint7()?;
    Ok(())
}
