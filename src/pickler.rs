//! Encode-side driver (spec §2, §6.1): writes the stream header, then the
//! top-level value against the static type `object`.

use crate::config::EngineOptions;
use crate::error::Error;
use crate::model::RuntimeValue;
use crate::reflect::ReflectionFacade;
use crate::value::{self, EncodeContext};
use crate::varint::ByteWriter;

/// Little-endian `"PKLA"`.
pub const MAGIC: u32 = 0x414c_4b50;

pub struct Pickler<'h> {
    host: &'h mut dyn ReflectionFacade,
    options: EngineOptions,
}

impl<'h> Pickler<'h> {
    #[must_use]
    pub fn new(host: &'h mut dyn ReflectionFacade, options: EngineOptions) -> Self {
        Self { host, options }
    }

    /// Writes the full stream: header, then `value` encoded against the
    /// host's `object` type.
    pub fn pickle(&mut self, value: &RuntimeValue) -> Result<Vec<u8>, Error> {
        let mut writer = ByteWriter::new();
        write_header(&mut writer, &self.options);
        let object_type = self.host.object_type_handle();
        let mut ctx = EncodeContext::new(self.host);
        value::encode_value(&mut ctx, &mut writer, object_type, value)?;
        Ok(writer.into_bytes())
    }
}

fn write_header(writer: &mut ByteWriter, options: &EngineOptions) {
    writer.write_u32(MAGIC);
    writer.write_varint7(options.version.major);
    writer.write_varint7(options.version.minor);
    writer.write_varint7(options.version.runtime_major);
    writer.write_varint7(options.version.runtime_minor);
}
