//! Method body encoding (spec §4.11): a flat instruction list plus the
//! operand tables (locals, exception regions) a CLI-style method body needs.
//!
//! Grounded on `llvm-bitcode`'s `RecordIter`/`Payload` pairing: a record
//! carries a numeric code plus a payload shaped by that code (fixed fields,
//! then an array, or a char6/blob tail). `Instruction` reuses the same
//! "opcode selects which operand variant follows" shape for IL opcodes
//! instead of bitcode function-block codes.

use crate::dispatch::PickledType;
use crate::error::Error;
use crate::reflect::{FieldHandle, MethodHandle};
use crate::signature::Signature;
use crate::varint::{ByteReader, ByteWriter};

/// One IL-like operand, closed over everything a pickled method body can
/// reference (spec §4.11: locals, fields, other methods, inline constants,
/// and branch targets are all local to the body being decoded).
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Local(u32),
    Argument(u32),
    Field(FieldHandle),
    Method(MethodHandle),
    Type(PickledType),
    I32(i32),
    I64(i64),
    F64(f64),
    String(String),
    /// Offset into the owning [`MethodBody::instructions`], resolved after
    /// the whole body is read (a forward branch otherwise can't be encoded
    /// as a plain index while the list is still growing).
    BranchTarget(u32),
    Switch(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: u16,
    pub operand: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalVariable {
    pub local_type: PickledType,
    pub pinned: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionRegion {
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
    pub filter: Option<PickledType>,
}

/// A fully self-contained method body (spec §4.11): enough to reconstruct
/// IL for a dynamically defined method without consulting anything outside
/// the pickled stream except handles already resolved elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    pub signature: Signature,
    pub locals: Vec<LocalVariable>,
    pub instructions: Vec<Instruction>,
    pub exception_regions: Vec<ExceptionRegion>,
    pub max_stack: u32,
    pub init_locals: bool,
}

impl MethodBody {
    /// Validates that every [`Operand::BranchTarget`] and switch target
    /// names an actual instruction index (spec §4.11 edge case: a
    /// corrupt/adversarial stream must not be allowed to build a body whose
    /// branches point past the end).
    pub fn validate(&self) -> Result<(), Error> {
        let len = self.instructions.len() as u32;
        for region in &self.exception_regions {
            for offset in [
                region.try_start,
                region.try_end,
                region.handler_start,
                region.handler_end,
            ] {
                if offset > len {
                    return Err(Error::InvalidData(format!(
                        "exception region offset {offset} exceeds body length {len}"
                    )));
                }
            }
        }
        for instruction in &self.instructions {
            match &instruction.operand {
                Operand::BranchTarget(target) if *target > len => {
                    return Err(Error::InvalidData(format!(
                        "branch target {target} exceeds body length {len}"
                    )));
                }
                Operand::Switch(targets) => {
                    if let Some(bad) = targets.iter().find(|t| **t > len) {
                        return Err(Error::InvalidData(format!(
                            "switch target {bad} exceeds body length {len}"
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// What shape of operand follows an opcode (spec §4.5's bullet list,
/// `InlineTok` folded onto whichever of [`Operand::Field`]/[`Operand::Method`]/
/// [`Operand::Type`] the opcode's member actually resolves to — our model
/// already carries the payload kind in the `Operand` variant itself, so the
/// table only needs to say how many/which bytes to read, not re-derive it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperandType {
    None,
    InlineSwitch,
    InlineTok,
    InlineType,
    InlineField,
    InlineMethod,
    InlineString,
    ShortInlineI,
    InlineI,
    InlineI8,
    ShortInlineR,
    InlineR,
    ShortInlineVar,
    InlineVar,
    ShortInlineBrTarget,
    InlineBrTarget,
}

/// A representative slice of the CLI opcode table (spec §4.5): enough real
/// opcodes to exercise every `OperandType`, not the full ECMA-335 list.
/// Two-byte opcodes (the `0xFE` prefix) are folded into one `u16` as
/// `0xFE00 | second_byte`, matching how [`write_instruction`]/
/// [`read_instruction`] split them back apart on the wire.
fn operand_type_for(opcode: u16) -> Result<OperandType, Error> {
    Ok(match opcode {
        0x00 | 0x2a => OperandType::None,              // nop, ret
        0x1f => OperandType::ShortInlineI,              // ldc.i4.s
        0x20 => OperandType::InlineI,                   // ldc.i4
        0x21 => OperandType::InlineI8,                  // ldc.i8
        0x22 => OperandType::ShortInlineR,               // ldc.r4
        0x23 => OperandType::InlineR,                   // ldc.r8
        0x0e | 0x0f | 0x10 | 0x11 | 0x12 => OperandType::ShortInlineVar, // ldarg.s/ldarga.s/starg.s/ldloc.s/stloc.s
        0xfe09 | 0xfe0a | 0xfe0b | 0xfe0c | 0xfe0d => OperandType::InlineVar, // ldarg/ldarga/starg/ldloc/stloc
        0x2b | 0x2c | 0x2d | 0x2e | 0x2f | 0x30 => OperandType::ShortInlineBrTarget, // br.s and friends
        0x38 | 0x39 | 0x3a | 0x3b | 0x3c => OperandType::InlineBrTarget,    // br and friends
        0x45 => OperandType::InlineSwitch,              // switch
        0x28 | 0x6f | 0x73 => OperandType::InlineMethod, // call, callvirt, newobj
        0x7b | 0x7c | 0x7d | 0x7e | 0x80 => OperandType::InlineField, // ld/stfld, ld/stsfld
        0x72 => OperandType::InlineString,              // ldstr
        0x74 | 0x75 | 0x8d | 0x79 => OperandType::InlineType, // castclass, isinst, newarr, box
        0xd0 => OperandType::InlineTok,                 // ldtoken
        other => {
            return Err(Error::UnknownOperation {
                what: "il-opcode",
                byte: (other & 0xff) as u8,
            })
        }
    })
}

/// Whether `opcode` addresses a local variable (`ldloc`/`stloc` family)
/// rather than an incoming argument (`ldarg`/`starg` family) — both share
/// [`OperandType::ShortInlineVar`]/[`OperandType::InlineVar`] on the wire, so
/// [`write_operand`]/[`read_operand`] need the opcode itself to know which
/// [`Operand`] variant applies.
fn is_local_variable_opcode(opcode: u16) -> bool {
    matches!(opcode, 0x11 | 0x12 | 0xfe0c | 0xfe0d)
}

fn write_opcode(writer: &mut ByteWriter, opcode: u16) {
    if opcode <= 0xfd {
        writer.write_u8(opcode as u8);
    } else {
        writer.write_u8(0xfe);
        writer.write_u8((opcode & 0xff) as u8);
    }
}

fn read_opcode(reader: &mut ByteReader) -> Result<Option<u16>, Error> {
    let first = reader.read_u8()?;
    if first == 0xff {
        return Ok(None);
    }
    if first == 0xfe {
        return Ok(Some(0xfe00 | reader.read_u8()? as u16));
    }
    Ok(Some(first as u16))
}

/// Writes `operand`'s payload; `kind` (re-derived from the instruction's own
/// opcode, same as on the read side) picks the width for the immediate
/// forms, since e.g. `ShortInlineI`/`InlineI` both surface as `Operand::I32`
/// but occupy one byte versus four on the wire.
fn write_operand(
    writer: &mut ByteWriter,
    opcode: u16,
    kind: OperandType,
    operand: &Operand,
    encode_field: impl FnOnce(&mut ByteWriter, FieldHandle),
    encode_method: impl FnOnce(&mut ByteWriter, MethodHandle),
) -> Result<(), Error> {
    match (kind, operand) {
        (OperandType::None, Operand::None) => {}
        (OperandType::ShortInlineVar | OperandType::InlineVar, Operand::Local(index))
            if is_local_variable_opcode(opcode) =>
        {
            writer.write_varint7(*index);
        }
        (OperandType::ShortInlineVar | OperandType::InlineVar, Operand::Argument(index))
            if !is_local_variable_opcode(opcode) =>
        {
            writer.write_varint7(*index);
        }
        (OperandType::InlineField, Operand::Field(field)) => encode_field(writer, *field),
        (OperandType::InlineMethod | OperandType::InlineTok, Operand::Method(method)) => encode_method(writer, *method),
        (OperandType::InlineType, Operand::Type(ty)) => crate::dispatch::write_pickled_type(writer, ty),
        (OperandType::ShortInlineI, Operand::I32(v)) => writer.write_u8(*v as i8 as u8),
        (OperandType::InlineI, Operand::I32(v)) => writer.write_i32(*v),
        (OperandType::InlineI8, Operand::I64(v)) => writer.write_i64(*v),
        (OperandType::ShortInlineR, Operand::F64(v)) => writer.write_f32(*v as f32),
        (OperandType::InlineR, Operand::F64(v)) => writer.write_f64(*v),
        (OperandType::InlineString, Operand::String(s)) => writer.write_string(s),
        (OperandType::ShortInlineBrTarget | OperandType::InlineBrTarget, Operand::BranchTarget(target)) => {
            writer.write_varint7(*target);
        }
        (OperandType::InlineSwitch, Operand::Switch(targets)) => {
            writer.write_varint7(targets.len() as u32);
            for target in targets {
                writer.write_varint7(*target);
            }
        }
        (expected, actual) => {
            return Err(Error::TypeMismatch(format!(
                "opcode expects operand shape {expected:?} but instruction carried {actual:?}"
            )))
        }
    }
    Ok(())
}

fn read_operand(
    reader: &mut ByteReader,
    opcode: u16,
    kind: OperandType,
    decode_field: impl FnOnce(&mut ByteReader) -> Result<FieldHandle, Error>,
    decode_method: impl FnOnce(&mut ByteReader) -> Result<MethodHandle, Error>,
) -> Result<Operand, Error> {
    Ok(match kind {
        OperandType::None => Operand::None,
        OperandType::ShortInlineVar | OperandType::InlineVar => {
            let index = reader.read_varint7()?;
            if is_local_variable_opcode(opcode) {
                Operand::Local(index)
            } else {
                Operand::Argument(index)
            }
        }
        OperandType::InlineField => Operand::Field(decode_field(reader)?),
        OperandType::InlineMethod | OperandType::InlineTok => Operand::Method(decode_method(reader)?),
        OperandType::InlineType => Operand::Type(crate::dispatch::read_pickled_type(reader)?),
        OperandType::ShortInlineI => Operand::I32(reader.read_u8()? as i8 as i32),
        OperandType::InlineI => Operand::I32(reader.read_i32()?),
        OperandType::InlineI8 => Operand::I64(reader.read_i64()?),
        OperandType::ShortInlineR => Operand::F64(reader.read_f32()? as f64),
        OperandType::InlineR => Operand::F64(reader.read_f64()?),
        OperandType::InlineString => Operand::String(reader.read_string()?),
        OperandType::ShortInlineBrTarget | OperandType::InlineBrTarget => {
            Operand::BranchTarget(reader.read_varint7()?)
        }
        OperandType::InlineSwitch => {
            let count = reader.read_varint7()? as usize;
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(reader.read_varint7()?);
            }
            Operand::Switch(targets)
        }
    })
}

/// Writes a full method body (spec §4.5): flag, locals, then instructions
/// terminated by the `0xFF` sentinel.
pub fn write_method_body(
    writer: &mut ByteWriter,
    body: &MethodBody,
    mut encode_local_type: impl FnMut(&mut ByteWriter, &PickledType),
    mut encode_field: impl FnMut(&mut ByteWriter, FieldHandle),
    mut encode_method: impl FnMut(&mut ByteWriter, MethodHandle),
) -> Result<(), Error> {
    writer.write_bool(body.init_locals);
    writer.write_varint7(body.max_stack);
    writer.write_varint7(body.locals.len() as u32);
    for local in &body.locals {
        writer.write_bool(local.pinned);
        encode_local_type(writer, &local.local_type);
    }
    writer.write_varint7(body.instructions.len() as u32);
    for instruction in &body.instructions {
        write_opcode(writer, instruction.opcode);
        let kind = operand_type_for(instruction.opcode)?;
        write_operand(
            writer,
            instruction.opcode,
            kind,
            &instruction.operand,
            |w, f| encode_field(w, f),
            |w, m| encode_method(w, m),
        )?;
    }
    writer.write_varint7(body.exception_regions.len() as u32);
    for region in &body.exception_regions {
        writer.write_varint7(region.try_start);
        writer.write_varint7(region.try_end);
        writer.write_varint7(region.handler_start);
        writer.write_varint7(region.handler_end);
        match &region.filter {
            Some(filter) => {
                writer.write_bool(true);
                encode_local_type(writer, filter);
            }
            None => writer.write_bool(false),
        }
    }
    writer.write_u8(0xff);
    Ok(())
}

/// Mirrors [`write_method_body`]; `signature` is threaded in separately
/// since it is resolved from the owning method, not embedded per-body.
pub fn read_method_body(
    reader: &mut ByteReader,
    signature: Signature,
    mut decode_local_type: impl FnMut(&mut ByteReader) -> Result<PickledType, Error>,
    mut decode_field: impl FnMut(&mut ByteReader) -> Result<FieldHandle, Error>,
    mut decode_method: impl FnMut(&mut ByteReader) -> Result<MethodHandle, Error>,
) -> Result<MethodBody, Error> {
    let init_locals = reader.read_bool()?;
    let max_stack = reader.read_varint7()?;
    let local_count = reader.read_varint7()? as usize;
    let mut locals = Vec::with_capacity(local_count);
    for _ in 0..local_count {
        let pinned = reader.read_bool()?;
        let local_type = decode_local_type(reader)?;
        locals.push(LocalVariable { local_type, pinned });
    }
    let instruction_count = reader.read_varint7()? as usize;
    let mut instructions = Vec::with_capacity(instruction_count);
    for _ in 0..instruction_count {
        let Some(opcode) = read_opcode(reader)? else {
            return Err(Error::InvalidData(
                "method body ended before its declared instruction count".into(),
            ));
        };
        let kind = operand_type_for(opcode)?;
        let operand = read_operand(reader, opcode, kind, |r| decode_field(r), |r| decode_method(r))?;
        instructions.push(Instruction { opcode, operand });
    }
    let region_count = reader.read_varint7()? as usize;
    let mut exception_regions = Vec::with_capacity(region_count);
    for _ in 0..region_count {
        let try_start = reader.read_varint7()?;
        let try_end = reader.read_varint7()?;
        let handler_start = reader.read_varint7()?;
        let handler_end = reader.read_varint7()?;
        let filter = if reader.read_bool()? {
            Some(decode_local_type(reader)?)
        } else {
            None
        };
        exception_regions.push(ExceptionRegion {
            try_start,
            try_end,
            handler_start,
            handler_end,
            filter,
        });
    }
    let sentinel = reader.read_u8()?;
    if sentinel != 0xff {
        return Err(Error::InvalidData(format!(
            "expected method body sentinel 0xFF, found {sentinel:#04x}"
        )));
    }

    let body = MethodBody {
        signature,
        locals,
        instructions,
        exception_regions,
        max_stack,
        init_locals,
    };
    body.validate()?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_signature() -> Signature {
        Signature {
            name: None,
            calling_convention: crate::signature::CallingConvention::Default,
            return_type: None,
            parameters: Vec::new(),
            generic_parameter_count: 0,
        }
    }

    #[test]
    fn validate_accepts_in_range_branch() {
        let body = MethodBody {
            signature: empty_signature(),
            locals: Vec::new(),
            instructions: vec![
                Instruction {
                    opcode: 0x2b,
                    operand: Operand::BranchTarget(1),
                },
                Instruction {
                    opcode: 0x2a,
                    operand: Operand::None,
                },
            ],
            exception_regions: Vec::new(),
            max_stack: 1,
            init_locals: true,
        };
        assert!(body.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_branch() {
        let body = MethodBody {
            signature: empty_signature(),
            locals: Vec::new(),
            instructions: vec![Instruction {
                opcode: 0x2b,
                operand: Operand::BranchTarget(99),
            }],
            exception_regions: Vec::new(),
            max_stack: 1,
            init_locals: true,
        };
        assert!(matches!(body.validate(), Err(Error::InvalidData(_))));
    }

    #[test]
    fn validate_rejects_bad_exception_region() {
        let body = MethodBody {
            signature: empty_signature(),
            locals: Vec::new(),
            instructions: vec![Instruction {
                opcode: 0,
                operand: Operand::None,
            }],
            exception_regions: vec![ExceptionRegion {
                try_start: 0,
                try_end: 1,
                handler_start: 1,
                handler_end: 50,
                filter: None,
            }],
            max_stack: 0,
            init_locals: false,
        };
        assert!(matches!(body.validate(), Err(Error::InvalidData(_))));
    }

    #[test]
    fn method_body_roundtrips_through_wire_format() {
        let body = MethodBody {
            signature: empty_signature(),
            locals: vec![LocalVariable {
                local_type: PickledType::WellKnown(crate::wellknown::WellKnownType::Int32),
                pinned: false,
            }],
            instructions: vec![
                Instruction {
                    opcode: 0x72,
                    operand: Operand::String("hi".into()),
                },
                Instruction {
                    opcode: 0x20,
                    operand: Operand::I32(-5),
                },
                Instruction {
                    opcode: 0x2b,
                    operand: Operand::BranchTarget(2),
                },
                Instruction {
                    opcode: 0x2a,
                    operand: Operand::None,
                },
            ],
            exception_regions: vec![ExceptionRegion {
                try_start: 0,
                try_end: 2,
                handler_start: 2,
                handler_end: 4,
                filter: None,
            }],
            max_stack: 3,
            init_locals: true,
        };

        let mut writer = ByteWriter::new();
        write_method_body(
            &mut writer,
            &body,
            |w, ty| crate::dispatch::write_pickled_type(w, ty),
            |_, _| unreachable!("body under test has no field operands"),
            |_, _| unreachable!("body under test has no method operands"),
        )
        .unwrap();

        let mut reader = ByteReader::new(writer.as_bytes());
        let back = read_method_body(
            &mut reader,
            empty_signature(),
            |r| crate::dispatch::read_pickled_type(r),
            |_| unreachable!("body under test has no field operands"),
            |_| unreachable!("body under test has no method operands"),
        )
        .unwrap();

        assert_eq!(back, body);
    }

    #[test]
    fn ldloc_s_and_ldarg_s_round_trip_to_distinct_operand_variants() {
        let body = MethodBody {
            signature: empty_signature(),
            locals: Vec::new(),
            instructions: vec![
                Instruction { opcode: 0x11, operand: Operand::Local(0) }, // ldloc.s
                Instruction { opcode: 0x0e, operand: Operand::Argument(1) }, // ldarg.s
                Instruction { opcode: 0xfe0c, operand: Operand::Local(2) }, // ldloc
                Instruction { opcode: 0xfe09, operand: Operand::Argument(3) }, // ldarg
            ],
            exception_regions: Vec::new(),
            max_stack: 4,
            init_locals: false,
        };

        let mut writer = ByteWriter::new();
        write_method_body(
            &mut writer,
            &body,
            |w, ty| crate::dispatch::write_pickled_type(w, ty),
            |_, _| unreachable!("body under test has no field operands"),
            |_, _| unreachable!("body under test has no method operands"),
        )
        .unwrap();

        let mut reader = ByteReader::new(writer.as_bytes());
        let back = read_method_body(
            &mut reader,
            empty_signature(),
            |r| crate::dispatch::read_pickled_type(r),
            |_| unreachable!("body under test has no field operands"),
            |_| unreachable!("body under test has no method operands"),
        )
        .unwrap();

        assert_eq!(back, body);
    }
}
