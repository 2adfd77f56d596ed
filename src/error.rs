use std::{error, fmt};

use crate::varint;

/// Everything that can go wrong while pickling or unpickling a value.
///
/// Stream and protocol errors (spec §7) are fatal the moment they are
/// produced. Reconciliation errors are usually stashed on a `TypeInfo`
/// instead of being constructed here directly (see [`crate::typeinfo`]) and
/// only surface through [`Error::TypeMismatch`] when an instance of the
/// offending type is actually decoded.
#[derive(Debug, Clone)]
pub enum Error {
    /// Truncated input, bad magic, bad version, bad varint.
    StreamFormat(String),
    /// A back-reference named a memo id that has not been published yet.
    BadMemo(u32),
    /// An opcode/operation byte fell outside its enum.
    UnknownOperation { what: &'static str, byte: u8 },
    /// `TypeInfo` negotiation failed for this type; raised only when a
    /// value of the type is actually encountered.
    TypeMismatch(String),
    /// A declared field/method/constructor was not found on the local
    /// type during reification.
    MissingMember { type_name: String, member: String },
    /// A `Reduced`-mode type's constructor/method returned null.
    ReducerReturnedNull { type_name: String },
    /// Header version/magic mismatch.
    InvalidData(String),
    /// Dynamic assembly/type/method construction failed in the host.
    Construction(String),
    /// A stage-N closure tried to enqueue work onto stage < N.
    StageOrderViolation { from: u8, into: u8 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamFormat(msg) => write!(f, "stream format error: {msg}"),
            Self::BadMemo(id) => write!(f, "back-reference to unpublished memo id {id}"),
            Self::UnknownOperation { what, byte } => {
                write!(f, "unknown {what} operation byte 0x{byte:02x}")
            }
            Self::TypeMismatch(msg) => write!(f, "{msg}"),
            Self::MissingMember { type_name, member } => {
                write!(f, "missing member `{member}` on type `{type_name}`")
            }
            Self::ReducerReturnedNull { type_name } => {
                write!(f, "reducer for type `{type_name}` returned null")
            }
            Self::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Self::Construction(msg) => write!(f, "construction failed: {msg}"),
            Self::StageOrderViolation { from, into } => write!(
                f,
                "stage {from} closure tried to enqueue into earlier stage {into}"
            ),
        }
    }
}

impl error::Error for Error {}

impl From<varint::Error> for Error {
    fn from(err: varint::Error) -> Self {
        Self::StreamFormat(err.to_string())
    }
}
