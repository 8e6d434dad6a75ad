//! On-disk datatypes
//!
//! A [`Datatype`] describes how values of one type are laid out in a stored record. Datatypes
//! of user-defined types are committed into the container under [`TYPES_NAMESPACE`], and
//! compound members carry mangled names (`<field>_<suffix>`) whose suffix is the committed index
//! of the member's own datatype. The suffix is what lets a reader re-derive which members were
//! themselves user-defined types, because member datatypes are stored as copies, not links.
//!
//! [`TYPES_NAMESPACE`]: super::TYPES_NAMESPACE

use std::fmt::Display;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::{CodecError, REFERENCE_SIZE, VL_SLOT_SIZE};
use crate::types::PrimitiveKind;

/// 7-bit ASCII strings.
pub const CHARSET_ASCII: u8 = 0;

/// UTF-8 strings.
pub const CHARSET_UTF8: u8 = 1;

/// A compound member.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Mangled member name.
    pub name: String,
    /// Byte offset within the record.
    pub offset: usize,
    /// Member datatype.
    pub datatype: Datatype,
}

/// An on-disk datatype.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Datatype {
    /// Little-endian integer.
    Integer {
        /// Width in bytes
        size: u8,
        /// Two's complement?
        signed: bool,
    },
    /// IEEE 754 float.
    Float {
        /// Width in bytes
        size: u8,
    },
    /// Single byte boolean.
    Boolean,
    /// Unicode scalar value in 4 bytes.
    Character,
    /// Variable-length string.
    String {
        /// Character set code
        charset: u8,
    },
    /// Variable-length sequence of a base datatype.
    VarLen(Box<Datatype>),
    /// Record of named members.
    Compound {
        /// Record size in bytes
        size: usize,
        /// Members in insertion order
        members: Vec<Member>,
    },
    /// Fixed-size blob.
    Opaque {
        /// Blob size in bytes
        size: usize,
    },
    /// Object reference.
    Reference,
}

impl Datatype {
    /// A compound of `size` bytes, with no members yet.
    pub fn create_compound(size: usize) -> Self {
        Datatype::Compound {
            size,
            members: vec![],
        }
    }

    /// An opaque blob of `size` bytes.
    pub fn create_opaque(size: usize) -> Self {
        Datatype::Opaque { size }
    }

    /// A variable-length sequence of `base`.
    pub fn create_variable_length(base: Datatype) -> Self {
        Datatype::VarLen(Box::new(base))
    }

    /// A variable-length UTF-8 string.
    pub fn create_string() -> Self {
        Datatype::String {
            charset: CHARSET_UTF8,
        }
    }

    /// The native datatype of a primitive.
    pub fn native(kind: PrimitiveKind) -> Self {
        let size = kind.size() as u8;
        match kind {
            PrimitiveKind::Bool => Datatype::Boolean,
            PrimitiveKind::Char => Datatype::Character,
            PrimitiveKind::Int8
            | PrimitiveKind::Int16
            | PrimitiveKind::Int32
            | PrimitiveKind::Int64 => Datatype::Integer { size, signed: true },
            PrimitiveKind::UInt8
            | PrimitiveKind::UInt16
            | PrimitiveKind::UInt32
            | PrimitiveKind::UInt64 => Datatype::Integer {
                size,
                signed: false,
            },
            PrimitiveKind::Float32 | PrimitiveKind::Float64 => Datatype::Float { size },
        }
    }

    /// Add a member to a compound.
    pub fn insert_member(&mut self, name: &str, offset: usize, member: Datatype) -> Result<()> {
        match self {
            Datatype::Compound { size, members } => {
                if members.iter().any(|m| m.name == name) {
                    return Err(CodecError::Recognition(format!(
                        "duplicate compound member: {name}"
                    ))
                    .into());
                }
                if offset > *size {
                    return Err(CodecError::Recognition(format!(
                        "member {name} at offset {offset} lies beyond compound size {size}"
                    ))
                    .into());
                }
                members.push(Member {
                    name: name.to_string(),
                    offset,
                    datatype: member,
                });
                Ok(())
            }
            other => Err(CodecError::Recognition(format!(
                "cannot insert member {name} into {} datatype",
                other.class_name()
            ))
            .into()),
        }
    }

    /// Size in bytes of one stored element.
    pub fn size(&self) -> usize {
        match self {
            Datatype::Integer { size, .. } | Datatype::Float { size } => *size as usize,
            Datatype::Boolean => 1,
            Datatype::Character => 4,
            Datatype::String { .. } | Datatype::VarLen(_) => VL_SLOT_SIZE,
            Datatype::Compound { size, .. } | Datatype::Opaque { size } => *size,
            Datatype::Reference => REFERENCE_SIZE,
        }
    }

    /// Name of the datatype class.
    pub fn class_name(&self) -> &'static str {
        match self {
            Datatype::Integer { .. } => "integer",
            Datatype::Float { .. } => "float",
            Datatype::Boolean => "boolean",
            Datatype::Character => "character",
            Datatype::String { .. } => "string",
            Datatype::VarLen(_) => "variable-length",
            Datatype::Compound { .. } => "compound",
            Datatype::Opaque { .. } => "opaque",
            Datatype::Reference => "reference",
        }
    }

    /// Members of a compound; empty for every other class.
    pub fn members(&self) -> &[Member] {
        match self {
            Datatype::Compound { members, .. } => members,
            _ => &[],
        }
    }

    /// The primitive kind of a native scalar datatype.
    pub fn primitive_kind(&self) -> Result<PrimitiveKind> {
        let kind = match self {
            Datatype::Boolean => PrimitiveKind::Bool,
            Datatype::Character => PrimitiveKind::Char,
            Datatype::Integer { size, signed } => match (size, signed) {
                (1, true) => PrimitiveKind::Int8,
                (2, true) => PrimitiveKind::Int16,
                (4, true) => PrimitiveKind::Int32,
                (8, true) => PrimitiveKind::Int64,
                (1, false) => PrimitiveKind::UInt8,
                (2, false) => PrimitiveKind::UInt16,
                (4, false) => PrimitiveKind::UInt32,
                (8, false) => PrimitiveKind::UInt64,
                _ => {
                    return Err(CodecError::Recognition(format!(
                        "unknown integer primitive of {size} bytes"
                    ))
                    .into())
                }
            },
            Datatype::Float { size } => match size {
                4 => PrimitiveKind::Float32,
                8 => PrimitiveKind::Float64,
                _ => {
                    return Err(CodecError::Recognition(format!(
                        "unknown float primitive of {size} bytes"
                    ))
                    .into())
                }
            },
            other => {
                return Err(CodecError::Recognition(format!(
                    "{} datatype is not a primitive",
                    other.class_name()
                ))
                .into())
            }
        };
        Ok(kind)
    }

    /// Check the character set of a string datatype.
    pub fn check_charset(&self) -> Result<()> {
        match self {
            Datatype::String { charset } if *charset == CHARSET_ASCII || *charset == CHARSET_UTF8 => {
                Ok(())
            }
            Datatype::String { charset } => {
                Err(CodecError::Recognition(format!("unknown character set: {charset}")).into())
            }
            other => Err(CodecError::Recognition(format!(
                "{} datatype is not a string",
                other.class_name()
            ))
            .into()),
        }
    }

    /// Structural equality, ignoring the suffixes of mangled member names.
    ///
    /// Suffixes are committed indices, which differ between files and are absent from
    /// datatypes derived without committing.
    pub fn layout_eq(&self, other: &Datatype) -> bool {
        match (self, other) {
            (
                Datatype::Compound { size, members },
                Datatype::Compound {
                    size: other_size,
                    members: other_members,
                },
            ) => {
                size == other_size
                    && members.len() == other_members.len()
                    && members.iter().zip(other_members).all(|(a, b)| {
                        a.offset == b.offset
                            && field_name(&a.name) == field_name(&b.name)
                            && a.datatype.layout_eq(&b.datatype)
                    })
            }
            (Datatype::VarLen(a), Datatype::VarLen(b)) => a.layout_eq(b),
            (a, b) => a == b,
        }
    }
}

impl Display for Datatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datatype::Integer { size, signed } => {
                write!(f, "{}int{}", if *signed { "" } else { "u" }, size * 8)
            }
            Datatype::Float { size } => write!(f, "float{}", size * 8),
            Datatype::Boolean => write!(f, "bool"),
            Datatype::Character => write!(f, "char"),
            Datatype::String { .. } => write!(f, "string"),
            Datatype::VarLen(base) => write!(f, "vlen<{base}>"),
            Datatype::Compound { size, members } => {
                write!(f, "compound[{size}]{{")?;
                for (idx, member) in members.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}@{}: {}", member.name, member.offset, member.datatype)?;
                }
                write!(f, "}}")
            }
            Datatype::Opaque { size } => write!(f, "opaque[{size}]"),
            Datatype::Reference => write!(f, "ref"),
        }
    }
}

/// Mangle a member name with the committed index of its datatype.
///
/// Only committed datatypes (positive index) contribute a suffix.
pub fn mangle(name: &str, index: i64) -> String {
    if index > 0 {
        format!("{name}_{index}")
    } else {
        format!("{name}_")
    }
}

/// Split a mangled member name into the field name and the optional committed index.
pub fn demangle(mangled: &str) -> Result<(&str, Option<i64>)> {
    let (name, suffix) = mangled.rsplit_once('_').ok_or_else(|| {
        CodecError::Recognition(format!("member name is not mangled: {mangled}"))
    })?;
    if suffix.is_empty() {
        return Ok((name, None));
    }
    let index = suffix
        .parse::<i64>()
        .ok()
        .filter(|index| *index > 0)
        .ok_or_else(|| {
            CodecError::Recognition(format!("invalid member name suffix: {mangled}"))
        })?;
    Ok((name, Some(index)))
}

fn field_name(mangled: &str) -> &str {
    mangled
        .rsplit_once('_')
        .map(|(name, _)| name)
        .unwrap_or(mangled)
}
