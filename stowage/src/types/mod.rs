//! Object model
//!
//! The type universe of stored values ([`SourceType`]), user-declared record and opaque types,
//! the statically declared storage traits which drive inline-vs-reference decisions, and the
//! runtime [`TypeTable`] which resolves fully-qualified type names.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::codec::CodecError;

// Re-export
pub use self::value::Array;
pub use self::value::OpaqueValue;
pub use self::value::Record;
pub use self::value::Symbol;
pub use self::value::Value;

mod value;

/// Name marker for tuple types. Tuple names are rendered as `tuple<a,b,...>`.
pub const TUPLE_MARKER: &str = "tuple";

/// Name marker for dynamically sized arrays. Array names are rendered as `array<t>`.
pub const ARRAY_MARKER: &str = "array";

/// Fixed-width primitive kinds.
#[derive(
    Clone, Copy, Debug, EnumString, strum::Display, Eq, Hash, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum PrimitiveKind {
    /// Boolean, 1 byte.
    Bool,
    /// Signed 8 bit integer.
    Int8,
    /// Signed 16 bit integer.
    Int16,
    /// Signed 32 bit integer.
    Int32,
    /// Signed 64 bit integer.
    Int64,
    /// Unsigned 8 bit integer.
    UInt8,
    /// Unsigned 16 bit integer.
    UInt16,
    /// Unsigned 32 bit integer.
    UInt32,
    /// Unsigned 64 bit integer.
    UInt64,
    /// 32 bit float.
    Float32,
    /// 64 bit float.
    Float64,
    /// Unicode scalar value, stored as 4 bytes.
    Char,
}

impl PrimitiveKind {
    /// Size in bytes of the native representation.
    pub fn size(&self) -> usize {
        match self {
            PrimitiveKind::Bool | PrimitiveKind::Int8 | PrimitiveKind::UInt8 => 1,
            PrimitiveKind::Int16 | PrimitiveKind::UInt16 => 2,
            PrimitiveKind::Int32
            | PrimitiveKind::UInt32
            | PrimitiveKind::Float32
            | PrimitiveKind::Char => 4,
            PrimitiveKind::Int64 | PrimitiveKind::UInt64 | PrimitiveKind::Float64 => 8,
        }
    }
}

/// Controls which kinds of values may be stored inline in a parent record.
///
/// Inlining is off by default, because values of these kinds may be only partially initialized,
/// and an inline slot has no way to represent an unassigned field.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct InlinePolicy {
    /// Inline tuples instead of storing them by reference.
    pub tuples: bool,
    /// Inline immutable records which contain indirections (strings, references).
    pub immutables: bool,
}

impl InlinePolicy {
    /// Inline everything which can be inlined.
    pub fn inline_all() -> Self {
        Self {
            tuples: true,
            immutables: true,
        }
    }
}

/// A named field of a record type.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Declared field type.
    pub ty: SourceType,
}

/// A user-defined record type.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RecordType {
    name: String,
    fields: Vec<FieldDef>,
    mutable: bool,
    inlinable: bool,
    reconstructed: bool,
}

impl RecordType {
    /// Declare an immutable record type.
    pub fn immutable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: vec![],
            mutable: false,
            inlinable: true,
            reconstructed: false,
        }
    }

    /// Declare a mutable record type.
    pub fn mutable(name: &str) -> Self {
        Self {
            mutable: true,
            ..Self::immutable(name)
        }
    }

    /// Add a field.
    pub fn field<T: Into<SourceType>>(mut self, name: &str, ty: T) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            ty: ty.into(),
        });
        self
    }

    /// Never store values of this type inline, whatever the inline policy.
    pub fn not_inlinable(mut self) -> Self {
        self.inlinable = false;
        self
    }

    pub(crate) fn reconstructed(name: &str, fields: Vec<FieldDef>, mutable: bool) -> Self {
        Self {
            name: name.to_string(),
            fields,
            mutable,
            inlinable: true,
            reconstructed: true,
        }
    }

    /// Fully-qualified name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Position of the named field.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Is this a mutable record?
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Was this type synthesized from a stored datatype?
    pub fn is_reconstructed(&self) -> bool {
        self.reconstructed
    }
}

/// A user-declared fixed-size bits type, stored as an opaque blob.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct OpaqueType {
    name: String,
    size: usize,
    reconstructed: bool,
}

impl OpaqueType {
    /// Declare an opaque type of `size` bytes.
    pub fn new(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            size,
            reconstructed: false,
        }
    }

    pub(crate) fn reconstructed(name: &str, size: usize) -> Self {
        Self {
            reconstructed: true,
            ..Self::new(name, size)
        }
    }

    /// Fully-qualified name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Was this type synthesized from a stored datatype?
    pub fn is_reconstructed(&self) -> bool {
        self.reconstructed
    }
}

/// The type of a value.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum SourceType {
    /// Fixed-width primitive.
    Primitive(PrimitiveKind),
    /// UTF-8 byte string.
    ByteString,
    /// Wide-character string.
    WideString,
    /// Interned name.
    Symbol,
    /// Arbitrary-precision integer.
    BigInt,
    /// Arbitrary-precision decimal.
    BigDecimal,
    /// A type, as a value.
    Type,
    /// User-declared bits type.
    Opaque(Arc<OpaqueType>),
    /// Ordered, unnamed fields.
    Tuple(Vec<SourceType>),
    /// User-defined record.
    Record(Arc<RecordType>),
    /// Dynamically sized array of elements.
    Array(Box<SourceType>),
    /// A record or opaque type referred to by its fully-qualified name, so a record may have
    /// fields of its own type. Always stored by reference.
    Named(String),
    /// Dynamically typed slot.
    Any,
    /// Absent type; a slot of this type is never assigned.
    Bottom,
    /// Raw pointer. Never storable.
    Pointer,
    /// Function. Never storable.
    Function,
}

impl From<PrimitiveKind> for SourceType {
    fn from(kind: PrimitiveKind) -> Self {
        SourceType::Primitive(kind)
    }
}

impl From<RecordType> for SourceType {
    fn from(record: RecordType) -> Self {
        SourceType::Record(Arc::new(record))
    }
}

impl From<OpaqueType> for SourceType {
    fn from(opaque: OpaqueType) -> Self {
        SourceType::Opaque(Arc::new(opaque))
    }
}

impl SourceType {
    /// Array of `element`.
    pub fn array<T: Into<SourceType>>(element: T) -> Self {
        SourceType::Array(Box::new(element.into()))
    }

    /// Refer to a type by its fully-qualified name.
    pub fn named(name: &str) -> Self {
        SourceType::Named(name.to_string())
    }

    /// Can a value of type `ty` occupy a slot declared with this type?
    pub fn accepts(&self, ty: &SourceType) -> bool {
        match self {
            SourceType::Any => true,
            SourceType::Named(name) => ty.qualified_name() == *name,
            declared => declared == ty,
        }
    }

    /// The record type, if this is a record.
    pub fn as_record(&self) -> Option<&Arc<RecordType>> {
        match self {
            SourceType::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Field types of a composite (record or tuple) type.
    pub fn field_types(&self) -> Option<Vec<SourceType>> {
        match self {
            SourceType::Record(record) => {
                Some(record.fields.iter().map(|f| f.ty.clone()).collect())
            }
            SourceType::Tuple(types) => Some(types.clone()),
            _ => None,
        }
    }

    /// Fully-qualified name, as recorded on committed datatypes.
    pub fn qualified_name(&self) -> String {
        self.to_string()
    }

    /// Was this type synthesized from a stored datatype?
    pub fn is_reconstructed(&self) -> bool {
        match self {
            SourceType::Record(record) => record.reconstructed,
            SourceType::Opaque(opaque) => opaque.reconstructed,
            SourceType::Tuple(types) => types.iter().any(|t| t.is_reconstructed()),
            SourceType::Array(element) => element.is_reconstructed(),
            _ => false,
        }
    }

    /// User-declared record and opaque types spelled out in this type's name.
    pub(crate) fn named_user_types(&self) -> Vec<&SourceType> {
        match self {
            SourceType::Record(_) | SourceType::Opaque(_) => vec![self],
            SourceType::Tuple(types) => types.iter().flat_map(|t| t.named_user_types()).collect(),
            SourceType::Array(element) => element.named_user_types(),
            _ => vec![],
        }
    }

    /// Fail for types which can never be stored.
    pub(crate) fn check_supported(&self) -> Result<()> {
        match self {
            SourceType::Pointer | SourceType::Function => {
                Err(CodecError::UnsupportedType(self.qualified_name()).into())
            }
            _ => Ok(()),
        }
    }

    /// Is this type stored inline when it appears as a field?
    pub fn stored_inline(&self, policy: InlinePolicy) -> Result<bool> {
        self.check_supported()?;
        let inline = match self {
            SourceType::Primitive(_)
            | SourceType::ByteString
            | SourceType::WideString
            | SourceType::Symbol
            | SourceType::BigInt
            | SourceType::BigDecimal
            | SourceType::Type
            | SourceType::Opaque(_) => true,
            SourceType::Named(_) | SourceType::Any | SourceType::Bottom | SourceType::Array(_) => {
                false
            }
            SourceType::Tuple(types) => {
                for ty in types {
                    ty.check_supported()?;
                }
                types.is_empty() || policy.tuples
            }
            SourceType::Record(record) => {
                for field in &record.fields {
                    field.ty.check_supported()?;
                }
                if record.fields.is_empty() {
                    true
                } else if !record.inlinable || record.mutable {
                    false
                } else {
                    self.is_pointer_free() || policy.immutables
                }
            }
            SourceType::Pointer | SourceType::Function => unreachable!("checked above"),
        };
        Ok(inline)
    }
}

/// Storage characteristics, declared per type rather than discovered at runtime.
pub trait StorageTraits {
    /// Instances have identity and fields may be assigned after construction.
    fn is_mutable(&self) -> bool;
    /// The representation contains no indirections and can be copied as raw bytes.
    fn is_pointer_free(&self) -> bool;
    /// Instances may be stored inline, policy permitting.
    fn is_inlinable(&self) -> bool;
    /// The type has no fields.
    fn is_empty(&self) -> bool;
}

impl StorageTraits for SourceType {
    fn is_mutable(&self) -> bool {
        match self {
            SourceType::Record(record) => record.mutable,
            SourceType::Array(_) => true,
            _ => false,
        }
    }

    fn is_pointer_free(&self) -> bool {
        match self {
            SourceType::Primitive(_) | SourceType::Opaque(_) => true,
            SourceType::Tuple(types) => types.iter().all(|t| t.is_pointer_free()),
            SourceType::Record(record) => {
                !record.mutable && record.fields.iter().all(|f| f.ty.is_pointer_free())
            }
            _ => false,
        }
    }

    fn is_inlinable(&self) -> bool {
        match self {
            SourceType::Record(record) => record.inlinable,
            SourceType::Named(_)
            | SourceType::Any
            | SourceType::Bottom
            | SourceType::Array(_)
            | SourceType::Pointer
            | SourceType::Function => false,
            _ => true,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            SourceType::Record(record) => record.fields.is_empty(),
            SourceType::Tuple(types) => types.is_empty(),
            _ => false,
        }
    }
}

impl Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Primitive(kind) => write!(f, "{kind}"),
            SourceType::ByteString => write!(f, "string"),
            SourceType::WideString => write!(f, "wstring"),
            SourceType::Symbol => write!(f, "symbol"),
            SourceType::BigInt => write!(f, "bigint"),
            SourceType::BigDecimal => write!(f, "bigdecimal"),
            SourceType::Type => write!(f, "type"),
            SourceType::Opaque(opaque) => write!(f, "{}", opaque.name),
            SourceType::Tuple(types) => {
                write!(f, "{TUPLE_MARKER}<")?;
                for (idx, ty) in types.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{ty}")?;
                }
                write!(f, ">")
            }
            SourceType::Record(record) => write!(f, "{}", record.name),
            SourceType::Array(element) => write!(f, "{ARRAY_MARKER}<{element}>"),
            SourceType::Named(name) => write!(f, "{name}"),
            SourceType::Any => write!(f, "any"),
            SourceType::Bottom => write!(f, "bottom"),
            SourceType::Pointer => write!(f, "pointer"),
            SourceType::Function => write!(f, "function"),
        }
    }
}

/// Does this fully-qualified name denote a tuple?
pub fn is_tuple_name(name: &str) -> bool {
    name.strip_prefix(TUPLE_MARKER)
        .is_some_and(|rest| rest.starts_with('<'))
}

/// The runtime type table: user-declared types by name, plus types reconstructed from stored
/// datatypes.
#[derive(Clone, Debug, Default)]
pub struct TypeTable {
    declared: HashMap<String, SourceType>,
    reconstructed: HashMap<String, SourceType>,
}

impl TypeTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record type, returning it as a [`SourceType`].
    pub fn register_record(&mut self, record: RecordType) -> SourceType {
        self.register(record.into())
    }

    /// Register an opaque type, returning it as a [`SourceType`].
    pub fn register_opaque(&mut self, opaque: OpaqueType) -> SourceType {
        self.register(opaque.into())
    }

    fn register(&mut self, ty: SourceType) -> SourceType {
        tracing::debug!("Registering type: {ty}");
        self.declared.insert(ty.qualified_name(), ty.clone());
        ty
    }

    pub(crate) fn register_reconstructed(&mut self, ty: SourceType) {
        tracing::debug!("Registering reconstructed type: {ty}");
        self.reconstructed.insert(ty.qualified_name(), ty);
    }

    /// Look up a declared record or opaque type.
    pub fn get(&self, name: &str) -> Option<&SourceType> {
        self.declared.get(name)
    }

    /// Look up a reconstructed type.
    pub fn get_reconstructed(&self, name: &str) -> Option<&SourceType> {
        self.reconstructed.get(name)
    }

    /// Number of declared types.
    pub fn len(&self) -> usize {
        self.declared.len()
    }

    /// Does the table contain no declared types?
    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    /// Parse a fully-qualified type name against the declared types only.
    ///
    /// Returns `None` if any user type named within `name` is not declared.
    pub fn parse(&self, name: &str) -> Result<Option<SourceType>> {
        self.parse_with(name, &mut |_| Ok(None))
    }

    /// Parse a fully-qualified type name, consulting `fallback` for user type names which are
    /// not declared.
    pub fn parse_with(
        &self,
        name: &str,
        fallback: &mut dyn FnMut(&str) -> Result<Option<SourceType>>,
    ) -> Result<Option<SourceType>> {
        let mut parser = NameParser {
            input: name,
            pos: 0,
        };
        let ty = parser.parse(self, fallback)?;
        if parser.pos != name.len() {
            return Err(CodecError::Recognition(format!("malformed type name: {name}")).into());
        }
        Ok(ty)
    }
}

struct NameParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> NameParser<'a> {
    fn ident(&mut self) -> &'a str {
        let rest = &self.input[self.pos..];
        let len = rest
            .find(|c: char| c == '<' || c == '>' || c == ',')
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn eat(&mut self, c: char) -> bool {
        if self.input[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn malformed(&self) -> anyhow::Error {
        CodecError::Recognition(format!("malformed type name: {}", self.input)).into()
    }

    fn parse(
        &mut self,
        table: &TypeTable,
        fallback: &mut dyn FnMut(&str) -> Result<Option<SourceType>>,
    ) -> Result<Option<SourceType>> {
        let ident = self.ident();
        if ident.is_empty() {
            return Err(self.malformed());
        }
        if self.eat('<') {
            let mut args = vec![];
            let mut known = true;
            if !self.eat('>') {
                loop {
                    match self.parse(table, fallback)? {
                        Some(ty) => args.push(ty),
                        None => known = false,
                    }
                    if self.eat('>') {
                        break;
                    }
                    if !self.eat(',') {
                        return Err(self.malformed());
                    }
                }
            }
            if !known {
                return Ok(None);
            }
            return match ident {
                TUPLE_MARKER => Ok(Some(SourceType::Tuple(args))),
                ARRAY_MARKER if args.len() == 1 => {
                    Ok(args.pop().map(|element| SourceType::Array(Box::new(element))))
                }
                _ => Err(self.malformed()),
            };
        }
        let builtin = match ident {
            "string" => Some(SourceType::ByteString),
            "wstring" => Some(SourceType::WideString),
            "symbol" => Some(SourceType::Symbol),
            "bigint" => Some(SourceType::BigInt),
            "bigdecimal" => Some(SourceType::BigDecimal),
            "type" => Some(SourceType::Type),
            "any" => Some(SourceType::Any),
            "bottom" => Some(SourceType::Bottom),
            "pointer" => Some(SourceType::Pointer),
            "function" => Some(SourceType::Function),
            other => PrimitiveKind::from_str(other).ok().map(SourceType::Primitive),
        };
        match builtin {
            Some(ty) => Ok(Some(ty)),
            None => match table.get(ident) {
                Some(ty) => Ok(Some(ty.clone())),
                None => fallback(ident),
            },
        }
    }
}
