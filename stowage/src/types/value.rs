//! Dynamic values
//!

use std::cell::{Ref, RefCell};
use std::collections::HashSet;
use std::fmt::Display;
use std::rc::Rc;
use std::sync::{Arc, LazyLock, Mutex};

use anyhow::Result;
use num_bigint::BigInt;
use rust_decimal::Decimal;

use super::{OpaqueType, PrimitiveKind, RecordType, SourceType};
use crate::codec::CodecError;

static SYMBOLS: LazyLock<Mutex<HashSet<Arc<str>>>> = LazyLock::new(Default::default);

/// An interned name.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Symbol(Arc<str>);

impl Symbol {
    /// Intern `name`.
    pub fn intern(name: &str) -> Self {
        let mut symbols = SYMBOLS.lock().unwrap_or_else(|e| e.into_inner());
        match symbols.get(name) {
            Some(existing) => Symbol(existing.clone()),
            None => {
                let interned: Arc<str> = Arc::from(name);
                symbols.insert(interned.clone());
                Symbol(interned)
            }
        }
    }

    /// The interned name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Do both symbols share the same interned storage?
    pub fn same_interned(&self, other: &Symbol) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Value of a user-declared opaque type.
#[derive(Clone, Debug, PartialEq)]
pub struct OpaqueValue {
    /// The opaque type.
    pub ty: Arc<OpaqueType>,
    /// Raw bytes, exactly `ty.size()` long.
    pub bytes: Vec<u8>,
}

thread_local! {
    // Pairs of instances being compared on this thread
    static COMPARING: RefCell<HashSet<(usize, usize)>> = RefCell::new(HashSet::new());
    // Records being formatted on this thread
    static FORMATTING: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

/// Structural comparison of two instances. A pair met again while it is still being compared
/// counts as equal, so comparing cyclic values terminates.
fn compare_instances<T>(a: &T, b: &T, eq: impl FnOnce() -> bool) -> bool {
    let key = (a as *const T as usize, b as *const T as usize);
    if key.0 == key.1 {
        return true;
    }
    if !COMPARING.with(|pairs| pairs.borrow_mut().insert(key)) {
        return true;
    }
    let equal = eq();
    COMPARING.with(|pairs| pairs.borrow_mut().remove(&key));
    equal
}

/// An instance of a record type.
///
/// Each field is either assigned (`Some`) or unassigned (`None`). Equality is structural and
/// terminates on cyclic values.
pub struct Record {
    ty: Arc<RecordType>,
    fields: RefCell<Vec<Option<Value>>>,
}

impl Record {
    /// Create an instance with every field assigned or unassigned as given.
    pub fn new(ty: &Arc<RecordType>, fields: Vec<Option<Value>>) -> Result<Self> {
        if fields.len() != ty.fields().len() {
            return Err(CodecError::ValueMismatch {
                expected: format!("{} fields for {}", ty.fields().len(), ty.name()),
                found: format!("{} fields", fields.len()),
            }
            .into());
        }
        Ok(Self {
            ty: ty.clone(),
            fields: RefCell::new(fields),
        })
    }

    /// Create an instance with no field assigned.
    pub fn unassigned(ty: &Arc<RecordType>) -> Self {
        Self {
            ty: ty.clone(),
            fields: RefCell::new(vec![None; ty.fields().len()]),
        }
    }

    /// The record's type.
    pub fn record_type(&self) -> &Arc<RecordType> {
        &self.ty
    }

    /// Value of field `idx`, if assigned.
    pub fn get(&self, idx: usize) -> Option<Value> {
        self.fields.borrow().get(idx).cloned().flatten()
    }

    /// Value of the named field, if assigned.
    pub fn get_named(&self, name: &str) -> Option<Value> {
        self.ty.field_index(name).and_then(|idx| self.get(idx))
    }

    /// All field slots.
    pub fn fields(&self) -> Ref<'_, Vec<Option<Value>>> {
        self.fields.borrow()
    }

    /// Assign field `idx`. Only mutable records may be assigned.
    pub fn set(&self, idx: usize, value: Value) -> Result<()> {
        if !self.ty.is_mutable() {
            return Err(CodecError::Immutable(self.ty.name().to_string()).into());
        }
        self.assign(idx, value)
    }

    pub(crate) fn assign(&self, idx: usize, value: Value) -> Result<()> {
        let mut fields = self.fields.borrow_mut();
        let slot = fields
            .get_mut(idx)
            .ok_or_else(|| CodecError::ValueMismatch {
                expected: format!("field index below {}", self.ty.fields().len()),
                found: format!("field index {idx}"),
            })?;
        *slot = Some(value);
        Ok(())
    }

    pub(crate) fn fields_mut(&mut self) -> &mut Vec<Option<Value>> {
        self.fields.get_mut()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        compare_instances(self, other, || {
            self.ty == other.ty && *self.fields.borrow() == *other.fields.borrow()
        })
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = self as *const Record as usize;
        if !FORMATTING.with(|records| records.borrow_mut().insert(key)) {
            return write!(f, "Record({}, ..)", self.ty.name());
        }
        let result = f
            .debug_struct("Record")
            .field("ty", &self.ty.name())
            .field("fields", &*self.fields.borrow())
            .finish();
        FORMATTING.with(|records| records.borrow_mut().remove(&key));
        result
    }
}

/// A dynamically sized array.
#[derive(Debug)]
pub struct Array {
    element: SourceType,
    items: RefCell<Vec<Value>>,
}

impl Array {
    /// Create an array of `element` typed items.
    pub fn new(element: SourceType, items: Vec<Value>) -> Self {
        Self {
            element,
            items: RefCell::new(items),
        }
    }

    /// Element type.
    pub fn element(&self) -> &SourceType {
        &self.element
    }

    /// Items.
    pub fn items(&self) -> Ref<'_, Vec<Value>> {
        self.items.borrow()
    }

    /// Append an item.
    pub fn push(&self, value: Value) {
        self.items.borrow_mut().push(value);
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    /// Is the array empty?
    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        compare_instances(self, other, || {
            self.element == other.element && *self.items.borrow() == *other.items.borrow()
        })
    }
}

/// A dynamically typed value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Signed 8 bit integer.
    Int8(i8),
    /// Signed 16 bit integer.
    Int16(i16),
    /// Signed 32 bit integer.
    Int32(i32),
    /// Signed 64 bit integer.
    Int64(i64),
    /// Unsigned 8 bit integer.
    UInt8(u8),
    /// Unsigned 16 bit integer.
    UInt16(u16),
    /// Unsigned 32 bit integer.
    UInt32(u32),
    /// Unsigned 64 bit integer.
    UInt64(u64),
    /// 32 bit float.
    Float32(f32),
    /// 64 bit float.
    Float64(f64),
    /// Unicode scalar value.
    Char(char),
    /// UTF-8 byte string.
    String(String),
    /// Wide-character string.
    WideString(Vec<char>),
    /// Interned name.
    Symbol(Symbol),
    /// Arbitrary-precision integer.
    BigInt(BigInt),
    /// Arbitrary-precision decimal.
    BigDecimal(Decimal),
    /// A type.
    Type(SourceType),
    /// Value of a user-declared opaque type.
    Opaque(OpaqueValue),
    /// Tuple.
    Tuple(Vec<Value>),
    /// Record instance.
    Record(Rc<Record>),
    /// Array.
    Array(Rc<Array>),
    /// Raw pointer. Never storable.
    Pointer(usize),
    /// Function, by name. Never storable.
    Function(String),
}

impl Value {
    /// Build a record value.
    pub fn record(ty: &SourceType, fields: Vec<Option<Value>>) -> Result<Self> {
        let record = ty.as_record().ok_or_else(|| CodecError::ValueMismatch {
            expected: "a record type".to_string(),
            found: ty.qualified_name(),
        })?;
        Ok(Value::Record(Rc::new(Record::new(record, fields)?)))
    }

    /// Build an array value.
    pub fn array(element: SourceType, items: Vec<Value>) -> Self {
        Value::Array(Rc::new(Array::new(element, items)))
    }

    /// Build a string value.
    pub fn string(s: &str) -> Self {
        Value::String(s.to_string())
    }

    /// Build a symbol value.
    pub fn symbol(name: &str) -> Self {
        Value::Symbol(Symbol::intern(name))
    }

    /// The concrete type of this value.
    pub fn source_type(&self) -> SourceType {
        match self {
            Value::Bool(_) => PrimitiveKind::Bool.into(),
            Value::Int8(_) => PrimitiveKind::Int8.into(),
            Value::Int16(_) => PrimitiveKind::Int16.into(),
            Value::Int32(_) => PrimitiveKind::Int32.into(),
            Value::Int64(_) => PrimitiveKind::Int64.into(),
            Value::UInt8(_) => PrimitiveKind::UInt8.into(),
            Value::UInt16(_) => PrimitiveKind::UInt16.into(),
            Value::UInt32(_) => PrimitiveKind::UInt32.into(),
            Value::UInt64(_) => PrimitiveKind::UInt64.into(),
            Value::Float32(_) => PrimitiveKind::Float32.into(),
            Value::Float64(_) => PrimitiveKind::Float64.into(),
            Value::Char(_) => PrimitiveKind::Char.into(),
            Value::String(_) => SourceType::ByteString,
            Value::WideString(_) => SourceType::WideString,
            Value::Symbol(_) => SourceType::Symbol,
            Value::BigInt(_) => SourceType::BigInt,
            Value::BigDecimal(_) => SourceType::BigDecimal,
            Value::Type(_) => SourceType::Type,
            Value::Opaque(opaque) => SourceType::Opaque(opaque.ty.clone()),
            Value::Tuple(items) => SourceType::Tuple(items.iter().map(|v| v.source_type()).collect()),
            Value::Record(record) => SourceType::Record(record.ty.clone()),
            Value::Array(array) => SourceType::array(array.element.clone()),
            Value::Pointer(_) => SourceType::Pointer,
            Value::Function(_) => SourceType::Function,
        }
    }

    /// Identity of shared values (records and arrays), used to preserve sharing.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Record(record) => Some(Rc::as_ptr(record) as usize),
            Value::Array(array) => Some(Rc::as_ptr(array) as usize),
            _ => None,
        }
    }

    /// Do both values refer to the same shared instance?
    pub fn same_instance(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Record(a), Value::Record(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The record, if this is a record value.
    pub fn as_record(&self) -> Option<&Rc<Record>> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }

    /// The array, if this is an array value.
    pub fn as_array(&self) -> Option<&Rc<Array>> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt8(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Char(v) => write!(f, "{v:?}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::WideString(v) => write!(f, "{:?}", v.iter().collect::<String>()),
            Value::Symbol(v) => write!(f, ":{}", v.as_str()),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::BigDecimal(v) => write!(f, "{v}"),
            Value::Type(v) => write!(f, "{v}"),
            Value::Opaque(v) => write!(f, "{}({} bytes)", v.ty.name(), v.bytes.len()),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Value::Record(record) => {
                write!(f, "{}(", record.ty.name())?;
                for (idx, (def, slot)) in record
                    .ty
                    .fields()
                    .iter()
                    .zip(record.fields().iter())
                    .enumerate()
                {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    match slot {
                        // Only one level of nested records, so cycles terminate
                        Some(Value::Record(inner)) => write!(f, "{}=<{}>", def.name, inner.ty.name())?,
                        Some(value) => write!(f, "{}={value}", def.name)?,
                        None => write!(f, "{}=#undef", def.name)?,
                    }
                }
                write!(f, ")")
            }
            Value::Array(array) => write!(f, "{}[{} items]", array.element, array.len()),
            Value::Pointer(v) => write!(f, "pointer({v:#x})"),
            Value::Function(v) => write!(f, "function({v})"),
        }
    }
}
