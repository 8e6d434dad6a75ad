use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::Datatype;

/// Location of a committed datatype (or the root) within a container.
pub type Address = u64;

/// The root. Carries file-wide attributes.
pub const ROOT: Address = 0;

/// Reference to a stored object.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ObjRef(pub u64);

/// The reference stored for an unassigned field.
pub const NULL_REFERENCE: ObjRef = ObjRef(0);

/// An attribute value.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    /// Boolean flag
    Bool(bool),
    /// String
    Str(String),
}

impl Attribute {
    /// The flag, if this is a boolean attribute.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attribute::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The string, if this is a string attribute.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attribute::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// The datatype of a stored object.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ObjectDatatype {
    /// A committed datatype.
    Committed(Address),
    /// An uncommitted native datatype (primitives and strings).
    Builtin(Datatype),
}

/// A stored object: its datatype, its record, and the variable-length buffers it refers to.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Datatype of the record.
    pub datatype: ObjectDatatype,
    /// The record.
    pub data: Vec<u8>,
    /// Variable-length buffers, by heap index.
    pub heap: Vec<Vec<u8>>,
}

/// Container specific errors.
#[derive(Error, Debug)]
pub enum ContainerError {
    /// No object is stored under the reference
    #[error("could not find object: {0}")]
    LostObject(u64),

    /// No datatype is committed at the address
    #[error("could not find datatype at address: {0}")]
    LostDatatype(Address),

    /// The name is already taken
    #[error("name already in use: {0}")]
    DuplicateName(String),

    /// The reference was never reserved
    #[error("reference was never reserved: {0}")]
    DanglingReference(u64),

    /// Unsupported file format
    #[error("file version not supported: {0}")]
    InvalidFileVersion(u8),

    /// Block allocation failed
    #[error("could not find block at pos: {0}")]
    LostBlock(usize),

    /// Block bookkeeping failed
    #[error("could not find block mapping for object: {0}")]
    LostMapping(u64),

    /// A migrated block could not be returned
    #[error("could not insert block for object: {0}")]
    BlockReturn(u64),
}

/// Storage for committed datatypes, attributes and objects.
pub trait Container {
    /// Commit `datatype` as `name` within `namespace`, returning its address.
    fn commit(&mut self, namespace: &str, name: &str, datatype: &Datatype) -> Result<Address>;

    /// The datatype committed at `address`.
    fn datatype(&self, address: Address) -> Result<Datatype>;

    /// Names and addresses of everything committed within `namespace`, ordered by name.
    fn enumerate(&self, namespace: &str) -> Result<Vec<(String, Address)>>;

    /// Read an attribute of a committed datatype or of the root.
    fn read_attribute(&self, address: Address, key: &str) -> Result<Option<Attribute>>;

    /// Write an attribute of a committed datatype or of the root.
    fn write_attribute(&mut self, address: Address, key: &str, value: Attribute) -> Result<()>;

    /// Allocate a reference for an object which is about to be written.
    fn reserve_object(&mut self) -> ObjRef;

    /// Store the object for a reserved reference.
    fn write_object(&mut self, reference: ObjRef, object: StoredObject) -> Result<()>;

    /// Read a stored object.
    fn read_object(&self, reference: ObjRef) -> Result<StoredObject>;

    /// Bind `name` to an object in the root link table. Rebinding replaces the link.
    fn link(&mut self, name: &str, reference: ObjRef) -> Result<()>;

    /// The object bound to `name`.
    fn lookup(&self, name: &str) -> Option<ObjRef>;

    /// Every root link, ordered by name.
    fn links(&self) -> Vec<(String, ObjRef)>;
}
