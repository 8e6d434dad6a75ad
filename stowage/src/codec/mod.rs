//! Codec engine
//!
//! Derives on-disk datatypes for value types, commits them into a container, and generates
//! (and caches) the routines which encode values into fixed-size records and decode them back.
//!
//! Records are packed little-endian. Variable-length data (strings, arrays, big number text)
//! is staged in a [`WriteSession`] and stored alongside the record as the object's heap. A
//! variable-length slot holds the heap index and the element count. A reference slot holds an
//! [`ObjRef`](crate::io::ObjRef).

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;

use crate::io::ObjRef;
use crate::types::{SourceType, Value};

// Re-export
pub use self::datatype::Datatype;
pub use self::datatype::Member;
pub use self::generic::cached_codecs;
pub use self::generic::get_or_build;
pub use self::generic::reset_codecs;
pub use self::layout::FieldLayout;
pub use self::layout::FieldSlot;
pub use self::layout::Storage;
pub use self::registry::DatatypeHandle;
pub use self::registry::DatatypeRegistry;
pub use self::session::WriteSession;

pub mod datatype;
mod generic;
mod layout;
mod reconstruct;
mod registry;
mod session;
mod special;

/// Size of an object reference slot.
pub const REFERENCE_SIZE: usize = 8;

/// Size of a variable-length slot: heap index and element count.
pub const VL_SLOT_SIZE: usize = 16;

/// Reserved namespace holding committed datatypes.
pub const TYPES_NAMESPACE: &str = "/_types";

/// Attribute holding the fully-qualified type name of a committed datatype.
pub const NAME_ATTRIBUTE: &str = "name";

/// Attribute marking the datatype of a zero-field type.
pub const EMPTY_ATTRIBUTE: &str = "empty";

/// Attribute marking the datatype of a mutable record type.
pub const MUTABLE_ATTRIBUTE: &str = "mutable";

/// Codec specific errors.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The type can never be stored
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// A stored datatype disagrees with the datatype derived for the local type of that name
    #[error("stored datatype for {0} does not match the local definition")]
    TypeMismatch(String),

    /// Stored data could not be recognized
    #[error("unrecognized data: {0}")]
    Recognition(String),

    /// A value does not match the type it is being encoded as
    #[error("expected {expected}, found {found}")]
    ValueMismatch {
        /// What the codec expected
        expected: String,
        /// What it was given
        found: String,
    },

    /// A field stored inline has no value
    #[error("field {field} of {owner} is unassigned, but is stored inline")]
    UnassignedInline {
        /// Composite type
        owner: String,
        /// Field name
        field: String,
    },

    /// Attempted to modify an immutable record
    #[error("record of type {0} is immutable")]
    Immutable(String),
}

/// Stores referenced values as separate objects.
pub trait ReferenceWriter {
    /// Store `value` (or find where it is already stored) and return its reference.
    fn write_reference(&mut self, value: &Value) -> Result<ObjRef>;

    /// Commit the datatype of a type named by a stored type value, so a reader which does not
    /// know the type can still resolve the name.
    fn commit_type(&mut self, ty: &SourceType) -> Result<()>;
}

/// Materializes referenced objects.
pub trait ReferenceReader {
    /// Materialize the referenced object. Repeated reads of one reference yield the same
    /// instance.
    fn read_reference(&mut self, reference: ObjRef) -> Result<Value>;

    /// Record the instance for a reference before its fields are decoded.
    fn bind(&mut self, reference: ObjRef, value: Value);

    /// Resolve a fully-qualified type name.
    fn resolve_type_name(&mut self, name: &str) -> Result<SourceType>;
}

/// State available while encoding one stored object.
pub struct EncodeContext<'a> {
    /// Owns the variable-length buffers of the object.
    pub session: &'a mut WriteSession,
    /// Writes referenced values.
    pub refs: &'a mut dyn ReferenceWriter,
}

/// State available while decoding one stored object.
pub struct DecodeContext<'a> {
    heap: &'a [Vec<u8>],
    refs: &'a mut dyn ReferenceReader,
    binding: Option<ObjRef>,
}

impl<'a> DecodeContext<'a> {
    /// Create a context over an object's heap. `binding` is the reference of the object being
    /// decoded, if any.
    pub fn new(
        heap: &'a [Vec<u8>],
        refs: &'a mut dyn ReferenceReader,
        binding: Option<ObjRef>,
    ) -> Self {
        Self {
            heap,
            refs,
            binding,
        }
    }

    pub(crate) fn blob(&self, id: u64) -> Result<&'a [u8]> {
        let heap: &'a [Vec<u8>] = self.heap;
        usize::try_from(id)
            .ok()
            .and_then(|idx| heap.get(idx))
            .map(|blob| blob.as_slice())
            .ok_or_else(|| {
                CodecError::Recognition(format!("heap buffer {id} is missing")).into()
            })
    }

    /// Claim the reference of the object being decoded. Only the outermost composite of an
    /// object gets it; inline members see `None`.
    pub(crate) fn claim(&mut self) -> Option<ObjRef> {
        self.binding.take()
    }

    pub(crate) fn bind(&mut self, reference: Option<ObjRef>, value: &Value) {
        if let Some(reference) = reference {
            self.refs.bind(reference, value.clone());
        }
    }
}

/// An encode/decode routine pair for one type.
pub trait Codec: Send + Sync + Debug {
    /// The type handled by this codec.
    fn source_type(&self) -> &SourceType;

    /// Number of bytes occupied when stored inline.
    fn size(&self) -> usize;

    /// Write `value` into `buf`.
    fn encode(&self, buf: &mut [u8], value: &Value, cx: &mut EncodeContext<'_>) -> Result<()>;

    /// Read a value from `buf`.
    fn decode(&self, buf: &[u8], cx: &mut DecodeContext<'_>) -> Result<Value>;

    /// Read a value from `buf` into caller-owned storage.
    fn decode_into(&self, buf: &[u8], dest: &mut Value, cx: &mut DecodeContext<'_>) -> Result<()> {
        *dest = self.decode(buf, cx)?;
        Ok(())
    }
}

/// A cached codec.
pub type Conversion = Arc<dyn Codec>;

pub(crate) fn read_slot(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    buf.get(offset..offset + len).ok_or_else(|| {
        CodecError::Recognition(format!(
            "truncated record: need {len} bytes at offset {offset}, have {}",
            buf.len()
        ))
        .into()
    })
}

pub(crate) fn write_slot(buf: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8]> {
    let available = buf.len();
    buf.get_mut(offset..offset + len).ok_or_else(|| {
        CodecError::Recognition(format!(
            "record too small: need {len} bytes at offset {offset}, have {available}"
        ))
        .into()
    })
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(read_slot(buf, offset, 8)?);
    Ok(u64::from_le_bytes(bytes))
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, value: u64) -> Result<()> {
    write_slot(buf, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn mismatch(expected: &SourceType, found: &Value) -> anyhow::Error {
    CodecError::ValueMismatch {
        expected: expected.qualified_name(),
        found: found.source_type().qualified_name(),
    }
    .into()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;
    use crate::types::TypeTable;

    /// Keeps referenced values in memory, by reference number.
    #[derive(Default)]
    pub(crate) struct MemoryRefs {
        pub(crate) objects: HashMap<u64, Value>,
        pub(crate) types: TypeTable,
    }

    impl ReferenceWriter for MemoryRefs {
        fn write_reference(&mut self, value: &Value) -> Result<ObjRef> {
            let reference = self.objects.len() as u64 + 1;
            self.objects.insert(reference, value.clone());
            Ok(ObjRef(reference))
        }

        fn commit_type(&mut self, _ty: &SourceType) -> Result<()> {
            Ok(())
        }
    }

    impl ReferenceReader for MemoryRefs {
        fn read_reference(&mut self, reference: ObjRef) -> Result<Value> {
            self.objects.get(&reference.0).cloned().ok_or_else(|| {
                CodecError::Recognition(format!("no object {}", reference.0)).into()
            })
        }

        fn bind(&mut self, reference: ObjRef, value: Value) {
            self.objects.insert(reference.0, value);
        }

        fn resolve_type_name(&mut self, name: &str) -> Result<SourceType> {
            self.types
                .parse(name)?
                .ok_or_else(|| CodecError::Recognition(format!("unknown type: {name}")).into())
        }
    }

    pub(crate) fn encode_value(codec: &Conversion, value: &Value) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
        let mut refs = MemoryRefs::default();
        encode_with(codec, value, &mut refs)
    }

    pub(crate) fn encode_with(
        codec: &Conversion,
        value: &Value,
        refs: &mut MemoryRefs,
    ) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
        let mut session = WriteSession::new();
        let mut buf = vec![0; codec.size()];
        let mut cx = EncodeContext {
            session: &mut session,
            refs,
        };
        codec.encode(&mut buf, value, &mut cx)?;
        Ok((buf, session.into_heap()))
    }

    pub(crate) fn decode_value(codec: &Conversion, buf: &[u8], heap: &[Vec<u8>]) -> Result<Value> {
        let mut refs = MemoryRefs::default();
        decode_with(codec, buf, heap, &mut refs)
    }

    pub(crate) fn decode_with(
        codec: &Conversion,
        buf: &[u8],
        heap: &[Vec<u8>],
        refs: &mut MemoryRefs,
    ) -> Result<Value> {
        let mut cx = DecodeContext::new(heap, refs, None);
        codec.decode(buf, &mut cx)
    }
}
