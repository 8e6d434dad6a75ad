//! Field layout planning
//!
//! Records are packed: each field starts where the previous one ends, with no alignment padding.

use anyhow::Result;

use super::{REFERENCE_SIZE, VL_SLOT_SIZE};
use crate::types::{InlinePolicy, SourceType, StorageTraits};

/// How a field is stored within its parent record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Storage {
    /// The field's data is embedded in the parent record.
    Inline,
    /// The parent record holds an object reference.
    Reference,
}

/// Placement of one field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FieldSlot {
    /// Inline or by reference.
    pub storage: Storage,
    /// Byte offset within the record.
    pub offset: usize,
    /// Bytes occupied.
    pub size: usize,
}

/// Placement of every field of a composite type, plus the total record size.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldLayout {
    slots: Vec<FieldSlot>,
    size: usize,
}

impl FieldLayout {
    /// Plan the layout of `fields` under `policy`.
    pub fn plan(fields: &[SourceType], policy: InlinePolicy) -> Result<Self> {
        let mut slots = Vec::with_capacity(fields.len());
        let mut offset = 0;
        for ty in fields {
            let slot = if ty.stored_inline(policy)? {
                FieldSlot {
                    storage: Storage::Inline,
                    offset,
                    size: inline_size(ty, policy)?,
                }
            } else {
                FieldSlot {
                    storage: Storage::Reference,
                    offset,
                    size: REFERENCE_SIZE,
                }
            };
            offset += slot.size;
            slots.push(slot);
        }
        Ok(Self {
            slots,
            size: offset,
        })
    }

    /// Field slots, in field order.
    pub fn slots(&self) -> &[FieldSlot] {
        &self.slots
    }

    /// Total bytes occupied by the fields. Zero when every field is empty.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Bytes occupied by an inline value of type `ty`.
pub(crate) fn inline_size(ty: &SourceType, policy: InlinePolicy) -> Result<usize> {
    let size = match ty {
        SourceType::Primitive(kind) => kind.size(),
        SourceType::Opaque(opaque) => opaque.size(),
        SourceType::ByteString
        | SourceType::WideString
        | SourceType::Symbol
        | SourceType::BigInt
        | SourceType::BigDecimal
        | SourceType::Type
        | SourceType::Array(_) => VL_SLOT_SIZE,
        SourceType::Tuple(_) | SourceType::Record(_) if ty.is_empty() => 0,
        SourceType::Tuple(_) | SourceType::Record(_) => {
            // field_types is always Some for composites
            let fields = ty.field_types().unwrap_or_default();
            FieldLayout::plan(&fields, policy)?.size()
        }
        SourceType::Named(_)
        | SourceType::Any
        | SourceType::Bottom
        | SourceType::Pointer
        | SourceType::Function => REFERENCE_SIZE,
    };
    Ok(size)
}
