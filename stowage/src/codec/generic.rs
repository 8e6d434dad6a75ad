//! Generic codec generation
//!
//! Composite types (records, tuples) and arrays get codecs assembled from the codecs of their
//! fields. Generated codecs are cached process-wide, keyed by type and inline policy.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, LazyLock, Mutex};

use anyhow::Result;

use super::layout::{FieldLayout, Storage};
use super::special::special_codec;
use super::{
    mismatch, read_slot, read_u64, write_slot, write_u64, Codec, CodecError, Conversion,
    DecodeContext, EncodeContext, VL_SLOT_SIZE,
};
use crate::io::{ObjRef, NULL_REFERENCE};
use crate::types::{Array, InlinePolicy, Record, RecordType, SourceType, StorageTraits, Value};

type CacheKey = (SourceType, InlinePolicy);

/// Longest array a stored slot may claim.
const MAX_ARRAY_LEN: usize = u32::MAX as usize;

static CONVERSIONS: LazyLock<Mutex<HashMap<CacheKey, Conversion>>> =
    LazyLock::new(Default::default);

/// Get the codec for `ty` under `policy`, generating it on first use.
///
/// Generation is deterministic. When two callers race, the first codec cached wins and both
/// get it.
pub fn get_or_build(ty: &SourceType, policy: InlinePolicy) -> Result<Conversion> {
    let key = (ty.clone(), policy);
    if let Some(codec) = lock_cache().get(&key) {
        return Ok(codec.clone());
    }
    // Not holding the lock: generation recurses into field types
    let built = build(ty, policy)?;
    tracing::debug!("Generated codec for {ty}");
    Ok(lock_cache().entry(key).or_insert(built).clone())
}

/// Forget every cached codec.
pub fn reset_codecs() {
    lock_cache().clear();
}

/// Number of cached codecs.
pub fn cached_codecs() -> usize {
    lock_cache().len()
}

fn lock_cache() -> std::sync::MutexGuard<'static, HashMap<CacheKey, Conversion>> {
    CONVERSIONS.lock().unwrap_or_else(|e| e.into_inner())
}

fn build(ty: &SourceType, policy: InlinePolicy) -> Result<Conversion> {
    ty.check_supported()?;
    if let Some(codec) = special_codec(ty) {
        return Ok(codec);
    }
    let codec: Conversion = match ty {
        SourceType::Tuple(_) | SourceType::Record(_) if ty.is_empty() => {
            Arc::new(EmptyCodec { ty: ty.clone() })
        }
        SourceType::Tuple(_) | SourceType::Record(_) => {
            let types = ty.field_types().unwrap_or_default();
            let layout = FieldLayout::plan(&types, policy)?;
            let fields = types
                .into_iter()
                .zip(layout.slots())
                .map(|(field_ty, slot)| FieldCodec::new(field_ty, slot.storage, policy))
                .collect::<Result<Vec<_>>>()?;
            Arc::new(CompositeCodec {
                ty: ty.clone(),
                layout,
                fields,
            })
        }
        SourceType::Array(element) => {
            let storage = if element.stored_inline(policy)? {
                Storage::Inline
            } else {
                Storage::Reference
            };
            Arc::new(ArrayCodec {
                ty: ty.clone(),
                element: FieldCodec::new((**element).clone(), storage, policy)?,
            })
        }
        _ => {
            return Err(CodecError::UnsupportedType(format!(
                "{ty} is only stored by reference"
            ))
            .into())
        }
    };
    Ok(codec)
}

/// How one field (or array element) is encoded.
#[derive(Debug)]
enum FieldCodec {
    Inline(Conversion),
    Reference(SourceType),
}

impl FieldCodec {
    fn new(ty: SourceType, storage: Storage, policy: InlinePolicy) -> Result<Self> {
        match storage {
            Storage::Inline => Ok(FieldCodec::Inline(get_or_build(&ty, policy)?)),
            Storage::Reference => Ok(FieldCodec::Reference(ty)),
        }
    }

    fn size(&self) -> usize {
        match self {
            FieldCodec::Inline(codec) => codec.size(),
            FieldCodec::Reference(_) => super::REFERENCE_SIZE,
        }
    }

    fn encode(
        &self,
        buf: &mut [u8],
        value: Option<&Value>,
        cx: &mut EncodeContext<'_>,
        owner: &SourceType,
        field: &dyn Fn() -> String,
    ) -> Result<()> {
        match (self, value) {
            (FieldCodec::Inline(codec), Some(value)) => codec.encode(buf, value, cx),
            (FieldCodec::Inline(_), None) => Err(CodecError::UnassignedInline {
                owner: owner.qualified_name(),
                field: field(),
            }
            .into()),
            (FieldCodec::Reference(_), None) => write_u64(buf, 0, NULL_REFERENCE.0),
            (FieldCodec::Reference(declared), Some(value)) => {
                if !declared.accepts(&value.source_type()) {
                    return Err(mismatch(declared, value));
                }
                let reference = cx.refs.write_reference(value)?;
                write_u64(buf, 0, reference.0)
            }
        }
    }

    fn decode(&self, buf: &[u8], cx: &mut DecodeContext<'_>) -> Result<Option<Value>> {
        match self {
            FieldCodec::Inline(codec) => codec.decode(buf, cx).map(Some),
            FieldCodec::Reference(_) => {
                let reference = read_u64(buf, 0)?;
                if reference == NULL_REFERENCE.0 {
                    Ok(None)
                } else {
                    cx.refs.read_reference(ObjRef(reference)).map(Some)
                }
            }
        }
    }
}

/// Zero-field records and the empty tuple. Nothing is read or written.
#[derive(Debug)]
struct EmptyCodec {
    ty: SourceType,
}

impl Codec for EmptyCodec {
    fn source_type(&self) -> &SourceType {
        &self.ty
    }

    fn size(&self) -> usize {
        0
    }

    fn encode(&self, _buf: &mut [u8], value: &Value, _cx: &mut EncodeContext<'_>) -> Result<()> {
        if value.source_type() != self.ty {
            return Err(mismatch(&self.ty, value));
        }
        Ok(())
    }

    fn decode(&self, _buf: &[u8], cx: &mut DecodeContext<'_>) -> Result<Value> {
        let binding = cx.claim();
        let value = match &self.ty {
            SourceType::Record(record) => Value::Record(Rc::new(Record::unassigned(record))),
            _ => Value::Tuple(vec![]),
        };
        cx.bind(binding, &value);
        Ok(value)
    }
}

/// Records and tuples with at least one field.
#[derive(Debug)]
struct CompositeCodec {
    ty: SourceType,
    layout: FieldLayout,
    fields: Vec<FieldCodec>,
}

impl CompositeCodec {
    fn field_name(&self, idx: usize) -> String {
        match &self.ty {
            SourceType::Record(record) => record.fields()[idx].name.clone(),
            _ => idx.to_string(),
        }
    }

    fn encode_fields(
        &self,
        buf: &mut [u8],
        values: &[Option<Value>],
        cx: &mut EncodeContext<'_>,
    ) -> Result<()> {
        for (idx, ((field, slot), value)) in self
            .fields
            .iter()
            .zip(self.layout.slots())
            .zip(values)
            .enumerate()
        {
            let out = write_slot(buf, slot.offset, slot.size)?;
            field.encode(out, value.as_ref(), cx, &self.ty, &|| self.field_name(idx))?;
        }
        Ok(())
    }

    fn decode_field(&self, idx: usize, buf: &[u8], cx: &mut DecodeContext<'_>) -> Result<Option<Value>> {
        let slot = self.layout.slots()[idx];
        self.fields[idx].decode(read_slot(buf, slot.offset, slot.size)?, cx)
    }

    fn decode_record(
        &self,
        record: &Arc<RecordType>,
        buf: &[u8],
        cx: &mut DecodeContext<'_>,
    ) -> Result<Value> {
        let binding = cx.claim();
        // Bound before the fields are decoded, so cycles come back to this instance
        let instance = Rc::new(Record::unassigned(record));
        let value = Value::Record(instance.clone());
        cx.bind(binding, &value);
        for idx in 0..self.fields.len() {
            if let Some(field) = self.decode_field(idx, buf, cx)? {
                instance.assign(idx, field)?;
            }
        }
        Ok(value)
    }

    fn decode_tuple(&self, buf: &[u8], cx: &mut DecodeContext<'_>) -> Result<Value> {
        let binding = cx.claim();
        let items = (0..self.fields.len())
            .map(|idx| {
                self.decode_field(idx, buf, cx)?.ok_or_else(|| {
                    CodecError::Recognition(format!(
                        "null reference in element {idx} of {}",
                        self.ty
                    ))
                    .into()
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let value = Value::Tuple(items);
        cx.bind(binding, &value);
        Ok(value)
    }
}

impl Codec for CompositeCodec {
    fn source_type(&self) -> &SourceType {
        &self.ty
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn encode(&self, buf: &mut [u8], value: &Value, cx: &mut EncodeContext<'_>) -> Result<()> {
        match (&self.ty, value) {
            (SourceType::Record(ty), Value::Record(record)) if **record.record_type() == **ty => {
                let fields = record.fields().clone();
                self.encode_fields(buf, &fields, cx)
            }
            (SourceType::Tuple(types), Value::Tuple(items)) if types.len() == items.len() => {
                let fields: Vec<Option<Value>> = items.iter().cloned().map(Some).collect();
                self.encode_fields(buf, &fields, cx)
            }
            _ => Err(mismatch(&self.ty, value)),
        }
    }

    fn decode(&self, buf: &[u8], cx: &mut DecodeContext<'_>) -> Result<Value> {
        match &self.ty {
            SourceType::Record(record) => self.decode_record(record, buf, cx),
            _ => self.decode_tuple(buf, cx),
        }
    }

    fn decode_into(&self, buf: &[u8], dest: &mut Value, cx: &mut DecodeContext<'_>) -> Result<()> {
        // Only pointer-free immutable records are overwritten in place
        if let (SourceType::Record(ty), Value::Record(record)) = (&self.ty, &mut *dest) {
            if self.ty.is_pointer_free() && record.record_type() == ty {
                if let Some(record) = Rc::get_mut(record) {
                    for (idx, slot) in record.fields_mut().iter_mut().enumerate() {
                        self.decode_slot_into(idx, buf, slot, cx)?;
                    }
                    return Ok(());
                }
            }
        }
        *dest = self.decode(buf, cx)?;
        Ok(())
    }
}

impl CompositeCodec {
    fn decode_slot_into(
        &self,
        idx: usize,
        buf: &[u8],
        dest: &mut Option<Value>,
        cx: &mut DecodeContext<'_>,
    ) -> Result<()> {
        let slot = self.layout.slots()[idx];
        let bytes = read_slot(buf, slot.offset, slot.size)?;
        match (&self.fields[idx], dest.as_mut()) {
            (FieldCodec::Inline(codec), Some(existing)) => codec.decode_into(bytes, existing, cx),
            (field, _) => {
                *dest = field.decode(bytes, cx)?;
                Ok(())
            }
        }
    }
}

/// Dynamically sized arrays. The object record is a variable-length slot; the elements are
/// packed into one staged buffer.
#[derive(Debug)]
struct ArrayCodec {
    ty: SourceType,
    element: FieldCodec,
}

impl Codec for ArrayCodec {
    fn source_type(&self) -> &SourceType {
        &self.ty
    }

    fn size(&self) -> usize {
        VL_SLOT_SIZE
    }

    fn encode(&self, buf: &mut [u8], value: &Value, cx: &mut EncodeContext<'_>) -> Result<()> {
        let Value::Array(array) = value else {
            return Err(mismatch(&self.ty, value));
        };
        if value.source_type() != self.ty {
            return Err(mismatch(&self.ty, value));
        }
        let stride = self.element.size();
        let items = array.items().clone();
        let mut payload = vec![0; stride * items.len()];
        for (idx, item) in items.iter().enumerate() {
            let out = write_slot(&mut payload, idx * stride, stride)?;
            self.element
                .encode(out, Some(item), cx, &self.ty, &|| idx.to_string())?;
        }
        let id = cx.session.stage(payload);
        write_u64(buf, 0, id)?;
        write_u64(buf, 8, items.len() as u64)
    }

    fn decode(&self, buf: &[u8], cx: &mut DecodeContext<'_>) -> Result<Value> {
        let SourceType::Array(element) = &self.ty else {
            return Err(CodecError::Recognition(format!("{} is not an array", self.ty)).into());
        };
        let binding = cx.claim();
        let id = read_u64(buf, 0)?;
        let count = read_u64(buf, 8)?;
        let payload = cx.blob(id)?;
        let stride = self.element.size();
        let count = usize::try_from(count)
            .ok()
            .filter(|count| *count <= MAX_ARRAY_LEN)
            .ok_or_else(|| {
                CodecError::Recognition(format!("array slot claims {count} elements"))
            })?;
        if stride.checked_mul(count) != Some(payload.len()) {
            return Err(CodecError::Recognition(format!(
                "array slot claims {count} elements of {stride} bytes, heap holds {} bytes",
                payload.len()
            ))
            .into());
        }
        let array = Rc::new(Array::new(
            (**element).clone(),
            Vec::with_capacity(count.min(payload.len())),
        ));
        let value = Value::Array(array.clone());
        cx.bind(binding, &value);
        for idx in 0..count {
            let item = self
                .element
                .decode(read_slot(payload, idx * stride, stride)?, cx)?
                .ok_or_else(|| {
                    CodecError::Recognition(format!("null reference in element {idx} of {}", self.ty))
                })?;
            array.push(item);
        }
        Ok(value)
    }
}
