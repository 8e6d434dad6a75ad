//! Codecs for built-in categories
//!
//! Fixed-width primitives and opaque types are copied as raw little-endian bytes. Strings and
//! the types stored as committed single-member compounds (wide strings, symbols, big numbers,
//! type values) occupy a variable-length slot whose payload is staged in the write session.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use num_bigint::BigInt;
use rust_decimal::Decimal;

use super::{
    mismatch, read_slot, read_u64, write_slot, write_u64, Codec, CodecError, Conversion,
    DecodeContext, EncodeContext, VL_SLOT_SIZE,
};
use crate::types::{OpaqueType, OpaqueValue, PrimitiveKind, SourceType, Symbol, Value};

const BIGINT_RADIX: u32 = 36;

/// The codec for a built-in category, if `ty` is one.
pub(crate) fn special_codec(ty: &SourceType) -> Option<Conversion> {
    let codec: Conversion = match ty {
        SourceType::Primitive(kind) => Arc::new(PrimitiveCodec {
            ty: ty.clone(),
            kind: *kind,
        }),
        SourceType::ByteString => Arc::new(TextCodec {
            ty: ty.clone(),
            kind: TextKind::String,
        }),
        SourceType::Symbol => Arc::new(TextCodec {
            ty: ty.clone(),
            kind: TextKind::Symbol,
        }),
        SourceType::BigInt => Arc::new(TextCodec {
            ty: ty.clone(),
            kind: TextKind::BigInt,
        }),
        SourceType::BigDecimal => Arc::new(TextCodec {
            ty: ty.clone(),
            kind: TextKind::BigDecimal,
        }),
        SourceType::Type => Arc::new(TextCodec {
            ty: ty.clone(),
            kind: TextKind::Type,
        }),
        SourceType::WideString => Arc::new(WideStringCodec { ty: ty.clone() }),
        SourceType::Opaque(opaque) => Arc::new(OpaqueCodec {
            ty: ty.clone(),
            opaque: opaque.clone(),
        }),
        _ => return None,
    };
    Some(codec)
}

/// Write a variable-length slot referring to a freshly staged buffer.
fn stage_slot(buf: &mut [u8], payload: Vec<u8>, count: usize, cx: &mut EncodeContext<'_>) -> Result<()> {
    let id = cx.session.stage(payload);
    write_u64(buf, 0, id)?;
    write_u64(buf, 8, count as u64)
}

/// Read a variable-length slot, returning the payload and element count.
fn load_slot<'a>(buf: &[u8], cx: &DecodeContext<'a>) -> Result<(&'a [u8], usize)> {
    let id = read_u64(buf, 0)?;
    let count = read_u64(buf, 8)? as usize;
    Ok((cx.blob(id)?, count))
}

#[derive(Debug)]
struct PrimitiveCodec {
    ty: SourceType,
    kind: PrimitiveKind,
}

impl Codec for PrimitiveCodec {
    fn source_type(&self) -> &SourceType {
        &self.ty
    }

    fn size(&self) -> usize {
        self.kind.size()
    }

    fn encode(&self, buf: &mut [u8], value: &Value, _cx: &mut EncodeContext<'_>) -> Result<()> {
        let out = write_slot(buf, 0, self.kind.size())?;
        match (self.kind, value) {
            (PrimitiveKind::Bool, Value::Bool(v)) => out[0] = u8::from(*v),
            (PrimitiveKind::Int8, Value::Int8(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (PrimitiveKind::Int16, Value::Int16(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (PrimitiveKind::Int32, Value::Int32(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (PrimitiveKind::Int64, Value::Int64(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (PrimitiveKind::UInt8, Value::UInt8(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (PrimitiveKind::UInt16, Value::UInt16(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (PrimitiveKind::UInt32, Value::UInt32(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (PrimitiveKind::UInt64, Value::UInt64(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (PrimitiveKind::Float32, Value::Float32(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (PrimitiveKind::Float64, Value::Float64(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (PrimitiveKind::Char, Value::Char(v)) => {
                out.copy_from_slice(&u32::from(*v).to_le_bytes())
            }
            _ => return Err(mismatch(&self.ty, value)),
        }
        Ok(())
    }

    fn decode(&self, buf: &[u8], _cx: &mut DecodeContext<'_>) -> Result<Value> {
        let bytes = read_slot(buf, 0, self.kind.size())?;
        macro_rules! le {
            ($t:ty) => {{
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_le_bytes(raw)
            }};
        }
        let value = match self.kind {
            PrimitiveKind::Bool => Value::Bool(bytes[0] != 0),
            PrimitiveKind::Int8 => Value::Int8(le!(i8)),
            PrimitiveKind::Int16 => Value::Int16(le!(i16)),
            PrimitiveKind::Int32 => Value::Int32(le!(i32)),
            PrimitiveKind::Int64 => Value::Int64(le!(i64)),
            PrimitiveKind::UInt8 => Value::UInt8(le!(u8)),
            PrimitiveKind::UInt16 => Value::UInt16(le!(u16)),
            PrimitiveKind::UInt32 => Value::UInt32(le!(u32)),
            PrimitiveKind::UInt64 => Value::UInt64(le!(u64)),
            PrimitiveKind::Float32 => Value::Float32(le!(f32)),
            PrimitiveKind::Float64 => Value::Float64(le!(f64)),
            PrimitiveKind::Char => {
                let code = le!(u32);
                Value::Char(char::from_u32(code).ok_or_else(|| {
                    CodecError::Recognition(format!("invalid character code: {code:#x}"))
                })?)
            }
        };
        Ok(value)
    }
}

/// Categories stored as one string.
#[derive(Clone, Copy, Debug)]
enum TextKind {
    String,
    Symbol,
    BigInt,
    BigDecimal,
    Type,
}

#[derive(Debug)]
struct TextCodec {
    ty: SourceType,
    kind: TextKind,
}

impl TextCodec {
    fn render(&self, value: &Value) -> Result<String> {
        let text = match (self.kind, value) {
            (TextKind::String, Value::String(s)) => s.clone(),
            (TextKind::Symbol, Value::Symbol(s)) => s.as_str().to_string(),
            (TextKind::BigInt, Value::BigInt(n)) => n.to_str_radix(BIGINT_RADIX),
            (TextKind::BigDecimal, Value::BigDecimal(d)) => d.to_string(),
            (TextKind::Type, Value::Type(ty)) => ty.qualified_name(),
            _ => return Err(mismatch(&self.ty, value)),
        };
        Ok(text)
    }

    fn parse(&self, text: &str, cx: &mut DecodeContext<'_>) -> Result<Value> {
        let value = match self.kind {
            TextKind::String => Value::String(text.to_string()),
            TextKind::Symbol => Value::Symbol(Symbol::intern(text)),
            TextKind::BigInt => Value::BigInt(
                BigInt::parse_bytes(text.as_bytes(), BIGINT_RADIX).ok_or_else(|| {
                    CodecError::Recognition(format!("invalid integer text: {text}"))
                })?,
            ),
            TextKind::BigDecimal => Value::BigDecimal(Decimal::from_str(text).map_err(|e| {
                CodecError::Recognition(format!("invalid decimal text {text}: {e}"))
            })?),
            TextKind::Type => Value::Type(cx.refs.resolve_type_name(text)?),
        };
        Ok(value)
    }
}

impl Codec for TextCodec {
    fn source_type(&self) -> &SourceType {
        &self.ty
    }

    fn size(&self) -> usize {
        VL_SLOT_SIZE
    }

    fn encode(&self, buf: &mut [u8], value: &Value, cx: &mut EncodeContext<'_>) -> Result<()> {
        let text = self.render(value)?.into_bytes();
        if let Value::Type(ty) = value {
            cx.refs.commit_type(ty)?;
        }
        let len = text.len();
        stage_slot(buf, text, len, cx)
    }

    fn decode(&self, buf: &[u8], cx: &mut DecodeContext<'_>) -> Result<Value> {
        let (payload, len) = load_slot(buf, cx)?;
        if payload.len() != len {
            return Err(CodecError::Recognition(format!(
                "string slot claims {len} bytes, heap holds {}",
                payload.len()
            ))
            .into());
        }
        let text = std::str::from_utf8(payload)
            .map_err(|e| CodecError::Recognition(format!("invalid string data: {e}")))?;
        self.parse(text, cx)
    }
}

#[derive(Debug)]
struct WideStringCodec {
    ty: SourceType,
}

impl Codec for WideStringCodec {
    fn source_type(&self) -> &SourceType {
        &self.ty
    }

    fn size(&self) -> usize {
        VL_SLOT_SIZE
    }

    fn encode(&self, buf: &mut [u8], value: &Value, cx: &mut EncodeContext<'_>) -> Result<()> {
        let Value::WideString(chars) = value else {
            return Err(mismatch(&self.ty, value));
        };
        let payload = chars
            .iter()
            .flat_map(|c| u32::from(*c).to_le_bytes())
            .collect();
        stage_slot(buf, payload, chars.len(), cx)
    }

    fn decode(&self, buf: &[u8], cx: &mut DecodeContext<'_>) -> Result<Value> {
        let (payload, count) = load_slot(buf, cx)?;
        if count.checked_mul(4) != Some(payload.len()) {
            return Err(CodecError::Recognition(format!(
                "wide string slot claims {count} characters, heap holds {} bytes",
                payload.len()
            ))
            .into());
        }
        let chars = payload
            .chunks_exact(4)
            .map(|chunk| {
                let code = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                char::from_u32(code).ok_or_else(|| {
                    CodecError::Recognition(format!("invalid character code: {code:#x}")).into()
                })
            })
            .collect::<Result<Vec<char>>>()?;
        Ok(Value::WideString(chars))
    }
}

#[derive(Debug)]
struct OpaqueCodec {
    ty: SourceType,
    opaque: Arc<OpaqueType>,
}

impl Codec for OpaqueCodec {
    fn source_type(&self) -> &SourceType {
        &self.ty
    }

    fn size(&self) -> usize {
        self.opaque.size()
    }

    fn encode(&self, buf: &mut [u8], value: &Value, _cx: &mut EncodeContext<'_>) -> Result<()> {
        match value {
            Value::Opaque(v) if *v.ty == *self.opaque && v.bytes.len() == self.opaque.size() => {
                write_slot(buf, 0, self.opaque.size())?.copy_from_slice(&v.bytes);
                Ok(())
            }
            _ => Err(mismatch(&self.ty, value)),
        }
    }

    fn decode(&self, buf: &[u8], _cx: &mut DecodeContext<'_>) -> Result<Value> {
        Ok(Value::Opaque(OpaqueValue {
            ty: self.opaque.clone(),
            bytes: read_slot(buf, 0, self.opaque.size())?.to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::{decode_value, encode_value};

    fn round_trip(ty: &SourceType, value: &Value) -> Value {
        let codec = special_codec(ty).expect("special type");
        let (buf, heap) = encode_value(&codec, value).expect("encodes");
        assert_eq!(buf.len(), codec.size());
        decode_value(&codec, &buf, &heap).expect("decodes")
    }

    #[test]
    fn it_round_trips_primitives() {
        for value in [
            Value::Bool(true),
            Value::Int8(-7),
            Value::Int16(-300),
            Value::Int32(1 << 20),
            Value::Int64(i64::MIN),
            Value::UInt8(200),
            Value::UInt16(60_000),
            Value::UInt32(u32::MAX),
            Value::UInt64(u64::MAX),
            Value::Float32(1.5),
            Value::Float64(-0.25),
            Value::Char('λ'),
        ] {
            assert_eq!(round_trip(&value.source_type(), &value), value);
        }
    }

    #[test]
    fn it_writes_little_endian() {
        let codec = special_codec(&PrimitiveKind::Int32.into()).expect("special type");
        let (buf, _) = encode_value(&codec, &Value::Int32(0x0102_0304)).expect("encodes");
        assert_eq!(buf, vec![4, 3, 2, 1]);
    }

    #[test]
    fn it_round_trips_text_categories() {
        let big = BigInt::parse_bytes(b"-123456789012345678901234567890", 10).expect("parses");
        for value in [
            Value::string("hello"),
            Value::string(""),
            Value::WideString("grüße".chars().collect()),
            Value::symbol("velocity"),
            Value::BigInt(big),
            Value::BigDecimal(Decimal::from_str("-3.14159").expect("parses")),
            Value::Type(SourceType::array(PrimitiveKind::Int64)),
        ] {
            assert_eq!(round_trip(&value.source_type(), &value), value);
        }
    }

    #[test]
    fn it_interns_decoded_symbols() {
        let decoded = round_trip(&SourceType::Symbol, &Value::symbol("spin"));
        let Value::Symbol(symbol) = decoded else {
            panic!("not a symbol: {decoded}");
        };
        assert!(symbol.same_interned(&Symbol::intern("spin")));
    }

    #[test]
    fn it_stores_bigints_in_radix_36() {
        let codec = special_codec(&SourceType::BigInt).expect("special type");
        let (_, heap) = encode_value(&codec, &Value::BigInt(BigInt::from(35))).expect("encodes");
        assert_eq!(heap, vec![b"z".to_vec()]);
    }

    #[test]
    fn it_round_trips_opaque_values() {
        let ty: SourceType = OpaqueType::new("hw::Mac", 6).into();
        let SourceType::Opaque(opaque) = &ty else {
            panic!("not opaque");
        };
        let value = Value::Opaque(OpaqueValue {
            ty: opaque.clone(),
            bytes: vec![0xde, 0xad, 0xbe, 0xef, 0, 1],
        });
        assert_eq!(round_trip(&ty, &value), value);
        let short = Value::Opaque(OpaqueValue {
            ty: opaque.clone(),
            bytes: vec![1],
        });
        let codec = special_codec(&ty).expect("special type");
        assert!(encode_value(&codec, &short).is_err());
    }

    #[test]
    fn it_rejects_mismatched_values() {
        let codec = special_codec(&SourceType::ByteString).expect("special type");
        let err = encode_value(&codec, &Value::Int64(1)).expect_err("mismatch");
        assert!(matches!(
            err.downcast_ref::<CodecError>(),
            Some(CodecError::ValueMismatch { .. })
        ));
    }

    #[test]
    fn it_rejects_truncated_records() {
        let codec = special_codec(&PrimitiveKind::Int64.into()).expect("special type");
        let err = decode_value(&codec, &[1, 2, 3], &[]).expect_err("truncated");
        assert!(matches!(
            err.downcast_ref::<CodecError>(),
            Some(CodecError::Recognition(_))
        ));
    }

    #[test]
    fn it_rejects_corrupt_wide_string_lengths() {
        let codec = special_codec(&SourceType::WideString).expect("special type");
        let mut slot = vec![0; VL_SLOT_SIZE];
        slot[8..].copy_from_slice(&(1u64 << 62).to_le_bytes());
        let err = decode_value(&codec, &slot, &[vec![]]).expect_err("corrupt");
        assert!(matches!(
            err.downcast_ref::<CodecError>(),
            Some(CodecError::Recognition(_))
        ));
    }

    #[test]
    fn it_has_no_codec_for_composites() {
        assert!(special_codec(&SourceType::Tuple(vec![])).is_none());
        assert!(special_codec(&SourceType::Any).is_none());
        assert!(special_codec(&SourceType::Pointer).is_none());
    }
}
