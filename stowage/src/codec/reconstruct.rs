//! Schema reconstruction
//!
//! Synthesizes a source type from a committed datatype whose type name is not known locally.
//! Member name suffixes lead back to the committed datatypes of nested types, which are
//! resolved (and if need be reconstructed) in turn.

use anyhow::Result;

use super::datatype::{demangle, Datatype};
use super::registry::DatatypeRegistry;
use super::{CodecError, EMPTY_ATTRIBUTE, MUTABLE_ATTRIBUTE};
use crate::io::{Address, Container};
use crate::types::{
    is_tuple_name, FieldDef, OpaqueType, RecordType, SourceType, TypeTable, ARRAY_MARKER,
};

pub(crate) fn reconstruct(
    registry: &mut DatatypeRegistry,
    container: &mut dyn Container,
    types: &mut TypeTable,
    address: Address,
    name: &str,
    stored: &Datatype,
) -> Result<SourceType> {
    let flag = |key: &str| -> Result<bool> {
        Ok(container
            .read_attribute(address, key)?
            .and_then(|a| a.as_bool())
            .unwrap_or(false))
    };
    let empty = flag(EMPTY_ATTRIBUTE)?;
    let mutable = flag(MUTABLE_ATTRIBUTE)?;

    let ty = match stored {
        Datatype::Opaque { .. } if empty => {
            if is_tuple_name(name) {
                SourceType::Tuple(vec![])
            } else {
                RecordType::reconstructed(name, vec![], mutable).into()
            }
        }
        Datatype::Opaque { size } => OpaqueType::reconstructed(name, *size).into(),
        Datatype::Compound { members, .. } => {
            let mut fields = Vec::with_capacity(members.len());
            for member in members {
                let (field, index) = demangle(&member.name)?;
                let ty = match index {
                    Some(index) => {
                        let nested = registry.address_of(index)?;
                        registry.resolve_type(container, types, nested)?
                    }
                    None => match &member.datatype {
                        Datatype::Reference => SourceType::Any,
                        other => DatatypeRegistry::resolve_builtin(other)?,
                    },
                };
                fields.push(FieldDef {
                    name: field.to_string(),
                    ty,
                });
            }
            if is_tuple_name(name) {
                SourceType::Tuple(fields.into_iter().map(|f| f.ty).collect())
            } else {
                RecordType::reconstructed(name, fields, mutable).into()
            }
        }
        Datatype::VarLen(_) => {
            let element = name
                .strip_prefix(ARRAY_MARKER)
                .and_then(|rest| rest.strip_prefix('<'))
                .and_then(|rest| rest.strip_suffix('>'))
                .ok_or_else(|| {
                    CodecError::Recognition(format!(
                        "variable-length datatype {stored} is not an array: {name}"
                    ))
                })?;
            SourceType::array(registry.resolve_name(container, types, element)?)
        }
        other => {
            return Err(CodecError::Recognition(format!(
                "cannot reconstruct {name} from {} datatype {other}",
                other.class_name()
            ))
            .into())
        }
    };
    if matches!(ty, SourceType::Record(_) | SourceType::Opaque(_)) {
        types.register_reconstructed(ty.clone());
    }
    tracing::warn!("Reconstructed {ty} from stored datatype {stored}");
    Ok(ty)
}
