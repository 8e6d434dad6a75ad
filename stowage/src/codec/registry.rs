//! Datatype registry
//!
//! Maps source types to committed datatypes, and committed datatypes back to source types, for
//! one container. Each type is committed at most once per container, under
//! [`TYPES_NAMESPACE`] with a zero-padded sequential index.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;

use super::datatype::{mangle, Datatype};
use super::layout::FieldLayout;
use super::reconstruct::reconstruct;
use super::{CodecError, EMPTY_ATTRIBUTE, MUTABLE_ATTRIBUTE, NAME_ATTRIBUTE, TYPES_NAMESPACE};
use crate::io::{Address, Attribute, Container, ObjectDatatype};
use crate::types::{InlinePolicy, SourceType, StorageTraits, TypeTable};

/// Size of the stand-in datatype of a zero-field type. Records may not be empty.
const EMPTY_DATATYPE_SIZE: usize = 1;

/// A datatype, bound to the source type it was derived for.
#[derive(Clone, Debug, PartialEq)]
pub struct DatatypeHandle {
    /// The datatype.
    pub datatype: Datatype,
    /// Where it is committed, if it is.
    pub address: Option<Address>,
    /// Committed index if positive; `0` for built-in datatypes; `-1` for a datatype derived
    /// without committing.
    pub index: i64,
}

impl DatatypeHandle {
    fn builtin(datatype: Datatype) -> Self {
        Self {
            datatype,
            address: None,
            index: 0,
        }
    }

    /// Is the datatype committed to the container?
    pub fn is_committed(&self) -> bool {
        self.index > 0
    }

    /// How an object of this datatype records its datatype.
    pub fn object_datatype(&self) -> ObjectDatatype {
        match self.address {
            Some(address) => ObjectDatatype::Committed(address),
            None => ObjectDatatype::Builtin(self.datatype.clone()),
        }
    }
}

/// Committed datatypes of one container.
#[derive(Debug)]
pub struct DatatypeRegistry {
    policy: InlinePolicy,
    by_type: HashMap<SourceType, DatatypeHandle>,
    by_address: HashMap<Address, SourceType>,
    by_index: BTreeMap<i64, Address>,
    by_name: HashMap<String, Address>,
    next_index: i64,
}

impl DatatypeRegistry {
    /// A registry for an empty container.
    pub fn new(policy: InlinePolicy) -> Self {
        Self {
            policy,
            by_type: HashMap::new(),
            by_address: HashMap::new(),
            by_index: BTreeMap::new(),
            by_name: HashMap::new(),
            next_index: 1,
        }
    }

    /// A registry for a container which may already hold committed datatypes. Indices continue
    /// after the largest committed one.
    pub fn open(policy: InlinePolicy, container: &dyn Container) -> Result<Self> {
        let mut registry = Self::new(policy);
        for (name, address) in container.enumerate(TYPES_NAMESPACE)? {
            let index = parse_index(&name)?;
            registry.by_index.insert(index, address);
            if let Some(type_name) = container
                .read_attribute(address, NAME_ATTRIBUTE)?
                .and_then(|a| a.as_str().map(str::to_string))
            {
                registry.by_name.insert(type_name, address);
            }
            registry.next_index = registry.next_index.max(index + 1);
        }
        tracing::debug!(
            "Opened datatype registry: {} committed datatypes",
            registry.by_index.len()
        );
        Ok(registry)
    }

    /// The inline policy used to derive layouts.
    pub fn policy(&self) -> InlinePolicy {
        self.policy
    }

    /// The index the next committed datatype will get.
    pub fn next_index(&self) -> i64 {
        self.next_index
    }

    /// The datatype of a field of type `ty`: a reference for types stored by reference,
    /// otherwise the value datatype.
    pub fn field_datatype(
        &mut self,
        container: &mut dyn Container,
        ty: &SourceType,
        commit: bool,
    ) -> Result<DatatypeHandle> {
        if ty.stored_inline(self.policy)? {
            self.value_datatype(container, ty, commit)
        } else {
            Ok(DatatypeHandle::builtin(Datatype::Reference))
        }
    }

    /// The datatype of a stored value of type `ty`.
    ///
    /// With `commit`, a type seen for the first time is committed, along with every type it
    /// contains. Without, the datatype is derived but nothing is written or cached.
    pub fn value_datatype(
        &mut self,
        container: &mut dyn Container,
        ty: &SourceType,
        commit: bool,
    ) -> Result<DatatypeHandle> {
        ty.check_supported()?;
        match ty {
            SourceType::Any | SourceType::Bottom => {
                return Err(CodecError::UnsupportedType(format!(
                    "{ty} is abstract and has no stored form"
                ))
                .into())
            }
            SourceType::Named(name) => {
                return Err(CodecError::UnsupportedType(format!(
                    "{name} is named by reference and has no stored form of its own"
                ))
                .into())
            }
            SourceType::Primitive(kind) => return Ok(DatatypeHandle::builtin(Datatype::native(*kind))),
            SourceType::ByteString => return Ok(DatatypeHandle::builtin(Datatype::create_string())),
            _ => (),
        }
        if ty.is_reconstructed() {
            return Err(CodecError::UnsupportedType(format!(
                "{ty} was reconstructed from stored data and cannot be written"
            ))
            .into());
        }
        if let Some(handle) = self.by_type.get(ty) {
            return Ok(handle.clone());
        }
        let name = ty.qualified_name();
        if commit {
            // Committed by an earlier session
            if let Some(address) = self.by_name.get(&name).copied() {
                return self.adopt(container, ty, address);
            }
        }
        let datatype = self.derive(container, ty, commit)?;
        if !commit {
            return Ok(DatatypeHandle {
                datatype,
                address: None,
                index: -1,
            });
        }

        let index = self.next_index;
        self.next_index += 1;
        let address = container.commit(TYPES_NAMESPACE, &format!("{index:08}"), &datatype)?;
        container.write_attribute(address, NAME_ATTRIBUTE, Attribute::Str(name.clone()))?;
        if ty.is_empty() {
            container.write_attribute(address, EMPTY_ATTRIBUTE, Attribute::Bool(true))?;
        }
        if let SourceType::Record(record) = ty {
            container.write_attribute(
                address,
                MUTABLE_ATTRIBUTE,
                Attribute::Bool(record.is_mutable()),
            )?;
        }
        tracing::debug!("Committed datatype {index:08} for {name}: {datatype}");

        let handle = DatatypeHandle {
            datatype,
            address: Some(address),
            index,
        };
        self.cache(ty, handle.clone(), name);
        Ok(handle)
    }

    fn cache(&mut self, ty: &SourceType, handle: DatatypeHandle, name: String) {
        if let Some(address) = handle.address {
            self.by_address.insert(address, ty.clone());
            self.by_index.insert(handle.index, address);
            self.by_name.insert(name, address);
        }
        self.by_type.insert(ty.clone(), handle);
    }

    /// Build the datatype of `ty`, which is neither a primitive nor a byte string.
    fn derive(
        &mut self,
        container: &mut dyn Container,
        ty: &SourceType,
        commit: bool,
    ) -> Result<Datatype> {
        let datatype = match ty {
            SourceType::WideString => text_compound(
                "data",
                Datatype::create_variable_length(Datatype::native(
                    crate::types::PrimitiveKind::UInt32,
                )),
            )?,
            SourceType::Symbol | SourceType::Type => text_compound("name", Datatype::create_string())?,
            SourceType::BigInt | SourceType::BigDecimal => {
                text_compound("text", Datatype::create_string())?
            }
            SourceType::Opaque(opaque) => Datatype::create_opaque(opaque.size()),
            SourceType::Tuple(_) | SourceType::Record(_) if ty.is_empty() => {
                Datatype::create_opaque(EMPTY_DATATYPE_SIZE)
            }
            SourceType::Tuple(types) => {
                let names: Vec<String> = (0..types.len()).map(|idx| idx.to_string()).collect();
                self.compound(container, &names, types, commit)?
            }
            SourceType::Record(record) => {
                let names: Vec<String> = record.fields().iter().map(|f| f.name.clone()).collect();
                let types: Vec<SourceType> = record.fields().iter().map(|f| f.ty.clone()).collect();
                self.compound(container, &names, &types, commit)?
            }
            SourceType::Array(element) => Datatype::create_variable_length(
                self.field_datatype(container, element, commit)?.datatype,
            ),
            other => {
                return Err(CodecError::UnsupportedType(other.qualified_name()).into());
            }
        };
        Ok(datatype)
    }

    fn compound(
        &mut self,
        container: &mut dyn Container,
        names: &[String],
        types: &[SourceType],
        commit: bool,
    ) -> Result<Datatype> {
        let layout = FieldLayout::plan(types, self.policy)?;
        let mut datatype = Datatype::create_compound(layout.size().max(EMPTY_DATATYPE_SIZE));
        for ((name, ty), slot) in names.iter().zip(types).zip(layout.slots()) {
            let member = self.field_datatype(container, ty, commit)?;
            datatype.insert_member(&mangle(name, member.index), slot.offset, member.datatype)?;
        }
        Ok(datatype)
    }

    /// Bind a local type to a datatype committed by an earlier session, after checking that
    /// the stored layout matches the local definition.
    fn adopt(
        &mut self,
        container: &mut dyn Container,
        ty: &SourceType,
        address: Address,
    ) -> Result<DatatypeHandle> {
        let stored = container.datatype(address)?;
        let derived = self.value_datatype(container, ty, false)?;
        if !stored.layout_eq(&derived.datatype) {
            return Err(CodecError::TypeMismatch(ty.qualified_name()).into());
        }
        let index = container
            .enumerate(TYPES_NAMESPACE)?
            .into_iter()
            .find(|(_, a)| *a == address)
            .map(|(name, _)| parse_index(&name))
            .transpose()?
            .ok_or_else(|| {
                CodecError::Recognition(format!("datatype at {address} is not in {TYPES_NAMESPACE}"))
            })?;
        let handle = DatatypeHandle {
            datatype: stored,
            address: Some(address),
            index,
        };
        self.cache(ty, handle.clone(), ty.qualified_name());
        Ok(handle)
    }

    /// The source type of the datatype committed at `address`.
    ///
    /// The stored type name is looked up in `types`. A type which is not known locally is
    /// reconstructed from the stored datatype.
    pub fn resolve_type(
        &mut self,
        container: &mut dyn Container,
        types: &mut TypeTable,
        address: Address,
    ) -> Result<SourceType> {
        if let Some(ty) = self.by_address.get(&address) {
            return Ok(ty.clone());
        }
        let name = container
            .read_attribute(address, NAME_ATTRIBUTE)?
            .and_then(|a| a.as_str().map(str::to_string))
            .ok_or_else(|| {
                CodecError::Recognition(format!("datatype at {address} has no type name"))
            })?;
        match types.parse(&name)? {
            Some(ty) => {
                self.adopt(container, &ty, address)?;
                Ok(ty)
            }
            None => {
                tracing::warn!("Type {name} is not known, reconstructing it from stored data");
                let stored = container.datatype(address)?;
                let ty = reconstruct(self, container, types, address, &name, &stored)?;
                self.by_address.insert(address, ty.clone());
                Ok(ty)
            }
        }
    }

    /// The source type of an object's datatype.
    pub fn resolve_object(
        &mut self,
        container: &mut dyn Container,
        types: &mut TypeTable,
        datatype: &ObjectDatatype,
    ) -> Result<SourceType> {
        match datatype {
            ObjectDatatype::Committed(address) => self.resolve_type(container, types, *address),
            ObjectDatatype::Builtin(datatype) => Self::resolve_builtin(datatype),
        }
    }

    /// The source type of an uncommitted native datatype.
    pub fn resolve_builtin(datatype: &Datatype) -> Result<SourceType> {
        match datatype {
            Datatype::String { .. } => {
                datatype.check_charset()?;
                Ok(SourceType::ByteString)
            }
            Datatype::Integer { .. } | Datatype::Float { .. } | Datatype::Boolean | Datatype::Character => {
                Ok(SourceType::Primitive(datatype.primitive_kind()?))
            }
            other => Err(CodecError::Recognition(format!(
                "{} datatype {other} is not a built-in",
                other.class_name()
            ))
            .into()),
        }
    }

    /// Address of the datatype committed with `index`.
    pub fn address_of(&self, index: i64) -> Result<Address> {
        self.by_index.get(&index).copied().ok_or_else(|| {
            CodecError::Recognition(format!("no datatype committed with index {index}")).into()
        })
    }

    /// Resolve a fully-qualified type name, reconstructing user types which are not known
    /// locally from the datatypes committed under their names.
    pub fn resolve_name(
        &mut self,
        container: &mut dyn Container,
        types: &mut TypeTable,
        name: &str,
    ) -> Result<SourceType> {
        let mut unknown = vec![];
        types.parse_with(name, &mut |n| {
            unknown.push(n.to_string());
            Ok(None)
        })?;
        for type_name in unknown {
            if types.get_reconstructed(&type_name).is_some() {
                continue;
            }
            let address = self.by_name.get(&type_name).copied().ok_or_else(|| {
                CodecError::Recognition(format!("no datatype is committed for type {type_name}"))
            })?;
            self.resolve_type(container, types, address)?;
        }
        let reconstructed = &*types;
        types
            .parse_with(name, &mut |n| Ok(reconstructed.get_reconstructed(n).cloned()))?
            .ok_or_else(|| CodecError::Recognition(format!("unknown type: {name}")).into())
    }
}

fn text_compound(field: &str, member: Datatype) -> Result<Datatype> {
    let mut datatype = Datatype::create_compound(member.size());
    datatype.insert_member(&mangle(field, 0), 0, member)?;
    Ok(datatype)
}

fn parse_index(name: &str) -> Result<i64> {
    name.parse::<i64>()
        .ok()
        .filter(|index| *index > 0)
        .ok_or_else(|| {
            CodecError::Recognition(format!("invalid committed datatype name: {name}")).into()
        })
}
