//! Stowage
//!
//! A file session: one container, the datatypes committed to it, and the local type table.
//! This is the main data structure exposed by the library.
//!

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;

use crate::codec::{
    get_or_build, CodecError, Datatype, DatatypeHandle, DatatypeRegistry, DecodeContext,
    EncodeContext, ReferenceReader, ReferenceWriter, WriteSession, EMPTY_ATTRIBUTE,
    MUTABLE_ATTRIBUTE, NAME_ATTRIBUTE, TYPES_NAMESPACE,
};
use crate::io::{
    Address, Attribute, Container, ContainerFile, MemoryContainer, ObjRef, StoredObject, ROOT,
};
use crate::types::{InlinePolicy, SourceType, TypeTable, Value};

/// Root attribute recording [`InlinePolicy::tuples`].
pub const INLINE_TUPLES_ATTRIBUTE: &str = "inline_tuples";

/// Root attribute recording [`InlinePolicy::immutables`].
pub const INLINE_IMMUTABLES_ATTRIBUTE: &str = "inline_immutables";

/// A datatype committed to a container, as listed by [`Stowage::committed`].
#[derive(Clone, Debug, PartialEq)]
pub struct CommittedDatatype {
    /// Sequential index.
    pub index: i64,
    /// Address within the container.
    pub address: Address,
    /// Fully-qualified name of the type it was committed for.
    pub name: Option<String>,
    /// The datatype.
    pub datatype: Datatype,
    /// Committed for a zero-field type?
    pub empty: bool,
    /// Committed for a mutable record type?
    pub mutable: bool,
}

/// A file session.
pub struct Stowage<C: Container = ContainerFile> {
    container: C,
    registry: DatatypeRegistry,
    types: TypeTable,
    policy: InlinePolicy,
}

impl Stowage<MemoryContainer> {
    /// A session over a fresh in-memory container.
    pub fn in_memory(types: TypeTable, policy: InlinePolicy) -> Result<Self> {
        Self::with_container(MemoryContainer::new(), types, policy)
    }
}

impl Stowage<ContainerFile> {
    /// Create a new container file at the specified path.
    pub async fn try_new<P: AsRef<Path>>(
        origin: P,
        types: TypeTable,
        policy: InlinePolicy,
    ) -> Result<Self> {
        let path: &Path = origin.as_ref();

        tracing::info!("Creating stowage at: {}", path.display());

        let file = ContainerFile::try_new(path).await?;
        let mut this = Self::with_container(file, types, policy)?;
        this.flush_to_disk().await?;
        Ok(this)
    }

    /// Open an existing container file at the specified path.
    ///
    /// The inline policy recorded in the file takes precedence over `policy`.
    pub async fn try_open<P: AsRef<Path>>(
        origin: P,
        types: TypeTable,
        policy: InlinePolicy,
    ) -> Result<Self> {
        let path: &Path = origin.as_ref();

        tracing::info!("Opening stowage at: {}", path.display());

        let file = ContainerFile::try_open(path).await?;
        Self::with_container(file, types, policy)
    }

    /// Write everything to disk.
    pub async fn flush_to_disk(&mut self) -> Result<()> {
        self.container.flush().await
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        self.container.path()
    }
}

impl<C: Container> Stowage<C> {
    /// A session over `container`, which may already hold data.
    pub fn with_container(mut container: C, types: TypeTable, policy: InlinePolicy) -> Result<Self> {
        let flag = |container: &C, key: &str| -> Result<Option<bool>> {
            Ok(container.read_attribute(ROOT, key)?.and_then(|a| a.as_bool()))
        };
        let recorded = (
            flag(&container, INLINE_TUPLES_ATTRIBUTE)?,
            flag(&container, INLINE_IMMUTABLES_ATTRIBUTE)?,
        );
        let policy = match recorded {
            (Some(tuples), Some(immutables)) => {
                let recorded = InlinePolicy { tuples, immutables };
                if recorded != policy {
                    tracing::info!("Using the inline policy recorded in the container: {recorded:?}");
                }
                recorded
            }
            _ => {
                container.write_attribute(
                    ROOT,
                    INLINE_TUPLES_ATTRIBUTE,
                    Attribute::Bool(policy.tuples),
                )?;
                container.write_attribute(
                    ROOT,
                    INLINE_IMMUTABLES_ATTRIBUTE,
                    Attribute::Bool(policy.immutables),
                )?;
                policy
            }
        };
        let registry = DatatypeRegistry::open(policy, &container)?;
        Ok(Self {
            container,
            registry,
            types,
            policy,
        })
    }

    /// The inline policy of this container.
    pub fn policy(&self) -> InlinePolicy {
        self.policy
    }

    /// The local type table.
    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    /// The local type table, for registering types.
    pub fn types_mut(&mut self) -> &mut TypeTable {
        &mut self.types
    }

    /// The underlying container.
    pub fn container(&self) -> &C {
        &self.container
    }

    /// Store `value` and bind it to `name`. Rebinding a name replaces the link.
    pub fn write(&mut self, name: &str, value: &Value) -> Result<ObjRef> {
        let reference = self.write_value(value)?;
        self.container.link(name, reference)?;
        tracing::debug!("Stored {name} as object {}", reference.0);
        Ok(reference)
    }

    /// Store `value`, and everything it refers to, as new objects.
    pub fn write_value(&mut self, value: &Value) -> Result<ObjRef> {
        let mut writer = Writer {
            container: &mut self.container,
            registry: &mut self.registry,
            policy: self.policy,
            written: HashMap::new(),
        };
        writer.write_reference(value)
    }

    /// Read the value bound to `name`.
    pub fn read(&mut self, name: &str) -> Result<Option<Value>> {
        match self.container.lookup(name) {
            Some(reference) => self.read_reference(reference).map(Some),
            None => Ok(None),
        }
    }

    /// Read a stored object, and everything it refers to.
    ///
    /// An object reached more than once is materialized once, so shared and cyclic structure
    /// is preserved.
    pub fn read_reference(&mut self, reference: ObjRef) -> Result<Value> {
        let mut reader = Reader {
            container: &mut self.container,
            registry: &mut self.registry,
            types: &mut self.types,
            policy: self.policy,
            materialized: HashMap::new(),
        };
        reader.read_reference(reference)
    }

    /// Datatype of a field of type `ty`.
    pub fn field_datatype(&mut self, ty: &SourceType, commit: bool) -> Result<DatatypeHandle> {
        self.registry
            .field_datatype(&mut self.container, ty, commit)
    }

    /// Datatype of a stored value of type `ty`.
    pub fn value_datatype(&mut self, ty: &SourceType, commit: bool) -> Result<DatatypeHandle> {
        self.registry
            .value_datatype(&mut self.container, ty, commit)
    }

    /// Encode `value` into `buf`, staging variable-length data in `session`. Values it refers
    /// to are stored as objects.
    pub fn encode(&mut self, buf: &mut [u8], value: &Value, session: &mut WriteSession) -> Result<()> {
        let ty = value.source_type();
        self.registry
            .value_datatype(&mut self.container, &ty, true)?;
        let codec = get_or_build(&ty, self.policy)?;
        let mut writer = Writer {
            container: &mut self.container,
            registry: &mut self.registry,
            policy: self.policy,
            written: HashMap::new(),
        };
        let mut cx = EncodeContext {
            session,
            refs: &mut writer,
        };
        codec.encode(buf, value, &mut cx)
    }

    /// Decode a value of type `ty` from `buf`, with `heap` holding its variable-length data.
    pub fn decode(&mut self, ty: &SourceType, buf: &[u8], heap: &[Vec<u8>]) -> Result<Value> {
        let codec = get_or_build(ty, self.policy)?;
        let mut reader = Reader {
            container: &mut self.container,
            registry: &mut self.registry,
            types: &mut self.types,
            policy: self.policy,
            materialized: HashMap::new(),
        };
        let mut cx = DecodeContext::new(heap, &mut reader, None);
        codec.decode(buf, &mut cx)
    }

    /// Decode a value of type `ty` from `buf` into `dest`. Pointer-free immutable records are
    /// overwritten in place when `dest` is not shared.
    pub fn decode_into(
        &mut self,
        ty: &SourceType,
        buf: &[u8],
        heap: &[Vec<u8>],
        dest: &mut Value,
    ) -> Result<()> {
        let codec = get_or_build(ty, self.policy)?;
        let mut reader = Reader {
            container: &mut self.container,
            registry: &mut self.registry,
            types: &mut self.types,
            policy: self.policy,
            materialized: HashMap::new(),
        };
        let mut cx = DecodeContext::new(heap, &mut reader, None);
        codec.decode_into(buf, dest, &mut cx)
    }

    /// The source type of the datatype committed at `address`.
    pub fn resolve_type(&mut self, address: Address) -> Result<SourceType> {
        self.registry
            .resolve_type(&mut self.container, &mut self.types, address)
    }

    /// Every committed datatype, in index order.
    pub fn committed(&self) -> Result<Vec<CommittedDatatype>> {
        let flag = |address: Address, key: &str| -> Result<bool> {
            Ok(self
                .container
                .read_attribute(address, key)?
                .and_then(|a| a.as_bool())
                .unwrap_or(false))
        };
        let mut committed = self
            .container
            .enumerate(TYPES_NAMESPACE)?
            .into_iter()
            .map(|(name, address)| -> Result<CommittedDatatype> {
                let index = name.parse::<i64>().map_err(|_| {
                    CodecError::Recognition(format!("invalid committed datatype name: {name}"))
                })?;
                Ok(CommittedDatatype {
                    index,
                    address,
                    name: self
                        .container
                        .read_attribute(address, NAME_ATTRIBUTE)?
                        .and_then(|a| a.as_str().map(str::to_string)),
                    datatype: self.container.datatype(address)?,
                    empty: flag(address, EMPTY_ATTRIBUTE)?,
                    mutable: flag(address, MUTABLE_ATTRIBUTE)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        committed.sort_by_key(|c| c.index);
        Ok(committed)
    }

    /// Every named root link.
    pub fn links(&self) -> Vec<(String, ObjRef)> {
        self.container.links()
    }
}

/// Stores referenced values, once per instance.
struct Writer<'a> {
    container: &'a mut dyn Container,
    registry: &'a mut DatatypeRegistry,
    policy: InlinePolicy,
    written: HashMap<usize, ObjRef>,
}

impl ReferenceWriter for Writer<'_> {
    fn write_reference(&mut self, value: &Value) -> Result<ObjRef> {
        let identity = value.identity();
        if let Some(reference) = identity.and_then(|id| self.written.get(&id)) {
            return Ok(*reference);
        }
        let ty = value.source_type();
        let handle = self.registry.value_datatype(self.container, &ty, true)?;
        let codec = get_or_build(&ty, self.policy)?;

        // Reserved before encoding, so cycles back to this value find it
        let reference = self.container.reserve_object();
        if let Some(id) = identity {
            self.written.insert(id, reference);
        }

        let mut session = WriteSession::new();
        let mut data = vec![0; handle.datatype.size().max(codec.size())];
        let mut cx = EncodeContext {
            session: &mut session,
            refs: self,
        };
        codec.encode(&mut data, value, &mut cx)?;
        self.container.write_object(
            reference,
            StoredObject {
                datatype: handle.object_datatype(),
                data,
                heap: session.into_heap(),
            },
        )?;
        Ok(reference)
    }

    fn commit_type(&mut self, ty: &SourceType) -> Result<()> {
        for named in ty.named_user_types() {
            // Reconstructed types were read from this container, so they are committed already
            if !named.is_reconstructed() {
                self.registry.value_datatype(self.container, named, true)?;
            }
        }
        Ok(())
    }
}

/// Materializes stored objects, once per reference.
struct Reader<'a> {
    container: &'a mut dyn Container,
    registry: &'a mut DatatypeRegistry,
    types: &'a mut TypeTable,
    policy: InlinePolicy,
    materialized: HashMap<ObjRef, Value>,
}

impl ReferenceReader for Reader<'_> {
    fn read_reference(&mut self, reference: ObjRef) -> Result<Value> {
        if let Some(value) = self.materialized.get(&reference) {
            return Ok(value.clone());
        }
        let object = self.container.read_object(reference)?;
        let ty = self
            .registry
            .resolve_object(self.container, self.types, &object.datatype)?;
        let codec = get_or_build(&ty, self.policy)?;
        let mut cx = DecodeContext::new(&object.heap, self, Some(reference));
        let value = codec.decode(&object.data, &mut cx)?;
        Ok(self
            .materialized
            .entry(reference)
            .or_insert(value)
            .clone())
    }

    fn bind(&mut self, reference: ObjRef, value: Value) {
        self.materialized.insert(reference, value);
    }

    fn resolve_type_name(&mut self, name: &str) -> Result<SourceType> {
        self.registry
            .resolve_name(self.container, self.types, name)
    }
}

#[cfg(test)]
mod tests;
