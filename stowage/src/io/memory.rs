use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::container::{
    Address, Attribute, Container, ContainerError, ObjRef, StoredObject, NULL_REFERENCE, ROOT,
};
use crate::codec::Datatype;

/// Everything except the objects themselves.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Catalog {
    next_address: Address,
    next_object: u64,
    datatypes: BTreeMap<Address, Datatype>,
    namespaces: BTreeMap<String, BTreeMap<String, Address>>,
    attributes: BTreeMap<Address, BTreeMap<String, Attribute>>,
    links: BTreeMap<String, ObjRef>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            next_address: ROOT + 1,
            next_object: NULL_REFERENCE.0 + 1,
            datatypes: BTreeMap::new(),
            namespaces: BTreeMap::new(),
            attributes: BTreeMap::new(),
            links: BTreeMap::new(),
        }
    }
}

/// A container held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryContainer {
    pub(crate) catalog: Catalog,
    objects: BTreeMap<u64, Option<StoredObject>>,
    dirty: BTreeSet<u64>,
}

impl MemoryContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(catalog: Catalog, objects: BTreeMap<u64, StoredObject>) -> Self {
        Self {
            catalog,
            objects: objects.into_iter().map(|(k, v)| (k, Some(v))).collect(),
            dirty: BTreeSet::new(),
        }
    }

    /// Number of objects written.
    pub fn object_count(&self) -> usize {
        self.objects.values().filter(|o| o.is_some()).count()
    }

    /// Objects written since the last call, and forget them.
    pub(crate) fn take_dirty(&mut self) -> Vec<(u64, &StoredObject)> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|idx| {
                self.objects
                    .get(&idx)
                    .and_then(|o| o.as_ref())
                    .map(|o| (idx, o))
            })
            .collect()
    }
}

impl Container for MemoryContainer {
    fn commit(&mut self, namespace: &str, name: &str, datatype: &Datatype) -> Result<Address> {
        let names = self
            .catalog
            .namespaces
            .entry(namespace.to_string())
            .or_default();
        if names.contains_key(name) {
            return Err(ContainerError::DuplicateName(format!("{namespace}/{name}")).into());
        }
        let address = self.catalog.next_address;
        self.catalog.next_address += 1;
        names.insert(name.to_string(), address);
        self.catalog.datatypes.insert(address, datatype.clone());
        Ok(address)
    }

    fn datatype(&self, address: Address) -> Result<Datatype> {
        self.catalog
            .datatypes
            .get(&address)
            .cloned()
            .ok_or_else(|| ContainerError::LostDatatype(address).into())
    }

    fn enumerate(&self, namespace: &str) -> Result<Vec<(String, Address)>> {
        Ok(self
            .catalog
            .namespaces
            .get(namespace)
            .map(|names| {
                names
                    .iter()
                    .map(|(name, address)| (name.clone(), *address))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn read_attribute(&self, address: Address, key: &str) -> Result<Option<Attribute>> {
        if address != ROOT && !self.catalog.datatypes.contains_key(&address) {
            return Err(ContainerError::LostDatatype(address).into());
        }
        Ok(self
            .catalog
            .attributes
            .get(&address)
            .and_then(|attributes| attributes.get(key))
            .cloned())
    }

    fn write_attribute(&mut self, address: Address, key: &str, value: Attribute) -> Result<()> {
        if address != ROOT && !self.catalog.datatypes.contains_key(&address) {
            return Err(ContainerError::LostDatatype(address).into());
        }
        self.catalog
            .attributes
            .entry(address)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn reserve_object(&mut self) -> ObjRef {
        let reference = ObjRef(self.catalog.next_object);
        self.catalog.next_object += 1;
        self.objects.insert(reference.0, None);
        reference
    }

    fn write_object(&mut self, reference: ObjRef, object: StoredObject) -> Result<()> {
        let slot = self
            .objects
            .get_mut(&reference.0)
            .ok_or(ContainerError::DanglingReference(reference.0))?;
        *slot = Some(object);
        self.dirty.insert(reference.0);
        Ok(())
    }

    fn read_object(&self, reference: ObjRef) -> Result<StoredObject> {
        self.objects
            .get(&reference.0)
            .and_then(|o| o.clone())
            .ok_or_else(|| ContainerError::LostObject(reference.0).into())
    }

    fn link(&mut self, name: &str, reference: ObjRef) -> Result<()> {
        if !matches!(self.objects.get(&reference.0), Some(Some(_))) {
            return Err(ContainerError::DanglingReference(reference.0).into());
        }
        self.catalog.links.insert(name.to_string(), reference);
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<ObjRef> {
        self.catalog.links.get(name).copied()
    }

    fn links(&self) -> Vec<(String, ObjRef)> {
        self.catalog
            .links
            .iter()
            .map(|(name, reference)| (name.clone(), *reference))
            .collect()
    }
}
