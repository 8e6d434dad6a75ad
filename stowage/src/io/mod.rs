//! Containers
//!
//! A container stores committed datatypes (grouped by namespace), attributes, and objects.
//! [`MemoryContainer`] keeps everything in memory. [`ContainerFile`] persists a memory image to
//! a block file.

// Re-export
pub use self::container::Address;
pub use self::container::Attribute;
pub use self::container::Container;
pub use self::container::ContainerError;
pub use self::container::ObjRef;
pub use self::container::ObjectDatatype;
pub use self::container::StoredObject;
pub use self::container::NULL_REFERENCE;
pub use self::container::ROOT;
pub use self::file::ContainerFile;
pub use self::memory::MemoryContainer;

mod container;
mod file;
mod memory;
