#![warn(missing_docs)]
//! Stowage
//!
//! # Implementation Details
//!
//! Provides a type-directed binary codec for storing values from a dynamic object model in a
//! container file.
//!
//! Every stored value has a type (a [`types::SourceType`]). For each type, a binary layout
//! (a [`codec::Datatype`]) is derived and committed into the container under a reserved
//! namespace, with a sequential index. Encode/decode routines are generated once per type and
//! cached for the life of the process.
//!
//! Fields of a record are either stored inline (primitives, strings, pointer-free immutable
//! records) or through an object reference to a separately stored value (mutable records,
//! arrays, dynamically typed slots). References preserve sharing: a value which is referenced
//! twice is stored once and decodes to a single shared instance.
//!
//! If a file is read by a process which does not know a stored record type, a structurally
//! equivalent type is reconstructed from the stored datatype, so the data remains readable.
//!
//! The container itself (a simple block file) is loaded into memory when opened and written
//! back when flushed. At load/store to disk, container metadata is serialized/deserialized
//! using bincode.
//!

pub mod codec;
pub mod io;
mod stowage;
pub mod types;

// Re-export
pub use self::stowage::CommittedDatatype;
pub use self::stowage::Stowage;
pub use self::stowage::INLINE_IMMUTABLES_ATTRIBUTE;
pub use self::stowage::INLINE_TUPLES_ATTRIBUTE;

use bincode::config::AllowTrailing;
use bincode::config::FixintEncoding;
use bincode::config::WithOtherIntEncoding;
use bincode::config::WithOtherTrailing;
use bincode::{DefaultOptions, Options};
use std::sync::LazyLock;

static BINCODER: LazyLock<
    WithOtherIntEncoding<WithOtherTrailing<DefaultOptions, AllowTrailing>, FixintEncoding>,
> = LazyLock::new(|| {
    bincode::DefaultOptions::new()
        .allow_trailing_bytes()
        .with_fixint_encoding()
});
