//! A single-file transactional storage engine: a block-level free-space
//! allocator, a free-space index, and a polymorphic persistent B-Tree, all
//! sharing one buffered-file transaction protocol (`SPEC_FULL.md` §1-§4).
//!
//! Grounded throughout on `examples/original_source/include/thekogans/util/`:
//! `BufferedFile.h`, `FileAllocator.h`, `FileAllocatorBTree.h`, `BTree2.h`,
//! and `BTreeKeys.h`. See `DESIGN.md` for the module-by-module ledger.

pub mod alloc;
pub mod block;
pub mod btree2;
pub mod buffered_file;
pub mod error;
pub mod freetree;
pub mod key;
pub mod serialize;
pub mod txlog;
pub mod value;

pub use alloc::{FileAllocator, Flusher, Pool};
pub use btree2::BTree2;
pub use buffered_file::{BufferedFile, Participant};
pub use error::{Error, Result};
pub use key::{GuidKey, Key, StringKey};
pub use value::{Bytes, StringArrayValue, Value};
