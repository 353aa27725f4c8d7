#![doc = include_str!(concat!(env!("OUT_DIR"), "/document_README.md"))]

pub mod convert;
mod linked_docs;
mod memory_storage;
pub mod migration;
mod space_doc;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
mod sqlite_storage;
mod storage;
mod types;

pub use linked_docs::LinkedDocManager;
pub use memory_storage::MemoryStorage;
pub use migration::{migrate_document, migrate_in_place};
pub use space_doc::{Cursor, LINKS_MAP_NAME, OBJECTS_MAP_NAME, ResolvedRef, SpaceDoc};
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use sqlite_storage::SqliteStorage;
pub use storage::{CrdtStorage, CrdtUpdate, UpdateOrigin};
pub use types::{ForeignKey, ObjectKind, ObjectMeta, ObjectStructure, ObjectSystem};
