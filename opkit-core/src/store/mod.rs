//! Store facade for the watched resource kind.
//!
//! The dispatcher only ever sees [`ResourceFacade`], which narrows the store
//! down to the two writes it is allowed to make. [`ResourceLookup`] is used by
//! the event loop to re-observe an instance after a version conflict.
//!
//! # Architecture
//!
//! ```text
//! dispatcher.rs → Arc<dyn ResourceFacade>
//!                     ↓
//!               store.patch(&resource, scope)              // unconditional
//!               store.replace_with_version_lock(&resource) // optimistic
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use opkit_core::store::{MemoryStore, ResourceFacade, PatchScope};
//!
//! let store = Arc::new(MemoryStore::new(256));
//! let created = store.create(resource).await?;
//! let patched = store.patch(&created, PatchScope::Finalizers).await?;
//! ```

mod error;
mod event;
mod memory;
mod traits;

pub use error::{Result, StoreError};
pub use event::WatchEvent;
pub use memory::{DeleteOutcome, MemoryStore};
pub use traits::*;
