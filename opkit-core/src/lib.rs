//! opkit-core: finalizer-aware event dispatch for a single watched resource kind.
//!
//! An [`EventDispatcher`] takes one watch event, runs the kind's
//! [`Controller`], keeps the controller's finalizer on the resource in step
//! with the outcome, and persists at most one write through a
//! [`ResourceFacade`]. The [`EventLoop`] is the delivery side: it serializes
//! events per resource identity and owns all retry decisions.

pub mod audit;
pub mod controller;
pub mod dispatcher;
pub mod finalizer;
pub mod model;
pub mod runtime;
pub mod store;

pub use audit::{DispatchObserver, NoopObserver, TracingObserver, create_observer};
pub use controller::Controller;
pub use dispatcher::{DispatchError, DispatcherConfig, Disposition, EventDispatcher};
pub use finalizer::{DEFAULT_FINALIZER, FinalizerManager};
pub use model::{Action, ObjectMeta, ResourceInstance, ResourceKey};
pub use runtime::{EventLoop, EventLoopConfig, LoopStats, forward_watch};
pub use store::{
    DeleteOutcome, MemoryStore, PatchScope, ResourceFacade, ResourceLookup, StoreError, WatchEvent,
};
