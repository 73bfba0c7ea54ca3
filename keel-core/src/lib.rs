//! Keel core: the runtime kernel.
//!
//! Applications are composed from declarative building blocks — tasks,
//! resources, events, hooks, middleware, and tags. `run()` walks the
//! registration closure from a root resource, validates the dependency
//! graph, boots resources in dependency order, installs middleware and
//! interceptors, emits the ready signal, and returns a façade for invoking
//! tasks and emitting events. `dispose()` tears everything down in reverse.
//!
//! ```ignore
//! use keel_core::prelude::*;
//!
//! let greet = Task::<String, String>::builder("app.tasks.greet")
//!     .run(|name, _deps, _ctx| async move { Ok(format!("hello {name}")) })
//!     .build();
//!
//! let app = Resource::<(), ()>::builder("app")
//!     .register([Definition::from(&greet)])
//!     .build();
//!
//! let runtime = keel_core::run(app).await?;
//! assert_eq!(runtime.run_task(&greet, "ada".into()).await?, "hello ada");
//! runtime.dispose().await;
//! ```

pub mod builtins;
mod chain;
pub mod defs;
pub mod deps;
pub mod error;
pub mod events;
mod invoker;
pub mod journal;
mod lifecycle;
pub mod logger;
pub mod prelude;
pub mod runtime;
pub mod schema;
mod store;
pub mod types;
mod validate;

pub use builtins::{
    debug_tag, hidden_from_global_hooks_tag, ready_event, system_tag, tunnel_tag, TunnelCfg,
    TunnelMode, TunnelValue,
};
pub use defs::{
    AppliedTag, AsyncContext, CallContext, DefKind, Definition, DepRef, ErrorKind,
    ErrorKindBuilder, Event, EventBuilder, EventData, Hook, HookBuilder, InitContext, Meta, MwUse,
    Next, RawEventData, RawHookBuilder, Resource, ResourceBuilder, ResourceMiddleware,
    ResourceMwBuilder, ResourceMwCtx, ResourceNext, Tag, TagBuilder, Task, TaskBuilder,
    TaskMiddleware, TaskMwBuilder, TaskMwCtx, TypedNext,
};
pub use deps::{Deps, EventEmitter, TaskCaller};
pub use error::{
    ContractSide, ContractViolation, DisposalError, Error, EventError, GraphIssue, JournalError,
    LifecycleError, Raised, RegistryError, SchemaBoundary, SchemaViolation, ValidationReport,
};
pub use events::{
    EmitInterceptor, EmitNext, EmitOptions, EmitOutcome, EmitReport, FailureMode, HookInterceptor,
    HookNext,
};
pub use journal::{Journal, JournalKey, CANCELLATION};
pub use logger::{init_tracing, LogLevel, LogOptions, Logger, PrintStrategy};
pub use runtime::{
    run, run_with, DebugLevel, EventCycleDetection, Mode, RunOptions, Runtime, StoreView,
    UnhandledError, UnhandledHandler, UnhandledKind,
};
pub use schema::Schema;
pub use types::{AnyValue, BoxFuture, TypeTag};
