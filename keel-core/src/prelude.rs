//! Keel prelude — import everything you need with a single `use`.
//!
//! ```ignore
//! use keel_core::prelude::*;
//!
//! let db = Resource::<DbConfig, Pool>::builder("app.resources.db")
//!     .init(|cfg, _deps, _ctx| async move { Pool::connect(&cfg.url).await })
//!     .build();
//!
//! let runtime = run(app).await?;
//! ```

pub use crate::builtins::{system_tag, tunnel_tag, TunnelCfg, TunnelMode, TunnelValue};
pub use crate::defs::{
    AppliedTag, AsyncContext, CallContext, Definition, DepRef, ErrorKind, Event, EventData, Hook,
    InitContext, Meta, MwUse, Next, RawEventData, Resource, ResourceMiddleware, ResourceMwCtx,
    ResourceNext, Tag, Task, TaskMiddleware, TaskMwCtx, TypedNext,
};
pub use crate::deps::{Deps, EventEmitter, TaskCaller};
pub use crate::error::Error;
pub use crate::events::{EmitOptions, EmitOutcome, EmitReport, FailureMode};
pub use crate::journal::{Journal, JournalKey};
pub use crate::logger::{LogLevel, LogOptions, Logger, PrintStrategy};
pub use crate::runtime::{
    run, run_with, DebugLevel, Mode, RunOptions, Runtime, UnhandledError, UnhandledKind,
};
pub use crate::schema::Schema;
pub use crate::types::AnyValue;
