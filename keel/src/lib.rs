//! Keel — compose applications from declarative building blocks.
//!
//! This facade crate re-exports the Keel kernel through a single
//! dependency. Import everything you need with:
//!
//! ```ignore
//! use keel::prelude::*;
//! ```
//!
//! # What's in the box
//!
//! | Block | Role |
//! |------------|-----------------------------------------------------|
//! | `Task` | Named async operation with injected dependencies |
//! | `Resource` | Singleton with init/dispose lifecycle |
//! | `Event` | Typed signal dispatched to hooks |
//! | `Hook` | Ordered event subscriber |
//! | `TaskMiddleware` / `ResourceMiddleware` | Onion-composed interceptors |
//! | `Tag` | Queryable metadata with optional contracts |
//! | `Journal` | Per-invocation typed key/value store |
//!
//! `run()` wires the blocks into a dependency graph, boots resources in
//! dependency order, and returns the [`Runtime`](keel_core::Runtime)
//! façade; `dispose()` unwinds in reverse.

pub extern crate keel_core;

// Re-export everything from keel-core at the top level for convenience.
pub use keel_core::*;

/// The prelude, re-exported from `keel-core`.
pub mod prelude {
    pub use keel_core::prelude::*;
}
