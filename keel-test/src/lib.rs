//! In-process test harness for Keel applications.
//!
//! [`TestKernel`] assembles a root resource from loose definitions, boots
//! it, and hands back the runtime façade, so tests skip the root-resource
//! boilerplate:
//!
//! ```ignore
//! use keel_test::TestKernel;
//!
//! let runtime = TestKernel::new()
//!     .register(Definition::from(&greet))
//!     .boot()
//!     .await?;
//! assert_eq!(runtime.run_task(&greet, "ada".into()).await?, "hello ada");
//! runtime.dispose().await;
//! ```
//!
//! [`DisposeRecorder`] captures lifecycle ordering for assertions on init
//! and dispose sequences.

use std::sync::{Arc, Mutex};

use keel_core::{run_with, Definition, Error, Resource, RunOptions, Runtime};

/// Builder assembling a disposable test application.
pub struct TestKernel {
    definitions: Vec<Definition>,
    options: RunOptions,
}

impl TestKernel {
    pub fn new() -> Self {
        Self {
            definitions: Vec::new(),
            options: RunOptions::default(),
        }
    }

    /// Add a definition to the root's register list.
    pub fn register(mut self, def: impl Into<Definition>) -> Self {
        self.definitions.push(def.into());
        self
    }

    /// Add several definitions at once.
    pub fn register_all(mut self, defs: impl IntoIterator<Item = Definition>) -> Self {
        self.definitions.extend(defs);
        self
    }

    /// Replace the run options (defaults otherwise).
    pub fn options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the synthetic root and boot the runtime.
    pub async fn boot(self) -> Result<Runtime, Error> {
        let root = Resource::<(), ()>::builder("test.root")
            .register(self.definitions)
            .build();
        run_with(root, self.options).await
    }
}

impl Default for TestKernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared recorder for lifecycle-order assertions.
///
/// Clone one into init and dispose bodies, then assert on
/// [`entries`](Self::entries) after teardown.
#[derive(Clone, Default)]
pub struct DisposeRecorder {
    entries: Arc<Mutex<Vec<String>>>,
}

impl DisposeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a marker, e.g. `"init:db"` or `"dispose:db"`.
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    /// Everything recorded so far, in order.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Only the entries with the given prefix, in order.
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.starts_with(prefix))
            .collect()
    }
}
