//! The runtime: `run()` wires registration, validation, boot, lock, and the
//! ready signal, and returns the façade callers hold on to.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::builtins;
use crate::chain::ChainStore;
use crate::defs::{DefKind, Definition, Event, Resource, Tag, Task};
use crate::error::{Error, LifecycleError, RegistryError};
use crate::events::{self, EmitOptions, EmitReport, EventManager};
use crate::journal::Journal;
use crate::lifecycle;
use crate::logger::{LogOptions, Logger};
use crate::store::Store;
use crate::types::AnyValue;
use crate::validate;

// ── Options ─────────────────────────────────────────────────────────────────

/// Debug instrumentation level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DebugLevel {
    #[default]
    Off,
    /// Lifecycle signals only.
    Normal,
    /// Lifecycle signals plus task invocation entry/exit.
    Verbose,
}

/// Declared environment; used only by instrumentation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Dev,
    Prod,
    Test,
}

/// Where an unhandled error surfaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnhandledKind {
    Process,
    Task,
    Middleware,
    ResourceInit,
    Hook,
    Run,
}

/// What the `on_unhandled_error` callback receives.
#[derive(Clone, Debug)]
pub struct UnhandledError {
    pub kind: UnhandledKind,
    pub message: String,
    pub source: Option<&'static str>,
}

pub type UnhandledHandler = Arc<dyn Fn(UnhandledError) + Send + Sync>;

/// Configuration for one `run()`.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub debug: DebugLevel,
    pub logs: LogOptions,
    /// Install a process-level panic hook routing to `on_unhandled_error`;
    /// uninstalled on dispose.
    pub error_boundary: bool,
    /// Install termination-signal handlers that invoke `dispose()`.
    pub shutdown_hooks: bool,
    pub on_unhandled_error: Option<UnhandledHandler>,
    /// Validate and build the graph without running any init.
    pub dry_run: bool,
    /// Runtime event-emission cycle detection. On unless disabled.
    pub event_cycle_detection: EventCycleDetection,
    pub mode: Mode,
}

/// Wrapper so "on" stays the default of a `Default`-derived options struct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventCycleDetection(pub bool);

impl Default for EventCycleDetection {
    fn default() -> Self {
        Self(true)
    }
}

// ── Kernel ──────────────────────────────────────────────────────────────────

const STATE_RUNNING: u8 = 0;
const STATE_DISPOSING: u8 = 1;
const STATE_DISPOSED: u8 = 2;

type PanicHook = Box<dyn Fn(&std::panic::PanicHookInfo<'_>) + Sync + Send + 'static>;

/// Shared core behind the façade, the deps handle, and the managers.
pub struct Kernel {
    pub(crate) store: Store,
    pub(crate) events: EventManager,
    pub(crate) chains: ChainStore,
    pub(crate) logger: Logger,
    pub(crate) options: RunOptions,
    pub(crate) dry: bool,
    state: AtomicU8,
    previous_panic_hook: Mutex<Option<PanicHook>>,
    signal_listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Kernel {
    pub(crate) fn ensure_live(&self) -> Result<(), Error> {
        if self.state.load(Ordering::SeqCst) == STATE_DISPOSED {
            return Err(Error::Lifecycle(LifecycleError::Disposed));
        }
        Ok(())
    }

    pub(crate) fn notify_unhandled(
        &self,
        kind: UnhandledKind,
        err: &Error,
        source: Option<&'static str>,
    ) {
        if let Some(handler) = self.options.on_unhandled_error.as_deref() {
            handler(UnhandledError {
                kind,
                message: err.to_string(),
                source,
            });
        }
    }

    /// Execute a task through the invoker, resolving the registered
    /// definition by id so overrides take effect.
    pub(crate) async fn run_task_typed<I, O>(
        self: &Arc<Self>,
        task: &Task<I, O>,
        input: I,
        journal: Option<Journal>,
    ) -> Result<O, Error>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let out = self
            .run_task_erased(task.id(), Arc::new(input) as AnyValue, journal)
            .await?;
        let out = out.downcast::<O>().map_err(|_| {
            Error::msg(format!(
                "task '{}' result is not a '{}'",
                task.id(),
                std::any::type_name::<O>()
            ))
        })?;
        Ok(Arc::try_unwrap(out).unwrap_or_else(|arc| (*arc).clone()))
    }

    pub(crate) async fn run_task_erased(
        self: &Arc<Self>,
        task_id: &str,
        input: AnyValue,
        journal: Option<Journal>,
    ) -> Result<AnyValue, Error> {
        let task = self
            .store
            .task(task_id)
            .cloned()
            .ok_or_else(|| Error::Registry(RegistryError::UnknownId {
                id: task_id.to_string(),
            }))?;
        crate::invoker::run_task(self, task, input, journal).await
    }

    pub(crate) async fn emit_typed<P>(
        self: &Arc<Self>,
        event: &Event<P>,
        payload: P,
        opts: EmitOptions,
    ) -> Result<EmitReport, Error>
    where
        P: Send + Sync + 'static,
    {
        let output = self
            .emit_erased(event.id(), Arc::new(payload) as AnyValue, opts, false)
            .await?;
        Ok(output.report)
    }

    pub(crate) async fn emit_erased(
        self: &Arc<Self>,
        event_id: &str,
        payload: AnyValue,
        opts: EmitOptions,
        want_fold: bool,
    ) -> Result<events::EmissionOutput, Error> {
        self.ensure_live()?;
        let event = self
            .store
            .event(event_id)
            .cloned()
            .ok_or_else(|| Error::Registry(RegistryError::UnknownId {
                id: event_id.to_string(),
            }))?;
        events::emit(self, &event, payload, opts, want_fold).await
    }

    pub(crate) fn resource_value_typed<C, V>(&self, resource: &Resource<C, V>) -> Result<V, Error>
    where
        C: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let value = self
            .store
            .resource_value(resource.id())
            .ok_or_else(|| crate::deps::not_initialized(resource.id()))?;
        let value = value.downcast::<V>().map_err(|_| {
            Error::msg(format!(
                "resource '{}' value is not a '{}'",
                resource.id(),
                std::any::type_name::<V>()
            ))
        })?;
        Ok((*value).clone())
    }

    async fn dispose(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_DISPOSING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if let Err(err) = lifecycle::dispose(self).await {
            self.logger.error(format!("disposal finished with failures: {err}"));
            self.notify_unhandled(UnhandledKind::Process, &err, Some("dispose"));
        }

        if let Some(previous) = self.previous_panic_hook.lock().unwrap().take() {
            std::panic::set_hook(previous);
        }
        if let Some(listener) = self.signal_listener.lock().unwrap().take() {
            listener.abort();
        }

        self.state.store(STATE_DISPOSED, Ordering::SeqCst);
        tracing::debug!("runtime disposed");
    }
}

// ── run() ───────────────────────────────────────────────────────────────────

/// Boot a root resource with default options.
pub async fn run<C, V>(root: Resource<C, V>) -> Result<Runtime, Error>
where
    C: Clone + Default + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    run_with(root, RunOptions::default()).await
}

/// Boot a root resource: walk registration, validate the graph, initialize
/// resources in dependency order, lock the store, flush buffered logs, and
/// emit the ready signal.
pub async fn run_with<C, V>(root: Resource<C, V>, options: RunOptions) -> Result<Runtime, Error>
where
    C: Clone + Default + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let logger = Logger::new(options.logs.clone());

    let mut children = builtins::builtin_definitions();
    match options.debug {
        DebugLevel::Off => {}
        DebugLevel::Normal => children.push(builtins::debug_resource(false, logger.clone())),
        DebugLevel::Verbose => children.push(builtins::debug_resource(true, logger.clone())),
    }
    children.push(Definition::from(root));

    let harness = Resource::<(), ()>::builder("keel.system.root")
        .tags([builtins::system_tag().applied()])
        .register(children)
        .build();

    let notify = |err: &Error| {
        if let Some(handler) = options.on_unhandled_error.as_deref() {
            handler(UnhandledError {
                kind: UnhandledKind::Run,
                message: err.to_string(),
                source: None,
            });
        }
    };

    let mut store = match Store::build(Definition::from(harness)) {
        Ok(store) => store,
        Err(err) => {
            notify(&err);
            return Err(err);
        }
    };

    let (report, ownership) = validate::validate(&store);
    if !report.is_empty() {
        let err = Error::Validation(report);
        notify(&err);
        return Err(err);
    }
    store.ownership = ownership;

    let hidden: HashSet<String> = store
        .ids_with_tag(builtins::hidden_from_global_hooks_tag().id(), DefKind::Event)
        .into_iter()
        .collect();
    let events = EventManager::build(store.hooks(), hidden, options.event_cycle_detection.0);
    let chains = ChainStore::build(&store);

    let kernel = Arc::new(Kernel {
        store,
        events,
        chains,
        logger,
        dry: options.dry_run,
        options,
        state: AtomicU8::new(STATE_RUNNING),
        previous_panic_hook: Mutex::new(None),
        signal_listener: Mutex::new(None),
    });

    if !kernel.dry {
        if let Err(err) = lifecycle::boot(&kernel).await {
            kernel.notify_unhandled(UnhandledKind::ResourceInit, &err, None);
            return Err(err);
        }
    }

    kernel.store.lock();
    kernel.events.freeze();
    kernel.chains.freeze();
    kernel.logger.flush();

    if !kernel.dry {
        let ready = builtins::ready_event();
        if let Err(err) = kernel
            .emit_typed(&ready, (), EmitOptions::default())
            .await
        {
            kernel.notify_unhandled(UnhandledKind::Hook, &err, Some("ready"));
            // Partial boot is unwound before run() rejects.
            if let Err(dispose_err) = lifecycle::dispose(&kernel).await {
                tracing::error!(error = %dispose_err, "cleanup after failed ready also failed");
            }
            return Err(err);
        }
    }

    if kernel.options.error_boundary {
        install_panic_hook(&kernel);
    }
    if kernel.options.shutdown_hooks {
        install_signal_listener(&kernel);
    }

    if kernel.options.debug != DebugLevel::Off {
        kernel
            .logger
            .debug(format!("runtime ready (mode: {:?})", kernel.options.mode));
    }

    Ok(Runtime { kernel })
}

fn install_panic_hook(kernel: &Arc<Kernel>) {
    let previous = std::panic::take_hook();
    *kernel.previous_panic_hook.lock().unwrap() = Some(previous);

    let weak = Arc::downgrade(kernel);
    std::panic::set_hook(Box::new(move |info| {
        if let Some(kernel) = weak.upgrade() {
            let message = info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            kernel.notify_unhandled(
                UnhandledKind::Process,
                &Error::msg(message),
                Some("panic"),
            );
        }
    }));
}

fn install_signal_listener(kernel: &Arc<Kernel>) {
    let weak = Arc::downgrade(kernel);
    let listener = tokio::spawn(async move {
        shutdown_signal().await;
        if let Some(kernel) = weak.upgrade() {
            tracing::info!("shutdown signal received, disposing");
            kernel.dispose().await;
        }
    });
    *kernel.signal_listener.lock().unwrap() = Some(listener);
}

/// Wait for a shutdown signal (Ctrl-C, or SIGTERM on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// ── Façade ──────────────────────────────────────────────────────────────────

/// The object `run()` resolves with: invocation entry points, resource
/// accessors, the logger, a read-only store view, and `dispose`.
pub struct Runtime {
    kernel: Arc<Kernel>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    /// Execute a task and return its typed result.
    pub async fn run_task<I, O>(&self, task: &Task<I, O>, input: I) -> Result<O, Error>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.kernel.run_task_typed(task, input, None).await
    }

    /// Execute a task, forwarding an existing journal into the invocation.
    pub async fn run_task_with_journal<I, O>(
        &self,
        task: &Task<I, O>,
        input: I,
        journal: Journal,
    ) -> Result<O, Error>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.kernel.run_task_typed(task, input, Some(journal)).await
    }

    /// Execute a task by id with an erased input.
    pub async fn run_task_erased(&self, id: &str, input: AnyValue) -> Result<AnyValue, Error> {
        self.kernel.run_task_erased(id, input, None).await
    }

    /// Emit an event with default options.
    pub async fn emit<P>(&self, event: &Event<P>, payload: P) -> Result<(), Error>
    where
        P: Send + Sync + 'static,
    {
        self.kernel
            .emit_typed(event, payload, EmitOptions::default())
            .await
            .map(|_| ())
    }

    /// Emit an event by id with an erased payload.
    pub async fn emit_erased(
        &self,
        id: &str,
        payload: AnyValue,
        opts: EmitOptions,
    ) -> Result<EmitReport, Error> {
        let output = self.kernel.emit_erased(id, payload, opts, false).await?;
        Ok(output.report)
    }

    /// Emit an event with explicit options, resolving with the report.
    pub async fn emit_with<P>(
        &self,
        event: &Event<P>,
        payload: P,
        opts: EmitOptions,
    ) -> Result<EmitReport, Error>
    where
        P: Send + Sync + 'static,
    {
        self.kernel.emit_typed(event, payload, opts).await
    }

    /// Emit a non-parallel event and collect the last payload proposed by a
    /// responder hook, if any.
    pub async fn emit_for_response<P>(&self, event: &Event<P>, payload: P) -> Result<Option<P>, Error>
    where
        P: Clone + Send + Sync + 'static,
    {
        let output = self
            .kernel
            .emit_erased(
                event.id(),
                Arc::new(payload) as AnyValue,
                EmitOptions::default(),
                true,
            )
            .await?;
        Ok(output
            .folded
            .and_then(|value| value.downcast::<P>().ok())
            .map(|arc| (*arc).clone()))
    }

    /// Read the cached init value of a resource.
    pub fn resource_value<C, V>(&self, resource: &Resource<C, V>) -> Result<V, Error>
    where
        C: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.kernel.resource_value_typed(resource)
    }

    /// Read the effective (post-override) config of a resource.
    pub fn resource_config<C, V>(&self, resource: &Resource<C, V>) -> Result<C, Error>
    where
        C: Clone + Default + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let cell = self
            .kernel
            .store
            .resource(resource.id())
            .ok_or_else(|| Error::Registry(RegistryError::UnknownId {
                id: resource.id().to_string(),
            }))?;
        match &cell.config {
            Some(config) => config
                .clone()
                .downcast::<C>()
                .map(|arc| (*arc).clone())
                .map_err(|_| {
                    Error::msg(format!(
                        "resource '{}' config is not a '{}'",
                        resource.id(),
                        std::any::type_name::<C>()
                    ))
                }),
            None => Ok(C::default()),
        }
    }

    /// The structured runtime logger.
    pub fn logger(&self) -> &Logger {
        &self.kernel.logger
    }

    /// Read-only store projection for discovery and introspection.
    pub fn store(&self) -> StoreView<'_> {
        StoreView {
            kernel: &self.kernel,
        }
    }

    /// Tear everything down in reverse init order. Idempotent; failures are
    /// logged and routed to `on_unhandled_error`.
    pub async fn dispose(&self) {
        self.kernel.dispose().await;
    }
}

/// Read-only projection of the store.
pub struct StoreView<'a> {
    kernel: &'a Kernel,
}

impl StoreView<'_> {
    pub fn contains(&self, id: &str) -> bool {
        self.kernel.store.contains(id)
    }

    /// Ids of tasks carrying the given tag.
    pub fn tasks_with_tag<C, In, Out>(&self, tag: &Tag<C, In, Out>) -> Vec<String>
    where
        C: Clone + Send + Sync + 'static,
        In: 'static,
        Out: 'static,
    {
        self.kernel.store.ids_with_tag(tag.id(), DefKind::Task)
    }

    /// Ids of resources carrying the given tag.
    pub fn resources_with_tag<C, In, Out>(&self, tag: &Tag<C, In, Out>) -> Vec<String>
    where
        C: Clone + Send + Sync + 'static,
        In: 'static,
        Out: 'static,
    {
        self.kernel.store.ids_with_tag(tag.id(), DefKind::Resource)
    }

    /// Ids of events carrying the given tag.
    pub fn events_with_tag<C, In, Out>(&self, tag: &Tag<C, In, Out>) -> Vec<String>
    where
        C: Clone + Send + Sync + 'static,
        In: 'static,
        Out: 'static,
    {
        self.kernel.store.ids_with_tag(tag.id(), DefKind::Event)
    }
}
