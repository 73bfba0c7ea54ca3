//! Built-in definitions registered by every runtime: the ready event, the
//! kernel tags, and the optional debug instrumentation resource.
//!
//! These are process-wide constants only in the sense that the same handle
//! is returned on every call; each `run()` registers them into its own
//! store.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, LazyLock, OnceLock};

use crate::defs::{DefKind, Definition, Event, Hook, Resource, Tag, TaskMiddleware};
use crate::error::Error;
use crate::logger::Logger;
use crate::types::{AnyValue, BoxFuture};

// ── Tags ────────────────────────────────────────────────────────────────────

/// Marks a definition as kernel-internal; instrumentation skips it.
pub fn system_tag() -> Tag {
    static TAG: LazyLock<Tag> = LazyLock::new(|| Tag::new("keel.tags.system"));
    TAG.clone()
}

/// Marks an event as invisible to wildcard hooks.
pub fn hidden_from_global_hooks_tag() -> Tag {
    static TAG: LazyLock<Tag> =
        LazyLock::new(|| Tag::new("keel.tags.exclude-from-global-hooks"));
    TAG.clone()
}

/// Per-component debug-level override.
pub fn debug_tag() -> Tag<crate::runtime::DebugLevel> {
    static TAG: LazyLock<Tag<crate::runtime::DebugLevel>> =
        LazyLock::new(|| Tag::<crate::runtime::DebugLevel>::builder("keel.tags.debug").build());
    TAG.clone()
}

/// Identifies a resource as a tunnel and carries its selection sets.
pub fn tunnel_tag() -> Tag<TunnelCfg> {
    static TAG: LazyLock<Tag<TunnelCfg>> =
        LazyLock::new(|| Tag::<TunnelCfg>::builder("keel.tags.tunnel").build());
    TAG.clone()
}

// ── Tunnel contract ─────────────────────────────────────────────────────────

/// Direction of a tunnel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TunnelMode {
    #[default]
    Client,
    Server,
    Both,
}

/// Tunnel tag config: which tasks and events the tunnel claims. Selection
/// lives on the tag so ownership is decidable before any init runs.
#[derive(Clone, Debug, Default)]
pub struct TunnelCfg {
    pub mode: TunnelMode,
    /// Ids of tasks routed through this tunnel.
    pub tasks: Vec<String>,
    /// Ids of events forwarded through this tunnel.
    pub events: Vec<String>,
}

/// The value shape a tunnel resource initializes to: the run hook invoked
/// for phantom tasks the tunnel owns.
#[derive(Clone)]
pub struct TunnelValue {
    pub(crate) run:
        Arc<dyn Fn(String, AnyValue) -> BoxFuture<Result<AnyValue, Error>> + Send + Sync>,
}

impl TunnelValue {
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: Fn(String, AnyValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AnyValue, Error>> + Send + 'static,
    {
        Self {
            run: Arc::new(move |task_id: String, input: AnyValue| Box::pin(run(task_id, input))),
        }
    }
}

// ── Ready event ─────────────────────────────────────────────────────────────

/// Emitted once, after boot completes and buffered logs are flushed.
pub fn ready_event() -> Event<()> {
    static EVENT: LazyLock<Event<()>> = LazyLock::new(|| {
        Event::builder("keel.events.ready")
            .tags([system_tag().applied(), hidden_from_global_hooks_tag().applied()])
            .build()
    });
    EVENT.clone()
}

// ── Registration ────────────────────────────────────────────────────────────

/// Everything the harness root registers before the user's tree.
pub(crate) fn builtin_definitions() -> Vec<Definition> {
    vec![
        Definition::from(&system_tag()),
        Definition::from(&hidden_from_global_hooks_tag()),
        Definition::from(&debug_tag()),
        Definition::from(&tunnel_tag()),
        Definition::from(&ready_event()),
    ]
}

// ── Debug instrumentation ───────────────────────────────────────────────────

/// The instrumentation resource registered when `debug` is not off: a
/// wildcard hook logging every visible emission, plus (verbose only) a
/// global task middleware logging invocation entry and exit.
/// System-tagged definitions are internal and stay out of the debug log.
pub(crate) fn debug_resource(verbose: bool, logger: Logger) -> Definition {
    // Ids of system-tagged events, filled in by init once the registry is
    // complete; the emissions hook skips them.
    let system_events: Arc<OnceLock<HashSet<String>>> = Arc::new(OnceLock::new());

    let hook_logger = logger.clone();
    let known_system = system_events.clone();
    let emissions = Hook::on_any("keel.debug.emissions")
        .tags([system_tag().applied()])
        .order(i32::MIN)
        .run(move |envelope, _deps| {
            let logger = hook_logger.clone();
            let known_system = known_system.clone();
            async move {
                let internal = known_system
                    .get()
                    .is_some_and(|ids| ids.contains(envelope.event_id()));
                if !internal {
                    logger.debug(format!("event '{}' emitted", envelope.event_id()));
                }
                Ok(())
            }
        });

    let mut children = vec![Definition::from(emissions)];

    if verbose {
        let mw_logger = logger;
        let task_io = TaskMiddleware::<()>::builder("keel.debug.task-io")
            .tags([system_tag().applied()])
            .everywhere_when(|task| !system_tag().exists(&task.tags))
            .run(move |ctx, next| {
                let logger = mw_logger.clone();
                async move {
                    logger.debug(format!(
                        "task '{}' invoked (journal {})",
                        ctx.task.id,
                        ctx.journal.id()
                    ));
                    let task_id = ctx.task.id.clone();
                    let result = next.invoke(ctx.input.clone()).await;
                    match &result {
                        Ok(_) => logger.debug(format!("task '{task_id}' resolved")),
                        Err(err) => logger.debug(format!("task '{task_id}' failed: {err}")),
                    }
                    result
                }
            });
        children.push(Definition::from(task_io));
    }

    let resource = Resource::<(), ()>::builder("keel.debug.resource")
        .tags([system_tag().applied()])
        .register(children)
        .init(move |_cfg, _deps, ctx| {
            let system_events = system_events.clone();
            async move {
                if let Some(kernel) = &ctx.kernel {
                    let ids = kernel
                        .store
                        .ids_with_tag(system_tag().id(), DefKind::Event)
                        .into_iter()
                        .collect();
                    let _ = system_events.set(ids);
                }
                Ok(())
            }
        })
        .build();
    Definition::from(resource)
}
