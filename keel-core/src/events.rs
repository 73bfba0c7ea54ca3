//! The event manager: hook subscriptions, emission, reports, interception,
//! and runtime cycle detection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;

use crate::defs::event::EventInner;
use crate::defs::hook::{Flow, HookInner, HookTarget, RawEventData};
use crate::deps::Deps;
use crate::error::{Error, EventError, RegistryError, SchemaBoundary};
use crate::schema::check_erased;
use crate::types::{AnyValue, BoxFuture};

tokio::task_local! {
    /// Event ids currently being emitted on this call chain, for runtime
    /// cycle detection.
    static EMIT_CHAIN: Vec<String>;
}

// ── Options and reports ─────────────────────────────────────────────────────

/// What happens when a hook fails during delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// The first failure aborts remaining delivery.
    #[default]
    FailFast,
    /// All hooks run; failures are collected into the report.
    Aggregate,
}

/// Emission options.
#[derive(Clone, Copy, Debug)]
pub struct EmitOptions {
    pub failure_mode: FailureMode,
    /// When true (the default), a non-empty error set is raised to the
    /// emitter; when false, the emission resolves with the report.
    pub throw_on_error: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::FailFast,
            throw_on_error: true,
        }
    }
}

/// How an emission ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Every eligible hook ran.
    Delivered,
    /// A hook stopped propagation.
    Stopped,
    /// Delivery was aborted by a failure.
    Failed,
}

/// The result of one emission.
#[derive(Debug)]
pub struct EmitReport {
    pub event_id: String,
    pub total_listeners: usize,
    pub failed_listeners: usize,
    pub errors: Vec<Error>,
    pub outcome: EmitOutcome,
}

impl EmitReport {
    fn empty(event_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            total_listeners: 0,
            failed_listeners: 0,
            errors: Vec::new(),
            outcome: EmitOutcome::Delivered,
        }
    }
}

// ── Interceptors ────────────────────────────────────────────────────────────

/// Continuation for an emission interceptor: runs delivery with the (maybe
/// replaced) envelope.
pub struct EmitNext {
    pub(crate) f: Box<dyn FnOnce(RawEventData) -> BoxFuture<Result<(), Error>> + Send>,
}

impl EmitNext {
    pub fn invoke(self, envelope: RawEventData) -> BoxFuture<Result<(), Error>> {
        (self.f)(envelope)
    }
}

/// Continuation for a hook interceptor: runs the wrapped hook.
pub struct HookNext {
    pub(crate) f:
        Box<dyn FnOnce(RawEventData) -> BoxFuture<Result<Option<AnyValue>, Error>> + Send>,
}

impl HookNext {
    pub fn invoke(self, envelope: RawEventData) -> BoxFuture<Result<Option<AnyValue>, Error>> {
        (self.f)(envelope)
    }
}

/// Wraps a whole emission. Composes in registration order, first registered
/// outermost.
pub type EmitInterceptor =
    Arc<dyn Fn(EmitNext, RawEventData) -> BoxFuture<Result<(), Error>> + Send + Sync>;

/// Wraps each individual hook invocation. The second argument names the
/// wrapped hook.
pub type HookInterceptor = Arc<
    dyn Fn(HookNext, Arc<str>, RawEventData) -> BoxFuture<Result<Option<AnyValue>, Error>>
        + Send
        + Sync,
>;

// ── Manager ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) struct HookEntry {
    pub(crate) hook: Arc<HookInner>,
    /// Registration order, the tie-breaker within equal `order`.
    pub(crate) seq: usize,
}

pub(crate) struct EventManager {
    subscriptions: HashMap<String, Vec<HookEntry>>,
    wildcard: Vec<HookEntry>,
    /// Event ids the wildcard bucket must not receive.
    hidden_from_wildcard: std::collections::HashSet<String>,
    emit_interceptors: Mutex<Vec<EmitInterceptor>>,
    hook_interceptors: Mutex<Vec<HookInterceptor>>,
    frozen: AtomicBool,
    cycle_detection: bool,
}

impl EventManager {
    /// Build the subscription table from registered hooks.
    pub(crate) fn build(
        hooks: impl IntoIterator<Item = Arc<HookInner>>,
        hidden_from_wildcard: std::collections::HashSet<String>,
        cycle_detection: bool,
    ) -> Self {
        let mut subscriptions: HashMap<String, Vec<HookEntry>> = HashMap::new();
        let mut wildcard = Vec::new();

        for (seq, hook) in hooks.into_iter().enumerate() {
            let entry = HookEntry {
                hook: hook.clone(),
                seq,
            };
            match &hook.target {
                HookTarget::One(event_id) => {
                    subscriptions
                        .entry(event_id.clone())
                        .or_default()
                        .push(entry);
                }
                HookTarget::Many(event_ids) => {
                    for event_id in event_ids {
                        subscriptions
                            .entry(event_id.clone())
                            .or_default()
                            .push(entry.clone());
                    }
                }
                HookTarget::Wildcard => wildcard.push(entry),
            }
        }

        for entries in subscriptions.values_mut() {
            entries.sort_by_key(|e| (e.hook.order, e.seq));
        }
        wildcard.sort_by_key(|e| (e.hook.order, e.seq));

        Self {
            subscriptions,
            wildcard,
            hidden_from_wildcard,
            emit_interceptors: Mutex::new(Vec::new()),
            hook_interceptors: Mutex::new(Vec::new()),
            frozen: AtomicBool::new(false),
            cycle_detection,
        }
    }

    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub(crate) fn add_emit_interceptor(&self, interceptor: EmitInterceptor) -> Result<(), Error> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::Registry(RegistryError::Locked {
                operation: "emission interceptor registration",
            }));
        }
        self.emit_interceptors.lock().unwrap().push(interceptor);
        Ok(())
    }

    pub(crate) fn add_hook_interceptor(&self, interceptor: HookInterceptor) -> Result<(), Error> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::Registry(RegistryError::Locked {
                operation: "hook interceptor registration",
            }));
        }
        self.hook_interceptors.lock().unwrap().push(interceptor);
        Ok(())
    }

    /// Hooks eligible for one emission, in delivery order.
    fn listeners(&self, event: &EventInner) -> Vec<HookEntry> {
        let direct = self
            .subscriptions
            .get(&event.id)
            .cloned()
            .unwrap_or_default();
        if self.hidden_from_wildcard.contains(&event.id) || self.wildcard.is_empty() {
            return direct;
        }
        let mut merged = direct;
        merged.extend(self.wildcard.iter().cloned());
        merged.sort_by_key(|e| (e.hook.order, e.seq));
        merged
    }
}

// ── Emission ────────────────────────────────────────────────────────────────

pub(crate) struct EmissionOutput {
    pub(crate) report: EmitReport,
    /// Last non-`None` payload proposed by responder hooks.
    pub(crate) folded: Option<AnyValue>,
}

/// Emit an event: validate the payload, run the interceptor-wrapped
/// delivery, and shape the result per the options.
pub(crate) async fn emit(
    kernel: &Arc<crate::runtime::Kernel>,
    event: &Arc<EventInner>,
    payload: AnyValue,
    opts: EmitOptions,
    want_fold: bool,
) -> Result<EmissionOutput, Error> {
    if want_fold && event.parallel {
        return Err(Error::Event(EventError::PayloadFoldOnParallel {
            event: event.id.clone(),
        }));
    }

    check_erased(
        &event.payload_schema,
        payload.as_ref(),
        SchemaBoundary::Payload,
        &event.id,
    )?;

    let manager = &kernel.events;
    if manager.cycle_detection {
        let chain = EMIT_CHAIN.try_with(|chain| chain.clone()).unwrap_or_default();
        if chain.contains(&event.id) {
            let mut path = chain;
            path.push(event.id.clone());
            return Err(Error::Event(EventError::Cycle { chain: path }));
        }
        let mut next_chain = chain;
        next_chain.push(event.id.clone());
        return EMIT_CHAIN
            .scope(next_chain, deliver_intercepted(kernel, event, payload, opts, want_fold))
            .await;
    }

    deliver_intercepted(kernel, event, payload, opts, want_fold).await
}

/// Wrap delivery in the registered emission interceptors and run it.
async fn deliver_intercepted(
    kernel: &Arc<crate::runtime::Kernel>,
    event: &Arc<EventInner>,
    payload: AnyValue,
    opts: EmitOptions,
    want_fold: bool,
) -> Result<EmissionOutput, Error> {
    let envelope = RawEventData {
        event_id: event.id.clone(),
        payload,
        flow: Flow::default(),
    };

    let interceptors: Vec<EmitInterceptor> =
        kernel.events.emit_interceptors.lock().unwrap().clone();

    // Delivery writes its output here; an interceptor that skips `next`
    // leaves it empty and the emission reports zero listeners.
    let slot: Arc<Mutex<Option<EmissionOutput>>> = Arc::new(Mutex::new(None));

    let innermost = {
        let kernel = kernel.clone();
        let event = event.clone();
        let slot = slot.clone();
        move |envelope: RawEventData| -> BoxFuture<Result<(), Error>> {
            Box::pin(async move {
                let output = deliver(&kernel, &event, envelope, opts, want_fold).await?;
                *slot.lock().unwrap() = Some(output);
                Ok(())
            })
        }
    };

    let mut call: Box<dyn FnOnce(RawEventData) -> BoxFuture<Result<(), Error>> + Send> =
        Box::new(innermost);
    for interceptor in interceptors.into_iter().rev() {
        let inner = call;
        call = Box::new(move |envelope| {
            Box::pin(async move { (interceptor.as_ref())(EmitNext { f: inner }, envelope).await })
        });
    }

    call(envelope).await?;

    let output = slot.lock().unwrap().take().unwrap_or(EmissionOutput {
        report: EmitReport::empty(&event.id),
        folded: None,
    });
    Ok(output)
}

/// The delivery loop proper.
async fn deliver(
    kernel: &Arc<crate::runtime::Kernel>,
    event: &Arc<EventInner>,
    envelope: RawEventData,
    opts: EmitOptions,
    want_fold: bool,
) -> Result<EmissionOutput, Error> {
    let entries = kernel.events.listeners(event);
    let total = entries.len();
    let mut errors: Vec<Error> = Vec::new();
    let mut folded: Option<AnyValue> = None;
    let mut outcome = EmitOutcome::Delivered;

    if event.parallel {
        // Contiguous batches of equal order run concurrently; batches run
        // in ascending order, and stop-propagation is honored between them.
        let mut index = 0;
        'batches: while index < entries.len() {
            if envelope.flow.is_stopped() {
                outcome = EmitOutcome::Stopped;
                break;
            }
            let order = entries[index].hook.order;
            let mut batch = Vec::new();
            while index < entries.len() && entries[index].hook.order == order {
                batch.push(entries[index].clone());
                index += 1;
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|entry| invoke_hook(kernel, entry, envelope.clone())),
            )
            .await;
            for result in results {
                if let Err(err) = result {
                    errors.push(err);
                }
            }
            if !errors.is_empty() && opts.failure_mode == FailureMode::FailFast {
                outcome = EmitOutcome::Failed;
                break 'batches;
            }
        }
    } else {
        for entry in &entries {
            if envelope.flow.is_stopped() {
                outcome = EmitOutcome::Stopped;
                break;
            }
            match invoke_hook(kernel, entry, envelope.clone()).await {
                Ok(Some(proposal)) if want_fold => folded = Some(proposal),
                Ok(_) => {}
                Err(err) => {
                    errors.push(err);
                    if opts.failure_mode == FailureMode::FailFast {
                        outcome = EmitOutcome::Failed;
                        break;
                    }
                }
            }
        }
    }

    let failed = errors.len();
    if !errors.is_empty() && opts.throw_on_error {
        return match opts.failure_mode {
            // Fail-fast propagates the hook's own error to the emitter.
            FailureMode::FailFast => Err(errors.remove(0)),
            FailureMode::Aggregate => Err(Error::Event(EventError::HookFailures {
                event: event.id.clone(),
                errors,
            })),
        };
    }

    Ok(EmissionOutput {
        report: EmitReport {
            event_id: event.id.clone(),
            total_listeners: total,
            failed_listeners: failed,
            errors,
            outcome,
        },
        folded,
    })
}

/// Run one hook, wrapped in the registered hook interceptors.
async fn invoke_hook(
    kernel: &Arc<crate::runtime::Kernel>,
    entry: &HookEntry,
    envelope: RawEventData,
) -> Result<Option<AnyValue>, Error> {
    let hook = entry.hook.clone();
    let deps = Deps::new(kernel.clone(), hook.id.clone(), &hook.deps);

    let interceptors: Vec<HookInterceptor> =
        kernel.events.hook_interceptors.lock().unwrap().clone();

    let body = hook.body.clone();
    let mut call: Box<
        dyn FnOnce(RawEventData) -> BoxFuture<Result<Option<AnyValue>, Error>> + Send,
    > = Box::new(move |envelope| (body.as_ref())(envelope, deps));

    for interceptor in interceptors.into_iter().rev() {
        let inner = call;
        let hook_id: Arc<str> = Arc::from(hook.id.as_str());
        call = Box::new(move |envelope| {
            Box::pin(async move {
                (interceptor.as_ref())(HookNext { f: inner }, hook_id, envelope).await
            })
        });
    }

    call(envelope).await
}
