//! Hook definitions: ordered subscribers to one or more events.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::deps::Deps;
use crate::error::Error;
use crate::types::{boxed, AnyValue, BoxFuture};

use super::event::Event;
use super::tag::AppliedTag;
use super::{DefKind, DefNode, Definition, DepRef, Meta};

/// Shared propagation flag for one emission.
#[derive(Clone, Default)]
pub(crate) struct Flow {
    stopped: Arc<AtomicBool>,
}

impl Flow {
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Typed event envelope handed to single-event hooks.
pub struct EventData<P> {
    pub(crate) event_id: String,
    pub(crate) payload: Arc<P>,
    pub(crate) flow: Flow,
}

impl<P> EventData<P> {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Prevent lower-priority hooks from running. In parallel delivery the
    /// flag is honored between batches.
    pub fn stop_propagation(&self) {
        self.flow.stop();
    }
}

/// Untyped event envelope handed to multi-event and wildcard hooks.
#[derive(Clone)]
pub struct RawEventData {
    pub(crate) event_id: String,
    pub(crate) payload: AnyValue,
    pub(crate) flow: Flow,
}

impl RawEventData {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn payload(&self) -> &AnyValue {
        &self.payload
    }

    pub fn payload_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.payload.clone().downcast::<T>().ok()
    }

    pub fn stop_propagation(&self) {
        self.flow.stop();
    }
}

/// What a hook is bound to.
#[derive(Clone, Debug)]
pub(crate) enum HookTarget {
    One(String),
    Many(Vec<String>),
    Wildcard,
}

/// Hook bodies return an optional replacement payload; plain hooks always
/// return `None`, responder hooks may fold a value back to the emitter.
pub(crate) type HookBody =
    Arc<dyn Fn(RawEventData, Deps) -> BoxFuture<Result<Option<AnyValue>, Error>> + Send + Sync>;

pub(crate) struct HookInner {
    pub(crate) id: String,
    pub(crate) meta: Meta,
    pub(crate) tags: Vec<AppliedTag>,
    /// Lower runs first; ties run in registration order.
    pub(crate) order: i32,
    pub(crate) deps: Vec<DepRef>,
    pub(crate) target: HookTarget,
    pub(crate) body: HookBody,
}

/// A hook definition.
///
/// ```ignore
/// let audit = Hook::on("app.hooks.audit", &user_registered)
///     .order(10)
///     .run(|ev, _deps| async move {
///         tracing::info!(user = %ev.payload().name, "registered");
///         Ok(())
///     });
/// ```
#[derive(Clone)]
pub struct Hook {
    pub(crate) inner: Arc<HookInner>,
}

impl Hook {
    /// Subscribe to a single event with a typed payload.
    pub fn on<P: Send + Sync + 'static>(id: impl Into<String>, event: &Event<P>) -> HookBuilder<P> {
        HookBuilder {
            id: id.into(),
            meta: Meta::default(),
            tags: Vec::new(),
            order: 0,
            deps: Vec::new(),
            target: HookTarget::One(event.id().to_string()),
            _marker: std::marker::PhantomData,
        }
    }

    /// Subscribe to several events; the body sees the untyped envelope.
    pub fn on_each(
        id: impl Into<String>,
        events: impl IntoIterator<Item = DepRef>,
    ) -> RawHookBuilder {
        RawHookBuilder {
            id: id.into(),
            meta: Meta::default(),
            tags: Vec::new(),
            order: 0,
            deps: Vec::new(),
            target: HookTarget::Many(events.into_iter().map(|dep| dep.id).collect()),
        }
    }

    /// Subscribe to every event except those tagged as hidden from global
    /// hooks.
    pub fn on_any(id: impl Into<String>) -> RawHookBuilder {
        RawHookBuilder {
            id: id.into(),
            meta: Meta::default(),
            tags: Vec::new(),
            order: 0,
            deps: Vec::new(),
            target: HookTarget::Wildcard,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn order(&self) -> i32 {
        self.inner.order
    }
}

impl From<&Hook> for Definition {
    fn from(hook: &Hook) -> Self {
        Definition {
            node: DefNode::Hook(hook.inner.clone()),
        }
    }
}

impl From<Hook> for Definition {
    fn from(hook: Hook) -> Self {
        Definition {
            node: DefNode::Hook(hook.inner),
        }
    }
}

impl From<&Hook> for DepRef {
    fn from(hook: &Hook) -> Self {
        DepRef {
            id: hook.inner.id.clone(),
            kind: DefKind::Hook,
            optional: false,
        }
    }
}

/// Builder for typed single-event hooks.
pub struct HookBuilder<P> {
    id: String,
    meta: Meta,
    tags: Vec<AppliedTag>,
    order: i32,
    deps: Vec<DepRef>,
    target: HookTarget,
    _marker: std::marker::PhantomData<fn(P)>,
}

impl<P> HookBuilder<P>
where
    P: Send + Sync + 'static,
{
    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = AppliedTag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Delivery priority; lower runs first. Defaults to 0.
    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn dependencies(mut self, deps: impl IntoIterator<Item = DepRef>) -> Self {
        self.deps.extend(deps);
        self
    }

    /// Finish with a plain body.
    pub fn run<F, Fut>(self, body: F) -> Hook
    where
        F: Fn(EventData<P>, Deps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let body = Arc::new(body);
        self.finish(Arc::new(move |raw: RawEventData, deps: Deps| {
            let body = body.clone();
            boxed(async move {
                let data = typed_envelope::<P>(raw)?;
                (body.as_ref())(data, deps).await?;
                Ok(None)
            })
        }))
    }

    /// Finish with a responder body that may propose a replacement payload.
    /// During a returned-payload emission, the last non-`None` proposal
    /// wins.
    pub fn respond<F, Fut>(self, body: F) -> Hook
    where
        F: Fn(EventData<P>, Deps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<P>, Error>> + Send + 'static,
    {
        let body = Arc::new(body);
        self.finish(Arc::new(move |raw: RawEventData, deps: Deps| {
            let body = body.clone();
            boxed(async move {
                let data = typed_envelope::<P>(raw)?;
                let proposal = (body.as_ref())(data, deps).await?;
                Ok(proposal.map(|p| Arc::new(p) as AnyValue))
            })
        }))
    }

    fn finish(self, body: HookBody) -> Hook {
        Hook {
            inner: Arc::new(HookInner {
                id: self.id,
                meta: self.meta,
                tags: self.tags,
                order: self.order,
                deps: self.deps,
                target: self.target,
                body,
            }),
        }
    }
}

fn typed_envelope<P: Send + Sync + 'static>(raw: RawEventData) -> Result<EventData<P>, Error> {
    let payload = raw.payload.downcast::<P>().map_err(|_| {
        Error::msg(format!(
            "event payload is not a '{}'",
            std::any::type_name::<P>()
        ))
    })?;
    Ok(EventData {
        event_id: raw.event_id,
        payload,
        flow: raw.flow,
    })
}

/// Builder for multi-event and wildcard hooks.
pub struct RawHookBuilder {
    id: String,
    meta: Meta,
    tags: Vec<AppliedTag>,
    order: i32,
    deps: Vec<DepRef>,
    target: HookTarget,
}

impl RawHookBuilder {
    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = AppliedTag>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn dependencies(mut self, deps: impl IntoIterator<Item = DepRef>) -> Self {
        self.deps.extend(deps);
        self
    }

    pub fn run<F, Fut>(self, body: F) -> Hook
    where
        F: Fn(RawEventData, Deps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let body = Arc::new(body);
        Hook {
            inner: Arc::new(HookInner {
                id: self.id,
                meta: self.meta,
                tags: self.tags,
                order: self.order,
                deps: self.deps,
                target: self.target,
                body: Arc::new(move |raw: RawEventData, deps: Deps| {
                    let body = body.clone();
                    boxed(async move {
                        (body.as_ref())(raw, deps).await?;
                        Ok(None)
                    })
                }),
            }),
        }
    }
}
