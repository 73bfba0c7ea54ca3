//! Event definitions: typed signals dispatched to hooks.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::schema::{ErasedSchema, Schema};
use crate::types::TypeTag;

use super::tag::AppliedTag;
use super::{DefKind, DefNode, Definition, DepRef, Meta};

pub(crate) struct EventInner {
    pub(crate) id: String,
    pub(crate) meta: Meta,
    pub(crate) tags: Vec<AppliedTag>,
    /// Hooks of equal order run concurrently instead of sequentially.
    pub(crate) parallel: bool,
    pub(crate) payload_schema: Option<ErasedSchema>,
    pub(crate) payload_type: TypeTag,
}

/// An event definition with payload `P`.
///
/// ```ignore
/// let user_registered = Event::<UserRegistered>::builder("app.events.user-registered").build();
/// ```
pub struct Event<P = ()> {
    pub(crate) inner: Arc<EventInner>,
    _marker: PhantomData<fn(P)>,
}

impl<P> Clone for Event<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl Event {
    /// A payload-less event.
    pub fn new(id: impl Into<String>) -> Event {
        EventBuilder::<()>::new(id).build()
    }
}

impl<P> Event<P>
where
    P: Send + Sync + 'static,
{
    pub fn builder(id: impl Into<String>) -> EventBuilder<P> {
        EventBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_parallel(&self) -> bool {
        self.inner.parallel
    }
}

impl<P> From<&Event<P>> for Definition {
    fn from(event: &Event<P>) -> Self {
        Definition {
            node: DefNode::Event(event.inner.clone()),
        }
    }
}

impl<P> From<Event<P>> for Definition {
    fn from(event: Event<P>) -> Self {
        Definition {
            node: DefNode::Event(event.inner),
        }
    }
}

impl<P> From<&Event<P>> for DepRef {
    fn from(event: &Event<P>) -> Self {
        DepRef {
            id: event.inner.id.clone(),
            kind: DefKind::Event,
            optional: false,
        }
    }
}

/// Builder for [`Event`].
pub struct EventBuilder<P> {
    id: String,
    meta: Meta,
    tags: Vec<AppliedTag>,
    parallel: bool,
    payload_schema: Option<ErasedSchema>,
    _marker: PhantomData<fn(P)>,
}

impl<P> EventBuilder<P>
where
    P: Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: Meta::default(),
            tags: Vec::new(),
            parallel: false,
            payload_schema: None,
            _marker: PhantomData,
        }
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = AppliedTag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Deliver to equal-order hooks concurrently, batch by batch.
    ///
    /// Parallel events cannot be emitted with a returned payload; the two
    /// contracts conflict and the emission rejects the combination.
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn payload_schema(mut self, schema: Schema<P>) -> Self {
        self.payload_schema = Some(schema.erase());
        self
    }

    pub fn build(self) -> Event<P> {
        Event {
            inner: Arc::new(EventInner {
                id: self.id,
                meta: self.meta,
                tags: self.tags,
                parallel: self.parallel,
                payload_schema: self.payload_schema,
                payload_type: TypeTag::of::<P>(),
            }),
            _marker: PhantomData,
        }
    }
}
