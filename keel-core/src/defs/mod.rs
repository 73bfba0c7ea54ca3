//! Definition types.
//!
//! Applications are composed from immutable, `Arc`-backed descriptors:
//! tasks, resources, events, hooks, middleware, tags, error kinds, and
//! async contexts. Typed handles ([`Task<I, O>`], [`Resource<C, V>`], ...)
//! carry phantom types for ergonomic call sites; the store works with the
//! erased [`Definition`] union.

pub mod app_error;
pub mod async_ctx;
pub mod event;
pub mod hook;
pub mod middleware;
pub mod resource;
pub mod tag;
pub mod task;

pub use app_error::{ErrorKind, ErrorKindBuilder};
pub use async_ctx::AsyncContext;
pub use event::{Event, EventBuilder};
pub use hook::{EventData, Hook, HookBuilder, RawEventData, RawHookBuilder};
pub use middleware::{
    MwUse, Next, ResourceMiddleware, ResourceMwBuilder, ResourceMwCtx, ResourceNext,
    TaskMiddleware, TaskMwBuilder, TaskMwCtx, TypedNext,
};
pub use resource::{InitContext, Resource, ResourceBuilder};
pub use tag::{AppliedTag, Tag, TagBuilder};
pub use task::{CallContext, Task, TaskBuilder};

use std::sync::Arc;

use crate::types::AnyValue;

// ── Metadata ────────────────────────────────────────────────────────────────

/// Opaque user metadata carried by every definition.
#[derive(Clone, Debug, Default)]
pub struct Meta {
    pub title: Option<String>,
    pub description: Option<String>,
    /// Free-form structured data for tooling.
    pub extra: Option<serde_json::Value>,
}

impl Meta {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Self::default()
        }
    }
}

// ── Kinds and dependency references ─────────────────────────────────────────

/// Discriminant of a definition variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DefKind {
    Task,
    Resource,
    Event,
    Hook,
    TaskMiddleware,
    ResourceMiddleware,
    Tag,
    ErrorKind,
    AsyncContext,
}

impl std::fmt::Display for DefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DefKind::Task => "task",
            DefKind::Resource => "resource",
            DefKind::Event => "event",
            DefKind::Hook => "hook",
            DefKind::TaskMiddleware => "task middleware",
            DefKind::ResourceMiddleware => "resource middleware",
            DefKind::Tag => "tag",
            DefKind::ErrorKind => "error",
            DefKind::AsyncContext => "async context",
        })
    }
}

/// A declared dependency edge: the id of another definition, plus whether
/// absence is tolerated.
///
/// Build one from any handle: `DepRef::from(&db)`, or mark it optional with
/// [`DepRef::optional`].
#[derive(Clone, Debug)]
pub struct DepRef {
    pub(crate) id: String,
    pub(crate) kind: DefKind,
    pub(crate) optional: bool,
}

impl DepRef {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> DefKind {
        self.kind
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    /// Mark this dependency as optional: an unresolved reference becomes an
    /// absence instead of a validation error.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

// ── Middleware usage ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MwKind {
    Task,
    Resource,
}

// ── Erased definition union ─────────────────────────────────────────────────

/// Configured resource handle, erased for storage.
#[derive(Clone)]
pub(crate) struct ResourceCell {
    pub(crate) inner: Arc<resource::ResourceInner>,
    pub(crate) config: Option<AnyValue>,
}

#[derive(Clone)]
pub(crate) struct TaskMwCell {
    pub(crate) inner: Arc<middleware::TaskMwInner>,
}

#[derive(Clone)]
pub(crate) struct ResourceMwCell {
    pub(crate) inner: Arc<middleware::ResourceMwInner>,
}

/// The closed union the store keeps, keyed by `kind`.
#[derive(Clone)]
pub(crate) enum DefNode {
    Task(Arc<task::TaskInner>),
    Resource(ResourceCell),
    Event(Arc<event::EventInner>),
    Hook(Arc<hook::HookInner>),
    TaskMiddleware(TaskMwCell),
    ResourceMiddleware(ResourceMwCell),
    Tag(Arc<tag::TagInner>),
    ErrorKind(Arc<app_error::ErrorKindInner>),
    AsyncContext(Arc<async_ctx::AsyncCtxInner>),
}

/// A registrable definition of any kind.
///
/// Every typed handle converts into this via `From`/`Into`, which is what
/// resource `register` lists contain.
#[derive(Clone)]
pub struct Definition {
    pub(crate) node: DefNode,
}

impl Definition {
    pub fn id(&self) -> &str {
        match &self.node {
            DefNode::Task(inner) => &inner.id,
            DefNode::Resource(cell) => &cell.inner.id,
            DefNode::Event(inner) => &inner.id,
            DefNode::Hook(inner) => &inner.id,
            DefNode::TaskMiddleware(cell) => &cell.inner.id,
            DefNode::ResourceMiddleware(cell) => &cell.inner.id,
            DefNode::Tag(inner) => &inner.id,
            DefNode::ErrorKind(inner) => &inner.id,
            DefNode::AsyncContext(inner) => &inner.id,
        }
    }

    pub fn kind(&self) -> DefKind {
        match &self.node {
            DefNode::Task(_) => DefKind::Task,
            DefNode::Resource(_) => DefKind::Resource,
            DefNode::Event(_) => DefKind::Event,
            DefNode::Hook(_) => DefKind::Hook,
            DefNode::TaskMiddleware(_) => DefKind::TaskMiddleware,
            DefNode::ResourceMiddleware(_) => DefKind::ResourceMiddleware,
            DefNode::Tag(_) => DefKind::Tag,
            DefNode::ErrorKind(_) => DefKind::ErrorKind,
            DefNode::AsyncContext(_) => DefKind::AsyncContext,
        }
    }

    /// Tags applied to this definition.
    pub fn tags(&self) -> &[AppliedTag] {
        match &self.node {
            DefNode::Task(inner) => &inner.tags,
            DefNode::Resource(cell) => &cell.inner.tags,
            DefNode::Event(inner) => &inner.tags,
            DefNode::Hook(inner) => &inner.tags,
            DefNode::TaskMiddleware(cell) => &cell.inner.tags,
            DefNode::ResourceMiddleware(cell) => &cell.inner.tags,
            DefNode::Tag(inner) => &inner.tags,
            DefNode::ErrorKind(inner) => &inner.tags,
            DefNode::AsyncContext(inner) => &inner.tags,
        }
    }

    /// Identity token: two handles are the same definition when they share
    /// the same inner allocation, regardless of applied config.
    pub(crate) fn identity(&self) -> usize {
        match &self.node {
            DefNode::Task(inner) => Arc::as_ptr(inner) as usize,
            DefNode::Resource(cell) => Arc::as_ptr(&cell.inner) as usize,
            DefNode::Event(inner) => Arc::as_ptr(inner) as usize,
            DefNode::Hook(inner) => Arc::as_ptr(inner) as usize,
            DefNode::TaskMiddleware(cell) => Arc::as_ptr(&cell.inner) as usize,
            DefNode::ResourceMiddleware(cell) => Arc::as_ptr(&cell.inner) as usize,
            DefNode::Tag(inner) => Arc::as_ptr(inner) as usize,
            DefNode::ErrorKind(inner) => Arc::as_ptr(inner) as usize,
            DefNode::AsyncContext(inner) => Arc::as_ptr(inner) as usize,
        }
    }

    /// Declared dependencies, if this kind declares any.
    pub(crate) fn static_deps(&self) -> Vec<DepRef> {
        match &self.node {
            DefNode::Task(inner) => inner.deps.clone(),
            DefNode::Resource(cell) => cell.inner.deps_for(cell.config.as_ref()),
            DefNode::Hook(inner) => inner.deps.clone(),
            DefNode::TaskMiddleware(cell) => cell.inner.deps.clone(),
            DefNode::ResourceMiddleware(cell) => cell.inner.deps.clone(),
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Debug for Definition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Definition")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}

// ── Overviews handed to predicates and middleware contexts ──────────────────

/// Read-only descriptor of a task, handed to middleware bodies and
/// `everywhere` predicates.
#[derive(Clone)]
pub struct TaskOverview {
    pub id: String,
    pub meta: Meta,
    pub tags: Vec<AppliedTag>,
}

/// Read-only descriptor of a resource, handed to resource middleware.
#[derive(Clone)]
pub struct ResourceOverview {
    pub id: String,
    pub meta: Meta,
    pub tags: Vec<AppliedTag>,
}
