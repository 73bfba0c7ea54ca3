//! Middleware definitions: interceptors wrapping task execution and
//! resource initialization, composed as an onion.
//!
//! Each layer receives a context and a call-once continuation. A layer
//! either invokes the continuation (with the original or a modified input)
//! or short-circuits by returning a value without calling it. The
//! continuation is consumed by value, so "call `next` exactly once" is
//! enforced by the type system.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::deps::Deps;
use crate::error::{Error, SchemaBoundary, SchemaViolation};
use crate::journal::Journal;
use crate::schema::{ErasedSchema, Schema};
use crate::types::{AnyValue, BoxFuture, TypeTag};

use super::tag::AppliedTag;
use super::{DefNode, Definition, DepRef, Meta, MwKind, ResourceMwCell, ResourceOverview, TaskMwCell, TaskOverview};

// ── Continuations ───────────────────────────────────────────────────────────

/// The rest of a task's middleware chain (ending in the body).
pub struct Next {
    pub(crate) f: Box<dyn FnOnce(AnyValue) -> BoxFuture<Result<AnyValue, Error>> + Send>,
}

impl Next {
    pub(crate) fn new(
        f: impl FnOnce(AnyValue) -> BoxFuture<Result<AnyValue, Error>> + Send + 'static,
    ) -> Self {
        Self { f: Box::new(f) }
    }

    /// Run the rest of the chain with the given input.
    pub fn invoke(self, input: AnyValue) -> BoxFuture<Result<AnyValue, Error>> {
        (self.f)(input)
    }
}

/// The rest of a resource's init chain. The flowing value is the applied
/// config, which a layer may replace before initialization sees it.
pub struct ResourceNext {
    pub(crate) f:
        Box<dyn FnOnce(Option<AnyValue>) -> BoxFuture<Result<AnyValue, Error>> + Send>,
}

impl ResourceNext {
    pub(crate) fn new(
        f: impl FnOnce(Option<AnyValue>) -> BoxFuture<Result<AnyValue, Error>> + Send + 'static,
    ) -> Self {
        Self { f: Box::new(f) }
    }

    pub fn invoke(self, config: Option<AnyValue>) -> BoxFuture<Result<AnyValue, Error>> {
        (self.f)(config)
    }
}

/// Typed view over [`Next`] used by per-task interceptors.
pub struct TypedNext<I, O> {
    next: Next,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> TypedNext<I, O>
where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(next: Next) -> Self {
        Self {
            next,
            _marker: PhantomData,
        }
    }

    /// Run the wrapped continuation with a typed input.
    pub async fn invoke(self, input: I) -> Result<O, Error> {
        let out = self.next.invoke(Arc::new(input)).await?;
        let out = out.downcast::<O>().map_err(|_| {
            Error::msg(format!(
                "interceptor result is not a '{}'",
                std::any::type_name::<O>()
            ))
        })?;
        Ok(Arc::try_unwrap(out).unwrap_or_else(|arc| (*arc).clone()))
    }
}

/// A per-task interceptor, stored erased. Registered during resource init,
/// frozen at lock, and composed around the task body inside the chain.
pub(crate) type ErasedTaskInterceptor =
    Arc<dyn Fn(Next, AnyValue) -> BoxFuture<Result<AnyValue, Error>> + Send + Sync>;

// ── Contexts ────────────────────────────────────────────────────────────────

/// Context handed to a task middleware layer.
pub struct TaskMwCtx {
    /// Descriptor of the wrapped task.
    pub task: TaskOverview,
    /// The input as this layer sees it.
    pub input: AnyValue,
    /// The invocation journal.
    pub journal: Journal,
    /// Dependencies declared by the middleware definition.
    pub deps: Deps,
    pub(crate) config: Option<AnyValue>,
}

impl TaskMwCtx {
    /// The per-use config this middleware instance was attached with.
    pub fn config<C: Send + Sync + 'static>(&self) -> Option<Arc<C>> {
        self.config
            .as_ref()
            .and_then(|config| config.clone().downcast::<C>().ok())
    }

    /// Downcast the flowing input.
    pub fn input_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.input.clone().downcast::<T>().ok()
    }
}

/// Context handed to a resource middleware layer.
pub struct ResourceMwCtx {
    /// Descriptor of the wrapped resource.
    pub resource: ResourceOverview,
    /// The applied resource config, if any.
    pub resource_config: Option<AnyValue>,
    /// The init-invocation journal.
    pub journal: Journal,
    /// Dependencies declared by the middleware definition.
    pub deps: Deps,
    pub(crate) config: Option<AnyValue>,
}

impl ResourceMwCtx {
    /// The per-use config this middleware instance was attached with.
    pub fn config<C: Send + Sync + 'static>(&self) -> Option<Arc<C>> {
        self.config
            .as_ref()
            .and_then(|config| config.clone().downcast::<C>().ok())
    }
}

// ── Selection ───────────────────────────────────────────────────────────────

/// How a middleware opts into automatic application.
pub(crate) enum Everywhere {
    No,
    All,
    TaskWhere(Arc<dyn Fn(&TaskOverview) -> bool + Send + Sync>),
    ResourceWhere(Arc<dyn Fn(&ResourceOverview) -> bool + Send + Sync>),
}

// ── Bodies ──────────────────────────────────────────────────────────────────

pub(crate) type TaskMwBody =
    Arc<dyn Fn(TaskMwCtx, Next) -> BoxFuture<Result<AnyValue, Error>> + Send + Sync>;

pub(crate) type ResourceMwBody =
    Arc<dyn Fn(ResourceMwCtx, ResourceNext) -> BoxFuture<Result<AnyValue, Error>> + Send + Sync>;

pub(crate) struct TaskMwInner {
    pub(crate) id: String,
    pub(crate) meta: Meta,
    pub(crate) tags: Vec<AppliedTag>,
    pub(crate) deps: Vec<DepRef>,
    pub(crate) config_schema: Option<ErasedSchema>,
    pub(crate) input_contract: Option<TypeTag>,
    pub(crate) output_contract: Option<TypeTag>,
    pub(crate) everywhere: Everywhere,
    pub(crate) body: TaskMwBody,
}

pub(crate) struct ResourceMwInner {
    pub(crate) id: String,
    pub(crate) meta: Meta,
    pub(crate) tags: Vec<AppliedTag>,
    pub(crate) deps: Vec<DepRef>,
    pub(crate) config_schema: Option<ErasedSchema>,
    pub(crate) everywhere: Everywhere,
    pub(crate) body: ResourceMwBody,
}

// ── Usage reference ─────────────────────────────────────────────────────────

/// A middleware attachment on a task or resource: the middleware's id plus
/// the per-use config.
#[derive(Clone)]
pub struct MwUse {
    pub(crate) kind: MwKind,
    pub(crate) id: String,
    pub(crate) config: Option<AnyValue>,
}

impl MwUse {
    pub fn id(&self) -> &str {
        &self.id
    }
}

// ── Task middleware definition ──────────────────────────────────────────────

/// A task middleware definition with per-use config `C` and optional
/// input/output contracts `In`/`Out` (`()` means unconstrained).
///
/// ```ignore
/// let timed = TaskMiddleware::<TimedCfg>::builder("app.middleware.timed")
///     .run(|ctx, next| async move {
///         let start = Instant::now();
///         let out = next.invoke(ctx.input.clone()).await;
///         tracing::debug!(task = %ctx.task.id, elapsed_ms = %start.elapsed().as_millis());
///         out
///     })
///     .build();
/// ```
pub struct TaskMiddleware<C = (), In = (), Out = ()> {
    pub(crate) inner: Arc<TaskMwInner>,
    pub(crate) config: Option<AnyValue>,
    _marker: PhantomData<fn(C, In) -> Out>,
}

impl<C, In, Out> Clone for TaskMiddleware<C, In, Out> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
            _marker: PhantomData,
        }
    }
}

impl TaskMiddleware {
    pub(crate) fn from_inner(inner: Arc<TaskMwInner>) -> TaskMiddleware {
        TaskMiddleware {
            inner,
            config: None,
            _marker: PhantomData,
        }
    }
}

impl<C, In, Out> TaskMiddleware<C, In, Out>
where
    C: Clone + Send + Sync + 'static,
    In: 'static,
    Out: 'static,
{
    pub fn builder(id: impl Into<String>) -> TaskMwBuilder<C, In, Out> {
        TaskMwBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Attach a per-use config.
    ///
    /// # Panics
    ///
    /// Panics if the middleware declares a config schema and the value is
    /// rejected. Use [`try_with`](Self::try_with) for the fallible variant.
    pub fn with(&self, config: C) -> Self {
        self.try_with(config)
            .expect("middleware config failed schema validation")
    }

    pub fn try_with(&self, config: C) -> Result<Self, Error> {
        if let Some(schema) = &self.inner.config_schema {
            (schema.as_ref())(&config).map_err(|message| {
                Error::Schema(SchemaViolation {
                    boundary: SchemaBoundary::MiddlewareConfig,
                    owner: self.inner.id.clone(),
                    message,
                })
            })?;
        }
        Ok(Self {
            inner: self.inner.clone(),
            config: Some(Arc::new(config)),
            _marker: PhantomData,
        })
    }
}

impl<C, In, Out> From<&TaskMiddleware<C, In, Out>> for Definition {
    fn from(mw: &TaskMiddleware<C, In, Out>) -> Self {
        Definition {
            node: DefNode::TaskMiddleware(TaskMwCell {
                inner: mw.inner.clone(),
            }),
        }
    }
}

impl<C, In, Out> From<TaskMiddleware<C, In, Out>> for Definition {
    fn from(mw: TaskMiddleware<C, In, Out>) -> Self {
        Definition {
            node: DefNode::TaskMiddleware(TaskMwCell { inner: mw.inner }),
        }
    }
}

impl<C, In, Out> From<&TaskMiddleware<C, In, Out>> for MwUse {
    fn from(mw: &TaskMiddleware<C, In, Out>) -> Self {
        MwUse {
            kind: MwKind::Task,
            id: mw.inner.id.clone(),
            config: mw.config.clone(),
        }
    }
}

/// Builder for [`TaskMiddleware`].
pub struct TaskMwBuilder<C, In, Out> {
    id: String,
    meta: Meta,
    tags: Vec<AppliedTag>,
    deps: Vec<DepRef>,
    config_schema: Option<ErasedSchema>,
    everywhere: Everywhere,
    _marker: PhantomData<fn(C, In) -> Out>,
}

impl<C, In, Out> TaskMwBuilder<C, In, Out>
where
    C: Clone + Send + Sync + 'static,
    In: 'static,
    Out: 'static,
{
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: Meta::default(),
            tags: Vec::new(),
            deps: Vec::new(),
            config_schema: None,
            everywhere: Everywhere::No,
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

    pub fn dependencies(mut self, deps: impl IntoIterator<Item = DepRef>) -> Self {
        self.deps.extend(deps);
        self
    }

    pub fn config_schema(mut self, schema: Schema<C>) -> Self {
        self.config_schema = Some(schema.erase());
        self
    }

    /// Apply this middleware to every task automatically.
    pub fn everywhere(mut self) -> Self {
        self.everywhere = Everywhere::All;
        self
    }

    /// Apply this middleware automatically to tasks matching the predicate.
    pub fn everywhere_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TaskOverview) -> bool + Send + Sync + 'static,
    {
        self.everywhere = Everywhere::TaskWhere(Arc::new(predicate));
        self
    }

    /// Set the layer body and finish the definition.
    pub fn run<F, Fut>(self, body: F) -> TaskMiddleware<C, In, Out>
    where
        F: Fn(TaskMwCtx, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<AnyValue, Error>> + Send + 'static,
    {
        let erased: TaskMwBody = Arc::new(move |ctx, next| Box::pin(body(ctx, next)));
        let unit = |tag: TypeTag| if tag.is_unit() { None } else { Some(tag) };
        TaskMiddleware {
            inner: Arc::new(TaskMwInner {
                id: self.id,
                meta: self.meta,
                tags: self.tags,
                deps: self.deps,
                config_schema: self.config_schema,
                input_contract: unit(TypeTag::of::<In>()),
                output_contract: unit(TypeTag::of::<Out>()),
                everywhere: self.everywhere,
                body: erased,
            }),
            config: None,
            _marker: PhantomData,
        }
    }
}

// ── Resource middleware definition ──────────────────────────────────────────

/// A resource middleware definition wrapping resource initialization.
pub struct ResourceMiddleware<C = ()> {
    pub(crate) inner: Arc<ResourceMwInner>,
    pub(crate) config: Option<AnyValue>,
    _marker: PhantomData<fn(C)>,
}

impl<C> Clone for ResourceMiddleware<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
            _marker: PhantomData,
        }
    }
}

impl<C> ResourceMiddleware<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn builder(id: impl Into<String>) -> ResourceMwBuilder<C> {
        ResourceMwBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Attach a per-use config; panics on schema rejection like
    /// [`TaskMiddleware::with`].
    pub fn with(&self, config: C) -> Self {
        self.try_with(config)
            .expect("middleware config failed schema validation")
    }

    pub fn try_with(&self, config: C) -> Result<Self, Error> {
        if let Some(schema) = &self.inner.config_schema {
            (schema.as_ref())(&config).map_err(|message| {
                Error::Schema(SchemaViolation {
                    boundary: SchemaBoundary::MiddlewareConfig,
                    owner: self.inner.id.clone(),
                    message,
                })
            })?;
        }
        Ok(Self {
            inner: self.inner.clone(),
            config: Some(Arc::new(config)),
            _marker: PhantomData,
        })
    }
}

impl<C> From<&ResourceMiddleware<C>> for Definition {
    fn from(mw: &ResourceMiddleware<C>) -> Self {
        Definition {
            node: DefNode::ResourceMiddleware(ResourceMwCell {
                inner: mw.inner.clone(),
            }),
        }
    }
}

impl<C> From<ResourceMiddleware<C>> for Definition {
    fn from(mw: ResourceMiddleware<C>) -> Self {
        Definition {
            node: DefNode::ResourceMiddleware(ResourceMwCell { inner: mw.inner }),
        }
    }
}

impl<C> From<&ResourceMiddleware<C>> for MwUse {
    fn from(mw: &ResourceMiddleware<C>) -> Self {
        MwUse {
            kind: MwKind::Resource,
            id: mw.inner.id.clone(),
            config: mw.config.clone(),
        }
    }
}

/// Builder for [`ResourceMiddleware`].
pub struct ResourceMwBuilder<C> {
    id: String,
    meta: Meta,
    tags: Vec<AppliedTag>,
    deps: Vec<DepRef>,
    config_schema: Option<ErasedSchema>,
    everywhere: Everywhere,
    _marker: PhantomData<fn(C)>,
}

impl<C> ResourceMwBuilder<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: Meta::default(),
            tags: Vec::new(),
            deps: Vec::new(),
            config_schema: None,
            everywhere: Everywhere::No,
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

    pub fn dependencies(mut self, deps: impl IntoIterator<Item = DepRef>) -> Self {
        self.deps.extend(deps);
        self
    }

    pub fn config_schema(mut self, schema: Schema<C>) -> Self {
        self.config_schema = Some(schema.erase());
        self
    }

    /// Apply this middleware to every resource automatically.
    pub fn everywhere(mut self) -> Self {
        self.everywhere = Everywhere::All;
        self
    }

    /// Apply this middleware automatically to resources matching the
    /// predicate.
    pub fn everywhere_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResourceOverview) -> bool + Send + Sync + 'static,
    {
        self.everywhere = Everywhere::ResourceWhere(Arc::new(predicate));
        self
    }

    /// Set the layer body and finish the definition.
    pub fn run<F, Fut>(self, body: F) -> ResourceMiddleware<C>
    where
        F: Fn(ResourceMwCtx, ResourceNext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<AnyValue, Error>> + Send + 'static,
    {
        let erased: ResourceMwBody = Arc::new(move |ctx, next| Box::pin(body(ctx, next)));
        ResourceMiddleware {
            inner: Arc::new(ResourceMwInner {
                id: self.id,
                meta: self.meta,
                tags: self.tags,
                deps: self.deps,
                config_schema: self.config_schema,
                everywhere: self.everywhere,
                body: erased,
            }),
            config: None,
            _marker: PhantomData,
        }
    }
}
