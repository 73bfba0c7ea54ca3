//! Resource definitions: long-lived singletons with an init/dispose
//! lifecycle, optional config, and the ability to register further
//! definitions (including overrides).

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::deps::Deps;
use crate::error::{Error, SchemaBoundary, SchemaViolation};
use crate::journal::Journal;
use crate::schema::{ErasedSchema, Schema};
use crate::types::{boxed, AnyValue, BoxFuture, TypeTag};

use super::middleware::{ErasedTaskInterceptor, TypedNext};
use super::tag::AppliedTag;
use super::task::Task;
use super::{DefKind, DefNode, Definition, DepRef, Meta, MwUse, ResourceCell};

/// Context handed to resource init and dispose bodies.
///
/// During init (before the store locks) it doubles as the registration
/// window for per-task, per-middleware, emission, and hook interceptors.
#[derive(Clone)]
pub struct InitContext {
    /// The journal bound to this init invocation.
    pub journal: Journal,
    pub(crate) private: Option<AnyValue>,
    pub(crate) kernel: Option<Arc<crate::runtime::Kernel>>,
}

impl InitContext {
    /// The per-instance private context produced by the resource's context
    /// factory, if one was declared.
    pub fn private<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.private
            .as_ref()
            .and_then(|ctx| ctx.clone().downcast::<T>().ok())
    }

    fn kernel(&self) -> Result<&Arc<crate::runtime::Kernel>, Error> {
        self.kernel
            .as_ref()
            .ok_or(Error::Registry(crate::error::RegistryError::Locked {
                operation: "interceptor registration",
            }))
    }

    /// Register a per-task interceptor.
    ///
    /// Interceptors run inside the task's middleware chain, wrapping the
    /// body. This window is only open during resource init; once the store
    /// locks, registration is rejected.
    pub fn intercept_task<I, O, F, Fut>(&self, task: &Task<I, O>, f: F) -> Result<(), Error>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
        F: Fn(TypedNext<I, O>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, Error>> + Send + 'static,
    {
        let kernel = self.kernel()?;
        kernel
            .store
            .add_task_interceptor(task.id(), erase_interceptor(f))
    }

    /// Register an interceptor around a specific middleware instance.
    pub fn intercept_middleware<C, In, Out, F, Fut>(
        &self,
        middleware: &super::middleware::TaskMiddleware<C, In, Out>,
        f: F,
    ) -> Result<(), Error>
    where
        C: Clone + Send + Sync + 'static,
        In: 'static,
        Out: 'static,
        F: Fn(super::middleware::Next, AnyValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AnyValue, Error>> + Send + 'static,
    {
        let kernel = self.kernel()?;
        let erased: ErasedTaskInterceptor = Arc::new(move |next, input| Box::pin(f(next, input)));
        kernel.chains.add_mw_interceptor(middleware.id(), erased)
    }

    /// Register an interceptor around every emission.
    pub fn intercept_emissions<F, Fut>(&self, f: F) -> Result<(), Error>
    where
        F: Fn(crate::events::EmitNext, crate::defs::hook::RawEventData) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let kernel = self.kernel()?;
        kernel
            .events
            .add_emit_interceptor(Arc::new(move |next, envelope| Box::pin(f(next, envelope))))
    }

    /// Register an interceptor around every hook invocation.
    pub fn intercept_hooks<F, Fut>(&self, f: F) -> Result<(), Error>
    where
        F: Fn(crate::events::HookNext, Arc<str>, crate::defs::hook::RawEventData) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<Option<AnyValue>, Error>> + Send + 'static,
    {
        let kernel = self.kernel()?;
        kernel
            .events
            .add_hook_interceptor(Arc::new(move |next, hook_id, envelope| {
                Box::pin(f(next, hook_id, envelope))
            }))
    }
}

/// Wrap a typed per-task interceptor into the stored erased shape.
fn erase_interceptor<I, O, F, Fut>(f: F) -> ErasedTaskInterceptor
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    F: Fn(TypedNext<I, O>, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, Error>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |next, input: AnyValue| {
        let f = f.clone();
        boxed(async move {
            let input = input.downcast::<I>().map_err(|_| {
                Error::msg(format!(
                    "interceptor input is not a '{}'",
                    std::any::type_name::<I>()
                ))
            })?;
            let out = (f.as_ref())(TypedNext::new(next), (*input).clone()).await?;
            Ok(Arc::new(out) as AnyValue)
        })
    })
}

pub(crate) type InitFn = Arc<
    dyn Fn(Option<AnyValue>, Deps, InitContext) -> BoxFuture<Result<AnyValue, Error>>
        + Send
        + Sync,
>;

pub(crate) type DisposeFn = Arc<
    dyn Fn(AnyValue, Option<AnyValue>, Deps, InitContext) -> BoxFuture<Result<(), Error>>
        + Send
        + Sync,
>;

/// Dependency declaration: either a static list or a function of config.
pub(crate) enum DepsDecl {
    Static(Vec<DepRef>),
    FromConfig(Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Vec<DepRef> + Send + Sync>),
}

/// Child-definition declaration: either a static list or a function of
/// config.
pub(crate) enum RegisterDecl {
    Static(Vec<Definition>),
    FromConfig(Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Vec<Definition> + Send + Sync>),
}

pub(crate) struct ResourceInner {
    pub(crate) id: String,
    pub(crate) meta: Meta,
    pub(crate) tags: Vec<AppliedTag>,
    pub(crate) deps: DepsDecl,
    pub(crate) register: RegisterDecl,
    pub(crate) overrides: Vec<Definition>,
    pub(crate) middleware: Vec<MwUse>,
    pub(crate) config_schema: Option<ErasedSchema>,
    pub(crate) result_schema: Option<ErasedSchema>,
    pub(crate) config_type: TypeTag,
    pub(crate) value_type: TypeTag,
    pub(crate) context_factory: Option<Arc<dyn Fn() -> AnyValue + Send + Sync>>,
    pub(crate) init: Option<InitFn>,
    pub(crate) dispose: Option<DisposeFn>,
}

impl ResourceInner {
    /// Resolve the declared dependencies against an applied config.
    pub(crate) fn deps_for(&self, config: Option<&AnyValue>) -> Vec<DepRef> {
        match &self.deps {
            DepsDecl::Static(deps) => deps.clone(),
            DepsDecl::FromConfig(f) => match config {
                Some(config) => (f.as_ref())(config.as_ref()),
                None => Vec::new(),
            },
        }
    }

    /// Resolve the registered child definitions against an applied config.
    pub(crate) fn register_for(&self, config: Option<&AnyValue>) -> Vec<Definition> {
        match &self.register {
            RegisterDecl::Static(defs) => defs.clone(),
            RegisterDecl::FromConfig(f) => match config {
                Some(config) => (f.as_ref())(config.as_ref()),
                None => Vec::new(),
            },
        }
    }
}

/// A resource definition: a singleton with config `C` and value `V`.
///
/// ```ignore
/// let db = Resource::<DbConfig, Pool>::builder("app.resources.db")
///     .init(|cfg, _deps, _ctx| async move { Pool::connect(&cfg.url).await })
///     .dispose(|pool, _cfg, _deps, _ctx| async move { pool.close().await; Ok(()) })
///     .build();
///
/// let configured = db.with(DbConfig { url: "sqlite::memory:".into() });
/// ```
pub struct Resource<C = (), V = ()> {
    pub(crate) inner: Arc<ResourceInner>,
    pub(crate) config: Option<AnyValue>,
    _marker: PhantomData<fn(C) -> V>,
}

impl<C, V> Clone for Resource<C, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
            _marker: PhantomData,
        }
    }
}

impl<C, V> Resource<C, V> {
    pub fn id(&self) -> &str {
        &self.inner.id
    }
}

impl<C, V> Resource<C, V>
where
    C: Clone + Default + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(id: impl Into<String>) -> ResourceBuilder<C, V> {
        ResourceBuilder::new(id)
    }
}

impl<C, V> Resource<C, V>
where
    C: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Bind this resource to a config value.
    ///
    /// # Panics
    ///
    /// Panics if the resource declares a config schema and the value is
    /// rejected. Use [`try_with`](Self::try_with) for the fallible variant.
    pub fn with(&self, config: C) -> Self {
        self.try_with(config)
            .expect("resource config failed schema validation")
    }

    /// Bind this resource to a config value, returning the schema error
    /// instead of panicking.
    pub fn try_with(&self, config: C) -> Result<Self, Error> {
        if let Some(schema) = &self.inner.config_schema {
            (schema.as_ref())(&config).map_err(|message| {
                Error::Schema(SchemaViolation {
                    boundary: SchemaBoundary::Config,
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

impl<C, V> From<&Resource<C, V>> for Definition {
    fn from(resource: &Resource<C, V>) -> Self {
        Definition {
            node: DefNode::Resource(ResourceCell {
                inner: resource.inner.clone(),
                config: resource.config.clone(),
            }),
        }
    }
}

impl<C, V> From<Resource<C, V>> for Definition {
    fn from(resource: Resource<C, V>) -> Self {
        Definition {
            node: DefNode::Resource(ResourceCell {
                inner: resource.inner,
                config: resource.config,
            }),
        }
    }
}

impl<C, V> From<&Resource<C, V>> for DepRef {
    fn from(resource: &Resource<C, V>) -> Self {
        DepRef {
            id: resource.inner.id.clone(),
            kind: DefKind::Resource,
            optional: false,
        }
    }
}

/// Builder for [`Resource`].
pub struct ResourceBuilder<C, V> {
    id: String,
    meta: Meta,
    tags: Vec<AppliedTag>,
    deps: DepsDecl,
    register: RegisterDecl,
    overrides: Vec<Definition>,
    middleware: Vec<MwUse>,
    config_schema: Option<ErasedSchema>,
    result_schema: Option<ErasedSchema>,
    context_factory: Option<Arc<dyn Fn() -> AnyValue + Send + Sync>>,
    init: Option<InitFn>,
    dispose: Option<DisposeFn>,
    _marker: PhantomData<fn(C) -> V>,
}

impl<C, V> ResourceBuilder<C, V>
where
    C: Clone + Default + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: Meta::default(),
            tags: Vec::new(),
            deps: DepsDecl::Static(Vec::new()),
            register: RegisterDecl::Static(Vec::new()),
            overrides: Vec::new(),
            middleware: Vec::new(),
            config_schema: None,
            result_schema: None,
            context_factory: None,
            init: None,
            dispose: None,
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

    /// Declare static dependencies.
    pub fn dependencies(mut self, deps: impl IntoIterator<Item = DepRef>) -> Self {
        self.deps = DepsDecl::Static(deps.into_iter().collect());
        self
    }

    /// Declare dependencies as a function of the applied config.
    pub fn dependencies_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&C) -> Vec<DepRef> + Send + Sync + 'static,
    {
        self.deps = DepsDecl::FromConfig(Arc::new(move |config| {
            match config.downcast_ref::<C>() {
                Some(config) => f(config),
                None => Vec::new(),
            }
        }));
        self
    }

    /// Register child definitions.
    pub fn register(mut self, defs: impl IntoIterator<Item = Definition>) -> Self {
        self.register = RegisterDecl::Static(defs.into_iter().collect());
        self
    }

    /// Register child definitions as a function of the applied config.
    pub fn register_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&C) -> Vec<Definition> + Send + Sync + 'static,
    {
        self.register = RegisterDecl::FromConfig(Arc::new(move |config| {
            match config.downcast_ref::<C>() {
                Some(config) => f(config),
                None => Vec::new(),
            }
        }));
        self
    }

    /// Declare replacement definitions, matched by id against already
    /// registered targets. Overrides declared closer to the root win.
    pub fn overrides(mut self, defs: impl IntoIterator<Item = Definition>) -> Self {
        self.overrides.extend(defs);
        self
    }

    /// Attach resource middleware, outermost first.
    pub fn middleware(mut self, middleware: impl IntoIterator<Item = MwUse>) -> Self {
        self.middleware.extend(middleware);
        self
    }

    pub fn config_schema(mut self, schema: Schema<C>) -> Self {
        self.config_schema = Some(schema.erase());
        self
    }

    pub fn result_schema(mut self, schema: Schema<V>) -> Self {
        self.result_schema = Some(schema.erase());
        self
    }

    /// Declare a per-instance private context, created fresh before init
    /// and handed to both init and dispose.
    pub fn context<T, F>(mut self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.context_factory = Some(Arc::new(move || Arc::new(factory()) as AnyValue));
        self
    }

    /// Set the init body. A resource without one is purely structural (it
    /// registers children and carries tags) and initializes to the unit
    /// value.
    pub fn init<F, Fut>(mut self, init: F) -> Self
    where
        F: Fn(C, Deps, InitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, Error>> + Send + 'static,
    {
        let init = Arc::new(init);
        self.init = Some(Arc::new(
            move |config: Option<AnyValue>, deps: Deps, ctx: InitContext| {
                let init = init.clone();
                boxed(async move {
                    let config = downcast_config::<C>(config)?;
                    let value = (init.as_ref())(config, deps, ctx).await?;
                    Ok(Arc::new(value) as AnyValue)
                })
            },
        ));
        self
    }

    /// Set the dispose body, called with the initialized value during
    /// teardown.
    pub fn dispose<F, Fut>(mut self, dispose: F) -> Self
    where
        F: Fn(V, C, Deps, InitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let dispose = Arc::new(dispose);
        self.dispose = Some(Arc::new(
            move |value: AnyValue, config: Option<AnyValue>, deps: Deps, ctx: InitContext| {
                let dispose = dispose.clone();
                boxed(async move {
                    let value = value.downcast::<V>().map_err(|_| {
                        Error::msg(format!(
                            "resource value is not a '{}'",
                            std::any::type_name::<V>()
                        ))
                    })?;
                    let config = downcast_config::<C>(config)?;
                    (dispose.as_ref())((*value).clone(), config, deps, ctx).await
                })
            },
        ));
        self
    }

    pub fn build(self) -> Resource<C, V> {
        Resource {
            inner: Arc::new(ResourceInner {
                id: self.id,
                meta: self.meta,
                tags: self.tags,
                deps: self.deps,
                register: self.register,
                overrides: self.overrides,
                middleware: self.middleware,
                config_schema: self.config_schema,
                result_schema: self.result_schema,
                config_type: TypeTag::of::<C>(),
                value_type: TypeTag::of::<V>(),
                context_factory: self.context_factory,
                init: self.init,
                dispose: self.dispose,
            }),
            config: None,
            _marker: PhantomData,
        }
    }
}

/// A resource registered without `.with(...)` initializes with the config
/// type's default.
fn downcast_config<C: Clone + Default + Send + Sync + 'static>(
    config: Option<AnyValue>,
) -> Result<C, Error> {
    match config {
        Some(config) => config
            .downcast::<C>()
            .map(|arc| (*arc).clone())
            .map_err(|_| {
                Error::msg(format!(
                    "resource config is not a '{}'",
                    std::any::type_name::<C>()
                ))
            }),
        None => Ok(C::default()),
    }
}
