//! Ambient async contexts.
//!
//! Unlike the journal (explicit, per-invocation), an [`AsyncContext`] is
//! ambient: [`provide`](AsyncContext::provide) scopes a value around a
//! future, and any code running inside that future can read it back with
//! [`current`](AsyncContext::current) without threading a handle through
//! call signatures.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, LifecycleError};
use crate::types::{boxed, AnyValue};

use super::middleware::{Everywhere, Next, TaskMiddleware, TaskMwCtx, TaskMwInner};
use super::tag::AppliedTag;
use super::{DefKind, DefNode, Definition, DepRef, Meta};

tokio::task_local! {
    /// Values provided by enclosing `provide` scopes, keyed by context id.
    static ACTIVE_CONTEXTS: HashMap<String, AnyValue>;
}

pub(crate) struct AsyncCtxInner {
    pub(crate) id: String,
    pub(crate) meta: Meta,
    pub(crate) tags: Vec<AppliedTag>,
    /// Built once so repeated `require()` calls share one identity and
    /// deduplicate in the registry.
    pub(crate) require_mw: OnceLock<Arc<TaskMwInner>>,
    pub(crate) serialize:
        Option<Arc<dyn Fn(&(dyn std::any::Any + Send + Sync)) -> Result<String, Error> + Send + Sync>>,
    pub(crate) deserialize: Option<Arc<dyn Fn(&str) -> Result<AnyValue, Error> + Send + Sync>>,
}

/// An ambient, scope-provided context carrying values of type `T`.
///
/// ```ignore
/// let request_ctx = AsyncContext::<RequestInfo>::new("app.ctx.request");
///
/// request_ctx.provide(info, async {
///     // anywhere below this await point:
///     let info = request_ctx.current()?;
/// }).await;
/// ```
pub struct AsyncContext<T> {
    pub(crate) inner: Arc<AsyncCtxInner>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Clone for AsyncContext<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> AsyncContext<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(AsyncCtxInner {
                id: id.into(),
                meta: Meta::default(),
                tags: Vec::new(),
                require_mw: OnceLock::new(),
                serialize: None,
                deserialize: None,
            }),
            _marker: PhantomData,
        }
    }

    /// Create a context with serializer hooks, for transports that carry
    /// the value across process boundaries.
    pub fn serializable<S, D>(id: impl Into<String>, serialize: S, deserialize: D) -> Self
    where
        S: Fn(&T) -> Result<String, Error> + Send + Sync + 'static,
        D: Fn(&str) -> Result<T, Error> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(AsyncCtxInner {
                id: id.into(),
                meta: Meta::default(),
                tags: Vec::new(),
                require_mw: OnceLock::new(),
                serialize: Some(Arc::new(
                    move |value: &(dyn std::any::Any + Send + Sync)| match value
                        .downcast_ref::<T>()
                    {
                        Some(value) => serialize(value),
                        None => Err(Error::msg("async context value type mismatch")),
                    },
                )),
                deserialize: Some(Arc::new(move |raw: &str| {
                    deserialize(raw).map(|value| Arc::new(value) as AnyValue)
                })),
            }),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Run `fut` with `value` provided as the ambient context.
    ///
    /// Scopes nest: an inner `provide` shadows the outer value for the
    /// duration of its future.
    pub async fn provide<F>(&self, value: T, fut: F) -> F::Output
    where
        F: Future,
    {
        let mut scope = ACTIVE_CONTEXTS
            .try_with(|contexts| contexts.clone())
            .unwrap_or_default();
        scope.insert(self.inner.id.clone(), Arc::new(value) as AnyValue);
        ACTIVE_CONTEXTS.scope(scope, fut).await
    }

    /// Read the ambient value, failing when called outside a `provide`
    /// scope.
    pub fn current(&self) -> Result<Arc<T>, Error> {
        self.try_current()
            .ok_or_else(|| Error::Lifecycle(LifecycleError::ContextMissing {
                id: self.inner.id.clone(),
            }))
    }

    /// Read the ambient value, or `None` outside a scope.
    pub fn try_current(&self) -> Option<Arc<T>> {
        ACTIVE_CONTEXTS
            .try_with(|contexts| contexts.get(&self.inner.id).cloned())
            .ok()
            .flatten()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Serialize the given value through the context's serializer hook.
    pub fn serialize(&self, value: &T) -> Option<Result<String, Error>> {
        self.inner.serialize.as_deref().map(|f| f(value))
    }

    /// Deserialize a transported value through the context's hook.
    pub fn deserialize(&self, raw: &str) -> Option<Result<Arc<T>, Error>> {
        self.inner.deserialize.as_deref().map(|f| {
            f(raw).and_then(|value| {
                value
                    .downcast::<T>()
                    .map_err(|_| Error::msg("async context value type mismatch"))
            })
        })
    }

    /// A task middleware that rejects invocation outside a `provide` scope.
    ///
    /// The middleware's id derives from the context id; repeated calls
    /// return the same definition, so it can be registered once and
    /// attached to many tasks.
    pub fn require(&self) -> TaskMiddleware {
        let inner = self
            .inner
            .require_mw
            .get_or_init(|| {
                let ctx_id = self.inner.id.clone();
                Arc::new(TaskMwInner {
                    id: format!("{}.require", self.inner.id),
                    meta: Meta::described(format!(
                        "rejects invocation when '{ctx_id}' is not provided"
                    )),
                    tags: Vec::new(),
                    deps: Vec::new(),
                    config_schema: None,
                    input_contract: None,
                    output_contract: None,
                    everywhere: Everywhere::No,
                    body: Arc::new(move |ctx: TaskMwCtx, next: Next| {
                        let ctx_id = ctx_id.clone();
                        let input = ctx.input.clone();
                        boxed(async move {
                            let provided = ACTIVE_CONTEXTS
                                .try_with(|contexts| contexts.contains_key(&ctx_id))
                                .unwrap_or(false);
                            if !provided {
                                return Err(Error::Lifecycle(LifecycleError::ContextMissing {
                                    id: ctx_id,
                                }));
                            }
                            next.invoke(input).await
                        })
                    }),
                })
            })
            .clone();
        TaskMiddleware::from_inner(inner)
    }
}

impl<T> From<&AsyncContext<T>> for Definition {
    fn from(ctx: &AsyncContext<T>) -> Self {
        Definition {
            node: DefNode::AsyncContext(ctx.inner.clone()),
        }
    }
}

impl<T> From<AsyncContext<T>> for Definition {
    fn from(ctx: AsyncContext<T>) -> Self {
        Definition {
            node: DefNode::AsyncContext(ctx.inner),
        }
    }
}

impl<T> From<&AsyncContext<T>> for DepRef {
    fn from(ctx: &AsyncContext<T>) -> Self {
        DepRef {
            id: ctx.inner.id.clone(),
            kind: DefKind::AsyncContext,
            optional: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, Debug)]
    struct RequestInfo {
        trace: String,
    }

    #[tokio::test]
    async fn provide_then_current() {
        let ctx = AsyncContext::<RequestInfo>::new("test.ctx.request");
        assert!(ctx.try_current().is_none());

        let seen = ctx
            .provide(
                RequestInfo {
                    trace: "t-1".into(),
                },
                async { ctx.current().map(|info| info.trace.clone()) },
            )
            .await;
        assert_eq!(seen.unwrap(), "t-1");
        assert!(ctx.try_current().is_none());
    }

    #[tokio::test]
    async fn nested_provide_shadows() {
        let ctx = AsyncContext::<u32>::new("test.ctx.depth");
        let inner = ctx
            .provide(1, async {
                ctx.provide(2, async { *ctx.current().unwrap() }).await
            })
            .await;
        assert_eq!(inner, 2);
    }

    #[tokio::test]
    async fn current_outside_scope_fails() {
        let ctx = AsyncContext::<u32>::new("test.ctx.missing");
        let err = ctx.current().unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::ContextMissing { .. })
        ));
    }

    #[test]
    fn require_is_stable() {
        let ctx = AsyncContext::<u32>::new("test.ctx.stable");
        let a = ctx.require();
        let b = ctx.require();
        assert_eq!(a.id(), b.id());
        assert_eq!(
            Definition::from(&a).identity(),
            Definition::from(&b).identity()
        );
    }

    #[tokio::test]
    async fn serializer_hooks_roundtrip() {
        let ctx = AsyncContext::<u32>::serializable(
            "test.ctx.serde",
            |value| Ok(value.to_string()),
            |raw| raw.parse::<u32>().map_err(Error::other),
        );
        assert_eq!(ctx.serialize(&42).unwrap().unwrap(), "42");
        assert_eq!(*ctx.deserialize("42").unwrap().unwrap(), 42);
    }
}
