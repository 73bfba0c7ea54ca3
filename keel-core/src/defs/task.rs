//! Task definitions: named async units of work with injected dependencies.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::deps::Deps;
use crate::error::Error;
use crate::journal::Journal;
use crate::schema::{ErasedSchema, Schema};
use crate::types::{boxed, AnyValue, BoxFuture, TypeTag};

use super::tag::AppliedTag;
use super::{DefNode, Definition, DepRef, DefKind, Meta, MwUse};

/// Per-invocation context handed to a task body alongside its input and
/// dependencies.
#[derive(Clone)]
pub struct CallContext {
    /// The journal bound to this invocation.
    pub journal: Journal,
}

pub(crate) type TaskBody =
    Arc<dyn Fn(AnyValue, Deps, CallContext) -> BoxFuture<Result<AnyValue, Error>> + Send + Sync>;

pub(crate) struct TaskInner {
    pub(crate) id: String,
    pub(crate) meta: Meta,
    pub(crate) tags: Vec<AppliedTag>,
    pub(crate) deps: Vec<DepRef>,
    pub(crate) middleware: Vec<MwUse>,
    pub(crate) input_schema: Option<ErasedSchema>,
    pub(crate) result_schema: Option<ErasedSchema>,
    pub(crate) input_type: TypeTag,
    pub(crate) output_type: TypeTag,
    /// `None` marks a phantom task, routed by a tunnel or resolving to its
    /// absent value.
    pub(crate) body: Option<TaskBody>,
    /// For phantom tasks, the preconstructed "no result" value.
    pub(crate) phantom_value: Option<AnyValue>,
}

/// A task definition: a named async operation taking `I` and producing `O`.
///
/// ```ignore
/// let hello = Task::<String, String>::builder("app.tasks.hello")
///     .run(|name: String, _deps, _ctx| async move { Ok(format!("hello {name}")) })
///     .build();
/// ```
pub struct Task<I = (), O = ()> {
    pub(crate) inner: Arc<TaskInner>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for Task<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<I, O> Task<I, O> {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether this task has no local body.
    pub fn is_phantom(&self) -> bool {
        self.inner.body.is_none()
    }
}

impl<I, O> Task<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    pub fn builder(id: impl Into<String>) -> TaskBuilder<I, O> {
        TaskBuilder::new(id)
    }
}

impl<I, O> From<&Task<I, O>> for Definition {
    fn from(task: &Task<I, O>) -> Self {
        Definition {
            node: DefNode::Task(task.inner.clone()),
        }
    }
}

impl<I, O> From<Task<I, O>> for Definition {
    fn from(task: Task<I, O>) -> Self {
        Definition {
            node: DefNode::Task(task.inner),
        }
    }
}

impl<I, O> From<&Task<I, O>> for DepRef {
    fn from(task: &Task<I, O>) -> Self {
        DepRef {
            id: task.inner.id.clone(),
            kind: DefKind::Task,
            optional: false,
        }
    }
}

/// Builder for [`Task`].
pub struct TaskBuilder<I, O> {
    id: String,
    meta: Meta,
    tags: Vec<AppliedTag>,
    deps: Vec<DepRef>,
    middleware: Vec<MwUse>,
    input_schema: Option<ErasedSchema>,
    result_schema: Option<ErasedSchema>,
    body: Option<TaskBody>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> TaskBuilder<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: Meta::default(),
            tags: Vec::new(),
            deps: Vec::new(),
            middleware: Vec::new(),
            input_schema: None,
            result_schema: None,
            body: None,
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

    /// Declare the definitions this task's body may ask for.
    pub fn dependencies(mut self, deps: impl IntoIterator<Item = DepRef>) -> Self {
        self.deps.extend(deps);
        self
    }

    /// Attach middleware, outermost first.
    pub fn middleware(mut self, middleware: impl IntoIterator<Item = MwUse>) -> Self {
        self.middleware.extend(middleware);
        self
    }

    pub fn input_schema(mut self, schema: Schema<I>) -> Self {
        self.input_schema = Some(schema.erase());
        self
    }

    pub fn result_schema(mut self, schema: Schema<O>) -> Self {
        self.result_schema = Some(schema.erase());
        self
    }

    /// Set the task body.
    pub fn run<F, Fut>(mut self, body: F) -> Self
    where
        F: Fn(I, Deps, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, Error>> + Send + 'static,
    {
        let body = Arc::new(body);
        self.body = Some(Arc::new(move |input: AnyValue, deps: Deps, ctx: CallContext| {
            let body = body.clone();
            boxed(async move {
                let input = input.downcast::<I>().map_err(|_| {
                    Error::msg(format!(
                        "task input is not a '{}'",
                        std::any::type_name::<I>()
                    ))
                })?;
                let out = (body.as_ref())((*input).clone(), deps, ctx).await?;
                Ok(Arc::new(out) as AnyValue)
            })
        }));
        self
    }

    /// Finish the definition.
    ///
    /// # Panics
    ///
    /// Panics if no body was set. Bodiless tasks are built with `phantom()`,
    /// which pins down the absent-result type.
    pub fn build(self) -> Task<I, O> {
        assert!(
            self.body.is_some(),
            "Task '{}' has no body; use phantom() for tunnel-routed tasks",
            self.id
        );
        self.finish(None)
    }

    fn finish(self, phantom_value: Option<AnyValue>) -> Task<I, O> {
        Task {
            inner: Arc::new(TaskInner {
                id: self.id,
                meta: self.meta,
                tags: self.tags,
                deps: self.deps,
                middleware: self.middleware,
                input_schema: self.input_schema,
                result_schema: self.result_schema,
                input_type: TypeTag::of::<I>(),
                output_type: TypeTag::of::<O>(),
                body: self.body,
                phantom_value,
            }),
            _marker: PhantomData,
        }
    }
}

impl<I, O> TaskBuilder<I, Option<O>>
where
    I: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Finish as a phantom task: no local body. Invoking it runs the owning
    /// tunnel's route when one exists, and resolves to `None` otherwise.
    pub fn phantom(mut self) -> Task<I, Option<O>> {
        self.body = None;
        self.finish(Some(Arc::new(None::<O>) as AnyValue))
    }
}
