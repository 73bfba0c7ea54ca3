//! The injected-dependency handle.
//!
//! Bodies (task, resource init/dispose, hook, middleware) receive a [`Deps`]
//! scoped to their declared dependency list. Asking for anything undeclared
//! is rejected, so the graph the validator approved is the graph that runs.

use std::collections::HashMap;
use std::sync::Arc;

use crate::defs::app_error::ErrorKind;
use crate::defs::async_ctx::AsyncContext;
use crate::defs::event::Event;
use crate::defs::hook::Hook;
use crate::defs::resource::Resource;
use crate::defs::task::Task;
use crate::defs::DepRef;
use crate::error::{Error, LifecycleError, RegistryError};
use crate::events::{EmitOptions, EmitReport};
use crate::journal::Journal;
use crate::runtime::Kernel;

/// Dependencies available to one body, scoped to its declaration list.
#[derive(Clone)]
pub struct Deps {
    kernel: Arc<Kernel>,
    owner: Arc<str>,
    /// Declared dependency ids mapped to their optionality.
    declared: Arc<HashMap<String, bool>>,
}

impl Deps {
    pub(crate) fn new(kernel: Arc<Kernel>, owner: String, declared: &[DepRef]) -> Self {
        let declared = declared
            .iter()
            .map(|dep| (dep.id().to_string(), dep.is_optional()))
            .collect();
        Self {
            kernel,
            owner: owner.into(),
            declared: Arc::new(declared),
        }
    }

    fn check_declared(&self, id: &str) -> Result<bool, Error> {
        match self.declared.get(id) {
            Some(optional) => Ok(*optional),
            None => Err(Error::Registry(RegistryError::NotDeclared {
                owner: self.owner.to_string(),
                id: id.to_string(),
            })),
        }
    }

    /// Read an initialized resource value.
    pub fn resource<C, V>(&self, resource: &Resource<C, V>) -> Result<V, Error>
    where
        C: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.check_declared(resource.id())?;
        self.kernel.resource_value_typed(resource)
    }

    /// Read an optionally-declared resource: `None` when the reference did
    /// not resolve at registration time.
    pub fn try_resource<C, V>(&self, resource: &Resource<C, V>) -> Result<Option<V>, Error>
    where
        C: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.check_declared(resource.id())?;
        if !self.kernel.store.contains(resource.id()) {
            return Ok(None);
        }
        self.kernel.resource_value_typed(resource).map(Some)
    }

    /// A caller handle for a declared task.
    pub fn task<I, O>(&self, task: &Task<I, O>) -> Result<TaskCaller<I, O>, Error>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.check_declared(task.id())?;
        Ok(TaskCaller {
            kernel: self.kernel.clone(),
            task: task.clone(),
        })
    }

    /// A caller handle for an optionally-declared task.
    pub fn try_task<I, O>(&self, task: &Task<I, O>) -> Result<Option<TaskCaller<I, O>>, Error>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.check_declared(task.id())?;
        if !self.kernel.store.contains(task.id()) {
            return Ok(None);
        }
        Ok(Some(TaskCaller {
            kernel: self.kernel.clone(),
            task: task.clone(),
        }))
    }

    /// An emitter handle for a declared event.
    pub fn emitter<P>(&self, event: &Event<P>) -> Result<EventEmitter<P>, Error>
    where
        P: Send + Sync + 'static,
    {
        self.check_declared(event.id())?;
        Ok(EventEmitter {
            kernel: self.kernel.clone(),
            event: event.clone(),
        })
    }

    /// The hook descriptor for a declared hook dependency.
    pub fn hook(&self, hook: &Hook) -> Result<Hook, Error> {
        self.check_declared(hook.id())?;
        Ok(hook.clone())
    }

    /// The error helper for a declared error kind.
    pub fn error_kind<D>(&self, kind: &ErrorKind<D>) -> Result<ErrorKind<D>, Error>
    where
        D: Send + Sync + 'static,
    {
        self.check_declared(kind.id())?;
        Ok(kind.clone())
    }

    /// The handle for a declared async context.
    pub fn async_context<T>(&self, ctx: &AsyncContext<T>) -> Result<AsyncContext<T>, Error>
    where
        T: Send + Sync + 'static,
    {
        self.check_declared(ctx.id())?;
        Ok(ctx.clone())
    }
}

/// Callable handle to a task, produced by [`Deps::task`].
pub struct TaskCaller<I, O> {
    kernel: Arc<Kernel>,
    task: Task<I, O>,
}

impl<I, O> Clone for TaskCaller<I, O> {
    fn clone(&self) -> Self {
        Self {
            kernel: self.kernel.clone(),
            task: self.task.clone(),
        }
    }
}

impl<I, O> TaskCaller<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Invoke the task with a fresh journal.
    pub async fn call(&self, input: I) -> Result<O, Error> {
        self.kernel.run_task_typed(&self.task, input, None).await
    }

    /// Invoke the task, forwarding an existing journal into it.
    pub async fn call_with_journal(&self, input: I, journal: Journal) -> Result<O, Error> {
        self.kernel
            .run_task_typed(&self.task, input, Some(journal))
            .await
    }
}

/// Emitter handle to an event, produced by [`Deps::emitter`].
pub struct EventEmitter<P> {
    kernel: Arc<Kernel>,
    event: Event<P>,
}

impl<P> Clone for EventEmitter<P> {
    fn clone(&self) -> Self {
        Self {
            kernel: self.kernel.clone(),
            event: self.event.clone(),
        }
    }
}

impl<P> EventEmitter<P>
where
    P: Send + Sync + 'static,
{
    /// Emit with default options.
    pub async fn emit(&self, payload: P) -> Result<(), Error> {
        self.kernel
            .emit_typed(&self.event, payload, EmitOptions::default())
            .await
            .map(|_| ())
    }

    /// Emit with explicit options, resolving with the emission report.
    pub async fn emit_with(&self, payload: P, opts: EmitOptions) -> Result<EmitReport, Error> {
        self.kernel.emit_typed(&self.event, payload, opts).await
    }
}

/// Guard used by kernel code paths that need an initialized runtime.
pub(crate) fn not_initialized(id: &str) -> Error {
    Error::Lifecycle(LifecycleError::NotInitialized { id: id.to_string() })
}
