//! The invoker: executes tasks and resource inits through their middleware
//! onions, with schema validation at the edges and per-task interceptors
//! wrapped around the body.

use std::sync::Arc;

use crate::builtins::TunnelValue;
use crate::chain::{self, BaseFn, ResourceBaseFn};
use crate::defs::resource::InitContext;
use crate::defs::task::{CallContext, TaskInner};
use crate::defs::{ResourceCell, ResourceOverview, TaskOverview};
use crate::deps::Deps;
use crate::error::{Error, SchemaBoundary};
use crate::journal::Journal;
use crate::runtime::Kernel;
use crate::schema::check_erased;
use crate::store::ResourceSlot;
use crate::types::{boxed, AnyValue};

/// Execute a task with an erased input.
pub(crate) async fn run_task(
    kernel: &Arc<Kernel>,
    task: Arc<TaskInner>,
    input: AnyValue,
    journal: Option<Journal>,
) -> Result<AnyValue, Error> {
    kernel.ensure_live()?;

    // Phantom tasks route through their owning tunnel, or resolve to their
    // absent value when nothing claimed them.
    if task.body.is_none() {
        if let Some(tunnel_id) = kernel.store.ownership.get(&task.id) {
            let value = kernel
                .store
                .resource_value(tunnel_id)
                .ok_or_else(|| crate::deps::not_initialized(tunnel_id))?;
            let tunnel = value.downcast::<TunnelValue>().map_err(|_| {
                Error::msg(format!("tunnel '{tunnel_id}' value is not a TunnelValue"))
            })?;
            let out = (tunnel.run.as_ref())(task.id.clone(), input).await?;
            check_erased(
                &task.result_schema,
                out.as_ref(),
                SchemaBoundary::Result,
                &task.id,
            )?;
            return Ok(out);
        }
        return Ok(task
            .phantom_value
            .clone()
            .expect("phantom task carries its absent value"));
    }

    let journal = journal.unwrap_or_default();

    check_erased(
        &task.input_schema,
        input.as_ref(),
        SchemaBoundary::Input,
        &task.id,
    )?;

    let entries = kernel.chains.task_chain(&kernel.store, &task)?;

    let overview = TaskOverview {
        id: task.id.clone(),
        meta: task.meta.clone(),
        tags: task.tags.clone(),
    };

    // The base of the onion: per-task interceptors wrapped around the body,
    // first registered outermost. Rebuilt per call because interceptors are
    // consume-once continuations.
    let base: BaseFn = {
        let kernel = kernel.clone();
        let task = task.clone();
        let journal = journal.clone();
        let interceptors = kernel.store.task_interceptors_for(&task.id);
        Arc::new(move |input: AnyValue| {
            let body = task.body.clone().expect("checked above");
            let deps = Deps::new(kernel.clone(), task.id.clone(), &task.deps);
            let ctx = CallContext {
                journal: journal.clone(),
            };
            let mut call: Box<
                dyn FnOnce(AnyValue) -> crate::types::BoxFuture<Result<AnyValue, Error>> + Send,
            > = Box::new(move |input| (body.as_ref())(input, deps, ctx));
            for interceptor in interceptors.iter().rev() {
                let interceptor = interceptor.clone();
                let inner = call;
                call = Box::new(move |input| {
                    (interceptor.as_ref())(crate::defs::middleware::Next::new(inner), input)
                });
            }
            call(input)
        })
    };

    let out = chain::run_task_chain(kernel.clone(), entries, overview, journal, base, input).await?;

    check_erased(
        &task.result_schema,
        out.as_ref(),
        SchemaBoundary::Result,
        &task.id,
    )?;
    Ok(out)
}

/// Initialize one resource through its middleware chain and record the
/// slot.
pub(crate) async fn init_resource(
    kernel: &Arc<Kernel>,
    id: &str,
    cell: &ResourceCell,
) -> Result<(), Error> {
    let entries = Arc::new(kernel.chains.resource_chain(&kernel.store, &cell.inner)?);

    let private = cell.inner.context_factory.as_deref().map(|factory| factory());
    let journal = Journal::new();
    let deps = Deps::new(
        kernel.clone(),
        id.to_string(),
        &cell.inner.deps_for(cell.config.as_ref()),
    );
    let init_ctx = InitContext {
        journal: journal.clone(),
        private: private.clone(),
        kernel: Some(kernel.clone()),
    };

    let base: ResourceBaseFn = {
        let init = cell.inner.init.clone();
        Arc::new(move |config| match init.as_deref() {
            Some(init) => init(config, deps.clone(), init_ctx.clone()),
            None => boxed(async { Ok(Arc::new(()) as AnyValue) }),
        })
    };

    let overview = ResourceOverview {
        id: id.to_string(),
        meta: cell.inner.meta.clone(),
        tags: cell.inner.tags.clone(),
    };

    let value = chain::run_resource_chain(
        kernel.clone(),
        entries,
        overview,
        journal,
        base,
        cell.config.clone(),
    )
    .await?;

    check_erased(
        &cell.inner.result_schema,
        value.as_ref(),
        SchemaBoundary::Result,
        id,
    )?;

    kernel.store.record_initialized(
        id,
        ResourceSlot {
            value,
            config: cell.config.clone(),
            private,
        },
    );
    tracing::debug!(resource = %id, "resource initialized");
    Ok(())
}
