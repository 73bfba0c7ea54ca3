//! The middleware manager: computes per-task and per-resource chains,
//! applies interceptors, and runs the onion.
//!
//! Chain order: global middleware first (selection via `everywhere`, minus
//! any middleware that transitively depends on the wrapped task), then
//! locally declared middleware in declaration order. The first layer is the
//! outermost; it sees the input before anyone else and the output after
//! everyone else.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::defs::middleware::{
    ErasedTaskInterceptor, Everywhere, Next, ResourceMwCtx, ResourceMwInner, ResourceNext,
    TaskMwCtx, TaskMwInner,
};
use crate::defs::resource::ResourceInner;
use crate::defs::task::TaskInner;
use crate::defs::{MwKind, ResourceOverview, TaskOverview};
use crate::deps::Deps;
use crate::error::{ContractSide, ContractViolation, Error, RegistryError};
use crate::store::Store;
use crate::types::{AnyValue, BoxFuture};

pub(crate) type BaseFn = Arc<dyn Fn(AnyValue) -> BoxFuture<Result<AnyValue, Error>> + Send + Sync>;

pub(crate) type ResourceBaseFn =
    Arc<dyn Fn(Option<AnyValue>) -> BoxFuture<Result<AnyValue, Error>> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct TaskChainEntry {
    pub(crate) mw: Arc<TaskMwInner>,
    pub(crate) config: Option<AnyValue>,
    pub(crate) interceptors: Vec<ErasedTaskInterceptor>,
}

#[derive(Clone)]
pub(crate) struct ResourceChainEntry {
    pub(crate) mw: Arc<ResourceMwInner>,
    pub(crate) config: Option<AnyValue>,
}

/// Owns chain computation and the per-middleware interceptor table.
pub(crate) struct ChainStore {
    /// Globally applied task middleware, in registration order.
    global_task: Vec<Arc<TaskMwInner>>,
    /// Globally applied resource middleware, in registration order.
    global_resource: Vec<Arc<ResourceMwInner>>,
    /// Transitive dependency closure per middleware id, for the
    /// self-dependency exclusion rule.
    mw_transitive: HashMap<String, HashSet<String>>,
    /// Per-middleware interceptors, keyed by middleware id.
    mw_interceptors: Mutex<HashMap<String, Vec<ErasedTaskInterceptor>>>,
    /// Memoized task chains; populated only after freeze.
    task_chains: DashMap<String, Arc<Vec<TaskChainEntry>>>,
    frozen: AtomicBool,
}

impl ChainStore {
    pub(crate) fn build(store: &Store) -> Self {
        let mut global_task = Vec::new();
        let mut global_resource = Vec::new();

        for id in store.insertion_order() {
            if let Some(cell) = store.task_mw(id) {
                if !matches!(cell.inner.everywhere, Everywhere::No) {
                    global_task.push(cell.inner.clone());
                }
            }
            if let Some(cell) = store.resource_mw(id) {
                if !matches!(cell.inner.everywhere, Everywhere::No) {
                    global_resource.push(cell.inner.clone());
                }
            }
        }

        let mw_transitive = compute_transitive_deps(store);

        Self {
            global_task,
            global_resource,
            mw_transitive,
            mw_interceptors: Mutex::new(HashMap::new()),
            task_chains: DashMap::new(),
            frozen: AtomicBool::new(false),
        }
    }

    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub(crate) fn add_mw_interceptor(
        &self,
        mw_id: &str,
        interceptor: ErasedTaskInterceptor,
    ) -> Result<(), Error> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::Registry(RegistryError::Locked {
                operation: "middleware interceptor registration",
            }));
        }
        self.mw_interceptors
            .lock()
            .unwrap()
            .entry(mw_id.to_string())
            .or_default()
            .push(interceptor);
        Ok(())
    }

    /// The ordered chain for a task: globals, then locals.
    pub(crate) fn task_chain(
        &self,
        store: &Store,
        task: &Arc<TaskInner>,
    ) -> Result<Arc<Vec<TaskChainEntry>>, Error> {
        let frozen = self.frozen.load(Ordering::SeqCst);
        if frozen {
            if let Some(chain) = self.task_chains.get(&task.id) {
                return Ok(chain.clone());
            }
        }

        let overview = TaskOverview {
            id: task.id.clone(),
            meta: task.meta.clone(),
            tags: task.tags.clone(),
        };

        let mut entries = Vec::new();
        let interceptors = self.mw_interceptors.lock().unwrap();

        for mw in &self.global_task {
            let selected = match &mw.everywhere {
                Everywhere::All => true,
                Everywhere::TaskWhere(predicate) => (predicate.as_ref())(&overview),
                _ => false,
            };
            let self_dependent = self
                .mw_transitive
                .get(&mw.id)
                .is_some_and(|closure| closure.contains(&task.id));
            if selected && !self_dependent {
                entries.push(TaskChainEntry {
                    mw: mw.clone(),
                    config: None,
                    interceptors: interceptors.get(&mw.id).cloned().unwrap_or_default(),
                });
            }
        }

        for mw_use in &task.middleware {
            if mw_use.kind != MwKind::Task {
                continue;
            }
            let cell = store.task_mw(&mw_use.id).ok_or_else(|| {
                Error::Registry(RegistryError::UnknownId {
                    id: mw_use.id.clone(),
                })
            })?;
            entries.push(TaskChainEntry {
                mw: cell.inner.clone(),
                config: mw_use.config.clone(),
                interceptors: interceptors.get(&mw_use.id).cloned().unwrap_or_default(),
            });
        }
        drop(interceptors);

        for entry in &entries {
            check_task_contracts(task, &entry.mw)?;
        }

        let chain = Arc::new(entries);
        if frozen {
            self.task_chains.insert(task.id.clone(), chain.clone());
        }
        Ok(chain)
    }

    /// The ordered chain for a resource init.
    pub(crate) fn resource_chain(
        &self,
        store: &Store,
        resource: &Arc<ResourceInner>,
    ) -> Result<Vec<ResourceChainEntry>, Error> {
        let overview = ResourceOverview {
            id: resource.id.clone(),
            meta: resource.meta.clone(),
            tags: resource.tags.clone(),
        };

        let mut entries = Vec::new();
        for mw in &self.global_resource {
            let selected = match &mw.everywhere {
                Everywhere::All => true,
                Everywhere::ResourceWhere(predicate) => (predicate.as_ref())(&overview),
                _ => false,
            };
            let self_dependent = self
                .mw_transitive
                .get(&mw.id)
                .is_some_and(|closure| closure.contains(&resource.id));
            if selected && !self_dependent {
                entries.push(ResourceChainEntry {
                    mw: mw.clone(),
                    config: None,
                });
            }
        }

        for mw_use in &resource.middleware {
            if mw_use.kind != MwKind::Resource {
                continue;
            }
            let cell = store.resource_mw(&mw_use.id).ok_or_else(|| {
                Error::Registry(RegistryError::UnknownId {
                    id: mw_use.id.clone(),
                })
            })?;
            entries.push(ResourceChainEntry {
                mw: cell.inner.clone(),
                config: mw_use.config.clone(),
            });
        }

        Ok(entries)
    }
}

/// Exact-type runtime check of a middleware's declared contracts against
/// the wrapped task.
fn check_task_contracts(task: &Arc<TaskInner>, mw: &Arc<TaskMwInner>) -> Result<(), Error> {
    if let Some(contract) = &mw.input_contract {
        if contract.id != task.input_type.id {
            return Err(Error::Contract(ContractViolation {
                owner: task.id.clone(),
                layer: mw.id.clone(),
                side: ContractSide::Input,
                expected: contract.name,
                found: task.input_type.name,
            }));
        }
    }
    if let Some(contract) = &mw.output_contract {
        if contract.id != task.output_type.id {
            return Err(Error::Contract(ContractViolation {
                owner: task.id.clone(),
                layer: mw.id.clone(),
                side: ContractSide::Output,
                expected: contract.name,
                found: task.output_type.name,
            }));
        }
    }
    Ok(())
}

/// Transitive dependency closure (by id) for every registered middleware.
fn compute_transitive_deps(store: &Store) -> HashMap<String, HashSet<String>> {
    let mut result = HashMap::new();
    for id in store.insertion_order() {
        let is_mw = store.task_mw(id).is_some() || store.resource_mw(id).is_some();
        if !is_mw {
            continue;
        }
        let mut closure = HashSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            if let Some(def) = store.definition(&current) {
                for dep in def.static_deps() {
                    if closure.insert(dep.id.clone()) {
                        frontier.push(dep.id);
                    }
                }
            }
        }
        result.insert(id.to_string(), closure);
    }
    result
}

// ── Chain execution ─────────────────────────────────────────────────────────

/// Run a task chain: each layer wraps the rest, with the entry's
/// interceptors around the layer itself.
pub(crate) fn run_task_chain(
    kernel: Arc<crate::runtime::Kernel>,
    entries: Arc<Vec<TaskChainEntry>>,
    overview: TaskOverview,
    journal: crate::journal::Journal,
    base: BaseFn,
    input: AnyValue,
) -> BoxFuture<Result<AnyValue, Error>> {
    run_task_layer(kernel, entries, overview, journal, base, 0, input)
}

fn run_task_layer(
    kernel: Arc<crate::runtime::Kernel>,
    entries: Arc<Vec<TaskChainEntry>>,
    overview: TaskOverview,
    journal: crate::journal::Journal,
    base: BaseFn,
    index: usize,
    input: AnyValue,
) -> BoxFuture<Result<AnyValue, Error>> {
    if index >= entries.len() {
        return (base.as_ref())(input);
    }
    let entry = entries[index].clone();

    let next = {
        let kernel = kernel.clone();
        let entries = entries.clone();
        let overview = overview.clone();
        let journal = journal.clone();
        let base = base.clone();
        Next::new(move |input| {
            run_task_layer(kernel, entries, overview, journal, base, index + 1, input)
        })
    };

    let deps = Deps::new(kernel, entry.mw.id.clone(), &entry.mw.deps);
    let body = entry.mw.body.clone();
    let config = entry.config.clone();

    let mut call: Box<dyn FnOnce(AnyValue) -> BoxFuture<Result<AnyValue, Error>> + Send> =
        Box::new(move |input| {
            let ctx = TaskMwCtx {
                task: overview,
                input: input.clone(),
                journal,
                deps,
                config,
            };
            (body.as_ref())(ctx, next)
        });

    // First registered interceptor ends up outermost.
    for interceptor in entry.interceptors.iter().rev() {
        let interceptor = interceptor.clone();
        let inner = call;
        call = Box::new(move |input| (interceptor.as_ref())(Next::new(inner), input));
    }

    call(input)
}

/// Run a resource init chain; the flowing value is the applied config.
pub(crate) fn run_resource_chain(
    kernel: Arc<crate::runtime::Kernel>,
    entries: Arc<Vec<ResourceChainEntry>>,
    overview: ResourceOverview,
    journal: crate::journal::Journal,
    base: ResourceBaseFn,
    config: Option<AnyValue>,
) -> BoxFuture<Result<AnyValue, Error>> {
    run_resource_layer(kernel, entries, overview, journal, base, 0, config)
}

fn run_resource_layer(
    kernel: Arc<crate::runtime::Kernel>,
    entries: Arc<Vec<ResourceChainEntry>>,
    overview: ResourceOverview,
    journal: crate::journal::Journal,
    base: ResourceBaseFn,
    index: usize,
    config: Option<AnyValue>,
) -> BoxFuture<Result<AnyValue, Error>> {
    if index >= entries.len() {
        return (base.as_ref())(config);
    }
    let entry = entries[index].clone();

    let next = {
        let kernel = kernel.clone();
        let entries = entries.clone();
        let overview = overview.clone();
        let journal = journal.clone();
        let base = base.clone();
        ResourceNext::new(move |config| {
            run_resource_layer(kernel, entries, overview, journal, base, index + 1, config)
        })
    };

    let deps = Deps::new(kernel, entry.mw.id.clone(), &entry.mw.deps);
    let ctx = ResourceMwCtx {
        resource: overview,
        resource_config: config.clone(),
        journal,
        deps,
        config: entry.config.clone(),
    };
    (entry.mw.body.as_ref())(ctx, next)
}
