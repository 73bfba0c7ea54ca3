//! The lifecycle orchestrator: topological init and reverse dispose.
//!
//! Init runs in waves: every resource whose dependencies are satisfied
//! starts concurrently with its siblings, and the next wave begins when the
//! current one fully resolves. Completion order is recorded as it happens;
//! dispose replays it backwards.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;

use crate::defs::resource::InitContext;
use crate::deps::Deps;
use crate::error::{DisposalError, Error, LifecycleError};
use crate::invoker;
use crate::journal::Journal;
use crate::runtime::Kernel;

/// Initialize every resource in dependency order. On failure, resources
/// that completed are disposed in reverse completion order, then the init
/// error is returned.
pub(crate) async fn boot(kernel: &Arc<Kernel>) -> Result<(), Error> {
    let resources = kernel.store.resources();
    let index_of: HashMap<String, usize> = resources
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.clone(), i))
        .collect();

    // In-degree counts only edges into other registered resources; the
    // validator already guaranteed acyclicity.
    let mut in_degree = vec![0usize; resources.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); resources.len()];
    for (i, (_, cell)) in resources.iter().enumerate() {
        for dep in cell.inner.deps_for(cell.config.as_ref()) {
            if let Some(&dep_index) = index_of.get(dep.id()) {
                in_degree[i] += 1;
                dependents[dep_index].push(i);
            }
        }
    }

    let mut ready: Vec<usize> = (0..resources.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut remaining = resources.len();

    while remaining > 0 {
        debug_assert!(!ready.is_empty(), "acyclic graph always has a ready wave");
        ready.sort_unstable();
        let wave = std::mem::take(&mut ready);

        let results = join_all(wave.iter().map(|&i| {
            let (id, cell) = &resources[i];
            async move {
                invoker::init_resource(kernel, id, cell)
                    .await
                    .map_err(|err| (id.clone(), err))
            }
        }))
        .await;

        for result in results {
            if let Err((id, err)) = result {
                // Unwind whatever completed before rethrowing.
                if let Err(dispose_err) = dispose(kernel).await {
                    tracing::error!(error = %dispose_err, "cleanup after failed boot also failed");
                }
                return Err(Error::Lifecycle(LifecycleError::InitFailed {
                    id,
                    source: Box::new(err),
                }));
            }
        }

        for &i in &wave {
            remaining -= 1;
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(dependent);
                }
            }
        }
    }

    Ok(())
}

/// Dispose every initialized resource in reverse completion order.
/// Failures are collected; disposal always runs to completion.
pub(crate) async fn dispose(kernel: &Arc<Kernel>) -> Result<(), Error> {
    let sequence: Vec<String> = {
        let mut guard = kernel.store.init_sequence.lock().unwrap();
        std::mem::take(&mut *guard)
    };

    let mut failures: Vec<(String, Error)> = Vec::new();

    for id in sequence.into_iter().rev() {
        let Some((_, slot)) = kernel.store.initialized.remove(&id) else {
            continue;
        };
        let Some(cell) = kernel.store.resource(&id) else {
            continue;
        };
        let Some(dispose_fn) = cell.inner.dispose.clone() else {
            tracing::debug!(resource = %id, "resource disposed");
            continue;
        };

        let deps = Deps::new(
            kernel.clone(),
            id.clone(),
            &cell.inner.deps_for(slot.config.as_ref()),
        );
        let ctx = InitContext {
            journal: Journal::new(),
            private: slot.private.clone(),
            kernel: Some(kernel.clone()),
        };

        match (dispose_fn.as_ref())(slot.value, slot.config, deps, ctx).await {
            Ok(()) => tracing::debug!(resource = %id, "resource disposed"),
            Err(err) => {
                tracing::error!(resource = %id, error = %err, "resource failed to dispose");
                failures.push((id, err));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Disposal(DisposalError { failures }))
    }
}
