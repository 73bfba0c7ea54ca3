//! Graph validation, run once between registration and boot.
//!
//! Issues of one run are batched into a single
//! [`ValidationReport`](crate::error::ValidationReport) so a broken graph
//! surfaces every problem at once instead of one per attempt.

use std::collections::HashMap;

use crate::builtins;
use crate::defs::hook::HookTarget;
use crate::defs::{DefKind, DefNode};
use crate::error::{ContractSide, GraphIssue, ValidationReport};
use crate::store::Store;
use crate::types::TypeTag;

/// Validate the whole graph. Returns the batched report plus the computed
/// task-ownership map (task id -> tunnel resource id), which is only
/// meaningful when the report is empty.
pub(crate) fn validate(store: &Store) -> (ValidationReport, HashMap<String, String>) {
    let mut issues = Vec::new();

    check_references(store, &mut issues);
    check_middleware_refs(store, &mut issues);
    check_tag_refs(store, &mut issues);
    check_contracts(store, &mut issues);
    check_resource_cycles(store, &mut issues);
    let ownership = check_tunnel_ownership(store, &mut issues);

    (ValidationReport { issues }, ownership)
}

/// Every non-optional declared dependency must resolve; hook targets must
/// resolve to events.
fn check_references(store: &Store, issues: &mut Vec<GraphIssue>) {
    for id in store.insertion_order() {
        let def = match store.definition(id) {
            Some(def) => def,
            None => continue,
        };
        for dep in def.static_deps() {
            if !dep.is_optional() && !store.contains(dep.id()) {
                issues.push(GraphIssue::MissingDependency {
                    owner: id.to_string(),
                    dependency: dep.id().to_string(),
                });
            }
        }
        if let DefNode::Hook(hook) = &def.node {
            let targets: Vec<&String> = match &hook.target {
                HookTarget::One(event_id) => vec![event_id],
                HookTarget::Many(event_ids) => event_ids.iter().collect(),
                HookTarget::Wildcard => Vec::new(),
            };
            for event_id in targets {
                if store.event(event_id).is_none() {
                    issues.push(GraphIssue::MissingDependency {
                        owner: id.to_string(),
                        dependency: event_id.clone(),
                    });
                }
            }
        }
    }
}

/// Every middleware attachment must reference a registered middleware of
/// the matching kind.
fn check_middleware_refs(store: &Store, issues: &mut Vec<GraphIssue>) {
    for id in store.insertion_order() {
        let def = match store.definition(id) {
            Some(def) => def,
            None => continue,
        };
        match &def.node {
            DefNode::Task(task) => {
                for mw_use in &task.middleware {
                    if store.task_mw(mw_use.id()).is_none() {
                        issues.push(GraphIssue::UnregisteredMiddleware {
                            owner: id.to_string(),
                            middleware: mw_use.id().to_string(),
                        });
                    }
                }
            }
            DefNode::Resource(cell) => {
                for mw_use in &cell.inner.middleware {
                    if store.resource_mw(mw_use.id()).is_none() {
                        issues.push(GraphIssue::UnregisteredMiddleware {
                            owner: id.to_string(),
                            middleware: mw_use.id().to_string(),
                        });
                    }
                }
            }
            _ => {}
        }
    }
}

/// Every applied tag must itself be registered.
fn check_tag_refs(store: &Store, issues: &mut Vec<GraphIssue>) {
    for id in store.insertion_order() {
        let def = match store.definition(id) {
            Some(def) => def,
            None => continue,
        };
        for tag in def.tags() {
            let registered = store
                .definition(tag.tag_id())
                .is_some_and(|tag_def| tag_def.kind() == DefKind::Tag);
            if !registered {
                issues.push(GraphIssue::UnregisteredTag {
                    owner: id.to_string(),
                    tag: tag.tag_id().to_string(),
                });
            }
        }
    }
}

/// Tag and middleware contracts against their users' declared shapes. The
/// check is an exact type match; anything subtler is the type system's job
/// at definition sites.
fn check_contracts(store: &Store, issues: &mut Vec<GraphIssue>) {
    let mismatch = |declared: &TypeTag, contract: &TypeTag| declared.id != contract.id;

    for id in store.insertion_order() {
        let def = match store.definition(id) {
            Some(def) => def,
            None => continue,
        };
        let (input_type, output_type) = match &def.node {
            DefNode::Task(task) => (task.input_type, task.output_type),
            DefNode::Resource(cell) => (cell.inner.config_type, cell.inner.value_type),
            _ => continue,
        };

        for tag in def.tags() {
            if let Some(contract) = &tag.input_contract {
                if mismatch(&input_type, contract) {
                    issues.push(GraphIssue::TagContract {
                        owner: id.to_string(),
                        tag: tag.tag_id().to_string(),
                        side: ContractSide::Input,
                        expected: contract.name,
                        found: input_type.name,
                    });
                }
            }
            if let Some(contract) = &tag.output_contract {
                if mismatch(&output_type, contract) {
                    issues.push(GraphIssue::TagContract {
                        owner: id.to_string(),
                        tag: tag.tag_id().to_string(),
                        side: ContractSide::Output,
                        expected: contract.name,
                        found: output_type.name,
                    });
                }
            }
        }

        if let DefNode::Task(task) = &def.node {
            for mw_use in &task.middleware {
                let Some(cell) = store.task_mw(mw_use.id()) else {
                    continue;
                };
                if let Some(contract) = &cell.inner.input_contract {
                    if mismatch(&task.input_type, contract) {
                        issues.push(GraphIssue::MiddlewareContract {
                            owner: id.to_string(),
                            middleware: mw_use.id().to_string(),
                            side: ContractSide::Input,
                            expected: contract.name,
                            found: task.input_type.name,
                        });
                    }
                }
                if let Some(contract) = &cell.inner.output_contract {
                    if mismatch(&task.output_type, contract) {
                        issues.push(GraphIssue::MiddlewareContract {
                            owner: id.to_string(),
                            middleware: mw_use.id().to_string(),
                            side: ContractSide::Output,
                            expected: contract.name,
                            found: task.output_type.name,
                        });
                    }
                }
            }
        }
    }
}

/// The resource subgraph must be acyclic; tasks may reference each other
/// freely, resources are the only definitions that need an init order.
fn check_resource_cycles(store: &Store, issues: &mut Vec<GraphIssue>) {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let resources = store.resources();
    let mut colors: HashMap<String, Color> =
        resources.iter().map(|(id, _)| (id.clone(), Color::White)).collect();

    fn resource_deps(store: &Store, id: &str) -> Vec<String> {
        store
            .resource(id)
            .map(|cell| {
                cell.inner
                    .deps_for(cell.config.as_ref())
                    .into_iter()
                    .filter(|dep| store.resource(dep.id()).is_some())
                    .map(|dep| dep.id().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn visit(
        store: &Store,
        id: &str,
        colors: &mut HashMap<String, Color>,
        stack: &mut Vec<String>,
        issues: &mut Vec<GraphIssue>,
    ) {
        colors.insert(id.to_string(), Color::Gray);
        stack.push(id.to_string());
        for dep in resource_deps(store, id) {
            match colors.get(&dep).copied().unwrap_or(Color::White) {
                Color::White => visit(store, &dep, colors, stack, issues),
                Color::Gray => {
                    let start = stack.iter().position(|s| s == &dep).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..].to_vec();
                    path.push(dep.clone());
                    issues.push(GraphIssue::ResourceCycle { path });
                }
                Color::Black => {}
            }
        }
        stack.pop();
        colors.insert(id.to_string(), Color::Black);
    }

    for (id, _) in &resources {
        if colors.get(id).copied() == Some(Color::White) {
            let mut stack = Vec::new();
            visit(store, id, &mut colors, &mut stack, issues);
        }
    }
}

/// Each task may be claimed by at most one tunnel. Selection comes from the
/// tunnel tag's config, so ownership is decidable before any init runs.
fn check_tunnel_ownership(
    store: &Store,
    issues: &mut Vec<GraphIssue>,
) -> HashMap<String, String> {
    let tunnel_tag = builtins::tunnel_tag();
    let mut claims: HashMap<String, Vec<String>> = HashMap::new();

    for (resource_id, cell) in store.resources() {
        let Some(cfg) = tunnel_tag.extract(&cell.inner.tags) else {
            continue;
        };
        for task_id in &cfg.tasks {
            if store.task(task_id).is_none() {
                issues.push(GraphIssue::MissingDependency {
                    owner: resource_id.clone(),
                    dependency: task_id.clone(),
                });
                continue;
            }
            claims.entry(task_id.clone()).or_default().push(resource_id.clone());
        }
    }

    let mut ownership = HashMap::new();
    for (task_id, tunnels) in claims {
        if tunnels.len() > 1 {
            issues.push(GraphIssue::TunnelOwnershipConflict {
                task: task_id,
                tunnels,
            });
        } else {
            ownership.insert(task_id, tunnels.into_iter().next().unwrap());
        }
    }
    ownership
}
