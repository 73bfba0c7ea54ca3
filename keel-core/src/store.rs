//! The definition store: walks the registration closure from the root
//! resource, deduplicates by identity, resolves overrides, and indexes by
//! tag. After boot it also holds the initialized-resource table and the
//! per-task interceptor table, and enforces the post-boot lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;

use crate::defs::app_error::ErrorKindInner;
use crate::defs::async_ctx::AsyncCtxInner;
use crate::defs::event::EventInner;
use crate::defs::hook::HookInner;
use crate::defs::middleware::ErasedTaskInterceptor;
use crate::defs::resource::ResourceInner;
use crate::defs::task::TaskInner;
use crate::defs::{DefKind, DefNode, Definition, ResourceCell, ResourceMwCell, TaskMwCell};
use crate::error::{Error, RegistryError};
use crate::types::AnyValue;

/// One initialized resource, recorded in init-completion order.
pub(crate) struct ResourceSlot {
    pub(crate) value: AnyValue,
    pub(crate) config: Option<AnyValue>,
    pub(crate) private: Option<AnyValue>,
}

struct OverrideRecord {
    def: Definition,
    /// Distance from the root of the resource that declared the override.
    depth: usize,
    /// Traversal order, the equal-depth tie-breaker (last wins).
    seq: usize,
}

pub(crate) struct Store {
    definitions: HashMap<String, Definition>,
    /// Ids in first-registration order, for deterministic iteration.
    order: Vec<String>,
    /// tag id -> ids of definitions carrying it.
    by_tag: HashMap<String, Vec<String>>,
    /// task id -> owning tunnel resource id. Filled by the validator.
    pub(crate) ownership: HashMap<String, String>,
    /// Initialized resources, by id.
    pub(crate) initialized: DashMap<String, ResourceSlot>,
    /// Resource ids in init-completion order; dispose runs it in reverse.
    pub(crate) init_sequence: Mutex<Vec<String>>,
    /// Per-task interceptors collected during resource init.
    task_interceptors: Mutex<HashMap<String, Vec<ErasedTaskInterceptor>>>,
    locked: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Walk the registration closure from the root definition and resolve
    /// overrides.
    pub(crate) fn build(root: Definition) -> Result<Self, Error> {
        let mut store = Self {
            definitions: HashMap::new(),
            order: Vec::new(),
            by_tag: HashMap::new(),
            ownership: HashMap::new(),
            initialized: DashMap::new(),
            init_sequence: Mutex::new(Vec::new()),
            task_interceptors: Mutex::new(HashMap::new()),
            locked: AtomicBool::new(false),
        };
        let mut overrides = Vec::new();
        let mut walked = HashSet::new();
        let mut seq = 0usize;
        store.walk(root, 0, &mut overrides, &mut walked, &mut seq)?;
        store.apply_overrides(overrides)?;
        store.index_tags();
        Ok(store)
    }

    fn walk(
        &mut self,
        def: Definition,
        depth: usize,
        overrides: &mut Vec<OverrideRecord>,
        walked: &mut HashSet<usize>,
        seq: &mut usize,
    ) -> Result<(), Error> {
        self.insert(def.clone())?;
        if let DefNode::Resource(cell) = &def.node {
            // A resource reached twice contributes its children only once.
            if !walked.insert(def.identity()) {
                return Ok(());
            }
            for override_def in &cell.inner.overrides {
                overrides.push(OverrideRecord {
                    def: override_def.clone(),
                    depth,
                    seq: *seq,
                });
                *seq += 1;
            }
            for child in cell.inner.register_for(cell.config.as_ref()) {
                self.walk(child, depth + 1, overrides, walked, seq)?;
            }
        }
        Ok(())
    }

    /// Insert a definition; same-identity duplicates deduplicate, same-id
    /// distinct definitions are fatal.
    fn insert(&mut self, def: Definition) -> Result<bool, Error> {
        let id = def.id().to_string();
        match self.definitions.get(&id) {
            Some(existing) if existing.identity() == def.identity() => Ok(false),
            Some(_) => Err(Error::Registry(RegistryError::DuplicateId { id })),
            None => {
                self.order.push(id.clone());
                self.definitions.insert(id, def);
                Ok(true)
            }
        }
    }

    /// Overrides declared closest to the root are applied last and prevail;
    /// equal depth resolves last-wins by traversal order.
    fn apply_overrides(&mut self, mut records: Vec<OverrideRecord>) -> Result<(), Error> {
        records.sort_by(|a, b| b.depth.cmp(&a.depth).then(a.seq.cmp(&b.seq)));
        for record in records {
            let id = record.def.id().to_string();
            if !self.definitions.contains_key(&id) {
                return Err(Error::Registry(RegistryError::OverrideTargetMissing { id }));
            }
            self.definitions.insert(id, record.def.clone());
            // An overriding resource brings its own children; ids already
            // registered are left as they are.
            if let DefNode::Resource(cell) = &record.def.node {
                for child in cell.inner.register_for(cell.config.as_ref()) {
                    if !self.definitions.contains_key(child.id()) {
                        self.insert(child)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn index_tags(&mut self) {
        let mut by_tag: HashMap<String, Vec<String>> = HashMap::new();
        for id in &self.order {
            if let Some(def) = self.definitions.get(id) {
                for tag in def.tags() {
                    by_tag
                        .entry(tag.tag_id.clone())
                        .or_default()
                        .push(id.clone());
                }
            }
        }
        self.by_tag = by_tag;
    }

    // ── Lookups ─────────────────────────────────────────────────────────

    pub(crate) fn definition(&self, id: &str) -> Option<&Definition> {
        self.definitions.get(id)
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.definitions.contains_key(id)
    }

    pub(crate) fn insertion_order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub(crate) fn task(&self, id: &str) -> Option<&std::sync::Arc<TaskInner>> {
        match self.definitions.get(id)?.node {
            DefNode::Task(ref inner) => Some(inner),
            _ => None,
        }
    }

    pub(crate) fn resource(&self, id: &str) -> Option<&ResourceCell> {
        match self.definitions.get(id)?.node {
            DefNode::Resource(ref cell) => Some(cell),
            _ => None,
        }
    }

    pub(crate) fn event(&self, id: &str) -> Option<&std::sync::Arc<EventInner>> {
        match self.definitions.get(id)?.node {
            DefNode::Event(ref inner) => Some(inner),
            _ => None,
        }
    }

    pub(crate) fn task_mw(&self, id: &str) -> Option<&TaskMwCell> {
        match self.definitions.get(id)?.node {
            DefNode::TaskMiddleware(ref cell) => Some(cell),
            _ => None,
        }
    }

    pub(crate) fn resource_mw(&self, id: &str) -> Option<&ResourceMwCell> {
        match self.definitions.get(id)?.node {
            DefNode::ResourceMiddleware(ref cell) => Some(cell),
            _ => None,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn error_kind(&self, id: &str) -> Option<&std::sync::Arc<ErrorKindInner>> {
        match self.definitions.get(id)?.node {
            DefNode::ErrorKind(ref inner) => Some(inner),
            _ => None,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn async_ctx(&self, id: &str) -> Option<&std::sync::Arc<AsyncCtxInner>> {
        match self.definitions.get(id)?.node {
            DefNode::AsyncContext(ref inner) => Some(inner),
            _ => None,
        }
    }

    /// All hooks, in registration order.
    pub(crate) fn hooks(&self) -> Vec<std::sync::Arc<HookInner>> {
        self.order
            .iter()
            .filter_map(|id| match self.definitions.get(id)?.node {
                DefNode::Hook(ref inner) => Some(inner.clone()),
                _ => None,
            })
            .collect()
    }

    /// All resources, in registration order.
    pub(crate) fn resources(&self) -> Vec<(String, ResourceCell)> {
        self.order
            .iter()
            .filter_map(|id| match self.definitions.get(id)?.node {
                DefNode::Resource(ref cell) => Some((id.clone(), cell.clone())),
                _ => None,
            })
            .collect()
    }

    /// Ids of definitions of `kind` carrying the given tag.
    pub(crate) fn ids_with_tag(&self, tag_id: &str, kind: DefKind) -> Vec<String> {
        self.by_tag
            .get(tag_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        self.definitions
                            .get(*id)
                            .is_some_and(|def| def.kind() == kind)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Lock discipline ─────────────────────────────────────────────────

    pub(crate) fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub(crate) fn add_task_interceptor(
        &self,
        task_id: &str,
        interceptor: ErasedTaskInterceptor,
    ) -> Result<(), Error> {
        if self.is_locked() {
            return Err(Error::Registry(RegistryError::Locked {
                operation: "interceptor registration",
            }));
        }
        if !self.contains(task_id) {
            return Err(Error::Registry(RegistryError::UnknownId {
                id: task_id.to_string(),
            }));
        }
        self.task_interceptors
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .push(interceptor);
        Ok(())
    }

    pub(crate) fn task_interceptors_for(&self, task_id: &str) -> Vec<ErasedTaskInterceptor> {
        self.task_interceptors
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    // ── Post-boot records ───────────────────────────────────────────────

    pub(crate) fn record_initialized(&self, id: &str, slot: ResourceSlot) {
        self.initialized.insert(id.to_string(), slot);
        self.init_sequence.lock().unwrap().push(id.to_string());
    }

    pub(crate) fn resource_value(&self, id: &str) -> Option<AnyValue> {
        self.initialized.get(id).map(|slot| slot.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{Resource, Tag, Task};

    fn leaf(id: &str) -> Definition {
        Definition::from(
            Task::<(), ()>::builder(id)
                .run(|_input, _deps, _ctx| async move { Ok(()) })
                .build(),
        )
    }

    fn root_with(children: Vec<Definition>) -> Definition {
        Definition::from(
            Resource::<(), ()>::builder("store.test.root")
                .register(children)
                .build(),
        )
    }

    #[test]
    fn walk_registers_the_whole_closure() {
        let store = Store::build(root_with(vec![leaf("store.test.a"), leaf("store.test.b")]))
            .unwrap();
        assert!(store.contains("store.test.root"));
        assert!(store.contains("store.test.a"));
        assert!(store.contains("store.test.b"));
        let order: Vec<&str> = store.insertion_order().collect();
        assert_eq!(order, vec!["store.test.root", "store.test.a", "store.test.b"]);
    }

    #[test]
    fn same_identity_deduplicates() {
        let shared = leaf("store.test.shared");
        let child = Definition::from(
            Resource::<(), ()>::builder("store.test.child")
                .register([shared.clone()])
                .build(),
        );
        let store = Store::build(root_with(vec![shared.clone(), child])).unwrap();
        assert_eq!(
            store.insertion_order().filter(|id| *id == "store.test.shared").count(),
            1
        );
    }

    #[test]
    fn distinct_definitions_under_one_id_are_fatal() {
        let err = Store::build(root_with(vec![leaf("store.test.dup"), leaf("store.test.dup")]))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::DuplicateId { ref id }) if id == "store.test.dup"
        ));
    }

    #[test]
    fn closest_to_root_override_wins() {
        let original = leaf("store.test.target");
        let deep_replacement = leaf("store.test.target");
        let shallow_replacement = leaf("store.test.target");

        let grandchild = Definition::from(
            Resource::<(), ()>::builder("store.test.grandchild")
                .register([original.clone()])
                .build(),
        );
        let child = Definition::from(
            Resource::<(), ()>::builder("store.test.child")
                .register([grandchild])
                .overrides([deep_replacement.clone()])
                .build(),
        );
        let root = Definition::from(
            Resource::<(), ()>::builder("store.test.root")
                .register([child])
                .overrides([shallow_replacement.clone()])
                .build(),
        );

        let store = Store::build(root).unwrap();
        let winner = store.definition("store.test.target").unwrap();
        assert_eq!(winner.identity(), shallow_replacement.identity());
    }

    #[test]
    fn override_of_unknown_target_fails() {
        let root = Definition::from(
            Resource::<(), ()>::builder("store.test.root")
                .overrides([leaf("store.test.nowhere")])
                .build(),
        );
        let err = Store::build(root).unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::OverrideTargetMissing { ref id })
                if id == "store.test.nowhere"
        ));
    }

    #[test]
    fn tag_index_tracks_kinds() {
        let label = Tag::new("store.test.tags.label");
        let task = Task::<(), ()>::builder("store.test.tagged-task")
            .tags([label.applied()])
            .run(|_input, _deps, _ctx| async move { Ok(()) })
            .build();
        let resource = Resource::<(), ()>::builder("store.test.tagged-resource")
            .tags([label.applied()])
            .build();

        let store = Store::build(root_with(vec![
            Definition::from(&label),
            Definition::from(&task),
            Definition::from(&resource),
        ]))
        .unwrap();

        assert_eq!(
            store.ids_with_tag("store.test.tags.label", DefKind::Task),
            vec!["store.test.tagged-task"]
        );
        assert_eq!(
            store.ids_with_tag("store.test.tags.label", DefKind::Resource),
            vec!["store.test.tagged-resource"]
        );
        assert!(store
            .ids_with_tag("store.test.tags.label", DefKind::Event)
            .is_empty());
    }

    #[test]
    fn lock_rejects_interceptor_registration() {
        let store = Store::build(root_with(vec![leaf("store.test.a")])).unwrap();
        store.lock();
        let err = store
            .add_task_interceptor(
                "store.test.a",
                std::sync::Arc::new(|next, input| next.invoke(input)),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::Locked { .. })));
    }
}
