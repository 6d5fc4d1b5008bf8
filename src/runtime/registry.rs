//! Runtime state storage: scope-partitioned, lazily initialized slots.
use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::descriptor::Scope;

/// Cache-line padding wrapper.
///
/// Every state instance is allocated inside this wrapper so that two
/// adjacent instances never share a cache line. This is contractual, not
/// advisory.
#[repr(align(128))]
#[derive(Debug)]
pub struct Padded<T>(pub T);

/// A shared, type-erased, cache-line padded state instance.
#[derive(Clone)]
pub struct StateHandle {
    inner: Arc<dyn Any + Send + Sync>,
}

impl StateHandle {
    /// Allocates a padded instance around `value`.
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self { inner: Arc::new(Padded(value)) }
    }

    /// Borrows the instance as `T`; `None` on a type mismatch.
    pub fn downcast_ref<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<Padded<T>>().map(|padded| &padded.0)
    }

    /// Whether two handles refer to the same instance.
    pub fn same_instance(a: &StateHandle, b: &StateHandle) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHandle").finish_non_exhaustive()
    }
}

/// A shared storage slot and its per-level lifecycle flags.
///
/// All fields are written only under the slot's lock. `trial_inited` and
/// `iter_inited` flip to true only after every setup of that level
/// succeeded; teardown runs only for the worker that observes the flag true
/// and clears it.
#[derive(Default)]
pub(crate) struct Slot {
    pub state: Option<StateHandle>,
    pub trial_inited: bool,
    iter_claimed: bool,
    iter_inited: bool,
}

impl Slot {
    /// Claims the iteration-setup block; true for exactly one worker per
    /// iteration.
    pub fn claim_setup(&mut self) -> bool {
        !std::mem::replace(&mut self.iter_claimed, true)
    }

    /// Marks the iteration-setup block complete; gates the teardown.
    pub fn publish_setup(&mut self) {
        self.iter_inited = true;
    }

    /// Resolves the iteration-teardown block; true for the single worker
    /// that should run it. Resets the claim either way so the next
    /// iteration starts clean.
    pub fn take_teardown(&mut self) -> bool {
        if !self.iter_claimed && !self.iter_inited {
            return false;
        }
        self.iter_claimed = false;
        std::mem::replace(&mut self.iter_inited, false)
    }

    /// Resolves the trial-teardown block; true for the single worker that
    /// should run it.
    pub fn take_trial(&mut self) -> bool {
        std::mem::replace(&mut self.trial_inited, false)
    }
}

static REGISTRY_IDS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // Keyed by registry id so pooled threads surviving a run never leak
    // instances into the next one.
    static THREAD_SLOTS: RefCell<HashMap<(usize, String), StateHandle>> =
        RefCell::new(HashMap::new());
}

/// Runtime mapping from (scope, slot, group, thread) to state instances.
///
/// Three partitions: one slot per benchmark-scoped field, a group-id keyed
/// map per group-scoped field, and a thread-local slot per thread-scoped
/// field. The registry owns no teardown logic; teardown ordering is driven
/// by the stub schedules.
pub struct StateRegistry {
    id: usize,
    benchmark: Mutex<BTreeMap<String, Arc<Mutex<Slot>>>>,
    group: Mutex<BTreeMap<(String, u32), Arc<Mutex<Slot>>>>,
}

impl StateRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            id: REGISTRY_IDS.fetch_add(1, Ordering::Relaxed),
            benchmark: Mutex::new(BTreeMap::new()),
            group: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the instance of `(scope, field_ident, group_id)`, running
    /// `init` if the slot is empty.
    ///
    /// `init` constructs the instance and runs its Trial-level setups; the
    /// instance is published (and `trial_inited` flipped) only when `init`
    /// succeeds, under the slot's lock, so publication happens-before any
    /// other worker's read.
    pub fn get_or_init(
        &self,
        scope: Scope,
        field_ident: &str,
        group_id: u32,
        init: impl FnOnce() -> anyhow::Result<StateHandle>,
    ) -> anyhow::Result<StateHandle> {
        match scope {
            Scope::Thread => THREAD_SLOTS.with(|slots| {
                let key = (self.id, field_ident.to_string());
                if let Some(handle) = slots.borrow().get(&key) {
                    return Ok(handle.clone());
                }
                let handle = init()?;
                slots.borrow_mut().insert(key, handle.clone());
                Ok(handle)
            }),
            Scope::Benchmark | Scope::Group => {
                let slot = match scope {
                    Scope::Benchmark => self
                        .benchmark
                        .lock()
                        .entry(field_ident.to_string())
                        .or_default()
                        .clone(),
                    _ => self
                        .group
                        .lock()
                        .entry((field_ident.to_string(), group_id))
                        .or_default()
                        .clone(),
                };
                let mut guard = slot.lock();
                if let Some(handle) = &guard.state {
                    return Ok(handle.clone());
                }
                let handle = init()?;
                guard.state = Some(handle.clone());
                guard.trial_inited = true;
                Ok(handle)
            }
        }
    }

    /// The guarded slot of a shared-scope field, created on demand. `None`
    /// for thread scope.
    pub(crate) fn shared_slot(
        &self,
        scope: Scope,
        field_ident: &str,
        group_id: u32,
    ) -> Option<Arc<Mutex<Slot>>> {
        match scope {
            Scope::Benchmark => Some(
                self.benchmark
                    .lock()
                    .entry(field_ident.to_string())
                    .or_default()
                    .clone(),
            ),
            Scope::Group => Some(
                self.group
                    .lock()
                    .entry((field_ident.to_string(), group_id))
                    .or_default()
                    .clone(),
            ),
            Scope::Thread => None,
        }
    }
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn benchmark_slot_initializes_once() {
        let registry = StateRegistry::new();
        let calls = AtomicU32::new(0);
        let init = || {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(StateHandle::new(7u64))
        };

        let a = registry.get_or_init(Scope::Benchmark, "f_s_0", 0, init).unwrap();
        let b = registry
            .get_or_init(Scope::Benchmark, "f_s_0", 0, || Ok(StateHandle::new(9u64)))
            .unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(StateHandle::same_instance(&a, &b));
        assert_eq!(*a.downcast_ref::<u64>().unwrap(), 7);
    }

    #[test]
    fn failed_init_leaves_the_slot_empty() {
        let registry = StateRegistry::new();
        let err = registry.get_or_init(Scope::Benchmark, "f_s_0", 0, || {
            anyhow::bail!("setup failed")
        });
        assert!(err.is_err());

        let slot = registry.shared_slot(Scope::Benchmark, "f_s_0", 0).unwrap();
        assert!(slot.lock().state.is_none());
        assert!(!slot.lock().trial_inited);

        // A later attempt may initialize the slot.
        let handle = registry
            .get_or_init(Scope::Benchmark, "f_s_0", 0, || Ok(StateHandle::new(1u8)))
            .unwrap();
        assert_eq!(*handle.downcast_ref::<u8>().unwrap(), 1);
    }

    #[test]
    fn group_partition_is_keyed_by_group_id() {
        let registry = StateRegistry::new();
        let a = registry
            .get_or_init(Scope::Group, "f_g_0", 0, || Ok(StateHandle::new(0u32)))
            .unwrap();
        let b = registry
            .get_or_init(Scope::Group, "f_g_0", 1, || Ok(StateHandle::new(1u32)))
            .unwrap();
        let a2 = registry
            .get_or_init(Scope::Group, "f_g_0", 0, || Ok(StateHandle::new(2u32)))
            .unwrap();

        assert!(!StateHandle::same_instance(&a, &b));
        assert!(StateHandle::same_instance(&a, &a2));
    }

    #[test]
    fn thread_partition_is_distinct_per_thread() {
        let registry = Arc::new(StateRegistry::new());
        let here = registry
            .get_or_init(Scope::Thread, "f_t_0", 0, || Ok(StateHandle::new(0u32)))
            .unwrap();

        let remote = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                registry
                    .get_or_init(Scope::Thread, "f_t_0", 0, || Ok(StateHandle::new(1u32)))
                    .unwrap()
            })
            .join()
            .unwrap()
        };

        assert!(!StateHandle::same_instance(&here, &remote));
        assert_eq!(*here.downcast_ref::<u32>().unwrap(), 0);
        assert_eq!(*remote.downcast_ref::<u32>().unwrap(), 1);
    }

    #[test]
    fn iteration_gate_runs_setup_and_teardown_once() {
        let mut slot = Slot::default();
        assert!(slot.claim_setup());
        assert!(!slot.claim_setup());
        slot.publish_setup();

        assert!(slot.take_teardown());
        assert!(!slot.take_teardown());

        // Next cycle starts clean.
        assert!(slot.claim_setup());
    }

    #[test]
    fn teardown_skipped_when_setup_never_published() {
        let mut slot = Slot::default();
        assert!(slot.claim_setup());
        // Setup failed: publish never happened.
        assert!(!slot.take_teardown());
        // Claim was still reset for the next cycle.
        assert!(slot.claim_setup());
    }

    #[test]
    fn handles_are_padded_to_cache_lines() {
        assert!(std::mem::align_of::<Padded<u8>>() >= 128);
    }
}
