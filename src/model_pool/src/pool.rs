//! Pool of model instances. All status transitions are mediated here; no
//! lock is held while a backend loads or executes.

use crate::builder::FamilyMap;
use crate::instance::{Instance, InstanceRef, InstanceSnapshot, Status};
use crate::model::ModelOutput;
use crate::model_def::{FamilyDef, ModelFamily};
use crate::Error;
use memory_manager::{handle, Reservation, Tier};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

struct Registry {
    instances: HashMap<u64, Arc<Instance>>,
    next_id: u64,
}

struct Shared {
    registry: Mutex<Registry>,
    families: FamilyMap,
    memory: memory_manager::Handle,
    drain_timeout: Duration,
    shutting_down: AtomicBool,
}

/// Built pool, not yet running. [`run`] starts the health sweep and hands
/// out the cloneable [`PoolHandle`].
///
/// [`run`]: Pool::run
pub struct Pool {
    shared: Arc<Shared>,
    health_check_interval: Duration,
}

impl Pool {
    pub(crate) fn new(
        memory: memory_manager::Handle,
        families: FamilyMap,
        health_check_interval: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Pool {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    instances: HashMap::new(),
                    next_id: 0,
                }),
                families,
                memory,
                drain_timeout,
                shutting_down: AtomicBool::new(false),
            }),
            health_check_interval,
        }
    }

    /// Start the periodic health sweep and return the pool handle.
    pub fn run(self) -> PoolHandle {
        let interval = self.health_check_interval;
        let handle = PoolHandle {
            shared: self.shared,
        };
        {
            let sweeper = handle.clone();
            thread::spawn(move || loop {
                thread::sleep(interval);
                if sweeper.shared.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                sweeper.health_check_all();
            });
        }
        handle
    }
}

/// Cloneable handle for the pool.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<Shared>,
}

impl PoolHandle {
    /// Return an instance of `family` with spare execution capacity,
    /// loading one if necessary. On insufficient memory a single
    /// reclamation pass is attempted before failing with
    /// [`Error::CapacityExceeded`].
    pub fn ensure_ready(&self, family: ModelFamily) -> Result<InstanceRef, Error> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let (def, _) = self
            .shared
            .families
            .get(&family)
            .ok_or(Error::UnknownFamily(family))?;
        if let Some(found) = self.find_available(family) {
            return Ok(found);
        }
        let id = {
            let mut registry = self.shared.registry.lock().unwrap();
            let id = registry.next_id;
            registry.next_id += 1;
            id
        };
        match self.reserve_footprint(def, id) {
            Ok((compute, working)) => self.load_instance(family, id, compute, working),
            Err(Error::CapacityExceeded(_)) => {
                self.reclaim_for(def)?;
                match self.reserve_footprint(def, id) {
                    Ok((compute, working)) => self.load_instance(family, id, compute, working),
                    Err(_) => {
                        log::error!("Capacity exhausted for {:?} after reclamation", family);
                        Err(Error::CapacityExceeded(family))
                    }
                }
            }
            Err(other) => Err(other),
        }
    }

    /// Execute a payload on an instance. Busy bookkeeping happens under
    /// the instance lock; the inference itself runs without any lock held.
    pub fn execute(&self, instance_ref: InstanceRef, payload: &str) -> Result<ModelOutput, Error> {
        let instance = self
            .get(instance_ref.id)
            .ok_or(Error::StaleInstance(instance_ref.id))?;
        {
            let mut state = instance.state.lock().unwrap();
            match state.status {
                Status::Ready | Status::Busy => {}
                _ => return Err(Error::StaleInstance(instance_ref.id)),
            }
            if state.active >= instance.def.max_concurrent {
                return Err(Error::Saturated(instance_ref.id));
            }
            state.active += 1;
            state.status = Status::Busy;
        }
        let started = Instant::now();
        let result = instance.runtime.execute(payload);
        let latency = started.elapsed();
        let success_rate = {
            let mut state = instance.state.lock().unwrap();
            state.active -= 1;
            if state.active == 0 && state.status == Status::Busy {
                state.status = Status::Ready;
            }
            state.perf.record(latency, result.is_ok());
            state.perf.success_rate()
        };
        for &tier in &[Tier::Compute, Tier::Working] {
            if let Err(e) = self
                .shared
                .memory
                .update_usage(tier, instance.id, success_rate)
            {
                log::warn!("Usage update failed for instance {}: {:?}", instance.id, e);
            }
        }
        result.map_err(|reason| Error::Execution {
            instance: instance.id,
            reason,
        })
    }

    /// Probe every idle Ready instance. An instance is force-unloaded
    /// after `max_health_failures` consecutive failed probes, so transient
    /// hiccups do not cause flapping. Instances idle past their family's
    /// threshold are unloaded as well.
    pub fn health_check_all(&self) {
        let roster: Vec<Arc<Instance>> = {
            let registry = self.shared.registry.lock().unwrap();
            registry.instances.values().cloned().collect()
        };
        for instance in roster {
            let checkable = {
                let state = instance.state.lock().unwrap();
                state.status == Status::Ready && state.active == 0
            };
            if !checkable {
                continue;
            }
            let healthy = instance.runtime.ping();
            let (failures, idle) = {
                let mut state = instance.state.lock().unwrap();
                if healthy {
                    state.perf.health_failures = 0;
                } else {
                    state.perf.health_failures += 1;
                }
                (state.perf.health_failures, state.perf.idle_for())
            };
            if !healthy && failures >= instance.def.max_health_failures {
                log::warn!(
                    "Instance {} failed {} consecutive health checks, unloading",
                    instance.id,
                    failures
                );
                {
                    let mut state = instance.state.lock().unwrap();
                    if state.status == Status::Ready {
                        state.status = Status::Failed;
                    }
                }
                self.unload_instance(instance.id);
            } else if healthy && idle >= Duration::from_secs(instance.def.idle_unload_secs) {
                log::info!("Instance {} idle for {:?}, unloading", instance.id, idle);
                self.unload_instance(instance.id);
            }
        }
    }

    /// Read-only roster for the load balancer and status reporting.
    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let registry = self.shared.registry.lock().unwrap();
        let mut snapshots: Vec<InstanceSnapshot> = registry
            .instances
            .values()
            .map(|instance| instance.snapshot())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.id);
        snapshots
    }

    /// Graceful shutdown: drain in-flight executions (bounded by the drain
    /// timeout), then unload everything and release all reservations.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Shutting down model pool");
        let deadline = Instant::now() + self.shared.drain_timeout;
        loop {
            let busy = {
                let registry = self.shared.registry.lock().unwrap();
                registry
                    .instances
                    .values()
                    .any(|instance| instance.state.lock().unwrap().active > 0)
            };
            if !busy {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!("Drain timeout elapsed with executions still in flight");
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let ids: Vec<u64> = {
            let registry = self.shared.registry.lock().unwrap();
            registry.instances.keys().copied().collect()
        };
        for id in ids {
            self.unload_instance(id);
        }
    }

    fn get(&self, id: u64) -> Option<Arc<Instance>> {
        let registry = self.shared.registry.lock().unwrap();
        registry.instances.get(&id).cloned()
    }

    fn find_available(&self, family: ModelFamily) -> Option<InstanceRef> {
        let registry = self.shared.registry.lock().unwrap();
        for instance in registry.instances.values() {
            if instance.family != family {
                continue;
            }
            let state = instance.state.lock().unwrap();
            let available = matches!(state.status, Status::Ready | Status::Busy)
                && state.active < instance.def.max_concurrent;
            if available {
                return Some(InstanceRef {
                    id: instance.id,
                    family,
                });
            }
        }
        None
    }

    fn reserve_footprint(
        &self,
        def: &FamilyDef,
        holder: u64,
    ) -> Result<(Reservation, Reservation), Error> {
        let compute = self
            .shared
            .memory
            .reserve(Tier::Compute, def.compute_memory, holder)
            .map_err(|e| capacity_error(def.family, e))?;
        match self
            .shared
            .memory
            .reserve(Tier::Working, def.working_memory, holder)
        {
            Ok(working) => Ok((compute, working)),
            Err(e) => {
                // no partial grants: give the compute reservation back
                let error = capacity_error(def.family, e);
                if let Err(release_err) = self.shared.memory.release(compute) {
                    log::warn!("Rollback release failed: {:?}", release_err);
                }
                Err(error)
            }
        }
    }

    fn load_instance(
        &self,
        family: ModelFamily,
        id: u64,
        compute: Reservation,
        working: Reservation,
    ) -> Result<InstanceRef, Error> {
        let (def, factory) = &self.shared.families[&family];
        log::info!("Loading {:?} instance {}", family, id);
        let runtime = factory();
        let instance = Arc::new(Instance::new(id, def.clone(), runtime, compute, working));
        {
            let mut registry = self.shared.registry.lock().unwrap();
            registry.instances.insert(id, instance.clone());
        }
        // Loading -> Ready happens outside any pool-wide lock; loads are slow
        match instance.runtime.load() {
            Ok(()) => {
                let mut state = instance.state.lock().unwrap();
                state.status = Status::Ready;
                log::info!("Instance {} of {:?} ready", id, family);
                Ok(InstanceRef { id, family })
            }
            Err(reason) => {
                log::error!("Load failed for {:?} instance {}: {}", family, id, reason);
                {
                    let mut state = instance.state.lock().unwrap();
                    state.status = Status::Failed;
                }
                self.unload_instance(id);
                Err(Error::Load { family, reason })
            }
        }
    }

    fn reclaim_for(&self, def: &FamilyDef) -> Result<(), Error> {
        for &(tier, amount) in &[
            (Tier::Compute, def.compute_memory),
            (Tier::Working, def.working_memory),
        ] {
            let holders = self
                .shared
                .memory
                .reclaim(tier, amount)
                .map_err(|e| capacity_error(def.family, e))?;
            for holder in holders {
                if !self.unload_instance(holder) {
                    log::debug!("Reclaim candidate {} was busy, skipped", holder);
                }
            }
        }
        Ok(())
    }

    /// Unload one instance if it is quiescent. A Busy instance is never
    /// unloaded, which keeps Busy and Unloading mutually exclusive.
    fn unload_instance(&self, id: u64) -> bool {
        let instance = match self.get(id) {
            Some(instance) => instance,
            None => return false,
        };
        {
            let mut state = instance.state.lock().unwrap();
            if state.active > 0
                || state.status == Status::Loading
                || state.status == Status::Unloading
            {
                return false;
            }
            state.status = Status::Unloading;
        }
        instance.runtime.unload();
        {
            let mut state = instance.state.lock().unwrap();
            let reservations = state.compute.take().into_iter().chain(state.working.take());
            for reservation in reservations {
                if let Err(e) = self.shared.memory.release(reservation) {
                    log::warn!("Release failed for instance {}: {:?}", id, e);
                }
            }
            state.status = Status::Unloaded;
        }
        let mut registry = self.shared.registry.lock().unwrap();
        registry.instances.remove(&id);
        log::info!("Instance {} unloaded", id);
        true
    }
}

fn capacity_error(family: ModelFamily, error: handle::Error) -> Error {
    match error {
        handle::Error::InsufficientCapacity { .. } => Error::CapacityExceeded(family),
        handle::Error::UnknownTier(tier) => {
            log::error!("Tier {:?} is not configured on the memory manager", tier);
            Error::CapacityExceeded(family)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builder::{Builder, FamilyInfo};
    use crate::model::{FakeModel, ModelRuntime};
    use crossbeam::channel;
    use memory_manager::MemoryManager;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;

    struct FailingLoad;

    impl ModelRuntime for FailingLoad {
        fn load(&self) -> Result<(), String> {
            Err("weights corrupted".into())
        }
        fn execute(&self, _payload: &str) -> Result<ModelOutput, String> {
            Err("never loaded".into())
        }
        fn ping(&self) -> bool {
            false
        }
        fn unload(&self) {}
    }

    struct Flaky {
        calls: AtomicUsize,
    }

    impl ModelRuntime for Flaky {
        fn load(&self) -> Result<(), String> {
            Ok(())
        }
        fn execute(&self, payload: &str) -> Result<ModelOutput, String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                Ok(ModelOutput {
                    answer: payload.to_string(),
                    confidence: 0.8,
                })
            } else {
                Err("backend crashed".into())
            }
        }
        fn ping(&self) -> bool {
            true
        }
        fn unload(&self) {}
    }

    struct Unhealthy;

    impl ModelRuntime for Unhealthy {
        fn load(&self) -> Result<(), String> {
            Ok(())
        }
        fn execute(&self, _payload: &str) -> Result<ModelOutput, String> {
            Err("unreachable".into())
        }
        fn ping(&self) -> bool {
            false
        }
        fn unload(&self) {}
    }

    struct Gated {
        gate: channel::Receiver<()>,
    }

    impl ModelRuntime for Gated {
        fn load(&self) -> Result<(), String> {
            Ok(())
        }
        fn execute(&self, _payload: &str) -> Result<ModelOutput, String> {
            self.gate.recv().map_err(|_| "gate closed".to_string())?;
            Ok(ModelOutput {
                answer: "gated".into(),
                confidence: 1.0,
            })
        }
        fn ping(&self) -> bool {
            true
        }
        fn unload(&self) {}
    }

    fn memory() -> memory_manager::Handle {
        MemoryManager::from_tiers(&[(Tier::Compute, 48), (Tier::Working, 48)]).run()
    }

    fn reasoning_def() -> FamilyDef {
        FamilyDef::new(ModelFamily::Reasoning, 16, 8)
    }

    #[test]
    fn test_ensure_ready_loads_and_reserves() {
        let memory = memory();
        let pool = Builder::new()
            .memory(memory.clone())
            .register_family(FamilyInfo::new(reasoning_def(), || Box::new(FakeModel)))
            .build()
            .run();
        let instance = pool.ensure_ready(ModelFamily::Reasoning).unwrap();
        assert_eq!(instance.family, ModelFamily::Reasoning);
        assert_eq!(memory.query(Tier::Compute).unwrap().allocated, 16);
        assert_eq!(memory.query(Tier::Working).unwrap().allocated, 8);
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, Status::Ready);
    }

    #[test]
    fn test_ensure_ready_reuses_spare_capacity() {
        let memory = memory();
        let pool = Builder::new()
            .memory(memory.clone())
            .register_family(FamilyInfo::new(reasoning_def().max_concurrent(2), || {
                Box::new(FakeModel)
            }))
            .build()
            .run();
        let first = pool.ensure_ready(ModelFamily::Reasoning).unwrap();
        let second = pool.ensure_ready(ModelFamily::Reasoning).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(memory.query(Tier::Compute).unwrap().allocated, 16);
    }

    #[test]
    fn test_unknown_family() {
        let pool = Builder::new()
            .memory(memory())
            .register_family(FamilyInfo::new(reasoning_def(), || Box::new(FakeModel)))
            .build()
            .run();
        assert_eq!(
            pool.ensure_ready(ModelFamily::Enrichment).unwrap_err(),
            Error::UnknownFamily(ModelFamily::Enrichment)
        );
    }

    #[test]
    fn test_reclaim_evicts_idle_instance() {
        let memory = MemoryManager::from_tiers(&[(Tier::Compute, 20), (Tier::Working, 10)]).run();
        let pool = Builder::new()
            .memory(memory.clone())
            .register_family(FamilyInfo::new(reasoning_def(), || Box::new(FakeModel)))
            .register_family(FamilyInfo::new(
                FamilyDef::new(ModelFamily::Verification, 16, 8),
                || Box::new(FakeModel),
            ))
            .build()
            .run();
        pool.ensure_ready(ModelFamily::Reasoning).unwrap();
        // no room for both footprints: the idle reasoning instance is evicted
        let verifier = pool.ensure_ready(ModelFamily::Verification).unwrap();
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, verifier.id);
        assert_eq!(snapshot[0].family, ModelFamily::Verification);
        assert_eq!(memory.query(Tier::Compute).unwrap().allocated, 16);
        assert_eq!(memory.query(Tier::Working).unwrap().allocated, 8);
    }

    #[test]
    fn test_capacity_exceeded_when_nothing_reclaimable() {
        let memory = MemoryManager::from_tiers(&[(Tier::Compute, 8), (Tier::Working, 48)]).run();
        let pool = Builder::new()
            .memory(memory)
            .register_family(FamilyInfo::new(reasoning_def(), || Box::new(FakeModel)))
            .build()
            .run();
        assert_eq!(
            pool.ensure_ready(ModelFamily::Reasoning).unwrap_err(),
            Error::CapacityExceeded(ModelFamily::Reasoning)
        );
    }

    #[test]
    fn test_load_error_releases_reservations() {
        let memory = memory();
        let pool = Builder::new()
            .memory(memory.clone())
            .register_family(FamilyInfo::new(reasoning_def(), || Box::new(FailingLoad)))
            .build()
            .run();
        let error = pool.ensure_ready(ModelFamily::Reasoning).unwrap_err();
        assert_eq!(
            error,
            Error::Load {
                family: ModelFamily::Reasoning,
                reason: "weights corrupted".into(),
            }
        );
        assert!(pool.snapshot().is_empty());
        assert_eq!(memory.query(Tier::Compute).unwrap().allocated, 0);
        assert_eq!(memory.query(Tier::Working).unwrap().allocated, 0);
    }

    #[test]
    fn test_execution_feeds_perf_record() {
        let pool = Builder::new()
            .memory(memory())
            .register_family(FamilyInfo::new(reasoning_def(), || {
                Box::new(Flaky {
                    calls: AtomicUsize::new(0),
                })
            }))
            .build()
            .run();
        let instance = pool.ensure_ready(ModelFamily::Reasoning).unwrap();
        let output = pool.execute(instance, "cpi series").unwrap();
        assert_eq!(output.answer, "cpi series");
        let error = pool.execute(instance, "cpi series").unwrap_err();
        assert_eq!(
            error,
            Error::Execution {
                instance: instance.id,
                reason: "backend crashed".into(),
            }
        );
        let snapshot = pool.snapshot();
        assert!((snapshot[0].success_rate - 0.5).abs() < 1e-9);
    }

    #[serial]
    #[test]
    fn test_saturated_instance_rejects_execution() {
        let (gate_tx, gate_rx) = channel::unbounded();
        let pool = Builder::new()
            .memory(memory())
            .register_family(FamilyInfo::new(reasoning_def(), move || {
                Box::new(Gated {
                    gate: gate_rx.clone(),
                })
            }))
            .build()
            .run();
        let instance = pool.ensure_ready(ModelFamily::Reasoning).unwrap();
        let executor = {
            let pool = pool.clone();
            thread::spawn(move || pool.execute(instance, "slow"))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.snapshot()[0].status, Status::Busy);
        assert_eq!(
            pool.execute(instance, "rejected").unwrap_err(),
            Error::Saturated(instance.id)
        );
        gate_tx.send(()).unwrap();
        assert!(executor.join().unwrap().is_ok());
        assert_eq!(pool.snapshot()[0].status, Status::Ready);
    }

    #[test]
    fn test_health_check_unloads_after_threshold() {
        let memory = memory();
        let pool = Builder::new()
            .memory(memory.clone())
            .register_family(FamilyInfo::new(
                reasoning_def().max_health_failures(2),
                || Box::new(Unhealthy),
            ))
            .build()
            .run();
        pool.ensure_ready(ModelFamily::Reasoning).unwrap();
        pool.health_check_all();
        // one failure is tolerated
        assert_eq!(pool.snapshot().len(), 1);
        pool.health_check_all();
        assert!(pool.snapshot().is_empty());
        assert_eq!(memory.query(Tier::Compute).unwrap().allocated, 0);
    }

    #[test]
    fn test_idle_instance_is_unloaded() {
        let pool = Builder::new()
            .memory(memory())
            .register_family(FamilyInfo::new(reasoning_def().idle_unload_secs(0), || {
                Box::new(FakeModel)
            }))
            .build()
            .run();
        pool.ensure_ready(ModelFamily::Reasoning).unwrap();
        pool.health_check_all();
        assert!(pool.snapshot().is_empty());
    }

    #[test]
    fn test_shutdown_unloads_everything() {
        let memory = memory();
        let pool = Builder::new()
            .memory(memory.clone())
            .register_family(FamilyInfo::new(reasoning_def(), || Box::new(FakeModel)))
            .register_family(FamilyInfo::new(
                FamilyDef::new(ModelFamily::Verification, 16, 8),
                || Box::new(FakeModel),
            ))
            .build()
            .run();
        pool.ensure_ready(ModelFamily::Reasoning).unwrap();
        pool.ensure_ready(ModelFamily::Verification).unwrap();
        pool.shutdown();
        assert!(pool.snapshot().is_empty());
        assert_eq!(memory.query(Tier::Compute).unwrap().allocated, 0);
        assert_eq!(memory.query(Tier::Working).unwrap().allocated, 0);
        assert_eq!(
            pool.ensure_ready(ModelFamily::Reasoning).unwrap_err(),
            Error::ShuttingDown
        );
    }
}
