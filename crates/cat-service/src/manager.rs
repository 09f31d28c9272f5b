//! Protocol instance manager
//!
//! This module manages the lifecycle of protocol instances, including:
//! - Building graphs from step-source batches
//! - Serialising transitions per instance behind an exclusive lock
//! - Persisting each committed state before it becomes visible
//! - Keeping compressed revert snapshots
//! - Halting instances whose graph or state turns out corrupted
//!
//! The instance map is guarded by a tokio `RwLock`; each instance sits in
//! its own `parking_lot::Mutex`. The per-instance lock is only taken inside
//! synchronous helpers, so no guard is ever held across an await point.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use cat_engine::{
    ExecutionEngine, ExecutionState, EventSink, FrontierSnapshot, ProtocolEvent, ProtocolGraph,
    Step, StepDescriptor, TransitionOutcome, TreeBuilder, WaitSignal,
};
use cat_store::{ProtocolStore, StoreError, StoredInstance};
use parking_lot::Mutex;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::constants::defaults;
use crate::error::{Result, ServiceError};
use crate::snapshots::{CompressedState, RevertStack};
use crate::source::{ProtocolRequest, StepSource};

/// In-memory state of one protocol instance
struct InstanceSlot {
    graph: Arc<ProtocolGraph>,
    state: ExecutionState,
    reverts: RevertStack,
    /// Reason the instance stopped, if it did
    halted: Option<String>,
}

impl InstanceSlot {
    fn new(graph: ProtocolGraph, state: ExecutionState, revert_depth: usize) -> Self {
        Self {
            graph: Arc::new(graph),
            state,
            reverts: RevertStack::new(revert_depth),
            halted: None,
        }
    }

    fn ensure_running(&self, instance_id: &str) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(ServiceError::InstanceHalted {
                instance_id: instance_id.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Summary of [`ProtocolService::restore_from_store`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Instances loaded back into memory
    pub restored: Vec<String>,
    /// Instances that could not be loaded, with the reason
    pub failed: Vec<(String, String)>,
}

/// Manager for all live protocol instances
pub struct ProtocolService {
    /// Live instances keyed by instance ID
    instances: RwLock<HashMap<String, Arc<Mutex<InstanceSlot>>>>,
    /// Durable storage, if any
    store: Option<Arc<Mutex<ProtocolStore>>>,
    event_sink: Arc<dyn EventSink>,
    builder: TreeBuilder,
    revert_depth: usize,
}

impl ProtocolService {
    /// Create a service that keeps instances in memory only
    pub fn new(event_sink: Arc<dyn EventSink>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            store: None,
            event_sink,
            builder: TreeBuilder::new(),
            revert_depth: defaults::REVERT_DEPTH,
        }
    }

    /// Persist instances to `store`
    pub fn with_store(mut self, store: ProtocolStore) -> Self {
        self.store = Some(Arc::new(Mutex::new(store)));
        self
    }

    /// Use a custom tree builder
    pub fn with_builder(mut self, builder: TreeBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Keep at most `depth` revert snapshots per instance
    pub fn with_revert_depth(mut self, depth: usize) -> Self {
        self.revert_depth = depth;
        self
    }

    /// Create a service from configuration
    ///
    /// Opens the configured database, or a private in-memory one.
    pub fn from_config(config: &ServiceConfig, event_sink: Arc<dyn EventSink>) -> Result<Self> {
        let store = match &config.database_path {
            Some(path) => ProtocolStore::open(path)?,
            None => ProtocolStore::open_in_memory()?,
        };
        Ok(Self::new(event_sink)
            .with_store(store)
            .with_builder(TreeBuilder::new().with_max_steps(config.max_protocol_steps))
            .with_revert_depth(config.revert_depth))
    }

    /// Create a service from the `config.json` in `data_dir`
    ///
    /// A missing file means default configuration.
    pub async fn open(data_dir: &Path, event_sink: Arc<dyn EventSink>) -> Result<Self> {
        let config = ServiceConfig::load(data_dir).await?;
        log::info!(
            "Opening protocol service from {:?} (durable: {})",
            data_dir,
            config.is_durable()
        );
        Self::from_config(&config, event_sink)
    }

    /// Ask the step source for a batch and create an instance from it
    ///
    /// Returns the new instance id.
    pub async fn instantiate(
        &self,
        source: &dyn StepSource,
        request: &ProtocolRequest,
    ) -> Result<String> {
        let descriptors = source.generate_steps(request).await?;
        let instance_id = Uuid::new_v4().to_string();
        self.create_instance(&instance_id, &descriptors).await?;
        log::info!(
            "Instance '{}' created for '{}' by '{}'",
            instance_id,
            request.description,
            request.actor_id
        );
        Ok(instance_id)
    }

    /// Build a graph from `descriptors` and register it under `instance_id`
    ///
    /// Nothing is stored or registered if the batch is rejected.
    pub async fn create_instance(
        &self,
        instance_id: &str,
        descriptors: &[StepDescriptor],
    ) -> Result<FrontierSnapshot> {
        if self.has_instance(instance_id).await {
            return Err(ServiceError::InstanceExists(instance_id.to_string()));
        }

        let graph = self.builder.build(descriptors)?;
        let state = ExecutionEngine::new(&graph).initial_state()?;

        // Persist before locking the map; the store rejects duplicate ids
        if let Some(store) = &self.store {
            store
                .lock()
                .create_instance(instance_id, &graph, &state)
                .map_err(|e| match e {
                    StoreError::InstanceExists(id) => ServiceError::InstanceExists(id),
                    other => ServiceError::Store(other),
                })?;
        }

        let mut instances = self.instances.write().await;
        if instances.contains_key(instance_id) {
            return Err(ServiceError::InstanceExists(instance_id.to_string()));
        }

        let snapshot = state.frontier_snapshot();
        let event = ProtocolEvent::InstanceCreated {
            execution_id: instance_id.to_string(),
            graph_id: graph.id().to_string(),
            step_count: graph.len(),
        };
        instances.insert(
            instance_id.to_string(),
            Arc::new(Mutex::new(InstanceSlot::new(graph, state, self.revert_depth))),
        );
        drop(instances);

        self.emit(event);
        Ok(snapshot)
    }

    /// Move a frontier step from Pending to InProgress
    pub async fn start_step(
        &self,
        instance_id: &str,
        step_id: &str,
        actor_id: &str,
    ) -> Result<TransitionOutcome> {
        self.transition(instance_id, |engine, state| {
            engine.start_step(state, step_id, actor_id)
        })
        .await
    }

    /// Mark one sub-task of an Action as done
    pub async fn complete_subtask(
        &self,
        instance_id: &str,
        step_id: &str,
        index: usize,
        actor_id: &str,
    ) -> Result<TransitionOutcome> {
        self.transition(instance_id, |engine, state| {
            engine.complete_subtask(state, step_id, index, actor_id)
        })
        .await
    }

    /// Pick a branch of a Condition
    pub async fn resolve_condition(
        &self,
        instance_id: &str,
        step_id: &str,
        choice: usize,
        actor_id: &str,
    ) -> Result<TransitionOutcome> {
        self.transition(instance_id, |engine, state| {
            engine.resolve_condition(state, step_id, choice, actor_id)
        })
        .await
    }

    /// Release a Wait
    pub async fn expire_wait(
        &self,
        instance_id: &str,
        step_id: &str,
        signal: WaitSignal,
        actor_id: &str,
    ) -> Result<TransitionOutcome> {
        self.transition(instance_id, |engine, state| {
            engine.expire_wait(state, step_id, signal, actor_id)
        })
        .await
    }

    /// Undo the most recent committed transition
    ///
    /// The restored state gets a fresh version so that it supersedes the
    /// reverted one in storage.
    pub async fn revert_last_transition(&self, instance_id: &str) -> Result<FrontierSnapshot> {
        let slot = self.slot(instance_id).await?;
        let snapshot = self.revert_locked(instance_id, &slot)?;
        self.emit(ProtocolEvent::TransitionReverted {
            execution_id: instance_id.to_string(),
            version: snapshot.version,
        });
        log::info!(
            "Instance '{}' reverted to version {}",
            instance_id,
            snapshot.version
        );
        Ok(snapshot)
    }

    /// Current frontier and status map
    pub async fn snapshot(&self, instance_id: &str) -> Result<FrontierSnapshot> {
        self.read_slot(instance_id, |slot| slot.state.frontier_snapshot())
            .await
    }

    /// Full copy of the execution state
    pub async fn state(&self, instance_id: &str) -> Result<ExecutionState> {
        self.read_slot(instance_id, |slot| slot.state.clone()).await
    }

    /// The instance's immutable graph
    pub async fn graph(&self, instance_id: &str) -> Result<Arc<ProtocolGraph>> {
        self.read_slot(instance_id, |slot| Arc::clone(&slot.graph))
            .await
    }

    /// Whether the protocol has run to completion
    pub async fn is_complete(&self, instance_id: &str) -> Result<bool> {
        self.read_slot(instance_id, |slot| slot.state.is_complete(&slot.graph))
            .await
    }

    /// Steps currently on the frontier
    pub async fn eligible_steps(&self, instance_id: &str) -> Result<Vec<Step>> {
        self.read_slot(instance_id, |slot| {
            slot.state
                .eligible_steps(&slot.graph)
                .into_iter()
                .cloned()
                .collect()
        })
        .await
    }

    /// Whether the instance stopped after a fatal fault
    pub async fn is_halted(&self, instance_id: &str) -> Result<bool> {
        self.read_slot(instance_id, |slot| slot.halted.is_some())
            .await
    }

    /// Check if revert is available
    pub async fn can_revert(&self, instance_id: &str) -> Result<bool> {
        self.read_slot(instance_id, |slot| slot.reverts.can_revert())
            .await
    }

    /// Delete an instance from memory and storage
    ///
    /// Returns `false` if it was unknown to both.
    pub async fn remove_instance(&self, instance_id: &str) -> Result<bool> {
        let removed = self.instances.write().await.remove(instance_id).is_some();
        let deleted = match &self.store {
            Some(store) => store.lock().delete_instance(instance_id)?,
            None => false,
        };
        if removed || deleted {
            log::info!("Removed instance '{}'", instance_id);
        }
        Ok(removed || deleted)
    }

    /// Load every stored instance that is not already live
    ///
    /// Instances whose graph or state fails to load are reported, not
    /// registered.
    pub async fn restore_from_store(&self) -> Result<RestoreReport> {
        let Some(store) = &self.store else {
            return Ok(RestoreReport::default());
        };

        let loaded: Vec<(String, std::result::Result<StoredInstance, String>)> = {
            let store = store.lock();
            store
                .instance_ids()?
                .into_iter()
                .map(|id| {
                    let result = store.load_instance(&id).map_err(|e| e.to_string());
                    (id, result)
                })
                .collect()
        };

        let mut report = RestoreReport::default();
        let mut instances = self.instances.write().await;
        for (instance_id, result) in loaded {
            if instances.contains_key(&instance_id) {
                continue;
            }
            match result {
                Ok(stored) => {
                    instances.insert(
                        instance_id.clone(),
                        Arc::new(Mutex::new(InstanceSlot::new(
                            stored.graph,
                            stored.state,
                            self.revert_depth,
                        ))),
                    );
                    report.restored.push(instance_id);
                }
                Err(reason) => {
                    log::error!("Failed to restore instance '{}': {}", instance_id, reason);
                    report.failed.push((instance_id, reason));
                }
            }
        }

        log::info!(
            "Restored {} instances ({} failed)",
            report.restored.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Get the number of live instances
    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Check if an instance is live
    pub async fn has_instance(&self, instance_id: &str) -> bool {
        self.instances.read().await.contains_key(instance_id)
    }

    /// Ids of every live instance, sorted
    pub async fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn slot(&self, instance_id: &str) -> Result<Arc<Mutex<InstanceSlot>>> {
        self.instances
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| ServiceError::InstanceNotFound(instance_id.to_string()))
    }

    async fn read_slot<R>(&self, instance_id: &str, f: impl FnOnce(&InstanceSlot) -> R) -> Result<R> {
        let slot = self.slot(instance_id).await?;
        let guard = slot.lock();
        Ok(f(&guard))
    }

    /// Run one engine transition against an instance
    async fn transition<F>(&self, instance_id: &str, op: F) -> Result<TransitionOutcome>
    where
        F: FnOnce(&ExecutionEngine<'_>, &mut ExecutionState) -> cat_engine::Result<TransitionOutcome>,
    {
        let slot = self.slot(instance_id).await?;
        match self.transition_locked(instance_id, &slot, op) {
            Ok(outcome) => {
                for event in &outcome.events {
                    self.emit(event.clone());
                }
                Ok(outcome)
            }
            Err(ServiceError::Execution(e)) if e.is_fatal() => {
                self.emit(ProtocolEvent::instance_halted(instance_id, &e));
                Err(ServiceError::Execution(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Apply `op` under the instance lock and commit on success
    ///
    /// The new state is persisted before it replaces the live one, so a
    /// failed write leaves the instance exactly as it was.
    fn transition_locked<F>(
        &self,
        instance_id: &str,
        slot: &Mutex<InstanceSlot>,
        op: F,
    ) -> Result<TransitionOutcome>
    where
        F: FnOnce(&ExecutionEngine<'_>, &mut ExecutionState) -> cat_engine::Result<TransitionOutcome>,
    {
        let mut guard = slot.lock();
        let slot = &mut *guard;
        slot.ensure_running(instance_id)?;

        let graph = Arc::clone(&slot.graph);
        let engine = ExecutionEngine::new(&graph).with_execution_id(instance_id);
        let mut next = slot.state.clone();

        let outcome = match op(&engine, &mut next) {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_fatal() {
                    log::error!("Halting instance '{}': {}", instance_id, e);
                    slot.halted = Some(e.to_string());
                }
                return Err(e.into());
            }
        };
        if !outcome.changed {
            return Ok(outcome);
        }

        let previous = CompressedState::encode(&slot.state)?;
        if let Some(store) = &self.store {
            store
                .lock()
                .save_state(instance_id, &next, slot.state.version())?;
        }
        slot.reverts.push(previous);
        slot.state = next;
        Ok(outcome)
    }

    fn revert_locked(&self, instance_id: &str, slot: &Mutex<InstanceSlot>) -> Result<FrontierSnapshot> {
        let mut guard = slot.lock();
        let slot = &mut *guard;
        slot.ensure_running(instance_id)?;

        let snapshot = slot
            .reverts
            .pop()
            .ok_or_else(|| ServiceError::NothingToRevert(instance_id.to_string()))?;

        let restore = |snapshot: &CompressedState, slot: &InstanceSlot| -> Result<ExecutionState> {
            let restored = snapshot
                .decode()?
                .with_version(slot.state.version() + 1);
            restored.check_consistency(&slot.graph)?;
            if let Some(store) = &self.store {
                store
                    .lock()
                    .save_state(instance_id, &restored, slot.state.version())?;
            }
            Ok(restored)
        };

        match restore(&snapshot, slot) {
            Ok(restored) => {
                slot.state = restored;
                Ok(slot.state.frontier_snapshot())
            }
            Err(e) => {
                slot.reverts.push(snapshot);
                Err(e)
            }
        }
    }

    fn emit(&self, event: ProtocolEvent) {
        if let Err(e) = self.event_sink.send(event) {
            log::warn!("Failed to deliver protocol event: {}", e);
        }
    }
}
