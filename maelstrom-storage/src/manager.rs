//! Instance lifecycle.
//!
//! The durable instance file is the source of truth; live runtimes are a
//! cache. Every operation on an instance holds that instance's async lock from
//! load to persist, so events for one instance are applied one at a time and
//! in the order they were logged. Different instances never share a lock.
//!
//! If persisting fails after the runtime has advanced, the cached runtime is
//! ahead of the file until it is evicted or the process restarts.

use crate::catalog::Catalog;
use crate::error::StorageError;
use crate::store::{InstanceStore, INSTANCE_PREFIX};
use dashmap::DashMap;
use maelstrom_core::{CompiledMachine, Event, EventRecord, InstanceKey, InstanceRecord, Runtime};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

type Slot = Arc<Mutex<Option<Runtime>>>;

/// Result of creating an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Created {
    pub id: String,
    pub current: String,
}

/// State of an instance after an event, or on request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub current: String,
    /// Number of logged events.
    pub history: usize,
}

pub struct InstanceManager {
    catalog: Arc<Catalog>,
    store: Arc<InstanceStore>,
    slots: DashMap<InstanceKey, Slot>,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
}

impl InstanceManager {
    /// Creates a manager. Instance ids continue after the highest id found in
    /// the store.
    pub fn new(catalog: Arc<Catalog>, store: Arc<InstanceStore>) -> Result<Self, StorageError> {
        let seq = store.max_instance_seq()?;
        tracing::info!("Instance manager starting at sequence {}", seq);
        Ok(Self {
            catalog,
            store,
            slots: DashMap::new(),
            next_seq: AtomicU64::new(seq),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Cancels in-flight actions. Later events still run, with actions seeing
    /// a cancelled scope.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Number of runtimes currently cached.
    pub fn cached_runtimes(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.value().try_lock().map(|rt| rt.is_some()).unwrap_or(true))
            .count()
    }

    fn machine(&self, machine_id: &str) -> Result<Arc<CompiledMachine>, StorageError> {
        self.catalog
            .compiled(machine_id)
            .ok_or_else(|| StorageError::MachineNotFound(machine_id.to_string()))
    }

    /// Lock slot for an instance, created on first use.
    fn slot(&self, key: &InstanceKey) -> Slot {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone()
    }

    /// Drops the slot of an instance that no longer exists. A slot that was
    /// already replaced is left alone. Tasks still waiting on the old slot
    /// find the instance gone when they load it.
    fn release(&self, key: &InstanceKey, slot: &Slot) {
        self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Loads the record, releasing the slot if the instance does not exist.
    async fn load_or_release<'a>(
        &self,
        key: &InstanceKey,
        slot: &'a Slot,
        cached: MutexGuard<'a, Option<Runtime>>,
    ) -> Result<(InstanceRecord, MutexGuard<'a, Option<Runtime>>), StorageError> {
        match self.load(key).await {
            Ok(record) => Ok((record, cached)),
            Err(StorageError::InstanceNotFound(id)) => {
                let unused = cached.is_none();
                drop(cached);
                if unused {
                    self.release(key, slot);
                }
                Err(StorageError::InstanceNotFound(id))
            }
            Err(e) => Err(e),
        }
    }

    async fn load(&self, key: &InstanceKey) -> Result<InstanceRecord, StorageError> {
        let store = self.store.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || store.load(&key)).await?
    }

    async fn save(&self, key: &InstanceKey, record: &InstanceRecord) -> Result<(), StorageError> {
        let store = self.store.clone();
        let key = key.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.save(&key, &record)).await?
    }

    /// Rebuilds a runtime from the initial context by replaying the log.
    async fn replay(
        &self,
        machine: &CompiledMachine,
        key: &InstanceKey,
        record: &InstanceRecord,
    ) -> Result<Runtime, StorageError> {
        let mut runtime = machine.start(Some(record.context_object()))?;
        for logged in &record.history {
            match machine.event_id(&logged.event_type) {
                Some(id) => {
                    runtime
                        .process_event(Event::new(id, logged.data.clone()), &self.shutdown)
                        .await?;
                }
                None => tracing::warn!(
                    "Replay of {} skipped unknown event '{}'",
                    key,
                    logged.event_type
                ),
            }
        }
        tracing::debug!("Rebuilt {} from {} events", key, record.history.len());
        Ok(runtime)
    }

    /// Takes the cached runtime when it belongs to the current compile of the
    /// machine; otherwise replays.
    async fn runtime(
        &self,
        cached: &mut Option<Runtime>,
        machine: &CompiledMachine,
        key: &InstanceKey,
        record: &InstanceRecord,
    ) -> Result<Runtime, StorageError> {
        match cached.take() {
            Some(rt) if Arc::ptr_eq(rt.machine(), machine.machine()) => Ok(rt),
            _ => self.replay(machine, key, record).await,
        }
    }

    fn current(machine: &CompiledMachine, runtime: &Runtime) -> String {
        machine.current_path(runtime).unwrap_or_default().to_string()
    }

    /// Creates an instance with the given initial context.
    pub async fn create(
        &self,
        machine_id: &str,
        initial_context: Value,
    ) -> Result<Created, StorageError> {
        let machine = self.machine(machine_id)?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}{}", INSTANCE_PREFIX, seq);
        let key = InstanceKey::new(machine_id, &id);

        let slot = self.slot(&key);
        let mut cached = slot.lock().await;

        let record = InstanceRecord::new(initial_context);
        self.save(&key, &record).await?;

        let runtime = machine.start(Some(record.context_object()))?;
        let current = Self::current(&machine, &runtime);
        *cached = Some(runtime);

        tracing::info!("Created instance {} in {}", key, current);
        Ok(Created { id, current })
    }

    /// Delivers one event: replays if needed, applies it, appends it to the
    /// log and persists before the lock is released.
    pub async fn deliver(
        &self,
        machine_id: &str,
        instance_id: &str,
        event: EventRecord,
    ) -> Result<InstanceStatus, StorageError> {
        let machine = self.machine(machine_id)?;
        let key = InstanceKey::new(machine_id, instance_id);
        let slot = self.slot(&key);
        let cached = slot.lock().await;

        let (mut record, mut cached) = self.load_or_release(&key, &slot, cached).await?;
        let mut runtime = self.runtime(&mut cached, &machine, &key, &record).await?;

        let Some(event_id) = machine.event_id(&event.event_type) else {
            *cached = Some(runtime);
            return Err(StorageError::UnknownEvent {
                machine: machine_id.to_string(),
                event: event.event_type,
            });
        };

        let taken = runtime
            .process_event(Event::new(event_id, event.data.clone()), &self.shutdown)
            .await;
        let taken = match taken {
            Ok(taken) => taken,
            Err(e) => {
                *cached = Some(runtime);
                return Err(e.into());
            }
        };

        let current = Self::current(&machine, &runtime);
        *cached = Some(runtime);

        record.append(event);
        self.save(&key, &record).await?;

        tracing::info!(
            "Event {} on {}: {} (taken={})",
            record.history.last().map(|e| e.event_type.as_str()).unwrap_or_default(),
            key,
            current,
            taken
        );
        Ok(InstanceStatus {
            current,
            history: record.history.len(),
        })
    }

    /// Current state and history length of an instance.
    pub async fn describe(
        &self,
        machine_id: &str,
        instance_id: &str,
    ) -> Result<InstanceStatus, StorageError> {
        let machine = self.machine(machine_id)?;
        let key = InstanceKey::new(machine_id, instance_id);
        let slot = self.slot(&key);
        let cached = slot.lock().await;

        let (record, mut cached) = self.load_or_release(&key, &slot, cached).await?;
        let runtime = self.runtime(&mut cached, &machine, &key, &record).await?;
        let current = Self::current(&machine, &runtime);
        *cached = Some(runtime);

        Ok(InstanceStatus {
            current,
            history: record.history.len(),
        })
    }

    /// Removes the file (missing is fine) and evicts the runtime.
    pub async fn delete(&self, machine_id: &str, instance_id: &str) -> Result<bool, StorageError> {
        let key = InstanceKey::new(machine_id, instance_id);
        let slot = self.slot(&key);
        let mut cached = slot.lock().await;

        let store = self.store.clone();
        let removed = {
            let key = key.clone();
            tokio::task::spawn_blocking(move || store.remove(&key)).await??
        };
        if let Some(mut runtime) = cached.take() {
            if let Err(e) = runtime.stop() {
                tracing::warn!("Stopping evicted runtime {} failed: {}", key, e);
            }
        }
        drop(cached);
        self.release(&key, &slot);

        tracing::info!("Deleted instance {} (file removed: {})", key, removed);
        Ok(removed)
    }
}
