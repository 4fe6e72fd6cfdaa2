//! Parameter store: the authoritative in-memory state of a shard
//!
//! A single store-wide lock serializes parameter initialization, gradient
//! updates, reads, and checkpoint snapshots. Optimizer updates run with the
//! lock held, so updates to one name are applied in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use checkpoint::SnapshotSource;
use parking_lot::Mutex;
use pserver_core::{
    CheckpointSnapshot, Error, Gradient, Parameter, ParameterCheckpoint, ParameterWithConfig,
    Result,
};
use tracing::{debug, info, warn};

use crate::gate::InitGate;
use crate::optimizer::{Optimizer, OptimizerFactory};

/// Concurrency-guarded map from parameter name to optimizer
pub struct ParameterStore {
    factory: Arc<dyn OptimizerFactory>,
    entries: Mutex<HashMap<String, Box<dyn Optimizer>>>,
}

impl ParameterStore {
    /// Create an empty store
    pub fn new(factory: Arc<dyn OptimizerFactory>) -> Self {
        Self {
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Create a store holding the entries of a recovered checkpoint
    ///
    /// Each entry's optimizer is rebuilt with its saved state.
    pub fn from_checkpoint(
        factory: Arc<dyn OptimizerFactory>,
        snapshot: CheckpointSnapshot,
    ) -> Result<Self> {
        let mut entries = HashMap::with_capacity(snapshot.len());
        for item in snapshot {
            let name = item.param.param.name.clone();
            let optimizer = factory.create(item.param, Some(item.state))?;
            entries.insert(name, optimizer);
        }

        info!(entries = entries.len(), "Parameter store restored from checkpoint");
        Ok(Self {
            factory,
            entries: Mutex::new(entries),
        })
    }

    /// Register a parameter while `gate` is open
    ///
    /// Registering an existing name replaces its entry. The gate is checked
    /// under the store lock, so no registration lands after [`Self::seal`].
    pub fn init_param(&self, gate: &InitGate, param: ParameterWithConfig) -> Result<()> {
        let mut entries = self.entries.lock();
        gate.ensure_open()?;

        let name = param.param.name.clone();
        let optimizer = self.factory.create(param, None)?;
        if entries.insert(name.clone(), optimizer).is_some() {
            warn!(name = %name, "Parameter re-initialized, previous entry replaced");
        } else {
            debug!(name = %name, "Parameter initialized");
        }
        Ok(())
    }

    /// Close `gate` under the store lock
    pub fn seal(&self, gate: &InitGate) -> Result<()> {
        let entries = self.entries.lock();
        gate.close()?;
        info!(entries = entries.len(), "Parameter initialization finished");
        Ok(())
    }

    /// Apply a gradient through the named parameter's optimizer
    pub fn apply(&self, gradient: &Gradient) -> Result<()> {
        let mut entries = self.entries.lock();
        let optimizer = entries
            .get_mut(&gradient.name)
            .ok_or_else(|| Error::ParameterNotFound {
                name: gradient.name.clone(),
            })?;
        optimizer.update(gradient)
    }

    /// Current value of the named parameter
    ///
    /// The content shares the optimizer's weight buffer without copying. It
    /// may be stale relative to a concurrent update but is never torn.
    pub fn get(&self, name: &str) -> Result<Parameter> {
        let entries = self.entries.lock();
        let optimizer = entries.get(name).ok_or_else(|| Error::ParameterNotFound {
            name: name.to_string(),
        })?;

        Ok(Parameter {
            name: name.to_string(),
            element_type: optimizer.element_type(),
            content: optimizer.weights(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Registered parameter names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl SnapshotSource for ParameterStore {
    fn snapshot(&self) -> CheckpointSnapshot {
        let mut snapshot: CheckpointSnapshot = {
            let entries = self.entries.lock();
            entries
                .iter()
                .map(|(name, optimizer)| ParameterCheckpoint {
                    param: ParameterWithConfig {
                        param: Parameter {
                            name: name.clone(),
                            element_type: optimizer.element_type(),
                            content: optimizer.weights(),
                        },
                        config: optimizer.config(),
                    },
                    state: optimizer.state(),
                })
                .collect()
        };

        snapshot.sort_by(|a, b| a.param.param.name.cmp(&b.param.param.name));
        snapshot
    }
}
