//! Typed worker registry.
//!
//! Dispatch is by declared capability, not by probing: every worker's
//! channel contract is validated against the schema when it is
//! registered, before anything can be invoked.

use std::collections::HashMap;
use std::sync::Arc;

use strand_contract::{StateSchema, Worker};
use thiserror::Error;

use crate::constants::ROUTER_GROUP;

/// Registration and lookup failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A worker with the same name is already registered.
    #[error("worker already registered: {0}")]
    DuplicateWorker(String),

    /// The worker group collides with the router's reserved group.
    #[error("worker {0} uses the reserved group \"{ROUTER_GROUP}\"")]
    ReservedGroup(String),

    /// A declared channel does not exist in the schema.
    #[error("worker {worker} declares unknown channel {channel}")]
    UnknownChannel { worker: String, channel: String },

    /// A declared write targets a channel owned by another group.
    #[error("worker {worker} (group {group}) declares write to channel {channel} owned by {owner}")]
    UnownedWrite {
        worker: String,
        group: String,
        channel: String,
        owner: String,
    },

    /// Lookup for an unregistered worker.
    #[error("worker not found: {0}")]
    WorkerNotFound(String),
}

/// Holds the workers the router may dispatch to, keyed by name.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker after validating its channel contract against
    /// the schema.
    pub fn register(
        &mut self,
        worker: Arc<dyn Worker>,
        schema: &StateSchema,
    ) -> Result<(), RegistryError> {
        let spec = worker.spec().clone();
        if self.workers.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateWorker(spec.name));
        }
        if spec.group == ROUTER_GROUP {
            return Err(RegistryError::ReservedGroup(spec.name));
        }
        for channel in &spec.reads {
            if !schema.contains(channel) {
                return Err(RegistryError::UnknownChannel {
                    worker: spec.name.clone(),
                    channel: channel.clone(),
                });
            }
        }
        for channel in &spec.writes {
            match schema.owner_of(channel) {
                None => {
                    return Err(RegistryError::UnknownChannel {
                        worker: spec.name.clone(),
                        channel: channel.clone(),
                    });
                }
                Some(owner) if owner != spec.group => {
                    return Err(RegistryError::UnownedWrite {
                        worker: spec.name.clone(),
                        group: spec.group.clone(),
                        channel: channel.clone(),
                        owner: owner.to_string(),
                    });
                }
                Some(_) => {}
            }
        }
        self.workers.insert(spec.name, worker);
        Ok(())
    }

    /// Look up a worker by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).cloned()
    }

    /// Look up a worker, failing with a typed error.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Worker>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::WorkerNotFound(name.to_string()))
    }

    /// Registered worker names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no worker is registered.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
