//! Job definition registry
//!
//! Maps `(type, version)` to the schema that handles it. Lookup is a linear
//! scan in registration order, so when two schemas share a type with
//! overlapping versions the one registered first wins.
//!
//! Registration is a setup-time operation. The consumer loop only reads.

use crate::schema::{normalize_type, JobSchema};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

static GLOBAL: Lazy<Arc<JobDefinitionRegistry>> = Lazy::new(|| Arc::new(JobDefinitionRegistry::new()));

#[derive(Default)]
struct RegistryState {
    definitions: Vec<Arc<JobSchema>>,
    /// Declaring entity -> its current schema
    canonical: HashMap<String, Arc<JobSchema>>,
}

/// Table of registered job schemas
#[derive(Default)]
pub struct JobDefinitionRegistry {
    state: RwLock<RegistryState>,
}

impl JobDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> Arc<JobDefinitionRegistry> {
        Arc::clone(&GLOBAL)
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a schema, replacing the declaring entity's current one.
    pub fn register(&self, schema: JobSchema) -> Arc<JobSchema> {
        self.register_with(schema, true)
    }

    /// Register a schema.
    ///
    /// With `replace_existing`, the schema previously registered the same way
    /// by the same declaring entity is removed and the new one becomes that
    /// entity's canonical schema. Without it, the schema is appended as an
    /// extra answer for the entity; nothing is removed and the canonical
    /// schema is left alone.
    pub fn register_with(&self, schema: JobSchema, replace_existing: bool) -> Arc<JobSchema> {
        let schema = Arc::new(schema);
        let mut state = self.write();

        if replace_existing {
            if let Some(previous) = state.canonical.remove(schema.declared_by()) {
                state.definitions.retain(|d| !Arc::ptr_eq(d, &previous));
            }
            state
                .canonical
                .insert(schema.declared_by().to_string(), Arc::clone(&schema));
        }
        state.definitions.push(Arc::clone(&schema));

        debug!(
            declared_by = %schema.declared_by(),
            job_type = %schema.job_type(),
            versions = ?schema.versions(),
            replace_existing,
            "Registered job schema"
        );
        schema
    }

    /// Find the first schema answering to `(job_type, version)`
    pub fn resolve(&self, job_type: &str, version: &str) -> Option<Arc<JobSchema>> {
        let job_type = normalize_type(job_type);
        self.read()
            .definitions
            .iter()
            .find(|d| d.job_type() == job_type && d.versions().iter().any(|v| v == version))
            .cloned()
    }

    /// Canonical schema of a declaring entity
    pub fn schema_for(&self, declared_by: &str) -> Option<Arc<JobSchema>> {
        self.read().canonical.get(declared_by).cloned()
    }

    /// All registered schemas in registration order
    pub fn definitions(&self) -> Vec<Arc<JobSchema>> {
        self.read().definitions.clone()
    }

    pub fn len(&self) -> usize {
        self.read().definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().definitions.is_empty()
    }

    /// Drop every registration
    pub fn clear(&self) {
        let mut state = self.write();
        state.definitions.clear();
        state.canonical.clear();
    }
}
