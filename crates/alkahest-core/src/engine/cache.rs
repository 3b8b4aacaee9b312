//! Compute context lifecycle management.
//!
//! Each unit owns two [`ContextCache`]s (energy evaluation and
//! configuration propagation) that must be drained on every exit path. A
//! process-wide [`SharedContextPool`] tracks contexts across all caches in
//! the process; it is the one piece of global state in the engine and
//! carries an explicit `reset()` contract invoked at unit completion.

use super::alchemy::AlchemicalSystem;
use super::config::IntegratorSettings;
use super::error::EngineError;
use super::platform::ComputePlatform;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

static SHARED_CONTEXT_POOL: Lazy<Mutex<SharedContextPool>> =
    Lazy::new(|| Mutex::new(SharedContextPool::default()));

/// Locks and returns the process-wide context pool.
pub fn shared_context_pool() -> MutexGuard<'static, SharedContextPool> {
    SHARED_CONTEXT_POOL
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process-wide accounting of live native contexts.
#[derive(Debug, Default)]
pub struct SharedContextPool {
    live_contexts: usize,
}

impl SharedContextPool {
    fn register(&mut self) {
        self.live_contexts += 1;
    }

    fn release(&mut self, count: usize) {
        self.live_contexts = self.live_contexts.saturating_sub(count);
    }

    pub fn live_contexts(&self) -> usize {
        self.live_contexts
    }

    /// Clears the pool accounting. Called after every unit so leaked
    /// contexts from one unit cannot accumulate across many units run in
    /// the same process.
    pub fn reset(&mut self) {
        if self.live_contexts > 0 {
            warn!(
                live_contexts = self.live_contexts,
                "resetting shared context pool with live contexts; a cache was not drained"
            );
        }
        self.live_contexts = 0;
    }
}

/// A per-unit cache of compute contexts on one platform.
pub struct ContextCache<P: ComputePlatform> {
    platform: Arc<P>,
    contexts: HashMap<u64, P::Context>,
}

impl<P: ComputePlatform> ContextCache<P> {
    pub fn new(platform: Arc<P>) -> Self {
        Self {
            platform,
            contexts: HashMap::new(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Returns the cached context for `key`, creating it on first use.
    pub fn get_or_create(
        &mut self,
        key: u64,
        system: &AlchemicalSystem,
        integrator: &IntegratorSettings,
    ) -> Result<&mut P::Context, EngineError> {
        if !self.contexts.contains_key(&key) {
            let context = self.platform.create_context(system, integrator)?;
            shared_context_pool().register();
            self.contexts.insert(key, context);
        }
        Ok(self
            .contexts
            .get_mut(&key)
            .expect("context inserted above"))
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Releases every context held by this cache.
    pub fn drain(&mut self) {
        let released = self.contexts.len();
        self.contexts.clear();
        if released > 0 {
            shared_context_pool().release(released);
        }
    }
}

impl<P: ComputePlatform> Drop for ContextCache<P> {
    fn drop(&mut self) {
        self.drain();
    }
}
