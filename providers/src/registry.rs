//! Provider registry: specs by name, sessions started lazily.
//!
//! At most one session exists per provider name. Startup is serialized
//! per name so concurrent first calls never spawn two sessions. A
//! caller that hits a transport error reports the session generation it
//! observed; only that generation is discarded, so a racing rebuild is
//! never torn down by a stale report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    client::ConnectOptions,
    error::{ProviderError, ProviderResult},
    session::{close_shared, ProviderSession},
    spec::ProviderSpec,
};

pub struct ProviderRegistry {
    specs: DashMap<String, ProviderSpec>,
    sessions: DashMap<String, Arc<ProviderSession>>,
    startup_locks: DashMap<String, Arc<Mutex<()>>>,
    next_generation: AtomicU64,
    connect_options: ConnectOptions,
}

impl ProviderRegistry {
    pub fn new(connect_options: ConnectOptions) -> Self {
        Self {
            specs: DashMap::new(),
            sessions: DashMap::new(),
            startup_locks: DashMap::new(),
            next_generation: AtomicU64::new(1),
            connect_options,
        }
    }

    /// Register or replace a provider spec. Replacing a provider closes
    /// any session opened under the old spec.
    pub fn register(&self, name: impl Into<String>, spec: ProviderSpec) {
        let name = name.into();
        if let Some((_, old)) = self.sessions.remove(&name) {
            info!("Replacing provider '{}', closing its session", name);
            close_shared(old);
        }
        self.specs.insert(name, spec);
    }

    /// Remove a provider. An in-flight call keeps its session alive and
    /// completes against it; the next `session_for` finds nothing.
    pub fn deregister(&self, name: &str) {
        self.specs.remove(name);
        self.startup_locks.remove(name);
        if let Some((_, session)) = self.sessions.remove(name) {
            close_shared(session);
        }
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.specs.iter().map(|e| e.key().clone()).collect()
    }

    /// Cached session for `name`, creating it on first use.
    pub async fn session_for(&self, name: &str) -> ProviderResult<Arc<ProviderSession>> {
        if let Some(session) = self.sessions.get(name) {
            return Ok(Arc::clone(session.value()));
        }

        let lock = self
            .startup_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A concurrent first call may have won the race while we waited.
        if let Some(session) = self.sessions.get(name) {
            return Ok(Arc::clone(session.value()));
        }

        let spec = self
            .specs
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| ProviderError::NotRegistered(name.to_string()))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(
            ProviderSession::establish(name, &spec, &self.connect_options, generation).await?,
        );

        debug!(
            provider = name,
            generation,
            tools = session.tool_count(),
            "Provider session established"
        );
        self.sessions.insert(name.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Discard the cached session for `name` if it is still the one the
    /// caller observed failing.
    pub fn invalidate(&self, name: &str, observed_generation: u64) {
        let removed = self
            .sessions
            .remove_if(name, |_, session| {
                session.generation() == observed_generation
            })
            .is_some();
        if removed {
            debug!(
                provider = name,
                generation = observed_generation,
                "Discarded provider session after transport error"
            );
        }
    }

    /// Close every session. Registered specs persist, so providers
    /// restart lazily on the next call.
    pub fn close_all(&self) {
        let names: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, session)) = self.sessions.remove(&name) {
                close_shared(session);
            }
        }
    }
}
