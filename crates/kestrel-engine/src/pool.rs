//! Bounded set of live sessions sharing one set of services.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use kestrel_core::ids::SessionId;
use kestrel_settings::PoolSettings;

use crate::error::{EngineError, Result};
use crate::session::{ResumeOptions, Session, SessionConfig, SessionDeps, SessionStatus};

pub const DEFAULT_MAX_SESSIONS: usize = 50;

#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub max_sessions: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl PoolOptions {
    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            max_sessions: settings.max_sessions,
        }
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }
}

/// Live sessions plus ids whose construction is still in flight. A
/// reservation counts against capacity so concurrent creates cannot
/// overshoot the limit.
#[derive(Default)]
struct Slots {
    live: HashMap<SessionId, Session>,
    pending: HashSet<SessionId>,
}

impl Slots {
    fn used(&self) -> usize {
        self.live.len() + self.pending.len()
    }
}

pub struct SessionPool {
    deps: SessionDeps,
    options: PoolOptions,
    slots: Mutex<Slots>,
}

impl SessionPool {
    pub fn new(deps: SessionDeps, options: PoolOptions) -> Self {
        Self {
            deps,
            options,
            slots: Mutex::new(Slots::default()),
        }
    }

    pub async fn create(&self, config: SessionConfig) -> Result<Session> {
        self.create_with_id(SessionId::new(), config).await
    }

    #[instrument(skip(self, config), fields(session_id = %id))]
    pub async fn create_with_id(&self, id: SessionId, config: SessionConfig) -> Result<Session> {
        self.reserve(&id)?;
        let result = Session::create_with_id(id.clone(), config, self.deps.clone()).await;
        self.settle(&id, result)
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.slots.lock().live.get(id).cloned()
    }

    /// Pooled session ids, sorted, optionally restricted to a prefix.
    pub fn list(&self, prefix: Option<&str>) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .slots
            .lock()
            .live
            .keys()
            .filter(|id| prefix.map_or(true, |p| id.as_str().starts_with(p)))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn status(&self, id: &SessionId) -> Option<SessionStatus> {
        self.get(id).map(|session| session.status())
    }

    /// Fork a pooled session and pool the child.
    pub async fn fork(&self, id: &SessionId, selector: Option<&str>) -> Result<Session> {
        let parent = self
            .get(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        {
            let slots = self.slots.lock();
            if slots.used() >= self.options.max_sessions {
                return Err(EngineError::PoolFull(self.options.max_sessions));
            }
        }
        let child = parent.fork(selector).await?;
        let pooled = {
            let mut slots = self.slots.lock();
            if slots.used() < self.options.max_sessions {
                let _ = slots.live.insert(child.id().clone(), child.clone());
                true
            } else {
                false
            }
        };
        if !pooled {
            child.dispose().await;
            return Err(EngineError::PoolFull(self.options.max_sessions));
        }
        Ok(child)
    }

    /// The pooled session if present, otherwise a stored one brought back
    /// with `opts`.
    #[instrument(skip(self, config, opts), fields(session_id = %id))]
    pub async fn resume(&self, id: &SessionId, config: SessionConfig, opts: ResumeOptions) -> Result<Session> {
        if let Some(session) = self.get(id) {
            return Ok(session);
        }
        if !self.deps.store.exists(id).await? {
            return Err(EngineError::SessionNotFound(id.to_string()));
        }
        self.reserve(id)?;
        let result = Session::resume(id.clone(), config, self.deps.clone(), opts).await;
        self.settle(id, result)
    }

    /// Resume every stored session not already pooled, stopping once the
    /// pool is full. Individual failures are logged and skipped.
    pub async fn resume_all<F>(&self, config_factory: F, opts: ResumeOptions) -> Result<Vec<SessionId>>
    where
        F: Fn(&SessionId) -> SessionConfig,
    {
        let mut resumed = Vec::new();
        for id in self.deps.store.list(None).await? {
            if self.slots.lock().live.contains_key(&id) {
                continue;
            }
            if self.size() >= self.options.max_sessions {
                info!(max = self.options.max_sessions, "pool full, remaining sessions left on disk");
                break;
            }
            match self.resume(&id, config_factory(&id), opts).await {
                Ok(_) => resumed.push(id),
                Err(e) => warn!(session_id = %id, error = %e, "failed to resume session"),
            }
        }
        Ok(resumed)
    }

    /// Drop a session from the pool, leaving its stored state alone.
    pub async fn evict(&self, id: &SessionId) -> bool {
        let removed = self.slots.lock().live.remove(id);
        match removed {
            Some(session) => {
                session.dispose().await;
                true
            }
            None => false,
        }
    }

    /// Evict and erase the session's stored state.
    pub async fn delete(&self, id: &SessionId) -> Result<()> {
        let _ = self.evict(id).await;
        self.deps.store.delete(id).await?;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.slots.lock().live.len()
    }

    fn reserve(&self, id: &SessionId) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots.live.contains_key(id) || slots.pending.contains(id) {
            return Err(EngineError::SessionExists(id.to_string()));
        }
        if slots.used() >= self.options.max_sessions {
            return Err(EngineError::PoolFull(self.options.max_sessions));
        }
        let _ = slots.pending.insert(id.clone());
        Ok(())
    }

    fn settle(&self, id: &SessionId, result: Result<Session>) -> Result<Session> {
        let mut slots = self.slots.lock();
        let _ = slots.pending.remove(id);
        let session = result?;
        let _ = slots.live.insert(id.clone(), session.clone());
        Ok(session)
    }
}
