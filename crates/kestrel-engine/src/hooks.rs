use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use kestrel_core::hooks::{HookContext, HookDecision, Hooks, PostHookAction, ToolOutcome};
use kestrel_core::messages::ToolCall;
use kestrel_core::provider::{ModelRequest, ModelResponse};

use crate::limiter::panic_message;

pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Who registered a hook set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookOrigin {
    Session,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredHook {
    pub origin: HookOrigin,
    pub name: String,
}

/// Circuit breaker state for a hook set.
struct CircuitBreaker {
    failures: AtomicU32,
    threshold: u32,
    last_trip: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            failures: AtomicU32::new(0),
            threshold,
            last_trip: Mutex::new(None),
            cooldown,
        }
    }

    fn is_open(&self) -> bool {
        if self.failures.load(Ordering::Relaxed) < self.threshold {
            return false;
        }
        self.last_trip
            .lock()
            .is_some_and(|tripped_at| tripped_at.elapsed() < self.cooldown)
    }

    fn record_failure(&self, hook_name: &str) {
        let prev = self.failures.fetch_add(1, Ordering::Relaxed);
        if prev + 1 >= self.threshold {
            let mut last_trip = self.last_trip.lock();
            if last_trip.is_none() {
                warn!(
                    hook = hook_name,
                    failures = prev + 1,
                    threshold = self.threshold,
                    cooldown_secs = self.cooldown.as_secs(),
                    "hook circuit breaker tripped"
                );
            }
            *last_trip = Some(Instant::now());
        }
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        *self.last_trip.lock() = None;
    }
}

struct HookEntry {
    hooks: Arc<dyn Hooks>,
    origin: HookOrigin,
    breaker: CircuitBreaker,
}

/// Ordered hook sets run around tool and model calls.
///
/// Every invocation runs under a timeout and a panic guard. A failing hook is
/// skipped (fail-open) and counts against its circuit breaker.
pub struct HookPipeline {
    entries: RwLock<Vec<Arc<HookEntry>>>,
    hook_timeout: Duration,
    circuit_threshold: u32,
    circuit_cooldown: Duration,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            circuit_threshold: 3,
            circuit_cooldown: Duration::from_secs(60),
        }
    }

    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    pub fn with_circuit_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.circuit_threshold = threshold;
        self.circuit_cooldown = cooldown;
        self
    }

    pub fn register(&self, hooks: Arc<dyn Hooks>, origin: HookOrigin) {
        self.entries.write().push(Arc::new(HookEntry {
            hooks,
            origin,
            breaker: CircuitBreaker::new(self.circuit_threshold, self.circuit_cooldown),
        }));
    }

    pub fn registered(&self) -> Vec<RegisteredHook> {
        self.entries
            .read()
            .iter()
            .map(|e| RegisteredHook {
                origin: e.origin,
                name: e.hooks.name().to_string(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Same hook sets in the same order, with fresh breakers.
    pub fn fork_copy(&self) -> Self {
        let copy = Self {
            entries: RwLock::new(Vec::new()),
            hook_timeout: self.hook_timeout,
            circuit_threshold: self.circuit_threshold,
            circuit_cooldown: self.circuit_cooldown,
        };
        for entry in self.snapshot() {
            copy.register(Arc::clone(&entry.hooks), entry.origin);
        }
        copy
    }

    fn snapshot(&self) -> Vec<Arc<HookEntry>> {
        self.entries.read().clone()
    }

    async fn guarded<T>(&self, entry: &HookEntry, phase: &str, fut: impl Future<Output = T>) -> Option<T> {
        let name = entry.hooks.name();
        match tokio::time::timeout(self.hook_timeout, AssertUnwindSafe(fut).catch_unwind()).await {
            Ok(Ok(value)) => {
                entry.breaker.record_success();
                Some(value)
            }
            Ok(Err(panic)) => {
                error!(hook = name, phase, panic = %panic_message(&panic), "hook panicked, skipping");
                entry.breaker.record_failure(name);
                None
            }
            Err(_) => {
                warn!(
                    hook = name,
                    phase,
                    timeout_secs = self.hook_timeout.as_secs(),
                    "hook timed out, treating as failure (fail-open)"
                );
                entry.breaker.record_failure(name);
                None
            }
        }
    }

    /// Run `pre_tool_use` in order. Input edits of a successful hook are kept;
    /// the first non-`Allow` decision ends the chain.
    pub async fn pre_tool_use(&self, call: &mut ToolCall, ctx: &HookContext) -> HookDecision {
        for entry in self.snapshot() {
            if entry.breaker.is_open() {
                continue;
            }
            let mut candidate = call.clone();
            let decision = self
                .guarded(&entry, "pre_tool_use", entry.hooks.pre_tool_use(&mut candidate, ctx))
                .await;
            if let Some(decision) = decision {
                *call = candidate;
                if decision != HookDecision::Allow {
                    return decision;
                }
            }
        }
        HookDecision::Allow
    }

    /// Run every `post_tool_use`, each seeing the outcome left by the previous one.
    pub async fn post_tool_use(&self, call: &ToolCall, mut outcome: ToolOutcome, ctx: &HookContext) -> ToolOutcome {
        for entry in self.snapshot() {
            if entry.breaker.is_open() {
                continue;
            }
            let action = self
                .guarded(&entry, "post_tool_use", entry.hooks.post_tool_use(call, &outcome, ctx))
                .await
                .flatten();
            match action {
                Some(PostHookAction::Update(patch)) => outcome.apply(patch),
                Some(PostHookAction::Replace(replacement)) => outcome = replacement,
                None => {}
            }
        }
        outcome
    }

    pub async fn pre_model(&self, request: &mut ModelRequest, ctx: &HookContext) {
        for entry in self.snapshot() {
            if entry.breaker.is_open() {
                continue;
            }
            let mut candidate = request.clone();
            if self
                .guarded(&entry, "pre_model", entry.hooks.pre_model(&mut candidate, ctx))
                .await
                .is_some()
            {
                *request = candidate;
            }
        }
    }

    pub async fn post_model(&self, response: &ModelResponse, ctx: &HookContext) {
        for entry in self.snapshot() {
            if entry.breaker.is_open() {
                continue;
            }
            let _ = self
                .guarded(&entry, "post_model", entry.hooks.post_model(response, ctx))
                .await;
        }
    }
}

impl Default for HookPipeline {
    fn default() -> Self {
        Self::new()
    }
}
