//! The step loop: model call, tool gating, execution and commit.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::{FutureExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use kestrel_core::errors::{ErrorKind, ProviderError};
use kestrel_core::events::{AgentEvent, DecidedBy, Decision, DoneReason, PermissionResponder, SessionState};
use kestrel_core::hooks::{HookContext, HookDecision, ToolOutcome};
use kestrel_core::messages::{ContentBlock, Message, ToolCall};
use kestrel_core::provider::{ModelRequest, ModelResponse, StreamChunk};
use kestrel_core::tools::{ExecutionMode, Tool, ToolContext};
use kestrel_store::{ToolCallRecord, ToolCallState};

use super::capabilities::SessionHandle;
use super::{PendingPermission, SessionInner};
use crate::breakpoints::BreakpointState;
use crate::limiter::panic_message;
use crate::permissions::Verdict;

/// Where a driver starts.
pub(crate) enum Start {
    /// Call the model on the history as it stands.
    Model,
    /// Turn boundary: move queued messages into the history, then call the model.
    Turn,
    /// Run these unresolved calls before calling the model.
    Tools(Vec<ToolCall>),
}

enum Step {
    Tools(Vec<ToolCall>),
    Continue,
    Settled(DoneReason),
    /// The turn was interrupted; everything it produced is dropped.
    Stale,
}

enum Gate {
    Run(ToolCall, Arc<dyn Tool>),
    Done(ToolOutcome, ToolCallState),
    UserDenied(ToolOutcome),
}

struct Batch {
    results: Vec<ContentBlock>,
    denied: bool,
}

fn error_outcome(message: impl Into<String>) -> ToolOutcome {
    ToolOutcome {
        ok: false,
        content: json!({ "error": message.into() }),
        duration_ms: None,
    }
}

impl SessionInner {
    pub(super) fn spawn_driver(self: &Arc<Self>, generation: u64, turn: CancellationToken, start: Start) {
        let inner = Arc::clone(self);
        let _ = tokio::spawn(async move { inner.drive(generation, turn, start).await });
    }

    /// Change the visible state unless `generation` was superseded.
    pub(super) fn transition(&self, generation: u64, state: SessionState) -> bool {
        let mut rt = self.runtime.lock();
        if rt.generation != generation {
            return false;
        }
        if rt.state != state {
            rt.state = state;
            self.emit(AgentEvent::State { state });
        }
        true
    }

    #[instrument(skip_all, fields(session_id = %self.id, generation = generation))]
    async fn drive(self: Arc<Self>, generation: u64, turn: CancellationToken, start: Start) {
        if !self.transition(generation, SessionState::Busy) {
            return;
        }
        let mut next = start;
        loop {
            let step = match std::mem::replace(&mut next, Start::Model) {
                Start::Turn => match self.flush_queue().await {
                    Ok(_) => self.model_step(generation, &turn).await,
                    Err(e) => self.fail(generation, ErrorKind::StoreError, e.to_string(), None),
                },
                Start::Model => self.model_step(generation, &turn).await,
                Start::Tools(calls) => self.tool_step(generation, &turn, calls).await,
            };
            match step {
                Step::Tools(calls) => next = Start::Tools(calls),
                Step::Continue => {}
                Step::Stale => {
                    debug!("turn superseded, output dropped");
                    return;
                }
                Step::Settled(reason) => {
                    if !self.settle(generation, reason) {
                        return;
                    }
                    next = Start::Turn;
                }
            }
        }
    }

    /// Emit `done`. Returns true when queued user messages keep the loop going;
    /// otherwise the session goes back to READY.
    fn settle(&self, generation: u64, reason: DoneReason) -> bool {
        let mut rt = self.runtime.lock();
        if rt.generation != generation {
            return false;
        }
        self.emit(AgentEvent::Done {
            step: rt.step_count,
            reason,
        });
        if reason == DoneReason::Completed && self.queue.has_user_messages() {
            return true;
        }
        rt.running = false;
        self.breakpoints.reset(BreakpointState::Ready);
        if rt.state != SessionState::Ready {
            rt.state = SessionState::Ready;
            self.emit(AgentEvent::State {
                state: SessionState::Ready,
            });
        }
        false
    }

    fn fail(&self, generation: u64, kind: ErrorKind, message: String, hint: Option<String>) -> Step {
        if self.runtime.lock().generation != generation {
            return Step::Stale;
        }
        warn!(session_id = %self.id, ?kind, error = %message, "turn failed");
        self.emit(AgentEvent::Error { kind, message, hint });
        Step::Settled(DoneReason::Failed)
    }

    /// Messages queued mid-turn stay queued until `settle` opens the next turn.
    async fn model_step(&self, generation: u64, turn: &CancellationToken) -> Step {
        self.breakpoints.set(BreakpointState::PreModel, None);
        let ctx = self.hook_context();
        let mut request = ModelRequest {
            messages: self.messages.lock().clone(),
            options: self.complete_options(None, true),
        };
        self.hooks.pre_model(&mut request, &ctx).await;

        self.breakpoints.set(BreakpointState::StreamingModel, None);
        let response = tokio::select! {
            response = self.call_model(&request) => response,
            _ = turn.cancelled() => return Step::Stale,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let hint = Some(e.error_kind().to_string());
                return self.fail(generation, ErrorKind::ProviderError, e.to_string(), hint);
            }
        };
        self.hooks.post_model(&response, &ctx).await;

        let assistant = Message::assistant(response.content.clone());
        let calls = assistant.tool_calls();
        let committed = self.commit_if_current(generation, |rt, messages| {
            messages.push(assistant);
            if calls.is_empty() {
                rt.last_sfp_index = Some(messages.len() - 1);
            }
            (messages.len(), rt.last_sfp_index)
        });
        let Some((message_count, sfp)) = committed else {
            return Step::Stale;
        };
        self.records.lock().extend(calls.iter().map(ToolCallRecord::pending));

        for block in &response.content {
            if let ContentBlock::Text { text } = block {
                if !text.is_empty() {
                    self.emit(AgentEvent::Text { text: text.clone() });
                }
            }
        }
        if let Some(usage) = response.usage {
            self.emit(AgentEvent::Usage {
                data: usage.to_data(),
            });
        }

        if calls.is_empty() {
            self.emit(AgentEvent::Commit { sfp_index: sfp });
            if let Err(e) = self.persist().await {
                return self.fail(generation, ErrorKind::StoreError, e.to_string(), None);
            }
            self.emit(AgentEvent::MessagesUpdate {
                message_count,
                last_sfp_index: sfp,
                added: 1,
            });
            return Step::Settled(DoneReason::Completed);
        }

        // The tool-requesting turn must be durable before anything runs.
        if let Err(e) = self.persist().await {
            return self.fail(generation, ErrorKind::StoreError, e.to_string(), None);
        }
        self.breakpoints.set(BreakpointState::ToolPending, None);
        Step::Tools(calls)
    }

    async fn call_model(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        let mut chunks = self
            .deps
            .provider
            .stream(&request.messages, &request.options)
            .await?;
        while let Some(chunk) = chunks.next().await {
            match chunk? {
                StreamChunk::TextDelta { delta } => self.emit(AgentEvent::TextChunk { delta }),
                StreamChunk::Done { response } => return Ok(response),
            }
        }
        Err(ProviderError::StreamInterrupted(
            "stream ended without a response".into(),
        ))
    }

    async fn tool_step(&self, generation: u64, turn: &CancellationToken, calls: Vec<ToolCall>) -> Step {
        let Some(batch) = self.run_batch(generation, turn, &calls).await else {
            return Step::Stale;
        };
        let committed = self.commit_if_current(generation, |rt, messages| {
            messages.push(Message::tool_results(batch.results));
            rt.step_count += 1;
            rt.last_sfp_index = Some(messages.len() - 1);
            (rt.step_count, messages.len(), rt.last_sfp_index)
        });
        let Some((step_count, message_count, sfp)) = committed else {
            return Step::Stale;
        };
        self.after_step(step_count);
        self.emit(AgentEvent::Commit { sfp_index: sfp });
        if let Err(e) = self.persist().await {
            return self.fail(generation, ErrorKind::StoreError, e.to_string(), None);
        }
        self.emit(AgentEvent::MessagesUpdate {
            message_count,
            last_sfp_index: sfp,
            added: 1,
        });
        if batch.denied {
            Step::Settled(DoneReason::Denied)
        } else {
            Step::Continue
        }
    }

    /// Gate every call, then run the approved ones. `None` means the turn was
    /// interrupted.
    async fn run_batch(&self, generation: u64, turn: &CancellationToken, calls: &[ToolCall]) -> Option<Batch> {
        let ctx = self.hook_context();
        let mut slots: Vec<Option<ToolOutcome>> = calls.iter().map(|_| None).collect();
        let mut announced = vec![false; calls.len()];
        let mut approved = Vec::new();
        let mut denied_by_user = None;

        for (index, call) in calls.iter().enumerate() {
            self.emit(AgentEvent::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
            announced[index] = true;
            self.breakpoints.set(BreakpointState::PreTool, Some(&call.name));

            match self.gate(generation, turn, call, &ctx).await? {
                Gate::Run(call, tool) => approved.push((index, call, tool)),
                Gate::Done(outcome, state) => {
                    self.finish_call(call, &outcome, state);
                    slots[index] = Some(outcome);
                }
                Gate::UserDenied(outcome) => {
                    self.finish_call(call, &outcome, ToolCallState::Denied);
                    slots[index] = Some(outcome);
                    denied_by_user = Some(call.id.clone());
                    break;
                }
            }
        }

        if let Some(denied_id) = denied_by_user {
            for (index, call) in calls.iter().enumerate() {
                if slots[index].is_some() {
                    continue;
                }
                if !announced[index] {
                    self.emit(AgentEvent::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    });
                }
                let outcome = error_outcome(format!("Skipped: permission denied for {denied_id}"));
                self.finish_call(call, &outcome, ToolCallState::Denied);
                slots[index] = Some(outcome);
            }
            return Some(Batch {
                results: collect_results(calls, slots),
                denied: true,
            });
        }

        let (concurrent, sequential): (Vec<_>, Vec<_>) = approved
            .into_iter()
            .partition(|(_, _, tool)| tool.execution_mode() == ExecutionMode::Concurrent);

        let running: Vec<_> = concurrent
            .into_iter()
            .map(|(index, call, tool)| {
                let handle = self.spawn_execution(&call, tool, turn);
                (index, call, handle)
            })
            .collect();
        for (index, call, handle) in running {
            let outcome = self.await_execution(&call, handle, turn, &ctx).await?;
            self.finish_call(&call, &outcome, settled_state(&outcome));
            slots[index] = Some(outcome);
        }

        for (index, call, tool) in sequential {
            let handle = self.spawn_execution(&call, tool, turn);
            let outcome = self.await_execution(&call, handle, turn, &ctx).await?;
            self.finish_call(&call, &outcome, settled_state(&outcome));
            slots[index] = Some(outcome);
        }

        Some(Batch {
            results: collect_results(calls, slots),
            denied: false,
        })
    }

    /// Permissions, then `pre_tool_use` hooks, then the pause protocol.
    async fn gate(
        &self,
        generation: u64,
        turn: &CancellationToken,
        call: &ToolCall,
        ctx: &HookContext,
    ) -> Option<Gate> {
        let Some(tool) = self.registry.read().get(&call.name) else {
            return Some(Gate::Done(
                error_outcome(format!("Tool not found: {}", call.name)),
                ToolCallState::Failed,
            ));
        };

        let verdict = self
            .deps
            .modes
            .evaluate(&self.config.permissions, &call.name, &tool.metadata());
        if verdict == Verdict::Deny {
            debug!(session_id = %self.id, tool = %call.name, "denied by policy");
            return Some(Gate::Done(error_outcome("Denied by policy"), ToolCallState::Denied));
        }

        let mut call = call.clone();
        let meta = match self.hooks.pre_tool_use(&mut call, ctx).await {
            HookDecision::Allow if verdict == Verdict::Ask => {
                tool.permission_details(&call.input).unwrap_or_else(|| json!({}))
            }
            HookDecision::Allow => return Some(Gate::Run(call, tool)),
            HookDecision::Deny { reason, tool_result } => {
                let content = tool_result.unwrap_or_else(|| {
                    json!({ "error": reason.unwrap_or_else(|| "Denied by policy".into()) })
                });
                let outcome = ToolOutcome {
                    ok: false,
                    content,
                    duration_ms: None,
                };
                return Some(Gate::Done(outcome, ToolCallState::Denied));
            }
            HookDecision::Result { value } => {
                self.breakpoints.set(BreakpointState::PostTool, Some(&call.name));
                let outcome = ToolOutcome {
                    ok: true,
                    content: value,
                    duration_ms: None,
                };
                let outcome = self.hooks.post_tool_use(&call, outcome, ctx).await;
                return Some(Gate::Done(outcome, ToolCallState::Completed));
            }
            HookDecision::Ask { meta } => meta,
        };

        match self.await_permission(generation, turn, &call, meta).await? {
            (Decision::Allow, _) => Some(Gate::Run(call, tool)),
            (Decision::Deny, note) => Some(Gate::UserDenied(error_outcome(
                note.unwrap_or_else(|| "Denied by user".into()),
            ))),
        }
    }

    /// Pause until `decide`, the event's responder or an interrupt settles the call.
    async fn await_permission(
        &self,
        generation: u64,
        turn: &CancellationToken,
        call: &ToolCall,
        meta: Value,
    ) -> Option<(Decision, Option<String>)> {
        let (tx, rx) = oneshot::channel();
        {
            let rt = self.runtime.lock();
            if rt.generation != generation {
                return None;
            }
            let _ = self.permissions.insert(
                call.id.clone(),
                PendingPermission {
                    tool: call.name.clone(),
                    tx,
                },
            );
        }
        self.set_record_state(&call.id, ToolCallState::ApprovalRequired);
        self.persist_records().await;
        self.breakpoints.set(BreakpointState::AwaitingApproval, Some(&call.id));

        let session = self.self_ref.clone();
        let call_id = call.id.clone();
        let respond = PermissionResponder::new(move |decision, note| {
            let session = session.clone();
            let call_id = call_id.clone();
            async move {
                let session = session
                    .upgrade()
                    .ok_or_else(|| "session is no longer available".to_string())?;
                session
                    .resolve_permission(&call_id, decision, note, DecidedBy::Respond)
                    .map_err(|e| e.to_string())
            }
            .boxed()
        });
        self.emit(AgentEvent::PermissionAsk {
            id: call.id.clone(),
            tool: call.name.clone(),
            args: call.input.clone(),
            meta,
            respond: Some(respond),
        });
        if !self.transition(generation, SessionState::Paused) {
            return None;
        }
        debug!(session_id = %self.id, call_id = %call.id, tool = %call.name, "awaiting permission");

        let decision = tokio::select! {
            decision = rx => decision.ok(),
            _ = turn.cancelled() => None,
        }?;
        if !self.transition(generation, SessionState::Busy) {
            return None;
        }
        Some(decision)
    }

    /// Start one execution on its own task so an interrupt never preempts it.
    fn spawn_execution(
        &self,
        call: &ToolCall,
        tool: Arc<dyn Tool>,
        turn: &CancellationToken,
    ) -> JoinHandle<ToolOutcome> {
        self.set_record_state(&call.id, ToolCallState::Executing);
        self.breakpoints.set(BreakpointState::ToolExecuting, Some(&call.name));

        let runner = Arc::clone(&self.runner);
        let timeout = self.config.tool_timeout;
        let input = call.input.clone();
        let name = call.name.clone();
        let ctx = ToolContext::new(
            self.id.clone(),
            &call.id,
            Arc::clone(&self.deps.sandbox),
            turn.child_token(),
            Arc::new(SessionHandle::new(self.self_ref.clone())),
        );

        tokio::spawn(async move {
            let started = Instant::now();
            let run = runner
                .run(tokio::time::timeout(
                    timeout,
                    AssertUnwindSafe(tool.execute(input, &ctx)).catch_unwind(),
                ))
                .await;
            let duration_ms = Some(started.elapsed().as_millis() as u64);
            let (ok, content) = match run {
                Ok(Ok(Ok(Ok(value)))) => (true, value),
                Ok(Ok(Ok(Err(e)))) => (false, json!({ "error": e.to_string() })),
                Ok(Ok(Err(panic))) => {
                    error!(tool = %name, panic = %panic_message(&panic), "tool panicked");
                    (false, json!({ "error": "Internal error: tool crashed" }))
                }
                Ok(Err(_)) => {
                    warn!(tool = %name, timeout_secs = timeout.as_secs(), "tool timed out");
                    (
                        false,
                        json!({ "error": format!("Tool timed out after {}s", timeout.as_secs()) }),
                    )
                }
                Err(e) => (false, json!({ "error": e.to_string() })),
            };
            ToolOutcome {
                ok,
                content,
                duration_ms,
            }
        })
    }

    async fn await_execution(
        &self,
        call: &ToolCall,
        handle: JoinHandle<ToolOutcome>,
        turn: &CancellationToken,
        ctx: &HookContext,
    ) -> Option<ToolOutcome> {
        let joined = tokio::select! {
            joined = handle => joined,
            _ = turn.cancelled() => return None,
        };
        let outcome = joined.unwrap_or_else(|e| {
            error!(tool = %call.name, error = %e, "tool task failed");
            error_outcome("Internal error: tool crashed")
        });
        self.breakpoints.set(BreakpointState::PostTool, Some(&call.name));
        Some(self.hooks.post_tool_use(call, outcome, ctx).await)
    }

    fn set_record_state(&self, call_id: &str, state: ToolCallState) {
        let mut records = self.records.lock();
        if let Some(record) = records.iter_mut().rev().find(|r| r.id == call_id) {
            record.state = state;
            if state == ToolCallState::Executing {
                record.started_at = Some(chrono::Utc::now());
            }
        }
    }

    /// Close the call's record and emit its `tool_result`.
    fn finish_call(&self, call: &ToolCall, outcome: &ToolOutcome, state: ToolCallState) {
        {
            let mut records = self.records.lock();
            let index = match records.iter().rposition(|r| r.id == call.id) {
                Some(index) => index,
                None => {
                    records.push(ToolCallRecord::pending(call));
                    records.len() - 1
                }
            };
            records[index].finish(state, outcome.content.clone(), !outcome.ok);
        }
        self.emit(AgentEvent::ToolResult {
            id: call.id.clone(),
            name: call.name.clone(),
            ok: outcome.ok,
            content: outcome.content.clone(),
            duration_ms: outcome.duration_ms,
        });
    }
}

fn settled_state(outcome: &ToolOutcome) -> ToolCallState {
    if outcome.ok {
        ToolCallState::Completed
    } else {
        ToolCallState::Failed
    }
}

fn collect_results(calls: &[ToolCall], slots: Vec<Option<ToolOutcome>>) -> Vec<ContentBlock> {
    calls
        .iter()
        .zip(slots)
        .map(|(call, slot)| {
            let outcome = slot.unwrap_or_else(|| error_outcome("Tool produced no result"));
            ContentBlock::tool_result(&call.id, outcome.content, !outcome.ok)
        })
        .collect()
}
