//! Interrupt and resume.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use kestrel_core::errors::ErrorKind;
use kestrel_core::events::{AgentEvent, DoneReason, ResumeFrom, SealedCall, SessionState};
use kestrel_core::ids::SessionId;
use kestrel_core::messages::{pending_tool_calls, ContentBlock, Message, Role, ToolCall};
use kestrel_store::{RecoveryRecord, SessionMeta, ToolCallRecord, ToolCallState};

use super::turn::Start;
use super::{Seed, Session, SessionConfig, SessionDeps, SessionInner};
use crate::breakpoints::BreakpointState;
use crate::error::{EngineError, Result};

pub const SEALED_NOTE: &str = "Sealed due to crash: No result found, likely crashed during execution";
const INTERRUPTED_NOTE: &str = "Interrupted by user";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStrategy {
    /// Seal every tool call that never got a result.
    #[default]
    Crash,
    /// Leave the history as it is.
    Manual,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ResumeOptions {
    pub strategy: ResumeStrategy,
    /// Restart the loop if the conversation is not at rest.
    pub auto_run: bool,
}

impl ResumeOptions {
    pub fn crash() -> Self {
        Self::default()
    }

    pub fn manual() -> Self {
        Self {
            strategy: ResumeStrategy::Manual,
            auto_run: false,
        }
    }

    pub fn with_auto_run(mut self, auto_run: bool) -> Self {
        self.auto_run = auto_run;
        self
    }
}

/// Close `call`'s record as `state`, creating it if the call was never tracked.
fn close_record(records: &mut Vec<ToolCallRecord>, call: &ToolCall, state: ToolCallState, content: &serde_json::Value) {
    let index = match records.iter().rposition(|r| r.id == call.id) {
        Some(index) => index,
        None => {
            records.push(ToolCallRecord::pending(call));
            records.len() - 1
        }
    };
    records[index].finish(state, content.clone(), true);
}

impl SessionInner {
    /// Append a sealed result for every tool call that has none.
    async fn seal_crashed(&self) -> Result<Vec<SealedCall>> {
        let content = json!({ "error": SEALED_NOTE, "sealed": true });
        let sealed = {
            let mut rt = self.runtime.lock();
            let mut messages = self.messages.lock();
            let pending = pending_tool_calls(&messages);
            if !pending.is_empty() {
                let results = pending
                    .iter()
                    .map(|call| ContentBlock::tool_result(&call.id, content.clone(), true))
                    .collect();
                messages.push(Message::tool_results(results));
                rt.step_count += 1;
                rt.last_sfp_index = Some(messages.len() - 1);
            }
            pending
        };
        if sealed.is_empty() {
            return Ok(Vec::new());
        }

        {
            let mut records = self.records.lock();
            for call in &sealed {
                close_record(&mut records, call, ToolCallState::Sealed, &content);
            }
        }
        let step_count = self.runtime.lock().step_count;
        self.after_step(step_count);
        self.persist().await?;

        let sealed: Vec<SealedCall> = sealed
            .into_iter()
            .map(|call| SealedCall {
                tool_use_id: call.id,
                name: call.name,
                args: call.input,
                note: SEALED_NOTE.to_string(),
            })
            .collect();
        let message_count = self.messages.lock().len();
        self.deps
            .store
            .save_recovery(&self.id, &RecoveryRecord::new(sealed.clone(), message_count))
            .await?;
        warn!(session_id = %self.id, count = sealed.len(), "sealed tool calls left open by a crash");
        Ok(sealed)
    }
}

impl Session {
    /// Reopen a stored session.
    #[instrument(skip(config, deps, opts), fields(session_id = %id, strategy = ?opts.strategy))]
    pub async fn resume(
        id: SessionId,
        config: SessionConfig,
        deps: SessionDeps,
        opts: ResumeOptions,
    ) -> Result<Session> {
        let messages = deps.store.load_messages(&id).await?;
        if messages.is_empty() {
            return Err(EngineError::EmptySession(id.to_string()));
        }
        let meta = match deps.store.load_meta(&id).await? {
            Some(meta) => meta,
            None => {
                let mut meta = SessionMeta::new(id.clone());
                meta.template_id = config.template_id.clone();
                meta
            }
        };
        let records = deps.store.load_tool_calls(&id).await?;

        let seed = Seed {
            meta,
            messages,
            records,
            registry: None,
            hooks: None,
        };
        let inner = SessionInner::build(id, config, deps, seed)?;
        inner.open().await?;

        let (from, sealed) = match opts.strategy {
            ResumeStrategy::Crash => (ResumeFrom::Crash, inner.seal_crashed().await?),
            ResumeStrategy::Manual => (ResumeFrom::Manual, Vec::new()),
        };
        inner.emit(AgentEvent::Resume { from, sealed });
        inner.emit(AgentEvent::State {
            state: SessionState::Ready,
        });
        inner.todos.handle_startup();
        info!(messages = inner.messages.lock().len(), "session resumed");

        let session = Session { inner };
        if opts.auto_run {
            session.auto_run();
        }
        Ok(session)
    }

    /// Run unresolved calls of the last assistant turn, or answer a trailing user turn.
    fn auto_run(&self) {
        let inner = &self.inner;
        let start = {
            let messages = inner.messages.lock();
            match messages.last() {
                Some(last) if last.role == Role::Assistant && last.has_tool_use() => {
                    Some(Start::Tools(last.tool_calls()))
                }
                Some(last) if last.role == Role::User => Some(Start::Model),
                _ => None,
            }
        };
        let Some(start) = start else {
            return;
        };
        let claim = {
            let mut rt = inner.runtime.lock();
            (!rt.running).then(|| rt.claim())
        };
        if let Some((generation, turn)) = claim {
            inner.spawn_driver(generation, turn, start);
        }
    }

    /// Stop the in-flight turn and bring the session back to READY.
    ///
    /// Tool calls of the last assistant turn that have no result get a
    /// synthetic error result, so the history stays well formed. Running tool
    /// tasks are not preempted; their output is dropped.
    #[instrument(skip(self), fields(session_id = %self.inner.id))]
    pub async fn interrupt(&self, note: Option<&str>) -> Result<()> {
        let inner = &self.inner;
        let note = note.filter(|n| !n.is_empty()).map(str::to_string);
        let text = note.clone().unwrap_or_else(|| INTERRUPTED_NOTE.to_string());
        let content = json!({ "error": text });

        let (calls, step_count, message_count, sfp) = {
            let mut rt = inner.runtime.lock();
            rt.generation += 1;
            rt.turn.cancel();
            rt.running = false;
            rt.state = SessionState::Ready;
            inner.permissions.clear();

            let mut messages = inner.messages.lock();
            let calls = match messages.last() {
                Some(last) if last.role == Role::Assistant => last.tool_calls(),
                _ => Vec::new(),
            };
            if !calls.is_empty() {
                let results = calls
                    .iter()
                    .map(|call| ContentBlock::tool_result(&call.id, content.clone(), true))
                    .collect();
                messages.push(Message::tool_results(results));
                rt.step_count += 1;
                rt.last_sfp_index = Some(messages.len() - 1);
            }
            (calls, rt.step_count, messages.len(), rt.last_sfp_index)
        };
        inner.runner.clear();
        inner.breakpoints.reset(BreakpointState::Ready);

        if !calls.is_empty() {
            {
                let mut records = inner.records.lock();
                for call in &calls {
                    close_record(&mut records, call, ToolCallState::Failed, &content);
                }
            }
            for call in &calls {
                inner.emit(AgentEvent::ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    ok: false,
                    content: content.clone(),
                    duration_ms: None,
                });
            }
            inner.after_step(step_count);
        }

        let persisted = inner.persist().await;
        inner.emit(AgentEvent::MessagesUpdate {
            message_count,
            last_sfp_index: sfp,
            added: usize::from(!calls.is_empty()),
        });
        inner.emit(AgentEvent::Commit { sfp_index: sfp });
        if let Some(note) = &note {
            inner.emit(AgentEvent::Error {
                kind: ErrorKind::PolicyViolation,
                message: format!("Interrupted: {note}"),
                hint: None,
            });
        }
        inner.emit(AgentEvent::Done {
            step: step_count,
            reason: DoneReason::Interrupted,
        });
        inner.emit(AgentEvent::State {
            state: SessionState::Ready,
        });
        info!(synthesized = calls.len(), "session interrupted");
        persisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;

    use kestrel_core::events::{Channel, Decision};
    use kestrel_core::messages::find_last_sfp;
    use kestrel_core::tools::ExecutionMode;
    use kestrel_llm::mock::MockResponse;
    use kestrel_store::Store;

    use crate::bus::SubscribeOptions;
    use crate::permissions::PermissionConfig;
    use crate::testing::{collect_until, kinds, wait_idle, wait_paused, CountingTool, Fixture, SlowTool};

    fn config() -> SessionConfig {
        SessionConfig::default().without_builtin_tools()
    }

    fn tool_turn(calls: &[(&str, &str)]) -> Message {
        Message::assistant(
            calls
                .iter()
                .map(|(id, name)| ContentBlock::tool_use(*id, *name, json!({})))
                .collect(),
        )
    }

    /// History of a session that died while tools were running.
    async fn crashed(fx: &Fixture, id: &SessionId) {
        let messages = vec![
            Message::user_text("do things"),
            tool_turn(&[("t1", "echo"), ("t2", "echo")]),
        ];
        fx.store.save_messages(id, &messages).await.unwrap();
    }

    #[tokio::test]
    async fn crash_resume_seals_every_open_call() {
        let fx = Fixture::new(vec![]);
        let id = SessionId::new();
        crashed(&fx, &id).await;

        let session = Session::resume(id.clone(), config(), fx.deps(), ResumeOptions::crash())
            .await
            .unwrap();
        let messages = session.messages();
        assert_eq!(messages.len(), 3);
        assert!(pending_tool_calls(&messages).is_empty());
        let sealed_turn = &messages[2];
        assert_eq!(sealed_turn.role, Role::User);
        for block in &sealed_turn.content {
            let ContentBlock::ToolResult { content, is_error, .. } = block else {
                panic!("expected tool_result, got {block:?}");
            };
            assert!(is_error);
            assert_eq!(content["error"], SEALED_NOTE);
            assert_eq!(content["sealed"], true);
        }

        let status = session.status();
        assert_eq!(status.step_count, 2);
        assert_eq!(status.last_sfp_index, Some(2));

        let events = session.history(None, None);
        let resume = events
            .iter()
            .find_map(|e| match &e.event {
                AgentEvent::Resume { from, sealed } => Some((*from, sealed.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(resume.0, ResumeFrom::Crash);
        assert_eq!(
            resume.1.iter().map(|s| s.tool_use_id.as_str()).collect::<Vec<_>>(),
            vec!["t1", "t2"]
        );

        let recoveries = fx.store.list_recoveries(&id).await.unwrap();
        assert_eq!(recoveries.len(), 1);
        assert_eq!(recoveries[0].sealed.len(), 2);
        let stored = fx.store.load_messages(&id).await.unwrap();
        assert_eq!(stored, messages);
        let records = fx.store.load_tool_calls(&id).await.unwrap();
        assert!(records.iter().all(|r| r.state == ToolCallState::Sealed));
    }

    #[tokio::test]
    async fn crash_resume_of_clean_history_changes_nothing() {
        let fx = Fixture::new(vec![]);
        let id = SessionId::new();
        let messages = vec![Message::user_text("hi"), Message::assistant(vec![ContentBlock::text("hello")])];
        fx.store.save_messages(&id, &messages).await.unwrap();

        let session = Session::resume(id.clone(), config(), fx.deps(), ResumeOptions::crash())
            .await
            .unwrap();
        assert_eq!(session.messages(), messages);
        assert_eq!(session.status().last_sfp_index, find_last_sfp(&messages));
        assert!(fx.store.list_recoveries(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resume_of_empty_session_fails() {
        let fx = Fixture::new(vec![]);
        let err = Session::resume(SessionId::new(), config(), fx.deps(), ResumeOptions::crash())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptySession(_)));
        assert!(err.to_string().contains("session has no messages"));
    }

    #[tokio::test]
    async fn manual_resume_with_auto_run_executes_open_calls() {
        let fx = Fixture::new(vec![MockResponse::text("all done")]);
        let id = SessionId::new();
        crashed(&fx, &id).await;
        let counter = Arc::new(CountingTool::new("echo"));

        let session = Session::resume(
            id,
            config().with_tool(counter.clone()),
            fx.deps(),
            ResumeOptions::manual().with_auto_run(true),
        )
        .await
        .unwrap();
        wait_idle(&session).await;

        assert_eq!(counter.count(), 2);
        let messages = session.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3].text(), "all done");
        let resume = session
            .history(None, None)
            .into_iter()
            .find(|e| e.event.kind() == "resume")
            .unwrap();
        assert!(matches!(
            resume.event,
            AgentEvent::Resume { from: ResumeFrom::Manual, ref sealed } if sealed.is_empty()
        ));
    }

    #[tokio::test]
    async fn crash_resume_with_auto_run_answers_sealed_turn() {
        let fx = Fixture::new(vec![MockResponse::text("recovered")]);
        let id = SessionId::new();
        crashed(&fx, &id).await;

        let session = Session::resume(id, config(), fx.deps(), ResumeOptions::crash().with_auto_run(true))
            .await
            .unwrap();
        wait_idle(&session).await;
        assert_eq!(fx.provider.call_count(), 1);
        assert_eq!(session.messages().last().unwrap().text(), "recovered");
    }

    #[tokio::test]
    async fn resume_continues_cursor_numbering() {
        let fx = Fixture::new(vec![MockResponse::text("one")]);
        let session = Session::create(config(), fx.deps()).await.unwrap();
        let _ = session.send("hi").await.unwrap();
        wait_idle(&session).await;
        let last = session.status().cursor;
        session.dispose().await;

        let resumed = Session::resume(session.id().clone(), config(), fx.deps(), ResumeOptions::manual())
            .await
            .unwrap();
        let first = resumed.history(None, None)[0].cursor;
        assert!(first > last, "{first} <= {last}");
    }

    #[tokio::test]
    async fn interrupt_while_tools_run_synthesizes_results() {
        let fx = Fixture::new(vec![MockResponse::tool_uses(vec![
            ("t1", "slow", json!({"ms": 500})),
            ("t2", "slow", json!({"ms": 500})),
        ])]);
        let slow = Arc::new(SlowTool::new(ExecutionMode::Concurrent));
        let session = Session::create(config().with_tool(slow.clone()), fx.deps())
            .await
            .unwrap();
        let events = session.subscribe(&[], SubscribeOptions::default());
        let _ = session.send("go").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while slow.active.load(std::sync::atomic::Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        session.interrupt(Some("stop now")).await.unwrap();

        let seen = collect_until(events, |e| matches!(e, AgentEvent::Done { .. })).await;
        let results: Vec<_> = seen
            .iter()
            .filter_map(|e| match &e.event {
                AgentEvent::ToolResult { id, ok, content, .. } => Some((id.clone(), *ok, content.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, ok, c)| !ok && c["error"] == "stop now"));
        assert!(seen.iter().any(|e| matches!(
            &e.event,
            AgentEvent::Error { kind: ErrorKind::PolicyViolation, message, .. } if message == "Interrupted: stop now"
        )));
        assert!(matches!(
            seen.last().unwrap().event,
            AgentEvent::Done { reason: DoneReason::Interrupted, step: 2 }
        ));

        let status = session.status();
        assert_eq!(status.state, SessionState::Ready);
        assert!(!status.running);
        assert_eq!(status.message_count, 3);
        assert!(pending_tool_calls(&session.messages()).is_empty());

        // Late tool output is dropped.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(session.messages().len(), 3);
        assert_eq!(fx.provider.call_count(), 1);
    }

    #[tokio::test]
    async fn interrupt_releases_paused_permission() {
        let fx = Fixture::new(vec![MockResponse::tool_use("t1", "write", json!({}))]);
        let counter = Arc::new(CountingTool::new("write"));
        let session = Session::create(
            config()
                .with_tool(counter.clone())
                .with_permissions(PermissionConfig::default().with_require_approval_tools(&["write"])),
            fx.deps(),
        )
        .await
        .unwrap();
        let _ = session.send("write it").await.unwrap();
        wait_paused(&session).await;
        assert_eq!(session.status().pending_permissions, vec!["t1"]);

        session.interrupt(None).await.unwrap();
        let status = session.status();
        assert_eq!(status.state, SessionState::Ready);
        assert!(status.pending_permissions.is_empty());
        assert!(matches!(
            session.decide("t1", Decision::Allow, None),
            Err(EngineError::PermissionNotFound(_))
        ));
        assert_eq!(counter.count(), 0);

        let last = session.messages().pop().unwrap();
        let ContentBlock::ToolResult { content, .. } = &last.content[0] else {
            panic!("expected tool_result");
        };
        assert_eq!(content["error"], INTERRUPTED_NOTE);
        // No note, no policy error.
        let errors: Vec<_> = session
            .history(None, None)
            .into_iter()
            .filter(|e| e.event.kind() == "error")
            .collect();
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn interrupt_when_idle_only_resets_state() {
        let fx = Fixture::new(vec![]);
        let session = Session::create(config(), fx.deps()).await.unwrap();
        let before = session.status().cursor;
        session.interrupt(None).await.unwrap();

        let events = session.history(Some(before), None);
        assert_eq!(kinds(&events), vec!["messages_update", "commit", "done", "state"]);
        assert_eq!(session.status().step_count, 0);
    }

    #[tokio::test]
    async fn interrupt_persistence_failure_is_reported() {
        let fx = Fixture::new(vec![MockResponse::tool_use("t1", "write", json!({}))]);
        let session = Session::create(
            config()
                .with_tool(Arc::new(CountingTool::new("write")))
                .with_permissions(PermissionConfig::default().with_require_approval_tools(&["write"])),
            fx.deps(),
        )
        .await
        .unwrap();
        let _ = session.send("go").await.unwrap();
        wait_paused(&session).await;

        fx.store.fail_messages.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(session.interrupt(None).await.is_err());
        assert_eq!(session.status().state, SessionState::Ready);

        let ready = session
            .subscribe(&[Channel::Control], SubscribeOptions::since(0).with_kinds(&["state"]))
            .filter(|e| futures::future::ready(matches!(e.event, AgentEvent::State { state: SessionState::Ready })))
            .next()
            .await;
        assert!(ready.is_some());
    }
}
