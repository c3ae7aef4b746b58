//! Outbound messages waiting for the next turn boundary.

use std::future::Future;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use kestrel_core::messages::Message;

use crate::error::Result;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    #[default]
    User,
    /// Context for the model. Does not start a turn by itself.
    Reminder,
}

#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub kind: PendingKind,
    pub metadata: Option<Map<String, Value>>,
}

impl SendOptions {
    pub fn reminder() -> Self {
        Self {
            kind: PendingKind::Reminder,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Clone, Debug)]
pub struct PendingMessage {
    pub id: String,
    pub kind: PendingKind,
    pub message: Message,
}

pub fn wrap_reminder(text: &str) -> String {
    format!("<system-reminder>\n{text}\n</system-reminder>")
}

#[derive(Default)]
pub struct MessageQueue {
    pending: Mutex<Vec<PendingMessage>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a user-role message and return its `msg-` id.
    pub fn push(&self, text: &str, opts: &SendOptions) -> String {
        let id = format!("msg-{}", uuid::Uuid::now_v7());
        let body = match opts.kind {
            PendingKind::User => text.to_string(),
            PendingKind::Reminder => wrap_reminder(text),
        };
        let mut metadata = opts.metadata.clone().unwrap_or_default();
        let _ = metadata.insert("id".into(), Value::String(id.clone()));
        let message = Message::user_text(body).with_metadata(Value::Object(metadata));
        self.pending.lock().push(PendingMessage {
            id: id.clone(),
            kind: opts.kind,
            message,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_user_messages(&self) -> bool {
        self.pending.lock().iter().any(|p| p.kind == PendingKind::User)
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    /// Append every queued message to `history` and persist it. On failure the
    /// appended messages are removed from `history` again and stay queued.
    /// Returns the number of messages flushed.
    pub async fn flush<F, Fut>(&self, history: &Mutex<Vec<Message>>, persist: F) -> Result<usize>
    where
        F: FnOnce(Vec<Message>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let batch: Vec<Message> = self.pending.lock().iter().map(|p| p.message.clone()).collect();
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        let (base, snapshot) = {
            let mut history = history.lock();
            let base = history.len();
            history.extend(batch);
            (base, history.clone())
        };

        match persist(snapshot).await {
            Ok(()) => {
                // Messages pushed during the persist stay queued behind the batch.
                let _ = self.pending.lock().drain(..count);
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, count, "message flush failed, messages retained");
                history.lock().truncate(base);
                Err(e)
            }
        }
    }
}
