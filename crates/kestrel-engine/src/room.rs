//! Named group of pooled sessions that can message each other.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, warn};

use kestrel_core::ids::SessionId;

use crate::error::{EngineError, Result};
use crate::pool::SessionPool;

static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9_][A-Za-z0-9_.-]*)").unwrap());

pub struct Room {
    pool: Arc<SessionPool>,
    members: RwLock<BTreeMap<String, SessionId>>,
}

impl Room {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self {
            pool,
            members: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn join(&self, name: &str, session_id: SessionId) -> Result<()> {
        let mut members = self.members.write();
        if members.contains_key(name) {
            return Err(EngineError::MemberExists(name.to_string()));
        }
        let _ = members.insert(name.to_string(), session_id);
        Ok(())
    }

    pub fn leave(&self, name: &str) -> bool {
        self.members.write().remove(name).is_some()
    }

    /// `(name, session id)` pairs, ordered by name.
    pub fn members(&self) -> Vec<(String, SessionId)> {
        self.members
            .read()
            .iter()
            .map(|(name, id)| (name.clone(), id.clone()))
            .collect()
    }

    /// Deliver `text` to every mentioned member, or to everyone but the
    /// sender when nobody is mentioned. Returns the names reached.
    pub async fn say(&self, from: &str, text: &str) -> Result<Vec<String>> {
        let mentioned: BTreeSet<&str> = MENTION
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();

        let targets: Vec<(String, SessionId)> = {
            let members = self.members.read();
            if mentioned.is_empty() {
                members
                    .iter()
                    .filter(|(name, _)| name.as_str() != from)
                    .map(|(name, id)| (name.clone(), id.clone()))
                    .collect()
            } else {
                mentioned
                    .iter()
                    .filter_map(|name| match members.get(*name) {
                        Some(id) => Some((name.to_string(), id.clone())),
                        None => {
                            debug!(mention = %name, "mention of unknown member ignored");
                            None
                        }
                    })
                    .collect()
            }
        };

        let message = format!("[from:{from}] {text}");
        let mut delivered = Vec::with_capacity(targets.len());
        for (name, id) in targets {
            let Some(session) = self.pool.get(&id) else {
                warn!(member = %name, session_id = %id, "room member is not in the pool");
                continue;
            };
            let _ = session.send(&message).await?;
            delivered.push(name);
        }
        Ok(delivered)
    }
}
