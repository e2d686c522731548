// Reconciliation of local (optimistic/queued) messages with a server batch
//
// Matching: shared id/serverId, otherwise same text with timestamps inside
// the tolerance window. The text+time pairing is a heuristic for messages
// sent right before a reconnect and can pair the wrong twin when the same
// text is sent twice within the window.

use chrono::Duration;
use log::debug;
use std::collections::HashSet;

use crate::models::{sort_newest_first, Message, MessageStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKind {
    Identity,
    TextAndTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Server,
    Local,
}

/// One local/server pairing, kept for observability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileMatch {
    pub local_id: String,
    pub server_id: String,
    pub kind: MatchKind,
    pub winner: Winner,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// Merged set, newest first
    pub messages: Vec<Message>,
    pub matches: Vec<ReconcileMatch>,
    /// Ids of local messages retained because they have not reached the server
    pub retained: Vec<String>,
    /// Ids of confirmed local messages the server no longer reports
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    tolerance: Duration,
}

impl Default for Reconciler {
    fn default() -> Self {
        Reconciler::new(Duration::seconds(5))
    }
}

impl Reconciler {
    pub fn new(tolerance: Duration) -> Self {
        Reconciler { tolerance }
    }

    pub fn from_millis(tolerance_ms: i64) -> Self {
        Reconciler::new(Duration::milliseconds(tolerance_ms))
    }

    fn within_window(&self, local: &Message, server: &Message) -> bool {
        let delta = local.created_at - server.created_at;
        delta.num_milliseconds().abs() <= self.tolerance.num_milliseconds()
    }

    /// Merge `local` with the server-confirmed `server` batch
    pub fn reconcile(&self, local: &[Message], server: &[Message]) -> ReconcileOutcome {
        let mut used_local: HashSet<usize> = HashSet::new();
        let mut merged: Vec<Message> = Vec::with_capacity(server.len() + local.len());
        let mut matches = Vec::new();

        // Server batch may itself contain duplicates
        let mut seen_server: HashSet<&str> = HashSet::new();

        for server_msg in server {
            if !seen_server.insert(server_msg.id.as_str()) {
                continue;
            }
            let server_key = server_msg.server_id.as_deref().unwrap_or(&server_msg.id);

            let identity = local.iter().enumerate().find(|(idx, l)| {
                !used_local.contains(idx) && (l.matches_id(server_key) || l.matches_id(&server_msg.id))
            });
            let found = identity.map(|(idx, l)| (idx, l, MatchKind::Identity)).or_else(|| {
                local
                    .iter()
                    .enumerate()
                    .find(|(idx, l)| {
                        !used_local.contains(idx)
                            && l.server_id.is_none()
                            && l.text == server_msg.text
                            && self.within_window(l, server_msg)
                    })
                    .map(|(idx, l)| (idx, l, MatchKind::TextAndTime))
            });

            match found {
                Some((idx, local_msg, kind)) => {
                    used_local.insert(idx);
                    let (message, winner) = resolve(local_msg, server_msg, server_key);
                    debug!(
                        "Reconciled local {} with server {} ({:?}, {:?} wins)",
                        local_msg.id, server_key, kind, winner
                    );
                    matches.push(ReconcileMatch {
                        local_id: local_msg.id.clone(),
                        server_id: server_key.to_string(),
                        kind,
                        winner,
                    });
                    merged.push(message);
                }
                None => {
                    let mut message = server_msg.clone();
                    message.server_id = Some(server_key.to_string());
                    merged.push(message);
                }
            }
        }

        let mut retained = Vec::new();
        let mut dropped = Vec::new();
        for (idx, local_msg) in local.iter().enumerate() {
            if used_local.contains(&idx) {
                continue;
            }
            let unconfirmed = local_msg.server_id.is_none()
                && matches!(local_msg.status, MessageStatus::Sending | MessageStatus::Failed);
            if unconfirmed {
                retained.push(local_msg.id.clone());
                merged.push(local_msg.clone());
            } else {
                dropped.push(local_msg.id.clone());
            }
        }

        sort_newest_first(&mut merged);
        if !dropped.is_empty() {
            debug!("Dropped {} stale local messages during reconcile", dropped.len());
        }

        ReconcileOutcome {
            messages: merged,
            matches,
            retained,
            dropped,
        }
    }
}

/// Conflict rules: server wins if local lacks a server id; else newer
/// timestamp wins; tie goes to the server. The result always carries the
/// server identity and the higher-ranked status of the pair.
fn resolve(local: &Message, server: &Message, server_key: &str) -> (Message, Winner) {
    let winner = if local.server_id.is_none() {
        Winner::Server
    } else if local.created_at > server.created_at {
        Winner::Local
    } else {
        Winner::Server
    };

    let mut message = match winner {
        Winner::Server => server.clone(),
        Winner::Local => local.clone(),
    };
    message.id = server_key.to_string();
    message.server_id = Some(server_key.to_string());
    message.error_message = None;
    message.archived = local.archived || server.archived;
    message.status = if local.status.rank() > server.status.rank() {
        local.status
    } else {
        server.status
    };
    (message, winner)
}
