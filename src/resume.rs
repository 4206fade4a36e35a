use crate::draft;
use crate::error::{MatchError, MatchResult};
use crate::orchestrator::Orchestrator;
use crate::session::{MatchSession, SessionKey};
use crate::types::*;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

/// Where a resumed match re-attaches its interaction surface.
pub trait ChannelDirectory: Send + Sync {
    fn acquire(&self, channel_ref: &str) -> Result<(), String>;
}

/// Every non-empty channel reference is reachable. Used when the overlay and
/// HTTP API are the only surfaces.
pub struct OpenChannels;

impl ChannelDirectory for OpenChannels {
    fn acquire(&self, channel_ref: &str) -> Result<(), String> {
        if channel_ref.trim().is_empty() {
            Err("no channel recorded".to_string())
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeOutcome {
    pub match_id: u64,
    pub kind: MatchKind,
    pub resumed: bool,
    pub error: Option<String>,
}

impl ResumeOutcome {
    fn failed(doc: &MatchDoc, reason: String) -> Self {
        ResumeOutcome {
            match_id: doc.id,
            kind: doc.meta.kind,
            resumed: false,
            error: Some(reason),
        }
    }
}

/// Validate a stored document before it goes live again. The document is
/// returned as-is: re-persisting it must produce the same bytes.
pub fn restore_match(doc: MatchDoc) -> MatchResult<MatchDoc> {
    if doc.status != MatchStatus::InProgress {
        return Err(MatchError::Resume(format!("match {} is not in progress", doc.id)));
    }
    if doc.progress_level == ProgressLevel::Finished {
        return Err(MatchError::Resume(format!("match {} is finished but never completed", doc.id)));
    }
    draft::check_invariants(&doc).map_err(|e| MatchError::Resume(format!("match {}: {e}", doc.id)))?;
    Ok(doc)
}

impl Orchestrator {
    /// Re-attach every interrupted match. Failures are logged and the record
    /// is left `in_progress` for an operator; start-up continues regardless.
    pub fn resume_interrupted(&mut self, channels: &dyn ChannelDirectory, now_ms: u64) -> Vec<ResumeOutcome> {
        let mut outcomes = Vec::new();

        if let Some(event_id) = self.events.active().map(|event| event.id) {
            match self.store.list_in_progress(event_id) {
                Ok(docs) => {
                    let mut docs = docs.into_iter();
                    if let Some(newest) = docs.next() {
                        outcomes.push(self.resume_one(SessionKey::Ranked(event_id), newest, channels, now_ms));
                    }
                    for older in docs {
                        warn!("match {} is also in progress; leaving it for cleanup", older.id);
                        outcomes.push(ResumeOutcome::failed(&older, "a newer match was resumed".to_string()));
                    }
                }
                Err(e) => error!("failed to list in-progress matches for event {event_id}: {e}"),
            }
        }

        if let Some(friendlies) = self.events.friendlies_id() {
            match self.store.list_in_progress(friendlies) {
                Ok(docs) => {
                    for doc in docs {
                        let key = SessionKey::Friendly(doc.meta.initiator.clone());
                        if self.registry.holds(&key) {
                            warn!("friendly {} shares a referee with a newer friendly; leaving it for cleanup", doc.id);
                            outcomes.push(ResumeOutcome::failed(&doc, "the referee already has a live friendly".to_string()));
                            continue;
                        }
                        outcomes.push(self.resume_one(key, doc, channels, now_ms));
                    }
                }
                Err(e) => error!("failed to list in-progress friendlies: {e}"),
            }
        }

        outcomes
    }

    fn resume_one(
        &mut self,
        key: SessionKey,
        doc: MatchDoc,
        channels: &dyn ChannelDirectory,
        now_ms: u64,
    ) -> ResumeOutcome {
        let match_id = doc.id;
        let kind = doc.meta.kind;
        match self.try_resume(key, doc, channels, now_ms) {
            Ok(doc) => {
                info!("resumed {} match {match_id} at {:?}", kind.event_prefix(), doc.progress_level);
                ResumeOutcome {
                    match_id,
                    kind,
                    resumed: true,
                    error: None,
                }
            }
            Err(e) => {
                error!("could not resume match {match_id}; it stays in progress: {e}");
                ResumeOutcome {
                    match_id,
                    kind,
                    resumed: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn try_resume(
        &mut self,
        key: SessionKey,
        doc: MatchDoc,
        channels: &dyn ChannelDirectory,
        now_ms: u64,
    ) -> MatchResult<MatchDoc> {
        let mut doc = restore_match(doc)?;
        channels
            .acquire(&doc.meta.channel_ref)
            .map_err(|e| MatchError::Resume(format!("channel {}: {e}", doc.meta.channel_ref)))?;

        // A chart in flight restarts its ready check from scratch.
        if doc.current_chart.is_some() {
            for player in doc.players.iter_mut() {
                player.ready = false;
            }
        }
        let level = doc.progress_level;
        let message = format!("Match resumed at {level:?}");
        draft::push_feed(&mut doc, "resume", message, json!({ "progressLevel": level }), now_ms);
        self.store.save_match(&doc).map_err(MatchError::Persistence)?;

        let mut session = MatchSession::new(doc, true);
        let window = session.refresh_window(&self.timeouts, now_ms).map(|w| w.kind);
        let doc = self.registry.acquire(key.clone(), session)?.doc.clone();
        self.publisher
            .publish_match(key.kind(), "resumed", Some(&doc), json!({ "window": window }));
        Ok(doc)
    }
}
