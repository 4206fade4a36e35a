use crate::error::{MatchError, MatchResult};
use crate::types::*;
use serde::Serialize;
use std::collections::BTreeMap;

// ── Input windows ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowKind {
    CheckIn,
    Approval,
    BanOrder,
    Ban,
    Pick,
    ReadyCheck,
}

impl WindowKind {
    pub fn label(self) -> &'static str {
        match self {
            WindowKind::CheckIn => "Check-in",
            WindowKind::Approval => "Referee approval",
            WindowKind::BanOrder => "Ban order choice",
            WindowKind::Ban => "Ban selection",
            WindowKind::Pick => "Chart pick",
            WindowKind::ReadyCheck => "Ready check",
        }
    }

    fn single_step(self) -> bool {
        matches!(self, WindowKind::Approval | WindowKind::BanOrder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum Awaiting {
    Players(Vec<Slot>),
    Referee(String),
}

#[derive(Debug, Clone, Copy)]
pub struct WindowTimeouts {
    pub approval_ms: u64,
    pub draft_ms: u64,
}

impl WindowTimeouts {
    pub fn from_config(config: &AppConfig) -> Self {
        WindowTimeouts {
            approval_ms: config.approval_timeout_secs * 1000,
            draft_ms: config.draft_timeout_secs * 1000,
        }
    }

    fn for_kind(&self, kind: WindowKind) -> u64 {
        if kind.single_step() {
            self.approval_ms
        } else {
            self.draft_ms
        }
    }
}

/// "Awaiting input from X until T." A newer token supersedes older ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputWindow {
    pub token: u64,
    pub kind: WindowKind,
    pub awaiting: Awaiting,
    pub opened_at: u64,
    pub deadline: u64,
    pub stalled: bool,
}

impl InputWindow {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline
    }

    pub fn awaits_slot(&self, slot: Slot) -> bool {
        matches!(&self.awaiting, Awaiting::Players(slots) if slots.contains(&slot))
    }
}

/// The window a document calls for, if any. `durable` is false only while a
/// ranked check-in has not been approved yet.
pub fn window_for(doc: &MatchDoc, durable: bool) -> Option<(WindowKind, Awaiting)> {
    match doc.progress_level {
        ProgressLevel::CheckIn if !durable => {
            let open: Vec<Slot> = Slot::BOTH
                .into_iter()
                .filter(|slot| doc.player(*slot).external_id.is_none())
                .collect();
            if open.is_empty() {
                Some((WindowKind::Approval, Awaiting::Referee(doc.meta.initiator.clone())))
            } else {
                Some((WindowKind::CheckIn, Awaiting::Players(open)))
            }
        }
        ProgressLevel::CheckIn => {
            let chooser = doc.meta.coin_flip_winner.unwrap_or(Slot::One);
            Some((WindowKind::BanOrder, Awaiting::Players(vec![chooser])))
        }
        ProgressLevel::BanPhase => doc
            .ban_phase
            .current_banner
            .map(|slot| (WindowKind::Ban, Awaiting::Players(vec![slot]))),
        ProgressLevel::PickingPostResult => doc
            .current_picker_slot
            .map(|slot| (WindowKind::Pick, Awaiting::Players(vec![slot]))),
        ProgressLevel::Playing => {
            let unready: Vec<Slot> = Slot::BOTH
                .into_iter()
                .filter(|slot| !doc.player(*slot).ready)
                .collect();
            if unready.is_empty() {
                None
            } else {
                Some((WindowKind::ReadyCheck, Awaiting::Players(unready)))
            }
        }
        ProgressLevel::Finished => None,
    }
}

// ── Live sessions ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MatchSession {
    pub doc: MatchDoc,
    pub durable: bool,
    pub window: Option<InputWindow>,
    next_token: u64,
}

impl MatchSession {
    pub fn new(doc: MatchDoc, durable: bool) -> Self {
        MatchSession {
            doc,
            durable,
            window: None,
            next_token: 1,
        }
    }

    /// Close whatever window is open and open the one the current state calls for.
    pub fn refresh_window(&mut self, timeouts: &WindowTimeouts, now_ms: u64) -> Option<&InputWindow> {
        self.window = window_for(&self.doc, self.durable).map(|(kind, awaiting)| {
            let token = self.next_token;
            self.next_token += 1;
            InputWindow {
                token,
                kind,
                awaiting,
                opened_at: now_ms,
                deadline: now_ms + timeouts.for_kind(kind),
                stalled: false,
            }
        });
        self.window.as_ref()
    }

    /// Reject the action unless the open window is of `kind` and still live.
    pub fn guard(&self, kind: WindowKind, now_ms: u64) -> MatchResult<()> {
        match &self.window {
            Some(window) if window.kind == kind => {
                if window.stalled || window.is_expired(now_ms) {
                    Err(MatchError::Stalled(kind.label().to_string()))
                } else {
                    Ok(())
                }
            }
            _ => Err(MatchError::validation(format!("{} is not open right now.", kind.label()))),
        }
    }

    /// Mark the window stalled if its deadline has passed. Returns the window
    /// the first time it stalls.
    pub fn mark_stalled(&mut self, now_ms: u64) -> Option<InputWindow> {
        match self.window.as_mut() {
            Some(window) if !window.stalled && window.is_expired(now_ms) => {
                window.stalled = true;
                Some(window.clone())
            }
            _ => None,
        }
    }
}

// ── Registry ───────────────────────────────────────────────────────────

/// Concurrency slot. Ranked matches are exclusive per event; friendlies per
/// referee.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionKey {
    Ranked(u64),
    Friendly(String),
}

impl SessionKey {
    pub fn kind(&self) -> MatchKind {
        match self {
            SessionKey::Ranked(_) => MatchKind::Ranked,
            SessionKey::Friendly(_) => MatchKind::Friendly,
        }
    }
}

#[derive(Debug, Default)]
pub struct MatchRegistry {
    sessions: BTreeMap<SessionKey, MatchSession>,
}

impl MatchRegistry {
    pub fn acquire(&mut self, key: SessionKey, session: MatchSession) -> MatchResult<&mut MatchSession> {
        if self.sessions.contains_key(&key) {
            return Err(MatchError::conflict(match key {
                SessionKey::Ranked(_) => "A match is already in progress for this event!",
                SessionKey::Friendly(_) => "You already have an active friendly match!",
            }));
        }
        Ok(self.sessions.entry(key).or_insert(session))
    }

    pub fn get(&self, key: &SessionKey) -> Option<&MatchSession> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &SessionKey) -> Option<&mut MatchSession> {
        self.sessions.get_mut(key)
    }

    pub fn release(&mut self, key: &SessionKey) -> Option<MatchSession> {
        self.sessions.remove(key)
    }

    pub fn holds(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn holds_match(&self, match_id: u64) -> bool {
        self.sessions.values().any(|s| s.durable && s.doc.id == match_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionKey, &MatchSession)> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SessionKey, &mut MatchSession)> {
        self.sessions.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
