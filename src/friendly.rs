use crate::draft::{self, ResultInput};
use crate::error::{MatchError, MatchResult};
use crate::orchestrator::{draft_outbound, validate_player_names, Orchestrator, Outbound};
use crate::session::{InputWindow, MatchSession, SessionKey, WindowKind};
use crate::types::*;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendlyStart {
    pub referee_id: String,
    pub channel_ref: String,
    pub player_names: [String; 2],
    pub best_of: u8,
    #[serde(default)]
    pub has_bans: bool,
    pub charts: Vec<ChartRef>,
}

fn friendly_key(referee_id: &str) -> MatchResult<SessionKey> {
    let referee_id = referee_id.trim();
    if referee_id.is_empty() {
        return Err(MatchError::validation("A referee id is required."));
    }
    Ok(SessionKey::Friendly(referee_id.to_string()))
}

/// Friendly pools are sized by format: one chart per game plus one ban each.
pub fn friendly_pool_size(best_of: u8, has_bans: bool) -> usize {
    let bans = if has_bans { FRIENDLY_BANS_PER_PLAYER * 2 } else { 0 };
    best_of as usize + bans
}

/// Who opens the draft when there is no coin flip.
fn opening_slot(policy: FirstPickPolicy, first_banner: Slot, has_bans: bool) -> Slot {
    if has_bans {
        return first_banner;
    }
    match policy {
        FirstPickPolicy::SecondBanner => first_banner.other(),
        FirstPickPolicy::FirstBanner => first_banner,
        FirstPickPolicy::CoinFlipWinner | FirstPickPolicy::Player1 => Slot::One,
    }
}

impl Orchestrator {
    pub fn start_friendly(&mut self, req: FriendlyStart, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = friendly_key(&req.referee_id)?;
        if self.registry.holds(&key) {
            return Err(MatchError::conflict("You already have an active friendly match!"));
        }
        let names = validate_player_names(&req.player_names)?;
        draft::validate_format(req.best_of, req.charts.len())?;
        let expected = friendly_pool_size(req.best_of, req.has_bans);
        if req.charts.len() != expected {
            return Err(MatchError::validation(format!(
                "A best-of-{}{} friendly needs exactly {expected} charts; got {}.",
                req.best_of,
                if req.has_bans { " with bans" } else { "" },
                req.charts.len()
            )));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = req.charts.iter().find(|c| !seen.insert(c.csv_name.as_str())) {
            return Err(MatchError::validation(format!("\"{}\" is in the pool twice.", dup.csv_name)));
        }

        let event_id = self.events.friendlies(self.store.as_mut(), now_ms)?;
        let played = self.store.list_matches(event_id).map_err(MatchError::Persistence)?.len();
        let id = self.store.next_match_id().map_err(MatchError::Persistence)?;
        let referee_id = req.referee_id.trim().to_string();
        let meta = MatchMeta {
            kind: MatchKind::Friendly,
            event_id,
            bracket: None,
            round: "Friendly".to_string(),
            match_number: played as u32 + 1,
            best_of: req.best_of,
            wins_needed: draft::wins_needed(req.best_of),
            tier: None,
            has_bans: req.has_bans,
            first_pick: self.config.friendly_first_pick,
            coin_flip_winner: None,
            channel_ref: req.channel_ref.trim().to_string(),
            initiator: referee_id.clone(),
            started_at: now_ms,
            completed_at: None,
            restarted_from: None,
        };
        let charts: Vec<ChartRef> = req
            .charts
            .iter()
            .enumerate()
            .map(|(index, chart)| ChartRef { index, ..chart.clone() })
            .collect();
        let mut doc = draft::build_match(id, meta, names, &charts);
        let message = format!("Friendly started by {referee_id}");
        draft::push_feed(&mut doc, "friendlyStarted", message, Value::Null, now_ms);

        let first = opening_slot(self.config.friendly_first_pick, self.config.friendly_first_banner, req.has_bans);
        let mut outbound: Vec<Outbound> = vec![("start", json!({ "firstChoice": first }))];
        outbound.extend(draft_outbound(draft::begin_draft(&mut doc, first, now_ms)?));

        self.store.save_match(&doc).map_err(MatchError::Persistence)?;
        let mut session = MatchSession::new(doc, true);
        session.refresh_window(&self.timeouts, now_ms);
        let doc = self.registry.acquire(key, session)?.doc.clone();
        info!("friendly match {} started by {referee_id}", doc.id);
        self.announce(MatchKind::Friendly, &doc, outbound);
        Ok(doc)
    }

    pub fn friendly_ban(&mut self, referee_id: &str, slot: Slot, chart: &str, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = friendly_key(referee_id)?;
        self.apply_to_session(&key, Some(WindowKind::Ban), now_ms, |session| {
            Ok(draft_outbound(draft::apply_ban(&mut session.doc, slot, chart.trim(), now_ms)?))
        })
    }

    pub fn friendly_pick(&mut self, referee_id: &str, slot: Slot, chart: &str, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = friendly_key(referee_id)?;
        self.apply_to_session(&key, Some(WindowKind::Pick), now_ms, |session| {
            Ok(draft_outbound(draft::apply_pick(&mut session.doc, slot, chart.trim(), now_ms)?))
        })
    }

    pub fn friendly_ready(&mut self, referee_id: &str, slot: Slot, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = friendly_key(referee_id)?;
        self.apply_to_session(&key, Some(WindowKind::ReadyCheck), now_ms, |session| {
            Ok(draft_outbound(draft::apply_ready(&mut session.doc, slot, now_ms)?))
        })
    }

    pub fn friendly_result(&mut self, referee_id: &str, input: &ResultInput, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = friendly_key(referee_id)?;
        self.apply_to_session(&key, None, now_ms, |session| {
            Ok(draft_outbound(draft::apply_result(&mut session.doc, input, now_ms)?))
        })
    }

    /// Stop the referee's friendly. `discard` deletes the record instead of
    /// completing it with a null winner.
    pub fn end_friendly(&mut self, referee_id: &str, discard: bool, now_ms: u64) -> MatchResult<Option<MatchDoc>> {
        let key = friendly_key(referee_id)?;
        self.end_session(&key, referee_id, discard, now_ms)
    }

    pub fn rearm_friendly(&mut self, referee_id: &str, now_ms: u64) -> MatchResult<Option<InputWindow>> {
        let key = friendly_key(referee_id)?;
        self.rearm_session(&key, now_ms)
    }

    pub fn friendly_snapshot(&self, referee_id: &str) -> Option<MatchDoc> {
        let key = friendly_key(referee_id).ok()?;
        self.registry.get(&key).map(|session| session.doc.clone())
    }

    pub fn active_friendlies(&self) -> usize {
        self.registry
            .iter()
            .filter(|(key, _)| key.kind() == MatchKind::Friendly)
            .count()
    }
}
