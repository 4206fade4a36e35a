use crate::broadcast::BroadcastPublisher;
use crate::draft::{self, DraftEvent, ResultInput};
use crate::error::{MatchError, MatchResult};
use crate::events::EventBook;
use crate::pool_generator::{self, BracketConfig, GeneratedPools, TierCatalogs};
use crate::rng::DraftRng;
use crate::rounds::{RoundInfo, RoundTable};
use crate::session::{InputWindow, MatchRegistry, MatchSession, SessionKey, WindowKind, WindowTimeouts};
use crate::store::MatchStore;
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub(crate) type Outbound = (&'static str, Value);

pub(crate) fn draft_outbound(events: Vec<DraftEvent>) -> Vec<Outbound> {
    events.into_iter().map(|event| (event.name(), event.detail())).collect()
}

// ── Requests ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCheckIn {
    pub referee_id: String,
    pub channel_ref: String,
    pub round: String,
    pub match_number: u32,
    pub player_names: [String; 2],
    pub best_of: Option<u8>,
    pub has_bans: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CleanMode {
    MarkCompleted,
    Delete,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckMatch {
    pub id: u64,
    pub round: String,
    pub match_number: u32,
    pub status: MatchStatus,
    pub progress_level: ProgressLevel,
    pub players: [String; 2],
}

// ── Orchestrator ───────────────────────────────────────────────────────

/// Owns every live match. All mutations go through here: validate against a
/// copy, persist the copy, swap it in, then broadcast.
pub struct Orchestrator {
    pub(crate) config: AppConfig,
    pub(crate) timeouts: WindowTimeouts,
    pub(crate) store: Box<dyn MatchStore>,
    pub(crate) publisher: BroadcastPublisher,
    pub(crate) registry: MatchRegistry,
    pub(crate) events: EventBook,
    pub(crate) rounds: RoundTable,
    pub(crate) catalogs: Option<TierCatalogs>,
    pub(crate) pools: Option<GeneratedPools>,
    pub(crate) rng: DraftRng,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        store: Box<dyn MatchStore>,
        publisher: BroadcastPublisher,
        rounds: RoundTable,
        now_ms: u64,
    ) -> MatchResult<Self> {
        let events = EventBook::load(store.as_ref()).map_err(MatchError::Persistence)?;
        let mut orchestrator = Orchestrator {
            timeouts: WindowTimeouts::from_config(&config),
            config,
            store,
            publisher,
            registry: MatchRegistry::default(),
            events,
            rounds,
            catalogs: None,
            pools: None,
            // Coin flips stay unpredictable even when pools are seeded.
            rng: DraftRng::new(now_ms),
        };
        orchestrator.load_event_artifacts()?;
        Ok(orchestrator)
    }

    pub fn publisher(&self) -> &BroadcastPublisher {
        &self.publisher
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn load_event_artifacts(&mut self) -> MatchResult<()> {
        let Some(event_id) = self.events.active().map(|event| event.id) else {
            self.catalogs = None;
            self.pools = None;
            return Ok(());
        };
        self.catalogs = self.store.load_catalogs(event_id).map_err(MatchError::Persistence)?;
        self.pools = self.store.load_pools(event_id).map_err(MatchError::Persistence)?;
        Ok(())
    }

    pub(crate) fn active_event_id(&self) -> MatchResult<u64> {
        self.events
            .active()
            .map(|event| event.id)
            .ok_or_else(|| MatchError::not_found("No active event! Create or switch to one first."))
    }

    fn ranked_key(&self) -> MatchResult<SessionKey> {
        Ok(SessionKey::Ranked(self.active_event_id()?))
    }

    // ── Commit path ────────────────────────────────────────────────────

    /// Run `f` against a copy of the session. The copy is persisted (once the
    /// match is durable) before it replaces the live session, and only then
    /// are its events broadcast. Any error leaves the live session untouched.
    pub(crate) fn apply_to_session<F>(
        &mut self,
        key: &SessionKey,
        guard: Option<WindowKind>,
        now_ms: u64,
        f: F,
    ) -> MatchResult<MatchDoc>
    where
        F: FnOnce(&mut MatchSession) -> MatchResult<Vec<Outbound>>,
    {
        let session = self.registry.get(key).ok_or_else(|| no_session_error(key))?;
        if let Some(kind) = guard {
            session.guard(kind, now_ms)?;
        }
        let mut next = session.clone();
        let outbound = f(&mut next).map_err(|e| {
            debug!("{} match {} rejected action: {e}", key.kind().event_prefix(), next.doc.id);
            e
        })?;

        if next.durable {
            self.store.save_match(&next.doc).map_err(|e| {
                error!("failed to persist match {}: {e}", next.doc.id);
                MatchError::Persistence(e)
            })?;
        }
        next.refresh_window(&self.timeouts, now_ms);
        let doc = next.doc.clone();
        if doc.is_live() {
            if let Some(live) = self.registry.get_mut(key) {
                *live = next;
            }
        } else {
            self.registry.release(key);
            info!("{} match {} released its slot", key.kind().event_prefix(), doc.id);
        }
        self.announce(key.kind(), &doc, outbound);
        Ok(doc)
    }

    pub(crate) fn announce(&self, kind: MatchKind, doc: &MatchDoc, outbound: Vec<Outbound>) {
        for (name, detail) in outbound {
            info!("{}.{name} match={} progress={:?}", kind.event_prefix(), doc.id, doc.progress_level);
            self.publisher.publish_match(kind, name, Some(doc), detail);
        }
    }

    // ── Events, catalogs, pools ────────────────────────────────────────

    pub fn create_event(&mut self, name: &str, now_ms: u64) -> MatchResult<Event> {
        self.ensure_no_live_ranked()?;
        let event = self.events.create(self.store.as_mut(), name, now_ms)?;
        self.load_event_artifacts()?;
        Ok(event)
    }

    pub fn switch_event(&mut self, name: &str) -> MatchResult<Event> {
        self.ensure_no_live_ranked()?;
        let event = self.events.switch(self.store.as_mut(), name)?;
        self.load_event_artifacts()?;
        Ok(event)
    }

    pub fn list_events(&self) -> Vec<Event> {
        self.events.list()
    }

    pub fn active_event(&self) -> Option<Event> {
        self.events.active().cloned()
    }

    /// One ranked match per event: neither a live session nor a leftover
    /// `in_progress` record may hold the slot.
    fn ensure_ranked_slot_free(&self, key: &SessionKey, event_id: u64) -> MatchResult<()> {
        if self.registry.holds(key) {
            return Err(MatchError::conflict("A match is already in progress for this event!"));
        }
        let leftover = self.store.list_in_progress(event_id).map_err(MatchError::Persistence)?;
        if let Some(stuck) = leftover.first() {
            return Err(MatchError::conflict(format!(
                "Match #{} is still in progress; resume or clean it up first.",
                stuck.id
            )));
        }
        Ok(())
    }

    fn ensure_no_live_ranked(&self) -> MatchResult<()> {
        if let Some(event) = self.events.active() {
            if self.registry.holds(&SessionKey::Ranked(event.id)) {
                return Err(MatchError::conflict(
                    "Finish or end the current match before changing events.",
                ));
            }
        }
        Ok(())
    }

    pub fn set_catalogs(&mut self, catalogs: TierCatalogs) -> MatchResult<usize> {
        let event_id = self.active_event_id()?;
        self.store
            .save_catalogs(event_id, &catalogs)
            .map_err(MatchError::Persistence)?;
        let total = catalogs.values().map(Vec::len).sum();
        info!("loaded {total} charts across {} tiers for event {event_id}", catalogs.len());
        self.catalogs = Some(catalogs);
        Ok(total)
    }

    pub fn reload_catalogs(&mut self) -> MatchResult<usize> {
        let catalogs =
            pool_generator::load_tier_catalogs(&self.config.catalog_path).map_err(MatchError::Config)?;
        self.set_catalogs(catalogs)
    }

    pub fn generate_pools(&mut self, seed: Option<u64>, now_ms: u64) -> MatchResult<GeneratedPools> {
        let brackets =
            pool_generator::load_bracket_configs(&self.config.brackets_path).map_err(MatchError::Config)?;
        self.generate_pools_with(&brackets, seed, now_ms)
    }

    pub fn generate_pools_with(
        &mut self,
        brackets: &[BracketConfig],
        seed: Option<u64>,
        now_ms: u64,
    ) -> MatchResult<GeneratedPools> {
        let event_id = self.active_event_id()?;
        let catalogs = self.catalogs.as_ref().ok_or_else(|| {
            MatchError::not_found("Map pool has not been loaded yet! Reload the tier catalogs first.")
        })?;
        let seed = seed.or(self.config.pool_seed).unwrap_or_else(|| self.rng.next_u64());
        let generated = pool_generator::generate_pools(catalogs, brackets, &mut DraftRng::new(seed))?;
        let pools = GeneratedPools {
            event_id,
            seed,
            generated_at: now_ms,
            brackets: generated,
        };
        self.store.save_pools(&pools).map_err(MatchError::Persistence)?;
        info!("generated pools for event {event_id} with seed {seed}");
        self.pools = Some(pools.clone());
        Ok(pools)
    }

    pub fn pools(&self) -> Option<&GeneratedPools> {
        self.pools.as_ref()
    }

    pub fn rounds(&self) -> &[RoundInfo] {
        self.rounds.rounds()
    }

    // ── Ranked flow ────────────────────────────────────────────────────

    pub fn start_check_in(&mut self, req: StartCheckIn, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = self.ranked_key()?;
        let event_id = self.active_event_id()?;
        self.ensure_ranked_slot_free(&key, event_id)?;
        let round = self
            .rounds
            .find(&req.round)
            .cloned()
            .ok_or_else(|| MatchError::not_found(format!("Round \"{}\" not found.", req.round.trim())))?;
        let pools = self.pools.as_ref().ok_or_else(|| {
            MatchError::not_found("Pools have not been generated yet! Run pool generation first.")
        })?;
        let charts = pools.match_pool(&round.bracket, &round.round, req.match_number)?.to_vec();
        let best_of = req.best_of.unwrap_or(round.best_of);
        draft::validate_format(best_of, charts.len())?;
        let names = validate_player_names(&req.player_names)?;

        let id = self.store.next_match_id().map_err(MatchError::Persistence)?;
        let meta = MatchMeta {
            kind: MatchKind::Ranked,
            event_id,
            bracket: Some(round.bracket.clone()),
            round: round.name.clone(),
            match_number: req.match_number,
            best_of,
            wins_needed: draft::wins_needed(best_of),
            tier: Some(round.tier),
            has_bans: req.has_bans.unwrap_or(round.bans),
            first_pick: self.config.ranked_first_pick,
            coin_flip_winner: None,
            channel_ref: req.channel_ref.trim().to_string(),
            initiator: req.referee_id.trim().to_string(),
            started_at: now_ms,
            completed_at: None,
            restarted_from: None,
        };
        let doc = draft::build_match(id, meta, [names[0], names[1]], &charts);
        self.open_check_in(key, doc, now_ms)
    }

    fn open_check_in(&mut self, key: SessionKey, mut doc: MatchDoc, now_ms: u64) -> MatchResult<MatchDoc> {
        let message = format!(
            "Check-in opened for {} vs {}",
            doc.players[0].display_name, doc.players[1].display_name
        );
        draft::push_feed(&mut doc, "checkInStarted", message, Value::Null, now_ms);
        let mut session = MatchSession::new(doc, false);
        session.refresh_window(&self.timeouts, now_ms);
        let doc = self.registry.acquire(key, session)?.doc.clone();
        info!("check-in opened for match {} ({} #{})", doc.id, doc.meta.round, doc.meta.match_number);
        self.announce(MatchKind::Ranked, &doc, vec![("checkIn", check_in_detail(&doc))]);
        Ok(doc)
    }

    pub fn check_in(&mut self, slot: Slot, player_id: &str, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = self.ranked_key()?;
        let player_id = player_id.trim().to_string();
        if player_id.is_empty() {
            return Err(MatchError::validation("A player id is required to check in."));
        }
        self.apply_to_session(&key, Some(WindowKind::CheckIn), now_ms, |session| {
            let doc = &mut session.doc;
            if doc.player(slot).external_id.is_some() {
                return Err(MatchError::validation("That player has already checked in."));
            }
            if doc.player(slot.other()).external_id.as_deref() == Some(player_id.as_str()) {
                return Err(MatchError::validation("You're already checked in as the other player!"));
            }
            doc.player_mut(slot).external_id = Some(player_id.clone());
            let message = format!("{} checked in", doc.player(slot).display_name);
            draft::push_feed(doc, "checkIn", message, json!({ "slot": slot }), now_ms);
            Ok(vec![("checkIn", check_in_detail(doc))])
        })
    }

    pub fn approve(&mut self, referee_id: &str, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = self.ranked_key()?;
        let session = self.registry.get(&key).ok_or_else(|| no_session_error(&key))?;
        session.guard(WindowKind::Approval, now_ms)?;
        let coin = self.rng.coin_flip();
        let referee_id = referee_id.trim().to_string();
        self.apply_to_session(&key, Some(WindowKind::Approval), now_ms, |session| {
            session.durable = true;
            let doc = &mut session.doc;
            doc.meta.coin_flip_winner = Some(coin);
            doc.meta.started_at = now_ms;
            let message = format!(
                "Approved by {referee_id}; {} won the coin flip",
                doc.player(coin).display_name
            );
            draft::push_feed(doc, "approved", message, json!({ "coinFlipWinner": coin }), now_ms);
            Ok(vec![("approved", json!({ "coinFlipWinner": coin, "approvedBy": referee_id }))])
        })
    }

    /// Tear down a pending check-in. Nothing was persisted, so nothing is deleted.
    pub fn reject(&mut self, referee_id: &str) -> MatchResult<()> {
        let key = self.ranked_key()?;
        let session = self.registry.get(&key).ok_or_else(|| no_session_error(&key))?;
        if session.durable {
            return Err(MatchError::validation(
                "Only a pending check-in can be rejected; end the match instead.",
            ));
        }
        let Some(session) = self.registry.release(&key) else {
            return Err(no_session_error(&key));
        };
        info!("check-in for match {} terminated by {}", session.doc.id, referee_id.trim());
        self.publisher.publish_match(
            MatchKind::Ranked,
            "cancelled",
            None,
            json!({ "matchId": session.doc.id, "reason": "Check in terminated." }),
        );
        Ok(())
    }

    /// The coin-flip winner decides whether they ban (or pick, without bans) first.
    pub fn choose_ban_order(&mut self, player_id: &str, go_first: bool, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = self.ranked_key()?;
        self.apply_to_session(&key, Some(WindowKind::BanOrder), now_ms, |session| {
            let doc = &mut session.doc;
            let slot = player_slot(doc, player_id)?;
            if doc.meta.coin_flip_winner != Some(slot) {
                return Err(MatchError::validation("Only the coin flip winner chooses the order!"));
            }
            let first = if go_first { slot } else { slot.other() };
            let mut outbound: Vec<Outbound> = vec![("start", json!({ "firstChoice": first }))];
            outbound.extend(draft_outbound(draft::begin_draft(doc, first, now_ms)?));
            Ok(outbound)
        })
    }

    pub fn ban(&mut self, player_id: &str, chart: &str, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = self.ranked_key()?;
        self.apply_to_session(&key, Some(WindowKind::Ban), now_ms, |session| {
            let slot = player_slot(&session.doc, player_id)?;
            Ok(draft_outbound(draft::apply_ban(&mut session.doc, slot, chart.trim(), now_ms)?))
        })
    }

    pub fn pick(&mut self, player_id: &str, chart: &str, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = self.ranked_key()?;
        self.apply_to_session(&key, Some(WindowKind::Pick), now_ms, |session| {
            let slot = player_slot(&session.doc, player_id)?;
            Ok(draft_outbound(draft::apply_pick(&mut session.doc, slot, chart.trim(), now_ms)?))
        })
    }

    pub fn ready(&mut self, player_id: &str, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = self.ranked_key()?;
        self.apply_to_session(&key, Some(WindowKind::ReadyCheck), now_ms, |session| {
            let slot = player_slot(&session.doc, player_id)?;
            Ok(draft_outbound(draft::apply_ready(&mut session.doc, slot, now_ms)?))
        })
    }

    pub fn submit_result(&mut self, input: &ResultInput, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = self.ranked_key()?;
        self.apply_to_session(&key, None, now_ms, |session| {
            Ok(draft_outbound(draft::apply_result(&mut session.doc, input, now_ms)?))
        })
    }

    /// Force-clean the live ranked match: mark it completed with no winner, or
    /// delete the record outright. Either way the slot is freed.
    pub fn end_match(&mut self, referee_id: &str, delete: bool, now_ms: u64) -> MatchResult<Option<MatchDoc>> {
        let key = self.ranked_key()?;
        self.end_session(&key, referee_id, delete, now_ms)
    }

    pub(crate) fn end_session(
        &mut self,
        key: &SessionKey,
        referee_id: &str,
        delete: bool,
        now_ms: u64,
    ) -> MatchResult<Option<MatchDoc>> {
        let session = self.registry.get(key).ok_or_else(|| no_session_error(key))?;
        let match_id = session.doc.id;
        if delete || !session.durable {
            if session.durable {
                self.store.delete_match(match_id).map_err(MatchError::Persistence)?;
            }
            self.registry.release(key);
            warn!("match {match_id} discarded by {}", referee_id.trim());
            self.publisher.publish_match(
                key.kind(),
                "end",
                None,
                json!({ "matchId": match_id, "winner": Value::Null, "deleted": true }),
            );
            return Ok(None);
        }
        let doc = self.apply_to_session(key, None, now_ms, |session| {
            Ok(draft_outbound(draft::force_end(&mut session.doc, now_ms)))
        })?;
        warn!("match {match_id} force-ended by {}", referee_id.trim());
        Ok(Some(doc))
    }

    /// Reopen the input window after a stall.
    pub fn rearm(&mut self, now_ms: u64) -> MatchResult<Option<InputWindow>> {
        let key = self.ranked_key()?;
        self.rearm_session(&key, now_ms)
    }

    pub(crate) fn rearm_session(&mut self, key: &SessionKey, now_ms: u64) -> MatchResult<Option<InputWindow>> {
        let session = self.registry.get_mut(key).ok_or_else(|| no_session_error(key))?;
        let window = session.refresh_window(&self.timeouts, now_ms).cloned();
        let doc = session.doc.clone();
        if let Some(window) = &window {
            info!("match {} rearmed: {} window reopened", doc.id, window.kind.label());
        }
        self.publisher
            .publish_match(key.kind(), "rearmed", Some(&doc), json!({ "window": window }));
        Ok(window)
    }

    /// Start over from a completed match: the old record becomes `restarted`
    /// and a new check-in opens with the same charts.
    pub fn restart_match(&mut self, referee_id: &str, match_id: u64, channel_ref: &str, now_ms: u64) -> MatchResult<MatchDoc> {
        let key = self.ranked_key()?;
        let event_id = self.active_event_id()?;
        self.ensure_ranked_slot_free(&key, event_id)?;
        let mut old = self
            .store
            .load_match(match_id)
            .map_err(MatchError::Persistence)?
            .filter(|doc| doc.meta.event_id == event_id && doc.meta.kind == MatchKind::Ranked)
            .ok_or_else(|| MatchError::not_found(format!("Match #{match_id} not found in this event.")))?;
        if old.status != MatchStatus::Completed {
            return Err(MatchError::validation("Only completed matches can be restarted."));
        }

        let charts: Vec<ChartRef> = old.mappool.iter().enumerate().map(|(i, e)| e.to_chart(i)).collect();
        let id = self.store.next_match_id().map_err(MatchError::Persistence)?;
        let mut meta = old.meta.clone();
        meta.coin_flip_winner = None;
        meta.channel_ref = channel_ref.trim().to_string();
        meta.initiator = referee_id.trim().to_string();
        meta.started_at = now_ms;
        meta.completed_at = None;
        meta.restarted_from = Some(old.id);
        let names = [old.players[0].display_name.clone(), old.players[1].display_name.clone()];
        let doc = draft::build_match(id, meta, [names[0].as_str(), names[1].as_str()], &charts);

        old.status = MatchStatus::Restarted;
        draft::push_feed(&mut old, "restarted", format!("Restarted as match #{id}"), json!({ "newMatchId": id }), now_ms);
        self.store.save_match(&old).map_err(MatchError::Persistence)?;
        info!("match {match_id} restarted as {id}");
        self.open_check_in(key, doc, now_ms)
    }

    pub fn stuck_matches(&self) -> MatchResult<Vec<StuckMatch>> {
        let event_id = self.active_event_id()?;
        let docs = self.store.list_matches(event_id).map_err(MatchError::Persistence)?;
        Ok(docs
            .into_iter()
            .filter(|doc| doc.status == MatchStatus::InProgress && !self.registry.holds_match(doc.id))
            .map(|doc| StuckMatch {
                id: doc.id,
                round: doc.meta.round.clone(),
                match_number: doc.meta.match_number,
                status: doc.status,
                progress_level: doc.progress_level,
                players: [doc.players[0].display_name.clone(), doc.players[1].display_name.clone()],
            })
            .collect())
    }

    /// Close out in-progress records no live session owns, such as matches whose
    /// resume failed.
    pub fn clean_stuck(&mut self, mode: CleanMode, now_ms: u64) -> MatchResult<Vec<u64>> {
        let event_id = self.active_event_id()?;
        let docs = self.store.list_matches(event_id).map_err(MatchError::Persistence)?;
        let mut cleaned = Vec::new();
        for mut doc in docs {
            if doc.status != MatchStatus::InProgress || self.registry.holds_match(doc.id) {
                continue;
            }
            match mode {
                CleanMode::Delete => self.store.delete_match(doc.id).map_err(MatchError::Persistence)?,
                CleanMode::MarkCompleted => {
                    draft::force_end(&mut doc, now_ms);
                    self.store.save_match(&doc).map_err(MatchError::Persistence)?;
                }
            }
            warn!("cleaned stuck match {} ({:?})", doc.id, mode);
            cleaned.push(doc.id);
        }
        Ok(cleaned)
    }

    // ── Reads ──────────────────────────────────────────────────────────

    /// The live ranked match for the active event, pending check-ins included.
    pub fn snapshot(&self) -> Option<MatchDoc> {
        let key = self.ranked_key().ok()?;
        self.registry.get(&key).map(|session| session.doc.clone())
    }

    pub fn window(&self) -> Option<InputWindow> {
        let key = self.ranked_key().ok()?;
        self.registry.get(&key).and_then(|session| session.window.clone())
    }

    // ── Stall detection ────────────────────────────────────────────────

    /// Flag every window past its deadline and tell the operator. A stalled
    /// match stays in progress until rearmed or ended.
    pub fn sweep_stalled(&mut self, now_ms: u64) -> Vec<(SessionKey, InputWindow)> {
        let mut stalled = Vec::new();
        for (key, session) in self.registry.iter_mut() {
            if let Some(window) = session.mark_stalled(now_ms) {
                stalled.push((key.clone(), window, session.doc.clone()));
            }
        }
        let mut notices = Vec::with_capacity(stalled.len());
        for (key, window, doc) in stalled {
            let message = MatchError::Stalled(window.kind.label().to_string()).to_string();
            warn!("match {} stalled: {message}", doc.id);
            self.publisher.publish_match(
                key.kind(),
                "stalled",
                Some(&doc),
                json!({ "window": window, "message": message }),
            );
            notices.push((key, window));
        }
        notices
    }
}

// ── Helpers ────────────────────────────────────────────────────────────

fn no_session_error(key: &SessionKey) -> MatchError {
    match key {
        SessionKey::Ranked(_) => MatchError::not_found("There is no match in progress."),
        SessionKey::Friendly(_) => MatchError::not_found("You don't have an active friendly match."),
    }
}

pub(crate) fn player_slot(doc: &MatchDoc, player_id: &str) -> MatchResult<Slot> {
    doc.slot_of_player(player_id.trim())
        .ok_or_else(|| MatchError::validation("You're not a player in this match."))
}

pub(crate) fn validate_player_names(names: &[String; 2]) -> MatchResult<[&str; 2]> {
    let first = names[0].trim();
    let second = names[1].trim();
    if first.is_empty() || second.is_empty() {
        return Err(MatchError::validation("Both player names are required."));
    }
    Ok([first, second])
}

fn check_in_detail(doc: &MatchDoc) -> Value {
    json!({
        "playerNames": [doc.players[0].display_name, doc.players[1].display_name],
        "p1CheckedIn": doc.players[0].external_id.is_some(),
        "p2CheckedIn": doc.players[1].external_id.is_some(),
        "round": doc.meta.round,
        "matchNumber": doc.meta.match_number,
    })
}

/// Periodic stall sweep on the runtime.
pub fn spawn_stall_watchdog(shared: SharedOrchestrator, interval_ms: u64) {
    let interval_ms = interval_ms.max(100);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            let now = crate::config::now_ms();
            let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
            guard.sweep_stalled(now);
        }
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::draft::tests::make_charts;
    use crate::pool_generator::RoundPoolConfig;
    use crate::store::{MatchStore, MemoryStore};
    use tokio::sync::broadcast::Receiver;
    use crate::broadcast::BroadcastMessage;

    pub(crate) fn test_config() -> AppConfig {
        AppConfig {
            pool_seed: Some(42),
            ..AppConfig::default()
        }
    }

    pub(crate) fn test_rounds() -> RoundTable {
        RoundTable::from_rounds(vec![
            RoundInfo {
                name: "Test – Bo3".to_string(),
                bracket: "Test".to_string(),
                round: "Bo3".to_string(),
                best_of: 3,
                tier: 1,
                bans: false,
            },
            RoundInfo {
                name: "Test – Bo5".to_string(),
                bracket: "Test".to_string(),
                round: "Bo5".to_string(),
                best_of: 5,
                tier: 1,
                bans: true,
            },
        ])
        .unwrap()
    }

    /// Orchestrator with an active event, a loaded catalog and generated
    /// pools: Bo3 matches hold 3 charts, Bo5 matches hold 7.
    pub(crate) fn make_orchestrator(store: &MemoryStore) -> Orchestrator {
        let mut orch = Orchestrator::new(
            test_config(),
            Box::new(store.clone()),
            BroadcastPublisher::new(64),
            test_rounds(),
            0,
        )
        .unwrap();
        orch.create_event("Spring Cup", 1).unwrap();
        let mut catalogs = TierCatalogs::new();
        catalogs.insert(1, make_charts(12));
        orch.set_catalogs(catalogs).unwrap();
        let brackets = vec![BracketConfig {
            name: "Test".to_string(),
            rounds: vec![
                RoundPoolConfig { name: "Bo3".to_string(), tier: 1, matches: 2, charts: 3, hardest_only: false },
                RoundPoolConfig { name: "Bo5".to_string(), tier: 1, matches: 2, charts: 7, hardest_only: false },
            ],
        }];
        orch.generate_pools_with(&brackets, Some(7), 2).unwrap();
        orch
    }

    fn start_request(round: &str) -> StartCheckIn {
        StartCheckIn {
            referee_id: "ref".to_string(),
            channel_ref: "channel-1".to_string(),
            round: round.to_string(),
            match_number: 1,
            player_names: ["Alice".to_string(), "Bob".to_string()],
            best_of: None,
            has_bans: None,
        }
    }

    /// Check both players in and approve. Returns the coin-flip winner's id.
    pub(crate) fn approved_match(orch: &mut Orchestrator, round: &str) -> String {
        orch.start_check_in(start_request(round), 10).unwrap();
        orch.check_in(Slot::One, "alice", 11).unwrap();
        orch.check_in(Slot::Two, "bob", 12).unwrap();
        let doc = orch.approve("ref", 13).unwrap();
        match doc.meta.coin_flip_winner {
            Some(Slot::One) => "alice".to_string(),
            _ => "bob".to_string(),
        }
    }

    fn id_of(doc: &MatchDoc, slot: Slot) -> String {
        doc.player(slot).external_id.clone().unwrap()
    }

    fn drain(rx: &mut Receiver<BroadcastMessage>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(message) = rx.try_recv() {
            names.push(message.event);
        }
        names
    }

    fn remaining(doc: &MatchDoc) -> Vec<String> {
        draft::current_pool(doc).iter().map(|e| e.csv_name.clone()).collect()
    }

    #[test]
    fn test_check_in_is_not_durable_until_approved() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        let doc = orch.start_check_in(start_request("Test – Bo3"), 10).unwrap();
        assert_eq!(doc.mappool.len(), 3);
        orch.check_in(Slot::One, "alice", 11).unwrap();
        orch.check_in(Slot::Two, "bob", 12).unwrap();
        assert!(store.raw_match(doc.id).is_none());
        assert_eq!(orch.window().unwrap().kind, WindowKind::Approval);

        let approved = orch.approve("ref", 13).unwrap();
        assert!(store.raw_match(doc.id).is_some());
        assert!(approved.meta.coin_flip_winner.is_some());
        assert_eq!(orch.window().unwrap().kind, WindowKind::BanOrder);
    }

    #[test]
    fn test_reject_discards_pending_check_in() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        let mut rx = orch.publisher().subscribe();
        let doc = orch.start_check_in(start_request("Test – Bo3"), 10).unwrap();
        orch.reject("ref").unwrap();
        assert!(orch.snapshot().is_none());
        assert!(store.raw_match(doc.id).is_none());
        assert_eq!(drain(&mut rx), vec!["match.checkIn", "match.cancelled"]);
        orch.start_check_in(start_request("Test – Bo3"), 20).unwrap();
    }

    #[test]
    fn test_second_ranked_match_conflicts() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        orch.start_check_in(start_request("Test – Bo3"), 10).unwrap();
        let err = orch.start_check_in(start_request("Test – Bo5"), 11).unwrap_err();
        assert!(matches!(err, MatchError::Conflict(_)));
    }

    #[test]
    fn test_double_check_in_is_rejected() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        orch.start_check_in(start_request("Test – Bo3"), 10).unwrap();
        orch.check_in(Slot::One, "alice", 11).unwrap();
        assert!(matches!(orch.check_in(Slot::One, "carol", 12), Err(MatchError::Validation(_))));
        assert!(matches!(orch.check_in(Slot::Two, "alice", 12), Err(MatchError::Validation(_))));
    }

    #[test]
    fn test_unknown_round_and_missing_pools() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        assert!(matches!(
            orch.start_check_in(start_request("Test – Bo9"), 10),
            Err(MatchError::NotFound(_))
        ));
        let mut req = start_request("Test – Bo3");
        req.match_number = 5;
        assert!(matches!(orch.start_check_in(req, 10), Err(MatchError::NotFound(_))));

        orch.create_event("Summer Cup", 20).unwrap();
        assert!(orch.pools().is_none());
        assert!(matches!(
            orch.start_check_in(start_request("Test – Bo3"), 21),
            Err(MatchError::NotFound(_))
        ));
    }

    #[test]
    fn test_best_of_three_no_bans_full_match() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        let mut rx = orch.publisher().subscribe();
        let chooser = approved_match(&mut orch, "Test – Bo3");

        let doc = orch.choose_ban_order(&chooser, true, 20).unwrap();
        assert_eq!(doc.progress_level, ProgressLevel::PickingPostResult);
        let first = doc.current_picker_slot.unwrap();
        assert_eq!(id_of(&doc, first), chooser);
        assert_eq!(remaining(&doc).len(), 3);

        let chart = remaining(&doc)[0].clone();
        orch.pick(&chooser, &chart, 21).unwrap();
        orch.ready("alice", 22).unwrap();
        orch.ready("bob", 23).unwrap();
        let doc = orch
            .submit_result(&ResultInput { score1: 900, score2: 800, ..ResultInput::default() }, 24)
            .unwrap();
        assert_eq!(doc.current_picker_slot, Some(Slot::Two));

        let chart = remaining(&doc)[0].clone();
        orch.pick("bob", &chart, 25).unwrap();
        orch.ready("bob", 26).unwrap();
        orch.ready("alice", 27).unwrap();
        let doc = orch
            .submit_result(&ResultInput { score1: 950, score2: 700, fc1: true, ..ResultInput::default() }, 28)
            .unwrap();

        assert_eq!(doc.status, MatchStatus::Completed);
        assert_eq!(doc.winner(), Some(Slot::One));
        assert!(orch.snapshot().is_none());
        let stored = store.raw_match(doc.id).unwrap();
        assert!(stored.contains("\"completed\""));

        let events = drain(&mut rx);
        assert_eq!(events.first().map(String::as_str), Some("match.checkIn"));
        assert!(events.contains(&"match.approved".to_string()));
        assert!(events.contains(&"match.start".to_string()));
        assert!(events.contains(&"match.chartStart".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("match.end"));

        // The slot is free again.
        let mut req = start_request("Test – Bo3");
        req.match_number = 2;
        orch.start_check_in(req, 30).unwrap();
    }

    #[test]
    fn test_best_of_five_bans_then_picks() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        let chooser = approved_match(&mut orch, "Test – Bo5");
        let doc = orch.choose_ban_order(&chooser, false, 20).unwrap();
        assert_eq!(doc.progress_level, ProgressLevel::BanPhase);
        assert_eq!(doc.ban_phase.total_bans, 2);
        let first_banner = doc.ban_phase.current_banner.unwrap();
        assert_ne!(id_of(&doc, first_banner), chooser);

        let second_banner_id = id_of(&doc, first_banner.other());
        let first_banner_id = id_of(&doc, first_banner);
        let chart = remaining(&doc)[0].clone();
        assert!(matches!(orch.ban(&second_banner_id, &chart, 21), Err(MatchError::Validation(_))));
        let doc = orch.ban(&first_banner_id, &chart, 22).unwrap();
        let chart = remaining(&doc)[0].clone();
        let doc = orch.ban(&second_banner_id, &chart, 23).unwrap();

        assert_eq!(doc.progress_level, ProgressLevel::PickingPostResult);
        assert_eq!(remaining(&doc).len(), 5);
        assert_eq!(doc.current_picker_slot, Some(first_banner.other()));
        assert_eq!(orch.window().unwrap().kind, WindowKind::Pick);
    }

    #[test]
    fn test_persistence_failure_leaves_state_untouched() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        let chooser = approved_match(&mut orch, "Test – Bo3");
        let doc = orch.choose_ban_order(&chooser, true, 20).unwrap();
        let before_raw = store.raw_match(doc.id).unwrap();
        let mut rx = orch.publisher().subscribe();

        store.set_fail_writes(true);
        let chart = remaining(&doc)[0].clone();
        let err = orch.pick(&chooser, &chart, 21).unwrap_err();
        assert!(matches!(err, MatchError::Persistence(_)));
        assert_eq!(orch.snapshot().unwrap(), doc);
        assert_eq!(store.raw_match(doc.id).unwrap(), before_raw);
        assert!(drain(&mut rx).is_empty());

        store.set_fail_writes(false);
        let doc = orch.pick(&chooser, &chart, 22).unwrap();
        assert_eq!(doc.current_chart.as_deref(), Some(chart.as_str()));
    }

    #[test]
    fn test_snapshot_matches_last_broadcast() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        let mut rx = orch.publisher().subscribe();
        let chooser = approved_match(&mut orch, "Test – Bo3");
        orch.choose_ban_order(&chooser, true, 20).unwrap();

        let mut last = None;
        while let Ok(message) = rx.try_recv() {
            last = Some(message);
        }
        let last = last.unwrap();
        let snapshot = serde_json::to_value(orch.snapshot().unwrap()).unwrap();
        assert_eq!(last.data["match"], snapshot);
    }

    #[test]
    fn test_stalled_window_blocks_actions_until_rearm() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        let chooser = approved_match(&mut orch, "Test – Bo3");
        let doc = orch.choose_ban_order(&chooser, true, 20).unwrap();
        let mut rx = orch.publisher().subscribe();

        let deadline = orch.window().unwrap().deadline;
        assert!(orch.sweep_stalled(deadline - 1).is_empty());
        let notices = orch.sweep_stalled(deadline);
        assert_eq!(notices.len(), 1);
        assert!(orch.sweep_stalled(deadline + 1).is_empty());
        assert_eq!(drain(&mut rx), vec!["match.stalled"]);

        let chart = remaining(&doc)[0].clone();
        assert!(matches!(orch.pick(&chooser, &chart, deadline + 5), Err(MatchError::Stalled(_))));
        let stored: MatchDoc = serde_json::from_str(&store.raw_match(doc.id).unwrap()).unwrap();
        assert_eq!(stored.status, MatchStatus::InProgress);

        orch.rearm(deadline + 10).unwrap();
        orch.pick(&chooser, &chart, deadline + 11).unwrap();
    }

    #[test]
    fn test_end_match_marks_completed_without_winner() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        let chooser = approved_match(&mut orch, "Test – Bo3");
        orch.choose_ban_order(&chooser, true, 20).unwrap();
        let doc = orch.end_match("ref", false, 21).unwrap().unwrap();
        assert_eq!(doc.status, MatchStatus::Completed);
        assert_eq!(doc.winner(), None);
        assert!(orch.snapshot().is_none());
    }

    #[test]
    fn test_end_match_delete_removes_record() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        let chooser = approved_match(&mut orch, "Test – Bo3");
        let doc = orch.choose_ban_order(&chooser, true, 20).unwrap();
        assert!(orch.end_match("ref", true, 21).unwrap().is_none());
        assert!(store.raw_match(doc.id).is_none());
        assert!(orch.snapshot().is_none());
    }

    #[test]
    fn test_restart_completed_match_reuses_pool() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        let chooser = approved_match(&mut orch, "Test – Bo3");
        let original = orch.choose_ban_order(&chooser, true, 20).unwrap();
        orch.end_match("ref", false, 21).unwrap();

        let restarted = orch.restart_match("ref", original.id, "channel-2", 30).unwrap();
        assert_ne!(restarted.id, original.id);
        assert_eq!(restarted.meta.restarted_from, Some(original.id));
        let names: Vec<&str> = restarted.mappool.iter().map(|e| e.csv_name.as_str()).collect();
        let old_names: Vec<&str> = original.mappool.iter().map(|e| e.csv_name.as_str()).collect();
        assert_eq!(names, old_names);
        assert!(restarted.mappool.iter().all(|e| e.status.in_current_pool));

        let old: MatchDoc = serde_json::from_str(&store.raw_match(original.id).unwrap()).unwrap();
        assert_eq!(old.status, MatchStatus::Restarted);
        assert!(matches!(
            orch.restart_match("ref", original.id, "channel-2", 31),
            Err(MatchError::Conflict(_))
        ));
    }

    #[test]
    fn test_restart_blocked_by_leftover_in_progress_record() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        let chooser = approved_match(&mut orch, "Test – Bo3");
        let finished = orch.choose_ban_order(&chooser, true, 20).unwrap();
        orch.end_match("ref", false, 21).unwrap();

        let mut req = start_request("Test – Bo3");
        req.match_number = 2;
        orch.start_check_in(req, 30).unwrap();
        orch.check_in(Slot::One, "alice", 31).unwrap();
        orch.check_in(Slot::Two, "bob", 32).unwrap();
        let orphan = orch.approve("ref", 33).unwrap();
        let event_id = orch.active_event_id().unwrap();
        orch.registry.release(&SessionKey::Ranked(event_id));

        let err = orch.restart_match("ref", finished.id, "channel-2", 40).unwrap_err();
        assert!(matches!(err, MatchError::Conflict(_)));
        let old: MatchDoc = serde_json::from_str(&store.raw_match(finished.id).unwrap()).unwrap();
        assert_eq!(old.status, MatchStatus::Completed);
        let live: Vec<u64> = store.list_in_progress(event_id).unwrap().iter().map(|d| d.id).collect();
        assert_eq!(live, vec![orphan.id]);

        orch.clean_stuck(CleanMode::Delete, 41).unwrap();
        orch.restart_match("ref", finished.id, "channel-2", 42).unwrap();
    }

    #[test]
    fn test_coin_flips_ignore_pool_seed() {
        let store = MemoryStore::new();
        let build = |now_ms| {
            Orchestrator::new(
                test_config(),
                Box::new(store.clone()),
                BroadcastPublisher::new(8),
                test_rounds(),
                now_ms,
            )
            .unwrap()
        };
        let mut early = build(1_000);
        let mut late = build(2_000);
        assert_eq!(early.config().pool_seed, late.config().pool_seed);
        let early_flips: Vec<Slot> = (0..32).map(|_| early.rng.coin_flip()).collect();
        let late_flips: Vec<Slot> = (0..32).map(|_| late.rng.coin_flip()).collect();
        assert_ne!(early_flips, late_flips);
    }

    #[test]
    fn test_rejected_approve_does_not_draw_coin_flip() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        orch.start_check_in(start_request("Test – Bo3"), 10).unwrap();
        orch.check_in(Slot::One, "alice", 11).unwrap();
        let before = orch.rng.clone();

        assert!(matches!(orch.approve("ref", 12), Err(MatchError::Validation(_))));
        assert_eq!(orch.rng.clone().next_u64(), before.clone().next_u64());

        orch.check_in(Slot::Two, "bob", 13).unwrap();
        let doc = orch.approve("ref", 14).unwrap();
        assert_eq!(doc.meta.coin_flip_winner, Some(before.clone().coin_flip()));
    }

    #[test]
    fn test_clean_stuck_marks_orphans_completed() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        let chooser = approved_match(&mut orch, "Test – Bo3");
        let doc = orch.choose_ban_order(&chooser, true, 20).unwrap();
        assert!(orch.stuck_matches().unwrap().is_empty());

        // Simulate a process that lost its session without ending the match.
        let event_id = orch.active_event_id().unwrap();
        orch.registry.release(&SessionKey::Ranked(event_id));
        let stuck = orch.stuck_matches().unwrap();
        assert_eq!(stuck.len(), 1);
        assert!(matches!(
            orch.start_check_in(start_request("Test – Bo5"), 30),
            Err(MatchError::Conflict(_))
        ));

        assert_eq!(orch.clean_stuck(CleanMode::MarkCompleted, 31).unwrap(), vec![doc.id]);
        let cleaned: MatchDoc = serde_json::from_str(&store.raw_match(doc.id).unwrap()).unwrap();
        assert_eq!(cleaned.status, MatchStatus::Completed);
        assert!(orch.stuck_matches().unwrap().is_empty());
        orch.start_check_in(start_request("Test – Bo5"), 32).unwrap();
    }

    #[test]
    fn test_event_switch_blocked_while_match_live() {
        let store = MemoryStore::new();
        let mut orch = make_orchestrator(&store);
        orch.start_check_in(start_request("Test – Bo3"), 10).unwrap();
        assert!(matches!(orch.create_event("Summer Cup", 11), Err(MatchError::Conflict(_))));
        orch.reject("ref").unwrap();
        orch.create_event("Summer Cup", 12).unwrap();
        orch.switch_event("Spring Cup").unwrap();
        assert!(orch.pools().is_some());
    }

    #[test]
    fn test_generate_pools_requires_catalogs() {
        let store = MemoryStore::new();
        let mut orch = Orchestrator::new(
            test_config(),
            Box::new(store.clone()),
            BroadcastPublisher::new(8),
            test_rounds(),
            0,
        )
        .unwrap();
        assert!(matches!(orch.generate_pools_with(&[], None, 0), Err(MatchError::NotFound(_))));
        orch.create_event("Spring Cup", 1).unwrap();
        assert!(matches!(orch.generate_pools_with(&[], None, 0), Err(MatchError::NotFound(_))));
    }
}
