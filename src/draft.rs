use crate::error::{MatchError, MatchResult};
use crate::types::*;
use serde::Deserialize;
use serde_json::{json, Value};

// ── Draft events ───────────────────────────────────────────────────────

/// Transitions produced by the engine. The orchestrator turns each one into
/// a broadcast once the new state is durable.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftEvent {
  BanOrderDecided { first_banner: Slot, order: Vec<Slot> },
  Ban { chart: String, by: Slot, next_banner: Option<Slot> },
  PickPhaseStart { picker: Slot },
  Pick { chart: String, by: Slot },
  AutoPick { chart: String },
  PlayerReady { slot: Slot, ready: [bool; 2] },
  ChartStart { chart: String },
  ChartResult { chart: String, result: ChartResult, points: [u8; 2], next_picker: Option<Slot> },
  End { winner: Option<Slot>, points: [u8; 2] },
}

impl DraftEvent {
  pub fn name(&self) -> &'static str {
    match self {
      DraftEvent::BanOrderDecided { .. } => "banOrderDecided",
      DraftEvent::Ban { .. } => "ban",
      DraftEvent::PickPhaseStart { .. } => "pickPhaseStart",
      DraftEvent::Pick { .. } => "pick",
      DraftEvent::AutoPick { .. } => "autoPick",
      DraftEvent::PlayerReady { .. } => "playerReady",
      DraftEvent::ChartStart { .. } => "chartStart",
      DraftEvent::ChartResult { .. } => "chartResult",
      DraftEvent::End { .. } => "end",
    }
  }

  pub fn detail(&self) -> Value {
    match self {
      DraftEvent::BanOrderDecided { first_banner, order } => json!({ "firstBanner": first_banner, "banOrder": order }),
      DraftEvent::Ban { chart, by, next_banner } => {
        json!({ "chart": chart, "bannedBy": by, "nextBanner": next_banner })
      }
      DraftEvent::PickPhaseStart { picker } => json!({ "picker": picker }),
      DraftEvent::Pick { chart, by } => json!({ "chart": chart, "pickedBy": by }),
      DraftEvent::AutoPick { chart } => json!({ "chart": chart }),
      DraftEvent::PlayerReady { slot, ready } => json!({ "slot": slot, "ready": ready }),
      DraftEvent::ChartStart { chart } => json!({ "chart": chart }),
      DraftEvent::ChartResult { chart, result, points, next_picker } => json!({
        "chart": chart,
        "result": result,
        "points": points,
        "nextPicker": next_picker,
      }),
      DraftEvent::End { winner, points } => json!({ "winner": winner, "points": points }),
    }
  }
}

// ── Inputs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultInput {
  pub score1: u64,
  pub score2: u64,
  #[serde(default)]
  pub fc1: bool,
  #[serde(default)]
  pub fc2: bool,
  #[serde(default)]
  pub pfc1: bool,
  #[serde(default)]
  pub pfc2: bool,
}

// ── Construction ───────────────────────────────────────────────────────

pub fn wins_needed(best_of: u8) -> u8 {
  best_of / 2 + 1
}

pub fn total_bans_for(pool_len: usize, best_of: u8, has_bans: bool) -> usize {
  if has_bans {
    pool_len.saturating_sub(best_of as usize)
  } else {
    0
  }
}

/// Alternating ban order starting from `first`.
pub fn compute_ban_order(first: Slot, total_bans: usize) -> Vec<Slot> {
  (0..total_bans)
    .map(|i| if i % 2 == 0 { first } else { first.other() })
    .collect()
}

pub fn validate_format(best_of: u8, pool_len: usize) -> MatchResult<()> {
  if best_of == 0 || best_of % 2 == 0 || best_of > MAX_BEST_OF {
    return Err(MatchError::validation(format!(
      "Best-of must be an odd number between 1 and {MAX_BEST_OF}."
    )));
  }
  if pool_len < best_of as usize {
    return Err(MatchError::validation(format!(
      "A best-of-{best_of} needs at least {best_of} charts; this pool has {pool_len}."
    )));
  }
  Ok(())
}

/// Fresh document in `check-in` with every chart in the current pool.
pub fn build_match(id: u64, meta: MatchMeta, player_names: [&str; 2], charts: &[ChartRef]) -> MatchDoc {
  let total_bans = total_bans_for(charts.len(), meta.best_of, meta.has_bans);
  MatchDoc {
    id,
    progress_level: ProgressLevel::CheckIn,
    status: MatchStatus::InProgress,
    meta,
    players: [
      PlayerState::new(Slot::One, player_names[0]),
      PlayerState::new(Slot::Two, player_names[1]),
    ],
    mappool: charts.iter().map(PoolEntry::from_chart).collect(),
    ban_phase: BanPhase {
      total_bans,
      ..BanPhase::default()
    },
    current_picker_slot: None,
    current_chart: None,
    feed: Vec::new(),
  }
}

pub fn push_feed(doc: &mut MatchDoc, kind: &str, message: String, data: Value, now_ms: u64) {
  doc.feed.push(FeedEntry {
    kind: kind.to_string(),
    timestamp: now_ms,
    message,
    data,
  });
}

// ── Queries ────────────────────────────────────────────────────────────

/// Charts still eligible to ban or pick: neither banned nor played.
pub fn current_pool(doc: &MatchDoc) -> Vec<&PoolEntry> {
  doc
    .mappool
    .iter()
    .filter(|entry| !entry.status.banned && !entry.status.played)
    .collect()
}

pub fn points(doc: &MatchDoc) -> [u8; 2] {
  [doc.players[0].points, doc.players[1].points]
}

pub fn chart_is_live(doc: &MatchDoc) -> bool {
  doc.progress_level == ProgressLevel::Playing
    && doc.current_chart.is_some()
    && doc.players.iter().all(|p| p.ready)
}

fn first_picker_after_bans(doc: &MatchDoc) -> Slot {
  let first_banner = doc.ban_phase.ban_order.first().copied().unwrap_or(Slot::One);
  match doc.meta.first_pick {
    FirstPickPolicy::FirstBanner => first_banner,
    FirstPickPolicy::SecondBanner => first_banner.other(),
    FirstPickPolicy::CoinFlipWinner => doc.meta.coin_flip_winner.unwrap_or(first_banner),
    FirstPickPolicy::Player1 => Slot::One,
  }
}

fn name_of(doc: &MatchDoc, slot: Slot) -> String {
  doc.player(slot).display_name.clone()
}

// ── Transitions ────────────────────────────────────────────────────────

/// Leave check-in. With bans left to make, `first` opens the ban order;
/// otherwise `first` is the first picker.
pub fn begin_draft(doc: &mut MatchDoc, first: Slot, now_ms: u64) -> MatchResult<Vec<DraftEvent>> {
  if doc.progress_level != ProgressLevel::CheckIn {
    return Err(MatchError::validation("The draft has already started."));
  }
  validate_format(doc.meta.best_of, doc.mappool.len())?;

  let mut events = Vec::new();
  let total_bans = total_bans_for(doc.mappool.len(), doc.meta.best_of, doc.meta.has_bans);
  if total_bans > 0 {
    let order = compute_ban_order(first, total_bans);
    doc.progress_level = ProgressLevel::BanPhase;
    doc.ban_phase = BanPhase {
      ban_order: order.clone(),
      current_banner: Some(first),
      bans_completed: 0,
      total_bans,
    };
    let message = format!("{} bans first", name_of(doc, first));
    push_feed(
      doc,
      "banOrderDecided",
      message,
      json!({ "banOrder": order }),
      now_ms,
    );
    events.push(DraftEvent::BanOrderDecided { first_banner: first, order });
  } else {
    doc.ban_phase.total_bans = 0;
    enter_pick_phase(doc, first, now_ms, &mut events);
  }
  Ok(events)
}

fn enter_pick_phase(doc: &mut MatchDoc, picker: Slot, now_ms: u64, events: &mut Vec<DraftEvent>) {
  doc.ban_phase.current_banner = None;
  let remaining: Vec<String> = current_pool(doc).iter().map(|e| e.csv_name.clone()).collect();
  if remaining.len() == 1 {
    let chart = remaining[0].clone();
    select_chart(doc, &chart, now_ms);
    push_feed(
      doc,
      "autoPick",
      format!("{chart} is the only chart left"),
      json!({ "chart": chart }),
      now_ms,
    );
    events.push(DraftEvent::AutoPick { chart });
    return;
  }
  doc.progress_level = ProgressLevel::PickingPostResult;
  doc.current_picker_slot = Some(picker);
  let message = format!("{} picks next", name_of(doc, picker));
  push_feed(
    doc,
    "pickPhaseStart",
    message,
    json!({ "picker": picker }),
    now_ms,
  );
  events.push(DraftEvent::PickPhaseStart { picker });
}

fn select_chart(doc: &mut MatchDoc, chart: &str, _now_ms: u64) {
  if let Some(entry) = doc.chart_mut(chart) {
    entry.status.is_being_played = true;
  }
  doc.progress_level = ProgressLevel::Playing;
  doc.current_picker_slot = None;
  doc.current_chart = Some(chart.to_string());
  for player in doc.players.iter_mut() {
    player.ready = false;
  }
}

fn eligible_chart(doc: &MatchDoc, chart: &str) -> MatchResult<()> {
  let entry = doc
    .chart(chart)
    .ok_or_else(|| MatchError::not_found(format!("Chart \"{chart}\" is not in this pool.")))?;
  if entry.status.banned || entry.status.played {
    return Err(MatchError::validation(format!("\"{chart}\" has already been banned or played.")));
  }
  Ok(())
}

pub fn apply_ban(doc: &mut MatchDoc, slot: Slot, chart: &str, now_ms: u64) -> MatchResult<Vec<DraftEvent>> {
  if doc.progress_level != ProgressLevel::BanPhase {
    return Err(MatchError::validation("Bans are not open right now."));
  }
  if doc.ban_phase.current_banner != Some(slot) {
    return Err(MatchError::validation("It's not your turn to ban!"));
  }
  eligible_chart(doc, chart)?;

  if let Some(entry) = doc.chart_mut(chart) {
    entry.status.banned = true;
    entry.status.banned_by = Some(slot);
    entry.status.banned_at = Some(now_ms);
    entry.status.in_current_pool = false;
  }
  doc.ban_phase.bans_completed += 1;
  let next_banner = doc.ban_phase.ban_order.get(doc.ban_phase.bans_completed).copied();
  doc.ban_phase.current_banner = next_banner;
  let message = format!("{} banned {chart}", name_of(doc, slot));
  push_feed(
    doc,
    "ban",
    message,
    json!({ "chart": chart, "by": slot }),
    now_ms,
  );

  let mut events = vec![DraftEvent::Ban {
    chart: chart.to_string(),
    by: slot,
    next_banner,
  }];
  if doc.ban_phase.bans_completed >= doc.ban_phase.total_bans {
    let picker = first_picker_after_bans(doc);
    enter_pick_phase(doc, picker, now_ms, &mut events);
  }
  Ok(events)
}

pub fn apply_pick(doc: &mut MatchDoc, slot: Slot, chart: &str, now_ms: u64) -> MatchResult<Vec<DraftEvent>> {
  if doc.progress_level != ProgressLevel::PickingPostResult {
    return Err(MatchError::validation("Picks are not open right now."));
  }
  if doc.current_picker_slot != Some(slot) {
    return Err(MatchError::validation("It's not your turn to pick!"));
  }
  eligible_chart(doc, chart)?;

  select_chart(doc, chart, now_ms);
  let message = format!("{} picked {chart}", name_of(doc, slot));
  push_feed(
    doc,
    "pick",
    message,
    json!({ "chart": chart, "by": slot }),
    now_ms,
  );
  Ok(vec![DraftEvent::Pick {
    chart: chart.to_string(),
    by: slot,
  }])
}

pub fn apply_ready(doc: &mut MatchDoc, slot: Slot, now_ms: u64) -> MatchResult<Vec<DraftEvent>> {
  let chart = match (&doc.progress_level, &doc.current_chart) {
    (ProgressLevel::Playing, Some(chart)) => chart.clone(),
    _ => return Err(MatchError::validation("There is no chart waiting for a ready check.")),
  };
  if doc.player(slot).ready {
    return Err(MatchError::validation("You're already ready!"));
  }

  doc.player_mut(slot).ready = true;
  let ready = [doc.players[0].ready, doc.players[1].ready];
  let message = format!("{} is ready", name_of(doc, slot));
  push_feed(
    doc,
    "playerReady",
    message,
    json!({ "slot": slot }),
    now_ms,
  );

  let mut events = vec![DraftEvent::PlayerReady { slot, ready }];
  if ready[0] && ready[1] {
    push_feed(
      doc,
      "chartStart",
      format!("{chart} is live"),
      json!({ "chart": chart }),
      now_ms,
    );
    events.push(DraftEvent::ChartStart { chart });
  }
  Ok(events)
}

pub fn apply_result(doc: &mut MatchDoc, input: &ResultInput, now_ms: u64) -> MatchResult<Vec<DraftEvent>> {
  let chart = match (&doc.progress_level, &doc.current_chart) {
    (ProgressLevel::Playing, Some(chart)) => chart.clone(),
    _ => return Err(MatchError::validation("No chart is being played.")),
  };
  if !chart_is_live(doc) {
    return Err(MatchError::validation("Both players must be ready before a result is submitted."));
  }
  if input.score1 == input.score2 {
    return Err(MatchError::validation("Scores are tied; re-check and submit the correct scores."));
  }
  if (input.pfc1 && !input.fc1) || (input.pfc2 && !input.fc2) {
    return Err(MatchError::validation("A perfect full combo must also be marked as a full combo."));
  }

  let winner = if input.score1 > input.score2 { Slot::One } else { Slot::Two };
  let result = ChartResult {
    score1: input.score1,
    score2: input.score2,
    fc1: input.fc1,
    fc2: input.fc2,
    pfc1: input.pfc1,
    pfc2: input.pfc2,
    winner_slot: winner,
  };
  if let Some(entry) = doc.chart_mut(&chart) {
    entry.status.played = true;
    entry.status.played_at = Some(now_ms);
    entry.status.is_being_played = false;
    entry.status.in_current_pool = false;
    entry.result = Some(result.clone());
  }
  doc.current_chart = None;
  doc.player_mut(winner).points += 1;
  for player in doc.players.iter_mut() {
    player.ready = false;
  }
  let score = points(doc);
  let message = format!("{} won {chart} ({}-{})", name_of(doc, winner), score[0], score[1]);
  push_feed(
    doc,
    "chartResult",
    message,
    json!({ "chart": chart, "result": result }),
    now_ms,
  );

  let finished = doc.player(winner).points >= doc.meta.wins_needed;
  let next_picker = if finished { None } else { Some(winner.other()) };
  let mut events = vec![DraftEvent::ChartResult {
    chart,
    result,
    points: score,
    next_picker,
  }];
  match next_picker {
    None => events.push(finish(doc, Some(winner), now_ms)),
    Some(loser) => enter_pick_phase(doc, loser, now_ms, &mut events),
  }
  Ok(events)
}

/// Operator stop. Records no winner whatever the score.
pub fn force_end(doc: &mut MatchDoc, now_ms: u64) -> Vec<DraftEvent> {
  for entry in doc.mappool.iter_mut() {
    entry.status.is_being_played = false;
  }
  doc.current_chart = None;
  vec![finish(doc, None, now_ms)]
}

fn finish(doc: &mut MatchDoc, winner: Option<Slot>, now_ms: u64) -> DraftEvent {
  doc.progress_level = ProgressLevel::Finished;
  doc.status = MatchStatus::Completed;
  doc.meta.completed_at = Some(now_ms);
  doc.current_picker_slot = None;
  doc.ban_phase.current_banner = None;
  if let Some(slot) = winner {
    doc.player_mut(slot).winner = true;
  }
  let score = points(doc);
  let message = match winner {
    Some(slot) => format!("{} wins {}-{}", name_of(doc, slot), score[0], score[1]),
    None => "Match ended by a referee".to_string(),
  };
  push_feed(doc, "end", message, json!({ "winner": winner, "points": score }), now_ms);
  DraftEvent::End { winner, points: score }
}

// ── Consistency ────────────────────────────────────────────────────────

/// Structural checks every durable document must pass.
pub fn check_invariants(doc: &MatchDoc) -> Result<(), String> {
  for entry in &doc.mappool {
    let s = &entry.status;
    if s.banned && s.played {
      return Err(format!("{} is both banned and played", entry.csv_name));
    }
    if s.in_current_pool != (!s.banned && !s.played) {
      return Err(format!("{} has an inconsistent pool flag", entry.csv_name));
    }
    if s.is_being_played && !s.in_current_pool {
      return Err(format!("{} is being played outside the pool", entry.csv_name));
    }
  }

  let live: Vec<&PoolEntry> = doc.mappool.iter().filter(|e| e.status.is_being_played).collect();
  match doc.progress_level {
    ProgressLevel::Playing => {
      let current = doc.current_chart.as_deref().ok_or("playing without a current chart")?;
      if live.len() != 1 || live[0].csv_name != current {
        return Err(format!("current chart {current} is not the one being played"));
      }
    }
    _ => {
      if !live.is_empty() || doc.current_chart.is_some() {
        return Err("a chart is marked live outside the playing phase".to_string());
      }
    }
  }

  let picking = doc.progress_level == ProgressLevel::PickingPostResult;
  if picking != doc.current_picker_slot.is_some() {
    return Err("current picker does not match the progress level".to_string());
  }
  if doc.ban_phase.bans_completed > doc.ban_phase.total_bans {
    return Err("more bans recorded than allowed".to_string());
  }
  let banned = doc.mappool.iter().filter(|e| e.status.banned).count();
  if banned != doc.ban_phase.bans_completed {
    return Err(format!("{banned} charts banned but {} bans recorded", doc.ban_phase.bans_completed));
  }
  if doc.meta.wins_needed != wins_needed(doc.meta.best_of) {
    return Err("wins needed does not match best-of".to_string());
  }
  if doc.players.iter().any(|p| p.points > doc.meta.wins_needed) {
    return Err("a player has more points than wins needed".to_string());
  }
  Ok(())
}
