use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::orchestrator::Orchestrator;

// ── Constants ──────────────────────────────────────────────────────────

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8081";
pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_DRAFT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_STALL_SWEEP_MS: u64 = 1000;
pub const DEFAULT_BROADCAST_CAPACITY: usize = 64;
pub const FRIENDLIES_EVENT_NAME: &str = "Friendlies";
pub const FRIENDLY_BANS_PER_PLAYER: usize = 1;
pub const MAX_BEST_OF: u8 = 9;

// ── Shared state type aliases ──────────────────────────────────────────

pub type SharedOrchestrator = Arc<Mutex<Orchestrator>>;

// ── Players and slots ──────────────────────────────────────────────────

/// One of the two player positions in a match. Serialized as `1` or `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Slot {
    One,
    Two,
}

impl Slot {
    pub const BOTH: [Slot; 2] = [Slot::One, Slot::Two];

    pub fn index(self) -> usize {
        match self {
            Slot::One => 0,
            Slot::Two => 1,
        }
    }

    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }

    pub fn other(self) -> Slot {
        match self {
            Slot::One => Slot::Two,
            Slot::Two => Slot::One,
        }
    }
}

impl From<Slot> for u8 {
    fn from(slot: Slot) -> u8 {
        slot.number()
    }
}

impl TryFrom<u8> for Slot {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Slot::One),
            2 => Ok(Slot::Two),
            other => Err(format!("Slot must be 1 or 2, got {other}.")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub slot: Slot,
    pub display_name: String,
    pub external_id: Option<String>,
    pub points: u8,
    pub ready: bool,
    pub winner: bool,
}

impl PlayerState {
    pub fn new(slot: Slot, display_name: &str) -> Self {
        PlayerState {
            slot,
            display_name: display_name.trim().to_string(),
            external_id: None,
            points: 0,
            ready: false,
            winner: false,
        }
    }
}

// ── Match lifecycle enums ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressLevel {
    CheckIn,
    BanPhase,
    PickingPostResult,
    Playing,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    InProgress,
    Completed,
    Restarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Ranked,
    Friendly,
}

impl MatchKind {
    /// Broadcast event prefix for this flow.
    pub fn event_prefix(self) -> &'static str {
        match self {
            MatchKind::Ranked => "match",
            MatchKind::Friendly => "friendly",
        }
    }
}

/// Who picks the first chart once the ban phase is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FirstPickPolicy {
    FirstBanner,
    SecondBanner,
    CoinFlipWinner,
    Player1,
}

// ── Charts ─────────────────────────────────────────────────────────────

/// A chart from a tier catalog. `index` is the chart's position in its
/// catalog, which is ordered from easiest to hardest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartRef {
    pub index: usize,
    pub csv_name: String,
    pub external_chart_id: Option<u64>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub charter: Option<String>,
    pub cover: Option<String>,
    pub thumbnail_url: Option<String>,
    pub difficulty: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ChartRef {
    pub fn display_name(&self) -> String {
        match (&self.title, &self.charter) {
            (Some(title), Some(charter)) => format!("{title} ({charter})"),
            (Some(title), None) => title.clone(),
            _ => self.csv_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartStatus {
    pub banned: bool,
    pub banned_by: Option<Slot>,
    pub banned_at: Option<u64>,
    pub played: bool,
    pub played_at: Option<u64>,
    pub in_current_pool: bool,
    pub is_being_played: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartResult {
    pub score1: u64,
    pub score2: u64,
    pub fc1: bool,
    pub fc2: bool,
    pub pfc1: bool,
    pub pfc2: bool,
    pub winner_slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntry {
    pub csv_name: String,
    pub external_chart_id: Option<u64>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub charter: Option<String>,
    pub cover: Option<String>,
    pub thumbnail_url: Option<String>,
    pub difficulty: Option<u32>,
    pub tags: Vec<String>,
    pub display_name: String,
    pub status: ChartStatus,
    pub result: Option<ChartResult>,
}

impl PoolEntry {
    pub fn from_chart(chart: &ChartRef) -> Self {
        PoolEntry {
            csv_name: chart.csv_name.clone(),
            external_chart_id: chart.external_chart_id,
            title: chart.title.clone(),
            artist: chart.artist.clone(),
            charter: chart.charter.clone(),
            cover: chart.cover.clone(),
            thumbnail_url: chart.thumbnail_url.clone(),
            difficulty: chart.difficulty,
            tags: chart.tags.clone(),
            display_name: chart.display_name(),
            status: ChartStatus {
                in_current_pool: true,
                ..ChartStatus::default()
            },
            result: None,
        }
    }

    /// Strip draft state, keeping the chart itself. Used when a match is restarted.
    pub fn to_chart(&self, index: usize) -> ChartRef {
        ChartRef {
            index,
            csv_name: self.csv_name.clone(),
            external_chart_id: self.external_chart_id,
            title: self.title.clone(),
            artist: self.artist.clone(),
            charter: self.charter.clone(),
            cover: self.cover.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
            difficulty: self.difficulty,
            tags: self.tags.clone(),
        }
    }
}

// ── Match document ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanPhase {
    pub ban_order: Vec<Slot>,
    pub current_banner: Option<Slot>,
    pub bans_completed: usize,
    pub total_bans: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: u64,
    pub message: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchMeta {
    pub kind: MatchKind,
    pub event_id: u64,
    pub bracket: Option<String>,
    pub round: String,
    pub match_number: u32,
    pub best_of: u8,
    pub wins_needed: u8,
    pub tier: Option<u8>,
    pub has_bans: bool,
    pub first_pick: FirstPickPolicy,
    pub coin_flip_winner: Option<Slot>,
    pub channel_ref: String,
    pub initiator: String,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    pub restarted_from: Option<u64>,
}

/// The durable match record. Everything the overlay and resume path need
/// lives here; serialization order is fixed so re-persisting an unchanged
/// document yields the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchDoc {
    pub id: u64,
    pub progress_level: ProgressLevel,
    pub status: MatchStatus,
    pub meta: MatchMeta,
    pub players: [PlayerState; 2],
    pub mappool: Vec<PoolEntry>,
    pub ban_phase: BanPhase,
    pub current_picker_slot: Option<Slot>,
    pub current_chart: Option<String>,
    pub feed: Vec<FeedEntry>,
}

impl MatchDoc {
    pub fn player(&self, slot: Slot) -> &PlayerState {
        &self.players[slot.index()]
    }

    pub fn player_mut(&mut self, slot: Slot) -> &mut PlayerState {
        &mut self.players[slot.index()]
    }

    pub fn chart(&self, csv_name: &str) -> Option<&PoolEntry> {
        self.mappool.iter().find(|entry| entry.csv_name == csv_name)
    }

    pub fn chart_mut(&mut self, csv_name: &str) -> Option<&mut PoolEntry> {
        self.mappool.iter_mut().find(|entry| entry.csv_name == csv_name)
    }

    pub fn winner(&self) -> Option<Slot> {
        Slot::BOTH.into_iter().find(|slot| self.player(*slot).winner)
    }

    pub fn slot_of_player(&self, player_id: &str) -> Option<Slot> {
        Slot::BOTH
            .into_iter()
            .find(|slot| self.player(*slot).external_id.as_deref() == Some(player_id))
    }

    pub fn is_live(&self) -> bool {
        self.status == MatchStatus::InProgress
    }
}

// ── Events ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: u64,
    pub name: String,
    pub created_at: u64,
    pub active: bool,
    #[serde(default)]
    pub friendly: bool,
}

// ── App config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub data_dir: String,
    pub http_addr: String,
    pub overlay_dir: String,
    pub brackets_path: String,
    pub rounds_path: String,
    pub catalog_path: String,
    pub approval_timeout_secs: u64,
    pub draft_timeout_secs: u64,
    pub stall_sweep_ms: u64,
    pub broadcast_capacity: usize,
    pub pool_seed: Option<u64>,
    pub ranked_first_pick: FirstPickPolicy,
    pub friendly_first_pick: FirstPickPolicy,
    pub friendly_first_banner: Slot,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            http_addr: String::new(),
            overlay_dir: String::new(),
            brackets_path: "Brackets.json".to_string(),
            rounds_path: "rounds.json".to_string(),
            catalog_path: "catalog.json".to_string(),
            approval_timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
            draft_timeout_secs: DEFAULT_DRAFT_TIMEOUT_SECS,
            stall_sweep_ms: DEFAULT_STALL_SWEEP_MS,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            pool_seed: None,
            ranked_first_pick: FirstPickPolicy::SecondBanner,
            friendly_first_pick: FirstPickPolicy::Player1,
            friendly_first_banner: Slot::One,
        }
    }
}
