use crate::config::{read_json_file, resolve_repo_path};
use crate::error::{MatchError, MatchResult};
use crate::rng::DraftRng;
use crate::types::ChartRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Tier number (1-based) to the charts of that tier, easiest first.
pub type TierCatalogs = BTreeMap<u8, Vec<ChartRef>>;

// ── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketConfig {
  pub name: String,
  pub rounds: Vec<RoundPoolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundPoolConfig {
  pub name: String,
  pub tier: u8,
  pub matches: usize,
  pub charts: usize,
  #[serde(default)]
  pub hardest_only: bool,
}

/// One chart row of the catalog file, before it gets an index.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogChart {
  name: String,
  external_id: Option<u64>,
  title: Option<String>,
  artist: Option<String>,
  charter: Option<String>,
  cover: Option<String>,
  thumbnail_url: Option<String>,
  difficulty: Option<u32>,
  #[serde(default)]
  tags: Vec<String>,
}

// ── Output ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedMatch {
  pub charts: Vec<ChartRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedRound {
  pub name: String,
  pub matches: Vec<GeneratedMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedBracket {
  pub name: String,
  pub rounds: Vec<GeneratedRound>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedPools {
  pub event_id: u64,
  pub seed: u64,
  pub generated_at: u64,
  pub brackets: Vec<GeneratedBracket>,
}

impl GeneratedPools {
  /// Charts for one match. `match_number` is 1-based.
  pub fn match_pool(&self, bracket: &str, round: &str, match_number: u32) -> MatchResult<&[ChartRef]> {
    let found_bracket = self
      .brackets
      .iter()
      .find(|b| b.name == bracket)
      .ok_or_else(|| MatchError::not_found(format!("Bracket \"{bracket}\" not found.")))?;
    let found_round = found_bracket
      .rounds
      .iter()
      .find(|r| r.name == round)
      .ok_or_else(|| MatchError::not_found(format!("Round \"{round}\" not found in bracket \"{bracket}\".")))?;
    let count = found_round.matches.len();
    if match_number == 0 || match_number as usize > count {
      return Err(MatchError::not_found(format!(
        "Match {match_number} out of range ({count} matches in this round)."
      )));
    }
    Ok(&found_round.matches[match_number as usize - 1].charts)
  }
}

// ── Generation ─────────────────────────────────────────────────────────

/// Draws charts from a tier without replacement. The bag refills only once
/// every chart in the tier has been drawn.
struct ChartBag<'a> {
  charts: &'a [ChartRef],
  remaining: Vec<usize>,
}

impl<'a> ChartBag<'a> {
  fn new(charts: &'a [ChartRef]) -> Self {
    ChartBag {
      charts,
      remaining: (0..charts.len()).collect(),
    }
  }

  fn draw(&mut self, count: usize, rng: &mut DraftRng) -> Vec<ChartRef> {
    let mut picked: Vec<usize> = Vec::with_capacity(count);
    while picked.len() < count {
      let slot = rng.gen_index(self.remaining.len());
      let chart = self.remaining[slot];
      if picked.contains(&chart) {
        continue;
      }
      self.remaining.swap_remove(slot);
      if self.remaining.is_empty() {
        self.remaining = (0..self.charts.len()).collect();
      }
      picked.push(chart);
    }
    let mut charts: Vec<ChartRef> = picked.into_iter().map(|i| self.charts[i].clone()).collect();
    charts.sort_by_key(|chart| chart.index);
    charts
  }
}

/// Top `count` charts by difficulty (catalog index breaks ties and stands in
/// for a missing difficulty), returned in catalog order.
pub fn hardest_charts(charts: &[ChartRef], count: usize) -> Vec<ChartRef> {
  let mut ranked: Vec<&ChartRef> = charts.iter().collect();
  ranked.sort_by(|a, b| {
    let key_a = (a.difficulty.unwrap_or(0), a.index);
    let key_b = (b.difficulty.unwrap_or(0), b.index);
    key_b.cmp(&key_a)
  });
  let mut top: Vec<ChartRef> = ranked.into_iter().take(count).cloned().collect();
  top.sort_by_key(|chart| chart.index);
  top
}

/// Fisher-Yates over `items[2..]`; the first two entries keep their place.
pub fn shuffle_after_lead_in<T>(items: &mut [T], rng: &mut DraftRng) {
  let len = items.len();
  if len < 4 {
    return;
  }
  for i in (3..len).rev() {
    let j = 2 + rng.gen_index(i - 1);
    items.swap(i, j);
  }
}

pub fn generate_pools(
  catalogs: &TierCatalogs,
  brackets: &[BracketConfig],
  rng: &mut DraftRng,
) -> MatchResult<Vec<GeneratedBracket>> {
  let mut result = Vec::with_capacity(brackets.len());

  for bracket in brackets {
    let mut rounds = Vec::with_capacity(bracket.rounds.len());
    for round in &bracket.rounds {
      let charts = catalogs
        .get(&round.tier)
        .filter(|charts| !charts.is_empty())
        .ok_or_else(|| {
          MatchError::Config(format!(
            "No charts found for tier {} ({} – {}).",
            round.tier, bracket.name, round.name
          ))
        })?;
      if round.charts == 0 || round.charts > charts.len() {
        return Err(MatchError::Config(format!(
          "{} – {} needs {} charts per match but tier {} has {}.",
          bracket.name,
          round.name,
          round.charts,
          round.tier,
          charts.len()
        )));
      }

      let mut bag = ChartBag::new(charts);
      let mut matches: Vec<GeneratedMatch> = (0..round.matches)
        .map(|_| {
          let charts = if round.hardest_only {
            hardest_charts(charts, round.charts)
          } else {
            bag.draw(round.charts, rng)
          };
          GeneratedMatch { charts }
        })
        .collect();
      shuffle_after_lead_in(&mut matches, rng);
      rounds.push(GeneratedRound {
        name: round.name.clone(),
        matches,
      });
    }
    result.push(GeneratedBracket {
      name: bracket.name.clone(),
      rounds,
    });
  }

  Ok(result)
}

// ── Loading ────────────────────────────────────────────────────────────

pub fn parse_tier_catalogs(data: &str) -> Result<TierCatalogs, String> {
  let raw = serde_json::from_str::<BTreeMap<String, Vec<CatalogChart>>>(data)
    .map_err(|e| format!("parse tier catalogs: {e}"))?;
  let mut catalogs = TierCatalogs::new();
  for (key, rows) in raw {
    let tier = key
      .trim()
      .parse::<u8>()
      .map_err(|_| format!("Tier key \"{key}\" is not a number."))?;
    let mut seen = HashSet::new();
    let mut charts = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
      let name = row.name.trim().to_string();
      if name.is_empty() {
        return Err(format!("Tier {tier} chart {index} has no name."));
      }
      if !seen.insert(name.clone()) {
        return Err(format!("Tier {tier} lists \"{name}\" twice."));
      }
      charts.push(ChartRef {
        index,
        csv_name: name,
        external_chart_id: row.external_id,
        title: row.title,
        artist: row.artist,
        charter: row.charter,
        cover: row.cover,
        thumbnail_url: row.thumbnail_url,
        difficulty: row.difficulty,
        tags: row.tags,
      });
    }
    catalogs.insert(tier, charts);
  }
  Ok(catalogs)
}

pub fn load_tier_catalogs(raw_path: &str) -> Result<TierCatalogs, String> {
  let path = resolve_repo_path(raw_path);
  let data = std::fs::read_to_string(&path).map_err(|e| format!("read tier catalogs {}: {e}", path.display()))?;
  parse_tier_catalogs(&data)
}

pub fn load_bracket_configs(raw_path: &str) -> Result<Vec<BracketConfig>, String> {
  let path = resolve_repo_path(raw_path);
  read_json_file::<Vec<BracketConfig>>(&path)?
    .ok_or_else(|| format!("bracket config {} not found", path.display()))
}
