use crate::config::{normalize_key, read_json_file, resolve_repo_path};
use serde::{Deserialize, Serialize};
use tracing::info;

/// (bracket, round, best of, tier)
const BUILTIN_ROUNDS: &[(&str, &str, u8, u8)] = &[
    ("Qualifiers", "Winners 1", 3, 1),
    ("Qualifiers", "Winners 2", 3, 2),
    ("Qualifiers", "Losers 1", 3, 1),
    ("Qualifiers", "Losers 2", 3, 2),
    ("Qualifiers", "Finals", 3, 2),
    ("Qualifiers", "Finals (Reset)", 3, 2),
    ("Challenger", "Winners 1", 5, 2),
    ("Challenger", "Winners 2", 7, 3),
    ("Challenger", "Winners Finals", 9, 3),
    ("Challenger", "Losers 1", 5, 2),
    ("Challenger", "Losers 2", 5, 3),
    ("Challenger", "Losers 3", 7, 3),
    ("Challenger", "Losers Finals", 7, 3),
    ("Challenger", "Grand Finals", 9, 3),
    ("Challenger", "Grand Finals (Reset)", 9, 3),
    ("Elite", "Winners 1", 5, 3),
    ("Elite", "Winners 2", 7, 4),
    ("Elite", "Winners Finals", 9, 4),
    ("Elite", "Losers 1", 5, 3),
    ("Elite", "Losers 2", 5, 4),
    ("Elite", "Losers 3", 7, 4),
    ("Elite", "Losers Finals", 7, 4),
    ("Elite", "Grand Finals", 9, 4),
    ("Elite", "Grand Finals (Reset)", 9, 4),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundInfo {
    pub name: String,
    pub bracket: String,
    pub round: String,
    pub best_of: u8,
    pub tier: u8,
    #[serde(default = "default_bans")]
    pub bans: bool,
}

fn default_bans() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct RoundTable {
    rounds: Vec<RoundInfo>,
}

impl RoundTable {
    pub fn builtin() -> Self {
        let rounds = BUILTIN_ROUNDS
            .iter()
            .map(|(bracket, round, best_of, tier)| RoundInfo {
                name: format!("{bracket} – {round}"),
                bracket: bracket.to_string(),
                round: round.to_string(),
                best_of: *best_of,
                tier: *tier,
                bans: true,
            })
            .collect();
        RoundTable { rounds }
    }

    pub fn from_rounds(rounds: Vec<RoundInfo>) -> Result<Self, String> {
        for round in &rounds {
            if round.best_of == 0 || round.best_of % 2 == 0 {
                return Err(format!("Round {} must have an odd best-of.", round.name));
            }
        }
        Ok(RoundTable { rounds })
    }

    /// Load `rounds.json` when present, otherwise the built-in table.
    pub fn load(raw_path: &str) -> Result<Self, String> {
        let path = resolve_repo_path(raw_path);
        match read_json_file::<Vec<RoundInfo>>(&path)? {
            Some(rounds) => {
                info!("loaded {} rounds from {}", rounds.len(), path.display());
                Self::from_rounds(rounds)
            }
            None => Ok(Self::builtin()),
        }
    }

    pub fn find(&self, name: &str) -> Option<&RoundInfo> {
        let key = normalize_key(name);
        self.rounds.iter().find(|round| normalize_key(&round.name) == key)
    }

    pub fn rounds(&self) -> &[RoundInfo] {
        &self.rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup_is_case_insensitive() {
        let table = RoundTable::builtin();
        let round = table.find("elite – grand finals").unwrap();
        assert_eq!(round.best_of, 9);
        assert_eq!(round.tier, 4);
        assert_eq!(round.bracket, "Elite");
        assert_eq!(round.round, "Grand Finals");
    }

    #[test]
    fn test_unknown_round_is_none() {
        assert!(RoundTable::builtin().find("Pools – Winners 9").is_none());
    }

    #[test]
    fn test_even_best_of_is_rejected() {
        let rounds = vec![RoundInfo {
            name: "Odd One".to_string(),
            bracket: "Test".to_string(),
            round: "Odd One".to_string(),
            best_of: 4,
            tier: 1,
            bans: true,
        }];
        assert!(RoundTable::from_rounds(rounds).is_err());
    }
}
