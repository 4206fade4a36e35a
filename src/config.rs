use crate::types::*;
use serde::de::DeserializeOwned;
use std::{
    env,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

pub fn repo_root() -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

pub fn resolve_repo_path(raw: &str) -> PathBuf {
  let path = PathBuf::from(raw);
  if path.is_absolute() {
    path
  } else {
    repo_root().join(path)
  }
}

pub fn config_path() -> PathBuf {
  repo_root().join("config.json")
}

pub fn env_default(key: &str) -> Option<String> {
  env::var(key)
    .ok()
    .map(|value| value.trim().to_string())
    .filter(|value| !value.is_empty())
}

pub fn apply_env_defaults(mut config: AppConfig) -> AppConfig {
  if config.data_dir.trim().is_empty() {
    config.data_dir = env_default("DATA_DIR").unwrap_or_else(|| "data".to_string());
  }
  if config.http_addr.trim().is_empty() {
    config.http_addr = env_default("HTTP_ADDR").unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());
  }
  if config.overlay_dir.trim().is_empty() {
    config.overlay_dir = env_default("OVERLAY_DIR").unwrap_or_else(|| "overlay".to_string());
  }
  if let Some(value) = env_default("BRACKETS_PATH") {
    config.brackets_path = value;
  }
  if let Some(value) = env_default("CATALOG_PATH") {
    config.catalog_path = value;
  }
  if config.pool_seed.is_none() {
    config.pool_seed = env_default("POOL_SEED").and_then(|value| value.parse::<u64>().ok());
  }
  config
}

/// `config.json` at the repo root, then env fallbacks for anything left blank.
pub fn load_config_inner() -> Result<AppConfig, String> {
  let config = read_json_file::<AppConfig>(&config_path())?.unwrap_or_default();
  Ok(apply_env_defaults(config))
}

/// Read a JSON file, returning `None` when it does not exist.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, String> {
  if !path.is_file() {
    return Ok(None);
  }
  let data = fs::read_to_string(path).map_err(|e| format!("read {}: {e}", path.display()))?;
  let value = serde_json::from_str::<T>(&data).map_err(|e| format!("parse {}: {e}", path.display()))?;
  Ok(Some(value))
}

/// Export `.env` entries that the real environment does not already set.
/// Returns how many were applied.
pub fn load_env_file() -> usize {
  let Ok(contents) = fs::read_to_string(repo_root().join(".env")) else {
    return 0;
  };
  let mut applied = 0;
  for (key, value) in contents.lines().filter_map(parse_env_line) {
    if env::var_os(&key).is_some() {
      continue;
    }
    env::set_var(key, value);
    applied += 1;
  }
  applied
}

fn unquote(value: &str) -> &str {
  for quote in ['"', '\''] {
    if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
      return &value[1..value.len() - 1];
    }
  }
  match value.split_once('#') {
    Some((before, _)) => before.trim_end(),
    None => value,
  }
}

/// `KEY=value`, with an optional `export ` prefix, quotes, and trailing comments.
pub fn parse_env_line(line: &str) -> Option<(String, String)> {
  let line = line.trim();
  if line.is_empty() || line.starts_with('#') {
    return None;
  }
  let line = line.strip_prefix("export ").unwrap_or(line);
  let (key, value) = line.split_once('=')?;
  let key = key.trim();
  if key.is_empty() {
    return None;
  }
  Some((key.to_string(), unquote(value.trim()).to_string()))
}

pub fn now_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64
}

pub fn data_dir_path(config: &AppConfig) -> PathBuf {
  resolve_repo_path(&config.data_dir)
}

pub fn logs_dir() -> PathBuf {
  repo_root().join("logs")
}

pub fn log_env_warnings(config: &AppConfig) {
  let mut warnings = Vec::new();

  if !resolve_repo_path(&config.brackets_path).is_file() {
    warnings.push(format!("{} not found; pool generation will fail", config.brackets_path));
  }
  if !resolve_repo_path(&config.catalog_path).is_file() {
    warnings.push(format!("{} not found; tier catalogs must be loaded before generating pools", config.catalog_path));
  }
  if !resolve_repo_path(&config.overlay_dir).is_dir() {
    warnings.push(format!("overlay dir {} not found; only /state and /ws will be served", config.overlay_dir));
  }
  if config.approval_timeout_secs == 0 || config.draft_timeout_secs == 0 {
    warnings.push("a zero input timeout stalls every window immediately".to_string());
  }

  for warning in &warnings {
    tracing::warn!("{warning}");
  }
}

/// Case-insensitive key for event and round names.
pub fn normalize_key(raw: &str) -> String {
  raw.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_env_line_strips_quotes_and_export() {
    assert_eq!(
      parse_env_line("export HTTP_ADDR=\"0.0.0.0:9000\""),
      Some(("HTTP_ADDR".to_string(), "0.0.0.0:9000".to_string()))
    );
    assert_eq!(
      parse_env_line("DATA_DIR='state dir'"),
      Some(("DATA_DIR".to_string(), "state dir".to_string()))
    );
  }

  #[test]
  fn test_parse_env_line_drops_comments() {
    assert_eq!(parse_env_line("# a comment"), None);
    assert_eq!(parse_env_line("   "), None);
    assert_eq!(
      parse_env_line("POOL_SEED=1234 # fixed for finals"),
      Some(("POOL_SEED".to_string(), "1234".to_string()))
    );
    assert_eq!(parse_env_line("=value"), None);
  }

  #[test]
  fn test_partial_config_falls_back_to_defaults() {
    let config: AppConfig = serde_json::from_str(r#"{ "draftTimeoutSecs": 60 }"#).unwrap();
    assert_eq!(config.draft_timeout_secs, 60);
    assert_eq!(config.approval_timeout_secs, DEFAULT_APPROVAL_TIMEOUT_SECS);
    assert_eq!(config.ranked_first_pick, FirstPickPolicy::SecondBanner);
    assert_eq!(config.friendly_first_pick, FirstPickPolicy::Player1);
  }

  #[test]
  fn test_read_json_file_missing_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let missing: Option<AppConfig> = read_json_file(&dir.path().join("nope.json")).unwrap();
    assert!(missing.is_none());
  }

  #[test]
  fn test_normalize_key() {
    assert_eq!(normalize_key("  Elite – Grand Finals "), "elite – grand finals");
  }
}
