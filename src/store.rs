use crate::pool_generator::{GeneratedPools, TierCatalogs};
use crate::types::*;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Durable storage for events, match documents, tier catalogs and generated
/// pools. The orchestrator is the only writer.
pub trait MatchStore: Send {
    fn load_events(&self) -> Result<Vec<Event>, String>;
    fn save_events(&mut self, events: &[Event]) -> Result<(), String>;

    fn save_match(&mut self, doc: &MatchDoc) -> Result<(), String>;
    fn load_match(&self, id: u64) -> Result<Option<MatchDoc>, String>;
    fn delete_match(&mut self, id: u64) -> Result<(), String>;
    /// Every match of an event, newest first.
    fn list_matches(&self, event_id: u64) -> Result<Vec<MatchDoc>, String>;
    fn next_match_id(&mut self) -> Result<u64, String>;

    fn save_pools(&mut self, pools: &GeneratedPools) -> Result<(), String>;
    fn load_pools(&self, event_id: u64) -> Result<Option<GeneratedPools>, String>;
    fn save_catalogs(&mut self, event_id: u64, catalogs: &TierCatalogs) -> Result<(), String>;
    fn load_catalogs(&self, event_id: u64) -> Result<Option<TierCatalogs>, String>;

    fn list_in_progress(&self, event_id: u64) -> Result<Vec<MatchDoc>, String> {
        Ok(self
            .list_matches(event_id)?
            .into_iter()
            .filter(|doc| doc.status == MatchStatus::InProgress)
            .collect())
    }
}

pub fn encode_match(doc: &MatchDoc) -> Result<String, String> {
    serde_json::to_string_pretty(doc).map_err(|e| format!("encode match {}: {e}", doc.id))
}

fn sort_newest_first(docs: &mut [MatchDoc]) {
    docs.sort_by(|a, b| b.meta.started_at.cmp(&a.meta.started_at).then(b.id.cmp(&a.id)));
}

// ── JSON file store ────────────────────────────────────────────────────

/// One JSON file per record under the data directory. Writes go to a
/// `.tmp` sibling, are synced, then renamed over the target.
pub struct JsonFileStore {
    root: PathBuf,
    next_id: u64,
}

impl JsonFileStore {
    pub fn open(root: &Path) -> Result<Self, String> {
        for dir in ["matches", "pools", "catalogs"] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| format!("create {}: {e}", path.display()))?;
        }
        let mut store = JsonFileStore {
            root: root.to_path_buf(),
            next_id: 1,
        };
        store.recover_interrupted_writes();
        store.next_id = store.max_match_id()? + 1;
        Ok(store)
    }

    fn matches_dir(&self) -> PathBuf {
        self.root.join("matches")
    }

    fn match_path(&self, id: u64) -> PathBuf {
        self.matches_dir().join(format!("{id}.json"))
    }

    pub fn match_file(&self, id: u64) -> PathBuf {
        self.match_path(id)
    }

    fn recover_interrupted_writes(&self) {
        for dir in [self.root.clone(), self.matches_dir(), self.root.join("pools"), self.root.join("catalogs")] {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    warn!("removing interrupted write {}", path.display());
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }

    fn max_match_id(&self) -> Result<u64, String> {
        let dir = self.matches_dir();
        let entries = fs::read_dir(&dir).map_err(|e| format!("read {}: {e}", dir.display()))?;
        Ok(entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    path.file_stem()?.to_str()?.parse::<u64>().ok()
                } else {
                    None
                }
            })
            .max()
            .unwrap_or(0))
    }

    fn write_atomic(&self, path: &Path, content: &str) -> Result<(), String> {
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content).map_err(|e| format!("write {}: {e}", tmp_path.display()))?;
        if let Err(e) = fs::File::open(&tmp_path).and_then(|file| file.sync_all()) {
            warn!("failed to sync {}: {e}", tmp_path.display());
        }
        fs::rename(&tmp_path, path).map_err(|e| format!("rename {}: {e}", path.display()))?;
        debug!("wrote {}", path.display());
        Ok(())
    }

    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), String> {
        let payload = serde_json::to_string_pretty(value).map_err(|e| format!("encode {}: {e}", path.display()))?;
        self.write_atomic(path, &payload)
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, String> {
        crate::config::read_json_file(path)
    }
}

impl MatchStore for JsonFileStore {
    fn load_events(&self) -> Result<Vec<Event>, String> {
        Ok(self.read_json(&self.root.join("events.json"))?.unwrap_or_default())
    }

    fn save_events(&mut self, events: &[Event]) -> Result<(), String> {
        self.write_json(&self.root.join("events.json"), events)
    }

    fn save_match(&mut self, doc: &MatchDoc) -> Result<(), String> {
        let payload = encode_match(doc)?;
        self.write_atomic(&self.match_path(doc.id), &payload)
    }

    fn load_match(&self, id: u64) -> Result<Option<MatchDoc>, String> {
        self.read_json(&self.match_path(id))
    }

    fn delete_match(&mut self, id: u64) -> Result<(), String> {
        let path = self.match_path(id);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| format!("delete {}: {e}", path.display()))?;
        }
        Ok(())
    }

    fn list_matches(&self, event_id: u64) -> Result<Vec<MatchDoc>, String> {
        let dir = self.matches_dir();
        let entries = fs::read_dir(&dir).map_err(|e| format!("read {}: {e}", dir.display()))?;
        let mut docs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            match self.read_json::<MatchDoc>(&path) {
                Ok(Some(doc)) if doc.meta.event_id == event_id => docs.push(doc),
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable match record: {e}"),
            }
        }
        sort_newest_first(&mut docs);
        Ok(docs)
    }

    fn next_match_id(&mut self) -> Result<u64, String> {
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    fn save_pools(&mut self, pools: &GeneratedPools) -> Result<(), String> {
        let path = self.root.join("pools").join(format!("{}.json", pools.event_id));
        self.write_json(&path, pools)
    }

    fn load_pools(&self, event_id: u64) -> Result<Option<GeneratedPools>, String> {
        self.read_json(&self.root.join("pools").join(format!("{event_id}.json")))
    }

    fn save_catalogs(&mut self, event_id: u64, catalogs: &TierCatalogs) -> Result<(), String> {
        let path = self.root.join("catalogs").join(format!("{event_id}.json"));
        self.write_json(&path, catalogs)
    }

    fn load_catalogs(&self, event_id: u64) -> Result<Option<TierCatalogs>, String> {
        self.read_json(&self.root.join("catalogs").join(format!("{event_id}.json")))
    }
}

// ── In-memory store (tests) ────────────────────────────────────────────

#[cfg(test)]
pub use memory::MemoryStore;


#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::tests::{make_charts, make_meta};
    use crate::draft::{begin_draft, build_match};

    fn sample_doc(id: u64, event_id: u64, started_at: u64) -> MatchDoc {
        let mut meta = make_meta(3, true);
        meta.event_id = event_id;
        meta.started_at = started_at;
        let mut doc = build_match(id, meta, ["Alice", "Bob"], &make_charts(5));
        begin_draft(&mut doc, Slot::One, started_at).unwrap();
        doc
    }

    #[test]
    fn test_file_store_round_trips_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::open(dir.path()).unwrap();
        let doc = sample_doc(1, 1, 100);
        store.save_match(&doc).unwrap();
        let first = fs::read(store.match_file(1)).unwrap();

        let loaded = store.load_match(1).unwrap().unwrap();
        assert_eq!(loaded, doc);
        store.save_match(&loaded).unwrap();
        let second = fs::read(store.match_file(1)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_file_store_lists_by_event_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::open(dir.path()).unwrap();
        store.save_match(&sample_doc(1, 1, 100)).unwrap();
        store.save_match(&sample_doc(2, 1, 300)).unwrap();
        store.save_match(&sample_doc(3, 2, 200)).unwrap();

        let ids: Vec<u64> = store.list_matches(1).unwrap().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(store.list_in_progress(2).unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_resumes_id_sequence_and_clears_tmp() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = JsonFileStore::open(dir.path()).unwrap();
            assert_eq!(store.next_match_id().unwrap(), 1);
            store.save_match(&sample_doc(7, 1, 0)).unwrap();
        }
        let stray = dir.path().join("matches").join("8.json.tmp");
        fs::write(&stray, "{").unwrap();

        let mut reopened = JsonFileStore::open(dir.path()).unwrap();
        assert!(!stray.exists());
        assert_eq!(reopened.next_match_id().unwrap(), 8);
    }

    #[test]
    fn test_file_store_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::open(dir.path()).unwrap();
        store.save_match(&sample_doc(4, 1, 0)).unwrap();
        store.delete_match(4).unwrap();
        store.delete_match(4).unwrap();
        assert!(store.load_match(4).unwrap().is_none());
    }

    #[test]
    fn test_file_store_events_and_catalogs() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::open(dir.path()).unwrap();
        assert!(store.load_events().unwrap().is_empty());
        let events = vec![Event {
            id: 1,
            name: "Spring Cup".to_string(),
            created_at: 5,
            active: true,
            friendly: false,
        }];
        store.save_events(&events).unwrap();
        assert_eq!(store.load_events().unwrap(), events);

        let mut catalogs = TierCatalogs::new();
        catalogs.insert(2, make_charts(3));
        store.save_catalogs(1, &catalogs).unwrap();
        assert_eq!(store.load_catalogs(1).unwrap(), Some(catalogs));
        assert!(store.load_pools(1).unwrap().is_none());
    }

    #[test]
    fn test_memory_store_failure_switch() {
        let mut store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.save_match(&sample_doc(1, 1, 0)).is_err());
        store.set_fail_writes(false);
        store.save_match(&sample_doc(1, 1, 0)).unwrap();
        assert!(store.raw_match(1).is_some());
    }
}
