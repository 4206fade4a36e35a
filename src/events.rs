use crate::config::normalize_key;
use crate::error::{MatchError, MatchResult};
use crate::store::MatchStore;
use crate::types::*;
use tracing::info;

/// Tournament events. At most one non-friendly event is active; friendlies
/// live under a reserved event that is never active.
#[derive(Debug, Default)]
pub struct EventBook {
    events: Vec<Event>,
}

impl EventBook {
    pub fn load(store: &dyn MatchStore) -> Result<Self, String> {
        Ok(EventBook {
            events: store.load_events()?,
        })
    }

    pub fn active(&self) -> Option<&Event> {
        self.events.iter().find(|event| event.active && !event.friendly)
    }

    pub fn by_name(&self, name: &str) -> Option<&Event> {
        let key = normalize_key(name);
        self.events.iter().find(|event| normalize_key(&event.name) == key)
    }

    /// Newest first.
    pub fn list(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.events.iter().filter(|e| !e.friendly).cloned().collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        events
    }

    fn next_id(&self) -> u64 {
        self.events.iter().map(|event| event.id).max().unwrap_or(0) + 1
    }

    fn commit(&mut self, store: &mut dyn MatchStore, next: Vec<Event>) -> MatchResult<()> {
        store.save_events(&next).map_err(MatchError::Persistence)?;
        self.events = next;
        Ok(())
    }

    pub fn create(&mut self, store: &mut dyn MatchStore, name: &str, now_ms: u64) -> MatchResult<Event> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MatchError::validation("Event name cannot be empty."));
        }
        if normalize_key(name) == normalize_key(FRIENDLIES_EVENT_NAME) || self.by_name(name).is_some() {
            return Err(MatchError::conflict(format!("An event named \"{name}\" already exists.")));
        }
        let event = Event {
            id: self.next_id(),
            name: name.to_string(),
            created_at: now_ms,
            active: true,
            friendly: false,
        };
        let mut next = self.events.clone();
        for existing in next.iter_mut() {
            existing.active = false;
        }
        next.push(event.clone());
        self.commit(store, next)?;
        info!("created event {} ({})", event.name, event.id);
        Ok(event)
    }

    pub fn switch(&mut self, store: &mut dyn MatchStore, name: &str) -> MatchResult<Event> {
        let target = self
            .by_name(name)
            .filter(|event| !event.friendly)
            .map(|event| event.id)
            .ok_or_else(|| MatchError::not_found(format!("Event \"{}\" not found.", name.trim())))?;
        let mut next = self.events.clone();
        for event in next.iter_mut() {
            event.active = event.id == target;
        }
        self.commit(store, next)?;
        let event = self
            .events
            .iter()
            .find(|event| event.id == target)
            .cloned()
            .ok_or_else(|| MatchError::not_found("Event vanished while switching."))?;
        info!("switched to event {} ({})", event.name, event.id);
        Ok(event)
    }

    /// The reserved friendlies event, created on first use.
    pub fn friendlies(&mut self, store: &mut dyn MatchStore, now_ms: u64) -> MatchResult<u64> {
        if let Some(event) = self.events.iter().find(|event| event.friendly) {
            return Ok(event.id);
        }
        let event = Event {
            id: self.next_id(),
            name: FRIENDLIES_EVENT_NAME.to_string(),
            created_at: now_ms,
            active: false,
            friendly: true,
        };
        let id = event.id;
        let mut next = self.events.clone();
        next.push(event);
        self.commit(store, next)?;
        Ok(id)
    }

    pub fn friendlies_id(&self) -> Option<u64> {
        self.events.iter().find(|event| event.friendly).map(|event| event.id)
    }
}
