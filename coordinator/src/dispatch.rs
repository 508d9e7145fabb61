//! The session table: `SessionKey -> Session`, plus the fallback lookup order an inbound
//! frame uses to find its session even when a digipeater has perturbed the path the
//! far end is now using.

use ax25::{Ax25Address, DigiPath, Session, SessionId, SessionKey, State};
use std::collections::HashMap;

#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    by_key: HashMap<SessionKey, SessionId>,
    next_id: u64,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    pub fn next_session_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }

    pub fn insert(&mut self, session: Session) -> SessionId {
        let id = session.id;
        self.by_key.insert(session.key.clone(), id);
        self.sessions.insert(id, session);
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn by_exact_key(&self, key: &SessionKey) -> Option<SessionId> {
        self.by_key.get(key).copied()
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        self.by_key.remove(&session.key);
        Some(session)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionId, &Session)> {
        self.sessions.iter()
    }

    pub fn sessions_to(&self, destination: &Ax25Address) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| &s.key.destination == destination)
            .map(|s| s.id)
            .collect()
    }

    /// Finds the session an inbound frame belongs to, per the spec's fallback order:
    /// exact key, then same destination+channel while a response is expected (covers a
    /// UA/DM arriving on a path the digipeaters rewrote), then same destination+channel
    /// in any state, then same callsign ignoring SSID, then same callsign ignoring
    /// channel as a last resort.
    pub fn lookup_inbound(&self, remote: &Ax25Address, path: &DigiPath, channel: u16) -> Option<SessionId> {
        let exact = SessionKey::new(remote.clone(), path, channel);
        if let Some(id) = self.by_exact_key(&exact) {
            return Some(id);
        }

        if let Some(id) = self.find(|s| {
            s.key.destination == *remote && s.key.channel == channel && s.state() == State::Connecting
        }) {
            return Some(id);
        }

        if let Some(id) = self.find(|s| s.key.destination == *remote && s.key.channel == channel) {
            return Some(id);
        }

        if let Some(id) = self.find(|s| s.key.destination.call() == remote.call() && s.key.channel == channel) {
            return Some(id);
        }

        self.find(|s| s.key.destination.call() == remote.call())
    }

    fn find<F: Fn(&Session) -> bool>(&self, predicate: F) -> Option<SessionId> {
        self.sessions.values().find(|s| predicate(s)).map(|s| s.id)
    }
}
