//! Replay session lifecycle
//!
//! A session is created with a sampling decision that stays frozen until the
//! session expires. Sticky sessions are persisted through a [`SessionStore`]
//! on a best-effort basis: read and write failures are logged and treated as
//! "no session".

use rand::Rng;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::config::defaults::REPLAY_SESSION_KEY;
use crate::storage::SessionStore;

/// Sampling decision of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sampled {
    /// Record and send continuously
    Session,
    /// Keep a rolling buffer, send only when an error promotes it
    Buffer,
    /// Not recorded
    #[default]
    Unsampled,
}

impl Sampled {
    pub fn is_sampled(self) -> bool {
        self != Sampled::Unsampled
    }

    /// Wire value of `replay_type`
    pub fn as_str(self) -> Option<&'static str> {
        match self {
            Sampled::Session => Some("session"),
            Sampled::Buffer => Some("buffer"),
            Sampled::Unsampled => None,
        }
    }
}

impl fmt::Display for Sampled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().unwrap_or("false"))
    }
}

impl Serialize for Sampled {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_str() {
            Some(mode) => serializer.serialize_str(mode),
            None => serializer.serialize_bool(false),
        }
    }
}

impl<'de> Deserialize<'de> for Sampled {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Mode(String),
            Flag(bool),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Mode(mode) if mode == "session" => Ok(Sampled::Session),
            Repr::Mode(mode) if mode == "buffer" => Ok(Sampled::Buffer),
            Repr::Mode(mode) => Err(de::Error::custom(format!("unknown sampling mode {mode}"))),
            Repr::Flag(false) => Ok(Sampled::Unsampled),
            Repr::Flag(true) => Ok(Sampled::Session),
        }
    }
}

/// Session metadata, persisted as camelCase JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,

    /// Epoch ms when the session (or its current buffer window) started
    pub started: u64,

    /// Epoch ms of the last user activity
    #[serde(default)]
    pub last_activity: u64,

    /// Id of the next segment to send
    #[serde(default)]
    pub segment_id: u64,

    #[serde(default)]
    pub sampled: Sampled,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_session_id: Option<String>,
}

impl Session {
    pub fn new(sampled: Sampled, now: u64, previous_session_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            started: now,
            last_activity: now,
            segment_id: 0,
            sampled,
            previous_session_id,
        }
    }

    /// Parse persisted JSON; missing `lastActivity` falls back to `started`
    pub fn from_json(raw: &str) -> Option<Self> {
        let mut session: Session = serde_json::from_str(raw).ok()?;
        if session.last_activity == 0 {
            session.last_activity = session.started;
        }
        Some(session)
    }

    pub fn is_expired(&self, timeouts: &SessionTimeouts, now: u64) -> bool {
        is_expired(self.started, timeouts.max_replay_duration, now)
            || is_expired(self.last_activity, timeouts.session_idle_expire, now)
    }

    /// Expired sessions are refreshed, except buffer sessions that never sent anything
    pub fn should_refresh(&self, timeouts: &SessionTimeouts, now: u64) -> bool {
        if !self.is_expired(timeouts, now) {
            return false;
        }
        !(self.sampled == Sampled::Buffer && self.segment_id == 0)
    }
}

/// Durations that end a session, in ms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub session_idle_expire: u64,
    pub max_replay_duration: u64,
}

/// How a new session is sampled and stored
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOptions {
    pub sticky_session: bool,
    pub session_sample_rate: f64,
    pub allow_buffering: bool,
}

/// `true` once more than `expiry` ms have passed since `initial`; 0 never expires
pub fn is_expired(initial: u64, expiry: u64, now: u64) -> bool {
    if expiry == 0 {
        return false;
    }
    now.saturating_sub(initial) > expiry
}

/// Coin flip against `sample_rate`
pub fn is_sampled(sample_rate: f64) -> bool {
    if sample_rate <= 0.0 {
        return false;
    }
    rand::thread_rng().gen::<f64>() < sample_rate
}

pub fn sample_session(session_sample_rate: f64, allow_buffering: bool) -> Sampled {
    if is_sampled(session_sample_rate) {
        Sampled::Session
    } else if allow_buffering {
        Sampled::Buffer
    } else {
        Sampled::Unsampled
    }
}

/// Create a fresh session, persisting it when sticky
pub fn create_session(
    store: &dyn SessionStore,
    options: &SessionOptions,
    now: u64,
    previous_session_id: Option<String>,
) -> Session {
    let sampled = sample_session(options.session_sample_rate, options.allow_buffering);
    let session = Session::new(sampled, now, previous_session_id);

    if options.sticky_session {
        save_session(store, &session);
    }

    tracing::debug!(session_id = %session.id, sampled = %session.sampled, "Created new session");
    session
}

/// Reuse the persisted session unless it has to be refreshed
pub fn load_or_create_session(
    store: &dyn SessionStore,
    timeouts: &SessionTimeouts,
    options: &SessionOptions,
    now: u64,
    previous_session_id: Option<String>,
) -> Session {
    let existing = if options.sticky_session {
        fetch_session(store)
    } else {
        None
    };

    let Some(existing) = existing else {
        return create_session(store, options, now, previous_session_id);
    };

    if !existing.should_refresh(timeouts, now) {
        tracing::debug!(session_id = %existing.id, "Using existing session");
        return existing;
    }

    tracing::debug!("Session in storage is expired, creating new one");
    create_session(store, options, now, Some(existing.id))
}

pub fn fetch_session(store: &dyn SessionStore) -> Option<Session> {
    match store.get(REPLAY_SESSION_KEY) {
        Ok(Some(raw)) => Session::from_json(&raw),
        Ok(None) => None,
        Err(e) => {
            tracing::debug!("Failed to read session: {e}");
            None
        }
    }
}

pub fn save_session(store: &dyn SessionStore, session: &Session) {
    let raw = match serde_json::to_string(session) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!("Failed to serialize session: {e}");
            return;
        }
    };
    if let Err(e) = store.set(REPLAY_SESSION_KEY, &raw) {
        tracing::debug!("Failed to persist session: {e}");
    }
}

pub fn delete_session(store: &dyn SessionStore) {
    if let Err(e) = store.remove(REPLAY_SESSION_KEY) {
        tracing::debug!("Failed to delete session: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySessionStore;

    const TIMEOUTS: SessionTimeouts = SessionTimeouts {
        session_idle_expire: 900_000,
        max_replay_duration: 3_600_000,
    };

    fn options(sticky: bool, rate: f64, buffering: bool) -> SessionOptions {
        SessionOptions {
            sticky_session: sticky,
            session_sample_rate: rate,
            allow_buffering: buffering,
        }
    }

    #[test]
    fn test_sampled_wire_format() {
        assert_eq!(serde_json::to_string(&Sampled::Session).unwrap(), r#""session""#);
        assert_eq!(serde_json::to_string(&Sampled::Buffer).unwrap(), r#""buffer""#);
        assert_eq!(serde_json::to_string(&Sampled::Unsampled).unwrap(), "false");

        let parsed: Sampled = serde_json::from_str("false").unwrap();
        assert_eq!(parsed, Sampled::Unsampled);
        assert!(serde_json::from_str::<Sampled>(r#""sometimes""#).is_err());
    }

    #[test]
    fn test_session_json_is_camel_case() {
        let mut session = Session::new(Sampled::Buffer, 10, Some("prev".to_string()));
        session.segment_id = 2;
        let json = serde_json::to_value(&session).unwrap();

        assert_eq!(json["lastActivity"], 10);
        assert_eq!(json["segmentId"], 2);
        assert_eq!(json["sampled"], "buffer");
        assert_eq!(json["previousSessionId"], "prev");
        assert_eq!(session.id.len(), 32);
    }

    #[test]
    fn test_from_json_defaults_last_activity() {
        let session = Session::from_json(r#"{"id":"abc","started":500}"#).unwrap();
        assert_eq!(session.last_activity, 500);
        assert_eq!(session.segment_id, 0);
        assert_eq!(session.sampled, Sampled::Unsampled);

        assert!(Session::from_json("not json").is_none());
    }

    #[test]
    fn test_is_expired() {
        assert!(!is_expired(0, 100, 100));
        assert!(is_expired(0, 100, 101));
        assert!(!is_expired(0, 0, u64::MAX));
    }

    #[test]
    fn test_session_expiry_by_idle_and_duration() {
        let mut session = Session::new(Sampled::Session, 0, None);

        assert!(!session.is_expired(&TIMEOUTS, 900_000));
        assert!(session.is_expired(&TIMEOUTS, 900_001));

        session.last_activity = 3_000_000;
        assert!(!session.is_expired(&TIMEOUTS, 3_599_999));
        assert!(!session.is_expired(&TIMEOUTS, 3_600_000));
        assert!(session.is_expired(&TIMEOUTS, 3_600_001));
    }

    #[test]
    fn test_buffer_session_without_segments_is_never_refreshed() {
        let mut session = Session::new(Sampled::Buffer, 0, None);
        assert!(session.is_expired(&TIMEOUTS, 4_000_000));
        assert!(!session.should_refresh(&TIMEOUTS, 4_000_000));

        session.segment_id = 1;
        assert!(session.should_refresh(&TIMEOUTS, 4_000_000));

        let session = Session::new(Sampled::Session, 0, None);
        assert!(session.should_refresh(&TIMEOUTS, 4_000_000));
        assert!(!session.should_refresh(&TIMEOUTS, 1_000));
    }

    #[test]
    fn test_sample_session() {
        assert_eq!(sample_session(1.0, false), Sampled::Session);
        assert_eq!(sample_session(0.0, true), Sampled::Buffer);
        assert_eq!(sample_session(0.0, false), Sampled::Unsampled);
    }

    #[test]
    fn test_create_session_persists_only_when_sticky() {
        let store = MemorySessionStore::new();

        create_session(&store, &options(false, 1.0, false), 0, None);
        assert!(fetch_session(&store).is_none());

        let session = create_session(&store, &options(true, 1.0, false), 0, None);
        assert_eq!(fetch_session(&store), Some(session));
    }

    #[test]
    fn test_load_or_create_reuses_live_sticky_session() {
        let store = MemorySessionStore::new();
        let created = create_session(&store, &options(true, 1.0, false), 0, None);

        let loaded = load_or_create_session(&store, &TIMEOUTS, &options(true, 1.0, false), 1_000, None);
        assert_eq!(loaded.id, created.id);

        let fresh = load_or_create_session(&store, &TIMEOUTS, &options(false, 1.0, false), 1_000, None);
        assert_ne!(fresh.id, created.id);
    }

    #[test]
    fn test_load_or_create_replaces_expired_session() {
        let store = MemorySessionStore::new();
        let created = create_session(&store, &options(true, 1.0, false), 0, None);

        let replaced =
            load_or_create_session(&store, &TIMEOUTS, &options(true, 1.0, false), 1_000_000, None);
        assert_ne!(replaced.id, created.id);
        assert_eq!(replaced.previous_session_id.as_deref(), Some(created.id.as_str()));
        assert_eq!(fetch_session(&store).unwrap().id, replaced.id);
    }

    #[test]
    fn test_unparsable_persisted_session_is_ignored() {
        let store = MemorySessionStore::new();
        store.set(REPLAY_SESSION_KEY, "{broken").unwrap();
        assert!(fetch_session(&store).is_none());

        let session = load_or_create_session(&store, &TIMEOUTS, &options(true, 1.0, false), 0, None);
        assert_eq!(session.sampled, Sampled::Session);

        delete_session(&store);
        assert!(fetch_session(&store).is_none());
    }
}
