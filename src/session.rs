//! Per-entity counters and session tracking.
//!
//! A [`SessionStateManager`] owns the state of every entity routed to
//! one partition. Nothing outside that partition's worker reads or
//! writes it.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;

pub use self::session::SessionState;

/// Cumulative counters for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub total_event_count: u64,
    /// Timestamp of the most recently processed event.
    pub last_activity: DateTime<Utc>,
    pub event_type_histogram: BTreeMap<String, u64>,
    pub session_count: u64,
}

impl EntityState {
    fn new(entity_id: String, first_seen: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            total_event_count: 0,
            last_activity: first_seen,
            event_type_histogram: BTreeMap::new(),
            session_count: 0,
        }
    }
}

mod session {
    use std::collections::VecDeque;

    use chrono::{DateTime, Duration, Utc};
    use serde::{Deserialize, Serialize};

    use crate::event::Event;

    /// One run of activity without a gap longer than the session
    /// timeout.
    ///
    /// A closed session is never modified again; the next event opens
    /// a new one instead.
    ///
    /// Every event of the session is kept, and so written into every
    /// checkpoint, for as long as the session stays open. Set
    /// [`crate::PipelineConfig::max_session_events`] to keep only the
    /// newest ones when entities can stay active for a long time.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SessionState {
        session_id: String,
        start_time: DateTime<Utc>,
        last_event_time: DateTime<Utc>,
        accumulated_events: VecDeque<Event>,
        /// Events dropped from the front to respect the cap.
        #[serde(default)]
        evicted_events: u64,
        open: bool,
    }

    impl SessionState {
        pub(super) fn open(event: &Event) -> Self {
            Self {
                session_id: format!("{}_{}", event.entity_id, event.timestamp.timestamp()),
                start_time: event.timestamp,
                last_event_time: event.timestamp,
                accumulated_events: VecDeque::from([event.clone()]),
                evicted_events: 0,
                open: true,
            }
        }

        /// Append an event, dropping the oldest ones beyond
        /// `max_events`.
        pub(super) fn extend(&mut self, event: &Event, max_events: Option<usize>) {
            assert!(
                self.open,
                "closed session {} can't accept more events",
                self.session_id
            );
            self.last_event_time = event.timestamp;
            self.accumulated_events.push_back(event.clone());
            if let Some(max) = max_events {
                while self.accumulated_events.len() > max {
                    self.accumulated_events.pop_front();
                    self.evicted_events += 1;
                }
            }
        }

        pub(super) fn close(mut self) -> Self {
            self.open = false;
            self
        }

        pub fn session_id(&self) -> &str {
            &self.session_id
        }

        pub fn start_time(&self) -> DateTime<Utc> {
            self.start_time
        }

        pub fn last_event_time(&self) -> DateTime<Utc> {
            self.last_event_time
        }

        /// Kept events, oldest first.
        pub fn events(&self) -> impl ExactSizeIterator<Item = &Event> {
            self.accumulated_events.iter()
        }

        /// Events in the session, including dropped ones.
        pub fn event_count(&self) -> u64 {
            self.accumulated_events.len() as u64 + self.evicted_events
        }

        pub fn is_open(&self) -> bool {
            self.open
        }

        /// Time between the first and latest event.
        ///
        /// Negative if an out-of-order event was the latest one.
        pub fn duration(&self) -> Duration {
            self.last_event_time - self.start_time
        }
    }
}

/// How an event changed its entity's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    /// First session for the entity.
    Opened,
    /// Appended to the open session.
    Extended,
    /// The open session closed and a new one opened.
    Rolled,
}

/// Everything stored for one entity; also the unit of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity: EntityState,
    pub session: Option<SessionState>,
}

/// Emitted once per processed event.
///
/// Consumers can drop duplicates by [`AnalyticsRecord::dedup_key`],
/// since replay after a failure emits some records again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    pub entity_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub total_event_count: u64,
    pub session_count: u64,
    pub session_id: String,
    pub event_type_histogram: BTreeMap<String, u64>,
    pub current_session_duration_secs: i64,
}

impl AnalyticsRecord {
    pub fn dedup_key(&self) -> (&str, DateTime<Utc>, u64) {
        (&self.entity_id, self.timestamp, self.total_event_count)
    }
}

/// State of all entities owned by one partition.
#[derive(Debug, Clone)]
pub struct SessionStateManager {
    session_timeout: Duration,
    max_session_events: Option<usize>,
    entities: BTreeMap<String, EntitySnapshot>,
}

impl SessionStateManager {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            session_timeout,
            max_session_events: None,
            entities: BTreeMap::new(),
        }
    }

    pub fn restore(session_timeout: Duration, snapshots: Vec<EntitySnapshot>) -> Self {
        let entities = snapshots
            .into_iter()
            .map(|snap| (snap.entity.entity_id.clone(), snap))
            .collect();
        Self {
            session_timeout,
            max_session_events: None,
            entities,
        }
    }

    /// Keep at most `max` events in each open session.
    pub fn with_max_session_events(mut self, max: Option<usize>) -> Self {
        self.max_session_events = max;
        self
    }

    /// Apply one event and build its analytics record.
    ///
    /// A new session starts when the entity has none yet, or when the
    /// gap since the previously processed event is strictly longer
    /// than the session timeout. Only the previous event is compared,
    /// so an out-of-order event extends the open session.
    pub fn process(&mut self, event: &Event) -> AnalyticsRecord {
        let slot = self
            .entities
            .entry(event.entity_id.clone())
            .or_insert_with(|| EntitySnapshot {
                entity: EntityState::new(event.entity_id.clone(), event.timestamp),
                session: None,
            });

        let gap = event.timestamp - slot.entity.last_activity;
        let transition = match slot.session.take() {
            None => {
                slot.session = Some(SessionState::open(event));
                SessionTransition::Opened
            }
            Some(previous) if gap > self.session_timeout => {
                let closed = previous.close();
                tracing::trace!(
                    "Closed session {} after {}s",
                    closed.session_id(),
                    closed.duration().num_seconds()
                );
                slot.session = Some(SessionState::open(event));
                SessionTransition::Rolled
            }
            Some(mut open) => {
                open.extend(event, self.max_session_events);
                slot.session = Some(open);
                SessionTransition::Extended
            }
        };

        let entity = &mut slot.entity;
        if transition != SessionTransition::Extended {
            entity.session_count += 1;
        }
        entity.total_event_count += 1;
        *entity
            .event_type_histogram
            .entry(event.event_type.clone())
            .or_insert(0) += 1;
        entity.last_activity = event.timestamp;

        let (session_id, duration) = slot
            .session
            .as_ref()
            .map(|session| {
                (
                    session.session_id().to_string(),
                    session.duration().num_seconds(),
                )
            })
            .unwrap_or_default();
        tracing::trace!("{transition:?} session {session_id} for {:?}", event.entity_id);

        AnalyticsRecord {
            entity_id: event.entity_id.clone(),
            event_type: event.event_type.clone(),
            timestamp: event.timestamp,
            processed_at: event.processed_at,
            total_event_count: entity.total_event_count,
            session_count: entity.session_count,
            session_id,
            event_type_histogram: entity.event_type_histogram.clone(),
            current_session_duration_secs: duration,
        }
    }

    pub fn entity(&self, entity_id: &str) -> Option<&EntityState> {
        self.entities.get(entity_id).map(|slot| &slot.entity)
    }

    pub fn session(&self, entity_id: &str) -> Option<&SessionState> {
        self.entities
            .get(entity_id)
            .and_then(|slot| slot.session.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Copy of every entity's state, ordered by entity id.
    pub fn snapshot(&self) -> Vec<EntitySnapshot> {
        self.entities.values().cloned().collect()
    }

    pub fn entity_states(&self) -> impl Iterator<Item = &EntityState> {
        self.entities.values().map(|slot| &slot.entity)
    }
}

#[cfg(test)]
fn t0() -> DateTime<Utc> {
    use chrono::TimeZone;
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
}

#[cfg(test)]
fn event(entity_id: &str, event_type: &str, secs: i64) -> Event {
    Event {
        event_type: event_type.to_string(),
        entity_id: entity_id.to_string(),
        timestamp: t0() + Duration::seconds(secs),
        processed_at: t0(),
        payload: Default::default(),
    }
}

#[cfg(test)]
fn manager() -> SessionStateManager {
    SessionStateManager::new(Duration::seconds(1800))
}

#[test]
fn counts_every_event() {
    let mut mgr = manager();
    for i in 0..25 {
        mgr.process(&event("u1", "view", i));
    }
    assert_eq!(mgr.entity("u1").unwrap().total_event_count, 25);
    assert_eq!(mgr.entity("u1").unwrap().session_count, 1);
}

#[test]
fn gap_over_timeout_starts_session() {
    let mut mgr = manager();
    mgr.process(&event("u1", "click", 0));
    let record = mgr.process(&event("u1", "click", 1801));
    assert_eq!(record.session_count, 2);
    assert_eq!(record.current_session_duration_secs, 0);

    let mut mgr = manager();
    mgr.process(&event("u1", "click", 0));
    let record = mgr.process(&event("u1", "click", 1799));
    assert_eq!(record.session_count, 1);
    assert_eq!(record.current_session_duration_secs, 1799);
}

#[test]
fn gap_equal_to_timeout_keeps_session() {
    let mut mgr = manager();
    mgr.process(&event("u1", "click", 0));
    let record = mgr.process(&event("u1", "click", 1800));
    assert_eq!(record.session_count, 1);
}

#[test]
fn gap_measured_from_previous_event() {
    let mut mgr = manager();
    // Each gap is under the timeout even though the total span isn't.
    for secs in [0, 1000, 2000, 3000, 4000] {
        mgr.process(&event("u1", "view", secs));
    }
    let session = mgr.session("u1").unwrap();
    assert_eq!(mgr.entity("u1").unwrap().session_count, 1);
    assert_eq!(session.events().len(), 5);
    assert_eq!(session.event_count(), 5);
    assert_eq!(session.duration(), Duration::seconds(4000));
}

#[test]
fn click_view_purchase_scenario() {
    let mut mgr = manager();
    let first = mgr.process(&event("u1", "click", 0));
    let second = mgr.process(&event("u1", "view", 5));
    let third = mgr.process(&event("u1", "purchase", 1900));

    assert_eq!(first.session_id, format!("u1_{}", t0().timestamp()));
    assert_eq!(second.session_id, first.session_id);
    assert_eq!(second.current_session_duration_secs, 5);
    assert_eq!(third.session_id, format!("u1_{}", t0().timestamp() + 1900));

    assert_eq!(third.total_event_count, 3);
    assert_eq!(third.session_count, 2);
    assert_eq!(
        third.event_type_histogram,
        BTreeMap::from([
            ("click".to_string(), 1),
            ("purchase".to_string(), 1),
            ("view".to_string(), 1),
        ])
    );
}

#[test]
fn rolled_session_is_fresh() {
    let mut mgr = manager();
    mgr.process(&event("u1", "click", 0));
    mgr.process(&event("u1", "click", 10));
    mgr.process(&event("u1", "click", 5000));

    let session = mgr.session("u1").unwrap();
    assert!(session.is_open());
    assert_eq!(session.start_time(), t0() + Duration::seconds(5000));
    assert_eq!(session.events().len(), 1);
}

#[test]
fn out_of_order_event_extends_session() {
    let mut mgr = manager();
    mgr.process(&event("u1", "view", 100));
    let record = mgr.process(&event("u1", "view", 0));

    assert_eq!(record.session_count, 1);
    assert_eq!(record.current_session_duration_secs, -100);
    assert_eq!(mgr.entity("u1").unwrap().last_activity, t0());
}

#[test]
fn entities_are_independent() {
    let mut mgr = manager();
    mgr.process(&event("u1", "click", 0));
    mgr.process(&event("u2", "view", 0));
    mgr.process(&event("u1", "click", 4000));

    assert_eq!(mgr.len(), 2);
    assert_eq!(mgr.entity("u1").unwrap().session_count, 2);
    assert_eq!(mgr.entity("u2").unwrap().session_count, 1);
    assert_eq!(mgr.entity("u2").unwrap().total_event_count, 1);
}

#[test]
#[should_panic(expected = "can't accept more events")]
fn closed_session_rejects_events() {
    let mut closed = SessionState::open(&event("u1", "click", 0)).close();
    closed.extend(&event("u1", "click", 1), None);
}

#[test]
fn replay_from_snapshot_matches() {
    let events: Vec<_> = (0..40)
        .map(|i| event(&format!("u{}", i % 3), "view", i * 300))
        .collect();
    let (prefix, suffix) = events.split_at(17);

    let mut original = manager();
    prefix.iter().for_each(|e| {
        original.process(e);
    });
    let snapshot = original.snapshot();
    let expected: Vec<_> = suffix.iter().map(|e| original.process(e)).collect();

    let bytes = serde_json::to_vec(&snapshot).unwrap();
    let snapshot = serde_json::from_slice(&bytes).unwrap();
    let mut restored = SessionStateManager::restore(Duration::seconds(1800), snapshot);
    let found: Vec<_> = suffix.iter().map(|e| restored.process(e)).collect();

    assert_eq!(found, expected);
    assert_eq!(restored.snapshot(), original.snapshot());
}

#[test]
fn capped_session_keeps_newest_events() {
    let mut mgr = manager().with_max_session_events(Some(3));
    for secs in 0..10 {
        mgr.process(&event("u1", "view", secs));
    }

    let session = mgr.session("u1").unwrap();
    let kept: Vec<_> = session.events().map(|e| e.timestamp).collect();
    assert_eq!(
        kept,
        vec![
            t0() + Duration::seconds(7),
            t0() + Duration::seconds(8),
            t0() + Duration::seconds(9),
        ]
    );
    assert_eq!(session.event_count(), 10);
    // Counters and duration still cover the whole session.
    assert_eq!(session.duration(), Duration::seconds(9));
    assert_eq!(mgr.entity("u1").unwrap().total_event_count, 10);
}
