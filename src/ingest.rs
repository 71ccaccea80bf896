//! Stateless stages between the source and the partitioner.
//!
//! Each stage has a typed input and output and is composed with the
//! others once, when the pipeline starts. The composed chain is run by
//! the dispatcher on every raw record.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::config::PipelineConfig;
use crate::errors::MalformedEventError;
use crate::event::{json_type_name, Event};

const EVENT_TYPE_FIELD: &str = "event_type";
const TIMESTAMP_FIELD: &str = "timestamp";

/// What a stage did with one input.
#[derive(Debug, PartialEq)]
pub enum Verdict<T> {
    /// Hand the output to the next stage.
    Pass(T),
    /// Dropped on purpose; not an error.
    Filtered,
    /// Dropped because the input was invalid.
    Malformed(MalformedEventError),
}

pub trait Stage: Send + Sync {
    type Input;
    type Output;

    fn apply(&self, input: Self::Input) -> Verdict<Self::Output>;

    /// Feed this stage's output into `next`.
    fn then<S>(self, next: S) -> Chain<Self, S>
    where
        Self: Sized,
        S: Stage<Input = Self::Output>,
    {
        Chain {
            first: self,
            second: next,
        }
    }
}

/// Two stages run back to back.
pub struct Chain<A, B> {
    first: A,
    second: B,
}

impl<A, B> Stage for Chain<A, B>
where
    A: Stage,
    B: Stage<Input = A::Output>,
{
    type Input = A::Input;
    type Output = B::Output;

    fn apply(&self, input: Self::Input) -> Verdict<Self::Output> {
        match self.first.apply(input) {
            Verdict::Pass(mid) => self.second.apply(mid),
            Verdict::Filtered => Verdict::Filtered,
            Verdict::Malformed(err) => Verdict::Malformed(err),
        }
    }
}

/// The stages every record goes through before partitioning.
pub type IngestChain = Chain<Normalizer, EventFilter>;

pub fn ingest_chain(config: &PipelineConfig) -> IngestChain {
    Normalizer::new(config.entity_id_field.clone())
        .then(EventFilter::new(config.accepted_event_types.iter().cloned()))
}

/// Turns raw JSON bytes into an [`Event`].
#[derive(Debug, Clone)]
pub struct Normalizer {
    entity_id_field: String,
}

impl Normalizer {
    pub fn new(entity_id_field: impl Into<String>) -> Self {
        Self {
            entity_id_field: entity_id_field.into(),
        }
    }

    /// Validate a record, stamping it as processed at `processed_at`.
    ///
    /// Timestamps that can't be parsed fall back to `processed_at`.
    pub fn normalize_at(
        &self,
        raw: &[u8],
        processed_at: DateTime<Utc>,
    ) -> Result<Event, MalformedEventError> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|err| MalformedEventError::NotJson(err.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(MalformedEventError::NotAnObject);
        };

        let required = [
            EVENT_TYPE_FIELD,
            self.entity_id_field.as_str(),
            TIMESTAMP_FIELD,
        ];
        let missing: Vec<String> = required
            .into_iter()
            .filter(|name| fields.get(*name).map_or(true, Value::is_null))
            .map(String::from)
            .collect();
        if !missing.is_empty() {
            return Err(MalformedEventError::MissingFields(missing));
        }

        let event_type = take_scalar(&mut fields, EVENT_TYPE_FIELD)?;
        let entity_id = take_entity_id(&mut fields, &self.entity_id_field)?;
        let raw_timestamp = fields.remove(TIMESTAMP_FIELD).unwrap_or(Value::Null);
        let timestamp = parse_timestamp(&raw_timestamp).unwrap_or_else(|| {
            tracing::debug!(
                "Unparseable timestamp {raw_timestamp} for {entity_id:?}; using processing time"
            );
            processed_at
        });

        Ok(Event {
            event_type,
            entity_id,
            timestamp,
            processed_at,
            payload: fields,
        })
    }
}

impl Stage for Normalizer {
    type Input = Vec<u8>;
    type Output = Event;

    fn apply(&self, input: Vec<u8>) -> Verdict<Event> {
        match self.normalize_at(&input, Utc::now()) {
            Ok(event) => Verdict::Pass(event),
            Err(err) => Verdict::Malformed(err),
        }
    }
}

/// Text of a JSON scalar. Strings are taken as they are; numbers and
/// booleans are rendered the way JSON writes them.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(num) => Some(num.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn take_scalar(fields: &mut Map<String, Value>, name: &str) -> Result<String, MalformedEventError> {
    let value = fields
        .remove(name)
        .ok_or_else(|| MalformedEventError::MissingFields(vec![name.to_string()]))?;
    scalar_text(&value).ok_or_else(|| MalformedEventError::WrongType {
        field: name.to_string(),
        found: json_type_name(&value),
    })
}

fn take_entity_id(
    fields: &mut Map<String, Value>,
    name: &str,
) -> Result<String, MalformedEventError> {
    let id = take_scalar(fields, name)?.trim().to_string();
    if id.is_empty() {
        Err(MalformedEventError::EmptyEntityId)
    } else {
        Ok(id)
    }
}

/// Parse RFC 3339, or naive ISO 8601 read as UTC.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Drops events whose type is not on the allow-list.
#[derive(Debug, Clone)]
pub struct EventFilter {
    accepted: HashSet<String>,
}

impl EventFilter {
    /// An empty allow-list accepts everything.
    pub fn new(accepted: impl IntoIterator<Item = String>) -> Self {
        Self {
            accepted: accepted.into_iter().collect(),
        }
    }

    pub fn accepts(&self, event_type: &str) -> bool {
        self.accepted.is_empty() || self.accepted.contains(event_type)
    }
}

impl Stage for EventFilter {
    type Input = Event;
    type Output = Event;

    fn apply(&self, event: Event) -> Verdict<Event> {
        if self.accepts(&event.event_type) {
            Verdict::Pass(event)
        } else {
            tracing::trace!(
                "Filtered event type {:?} for {:?}",
                event.event_type,
                event.entity_id
            );
            Verdict::Filtered
        }
    }
}

#[cfg(test)]
fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

#[test]
fn normalize_valid_record() {
    let raw = br#"{"event_type":"click","user_id":"  u1 ","timestamp":"2024-03-01T10:00:00Z","page":"/home"}"#;
    let event = Normalizer::new("user_id").normalize_at(raw, now()).unwrap();

    assert_eq!(event.event_type, "click");
    assert_eq!(event.entity_id, "u1");
    assert_eq!(
        event.timestamp,
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    );
    assert_eq!(event.processed_at, now());
    assert_eq!(event.payload.get("page"), Some(&Value::from("/home")));
    assert!(!event.payload.contains_key("user_id"));
}

#[test]
fn normalize_rejects_missing_fields() {
    let found = Normalizer::new("user_id").normalize_at(br#"{"user_id":"u1"}"#, now());
    assert_eq!(
        found,
        Err(MalformedEventError::MissingFields(vec![
            "event_type".to_string(),
            "timestamp".to_string()
        ]))
    );
}

#[test]
fn normalize_treats_null_as_missing() {
    let found = Normalizer::new("user_id").normalize_at(
        br#"{"event_type":"click","user_id":null,"timestamp":"2024-03-01T10:00:00Z"}"#,
        now(),
    );
    assert_eq!(
        found,
        Err(MalformedEventError::MissingFields(vec!["user_id".to_string()]))
    );
}

#[test]
fn normalize_rejects_non_objects() {
    let normalizer = Normalizer::new("user_id");
    assert_eq!(
        normalizer.normalize_at(b"[1, 2]", now()),
        Err(MalformedEventError::NotAnObject)
    );
    assert!(matches!(
        normalizer.normalize_at(b"not json", now()),
        Err(MalformedEventError::NotJson(_))
    ));
}

#[test]
fn normalize_rejects_blank_entity() {
    let found = Normalizer::new("user_id").normalize_at(
        br#"{"event_type":"click","user_id":"   ","timestamp":"2024-03-01T10:00:00Z"}"#,
        now(),
    );
    assert_eq!(found, Err(MalformedEventError::EmptyEntityId));
}

#[test]
fn normalize_stringifies_numeric_entity() {
    let event = Normalizer::new("user_id")
        .normalize_at(
            br#"{"event_type":"view","user_id":42,"timestamp":"2024-03-01T10:00:00Z"}"#,
            now(),
        )
        .unwrap();
    assert_eq!(event.entity_id, "42");

    let event = Normalizer::new("user_id")
        .normalize_at(
            br#"{"event_type":7,"user_id":true,"timestamp":"2024-03-01T10:00:00Z"}"#,
            now(),
        )
        .unwrap();
    assert_eq!(event.entity_id, "true");
    assert_eq!(event.event_type, "7");
}

#[test]
fn normalize_rejects_structured_ids() {
    let found = Normalizer::new("user_id").normalize_at(
        br#"{"event_type":"view","user_id":{"id":1},"timestamp":"2024-03-01T10:00:00Z"}"#,
        now(),
    );
    assert_eq!(
        found,
        Err(MalformedEventError::WrongType {
            field: "user_id".to_string(),
            found: "object",
        })
    );
}

#[test]
fn normalize_timestamp_forms() {
    let normalizer = Normalizer::new("user_id");
    let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    for ts in [
        "2024-03-01T10:00:00Z",
        "2024-03-01T11:00:00+01:00",
        "2024-03-01T10:00:00",
        "2024-03-01 10:00:00.000",
    ] {
        let raw = format!(r#"{{"event_type":"view","user_id":"u1","timestamp":"{ts}"}}"#);
        let event = normalizer.normalize_at(raw.as_bytes(), now()).unwrap();
        assert_eq!(event.timestamp, expected, "parsing {ts}");
    }
}

#[test]
fn normalize_falls_back_to_processing_time() {
    let normalizer = Normalizer::new("user_id");
    for ts in [r#""yesterday""#, "1709287200"] {
        let raw = format!(r#"{{"event_type":"view","user_id":"u1","timestamp":{ts}}}"#);
        let event = normalizer.normalize_at(raw.as_bytes(), now()).unwrap();
        assert_eq!(event.timestamp, now());
    }
}

#[test]
fn custom_entity_field() {
    let event = Normalizer::new("account")
        .normalize_at(
            br#"{"event_type":"login","account":"a-7","timestamp":"2024-03-01T10:00:00Z"}"#,
            now(),
        )
        .unwrap();
    assert_eq!(event.entity_id, "a-7");
}

#[test]
fn filter_allow_list() {
    let chain = ingest_chain(&PipelineConfig::default());
    let accepted = br#"{"event_type":"purchase","user_id":"u1","timestamp":"2024-03-01T10:00:00Z"}"#;
    let ignored = br#"{"event_type":"scroll","user_id":"u1","timestamp":"2024-03-01T10:00:00Z"}"#;

    assert!(matches!(
        chain.apply(accepted.to_vec()),
        Verdict::Pass(Event { ref event_type, .. }) if event_type == "purchase"
    ));
    assert_eq!(chain.apply(ignored.to_vec()), Verdict::Filtered);
    assert!(matches!(
        chain.apply(b"{}".to_vec()),
        Verdict::Malformed(MalformedEventError::MissingFields(_))
    ));
}

#[test]
fn empty_allow_list_accepts_all() {
    let filter = EventFilter::new(Vec::new());
    assert!(filter.accepts("anything"));
}
