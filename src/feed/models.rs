use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Row event kinds a channel can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeEvent {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

impl ChangeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEvent::Insert => "INSERT",
            ChangeEvent::Update => "UPDATE",
            ChangeEvent::Delete => "DELETE",
            ChangeEvent::All => "*",
        }
    }

    /// `All` accepts every concrete event; the others only accept themselves.
    pub fn accepts(&self, event: ChangeEvent) -> bool {
        *self == ChangeEvent::All || *self == event
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a channel listens to: `{event, schema, table, filter}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSpec {
    pub event: ChangeEvent,
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl EventSpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            event: ChangeEvent::All,
            schema: "public".to_string(),
            table: table.into(),
            filter: None,
        }
    }

    pub fn event(mut self, event: ChangeEvent) -> Self {
        self.event = event;
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Local evaluation of the spec against a payload. Remote services do their
    /// own filtering; this is for in-process feeds.
    pub fn matches(&self, payload: &ChangePayload) -> bool {
        if payload.schema != self.schema || payload.table != self.table {
            return false;
        }
        if !self.event.accepts(payload.event_type) {
            return false;
        }
        match self.filter.as_deref() {
            None => true,
            Some(raw) => match RowFilter::parse(raw) {
                Some(filter) => filter.matches(payload.row()),
                None => false,
            },
        }
    }
}

/// Column-equality predicate in the `column=eq.value` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (column, rest) = raw.split_once('=')?;
        let value = rest.strip_prefix("eq.")?;
        if column.is_empty() {
            return None;
        }
        Some(Self::eq(column, value))
    }

    pub fn matches(&self, row: &Value) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// A single row change delivered by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    pub event_type: ChangeEvent,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub new: Value,
    #[serde(default)]
    pub old: Value,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangePayload {
    pub fn update(table: impl Into<String>, new: Value) -> Self {
        Self {
            event_type: ChangeEvent::Update,
            schema: "public".to_string(),
            table: table.into(),
            new,
            old: Value::Null,
            commit_timestamp: None,
        }
    }

    /// The row the change is about: the new row, or the old one for deletes.
    pub fn row(&self) -> &Value {
        if self.event_type == ChangeEvent::Delete {
            &self.old
        } else {
            &self.new
        }
    }
}

/// Subscription status values reported by the feed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelStatus::ChannelError | ChannelStatus::TimedOut)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
            ChannelStatus::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_filter_parse() {
        let filter = RowFilter::parse("plicoId=eq.p1").unwrap();
        assert_eq!(filter, RowFilter::eq("plicoId", "p1"));
        assert_eq!(filter.to_string(), "plicoId=eq.p1");
    }

    #[test]
    fn test_row_filter_rejects_other_operators() {
        assert!(RowFilter::parse("votes=gt.3").is_none());
        assert!(RowFilter::parse("=eq.3").is_none());
        assert!(RowFilter::parse("nonsense").is_none());
    }

    #[test]
    fn test_row_filter_matches_numbers_and_strings() {
        let by_id = RowFilter::eq("plicoId", "p1");
        assert!(by_id.matches(&json!({"plicoId": "p1"})));
        assert!(!by_id.matches(&json!({"plicoId": "p2"})));
        assert!(!by_id.matches(&json!({"other": "p1"})));

        let by_num = RowFilter::eq("plicoId", "42");
        assert!(by_num.matches(&json!({"plicoId": 42})));
    }

    #[test]
    fn test_spec_matches_event_table_and_filter() {
        let spec = EventSpec::new("Option")
            .event(ChangeEvent::Update)
            .filter("plicoId=eq.p1");

        let hit = ChangePayload::update("Option", json!({"id": "opt-1", "plicoId": "p1"}));
        assert!(spec.matches(&hit));

        let other_poll = ChangePayload::update("Option", json!({"id": "opt-1", "plicoId": "p2"}));
        assert!(!spec.matches(&other_poll));

        let other_table = ChangePayload::update("Plico", json!({"plicoId": "p1"}));
        assert!(!spec.matches(&other_table));

        let mut insert = hit.clone();
        insert.event_type = ChangeEvent::Insert;
        assert!(!spec.matches(&insert));
        assert!(spec.clone().event(ChangeEvent::All).matches(&insert));
    }

    #[test]
    fn test_event_serializes_as_wire_tag() {
        assert_eq!(serde_json::to_value(ChangeEvent::All).unwrap(), json!("*"));
        assert_eq!(
            serde_json::from_value::<ChangeEvent>(json!("UPDATE")).unwrap(),
            ChangeEvent::Update
        );
    }
}
