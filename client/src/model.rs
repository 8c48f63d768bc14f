use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single chat message. Immutable once constructed.
///
/// History responses use `{author, body, sentAt}`; the live `message` event
/// uses `{username, message, sent_at}`. Both shapes decode into this type,
/// and the timestamp may be an RFC 3339 string or epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage")]
pub struct ChatMessage {
    pub author: String,
    pub body: String,
    #[serde(rename = "sentAt")]
    pub sent_at: DateTime<Utc>,
}

/// Every key a server may use for a message. When more than one spelling is
/// present the first listed wins.
#[derive(Deserialize)]
struct WireMessage {
    author: Option<String>,
    username: Option<String>,
    body: Option<String>,
    message: Option<String>,
    #[serde(rename = "sentAt")]
    sent_at_camel: Option<WireTimestamp>,
    sent_at: Option<WireTimestamp>,
    timestamp: Option<WireTimestamp>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Text(DateTime<Utc>),
    Millis(i64),
}

impl WireTimestamp {
    fn into_datetime(self) -> Result<DateTime<Utc>, String> {
        match self {
            WireTimestamp::Text(dt) => Ok(dt),
            WireTimestamp::Millis(ms) => DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| format!("timestamp {ms} out of range")),
        }
    }
}

impl TryFrom<WireMessage> for ChatMessage {
    type Error = String;

    fn try_from(w: WireMessage) -> Result<Self, Self::Error> {
        let author = w.author.or(w.username).ok_or("missing field `author`")?;
        let body = w.body.or(w.message).ok_or("missing field `body`")?;
        let sent_at = w
            .sent_at_camel
            .or(w.sent_at)
            .or(w.timestamp)
            .ok_or("missing field `sentAt`")?
            .into_datetime()?;
        Ok(Self {
            author,
            body,
            sent_at,
        })
    }
}

impl ChatMessage {
    pub fn new(author: impl Into<String>, body: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            author: author.into(),
            body: body.into(),
            sent_at,
        }
    }
}

/// Concatenate `new_ones` after `current`, keeping both sides in order.
///
/// No deduplication and no `sent_at` ordering check: two identical messages
/// are two timeline entries.
pub fn append_messages(
    mut current: Vec<ChatMessage>,
    new_ones: impl IntoIterator<Item = ChatMessage>,
) -> Vec<ChatMessage> {
    current.extend(new_ones);
    current
}

// ── Occupants ───────────────────────────────────────────────────────

/// Stable occupant identifier. Servers send either numeric or string ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OccupantId {
    Number(i64),
    Text(String),
}

impl fmt::Display for OccupantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OccupantId::Number(n) => write!(f, "{n}"),
            OccupantId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for OccupantId {
    fn from(n: i64) -> Self {
        OccupantId::Number(n)
    }
}

impl From<&str> for OccupantId {
    fn from(s: &str) -> Self {
        OccupantId::Text(s.to_string())
    }
}

/// A room occupant. Only `id` is guaranteed; every other field (`username`,
/// `status`, ...) is carried opaquely so roster updates can merge them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occupant {
    pub id: OccupantId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Occupant {
    pub fn new(id: impl Into<OccupantId>, username: impl Into<String>) -> Self {
        Self::bare(id).with_field("username", username.into())
    }

    /// An occupant record with no fields besides its id (a partial update).
    pub fn bare(id: impl Into<OccupantId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn username(&self) -> Option<&str> {
        self.fields.get("username").and_then(Value::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Label shown in a roster list: the viewer sees themselves as "You".
    pub fn display_name(&self, viewer: &str) -> String {
        match self.username() {
            Some(name) if name == viewer => "You".to_string(),
            Some(name) => name.to_string(),
            None => self.id.to_string(),
        }
    }

    /// Overlay `incoming` onto this record. Incoming fields win, untouched fields stay.
    fn absorb(&mut self, incoming: &Occupant) {
        for (key, value) in &incoming.fields {
            self.fields.insert(key.clone(), value.clone());
        }
    }
}

/// Occupants of a room in first-seen order, unique by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    entries: Vec<Occupant>,
    /// id -> position in `entries`.
    index: HashMap<OccupantId, usize>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &OccupantId) -> Option<&Occupant> {
        self.index.get(id).map(|&pos| &self.entries[pos])
    }

    pub fn contains(&self, id: &OccupantId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Occupant> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[Occupant] {
        &self.entries
    }

    fn upsert(&mut self, incoming: &Occupant) {
        match self.index.get(&incoming.id) {
            Some(&pos) => self.entries[pos].absorb(incoming),
            None => {
                self.index.insert(incoming.id.clone(), self.entries.len());
                self.entries.push(incoming.clone());
            }
        }
    }
}

impl FromIterator<Occupant> for Roster {
    fn from_iter<I: IntoIterator<Item = Occupant>>(iter: I) -> Self {
        let incoming: Vec<Occupant> = iter.into_iter().collect();
        merge_roster(Roster::new(), &incoming)
    }
}

/// Merge a roster update into `current`.
///
/// Known ids are updated in place (field-level, incoming wins); unknown ids
/// are appended in the order they appear in `incoming`. Nothing is ever
/// removed, so an occupant who left the room stays listed.
pub fn merge_roster(mut current: Roster, incoming: &[Occupant]) -> Roster {
    for occupant in incoming {
        current.upsert(occupant);
    }
    current
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn roster(v: Value) -> Roster {
        let occupants: Vec<Occupant> = serde_json::from_value(v).unwrap();
        occupants.into_iter().collect()
    }

    fn occupants(v: Value) -> Vec<Occupant> {
        serde_json::from_value(v).unwrap()
    }

    fn ids(r: &Roster) -> Vec<String> {
        r.iter().map(|o| o.id.to_string()).collect()
    }

    #[test]
    fn test_message_decodes_history_shape() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "author": "bob",
            "body": "hi",
            "sentAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(msg, ChatMessage::new("bob", "hi", ts(1_704_067_200)));
    }

    #[test]
    fn test_message_decodes_live_shape() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "username": "carol",
            "message": "hello there",
            "sent_at": "2024-01-01T00:00:05Z"
        }))
        .unwrap();
        assert_eq!(msg.author, "carol");
        assert_eq!(msg.body, "hello there");
        assert_eq!(msg.sent_at, ts(1_704_067_205));
    }

    #[test]
    fn test_message_missing_field_rejected() {
        let result: Result<ChatMessage, _> =
            serde_json::from_value(json!({ "author": "bob", "body": "hi" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_message_accepts_epoch_millis() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "username": "bob",
            "message": "hi",
            "sent_at": 1_704_067_200_000i64
        }))
        .unwrap();
        assert_eq!(msg, ChatMessage::new("bob", "hi", ts(1_704_067_200)));
    }

    #[test]
    fn test_message_with_both_timestamp_keys() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "author": "bob",
            "username": "bob",
            "body": "hi",
            "sent_at": "2024-01-01T00:00:09Z",
            "sentAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(msg.sent_at, ts(1_704_067_200));
    }

    #[test]
    fn test_message_serializes_history_shape() {
        assert_eq!(
            serde_json::to_value(ChatMessage::new("bob", "hi", ts(1_704_067_200))).unwrap(),
            json!({ "author": "bob", "body": "hi", "sentAt": "2024-01-01T00:00:00Z" })
        );
    }

    #[test]
    fn test_append_is_concatenation() {
        let a = vec![ChatMessage::new("a", "1", ts(10)), ChatMessage::new("b", "2", ts(5))];
        let b = vec![ChatMessage::new("c", "3", ts(1))];
        let out = append_messages(a.clone(), b.clone());
        assert_eq!(out.len(), a.len() + b.len());
        assert_eq!(&out[..2], &a[..]);
        assert_eq!(&out[2..], &b[..]);
    }

    #[test]
    fn test_append_keeps_duplicates() {
        let m = ChatMessage::new("bob", "hi", ts(0));
        let out = append_messages(vec![m.clone()], vec![m.clone()]);
        assert_eq!(out, vec![m.clone(), m]);
    }

    #[test]
    fn test_occupant_id_accepts_numbers_and_strings() {
        let list = occupants(json!([{ "id": 1 }, { "id": "sock-abc" }]));
        assert_eq!(list[0].id, OccupantId::Number(1));
        assert_eq!(list[1].id, OccupantId::Text("sock-abc".into()));
    }

    #[test]
    fn test_occupant_without_id_rejected() {
        let result: Result<Vec<Occupant>, _> = serde_json::from_value(json!([{ "username": "x" }]));
        assert!(result.is_err());
    }

    #[test]
    fn test_merge_updates_and_appends() {
        let current = roster(json!([{ "id": 1, "username": "bob" }]));
        let incoming = occupants(json!([
            { "id": 1, "username": "bob", "status": "typing" },
            { "id": 2, "username": "carol" }
        ]));
        let merged = merge_roster(current, &incoming);
        assert_eq!(merged, roster(json!([
            { "id": 1, "username": "bob", "status": "typing" },
            { "id": 2, "username": "carol" }
        ])));
    }

    #[test]
    fn test_merge_retains_unspecified_fields() {
        let current = roster(json!([{ "id": 1, "username": "bob", "status": "away" }]));
        let merged = merge_roster(current, &occupants(json!([{ "id": 1, "status": "online" }])));
        let bob = merged.get(&OccupantId::Number(1)).unwrap();
        assert_eq!(bob.username(), Some("bob"));
        assert_eq!(bob.field("status"), Some(&json!("online")));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let current = roster(json!([{ "id": 1, "username": "bob" }, { "id": 3, "username": "dan" }]));
        let update = occupants(json!([
            { "id": 3, "status": "idle" },
            { "id": 2, "username": "carol" },
            { "id": 2, "avatar": "c.png" }
        ]));
        let once = merge_roster(current, &update);
        let twice = merge_roster(once.clone(), &update);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_never_shrinks_and_keeps_order() {
        let current = roster(json!([
            { "id": "a", "username": "ann" },
            { "id": "b", "username": "ben" },
            { "id": "c", "username": "cat" }
        ]));
        let before = ids(&current);
        // An update that only mentions some occupants, in reverse order.
        let merged = merge_roster(
            current,
            &occupants(json!([{ "id": "c" }, { "id": "d", "username": "dee" }, { "id": "a" }])),
        );
        assert!(merged.len() >= before.len());
        assert_eq!(ids(&merged), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_merge_new_occupants_keep_incoming_order() {
        let merged = merge_roster(
            Roster::new(),
            &occupants(json!([{ "id": 9 }, { "id": 4 }, { "id": 7 }])),
        );
        assert_eq!(ids(&merged), vec!["9", "4", "7"]);
    }

    #[test]
    fn test_merge_empty_update_is_noop() {
        let current = roster(json!([{ "id": 1, "username": "bob" }]));
        assert_eq!(merge_roster(current.clone(), &[]), current);
    }

    #[test]
    fn test_display_name_marks_viewer() {
        let me = Occupant::new(1, "alice");
        let other = Occupant::new(2, "bob");
        let anon = Occupant::bare("sock-1");
        assert_eq!(me.display_name("alice"), "You");
        assert_eq!(other.display_name("alice"), "bob");
        assert_eq!(anon.display_name("alice"), "sock-1");
    }

    #[test]
    fn test_occupant_serializes_flat() {
        let occ = Occupant::new(1, "bob").with_field("status", "typing");
        assert_eq!(
            serde_json::to_value(&occ).unwrap(),
            json!({ "id": 1, "username": "bob", "status": "typing" })
        );
    }
}
