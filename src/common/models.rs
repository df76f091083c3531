// Models shared by the sync engine, the REST client and the wire codec
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::common::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Chat,
    /// Liveness announce sent once per connection, never stored.
    Join,
    /// Membership/lifecycle notice. `LEAVE` is the older name for it.
    #[serde(alias = "LEAVE")]
    System,
}

/// Whether a stored message has been seen in a server broadcast yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Optimistic echo of a message we sent ourselves.
    Pending,
    Confirmed,
}

/// One chat message, as sent over the socket and kept in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "groupId")]
    pub room_id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

impl Message {
    /// Builds an outbound chat message with a fresh local id.
    pub fn chat(room_id: &str, sender: &str, content: &str) -> Self {
        Self {
            id: local_id(),
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            kind: MessageKind::Chat,
        }
    }

    pub fn join(room_id: &str, sender: &str) -> Self {
        Self {
            id: local_id(),
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            content: format!("{} joined the chat", sender),
            timestamp: Utc::now(),
            kind: MessageKind::Join,
        }
    }

    /// Locally synthesized notice; never sent to the server.
    pub fn system(room_id: &str, content: &str) -> Self {
        Self {
            id: local_id(),
            room_id: room_id.to_string(),
            sender: "System".to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            kind: MessageKind::System,
        }
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn local_id() -> String {
    format!("local-{}", uuid::Uuid::new_v4())
}

/// Parses the timestamps the backend emits: RFC 3339 with an offset, or a
/// zone-less ISO local date-time which is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Loosely typed message as it arrives from the socket or a history page.
/// Every field is optional so that validation can decide what to drop.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
    #[serde(default, alias = "roomId", deserialize_with = "opt_string_or_number")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<MessageKind>,
}

impl WireMessage {
    /// Validates a realtime frame. A missing id is replaced by a local one;
    /// missing room, content or timestamp make the frame malformed.
    pub fn into_frame(self) -> Result<Message, SyncError> {
        let room_id = non_empty(self.group_id)
            .ok_or_else(|| SyncError::MalformedMessage("missing groupId".to_string()))?;
        let content = non_empty(self.content)
            .ok_or_else(|| SyncError::MalformedMessage("missing content".to_string()))?;
        let timestamp = self
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .ok_or_else(|| SyncError::MalformedMessage("missing or invalid timestamp".to_string()))?;

        Ok(Message {
            id: non_empty(self.id).unwrap_or_else(local_id),
            room_id,
            sender: self.sender.unwrap_or_default(),
            content,
            timestamp,
            kind: self.kind.unwrap_or(MessageKind::Chat),
        })
    }

    /// Validates a persisted history item; anything without an id, content
    /// and timestamp is discarded. Items without a room belong to `room_id`.
    pub fn into_history_item(self, room_id: &str) -> Option<Message> {
        let id = non_empty(self.id)?;
        let content = non_empty(self.content)?;
        let timestamp = parse_timestamp(self.timestamp.as_deref()?)?;

        Some(Message {
            id,
            room_id: non_empty(self.group_id).unwrap_or_else(|| room_id.to_string()),
            sender: self.sender.unwrap_or_default(),
            content,
            timestamp,
            kind: self.kind.unwrap_or(MessageKind::Chat),
        })
    }
}

/// Decodes one text frame received from the socket.
pub fn decode_frame(text: &str) -> Result<Message, SyncError> {
    let wire: WireMessage = serde_json::from_str(text)?;
    wire.into_frame()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Body of `GET /messages/group/{roomId}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub has_more: bool,
}

impl HistoryResponse {
    pub fn into_page(self, room_id: &str) -> HistoryPage {
        let total = self.messages.len();
        let messages: Vec<Message> = self
            .messages
            .into_iter()
            .filter_map(|raw| serde_json::from_value::<WireMessage>(raw).ok())
            .filter_map(|wire| wire.into_history_item(room_id))
            .collect();

        if messages.len() < total {
            log::debug!(
                "[HISTORY] Discarded {} invalid history items for room {}",
                total - messages.len(),
                room_id
            );
        }

        HistoryPage {
            messages,
            has_more: self.has_more,
        }
    }
}

/// A validated history page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOwner {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub username: String,
}

/// Entry of `GET /groups/user/{username}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_by: Option<GroupOwner>,
}

/// Body of `GET /groups/{roomId}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDetails {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub created_by: Option<GroupOwner>,
    #[serde(default)]
    pub members: Vec<GroupMember>,
}

impl GroupDetails {
    pub fn admin(&self) -> Option<&str> {
        self.created_by.as_ref().map(|owner| owner.username.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGroup {
    pub name: String,
    pub creator_username: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMembers {
    pub usernames: Vec<String>,
    pub added_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decodes_frame_with_numeric_ids() {
        let text = r#"{"id":99,"groupId":42,"sender":"bob","content":"hi","timestamp":"2024-05-01T10:00:00.250Z","type":"CHAT"}"#;
        let msg = decode_frame(text).expect("valid frame");

        assert_eq!(msg.id, "99");
        assert_eq!(msg.room_id, "42");
        assert_eq!(msg.kind, MessageKind::Chat);
        assert_eq!(
            msg.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn frame_without_id_gets_local_id() {
        let text = r#"{"roomId":"7","sender":"bob","content":"hi","timestamp":"2024-05-01T10:00:00Z"}"#;
        let msg = decode_frame(text).expect("valid frame");
        assert!(msg.id.starts_with("local-"));
        assert_eq!(msg.room_id, "7");
    }

    #[test]
    fn frame_missing_content_is_malformed() {
        let text = r#"{"id":"1","groupId":"7","sender":"bob","timestamp":"2024-05-01T10:00:00Z"}"#;
        assert!(matches!(decode_frame(text), Err(SyncError::MalformedMessage(_))));
        assert!(matches!(decode_frame("not json"), Err(SyncError::Json(_))));
    }

    #[test]
    fn leave_is_read_as_system() {
        let text = r#"{"id":"1","groupId":"7","sender":"System","content":"bye","timestamp":"2024-05-01T10:00:00Z","type":"LEAVE"}"#;
        assert_eq!(decode_frame(text).unwrap().kind, MessageKind::System);
    }

    #[test]
    fn local_date_time_is_taken_as_utc() {
        let parsed = parse_timestamp("2024-05-01T10:00:00.5").expect("parses");
        assert_eq!(
            parsed,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::milliseconds(500)
        );
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn history_page_drops_incomplete_items() {
        let body = r#"{
            "messages": [
                {"id":"1","sender":"a","content":"one","timestamp":"2024-05-01T10:00:00Z"},
                {"id":"2","sender":"a","content":"","timestamp":"2024-05-01T10:00:01Z"},
                {"sender":"a","content":"three","timestamp":"2024-05-01T10:00:02Z"},
                {"id":"4","sender":"a","content":"four"},
                null,
                {"id":5,"groupId":42,"sender":"b","content":"five","timestamp":"2024-05-01T10:00:04Z","type":"SYSTEM"}
            ],
            "hasMore": true
        }"#;
        let response: HistoryResponse = serde_json::from_str(body).unwrap();
        let page = response.into_page("42");

        assert!(page.has_more);
        let ids: Vec<&str> = page.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "5"]);
        assert_eq!(page.messages[0].room_id, "42");
        assert_eq!(page.messages[1].kind, MessageKind::System);
    }

    #[test]
    fn outbound_chat_serializes_backend_field_names() {
        let msg = Message::chat("42", "alice", "hello");
        let v: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(v["groupId"], "42");
        assert_eq!(v["sender"], "alice");
        assert_eq!(v["content"], "hello");
        assert_eq!(v["type"], "CHAT");
        assert!(v["id"].as_str().unwrap().starts_with("local-"));
        assert!(parse_timestamp(v["timestamp"].as_str().unwrap()).is_some());
    }

    #[test]
    fn group_details_reads_admin_and_members() {
        let body = r#"{"id":42,"name":"Hikers","createdBy":{"username":"alice"},"members":[{"id":1,"username":"alice"},{"id":"2","username":"bob"}]}"#;
        let details: GroupDetails = serde_json::from_str(body).unwrap();
        assert_eq!(details.admin(), Some("alice"));
        assert_eq!(details.members.len(), 2);
        assert_eq!(details.members[1].id, "2");
    }
}
