use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order chats expire this long after creation.
pub const ORDER_CHAT_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderChat {
    pub id: i64,
    pub order_id: i64,
    pub company_id: i64,
    pub driver_id: i64,
    pub expires_at: DateTime<Utc>,
}

impl OrderChat {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn expiry_from(now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::hours(ORDER_CHAT_TTL_HOURS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerMessage {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// Echoed back from the draft that produced this row, when there was one.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalDraft {
    pub chat_id: i64,
    pub sender_id: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChatMessage {
    Confirmed(ServerMessage),
    Pending {
        draft: LocalDraft,
        correlation_id: Uuid,
    },
}

impl ChatMessage {
    pub fn draft(draft: LocalDraft) -> Self {
        ChatMessage::Pending {
            draft,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            ChatMessage::Confirmed(message) => message.created_at,
            ChatMessage::Pending { draft, .. } => draft.created_at,
        }
    }
}

/// Merges the synced server messages with the local view. A pending draft is
/// dropped once a server message carries its correlation id; unmatched drafts
/// stay pending.
pub fn reconcile(local: &[ChatMessage], server: &[ServerMessage]) -> Vec<ChatMessage> {
    let mut merged: Vec<ChatMessage> = server
        .iter()
        .cloned()
        .map(ChatMessage::Confirmed)
        .collect();

    for message in local {
        if let ChatMessage::Pending { correlation_id, .. } = message {
            let confirmed = server
                .iter()
                .any(|row| row.correlation_id == Some(*correlation_id));
            if !confirmed {
                merged.push(message.clone());
            }
        }
    }

    merged.sort_by_key(ChatMessage::created_at);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(text: &str, at: DateTime<Utc>) -> LocalDraft {
        LocalDraft {
            chat_id: 7,
            sender_id: 3,
            message: text.to_string(),
            created_at: at,
        }
    }

    fn server(id: i64, text: &str, at: DateTime<Utc>, correlation_id: Option<Uuid>) -> ServerMessage {
        ServerMessage {
            id,
            chat_id: 7,
            sender_id: 3,
            message: text.to_string(),
            created_at: at,
            correlation_id,
        }
    }

    #[test]
    fn confirmed_draft_is_replaced_by_server_row() {
        let now = Utc::now();
        let pending = ChatMessage::draft(draft("voy llegando", now));
        let ChatMessage::Pending { correlation_id, .. } = &pending else {
            panic!("draft must be pending");
        };

        let rows = vec![server(1, "voy llegando", now, Some(*correlation_id))];
        let merged = reconcile(&[pending.clone()], &rows);

        assert_eq!(merged.len(), 1);
        assert!(matches!(merged[0], ChatMessage::Confirmed(ref row) if row.id == 1));
    }

    #[test]
    fn identical_text_without_matching_id_is_not_deduplicated() {
        let now = Utc::now();
        let pending = ChatMessage::draft(draft("ok", now));
        let rows = vec![server(1, "ok", now, None)];

        let merged = reconcile(&[pending], &rows);

        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merged_view_is_ordered_by_time() {
        let now = Utc::now();
        let earlier = now - Duration::seconds(30);
        let pending = ChatMessage::draft(draft("segundo", now));
        let rows = vec![server(1, "primero", earlier, None)];

        let merged = reconcile(&[pending], &rows);

        assert!(matches!(merged[0], ChatMessage::Confirmed(_)));
        assert!(matches!(merged[1], ChatMessage::Pending { .. }));
    }

    #[test]
    fn chat_expires_after_a_day() {
        let now = Utc::now();
        let chat = OrderChat {
            id: 1,
            order_id: 1001,
            company_id: 1,
            driver_id: 3,
            expires_at: OrderChat::expiry_from(now),
        };
        assert!(!chat.is_expired(now + Duration::hours(23)));
        assert!(chat.is_expired(now + Duration::hours(24)));
    }
}
