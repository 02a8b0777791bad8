//! Conversation context store
//!
//! The ordered message log sent to the chat model. Messages only enter the
//! store once their content is final; streaming text lives in the turn.
//! Generated images are attached by message id, never by position.

use crate::llm::ChatMessage;
use crate::{ParleyError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// An image carried by a message: a user attachment or a generated picture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageImage {
    /// Base64 image data
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default = "default_image_format")]
    pub format: String,
}

fn default_image_format() -> String {
    "png".to_string()
}

impl MessageImage {
    pub fn png(data: impl Into<String>, prompt: Option<String>) -> Self {
        Self {
            data: data.into(),
            prompt,
            format: default_image_format(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<MessageImage>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            images: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Use a pre-allocated id, e.g. the one announced in `assistant_start`
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_image(mut self, image: MessageImage) -> Self {
        self.images.push(image);
        self
    }

    pub fn to_chat(&self) -> ChatMessage {
        match self.role {
            Role::User => ChatMessage::user(&self.content),
            Role::Assistant => ChatMessage::assistant(&self.content),
        }
    }
}

/// One entry of a client-held history, as sent with `sync_history`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub images: Vec<MessageImage>,
}

/// Where an attached image ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Attached,
    /// The message is not in the store (yet); applied if it is appended later
    Pending,
    /// The message was removed or its turn never finished
    Discarded,
}

#[derive(Debug, Default)]
pub struct ContextStore {
    messages: Vec<Message>,
    pending_images: HashMap<Uuid, Vec<MessageImage>>,
    /// Ids that will never (again) be in the log. Late images for them are dropped.
    retired: HashSet<Uuid>,
}

pub type SharedContext = Arc<Mutex<ContextStore>>;

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedContext {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append at the end. Any image stashed for this id is attached now.
    pub fn append(&mut self, mut message: Message) -> Uuid {
        if let Some(images) = self.pending_images.remove(&message.id) {
            debug!("Applying {} pending image(s) to {}", images.len(), message.id);
            message.images.extend(images);
        }
        let id = message.id;
        self.retired.remove(&id);
        self.messages.push(message);
        id
    }

    pub fn edit(&mut self, index: usize, content: impl Into<String>) -> Result<()> {
        let len = self.messages.len();
        let message = self
            .messages
            .get_mut(index)
            .ok_or_else(|| out_of_range(index, len))?;
        message.content = content.into();
        Ok(())
    }

    pub fn delete(&mut self, index: usize) -> Result<Message> {
        if index >= self.messages.len() {
            return Err(out_of_range(index, self.messages.len()));
        }
        let removed = self.messages.remove(index);
        self.retired.insert(removed.id);
        Ok(removed)
    }

    /// Truncate so that `index` is the last message kept
    pub fn rewind(&mut self, index: usize) -> Result<()> {
        if index >= self.messages.len() {
            return Err(out_of_range(index, self.messages.len()));
        }
        self.truncate(index + 1);
        Ok(())
    }

    /// Drop every reply after the last user message and return its content.
    /// The log then ends on that message, ready for a fresh reply.
    pub fn rewind_to_last_user(&mut self) -> Option<String> {
        let index = self.messages.iter().rposition(|m| m.role == Role::User)?;
        let dropped = self.messages.len() - index - 1;
        if dropped > 0 {
            debug!("Dropping {} reply message(s) after the last user message", dropped);
            self.truncate(index + 1);
        }
        Some(self.messages[index].content.clone())
    }

    fn truncate(&mut self, len: usize) {
        for message in self.messages.drain(len..) {
            self.retired.insert(message.id);
        }
    }

    /// Replace the whole log with client-held history.
    ///
    /// Entries without an id keep the id and timestamp of the message already
    /// at that position when role and content match, so replaying the same
    /// history leaves the store unchanged.
    pub fn replace_all(&mut self, history: Vec<HistoryEntry>) {
        let previous = std::mem::take(&mut self.messages);

        let mut messages = Vec::with_capacity(history.len());
        for (index, entry) in history.into_iter().enumerate() {
            let matching = previous
                .get(index)
                .filter(|p| entry.id.map_or(true, |id| id == p.id))
                .filter(|p| p.role == entry.role && p.content == entry.content);

            let mut message = match matching {
                Some(existing) => Message {
                    images: entry.images.clone(),
                    ..existing.clone()
                },
                None => Message {
                    id: entry.id.unwrap_or_else(Uuid::new_v4),
                    role: entry.role,
                    content: entry.content,
                    images: entry.images.clone(),
                    timestamp: Utc::now(),
                },
            };

            // Client-held history may predate an image that finished in the background
            if message.images.is_empty() {
                if let Some(existing) = previous.iter().find(|p| p.id == message.id) {
                    message.images = existing.images.clone();
                }
            }
            if let Some(images) = self.pending_images.remove(&message.id) {
                message.images.extend(images);
            }
            self.retired.remove(&message.id);
            messages.push(message);
        }

        for dropped in previous {
            if !messages.iter().any(|m| m.id == dropped.id) {
                self.retired.insert(dropped.id);
            }
        }
        self.messages = messages;
    }

    /// Reset the log and forget pending images
    pub fn clear(&mut self) {
        self.truncate(0);
        self.pending_images.clear();
    }

    /// Give up on a message that will never be appended, e.g. the reply of a
    /// cancelled turn. Images stashed for it are dropped, as are later ones.
    pub fn forget(&mut self, id: Uuid) {
        if let Some(images) = self.pending_images.remove(&id) {
            debug!("Dropping {} pending image(s) for {}", images.len(), id);
        }
        self.retired.insert(id);
    }

    pub fn attach_image(&mut self, id: Uuid, image: MessageImage) -> Attachment {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.images.push(image);
            return Attachment::Attached;
        }
        if self.retired.contains(&id) {
            return Attachment::Discarded;
        }
        self.pending_images.entry(id).or_default().push(image);
        Attachment::Pending
    }

    /// Number of images waiting for their message
    pub fn pending_count(&self) -> usize {
        self.pending_images.values().map(Vec::len).sum()
    }

    /// True when the log ends with a user message equal to `content`. That
    /// message gets a fresh reply instead of a second copy in the log.
    pub fn is_resend(&self, content: &str) -> bool {
        self.last()
            .map(|m| m.role == Role::User && m.content.trim() == content.trim())
            .unwrap_or(false)
    }

    /// The full ordered history in chat model form
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(Message::to_chat).collect()
    }

    pub fn count(&self, role: Role) -> usize {
        self.messages.iter().filter(|m| m.role == role).count()
    }
}

fn out_of_range(index: usize, len: usize) -> ParleyError {
    ParleyError::ProtocolError(format!(
        "Message index {} out of range (history has {} messages)",
        index, len
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(n: usize) -> ContextStore {
        let mut store = ContextStore::new();
        for i in 0..n {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store.append(Message::new(role, format!("message {}", i)));
        }
        store
    }

    fn entries(store: &ContextStore) -> Vec<HistoryEntry> {
        store
            .messages()
            .iter()
            .map(|m| HistoryEntry {
                id: None,
                role: m.role,
                content: m.content.clone(),
                images: Vec::new(),
            })
            .collect()
    }

    #[test]
    fn test_append_preserves_order() {
        let store = store_with(3);
        let contents: Vec<_> = store.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["message 0", "message 1", "message 2"]);
    }

    #[test]
    fn test_edit_delete_bounds() {
        let mut store = store_with(2);
        store.edit(1, "edited").unwrap();
        assert_eq!(store.messages()[1].content, "edited");
        match store.edit(5, "nope") {
            Err(ParleyError::ProtocolError(message)) => assert!(message.contains("has 2 messages")),
            other => panic!("unexpected result: {:?}", other),
        }

        let removed = store.delete(0).unwrap();
        assert_eq!(removed.content, "message 0");
        assert_eq!(store.len(), 1);
        assert!(store.delete(1).is_err());
    }

    #[test]
    fn test_rewind_then_append() {
        let mut store = store_with(5);
        store.rewind(2).unwrap();
        assert_eq!(store.len(), 3);

        store.append(Message::user("again"));
        store.append(Message::assistant("reply"));
        assert_eq!(store.len(), 2 + 1 + 2);
        assert!(store.rewind(10).is_err());
    }

    #[test]
    fn test_replace_all_is_idempotent() {
        let mut store = ContextStore::new();
        let history = vec![
            HistoryEntry {
                id: None,
                role: Role::User,
                content: "hi".into(),
                images: Vec::new(),
            },
            HistoryEntry {
                id: None,
                role: Role::Assistant,
                content: "hello!".into(),
                images: Vec::new(),
            },
        ];

        store.replace_all(history.clone());
        let first = store.messages().to_vec();
        store.replace_all(history);
        assert_eq!(store.messages(), first.as_slice());
    }

    #[test]
    fn test_replace_all_keeps_supplied_ids() {
        let mut store = ContextStore::new();
        let id = Uuid::new_v4();
        store.replace_all(vec![HistoryEntry {
            id: Some(id),
            role: Role::User,
            content: "hi".into(),
            images: Vec::new(),
        }]);
        assert_eq!(store.messages()[0].id, id);
    }

    #[test]
    fn test_replace_all_keeps_background_images() {
        let mut store = store_with(2);
        let id = store.messages()[1].id;
        store.attach_image(id, MessageImage::png("abc", None));

        let history = entries(&store);
        store.replace_all(history);
        assert_eq!(store.messages()[1].images.len(), 1);
    }

    #[test]
    fn test_attach_image_by_id_and_pending() {
        let mut store = store_with(2);
        let stale = store.messages()[1].id;
        store.append(Message::user("next turn"));

        assert_eq!(
            store.attach_image(stale, MessageImage::png("img", Some("beach".into()))),
            Attachment::Attached
        );
        assert_eq!(store.get(stale).unwrap().images.len(), 1);
        assert!(store.last().unwrap().images.is_empty());

        let future = Uuid::new_v4();
        assert_eq!(
            store.attach_image(future, MessageImage::png("img2", None)),
            Attachment::Pending
        );
        store.append(Message::assistant("late reply").with_id(future));
        assert_eq!(store.get(future).unwrap().images.len(), 1);
    }

    #[test]
    fn test_clear_drops_pending_images() {
        let mut store = store_with(1);
        let future = Uuid::new_v4();
        store.attach_image(future, MessageImage::png("img", None));
        store.clear();
        assert!(store.is_empty());

        store.append(Message::assistant("reply").with_id(future));
        assert!(store.last().unwrap().images.is_empty());
    }

    #[test]
    fn test_rewind_to_last_user_drops_replies() {
        let mut store = store_with(4);
        let replaced = store.messages()[3].id;

        assert_eq!(store.rewind_to_last_user().as_deref(), Some("message 2"));
        assert_eq!(store.len(), 3);
        assert_eq!(store.last().unwrap().role, Role::User);

        // Nothing to drop the second time
        assert_eq!(store.rewind_to_last_user().as_deref(), Some("message 2"));
        assert_eq!(store.len(), 3);

        // A late image for the replaced reply is not kept around
        assert_eq!(
            store.attach_image(replaced, MessageImage::png("img", None)),
            Attachment::Discarded
        );
        assert_eq!(store.pending_count(), 0);

        assert!(ContextStore::new().rewind_to_last_user().is_none());
    }

    #[test]
    fn test_forget_drops_images_of_unfinished_reply() {
        let mut store = store_with(1);
        let abandoned = Uuid::new_v4();
        store.attach_image(abandoned, MessageImage::png("early", None));
        assert_eq!(store.pending_count(), 1);

        store.forget(abandoned);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(
            store.attach_image(abandoned, MessageImage::png("late", None)),
            Attachment::Discarded
        );
        assert_eq!(store.pending_count(), 0);

        // A client resync that brings the message back accepts images again
        store.replace_all(vec![HistoryEntry {
            id: Some(abandoned),
            role: Role::Assistant,
            content: "partial".into(),
            images: Vec::new(),
        }]);
        assert_eq!(
            store.attach_image(abandoned, MessageImage::png("again", None)),
            Attachment::Attached
        );
    }

    #[test]
    fn test_deleted_message_does_not_collect_images() {
        let mut store = store_with(2);
        let removed = store.delete(1).unwrap();
        assert_eq!(
            store.attach_image(removed.id, MessageImage::png("img", None)),
            Attachment::Discarded
        );

        let cleared = store.messages()[0].id;
        store.clear();
        store.attach_image(cleared, MessageImage::png("img", None));
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_resend_detection() {
        let mut store = ContextStore::new();
        assert!(!store.is_resend("hello"));
        store.append(Message::user("hello"));
        assert!(store.is_resend(" hello "));
        assert!(!store.is_resend("something else"));

        // Saying the same thing again after a reply is a new message
        store.append(Message::assistant("hi there"));
        assert!(!store.is_resend("hello"));
    }

    #[test]
    fn test_history_entry_deserializes_minimal() {
        let entry: HistoryEntry =
            serde_json::from_str(r#"{"role":"assistant","content":"hey"}"#).unwrap();
        assert_eq!(entry.role, Role::Assistant);
        assert!(entry.id.is_none());
    }
}
