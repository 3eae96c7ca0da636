//! Event Fan-Out / Chat Sync (C9).
//!
//! Subscribes to an in-container agent's event stream per active sandbox
//! and demultiplexes it two ways: many live subscribers (coalescing
//! `message.part.updated` under lag, but never dropping terminal events),
//! and a persistent `ChatSession`/`ChatMessage`/`ToolCall` history with
//! monotonic ids. One producer per sandbox, bounded channel per consumer,
//! following the single-writer/many-reader broadcast pattern the teacher
//! uses for its pool/daemon fan-out, generalized to coalescing semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::error::{Error, Result};

/// Max body size per chat message; larger content is truncated.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;
/// Max retained messages per session before bulk eviction.
pub const MAX_MESSAGES_PER_SESSION: usize = 1000;
/// Number of oldest messages evicted at once on overflow.
pub const EVICTION_BATCH: usize = 100;
/// Per-subscriber bounded channel capacity.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 512;
/// Sandbox-wide broadcast capacity (lagging beyond this drops non-terminal events).
const BROADCAST_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One event from the in-container agent's event channel.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    MessageUpdated {
        session_id: String,
        message_id: String,
        role: Role,
        content: String,
    },
    MessagePartUpdated {
        session_id: String,
        message_id: String,
        delta: String,
    },
    ToolResult {
        session_id: String,
        tool_call_id: String,
        output: String,
    },
    ToolCallUpdated {
        session_id: String,
        tool_call_id: String,
        name: String,
        input: String,
        status: ToolCallStatus,
    },
    SessionIdle {
        session_id: String,
    },
    SessionError {
        session_id: String,
        message: String,
    },
    PermissionUpdated {
        session_id: String,
        permission: String,
    },
}

impl AgentEvent {
    /// Terminal events are delivered even to a maximally-lagging
    /// subscriber; everything else may be coalesced.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::SessionIdle { .. } | AgentEvent::SessionError { .. } | AgentEvent::PermissionUpdated { .. }
        )
    }

    fn is_coalescable(&self) -> bool {
        matches!(self, AgentEvent::MessagePartUpdated { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: String,
    pub output: Option<String>,
    pub status: ToolCallStatus,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub truncated: bool,
    pub tool_calls: Vec<ToolCall>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatSessionStatus {
    Active,
    Paused,
    Completed,
    Error,
}

pub struct ChatSession {
    pub id: String,
    pub sandbox_id: String,
    pub status: ChatSessionStatus,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    messages: Vec<ChatMessage>,
    next_message_id: u64,
}

impl ChatSession {
    fn new(id: String, sandbox_id: String, working_dir: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            sandbox_id,
            status: ChatSessionStatus::Active,
            working_dir,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            next_message_id: 1,
        }
    }

    fn append_message(&mut self, role: Role, content: String) -> u64 {
        let (content, truncated) = truncate_to(content, MAX_MESSAGE_BYTES);
        let id = self.next_message_id;
        self.next_message_id += 1;
        self.messages.push(ChatMessage {
            id,
            role,
            content,
            truncated,
            tool_calls: Vec::new(),
            created_at: Utc::now(),
        });
        self.updated_at = Utc::now();
        self.evict_if_needed();
        id
    }

    fn evict_if_needed(&mut self) {
        if self.messages.len() > MAX_MESSAGES_PER_SESSION {
            let remove = EVICTION_BATCH.min(self.messages.len());
            self.messages.drain(0..remove);
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Append a streamed content delta onto the message currently being
    /// built. Starts a new assistant message if the last one isn't an
    /// in-progress assistant message (e.g. the previous turn already
    /// finished, or no message exists yet).
    fn append_delta(&mut self, delta: &str) {
        let needs_new = match self.messages.last() {
            Some(message) => message.role != Role::Assistant || message.truncated,
            None => true,
        };
        if needs_new {
            self.append_message(Role::Assistant, delta.to_string());
            return;
        }
        if let Some(message) = self.messages.last_mut() {
            let mut content = std::mem::take(&mut message.content);
            content.push_str(delta);
            let (content, truncated) = truncate_to(content, MAX_MESSAGE_BYTES);
            message.content = content;
            message.truncated = truncated;
        }
        self.updated_at = Utc::now();
    }

    fn register_tool_call(&mut self, message_id_hint: Option<u64>, tool_call_id: &str, name: &str, input: &str) {
        let target = message_id_hint
            .and_then(|id| self.messages.iter_mut().find(|m| m.id == id))
            .or_else(|| self.messages.last_mut());
        if let Some(message) = target {
            message.tool_calls.push(ToolCall {
                id: tool_call_id.to_string(),
                name: name.to_string(),
                input: input.to_string(),
                output: None,
                status: ToolCallStatus::Pending,
            });
        }
    }

    fn update_tool_call(&mut self, tool_call_id: &str, status: Option<ToolCallStatus>, output: Option<String>) {
        for message in self.messages.iter_mut() {
            if let Some(call) = message.tool_calls.iter_mut().find(|c| c.id == tool_call_id) {
                if let Some(status) = status {
                    call.status = status;
                }
                if let Some(output) = output {
                    call.output = Some(output);
                }
                return;
            }
        }
    }
}

fn truncate_to(content: String, max_bytes: usize) -> (String, bool) {
    if content.len() <= max_bytes {
        return (content, false);
    }
    let mut end = max_bytes;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    (content[..end].to_string(), true)
}

struct SandboxChannel {
    sender: broadcast::Sender<AgentEvent>,
}

/// Owns event fan-out for every active sandbox plus persisted chat
/// history, keyed by chat session id.
pub struct EventFanout {
    channels: Mutex<HashMap<String, SandboxChannel>>,
    sessions: Mutex<HashMap<String, ChatSession>>,
    message_counter: AtomicU64,
}

impl Default for EventFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFanout {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            message_counter: AtomicU64::new(0),
        }
    }

    /// (Re-)create the producer side for a sandbox. Called when the
    /// orchestrator observes the sandbox transition to `running`
    /// (including on restart, per the reconnection rule in §4.9).
    pub async fn open_producer(&self, sandbox_id: &str) -> broadcast::Sender<AgentEvent> {
        let mut channels = self.channels.lock().await;
        let entry = channels.entry(sandbox_id.to_string()).or_insert_with(|| SandboxChannel {
            sender: broadcast::channel(BROADCAST_CAPACITY).0,
        });
        entry.sender.clone()
    }

    pub async fn open_chat_session(&self, sandbox_id: &str, working_dir: &str) -> String {
        let id = format!("chat_{}", self.message_counter.fetch_add(1, Ordering::Relaxed));
        let mut sessions = self.sessions.lock().await;
        sessions.insert(id.clone(), ChatSession::new(id.clone(), sandbox_id.to_string(), working_dir.to_string()));
        id
    }

    /// Publish one event: forwards it to the sandbox's broadcast channel
    /// and, where it carries chat content, updates persisted history.
    pub async fn publish(&self, sandbox_id: &str, event: AgentEvent) -> Result<()> {
        {
            let mut sessions = self.sessions.lock().await;
            apply_to_history(&mut sessions, &event);
        }
        let channels = self.channels.lock().await;
        if let Some(channel) = channels.get(sandbox_id) {
            // No active subscribers is not an error; the event is simply dropped.
            let _ = channel.sender.send(event);
        }
        Ok(())
    }

    /// Subscribe a new live consumer for `sandbox_id`. Spawns a relay task
    /// that re-publishes from the shared broadcast into this subscriber's
    /// own bounded channel, coalescing `message.part.updated` under lag
    /// but always delivering terminal events (blocking briefly if needed).
    pub async fn subscribe(&self, sandbox_id: &str) -> Result<mpsc::Receiver<AgentEvent>> {
        let sender = {
            let channels = self.channels.lock().await;
            channels
                .get(sandbox_id)
                .map(|c| c.sender.clone())
                .ok_or_else(|| Error::not_found(format!("no active event stream for sandbox '{sandbox_id}'")))?
        };
        let mut broadcast_rx = sender.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(event) => {
                        if event.is_terminal() {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        } else if event.is_coalescable() {
                            // Drop silently if the subscriber is lagging;
                            // the next delta supersedes this one anyway.
                            let _ = tx.try_send(event);
                        } else if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    // Broadcast doesn't tell us which events a lagged
                    // receiver missed, so we can't assume none of them were
                    // terminal. Rather than silently resume and risk a
                    // missed session.idle/session.error/permission.updated,
                    // close this subscriber's channel; the caller observes
                    // the stream end and re-subscribes, then catches up via
                    // persisted chat history.
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }

    pub async fn session_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| Error::not_found(format!("chat session '{session_id}'")))?;
        Ok(session.messages().to_vec())
    }
}

impl Clone for ChatMessage {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            role: self.role,
            content: self.content.clone(),
            truncated: self.truncated,
            tool_calls: self.tool_calls.clone(),
            created_at: self.created_at,
        }
    }
}

fn apply_to_history(sessions: &mut HashMap<String, ChatSession>, event: &AgentEvent) {
    match event {
        AgentEvent::MessageUpdated {
            session_id,
            role,
            content,
            ..
        } => {
            if let Some(session) = sessions.get_mut(session_id) {
                session.append_message(*role, content.clone());
            }
        }
        AgentEvent::MessagePartUpdated { session_id, delta, .. } => {
            if let Some(session) = sessions.get_mut(session_id) {
                session.append_delta(delta);
            }
        }
        AgentEvent::ToolCallUpdated {
            session_id,
            tool_call_id,
            name,
            input,
            status,
        } => {
            if let Some(session) = sessions.get_mut(session_id) {
                session.register_tool_call(None, tool_call_id, name, input);
                session.update_tool_call(tool_call_id, Some(*status), None);
            }
        }
        AgentEvent::ToolResult {
            session_id,
            tool_call_id,
            output,
        } => {
            if let Some(session) = sessions.get_mut(session_id) {
                session.update_tool_call(tool_call_id, Some(ToolCallStatus::Completed), Some(output.clone()));
            }
        }
        AgentEvent::SessionError { session_id, .. } => {
            if let Some(session) = sessions.get_mut(session_id) {
                session.status = ChatSessionStatus::Error;
            }
        }
        AgentEvent::SessionIdle { session_id } => {
            if let Some(session) = sessions.get_mut(session_id) {
                if session.status == ChatSessionStatus::Active {
                    session.status = ChatSessionStatus::Paused;
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_after_subscribing() {
        let fanout = EventFanout::new();
        fanout.open_producer("sbx_1").await;
        let session_id = fanout.open_chat_session("sbx_1", "/home/workspace").await;
        let mut rx = fanout.subscribe("sbx_1").await.unwrap();

        fanout
            .publish(
                "sbx_1",
                AgentEvent::MessageUpdated {
                    session_id: session_id.clone(),
                    message_id: "m1".to_string(),
                    role: Role::Assistant,
                    content: "hello".to_string(),
                },
            )
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, AgentEvent::MessageUpdated { .. }));

        let messages = fanout.session_messages(&session_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn terminal_event_always_delivered_after_part_updates() {
        let fanout = EventFanout::new();
        fanout.open_producer("sbx_1").await;
        let session_id = fanout.open_chat_session("sbx_1", "/home/workspace").await;
        let mut rx = fanout.subscribe("sbx_1").await.unwrap();

        for i in 0..50 {
            fanout
                .publish(
                    "sbx_1",
                    AgentEvent::MessagePartUpdated {
                        session_id: session_id.clone(),
                        message_id: "m1".to_string(),
                        delta: format!("chunk {i}"),
                    },
                )
                .await
                .unwrap();
        }
        fanout
            .publish("sbx_1", AgentEvent::SessionIdle { session_id: session_id.clone() })
            .await
            .unwrap();

        let mut saw_idle = false;
        while let Ok(Some(event)) = tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv()).await {
            if matches!(event, AgentEvent::SessionIdle { .. }) {
                saw_idle = true;
                break;
            }
        }
        assert!(saw_idle);
    }

    #[tokio::test]
    async fn part_updates_accumulate_into_persisted_history() {
        let fanout = EventFanout::new();
        fanout.open_producer("sbx_deltas").await;
        let session_id = fanout.open_chat_session("sbx_deltas", "/home/workspace").await;

        for chunk in ["Hel", "lo, ", "world"] {
            fanout
                .publish(
                    "sbx_deltas",
                    AgentEvent::MessagePartUpdated {
                        session_id: session_id.clone(),
                        message_id: "m1".to_string(),
                        delta: chunk.to_string(),
                    },
                )
                .await
                .unwrap();
        }

        let messages = fanout.session_messages(&session_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hello, world");
        assert_eq!(messages[0].role, Role::Assistant);
    }

    #[test]
    fn message_body_truncated_at_one_mebibyte() {
        let huge = "a".repeat(MAX_MESSAGE_BYTES + 100);
        let (content, truncated) = truncate_to(huge, MAX_MESSAGE_BYTES);
        assert!(truncated);
        assert_eq!(content.len(), MAX_MESSAGE_BYTES);
    }

    #[test]
    fn eviction_drops_oldest_in_batches() {
        let mut session = ChatSession::new("s1".to_string(), "sbx".to_string(), "/home/workspace".to_string());
        for i in 0..(MAX_MESSAGES_PER_SESSION + 1) {
            session.append_message(Role::User, format!("msg {i}"));
        }
        assert_eq!(session.messages().len(), MAX_MESSAGES_PER_SESSION + 1 - EVICTION_BATCH);
        assert_eq!(session.messages()[0].content, format!("msg {EVICTION_BATCH}"));
    }

    #[test]
    fn message_ids_strictly_increasing() {
        let mut session = ChatSession::new("s1".to_string(), "sbx".to_string(), "/home/workspace".to_string());
        let a = session.append_message(Role::User, "a".to_string());
        let b = session.append_message(Role::Assistant, "b".to_string());
        assert!(b > a);
    }
}
