//! Slack Web API transport.
//!
//! `connect` validates the token and snapshots the user and channel
//! directories; a listener task then polls `conversations.history` per
//! channel and feeds the session's event queue. Outbound text goes through
//! `chat.postMessage`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::transport::{Channel, Event, Message, Transport, UserProfile};

const SLACK_API: &str = "https://slack.com/api";

/// History page size per poll. A channel that receives more messages than
/// this within one poll interval loses the oldest ones; 100 is the API's
/// default page size and well above the traffic this bot is pointed at.
const HISTORY_POLL_LIMIT: &str = "100";

pub struct SlackTransport {
    token: String,
    client: reqwest::Client,
    users: Vec<UserProfile>,
    channels: Vec<Channel>,
    poll_interval: Duration,
}

impl SlackTransport {
    /// Connect to the workspace: verify the token via `auth.test`, then
    /// snapshot `users.list` and `conversations.list`.
    pub async fn connect(token: String, poll_interval: Duration) -> Result<Self, String> {
        let client = reqwest::Client::new();

        let auth = call_api(&client, &token, "auth.test", &[]).await?;
        if auth.get("ok") != Some(&serde_json::Value::Bool(true)) {
            let err = auth.get("error").and_then(|e| e.as_str()).unwrap_or("unknown");
            return Err(format!("auth.test failed: {err}"));
        }

        let users_json = call_api(&client, &token, "users.list", &[]).await?;
        let users = parse_users(&users_json)?;

        let channels_json = call_api(&client, &token, "conversations.list", &[]).await?;
        let channels = parse_channels(&channels_json)?;

        info!(
            "connected to Slack ({} users, {} channels)",
            users.len(),
            channels.len()
        );

        Ok(Self { token, client, users, channels, poll_interval })
    }

    /// Emit `Start`, then poll each channel's history forever. A channel
    /// stays quiet until its first successful poll, which only primes its
    /// cursor, so history from before the session is never replayed — not
    /// even when early polls fail.
    pub fn spawn_listener(self: Arc<Self>, tx: mpsc::Sender<Event>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if tx.send(Event::Start).await.is_err() {
                return;
            }

            let mut state = PollState::new();
            loop {
                if tx.is_closed() {
                    return;
                }
                for channel in &self.channels {
                    let cursor = state.cursor(&channel.id).map(str::to_string);
                    let result = self
                        .poll_channel(&channel.id, cursor.as_deref(), &tx, state.quiet(&channel.id))
                        .await;
                    match result {
                        Ok(newest) => state.record_success(&channel.id, newest),
                        Err(e) => warn!("history poll failed for {}: {e}", channel.id),
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }

    /// One history poll for one channel. Emits events for messages newer
    /// than `oldest` (unless `quiet`) and returns the newest ts seen, or
    /// `Err` when the poll itself failed and the cursor must not advance.
    async fn poll_channel(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        tx: &mpsc::Sender<Event>,
        quiet: bool,
    ) -> Result<Option<String>, String> {
        let mut params = vec![
            ("channel", channel_id.to_string()),
            ("limit", HISTORY_POLL_LIMIT.to_string()),
        ];
        if let Some(ts) = oldest {
            params.push(("oldest", ts.to_string()));
        }

        let data = call_api(&self.client, &self.token, "conversations.history", &params).await?;
        let Some(items) = data.get("messages").and_then(|m| m.as_array()) else {
            let err = data
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("missing messages array");
            return Err(format!("conversations.history failed: {err}"));
        };

        let mut newest: Option<String> = None;
        // Slack returns newest first; reverse so events go out in arrival order
        for item in items.iter().rev() {
            let ts = item.get("ts").and_then(|t| t.as_str()).unwrap_or("");
            if ts.is_empty() || oldest.is_some_and(|o| ts <= o) {
                continue;
            }
            newest = Some(ts.to_string());
            if quiet {
                continue;
            }
            let Some(message) = message_from_history_item(item, channel_id) else {
                continue;
            };
            if tx.send(Event::Message(message)).await.is_err() {
                return Ok(newest);
            }
        }
        Ok(newest)
    }

    fn resolve_channel_id(&self, channel_name: &str) -> String {
        // chat.postMessage wants an id; fall back to the raw name, which the
        // API also accepts for public channels
        self.channels
            .iter()
            .find(|channel| channel.name == channel_name)
            .map(|channel| channel.id.clone())
            .unwrap_or_else(|| channel_name.to_string())
    }
}

impl Transport for SlackTransport {
    fn users(&self) -> Vec<UserProfile> {
        self.users.clone()
    }

    fn channels(&self) -> Vec<Channel> {
        self.channels.clone()
    }

    fn post_to_channel(
        &self,
        channel_name: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), String>> + Send {
        let body = serde_json::json!({
            "channel": self.resolve_channel_id(channel_name),
            "text": text,
            "as_user": true,
        });
        let request = self
            .client
            .post(format!("{SLACK_API}/chat.postMessage"))
            .bearer_auth(&self.token)
            .json(&body);

        async move {
            let resp = request
                .send()
                .await
                .map_err(|e| format!("chat.postMessage request failed: {e}"))?;
            let status = resp.status();
            let body = resp
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
            if !status.is_success() {
                return Err(format!("chat.postMessage failed ({status}): {body}"));
            }

            // Slack reports most application errors with HTTP 200 and ok=false
            let parsed: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
            if parsed.get("ok") == Some(&serde_json::Value::Bool(false)) {
                let err = parsed
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("unknown");
                return Err(format!("chat.postMessage failed: {err}"));
            }
            Ok(())
        }
    }
}

/// Per-channel polling state. A channel is quiet (events suppressed) until
/// its first successful poll has primed it; a failed poll leaves both the
/// cursor and the quiet flag untouched.
struct PollState {
    cursors: HashMap<String, String>,
    primed: std::collections::HashSet<String>,
}

impl PollState {
    fn new() -> Self {
        Self {
            cursors: HashMap::new(),
            primed: std::collections::HashSet::new(),
        }
    }

    fn quiet(&self, channel_id: &str) -> bool {
        !self.primed.contains(channel_id)
    }

    fn cursor(&self, channel_id: &str) -> Option<&str> {
        self.cursors.get(channel_id).map(String::as_str)
    }

    fn record_success(&mut self, channel_id: &str, newest: Option<String>) {
        if let Some(ts) = newest {
            self.cursors.insert(channel_id.to_string(), ts);
        }
        self.primed.insert(channel_id.to_string());
    }
}

async fn call_api(
    client: &reqwest::Client,
    token: &str,
    method: &str,
    params: &[(&str, String)],
) -> Result<serde_json::Value, String> {
    client
        .get(format!("{SLACK_API}/{method}"))
        .bearer_auth(token)
        .query(params)
        .send()
        .await
        .map_err(|e| format!("{method} request failed: {e}"))?
        .json()
        .await
        .map_err(|e| format!("{method} returned invalid JSON: {e}"))
}

fn parse_users(data: &serde_json::Value) -> Result<Vec<UserProfile>, String> {
    let members = data
        .get("members")
        .and_then(|m| m.as_array())
        .ok_or_else(|| "users.list: missing members array".to_string())?;
    Ok(members
        .iter()
        .filter_map(|member| {
            Some(UserProfile {
                id: member.get("id")?.as_str()?.to_string(),
                name: member.get("name")?.as_str()?.to_string(),
            })
        })
        .collect())
}

fn parse_channels(data: &serde_json::Value) -> Result<Vec<Channel>, String> {
    let channels = data
        .get("channels")
        .and_then(|c| c.as_array())
        .ok_or_else(|| "conversations.list: missing channels array".to_string())?;
    Ok(channels
        .iter()
        .filter_map(|channel| {
            Some(Channel {
                id: channel.get("id")?.as_str()?.to_string(),
                name: channel.get("name")?.as_str()?.to_string(),
            })
        })
        .collect())
}

/// Build a `Message` from a `conversations.history` item. Items carrying a
/// subtype (joins, bot posts, edits) are not user chat messages and are
/// skipped.
fn message_from_history_item(item: &serde_json::Value, channel_id: &str) -> Option<Message> {
    if item.get("subtype").is_some() {
        return None;
    }
    Some(Message {
        kind: item.get("type")?.as_str()?.to_string(),
        text: item
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string(),
        channel: channel_id.to_string(),
        user: item
            .get("user")
            .and_then(|u| u.as_str())
            .unwrap_or("")
            .to_string(),
    })
}
