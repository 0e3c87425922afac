//! Transport seam between the session and the chat platform.
//!
//! The session treats the platform purely as an event source plus a text
//! sink; everything connection-shaped (auth, polling, reconnects) lives
//! behind this trait.

use std::future::Future;

/// A user in the workspace directory.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
}

/// A channel known to the transport.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub name: String,
}

/// The bot's own identity, resolved once after connecting and immutable
/// for the rest of the session.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: String,
    pub name: String,
}

/// An inbound chat message as delivered by the transport.
#[derive(Debug, Clone)]
pub struct Message {
    /// Platform event type; only `"message"` is ever acted on.
    pub kind: String,
    pub text: String,
    /// Channel id the message arrived in.
    pub channel: String,
    /// Author's user id.
    pub user: String,
}

/// Events emitted by a transport listener.
#[derive(Debug)]
pub enum Event {
    /// Connection established; the user directory and channel list are
    /// available from that point on.
    Start,
    Message(Message),
    /// Transport-level disconnect. Reconnection is the transport's concern,
    /// not the session's.
    Disconnected,
}

/// The chat platform seen from the session's side.
pub trait Transport: Send + Sync + 'static {
    /// Workspace user directory, snapshotted at connect time.
    fn users(&self) -> Vec<UserProfile>;

    /// Known channels. The first entry is the default channel.
    fn channels(&self) -> Vec<Channel>;

    /// Post plain text to a channel by name.
    fn post_to_channel(
        &self,
        channel_name: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), String>> + Send;
}
