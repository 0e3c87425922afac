//! Session controller: connection lifecycle and event dispatch.
//!
//! The controller only ever learns "reply produced" or "no reply" from the
//! pipeline; resolution failures are contained and logged here, never
//! propagated to the transport.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::classifier::{Intent, classify};
use crate::resolver::{ResolveError, Resolver};
use crate::store::Store;
use crate::transport::{BotIdentity, Event, Message, Transport};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Active,
}

/// Capability interface for a responder driven by transport events.
pub trait ChatResponder {
    async fn on_start(&mut self);
    async fn on_message(&mut self, message: Message);
    fn on_disconnect(&mut self);
}

/// Dispatch transport events to a responder, one at a time in arrival
/// order, until the stream ends or the transport disconnects.
pub async fn drive<R: ChatResponder>(mut events: mpsc::Receiver<Event>, responder: &mut R) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Start => responder.on_start().await,
            Event::Message(message) => responder.on_message(message).await,
            Event::Disconnected => {
                responder.on_disconnect();
                break;
            }
        }
    }
}

/// The scraperbot session. Holds a transport handle and a store handle and
/// owns the classify → resolve → post pipeline.
pub struct Session<T: Transport> {
    name: String,
    transport: Arc<T>,
    resolver: Resolver,
    store: Arc<Store>,
    identity: Option<BotIdentity>,
    state: SessionState,
}

impl<T: Transport> Session<T> {
    pub fn new(name: String, transport: Arc<T>, store: Arc<Store>) -> Self {
        Self {
            name,
            transport,
            resolver: Resolver::new(store.clone()),
            store,
            identity: None,
            state: SessionState::Disconnected,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Find our own user record in the workspace directory by display name.
    fn load_identity(&self) -> Option<BotIdentity> {
        let name = self.name.to_lowercase();
        self.transport
            .users()
            .into_iter()
            .find(|user| user.name.to_lowercase() == name)
            .map(|user| BotIdentity { id: user.id, name: user.name })
    }

    /// One-time welcome on the very first run against this store; on every
    /// later start only the `lastrun` timestamp is refreshed.
    async fn first_run_check(&self) {
        let last_run = match self.store.last_run() {
            Ok(last_run) => last_run,
            Err(e) => {
                warn!("first-run check failed: {e}");
                return;
            }
        };

        if last_run.is_none() {
            self.send_welcome().await;
        }

        let now = chrono::Utc::now().to_rfc3339();
        if let Err(e) = self.store.record_run(&now) {
            warn!("failed to record run timestamp: {e}");
        }
    }

    async fn send_welcome(&self) {
        let Some(channel) = self.transport.channels().into_iter().next() else {
            warn!("no channel available for the welcome message");
            return;
        };

        let text = format!(
            "Hi guys, roundhouse-kick anyone?\n\
             I can tell jokes, but very honest ones. Just say `Chuck Norris` or `{}` to invoke me!",
            self.name
        );
        info!("first run, posting welcome to #{}", channel.name);
        if let Err(e) = self.transport.post_to_channel(&channel.name, &text).await {
            warn!("failed to post welcome message: {e}");
        }
    }

    fn channel_name(&self, channel_id: &str) -> Option<String> {
        self.transport
            .channels()
            .into_iter()
            .find(|channel| channel.id == channel_id)
            .map(|channel| channel.name)
    }
}

impl<T: Transport> ChatResponder for Session<T> {
    async fn on_start(&mut self) {
        self.state = SessionState::Connecting;

        match self.load_identity() {
            Some(identity) => {
                info!("session started as {} ({})", identity.name, identity.id);
                self.identity = Some(identity);
            }
            None => warn!("no user named {:?} in the workspace directory", self.name),
        }

        self.first_run_check().await;
        self.state = SessionState::Active;
    }

    async fn on_message(&mut self, message: Message) {
        if self.state != SessionState::Active {
            return;
        }
        let Some(identity) = &self.identity else {
            return;
        };

        let Some(intent) = classify(&message, identity) else {
            debug!(channel = %message.channel, "message produced no intent");
            return;
        };
        info!(?intent, channel = %message.channel, "classified message");

        // each reply is its own unit of work; a stalled store call must not
        // hold up event intake
        let resolver = self.resolver.clone();
        let transport = self.transport.clone();
        let channel = self.channel_name(&message.channel);
        tokio::spawn(respond(resolver, transport, channel, intent));
    }

    fn on_disconnect(&mut self) {
        info!("transport disconnected");
        self.state = SessionState::Disconnected;
    }
}

/// Resolve one intent and post the payload back to its originating channel.
async fn respond<T: Transport>(
    resolver: Resolver,
    transport: Arc<T>,
    channel: Option<String>,
    intent: Intent,
) {
    let payload = match resolver.resolve(&intent) {
        Ok(payload) => payload,
        Err(ResolveError::NoContent) => {
            warn!("no content available for {:?}, dropping reply", intent);
            return;
        }
        Err(ResolveError::Store(e)) => {
            warn!("store query failed, dropping reply: {e}");
            return;
        }
    };

    let Some(channel) = channel else {
        warn!("reply resolved for an unknown channel, dropping payload");
        return;
    };

    if let Err(e) = transport.post_to_channel(&channel, &payload).await {
        warn!("failed to post reply to #{channel}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Channel, UserProfile};
    use std::future::Future;
    use std::sync::Mutex;

    struct MockTransport {
        users: Vec<UserProfile>,
        channels: Vec<Channel>,
        posts: Mutex<Vec<(String, String)>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                users: vec![
                    UserProfile { id: "U0BOT".into(), name: "scraperbot".into() },
                    UserProfile { id: "U123".into(), name: "alice".into() },
                ],
                channels: vec![
                    Channel { id: "C024BE91L".into(), name: "general".into() },
                    Channel { id: "C024BE92M".into(), name: "random".into() },
                ],
                posts: Mutex::new(Vec::new()),
            })
        }

        fn posts(&self) -> Vec<(String, String)> {
            self.posts.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
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
            self.posts
                .lock()
                .unwrap()
                .push((channel_name.to_string(), text.to_string()));
            std::future::ready(Ok(()))
        }
    }

    fn channel_msg(text: &str) -> Message {
        Message {
            kind: "message".to_string(),
            text: text.to_string(),
            channel: "C024BE91L".to_string(),
            user: "U123".to_string(),
        }
    }

    /// Let spawned reply tasks run to completion on the test runtime.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_welcome_fires_exactly_once() {
        let transport = MockTransport::new();
        let store = Arc::new(Store::in_memory());
        let mut session =
            Session::new("scraperbot".to_string(), transport.clone(), store.clone());

        session.on_start().await;
        session.on_start().await;

        let posts = transport.posts();
        let welcomes: Vec<_> = posts
            .iter()
            .filter(|(_, text)| text.contains("roundhouse-kick"))
            .collect();
        assert_eq!(welcomes.len(), 1);
        // welcome goes to the default channel
        assert_eq!(welcomes[0].0, "general");
        assert_eq!(store.lastrun_row_count(), 1);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_joke_reply_reaches_originating_channel() {
        let transport = MockTransport::new();
        let store = Arc::new(Store::in_memory());
        store.seed(
            "INSERT INTO jokes (id, joke, used) VALUES (1, 'an honest joke', 0);
             INSERT INTO info (name, val) VALUES ('lastrun', '2016-01-01T00:00:00Z');",
        );
        let mut session =
            Session::new("scraperbot".to_string(), transport.clone(), store.clone());

        session.on_start().await;
        session.on_message(channel_msg("chuck norris!")).await;
        settle().await;

        let posts = transport.posts();
        assert_eq!(posts, vec![("general".to_string(), "an honest joke".to_string())]);
        assert_eq!(store.joke_used_count(1), 1);
    }

    #[tokio::test]
    async fn test_scraper_lookup_end_to_end() {
        let transport = MockTransport::new();
        let store = Arc::new(Store::in_memory());
        store.seed(
            "INSERT INTO external_crawl_sites (id, name) VALUES (7, '42');
             INSERT INTO external_crawl_sites (id, name) VALUES (9, '42');
             INSERT INTO info (name, val) VALUES ('lastrun', '2016-01-01T00:00:00Z');",
        );
        let mut session = Session::new("scraperbot".to_string(), transport.clone(), store);

        let mut msg = channel_msg("attached scrapers for 42?");
        msg.channel = "C024BE92M".to_string();
        session.on_start().await;
        session.on_message(msg).await;
        settle().await;

        assert_eq!(
            transport.posts(),
            vec![("random".to_string(), "[7,9]".to_string())]
        );
    }

    #[tokio::test]
    async fn test_empty_joke_table_sends_nothing() {
        let transport = MockTransport::new();
        let store = Arc::new(Store::in_memory());
        store.seed("INSERT INTO info (name, val) VALUES ('lastrun', '2016-01-01T00:00:00Z');");
        let mut session = Session::new("scraperbot".to_string(), transport.clone(), store);

        session.on_start().await;
        session.on_message(channel_msg("chuck norris")).await;
        settle().await;

        assert!(transport.posts().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_drops_reply_but_not_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.db");
        {
            // a provisioned store missing its jokes table
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE info (name TEXT NOT NULL, val TEXT NOT NULL);
                 INSERT INTO info (name, val) VALUES ('lastrun', '2016-01-01T00:00:00Z');
                 CREATE TABLE external_crawl_sites (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 INSERT INTO external_crawl_sites (id, name) VALUES (7, '42');",
            )
            .unwrap();
        }
        let transport = MockTransport::new();
        let store = Arc::new(Store::open(&path).unwrap());
        let mut session = Session::new("scraperbot".to_string(), transport.clone(), store);

        session.on_start().await;

        // the joke query fails against the missing table; the reply is
        // dropped silently
        session.on_message(channel_msg("chuck norris")).await;
        settle().await;
        assert!(transport.posts().is_empty());

        // the next message is unaffected
        session.on_message(channel_msg("attached scrapers for 42?")).await;
        settle().await;
        assert_eq!(
            transport.posts(),
            vec![("general".to_string(), "[7]".to_string())]
        );
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_messages_before_start_are_dropped() {
        let transport = MockTransport::new();
        let store = Arc::new(Store::in_memory());
        store.seed("INSERT INTO jokes (id, joke, used) VALUES (1, 'a joke', 0);");
        let mut session = Session::new("scraperbot".to_string(), transport.clone(), store);

        session.on_message(channel_msg("chuck norris")).await;
        settle().await;

        assert!(transport.posts().is_empty());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_moves_state() {
        let transport = MockTransport::new();
        let store = Arc::new(Store::in_memory());
        store.seed("INSERT INTO info (name, val) VALUES ('lastrun', '2016-01-01T00:00:00Z');");
        let mut session = Session::new("scraperbot".to_string(), transport.clone(), store);

        session.on_start().await;
        assert_eq!(session.state(), SessionState::Active);
        session.on_disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_drive_dispatches_until_disconnect() {
        let transport = MockTransport::new();
        let store = Arc::new(Store::in_memory());
        store.seed(
            "INSERT INTO jokes (id, joke, used) VALUES (1, 'driven joke', 0);
             INSERT INTO info (name, val) VALUES ('lastrun', '2016-01-01T00:00:00Z');",
        );
        let mut session = Session::new("scraperbot".to_string(), transport.clone(), store);

        let (tx, rx) = mpsc::channel(8);
        tx.send(Event::Start).await.unwrap();
        tx.send(Event::Message(channel_msg("chuck norris"))).await.unwrap();
        tx.send(Event::Disconnected).await.unwrap();

        drive(rx, &mut session).await;
        settle().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            transport.posts(),
            vec![("general".to_string(), "driven joke".to_string())]
        );
    }
}
