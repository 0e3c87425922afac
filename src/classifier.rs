//! Pure intent classification for inbound channel messages.

use regex::Regex;
use std::sync::OnceLock;

use crate::transport::{BotIdentity, Message};

/// Namespace prefix of public/group channel ids.
const CHANNEL_PREFIX: char = 'C';

/// The classified purpose of an inbound message. At most one per message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Deliver the least-used joke.
    TellJoke,
    /// Scraper ids attached to a crawl site, keyed by the numeric token.
    LookupScrapersByName(String),
    /// Scraper ids configured for a numeric store id.
    LookupScraperByStoreId(String),
}

/// First maximal run of decimal digits anywhere in the text.
fn digit_run(text: &str) -> Option<&str> {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    let re = DIGITS.get_or_init(|| Regex::new(r"\d+").unwrap());
    re.find(text).map(|m| m.as_str())
}

/// Map an inbound message to at most one intent; first match wins.
///
/// Phrase tests are case-insensitive substring checks. A bare mention of the
/// bot's name satisfies every branch, so a name mention combined with any
/// digit run routes to the scraper lookups ahead of `TellJoke`. That overlap
/// is kept deliberately; see DESIGN.md. A scraper branch whose digit token
/// is absent falls through rather than producing an empty lookup.
pub fn classify(message: &Message, identity: &BotIdentity) -> Option<Intent> {
    if message.kind != "message" || message.text.is_empty() {
        return None;
    }
    if !message.channel.starts_with(CHANNEL_PREFIX) {
        return None;
    }
    // never reply to ourselves
    if message.user == identity.id {
        return None;
    }

    let text = message.text.to_lowercase();
    let mentions_bot = text.contains(&identity.name.to_lowercase());
    let token = digit_run(&message.text);

    if text.contains("attached scrapers") || mentions_bot {
        if let Some(token) = token {
            return Some(Intent::LookupScrapersByName(token.to_string()));
        }
    }
    if text.contains("scraper id of") || mentions_bot {
        if let Some(token) = token {
            return Some(Intent::LookupScraperByStoreId(token.to_string()));
        }
    }
    if text.contains("chuck norris") || mentions_bot {
        return Some(Intent::TellJoke);
    }

    None
}
