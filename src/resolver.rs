//! Reply resolution against the record store.

use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::classifier::Intent;
use crate::store::{Store, StoreError};

/// Errors surfaced by reply resolution. Raw storage errors never cross this
/// boundary; callers only ever see these variants.
#[derive(Debug)]
pub enum ResolveError {
    /// The jokes table is empty.
    NoContent,
    /// Underlying store query failed.
    Store(StoreError),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoContent => write!(f, "no jokes in the store"),
            Self::Store(source) => write!(f, "{}", source),
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NoContent => None,
            Self::Store(source) => Some(source),
        }
    }
}

impl From<StoreError> for ResolveError {
    fn from(source: StoreError) -> Self {
        Self::Store(source)
    }
}

/// Turns intents into outbound text payloads. Cheap to clone; the store
/// handle is shared.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<Store>,
}

impl Resolver {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Resolve an intent into the text to post. At most one store query per
    /// call.
    pub fn resolve(&self, intent: &Intent) -> Result<String, ResolveError> {
        match intent {
            Intent::TellJoke => {
                let joke = self
                    .store
                    .least_used_joke()?
                    .ok_or(ResolveError::NoContent)?;
                // usage bump is best-effort; the joke text is already resolved
                if let Err(e) = self.store.bump_joke_usage(joke.id) {
                    warn!("failed to bump usage for joke {}: {e}", joke.id);
                }
                Ok(joke.joke)
            }
            Intent::LookupScrapersByName(name) => {
                Ok(render_ids(self.store.scraper_ids_for_site(name)?))
            }
            Intent::LookupScraperByStoreId(id) => {
                Ok(render_ids(self.store.scraper_ids_for_store(id)?))
            }
        }
    }
}

/// Render a scraper id listing as a JSON array. An empty result set is an
/// explicit "no matches" payload, not an error.
fn render_ids(ids: Vec<i64>) -> String {
    if ids.is_empty() {
        "No matching scrapers found.".to_string()
    } else {
        serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_string())
    }
}
