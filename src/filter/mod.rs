//! Tag-scoped drop rules applied to records before they are published.
//!
//! Rules live in an external KV store: one key per tag, each value a JSON
//! array of regex patterns. The active set is an immutable snapshot swapped
//! wholesale on refresh; a record is dropped when its envelope parses, its
//! tag has rules, and any of them matches the content field. Anything that
//! cannot be parsed or matched is kept (fail open).

pub mod envelope;
pub mod store;

use envelope::EnvelopeParser;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use store::RuleStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Immutable mapping from tag to its compiled patterns. Replaced wholesale,
/// never mutated in place.
#[derive(Default)]
pub struct RuleSet {
    rules: HashMap<String, Vec<Regex>>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a set from raw store pairs. Values that are not JSON pattern
    /// arrays and patterns that fail to compile are skipped, never fatal.
    pub fn from_kv_pairs(pairs: &[(String, Vec<u8>)]) -> Self {
        let mut rules = HashMap::new();
        for (tag, value) in pairs {
            let patterns: Vec<String> = match serde_json::from_slice(value) {
                Ok(patterns) => patterns,
                Err(e) => {
                    warn!(tag = %tag, error = %e, "rule value is not a pattern array, skipping");
                    continue;
                }
            };
            let mut compiled = Vec::with_capacity(patterns.len());
            for pattern in &patterns {
                match Regex::new(pattern) {
                    Ok(re) => compiled.push(re),
                    Err(e) => {
                        warn!(tag = %tag, pattern = %pattern, error = %e, "invalid pattern, skipping");
                    }
                }
            }
            rules.insert(tag.clone(), compiled);
        }
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn patterns(&self, tag: &str) -> Option<&[Regex]> {
        self.rules.get(tag).map(|v| v.as_slice())
    }
}

pub struct DropFilter {
    parser: Box<dyn EnvelopeParser>,
    // The lock only guards the pointer swap; matching happens against the
    // cloned Arc outside of it.
    active: RwLock<Arc<RuleSet>>,
}

impl DropFilter {
    pub fn new(parser: Box<dyn EnvelopeParser>) -> Self {
        Self {
            parser,
            active: RwLock::new(Arc::new(RuleSet::empty())),
        }
    }

    /// Swap in a freshly built rule set. Concurrent `should_drop` calls see
    /// either the old or the new complete set, never a partial one.
    pub fn install(&self, set: RuleSet) {
        *self.active.write().unwrap() = Arc::new(set);
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.active.read().unwrap())
    }

    /// Pure function of the raw input and the active snapshot.
    pub fn should_drop(&self, raw: &[u8]) -> bool {
        if raw.is_empty() {
            return true;
        }
        let Some(envelope) = self.parser.parse(raw) else {
            return false;
        };
        if envelope.tag.is_empty() {
            return false;
        }
        let snapshot = self.snapshot();
        let Some(patterns) = snapshot.patterns(&envelope.tag) else {
            return false;
        };
        patterns.iter().any(|re| re.is_match(&envelope.content))
    }
}

/// Fetch the rule set once at startup and then on a fixed interval. A fetch
/// failure keeps the previous snapshot in effect.
pub async fn run_refresh(
    filter: Arc<DropFilter>,
    store: Arc<dyn RuleStore>,
    prefix: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    info!(prefix = %prefix, interval_secs = interval.as_secs(), "rule refresh started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("rule refresh stopped");
                return;
            }
            _ = tick.tick() => {
                match store.list(&prefix).await {
                    Ok(pairs) => {
                        let set = RuleSet::from_kv_pairs(&pairs);
                        debug!(tags = set.len(), "installed refreshed rule set");
                        filter.install(set);
                    }
                    Err(e) => {
                        warn!(prefix = %prefix, error = %e, "rule fetch failed, keeping previous set");
                    }
                }
            }
        }
    }
}
