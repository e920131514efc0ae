//! Intent classification.
//!
//! The classifier decides which workflow (query type) a query belongs to.
//! [`KeywordClassifier`] is the rule-based implementation driven by config;
//! [`CachedClassifier`] puts any classifier behind the key-value store.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use keel_core::config::{ClassifierConfig, ClassifierRule};
use keel_core::error::Result;
use keel_core::traits::KvStore;

use crate::plan::types::Classification;

const INTENT_CACHE_PREFIX: &str = "intent_cache";

pub trait IntentClassifier: Send + Sync + 'static {
    fn classify<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<Classification>>;
}

/// Lowercase and collapse whitespace.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Scores each rule by the number of its keywords found in the normalized
/// query. The highest score wins; ties go to the rule listed first.
pub struct KeywordClassifier {
    rules: Vec<ClassifierRule>,
    default_query_type: String,
}

impl KeywordClassifier {
    pub fn new(rules: Vec<ClassifierRule>, default_query_type: impl Into<String>) -> Self {
        Self {
            rules,
            default_query_type: default_query_type.into(),
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self::new(config.rules.clone(), config.default_query_type.clone())
    }

    pub fn classify_sync(&self, query: &str) -> Classification {
        let normalized = normalize_query(query);

        let mut best: Option<(&ClassifierRule, usize)> = None;
        for rule in &self.rules {
            let hits = rule
                .keywords
                .iter()
                .filter(|k| normalized.contains(&k.to_lowercase()))
                .count();
            if hits > 0 && best.map_or(true, |(_, h)| hits > h) {
                best = Some((rule, hits));
            }
        }

        match best {
            Some((rule, hits)) => Classification {
                query_type: rule.query_type.clone(),
                agent_id: rule.agent_id.clone(),
                confidence: hits as f64 / rule.keywords.len().max(1) as f64,
                reasoning: format!("{} of {} keywords matched", hits, rule.keywords.len()),
            },
            None => Classification {
                query_type: self.default_query_type.clone(),
                agent_id: None,
                confidence: 0.0,
                reasoning: "no keyword rule matched".into(),
            },
        }
    }
}

impl IntentClassifier for KeywordClassifier {
    fn classify<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<Classification>> {
        Box::pin(async move { Ok(self.classify_sync(query)) })
    }
}

/// Caches classifications under `intent_cache:<sha256(normalized query)>`.
/// Store failures fall through to the inner classifier.
pub struct CachedClassifier<C> {
    inner: C,
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl<C: IntentClassifier> CachedClassifier<C> {
    pub fn new(inner: C, store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { inner, store, ttl }
    }

    fn cache_key(query: &str) -> String {
        let digest = Sha256::digest(normalize_query(query).as_bytes());
        format!("{}:{:x}", INTENT_CACHE_PREFIX, digest)
    }
}

impl<C: IntentClassifier> IntentClassifier for CachedClassifier<C> {
    fn classify<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<Classification>> {
        Box::pin(async move {
            let key = Self::cache_key(query);
            match self.store.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<Classification>(&raw) {
                    Ok(c) => {
                        debug!(query_type = %c.query_type, "Intent cache hit");
                        return Ok(c);
                    }
                    Err(e) => warn!(error = %e, "Discarding unreadable intent cache entry"),
                },
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Intent cache read failed"),
            }

            let classification = self.inner.classify(query).await?;
            let raw = serde_json::to_string(&classification)?;
            if let Err(e) = self.store.set(&key, raw, Some(self.ttl)).await {
                warn!(error = %e, "Intent cache write failed");
            }
            Ok(classification)
        })
    }
}
