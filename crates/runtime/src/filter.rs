//! SKU admission filtering.
//!
//! A stateless predicate over raw SKU strings: format checks, deny/allow
//! lists (case-insensitive), and compiled regex patterns, memoized in an
//! LRU cache. Evaluation short-circuits in the order format → deny list →
//! deny patterns → allow list → allow patterns → approved.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};

use crate::types::RuntimeError;

const DEFAULT_CACHE_SIZE: usize = 1000;

/// Reserved SKUs that are never real products.
const RESERVED_SKUS: &[&str] = &["sku", "test", "sample", "default", "placeholder"];

/// Stage at which a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStage {
    Format,
    DenyList,
    DenyPattern,
    AllowList,
    AllowPattern,
    Approved,
}

/// Outcome of a filter evaluation.
#[derive(Debug, Clone)]
pub struct FilterDecision {
    pub allowed: bool,
    pub reason: String,
    pub stage: FilterStage,
}

/// Filter configuration. Lists are matched case-insensitively; patterns are
/// compiled case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct SkuFilterConfig {
    pub allow_skus: Vec<String>,
    pub deny_skus: Vec<String>,
    pub allow_patterns: Vec<String>,
    pub deny_patterns: Vec<String>,
    pub min_len: usize,
    pub max_len: usize,
    pub cache_size: usize,
}

impl SkuFilterConfig {
    fn normalized(mut self) -> Self {
        if self.min_len == 0 {
            self.min_len = 1;
        }
        if self.max_len == 0 {
            self.max_len = 64;
        }
        if self.cache_size == 0 {
            self.cache_size = DEFAULT_CACHE_SIZE;
        }
        self
    }
}

/// Compiled SKU filter with an LRU memo over raw SKU strings.
pub struct SkuFilter {
    allow_skus: HashSet<String>,
    deny_skus: HashSet<String>,
    allow_patterns: Vec<Regex>,
    deny_patterns: Vec<Regex>,
    min_len: usize,
    max_len: usize,
    cache: Mutex<LruCache<String, FilterDecision>>,
}

impl SkuFilter {
    pub fn new(config: SkuFilterConfig) -> Result<Self, RuntimeError> {
        let config = config.normalized();
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, RuntimeError> {
            patterns
                .iter()
                .map(|p| {
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| {
                            RuntimeError::Validation(format!("bad filter pattern {p:?}: {e}"))
                        })
                })
                .collect()
        };

        Ok(Self {
            allow_patterns: compile(&config.allow_patterns)?,
            deny_patterns: compile(&config.deny_patterns)?,
            allow_skus: config.allow_skus.iter().map(|s| s.to_lowercase()).collect(),
            deny_skus: config.deny_skus.iter().map(|s| s.to_lowercase()).collect(),
            min_len: config.min_len,
            max_len: config.max_len,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.cache_size).unwrap_or(
                    NonZeroUsize::new(DEFAULT_CACHE_SIZE).expect("nonzero default"),
                ),
            )),
        })
    }

    /// Accept every well-formed SKU.
    pub fn allow_all() -> Self {
        Self::new(SkuFilterConfig::default()).expect("empty filter compiles")
    }

    /// Exclude obvious non-product SKUs: `test_`, `temp_`, `demo_`,
    /// `sample_` prefixes and reserved singletons.
    pub fn products_only() -> Self {
        Self::new(SkuFilterConfig {
            deny_skus: RESERVED_SKUS.iter().map(|s| s.to_string()).collect(),
            deny_patterns: vec!["^(test_|temp_|demo_|sample_)".to_string()],
            ..SkuFilterConfig::default()
        })
        .expect("preset filter compiles")
    }

    /// Accept only SKUs starting with one of the given prefixes.
    pub fn specific_prefixes(prefixes: &[&str]) -> Result<Self, RuntimeError> {
        let escaped: Vec<String> = prefixes.iter().map(|p| regex::escape(p)).collect();
        Self::new(SkuFilterConfig {
            allow_patterns: vec![format!("^({})", escaped.join("|"))],
            ..SkuFilterConfig::default()
        })
    }

    /// Evaluate the filter for a raw SKU string, memoized.
    pub fn should_process(&self, sku: &str) -> FilterDecision {
        if let Some(decision) = self.cache.lock().get(sku) {
            return decision.clone();
        }
        let decision = self.evaluate(sku);
        self.cache
            .lock()
            .put(sku.to_string(), decision.clone());
        decision
    }

    fn evaluate(&self, sku: &str) -> FilterDecision {
        let len = sku.chars().count();
        if sku.trim().is_empty() || len < self.min_len || len > self.max_len {
            return FilterDecision {
                allowed: false,
                reason: format!("length {len} outside [{}, {}]", self.min_len, self.max_len),
                stage: FilterStage::Format,
            };
        }

        let lowered = sku.to_lowercase();
        if self.deny_skus.contains(&lowered) {
            return FilterDecision {
                allowed: false,
                reason: "sku on deny list".to_string(),
                stage: FilterStage::DenyList,
            };
        }

        if let Some(pattern) = self.deny_patterns.iter().find(|p| p.is_match(sku)) {
            return FilterDecision {
                allowed: false,
                reason: format!("sku matches deny pattern {}", pattern.as_str()),
                stage: FilterStage::DenyPattern,
            };
        }

        if !self.allow_skus.is_empty() && self.allow_skus.contains(&lowered) {
            return FilterDecision {
                allowed: true,
                reason: "sku on allow list".to_string(),
                stage: FilterStage::AllowList,
            };
        }

        if !self.allow_patterns.is_empty() {
            if let Some(pattern) = self.allow_patterns.iter().find(|p| p.is_match(sku)) {
                return FilterDecision {
                    allowed: true,
                    reason: format!("sku matches allow pattern {}", pattern.as_str()),
                    stage: FilterStage::AllowPattern,
                };
            }
        }

        // An allow list or allow patterns without a match means rejection;
        // no allow constraints at all means approval.
        if !self.allow_skus.is_empty() || !self.allow_patterns.is_empty() {
            return FilterDecision {
                allowed: false,
                reason: "sku not covered by allow list or patterns".to_string(),
                stage: if self.allow_patterns.is_empty() {
                    FilterStage::AllowList
                } else {
                    FilterStage::AllowPattern
                },
            };
        }

        FilterDecision {
            allowed: true,
            reason: "approved".to_string(),
            stage: FilterStage::Approved,
        }
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}
