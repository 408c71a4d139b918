//! Complexity Classifier: maps a prompt to a complexity class and an
//! estimated output token count, used by placement (§4.4) and capacity
//! derivation.

use lru::LruCache;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::Mutex;

lazy_static::lazy_static! {
    static ref AUX_VERB_START: Regex =
        Regex::new(r"(?i)^(is|are|was|were|do|does|did|can|could|would|should|will|has|have|had)\s").unwrap();
    static ref MATH_OPERATOR: Regex = Regex::new(r"\d\s*[+\-*/^]\s*\d").unwrap();
    static ref MATH_VERB: Regex =
        Regex::new(r"(?i)\b(calculate|compute|solve|what is|how much)\b").unwrap();
    static ref MATH_NOUN: Regex =
        Regex::new(r"(?i)\b(equation|formula|sum|product|difference)\b").unwrap();
    static ref DEFINITION_START: Regex =
        Regex::new(r"(?i)^(what|who|when|where)\s+(is|are|was|were)\b").unwrap();
    static ref DEFINITION_VERB: Regex = Regex::new(r"(?i)^(define|name)\b").unwrap();
    static ref COMPLEX_MARKER: Regex = Regex::new(
        r"(?i)\b(why|how|explain|describe|compare|contrast|analyze|tell me about|difference between|similar to)\b"
    )
    .unwrap();
}

/// The kind of question a prompt represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    YesNo,
    Math,
    Definition,
    Complex,
    General,
}

/// Complexity tier, used to derive priority-routing behavior in placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Complexity {
    Simple,
    Medium,
    High,
}

/// Result of classifying a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Classification {
    pub kind: Kind,
    pub complexity: Complexity,
    pub estimated_tokens: u32,
}

fn word_count(prompt: &str) -> usize {
    prompt.split_whitespace().count()
}

/// Classifies a prompt according to the fixed, ordered rule set:
/// yes/no, then math, then definition, then complex, else general.
pub fn classify(prompt: &str) -> Classification {
    let trimmed = prompt.trim();
    let words = word_count(trimmed);

    let is_bool_literal = matches!(trimmed, "true" | "false" | "?" | "True" | "False");
    if (AUX_VERB_START.is_match(trimmed) || is_bool_literal) && words < 15 {
        return Classification {
            kind: Kind::YesNo,
            complexity: Complexity::Simple,
            estimated_tokens: 10,
        };
    }

    if MATH_OPERATOR.is_match(trimmed) || MATH_VERB.is_match(trimmed) || MATH_NOUN.is_match(trimmed) {
        return Classification {
            kind: Kind::Math,
            complexity: Complexity::Medium,
            estimated_tokens: 30,
        };
    }

    if (DEFINITION_START.is_match(trimmed) || DEFINITION_VERB.is_match(trimmed)) && words < 10 {
        return Classification {
            kind: Kind::Definition,
            complexity: Complexity::Simple,
            estimated_tokens: 25,
        };
    }

    if COMPLEX_MARKER.is_match(trimmed) || words > 15 {
        return Classification {
            kind: Kind::Complex,
            complexity: Complexity::High,
            estimated_tokens: 100,
        };
    }

    Classification {
        kind: Kind::General,
        complexity: Complexity::Medium,
        estimated_tokens: 50,
    }
}

/// Bounded, approximately-FIFO cache over classification results.
///
/// Reads use `peek` rather than `get` so cache hits don't bump recency —
/// the spec's eviction discipline is FIFO, not LRU, and `peek` keeps
/// `lru::LruCache`'s insertion order as the approximation of that.
pub struct ClassifierCache {
    cache: Mutex<LruCache<String, Classification>>,
}

impl ClassifierCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap()),
            )),
        }
    }

    /// Classifies `prompt`, consulting and populating the cache.
    pub fn classify(&self, prompt: &str) -> Classification {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.peek(prompt) {
                return *cached;
            }
        }
        let result = classify(prompt);
        let mut cache = self.cache.lock().unwrap();
        cache.put(prompt.to_string(), result);
        result
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClassifierCache {
    fn default() -> Self {
        Self::new(1000)
    }
}
