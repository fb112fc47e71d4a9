//! Evidence Grounding
//!
//! Two disciplines applied to everything the oracle asserts:
//! - evidence must be copied verbatim from the source text
//! - loosely formatted names must resolve back to a known canonical name
//!
//! Name variant generation is a pure function over a finite set of strings so
//! the heuristic can be swapped without touching callers.

use crate::model::{Entity, EntityOrigin};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use strsim::jaro_winkler;
use tracing::warn;

lazy_static! {
    static ref LOWER_UPPER: Regex = Regex::new(r"([a-z0-9])([A-Z])").unwrap();
    static ref ACRONYM_WORD: Regex = Regex::new(r"([A-Z]+)([A-Z][a-z])").unwrap();
    static ref SEPARATORS: Regex = Regex::new(r"[^A-Za-z0-9]+").unwrap();
}

/// Confidence ceiling for items whose evidence failed grounding
pub const UNGROUNDED_CONFIDENCE_CAP: f64 = 0.5;

/// True iff `claim` is non-empty and occurs verbatim (case-sensitive) in `source_text`
pub fn verify_substring(claim: &str, source_text: &str) -> bool {
    !claim.is_empty() && source_text.contains(claim)
}

/// Split an identifier into lowercase words: `OrderLineItem`, `order_line_item`
/// and `order line item` all give `["order", "line", "item"]`.
pub fn split_words(name: &str) -> Vec<String> {
    let spaced = ACRONYM_WORD.replace_all(name, "$1 $2");
    let spaced = LOWER_UPPER.replace_all(&spaced, "$1 $2");
    SEPARATORS
        .split(&spaced)
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Naive English plural of a single lowercase word
pub fn pluralize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix('y') {
        if !stem.is_empty() && !stem.ends_with(|c: char| "aeiou".contains(c)) {
            return format!("{}ies", stem);
        }
    }
    if word.ends_with('s')
        || word.ends_with('x')
        || word.ends_with('z')
        || word.ends_with("ch")
        || word.ends_with("sh")
    {
        format!("{}es", word)
    } else {
        format!("{}s", word)
    }
}

/// All lowercase spellings a canonical name is recognised by
pub fn name_variants(name: &str) -> BTreeSet<String> {
    let mut variants = BTreeSet::new();
    let lowered = name.trim().to_lowercase();
    if lowered.is_empty() {
        return variants;
    }
    variants.insert(lowered);

    let words = split_words(name);
    if words.is_empty() {
        return variants;
    }
    let mut plural_words = words.clone();
    if let Some(last) = plural_words.last_mut() {
        *last = pluralize(last);
    }
    for parts in [&words, &plural_words] {
        for sep in ["_", " ", ""] {
            variants.insert(parts.join(sep));
        }
    }
    variants
}

/// Lookup table from name variants to canonical names.
///
/// Built once per phase from the canonical name list; the first canonical name
/// registered for a variant keeps it.
#[derive(Debug, Clone, Default)]
pub struct CanonicalIndex {
    canonical: Vec<String>,
    by_variant: HashMap<String, String>,
}

impl CanonicalIndex {
    pub fn new<I, S>(canonical_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut index = Self::default();
        for name in canonical_names {
            index.register(name.as_ref());
        }
        index
    }

    pub fn register(&mut self, name: &str) {
        if self.canonical.iter().any(|c| c == name) {
            return;
        }
        self.canonical.push(name.to_string());
        for variant in name_variants(name) {
            self.by_variant.entry(variant).or_insert_with(|| name.to_string());
        }
    }

    pub fn names(&self) -> &[String] {
        &self.canonical
    }

    /// Resolve a loosely formatted key to its canonical name.
    ///
    /// An exact canonical name always resolves to itself.
    pub fn canonicalize(&self, raw_key: &str) -> Option<String> {
        if self.canonical.iter().any(|c| c == raw_key) {
            return Some(raw_key.to_string());
        }
        let lowered = raw_key.trim().to_lowercase();
        if let Some(found) = self.by_variant.get(&lowered) {
            return Some(found.clone());
        }
        let joined = split_words(raw_key).join("_");
        self.by_variant.get(&joined).cloned()
    }

    /// Closest canonical name by Jaro-Winkler similarity, for repair hints
    pub fn closest(&self, raw_key: &str) -> Option<&str> {
        let lowered = raw_key.to_lowercase();
        self.canonical
            .iter()
            .map(|c| (c, jaro_winkler(&lowered, &c.to_lowercase())))
            .filter(|(_, score)| *score >= 0.8)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(c, _)| c.as_str())
    }
}

/// One-shot canonicalization against a name list
pub fn canonicalize<S: AsRef<str>>(raw_key: &str, canonical_names: &[S]) -> Option<String> {
    CanonicalIndex::new(canonical_names.iter().map(|s| s.as_ref())).canonicalize(raw_key)
}

/// What grounding decided about an item's evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroundingOutcome {
    /// Evidence occurs verbatim in the source
    Grounded,
    /// No evidence was asserted
    NoEvidence,
    /// Evidence was not found in the source; the claim was dropped
    Rejected { claim: String },
}

#[derive(Debug, Clone)]
pub struct GroundedEntity {
    pub entity: Entity,
    pub outcome: GroundingOutcome,
}

/// Applies the grounding discipline to oracle-produced items
pub struct EvidenceGrounder<'a> {
    source_text: &'a str,
}

impl<'a> EvidenceGrounder<'a> {
    pub fn new(source_text: &'a str) -> Self {
        Self { source_text }
    }

    pub fn verify(&self, claim: &str) -> bool {
        verify_substring(claim, self.source_text)
    }

    /// Ground an entity's evidence.
    ///
    /// Ungrounded evidence is dropped and the entity is downgraded to
    /// `implied` with capped confidence.
    pub fn ground_entity(&self, entity: &Entity) -> GroundedEntity {
        let mut grounded = entity.clone();
        grounded.confidence = grounded.confidence.clamp(0.0, 1.0);

        let outcome = match entity.evidence.as_deref() {
            None => GroundingOutcome::NoEvidence,
            Some(claim) if self.verify(claim) => GroundingOutcome::Grounded,
            Some(claim) => {
                warn!(
                    "Evidence for entity '{}' is not a verbatim quote of the source, downgrading: {:?}",
                    entity.name, claim
                );
                grounded.evidence = None;
                grounded.origin = EntityOrigin::Implied;
                grounded.confidence = grounded.confidence.min(UNGROUNDED_CONFIDENCE_CAP);
                GroundingOutcome::Rejected {
                    claim: claim.to_string(),
                }
            }
        };

        GroundedEntity {
            entity: grounded,
            outcome,
        }
    }
}
