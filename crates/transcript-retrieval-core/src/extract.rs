//! Structured-signal extraction for chunks.
//!
//! An [`Extractor`] turns chunk text into entities, topics, and
//! qualification tags. [`KeywordExtractor`] is the offline implementation:
//! fixed keyword rules per vocabulary value, configured gazetteers for
//! competitor and product names, and a scanner for currency amounts.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::models::EntityMention;
use crate::vocab::{EntityType, QualificationTag, Topic};

/// Signals extracted from one chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub entities: Vec<EntityMention>,
    pub topics: BTreeSet<Topic>,
    pub qualification_tags: BTreeSet<QualificationTag>,
}

/// An entity/topic/qualification extraction service.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;
    async fn extract(&self, text: &str) -> Result<Extraction, ServiceError>;
}

const TOPIC_RULES: &[(Topic, &[&str])] = &[
    (
        Topic::Pricing,
        &["price", "pricing", "cost", "discount", "per seat", "quote", "budget"],
    ),
    (
        Topic::Competition,
        &["competitor", "alternative", "compared to", "switch from", "versus"],
    ),
    (
        Topic::Objection,
        &["concern", "worried", "too expensive", "not sure", "hesitant", "pushback"],
    ),
    (
        Topic::NextSteps,
        &["next step", "next steps", "follow up", "follow-up", "schedule", "send over"],
    ),
    (
        Topic::Integration,
        &["integration", "integrate", "api", "webhook", "salesforce", "sync"],
    ),
    (
        Topic::Security,
        &["security", "soc 2", "soc2", "sso", "gdpr", "compliance", "encryption"],
    ),
    (
        Topic::Timeline,
        &["timeline", "deadline", "by the end of", "this quarter", "next quarter", "go live"],
    ),
    (
        Topic::Onboarding,
        &["onboarding", "training", "implementation", "rollout", "kickoff"],
    ),
    (
        Topic::Renewal,
        &["renewal", "renew", "contract end", "expires", "expiring"],
    ),
    (
        Topic::ProductFeedback,
        &["feature request", "feedback", "missing feature", "roadmap", "bug"],
    ),
];

const QUALIFICATION_RULES: &[(QualificationTag, &[&str])] = &[
    (
        QualificationTag::Metrics,
        &["roi", "kpi", "save", "reduce", "increase", "per month", "hours a week"],
    ),
    (
        QualificationTag::EconomicBuyer,
        &["cfo", "vp", "sign off", "signs off", "final say", "budget holder", "approve"],
    ),
    (
        QualificationTag::DecisionCriteria,
        &["criteria", "requirement", "requirements", "must have", "evaluate"],
    ),
    (
        QualificationTag::DecisionProcess,
        &["decision process", "committee", "stakeholders", "pilot", "evaluation"],
    ),
    (
        QualificationTag::PaperProcess,
        &["procurement", "legal", "contract", "msa", "purchase order", "redline"],
    ),
    (
        QualificationTag::IdentifyPain,
        &["pain", "problem", "struggle", "frustrating", "manual", "challenge"],
    ),
    (
        QualificationTag::Champion,
        &["champion", "advocate", "internally", "sell it", "on board"],
    ),
    (
        QualificationTag::Competition,
        &["competitor", "alternative", "other vendor", "other vendors", "versus"],
    ),
];

/// Rule-based extractor over the closed vocabularies.
#[derive(Debug, Clone, Default)]
pub struct KeywordExtractor {
    competitors: Vec<String>,
    products: Vec<String>,
}

impl KeywordExtractor {
    pub fn new(competitors: Vec<String>, products: Vec<String>) -> Self {
        Self {
            competitors: clean_gazetteer(competitors),
            products: clean_gazetteer(products),
        }
    }

    /// Synchronous extraction; the async trait method delegates here.
    pub fn extract_text(&self, text: &str) -> Result<Extraction, ServiceError> {
        if text.trim().is_empty() {
            return Err(ServiceError::permanent("chunk text is empty"));
        }
        let haystack = text.to_lowercase();

        let topics = TOPIC_RULES
            .iter()
            .filter(|(_, phrases)| phrases.iter().any(|p| count_phrase(&haystack, p) > 0))
            .map(|(topic, _)| *topic)
            .collect();

        let mut qualification_tags: BTreeSet<QualificationTag> = QUALIFICATION_RULES
            .iter()
            .filter(|(_, phrases)| phrases.iter().any(|p| count_phrase(&haystack, p) > 0))
            .map(|(tag, _)| *tag)
            .collect();

        let mut counts: BTreeMap<(EntityType, String), u32> = BTreeMap::new();
        for name in &self.competitors {
            let n = count_phrase(&haystack, &name.to_lowercase());
            if n > 0 {
                counts.insert((EntityType::Competitor, name.clone()), n);
            }
        }
        for name in &self.products {
            let n = count_phrase(&haystack, &name.to_lowercase());
            if n > 0 {
                counts.insert((EntityType::Product, name.clone()), n);
            }
        }
        for amount in scan_amounts(text) {
            *counts.entry((EntityType::Amount, amount)).or_insert(0) += 1;
        }

        if counts.keys().any(|(t, _)| *t == EntityType::Competitor) {
            qualification_tags.insert(QualificationTag::Competition);
        }

        let entities = counts
            .into_iter()
            .map(|((entity_type, value), n)| EntityMention::new(entity_type, value, n))
            .collect();

        Ok(Extraction {
            entities,
            topics,
            qualification_tags,
        })
    }
}

#[async_trait]
impl Extractor for KeywordExtractor {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn extract(&self, text: &str) -> Result<Extraction, ServiceError> {
        self.extract_text(text)
    }
}

fn clean_gazetteer(names: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && seen.insert(n.to_lowercase()))
        .collect()
}

/// Count occurrences of `phrase` in `haystack` that start and end on word
/// boundaries. Both arguments are expected in lowercase.
fn count_phrase(haystack: &str, phrase: &str) -> u32 {
    if phrase.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(phrase) {
        let start = from + pos;
        let end = start + phrase.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            count += 1;
        }
        from = end;
    }
    count
}

/// Find currency amounts such as `$40,000`, `$1.5M`, `€200k`, or
/// `$12 per seat` (only the amount itself is captured).
fn scan_amounts(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if !matches!(c, '$' | '€' | '£') {
            continue;
        }
        let mut end = start + c.len_utf8();
        let mut digits = 0;
        while let Some(&(i, d)) = chars.peek() {
            if d.is_ascii_digit() {
                digits += 1;
            } else if !(d == ',' || d == '.') {
                break;
            }
            end = i + d.len_utf8();
            chars.next();
        }
        if digits == 0 {
            continue;
        }
        let mut amount = text[start..end].trim_end_matches(['.', ',']).to_string();
        if let Some(&(_, s)) = chars.peek() {
            if matches!(s, 'k' | 'K' | 'm' | 'M') {
                let boundary = text[end + s.len_utf8()..]
                    .chars()
                    .next()
                    .map_or(true, |n| !n.is_alphanumeric());
                if boundary {
                    amount.push(s.to_ascii_uppercase());
                    chars.next();
                }
            }
        }
        out.push(amount);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> KeywordExtractor {
        KeywordExtractor::new(
            vec!["Gong".to_string(), "Chorus".to_string(), " ".to_string()],
            vec!["Coach".to_string()],
        )
    }

    #[test]
    fn test_topics_and_tags_from_keywords() {
        let e = extractor()
            .extract_text("The price is a concern, the CFO has the final say on procurement.")
            .unwrap();
        assert!(e.topics.contains(&Topic::Pricing));
        assert!(e.topics.contains(&Topic::Objection));
        assert!(e.qualification_tags.contains(&QualificationTag::EconomicBuyer));
        assert!(e.qualification_tags.contains(&QualificationTag::PaperProcess));
        assert!(!e.topics.contains(&Topic::Security));
    }

    #[test]
    fn test_competitor_mentions_are_counted() {
        let e = extractor()
            .extract_text("We also looked at Gong. Honestly gong was cheaper, but Chorus too.")
            .unwrap();
        let gong = e
            .entities
            .iter()
            .find(|m| m.entity_type == EntityType::Competitor && m.value == "Gong")
            .unwrap();
        assert_eq!(gong.mention_count, 2);
        assert!(e.qualification_tags.contains(&QualificationTag::Competition));
    }

    #[test]
    fn test_word_boundaries() {
        // "apiary" must not match "api", "gongs" must not match "Gong".
        let e = extractor().extract_text("The apiary has gongs.").unwrap();
        assert!(!e.topics.contains(&Topic::Integration));
        assert!(e.entities.is_empty());
    }

    #[test]
    fn test_amounts() {
        assert_eq!(
            scan_amounts("We pay $40,000 a year, maybe €1.5M later. $ alone is nothing."),
            vec!["$40,000".to_string(), "€1.5M".to_string()]
        );
        assert_eq!(scan_amounts("about $200k."), vec!["$200K".to_string()]);
        assert_eq!(scan_amounts("$12 per seat"), vec!["$12".to_string()]);
    }

    #[test]
    fn test_empty_text_is_permanent() {
        let err = extractor().extract_text("   \n").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let text = "Next steps: send over the SOC2 report and the $5,000 quote for Coach.";
        let a = extractor().extract_text(text).unwrap();
        let b = extractor().extract_text(text).unwrap();
        assert_eq!(a, b);
        assert!(a.topics.contains(&Topic::NextSteps));
        assert!(a.topics.contains(&Topic::Security));
        assert!(a
            .entities
            .iter()
            .any(|m| m.entity_type == EntityType::Product && m.value == "Coach"));
    }
}
