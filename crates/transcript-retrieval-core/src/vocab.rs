//! Closed, versioned tag vocabularies and the generic tag filter.
//!
//! Topics, qualification tags, and entity types are fixed enums rather
//! than open strings. Values arriving from a remote extractor are parsed
//! with [`FromStr`] and unknown values are dropped at the boundary, so the
//! scorer never sees a tag it cannot name.
//!
//! Adding a variant bumps [`VOCABULARY_VERSION`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Version of the tag vocabularies below.
pub const VOCABULARY_VERSION: u32 = 1;

macro_rules! vocabulary {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
                match normalized.as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => anyhow::bail!("unknown {}: {}", stringify!($name), s),
                }
            }
        }
    };
}

vocabulary! {
    /// Conversation topics a chunk can be tagged with.
    pub enum Topic {
        Pricing => "pricing",
        Competition => "competition",
        Objection => "objection",
        NextSteps => "next_steps",
        Integration => "integration",
        Security => "security",
        Timeline => "timeline",
        Onboarding => "onboarding",
        Renewal => "renewal",
        ProductFeedback => "product_feedback",
    }
}

vocabulary! {
    /// Deal-qualification criteria (MEDDICC).
    pub enum QualificationTag {
        Metrics => "metrics",
        EconomicBuyer => "economic_buyer",
        DecisionCriteria => "decision_criteria",
        DecisionProcess => "decision_process",
        PaperProcess => "paper_process",
        IdentifyPain => "identify_pain",
        Champion => "champion",
        Competition => "competition",
    }
}

vocabulary! {
    /// Kinds of named entity an extractor may report.
    pub enum EntityType {
        Person => "person",
        Organization => "organization",
        Product => "product",
        Competitor => "competitor",
        Amount => "amount",
        Date => "date",
    }
}

/// Parse a list of open strings into a closed vocabulary, returning the
/// recognized values and the rejected inputs.
pub fn parse_tags<T: FromStr + Ord>(raw: &[String]) -> (BTreeSet<T>, Vec<String>) {
    let mut tags = BTreeSet::new();
    let mut rejected = Vec::new();
    for value in raw {
        match value.parse::<T>() {
            Ok(tag) => {
                tags.insert(tag);
            }
            Err(_) => rejected.push(value.clone()),
        }
    }
    (tags, rejected)
}

/// Inclusion filter over a tag set: a chunk passes when its tags intersect
/// the requested set. An absent filter admits everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter<T: Ord> {
    wanted: Option<BTreeSet<T>>,
}

impl<T: Ord> Default for TagFilter<T> {
    fn default() -> Self {
        Self { wanted: None }
    }
}

impl<T: Ord + Clone> TagFilter<T> {
    pub fn any() -> Self {
        Self { wanted: None }
    }

    /// Build a filter from the requested tags. An empty request is treated
    /// as no filter.
    pub fn of<I: IntoIterator<Item = T>>(tags: I) -> Self {
        let wanted: BTreeSet<T> = tags.into_iter().collect();
        if wanted.is_empty() {
            Self { wanted: None }
        } else {
            Self {
                wanted: Some(wanted),
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.wanted.is_some()
    }

    pub fn wanted(&self) -> Option<&BTreeSet<T>> {
        self.wanted.as_ref()
    }

    pub fn admits(&self, tags: &BTreeSet<T>) -> bool {
        match &self.wanted {
            None => true,
            Some(wanted) => wanted.iter().any(|t| tags.contains(t)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_lenient_on_case_and_separators() {
        assert_eq!("Next Steps".parse::<Topic>().unwrap(), Topic::NextSteps);
        assert_eq!(
            "economic-buyer".parse::<QualificationTag>().unwrap(),
            QualificationTag::EconomicBuyer
        );
        assert!("weather".parse::<Topic>().is_err());
    }

    #[test]
    fn test_as_str_round_trip() {
        for t in Topic::ALL {
            assert_eq!(t.as_str().parse::<Topic>().unwrap(), *t);
        }
        for t in QualificationTag::ALL {
            assert_eq!(t.as_str().parse::<QualificationTag>().unwrap(), *t);
        }
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), *t);
        }
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&QualificationTag::PaperProcess).unwrap();
        assert_eq!(json, "\"paper_process\"");
    }

    #[test]
    fn test_parse_tags_drops_unknown() {
        let raw = vec!["pricing".to_string(), "astrology".to_string()];
        let (tags, rejected): (BTreeSet<Topic>, _) = parse_tags(&raw);
        assert_eq!(tags.len(), 1);
        assert!(tags.contains(&Topic::Pricing));
        assert_eq!(rejected, vec!["astrology".to_string()]);
    }

    #[test]
    fn test_filter_is_intersection_not_exact_match() {
        let chunk_tags: BTreeSet<QualificationTag> = [
            QualificationTag::Metrics,
            QualificationTag::Champion,
            QualificationTag::PaperProcess,
        ]
        .into_iter()
        .collect();

        assert!(TagFilter::of([QualificationTag::Champion]).admits(&chunk_tags));
        assert!(!TagFilter::of([QualificationTag::EconomicBuyer]).admits(&chunk_tags));
        assert!(TagFilter::<QualificationTag>::any().admits(&chunk_tags));
        assert!(TagFilter::<QualificationTag>::any().admits(&BTreeSet::new()));
    }

    #[test]
    fn test_empty_request_is_no_filter() {
        let f: TagFilter<Topic> = TagFilter::of(Vec::new());
        assert!(!f.is_active());
        assert!(f.admits(&BTreeSet::new()));
    }
}
