//! Vendor and beacon classification.
//!
//! A fixed, ordered rule table maps manufacturer ids and service UUIDs to
//! semantic tags. The primary tag is the first one the table produces, so
//! rule order matters: an Apple device that also carries an Eddystone frame
//! is primarily `vendor:apple`.

use std::collections::BTreeSet;

use crate::types::UNCLASSIFIED;

/// One entry of the rule table.
#[derive(Debug, Clone, Copy)]
enum Rule {
    /// Matches when the advertisement carries this company identifier.
    Manufacturer { id: u16, tag: &'static str },
    /// Matches any service UUID starting with `prefix`, ignoring case.
    ServicePrefix {
        prefix: &'static str,
        tag: &'static str,
    },
}

const RULES: &[Rule] = &[
    Rule::Manufacturer {
        id: 76,
        tag: "vendor:apple",
    },
    Rule::Manufacturer {
        id: 117,
        tag: "vendor:samsung",
    },
    Rule::Manufacturer {
        id: 224,
        tag: "vendor:google",
    },
    Rule::ServicePrefix {
        prefix: "0000feaa",
        tag: "beacon:eddystone",
    },
];

impl Rule {
    fn matches(&self, manufacturer_ids: &[u16], service_uuids: &[String]) -> bool {
        match *self {
            Self::Manufacturer { id, .. } => manufacturer_ids.contains(&id),
            Self::ServicePrefix { prefix, .. } => service_uuids.iter().any(|uuid| {
                uuid.get(..prefix.len())
                    .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
            }),
        }
    }

    const fn tag(&self) -> &'static str {
        match *self {
            Self::Manufacturer { tag, .. } | Self::ServicePrefix { tag, .. } => tag,
        }
    }
}

/// Result of classifying one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Every tag that matched, sorted.
    pub tags: BTreeSet<String>,

    /// First tag in rule order, or [`UNCLASSIFIED`].
    pub primary: String,
}

impl Classification {
    /// Whether any rule matched.
    #[must_use]
    pub fn is_classified(&self) -> bool {
        self.primary != UNCLASSIFIED
    }
}

/// Classify a device by its manufacturer ids and service UUIDs.
#[must_use]
pub fn classify(manufacturer_ids: &[u16], service_uuids: &[String]) -> Classification {
    let matched: Vec<&'static str> = RULES
        .iter()
        .filter(|rule| rule.matches(manufacturer_ids, service_uuids))
        .map(Rule::tag)
        .collect();

    Classification {
        primary: matched
            .first()
            .map_or_else(|| UNCLASSIFIED.to_string(), |tag| (*tag).to_string()),
        tags: matched.into_iter().map(str::to_string).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn test_apple_manufacturer_id() {
        let c = classify(&[76], &[]);
        assert_eq!(c.primary, "vendor:apple");
        assert_eq!(c.tags.iter().collect::<Vec<_>>(), vec!["vendor:apple"]);
        assert!(c.is_classified());
    }

    #[test]
    fn test_empty_input_is_unclassified() {
        let c = classify(&[], &[]);
        assert_eq!(c.primary, UNCLASSIFIED);
        assert!(c.tags.is_empty());
        assert!(!c.is_classified());
    }

    #[test]
    fn test_unknown_vendor_is_unclassified() {
        let c = classify(&[6, 89], &uuids(&["0000180f-0000-1000-8000-00805f9b34fb"]));
        assert_eq!(c.primary, UNCLASSIFIED);
    }

    #[test]
    fn test_eddystone_prefix_is_case_insensitive() {
        let c = classify(&[], &uuids(&["0000FEAA-0000-1000-8000-00805F9B34FB"]));
        assert_eq!(c.primary, "beacon:eddystone");
    }

    #[test]
    fn test_short_uuid_does_not_panic() {
        let c = classify(&[], &uuids(&["feaa", ""]));
        assert_eq!(c.primary, UNCLASSIFIED);
    }

    #[test]
    fn test_primary_follows_rule_order_and_tags_are_sorted() {
        let c = classify(
            &[224, 117],
            &uuids(&["0000feaa-0000-1000-8000-00805f9b34fb"]),
        );
        assert_eq!(c.primary, "vendor:samsung");
        assert_eq!(
            c.tags.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["beacon:eddystone", "vendor:google", "vendor:samsung"]
        );
    }
}
