//! The event record type matched against filters.

use serde::{Deserialize, Serialize};

/// An immutable, identity-bearing record received from (or published to) a relay.
///
/// Identity is the `id` field; two events with the same id are the same event
/// regardless of which relay delivered them. The pool never validates
/// signatures — `sig` is carried opaquely for republishing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event id (hex).
    pub id: String,
    /// Author pubkey (hex).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Event kind.
    pub kind: u16,
    /// Tags as arrays of strings, first element being the tag name.
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Event content.
    #[serde(default)]
    pub content: String,
    /// Signature (hex), opaque to the pool.
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Values of a single-letter tag, e.g. `tag_values("e")` for event refs.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_values_by_name() {
        let event = Event {
            id: "a".into(),
            pubkey: "p".into(),
            created_at: 1,
            kind: 1,
            tags: vec![
                vec!["e".into(), "ref1".into()],
                vec!["p".into(), "pk1".into()],
                vec!["e".into(), "ref2".into(), "relay".into()],
            ],
            content: String::new(),
            sig: String::new(),
        };

        let refs: Vec<&str> = event.tag_values("e").collect();
        assert_eq!(refs, vec!["ref1", "ref2"]);
        assert_eq!(event.tag_values("x").count(), 0);
    }

    #[test]
    fn serde_round_trip_keeps_identity() {
        let json = r#"{"id":"abc","pubkey":"def","created_at":1700000000,"kind":1,"tags":[["p","x"]],"content":"hi","sig":"00"}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.id, "abc");
        assert_eq!(event.kind, 1);
        let back = serde_json::to_string(&event).unwrap();
        let again: Event = serde_json::from_str(&back).unwrap();
        assert_eq!(event, again);
    }
}
