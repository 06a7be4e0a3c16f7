//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of identifiers (e.g., passing a queue
//! name where an item id is expected).

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Length of the textual form of an [`ItemId`].
pub const ITEM_ID_LEN: usize = 26;

/// Time-sortable identifier of a queue item.
///
/// A ULID: 48 bits of millisecond timestamp followed by 80 random bits,
/// rendered as 26 Crockford base32 characters. Lexicographic order of the
/// rendered form equals creation-time order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(Ulid);

impl ItemId {
    /// Parses the 26-character textual form.
    ///
    /// Returns `None` for anything that is not a canonical ULID string,
    /// including lowercase spellings that would sort differently on disk.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != ITEM_ID_LEN || s.bytes().any(|b| b.is_ascii_lowercase()) {
            return None;
        }
        Ulid::from_str(s).ok().map(ItemId)
    }

    /// Milliseconds since the Unix epoch at which the id was generated.
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Ulid> for ItemId {
    fn from(u: Ulid) -> Self {
        ItemId(u)
    }
}

/// Generates strictly increasing [`ItemId`]s within one process.
///
/// Ids created in the same millisecond increment the random part instead of
/// drawing fresh randomness, so in-process arrival order is exact. Ids from
/// different processes only share the timestamp ordering.
pub struct ItemIdGenerator {
    inner: Mutex<ulid::Generator>,
}

impl ItemIdGenerator {
    pub fn new() -> Self {
        ItemIdGenerator {
            inner: Mutex::new(ulid::Generator::new()),
        }
    }

    /// Returns the next id.
    ///
    /// Falls back to a fresh random ULID if the monotonic generator overflows
    /// its random part within a single millisecond.
    pub fn next_id(&self) -> ItemId {
        let generated = match self.inner.lock() {
            Ok(mut generator) => generator.generate().ok(),
            Err(poisoned) => poisoned.into_inner().generate().ok(),
        };
        ItemId(generated.unwrap_or_else(Ulid::new))
    }
}

impl Default for ItemIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ItemIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemIdGenerator").finish_non_exhaustive()
    }
}

/// Name of a destination queue directory under the queues root.
///
/// Derived from a content hash of the destination configuration, so it only
/// contains lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(pub String);

impl DestinationId {
    pub fn new(s: impl Into<String>) -> Self {
        DestinationId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log fields.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn generated_ids_are_strictly_increasing() {
        let ids = ItemIdGenerator::new();
        let mut prev = ids.next_id();
        for _ in 0..1000 {
            let next = ids.next_id();
            assert!(next > prev);
            assert!(next.to_string() > prev.to_string());
            prev = next;
        }
    }

    #[test]
    fn parse_accepts_display_form() {
        let id = ItemIdGenerator::new().next_id();
        let text = id.to_string();

        assert_eq!(text.len(), ITEM_ID_LEN);
        assert_eq!(ItemId::parse(&text), Some(id));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(ItemId::parse(""), None);
        assert_eq!(ItemId::parse("01ARZ3NDEKTSV4RRFFQ69G5FA"), None);
        assert_eq!(ItemId::parse("01arz3ndektsv4rrffq69g5fav"), None);
        assert_eq!(ItemId::parse("01ARZ3NDEKTSV4RRFFQ69G5FA!"), None);
    }

    #[test]
    fn destination_short_never_panics() {
        assert_eq!(DestinationId::new("abc").short(), "abc");
        assert_eq!(DestinationId::new("0123456789abcdef").short(), "0123456789ab");
    }

    proptest! {
        /// Textual order equals numeric order for any pair of ULIDs.
        #[test]
        fn text_order_matches_id_order(a in any::<u128>(), b in any::<u128>()) {
            let a = ItemId::from(Ulid(a));
            let b = ItemId::from(Ulid(b));
            prop_assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
        }
    }
}
