//! On-disk naming of queue items.
//!
//! ```text
//! <id>.dirq-item.dat      - visible item (payload, waiting for a consumer)
//! <id>.dirq-item.dat.y    - in-flight marker (same file, claimed by a consumer)
//! .tmp-<id>               - enqueue in progress (never matches the item pattern)
//! ```

use std::path::{Path, PathBuf};

use crate::types::{ITEM_ID_LEN, ItemId};

/// Suffix of a visible queue item.
pub const ITEM_SUFFIX: &str = ".dirq-item.dat";

/// Suffix appended to an item's name while a consumer processes it.
pub const IN_FLIGHT_SUFFIX: &str = ".y";

/// Prefix of files being written by `enqueue`.
pub const TEMP_PREFIX: &str = ".tmp-";

/// A queue item file identified by its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: ItemId,

    /// Path of the visible item file.
    pub path: PathBuf,
}

impl QueueItem {
    pub fn new(dir: &Path, id: ItemId) -> Self {
        QueueItem {
            id,
            path: dir.join(file_name(id)),
        }
    }

    /// Path of the in-flight marker for this item.
    pub fn in_flight_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(IN_FLIGHT_SUFFIX);
        PathBuf::from(name)
    }
}

/// Visible file name for an id.
pub fn file_name(id: ItemId) -> String {
    format!("{id}{ITEM_SUFFIX}")
}

/// Temporary file name used while enqueueing an id.
pub fn temp_file_name(id: ItemId) -> String {
    format!("{TEMP_PREFIX}{id}")
}

/// Parses a visible item file name, returning `None` for anything else.
pub fn parse_visible(name: &str) -> Option<ItemId> {
    let stem = name.strip_suffix(ITEM_SUFFIX)?;
    if stem.len() != ITEM_ID_LEN {
        return None;
    }
    ItemId::parse(stem)
}

/// Parses an in-flight marker file name, returning `None` for anything else.
pub fn parse_in_flight(name: &str) -> Option<ItemId> {
    parse_visible(name.strip_suffix(IN_FLIGHT_SUFFIX)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemIdGenerator;

    #[test]
    fn visible_name_parses_back() {
        let id = ItemIdGenerator::new().next_id();
        let name = file_name(id);

        assert_eq!(name.len(), ITEM_ID_LEN + ITEM_SUFFIX.len());
        assert_eq!(parse_visible(&name), Some(id));
        assert_eq!(parse_in_flight(&name), None);
    }

    #[test]
    fn in_flight_path_appends_suffix() {
        let id = ItemIdGenerator::new().next_id();
        let item = QueueItem::new(Path::new("/q"), id);

        let marker = item.in_flight_path();
        let marker_name = marker.file_name().unwrap().to_str().unwrap();

        assert_eq!(marker_name, format!("{id}.dirq-item.dat.y"));
        assert_eq!(parse_in_flight(marker_name), Some(id));
        assert_eq!(parse_visible(marker_name), None);
    }

    #[test]
    fn foreign_names_are_ignored() {
        let id = ItemIdGenerator::new().next_id();

        assert_eq!(parse_visible("destination.json"), None);
        assert_eq!(parse_visible(&temp_file_name(id)), None);
        assert_eq!(parse_visible(".dirq-item.dat"), None);
        assert_eq!(parse_visible("short.dirq-item.dat"), None);
        assert_eq!(parse_in_flight("destination.json.y"), None);
    }
}
