//! Generic category vocabulary and per-backend category mapping
//!
//! Generic categories follow the Newznab numbering scheme. Parent categories
//! are in thousands (1000, 2000, etc.) and subcategories add tens (2010,
//! 2020, etc.). Ids from 100000 upwards are backend-specific custom
//! categories created 1:1 from labelled native categories.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// First id of the backend-specific custom category range
pub const CUSTOM_CATEGORY_OFFSET: i32 = 100_000;

/// A standard generic category definition
#[derive(Debug, Clone)]
pub struct StandardCategory {
    pub id: i32,
    pub name: &'static str,
    pub parent_id: Option<i32>,
}

impl StandardCategory {
    pub const fn new(id: i32, name: &'static str, parent_id: Option<i32>) -> Self {
        Self {
            id,
            name,
            parent_id,
        }
    }

    pub fn is_parent(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Standard Newznab categories
pub static STANDARD_CATEGORIES: &[StandardCategory] = &[
    StandardCategory::new(1000, "Console", None),
    StandardCategory::new(1010, "Console/NDS", Some(1000)),
    StandardCategory::new(1020, "Console/PSP", Some(1000)),
    StandardCategory::new(1030, "Console/Wii", Some(1000)),
    StandardCategory::new(1040, "Console/XBox", Some(1000)),
    StandardCategory::new(1050, "Console/XBox 360", Some(1000)),
    StandardCategory::new(1060, "Console/Wiiware", Some(1000)),
    StandardCategory::new(1070, "Console/XBox 360 DLC", Some(1000)),
    StandardCategory::new(1080, "Console/PS3", Some(1000)),
    StandardCategory::new(1090, "Console/Other", Some(1000)),
    StandardCategory::new(1110, "Console/3DS", Some(1000)),
    StandardCategory::new(1120, "Console/PS Vita", Some(1000)),
    StandardCategory::new(1130, "Console/WiiU", Some(1000)),
    StandardCategory::new(1140, "Console/XBox One", Some(1000)),
    StandardCategory::new(1180, "Console/PS4", Some(1000)),
    StandardCategory::new(2000, "Movies", None),
    StandardCategory::new(2010, "Movies/Foreign", Some(2000)),
    StandardCategory::new(2020, "Movies/Other", Some(2000)),
    StandardCategory::new(2030, "Movies/SD", Some(2000)),
    StandardCategory::new(2040, "Movies/HD", Some(2000)),
    StandardCategory::new(2045, "Movies/UHD", Some(2000)),
    StandardCategory::new(2050, "Movies/BluRay", Some(2000)),
    StandardCategory::new(2060, "Movies/3D", Some(2000)),
    StandardCategory::new(2070, "Movies/DVD", Some(2000)),
    StandardCategory::new(2080, "Movies/WEB-DL", Some(2000)),
    StandardCategory::new(2090, "Movies/x265", Some(2000)),
    StandardCategory::new(3000, "Audio", None),
    StandardCategory::new(3010, "Audio/MP3", Some(3000)),
    StandardCategory::new(3020, "Audio/Video", Some(3000)),
    StandardCategory::new(3030, "Audio/Audiobook", Some(3000)),
    StandardCategory::new(3040, "Audio/Lossless", Some(3000)),
    StandardCategory::new(3050, "Audio/Other", Some(3000)),
    StandardCategory::new(3060, "Audio/Foreign", Some(3000)),
    StandardCategory::new(4000, "PC", None),
    StandardCategory::new(4010, "PC/0day", Some(4000)),
    StandardCategory::new(4020, "PC/ISO", Some(4000)),
    StandardCategory::new(4030, "PC/Mac", Some(4000)),
    StandardCategory::new(4040, "PC/Mobile-Other", Some(4000)),
    StandardCategory::new(4050, "PC/Games", Some(4000)),
    StandardCategory::new(4060, "PC/Mobile-iOS", Some(4000)),
    StandardCategory::new(4070, "PC/Mobile-Android", Some(4000)),
    StandardCategory::new(5000, "TV", None),
    StandardCategory::new(5010, "TV/WEB-DL", Some(5000)),
    StandardCategory::new(5020, "TV/Foreign", Some(5000)),
    StandardCategory::new(5030, "TV/SD", Some(5000)),
    StandardCategory::new(5040, "TV/HD", Some(5000)),
    StandardCategory::new(5045, "TV/UHD", Some(5000)),
    StandardCategory::new(5050, "TV/Other", Some(5000)),
    StandardCategory::new(5060, "TV/Sport", Some(5000)),
    StandardCategory::new(5070, "TV/Anime", Some(5000)),
    StandardCategory::new(5080, "TV/Documentary", Some(5000)),
    StandardCategory::new(5090, "TV/x265", Some(5000)),
    StandardCategory::new(6000, "XXX", None),
    StandardCategory::new(6010, "XXX/DVD", Some(6000)),
    StandardCategory::new(6020, "XXX/WMV", Some(6000)),
    StandardCategory::new(6030, "XXX/XviD", Some(6000)),
    StandardCategory::new(6040, "XXX/x264", Some(6000)),
    StandardCategory::new(6045, "XXX/UHD", Some(6000)),
    StandardCategory::new(6050, "XXX/Pack", Some(6000)),
    StandardCategory::new(6060, "XXX/ImageSet", Some(6000)),
    StandardCategory::new(6070, "XXX/Other", Some(6000)),
    StandardCategory::new(6080, "XXX/SD", Some(6000)),
    StandardCategory::new(6090, "XXX/WEB-DL", Some(6000)),
    StandardCategory::new(7000, "Books", None),
    StandardCategory::new(7010, "Books/Mags", Some(7000)),
    StandardCategory::new(7020, "Books/EBook", Some(7000)),
    StandardCategory::new(7030, "Books/Comics", Some(7000)),
    StandardCategory::new(7040, "Books/Technical", Some(7000)),
    StandardCategory::new(7050, "Books/Other", Some(7000)),
    StandardCategory::new(7060, "Books/Foreign", Some(7000)),
    StandardCategory::new(8000, "Other", None),
    StandardCategory::new(8010, "Other/Misc", Some(8000)),
    StandardCategory::new(8020, "Other/Hashed", Some(8000)),
];

/// Common category constants
pub mod cats {
    pub const CONSOLE: i32 = 1000;
    pub const MOVIES: i32 = 2000;
    pub const AUDIO: i32 = 3000;
    pub const PC: i32 = 4000;
    pub const TV: i32 = 5000;
    pub const XXX: i32 = 6000;
    pub const BOOKS: i32 = 7000;
    pub const OTHER: i32 = 8000;
    pub const OTHER_MISC: i32 = 8010;

    pub const MOVIES_FOREIGN: i32 = 2010;
    pub const MOVIES_SD: i32 = 2030;
    pub const MOVIES_HD: i32 = 2040;
    pub const MOVIES_UHD: i32 = 2045;
    pub const MOVIES_BLURAY: i32 = 2050;

    pub const AUDIO_MP3: i32 = 3010;
    pub const AUDIO_AUDIOBOOK: i32 = 3030;
    pub const AUDIO_LOSSLESS: i32 = 3040;

    pub const TV_SD: i32 = 5030;
    pub const TV_HD: i32 = 5040;
    pub const TV_UHD: i32 = 5045;
    pub const TV_ANIME: i32 = 5070;

    pub const BOOKS_EBOOK: i32 = 7020;
    pub const BOOKS_COMICS: i32 = 7030;
}

/// Look up a standard category by id
pub fn get_category(id: i32) -> Option<&'static StandardCategory> {
    STANDARD_CATEGORIES.iter().find(|c| c.id == id)
}

/// All standard subcategories of a parent
pub fn get_subcategories(parent_id: i32) -> Vec<&'static StandardCategory> {
    STANDARD_CATEGORIES
        .iter()
        .filter(|c| c.parent_id == Some(parent_id))
        .collect()
}

/// Display name of a generic category, empty when it is not a standard one
pub fn category_name(id: i32) -> &'static str {
    get_category(id).map(|c| c.name).unwrap_or_default()
}

/// Stable custom category id for a native category
///
/// Numeric native ids are offset directly. Anything else is hashed down to
/// a u16 so the id survives restarts and category list reordering.
/// Numeric ids that are negative or would leave the `i32` range are hashed
/// like any other string.
pub fn custom_category_id(native_id: &str) -> i32 {
    let direct = native_id
        .parse::<i32>()
        .ok()
        .filter(|n| *n >= 0)
        .and_then(|n| n.checked_add(CUSTOM_CATEGORY_OFFSET));

    direct.unwrap_or_else(|| {
        let hash = Sha256::digest(native_id.as_bytes());
        i32::from(u16::from_le_bytes([hash[0], hash[1]])) + CUSTOM_CATEGORY_OFFSET
    })
}

/// One configured entry: a native category and the generic ids it maps to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEntry {
    /// The backend's own category identifier
    pub id: String,
    /// Generic categories this native category belongs to
    pub generic: Vec<i32>,
    /// Native label, also used to name the custom category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CategoryMapping {
    native_id: String,
    generic_id: i32,
}

/// A node of the generic category tree a backend exposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryNode {
    pub id: i32,
    pub name: String,
    pub children: Vec<(i32, String)>,
}

impl CategoryNode {
    fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            children: Vec::new(),
        }
    }

    fn contains(&self, id: i32) -> bool {
        self.id == id || self.children.iter().any(|(child, _)| *child == id)
    }
}

/// Bidirectional mapping between a backend's native categories and the
/// generic vocabulary
///
/// Mappings are many-to-many and keep the order they were added in. The
/// generic category tree is derived from the mappings and is what search
/// support and category expansion are answered from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<CategoryEntry>", into = "Vec<CategoryEntry>")]
pub struct CategoryMap {
    entries: Vec<CategoryEntry>,
    mappings: Vec<CategoryMapping>,
    tree: Vec<CategoryNode>,
}

impl CategoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a native category to one generic category
    ///
    /// Call repeatedly with the same native id for many-to-many mappings.
    /// A label additionally creates a 1:1 custom category for the native id.
    pub fn add_mapping(&mut self, native_id: impl Into<String>, generic_id: i32, label: Option<&str>) {
        let native_id = native_id.into();

        match self.entries.iter_mut().find(|e| e.id == native_id) {
            Some(entry) => {
                if !entry.generic.contains(&generic_id) {
                    entry.generic.push(generic_id);
                }
                if entry.label.is_none() {
                    entry.label = label.map(str::to_string);
                }
            }
            None => self.entries.push(CategoryEntry {
                id: native_id.clone(),
                generic: vec![generic_id],
                label: label.map(str::to_string),
            }),
        }

        self.push_mapping(&native_id, generic_id, category_name(generic_id));

        if let Some(label) = label {
            let custom_id = custom_category_id(&native_id);
            self.push_mapping(&native_id, custom_id, label);
        }
    }

    /// Configured entries, in insertion order
    pub fn entries(&self) -> &[CategoryEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Native categories whose entries intersect the requested generic ids
    ///
    /// Requested parents are expanded to their children first. The result
    /// is de-duplicated.
    pub fn map_generic_to_native(&self, generic_ids: &[i32]) -> Vec<String> {
        let expanded = self.expand(generic_ids);
        let mut natives: Vec<String> = Vec::new();

        for mapping in &self.mappings {
            if expanded.contains(&mapping.generic_id) && !natives.contains(&mapping.native_id) {
                natives.push(mapping.native_id.clone());
            }
        }

        natives
    }

    /// Generic categories attached to a native category
    ///
    /// Matching is case-insensitive. Every generic id the native category
    /// was mapped to is returned, including its custom category.
    pub fn map_native_to_generic(&self, native_id: &str) -> Vec<i32> {
        let native_id = native_id.trim();
        if native_id.is_empty() {
            return Vec::new();
        }

        let mut generic = Vec::new();
        for mapping in &self.mappings {
            if mapping.native_id.eq_ignore_ascii_case(native_id) && !generic.contains(&mapping.generic_id) {
                generic.push(mapping.generic_id);
            }
        }
        generic
    }

    /// Whether the backend has any overlap with the requested categories
    ///
    /// An empty request means "all categories" and is always supported.
    pub fn supports(&self, generic_ids: &[i32]) -> bool {
        if generic_ids.is_empty() {
            return true;
        }

        generic_ids
            .iter()
            .any(|id| self.tree.iter().any(|node| node.contains(*id)))
    }

    /// Expand requested categories with the children this backend knows of
    ///
    /// Custom categories are never expanded.
    pub fn expand(&self, generic_ids: &[i32]) -> Vec<i32> {
        let mut expanded = Vec::new();

        for &id in generic_ids {
            if !expanded.contains(&id) {
                expanded.push(id);
            }
            if id >= CUSTOM_CATEGORY_OFFSET {
                continue;
            }
            if let Some(node) = self.tree.iter().find(|node| node.id == id) {
                for (child, _) in &node.children {
                    if !expanded.contains(child) {
                        expanded.push(*child);
                    }
                }
            }
        }

        expanded
    }

    /// Native categories mapped to standard generic categories
    pub fn native_categories(&self) -> Vec<String> {
        let mut natives: Vec<String> = Vec::new();
        for mapping in &self.mappings {
            if mapping.generic_id < CUSTOM_CATEGORY_OFFSET && !natives.contains(&mapping.native_id) {
                natives.push(mapping.native_id.clone());
            }
        }
        natives
    }

    /// Generic category tree, standard categories first ordered by id, then
    /// custom categories ordered by name
    pub fn tree(&self) -> Vec<CategoryNode> {
        let mut tree = self.tree.clone();
        for node in &mut tree {
            node.children.sort_by_key(|(id, _)| *id);
        }
        tree.sort_by(|a, b| {
            let a_custom = a.id >= CUSTOM_CATEGORY_OFFSET;
            let b_custom = b.id >= CUSTOM_CATEGORY_OFFSET;
            match (a_custom, b_custom) {
                (false, false) => a.id.cmp(&b.id),
                (true, true) => a.name.cmp(&b.name),
                (false, true) => std::cmp::Ordering::Less,
                (true, false) => std::cmp::Ordering::Greater,
            }
        });
        tree
    }

    /// Every generic id present in the tree, parents and children
    pub fn generic_ids(&self) -> Vec<i32> {
        self.tree
            .iter()
            .flat_map(|node| std::iter::once(node.id).chain(node.children.iter().map(|(id, _)| *id)))
            .collect()
    }

    fn push_mapping(&mut self, native_id: &str, generic_id: i32, name: &str) {
        let mapping = CategoryMapping {
            native_id: native_id.to_string(),
            generic_id,
        };
        if !self.mappings.contains(&mapping) {
            self.mappings.push(mapping);
        }
        self.add_to_tree(generic_id, name);
    }

    fn add_to_tree(&mut self, id: i32, name: &str) {
        if let Some(standard) = get_category(id) {
            match standard.parent_id {
                None => {
                    if !self.tree.iter().any(|n| n.id == id) {
                        self.tree.push(CategoryNode::new(id, standard.name));
                    }
                }
                Some(parent_id) => self.add_child(parent_id, id, standard.name),
            }
            return;
        }

        // Non-standard ids in the thousands hang off the matching parent
        if id > 1000 && id < 10000 {
            if let Some(parent) = get_category(id / 1000 * 1000).filter(|c| c.is_parent()) {
                self.add_child(parent.id, id, name);
                return;
            }
        }

        if !self.tree.iter().any(|n| n.contains(id)) {
            self.tree.push(CategoryNode::new(id, name));
        }
    }

    fn add_child(&mut self, parent_id: i32, id: i32, name: &str) {
        let index = match self.tree.iter().position(|n| n.id == parent_id) {
            Some(index) => index,
            None => {
                self.tree
                    .push(CategoryNode::new(parent_id, category_name(parent_id)));
                self.tree.len() - 1
            }
        };

        let node = &mut self.tree[index];
        if !node.contains(id) {
            node.children.push((id, name.to_string()));
        }
    }
}

impl From<Vec<CategoryEntry>> for CategoryMap {
    fn from(entries: Vec<CategoryEntry>) -> Self {
        let mut map = CategoryMap::new();
        for entry in entries {
            if entry.generic.is_empty() {
                tracing::warn!(native_id = %entry.id, "Category entry has no generic mapping, ignoring");
                continue;
            }
            for generic_id in &entry.generic {
                map.add_mapping(entry.id.clone(), *generic_id, entry.label.as_deref());
            }
        }
        map
    }
}

impl From<CategoryMap> for Vec<CategoryEntry> {
    fn from(map: CategoryMap) -> Self {
        map.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_map() -> CategoryMap {
        let mut map = CategoryMap::new();
        map.add_mapping("44", cats::MOVIES, None);
        map.add_mapping("48", cats::MOVIES_HD, None);
        map.add_mapping("48", cats::MOVIES_UHD, None);
        map.add_mapping("5", cats::TV_HD, None);
        map
    }

    #[test]
    fn test_empty_request_is_always_supported() {
        assert!(sample_map().supports(&[]));
        assert!(CategoryMap::new().supports(&[]));
    }

    #[test]
    fn test_supports_parent_through_child_mapping() {
        let map = sample_map();
        assert!(map.supports(&[cats::TV]));
        assert!(map.supports(&[cats::MOVIES_UHD]));
        assert!(!map.supports(&[cats::AUDIO]));
        assert!(!map.supports(&[cats::TV_SD]));
    }

    #[test]
    fn test_native_to_generic_returns_every_mapping() {
        let map = sample_map();
        assert_eq!(map.map_native_to_generic("48"), vec![2040, 2045]);
        assert_eq!(map.map_native_to_generic("44"), vec![2000]);
        assert!(map.map_native_to_generic("99").is_empty());
        assert!(map.map_native_to_generic("").is_empty());
    }

    #[test]
    fn test_generic_to_native_expands_parents() {
        let map = sample_map();
        assert_eq!(map.map_generic_to_native(&[cats::MOVIES]), vec!["44", "48"]);
        assert_eq!(map.map_generic_to_native(&[cats::MOVIES_HD]), vec!["48"]);
        assert_eq!(map.map_generic_to_native(&[cats::TV, cats::TV_HD]), vec!["5"]);
    }

    #[test]
    fn test_native_and_generic_lookups_agree() {
        let map = sample_map();
        for entry in map.entries() {
            let generic = map.map_native_to_generic(&entry.id);
            assert_eq!(generic, entry.generic);
            for id in generic {
                assert!(map.map_generic_to_native(&[id]).contains(&entry.id));
            }
        }
    }

    #[test]
    fn test_labelled_category_gets_custom_id() {
        let mut map = CategoryMap::new();
        map.add_mapping("17", cats::TV_ANIME, Some("Anime Series"));
        map.add_mapping("anime-movies", cats::MOVIES, Some("Anime Movies"));

        assert_eq!(map.map_native_to_generic("17"), vec![5070, 100_017]);

        let hashed = custom_category_id("anime-movies");
        assert!((CUSTOM_CATEGORY_OFFSET..CUSTOM_CATEGORY_OFFSET + 65_536).contains(&hashed));
        assert_eq!(hashed, custom_category_id("anime-movies"));
        assert!(map.supports(&[hashed]));
        assert_eq!(map.map_generic_to_native(&[hashed]), vec!["anime-movies"]);

        // Custom categories are excluded from the native category listing
        assert_eq!(map.native_categories(), vec!["17", "anime-movies"]);
    }

    #[test]
    fn test_out_of_range_numeric_ids_are_hashed() {
        let custom = CUSTOM_CATEGORY_OFFSET..CUSTOM_CATEGORY_OFFSET + 65_536;

        let huge = custom_category_id("2147483600");
        assert!(custom.contains(&huge));
        assert_eq!(huge, custom_category_id("2147483600"));

        let negative = custom_category_id("-5");
        assert!(custom.contains(&negative));

        assert_eq!(
            custom_category_id(&(i32::MAX - CUSTOM_CATEGORY_OFFSET).to_string()),
            i32::MAX
        );

        let mut map = CategoryMap::new();
        map.add_mapping("2147483600", cats::OTHER, Some("Huge"));
        assert_eq!(map.map_native_to_generic("2147483600"), vec![cats::OTHER, huge]);
    }

    #[test]
    fn test_expand_uses_backend_tree() {
        let map = sample_map();
        let expanded = map.expand(&[cats::MOVIES]);
        assert_eq!(expanded, vec![2000, 2040, 2045]);

        // Custom ids pass through untouched
        assert_eq!(map.expand(&[100_044]), vec![100_044]);
    }

    #[test]
    fn test_tree_orders_custom_categories_last() {
        let mut map = CategoryMap::new();
        map.add_mapping("z", cats::TV_HD, Some("Zed"));
        map.add_mapping("a", cats::MOVIES_HD, Some("Alpha"));

        let ids: Vec<i32> = map.tree().iter().map(|n| n.id).collect();
        assert_eq!(&ids[..2], &[2000, 5000]);
        assert_eq!(map.tree()[2].name, "Alpha");
        assert_eq!(map.tree()[3].name, "Zed");
    }

    #[test]
    fn test_yaml_round_trip_keeps_entries() {
        let yaml = "- id: \"44\"\n  generic: [2000]\n- id: \"48\"\n  generic: [2040, 2045]\n  label: HD\n";
        let map: CategoryMap = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(map.entries().len(), 2);
        assert!(map.supports(&[cats::MOVIES_UHD]));
        assert_eq!(map.map_native_to_generic("48"), vec![2040, 100_048, 2045]);
    }

    #[test]
    fn test_get_subcategories() {
        let subs = get_subcategories(cats::TV);
        assert!(subs.iter().any(|c| c.id == 5040));
        assert!(subs.iter().any(|c| c.id == 5070));
        assert!(subs.iter().all(|c| !c.is_parent()));
    }
}
