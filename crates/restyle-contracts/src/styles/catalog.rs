use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const IDENTITY_STYLE_ID: &str = "original";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleDescriptor {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub is_identity: bool,
    /// Bundled asset reference: a path relative to the bundle root or an absolute URL.
    #[serde(default)]
    pub asset_ref: Option<String>,
}

impl StyleDescriptor {
    pub fn identity() -> Self {
        Self {
            id: IDENTITY_STYLE_ID.to_string(),
            display_name: "Original".to_string(),
            is_identity: true,
            asset_ref: None,
        }
    }

    pub fn styled(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            is_identity: false,
            asset_ref: Some(format!("styles/{id}.png")),
        }
    }
}

/// Ordered, immutable list of selectable styles.
#[derive(Debug, Clone)]
pub struct StyleCatalog {
    styles: IndexMap<String, StyleDescriptor>,
    identity: StyleDescriptor,
}

impl Default for StyleCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StyleCatalog {
    /// Builds a catalog. A custom list without an identity entry gets one prepended.
    pub fn new(styles: Option<IndexMap<String, StyleDescriptor>>) -> Self {
        let mut styles = styles.unwrap_or_else(default_styles);
        let identity = match styles.values().find(|style| style.is_identity) {
            Some(identity) => identity.clone(),
            None => {
                let identity = StyleDescriptor::identity();
                styles.shift_insert(0, identity.id.clone(), identity.clone());
                identity
            }
        };
        Self { styles, identity }
    }

    pub fn from_list(styles: Vec<StyleDescriptor>) -> Self {
        Self::new(Some(
            styles
                .into_iter()
                .map(|style| (style.id.clone(), style))
                .collect(),
        ))
    }

    pub fn get(&self, id: &str) -> Option<&StyleDescriptor> {
        self.styles.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &StyleDescriptor> {
        self.styles.values()
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }

    /// The identity entry; also the initial selection.
    pub fn identity(&self) -> &StyleDescriptor {
        &self.identity
    }

    pub fn is_identity(&self, id: &str) -> bool {
        self.get(id).map(|style| style.is_identity).unwrap_or(false)
    }

    /// First non-identity entry, used when a requested style cannot be resolved.
    pub fn default_fallback(&self) -> Option<&StyleDescriptor> {
        self.styles.values().find(|style| !style.is_identity)
    }
}

fn default_styles() -> IndexMap<String, StyleDescriptor> {
    let mut map = IndexMap::new();
    let identity = StyleDescriptor::identity();
    map.insert(identity.id.clone(), identity);

    for (id, display_name) in [
        ("banana", "Banana"),
        ("joker", "Joker"),
        ("monkey", "Monkey"),
        ("office", "Office"),
        ("pirate", "Pirate"),
        ("anime", "Anime"),
        ("alien", "Alien"),
        ("sherlock", "Sherlock"),
        ("vampire", "Vampire"),
    ] {
        map.insert(id.to_string(), StyleDescriptor::styled(id, display_name));
    }
    map
}
