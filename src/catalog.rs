//! Color and texture catalogs.
//!
//! Both catalogs are JSON array blobs in the local store (`colors`,
//! `textures`). Products are validated against them before an order is
//! created.

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::{KEY_COLORS, KEY_TEXTURES};
use crate::db::{self, LocalStore};
use crate::error::SyncError;
use crate::models::{ProductConfig, Texture};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorSwatch {
    pub id: String,
    pub name: String,
    /// `#rrggbb`
    #[serde(default)]
    pub hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTexture {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub colors: Vec<ColorSwatch>,
    pub textures: Vec<StockTexture>,
}

/// Read a catalog section. Returns an empty list on miss or error.
fn read_section<T: serde::de::DeserializeOwned>(store: &dyn LocalStore, key: &str) -> Vec<T> {
    let raw = match db::read_json_array(store, key) {
        Ok(raw) => raw,
        Err(e) => {
            error!("catalog[{key}] unreadable: {e}");
            return Vec::new();
        }
    };
    raw.into_iter()
        .filter_map(|entry| match serde_json::from_value::<T>(entry) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("catalog[{key}] skipping malformed entry: {e}");
                None
            }
        })
        .collect()
}

impl Catalog {
    /// Load both sections from the local store.
    pub fn load(store: &dyn LocalStore) -> Self {
        Self {
            colors: read_section(store, KEY_COLORS),
            textures: read_section(store, KEY_TEXTURES),
        }
    }

    pub fn save(&self, store: &dyn LocalStore) -> Result<(), SyncError> {
        db::write_json(store, KEY_COLORS, &serde_json::to_value(&self.colors).unwrap_or_default())?;
        db::write_json(
            store,
            KEY_TEXTURES,
            &serde_json::to_value(&self.textures).unwrap_or_default(),
        )?;
        Ok(())
    }

    pub fn color(&self, id: &str) -> Option<&ColorSwatch> {
        self.colors.iter().find(|c| c.id == id)
    }

    pub fn texture(&self, id: &str) -> Option<&StockTexture> {
        self.textures.iter().find(|t| t.id == id)
    }

    /// Check a product against the catalog.
    ///
    /// Stock textures must exist in the texture catalog. Part colors are only
    /// checked when a color catalog has been configured.
    pub fn validate_product(&self, product: &ProductConfig) -> Result<(), SyncError> {
        match &product.texture {
            Texture::Stock { texture_id } => {
                if self.texture(texture_id).is_none() {
                    return Err(SyncError::InvalidProduct(format!(
                        "unknown stock texture: {texture_id}"
                    )));
                }
            }
            Texture::Custom { description } => {
                if description.trim().is_empty() {
                    return Err(SyncError::InvalidProduct(
                        "custom texture needs a description".into(),
                    ));
                }
            }
        }

        if !self.colors.is_empty() {
            for color in product.colors.iter() {
                if self.color(color).is_none() {
                    return Err(SyncError::InvalidProduct(format!("unknown color: {color}")));
                }
            }
        }
        Ok(())
    }
}
