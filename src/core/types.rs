// Shared records for compositing, generation, and bulk orders

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::errors::LookupMiss;

/// Thumbnail value stored on a line item when no preview could be built
pub const THUMBNAIL_NONE: &str = "null";

/// Percentage rectangle (of the canvas height) describing where a pattern
/// sits on a square garment canvas
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlacementGeometry {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// Absolute pixel rectangle resolved from a PlacementGeometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

/// Print flow selecting the output DPI of a keyed composite
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintFlow {
    /// Interactive cart flow
    #[default]
    Cart,
    /// Legacy bulk/batch flow
    Batch,
}

/// Where an image comes from: inline data URI, remote URL, or raw bytes
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Base64 payload of a data URI (prefix already stripped)
    DataUri(String),
    Url(String),
    Bytes(Arc<Vec<u8>>),
}

impl ImageSource {
    /// Classify a string reference: anything mentioning `data:image` is an
    /// inline data URI, everything else is fetched over HTTP.
    pub fn from_reference(reference: &str) -> Self {
        if reference.contains("data:image") {
            let payload = reference
                .split_once(',')
                .map(|(_, data)| data)
                .unwrap_or_default();
            ImageSource::DataUri(payload.to_string())
        } else {
            ImageSource::Url(reference.to_string())
        }
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        ImageSource::Bytes(Arc::new(bytes))
    }
}

/// Themes to expand and the number of images to produce across them
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub themes: Vec<String>,
    pub total: usize,
}

impl GenerationRequest {
    pub fn new(themes: Vec<String>, total: usize) -> Self {
        Self { themes, total }
    }

    /// Split `total` across themes: every theme gets `total / themes`, the
    /// first `total % themes` themes get one extra.
    pub fn per_theme_counts(&self) -> Vec<(&str, usize)> {
        if self.themes.is_empty() {
            return Vec::new();
        }
        let base = self.total / self.themes.len();
        let extra = self.total % self.themes.len();
        self.themes
            .iter()
            .enumerate()
            .map(|(i, theme)| (theme.as_str(), base + usize::from(i < extra)))
            .collect()
    }
}

/// One image produced by the generation collaborator
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub index: usize,
    pub image_id: String,
    pub prompt: String,
    pub bytes: Arc<Vec<u8>>,
    pub model_tag: String,
}

/// Live progress of a bulk batch, keyed by task id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTaskState {
    pub task_id: String,
    pub success: usize,
    pub failed: usize,
    /// Percentage of items resolved (0-100)
    pub progress: u8,
    pub total: usize,
}

impl BatchTaskState {
    pub fn new(task_id: impl Into<String>, total: usize) -> Self {
        Self {
            task_id: task_id.into(),
            success: 0,
            failed: 0,
            progress: 0,
            total,
        }
    }

    pub(crate) fn recompute_progress(&mut self) {
        self.progress = if self.total == 0 {
            100
        } else {
            (((self.success + self.failed) * 100) / self.total).min(100) as u8
        };
    }
}

/// A bulk-order row as uploaded by the storefront admin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkLineItem {
    pub email: String,
    #[serde(default)]
    pub user_type: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default, rename = "streetAddress")]
    pub street_address: String,
    #[serde(default, rename = "streetAddress2")]
    pub street_address2: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default, rename = "postalZipcode")]
    pub postal_zipcode: String,
    pub apparel: String,
    #[serde(default, rename = "shirt-size")]
    pub size: String,
    pub color: String,
    #[serde(default, deserialize_with = "de_price")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl BulkLineItem {
    pub fn shipping_info(&self) -> ShippingInfo {
        ShippingInfo {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
            street_address: self.street_address.clone(),
            street_address2: self.street_address2.clone(),
            city: self.city.clone(),
            state_province: self.state.clone(),
            postal_zipcode: self.postal_zipcode.clone(),
            address_type: "primary".to_string(),
        }
    }
}

/// Accept prices sent either as JSON numbers or numeric strings
fn de_price<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Raw::Text(s)) => s
            .trim()
            .trim_start_matches('$')
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShippingInfo {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub street_address: String,
    pub street_address2: String,
    pub city: String,
    pub state_province: String,
    pub postal_zipcode: String,
    pub address_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Prepared,
    Shipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub apparel: String,
    pub size: String,
    pub color: String,
    pub img_id: String,
    pub prompt: String,
    pub timestamp: DateTime<Utc>,
    pub thumbnail: String,
    pub toggled: bool,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub user_id: String,
    pub user_type: String,
    pub org_id: Option<String>,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
    pub shipping_info: ShippingInfo,
    pub items: Vec<OrderItem>,
}

/// Front/back garment images for one color, as base64 (optionally data-URI)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub front: String,
    pub back: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColorVariant {
    pub name: String,
    pub asset: Asset,
    #[serde(default)]
    pub color_map: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub name: String,
    #[serde(default)]
    pub default_color: Option<String>,
    #[serde(default)]
    pub sizes: Vec<String>,
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(default)]
    pub colors: BTreeMap<String, ColorVariant>,
    pub dimensions: PlacementGeometry,
}

impl Product {
    pub fn color(&self, color: &str) -> Result<&ColorVariant, LookupMiss> {
        self.colors
            .values()
            .find(|variant| variant.name == color)
            .ok_or_else(|| LookupMiss::Color {
                apparel: self.name.clone(),
                color: color.to_string(),
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Organization {
    pub org_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub products: Vec<Product>,
}

impl Organization {
    /// Find the product named `apparel` that offers `color`.
    ///
    /// Products sharing a name are searched in order; the miss reports the
    /// color when at least one product matched by name.
    pub fn resolve_variant(
        &self,
        apparel: &str,
        color: &str,
    ) -> Result<(&Product, &ColorVariant), LookupMiss> {
        let mut named = self.products.iter().filter(|p| p.name == apparel).peekable();

        if named.peek().is_none() {
            return Err(LookupMiss::Product {
                org_id: self.org_id.clone(),
                apparel: apparel.to_string(),
            });
        }

        let mut last_miss = None;
        for product in named {
            match product.color(color) {
                Ok(variant) => return Ok((product, variant)),
                Err(miss) => last_miss = Some(miss),
            }
        }

        Err(last_miss.unwrap_or(LookupMiss::Color {
            apparel: apparel.to_string(),
            color: color.to_string(),
        }))
    }
}
