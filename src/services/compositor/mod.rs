//! Compositor: key-color background removal and garment preview placement
//!
//! `composite_and_key` surfaces every failure to the caller. `place_pattern`
//! is advisory: any failure is logged and collapses to `None`.

pub mod keying;
pub mod placement;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{CompositorError, CompositorResult};
use crate::core::types::{ImageSource, PlacementGeometry, PrintFlow};
use crate::services::fetch::ImageFetcher;
use crate::services::storage::{ObjectStorage, CONTENT_TYPE_PNG};
use crate::utils::image_ops::{
    decode_base64_padded, encode_png, encode_png_with_dpi, load_image_from_memory_async,
    png_data_url, resize_exact_async,
};
use crate::utils::Metrics;

/// `(under * (255 - weight) + over * weight) / 255`, rounded
pub(crate) fn blend_channel(under: u8, over: u8, weight: u8) -> u8 {
    let w = u32::from(weight);
    let t = u32::from(under) * (255 - w) + u32::from(over) * w + 128;
    (((t >> 8) + t) >> 8) as u8
}

/// Settings the compositor needs, lifted out of the process config
#[derive(Debug, Clone)]
pub struct CompositorSettings {
    pub key_color: [u8; 4],
    pub canonical_size: u32,
    pub cart_dpi: u32,
    pub batch_dpi: u32,
    pub scratch_dir: PathBuf,
    pub masked_bucket: String,
    pub presign_ttl: Duration,
}

impl CompositorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            key_color: config.key_color(),
            canonical_size: config.composite.canonical_size,
            cart_dpi: config.dpi_for(PrintFlow::Cart),
            batch_dpi: config.dpi_for(PrintFlow::Batch),
            scratch_dir: config.composite.scratch_dir.clone(),
            masked_bucket: config.storage.masked_bucket.clone(),
            presign_ttl: config.storage.presign_ttl,
        }
    }

    fn dpi(&self, flow: PrintFlow) -> u32 {
        match flow {
            PrintFlow::Cart => self.cart_dpi,
            PrintFlow::Batch => self.batch_dpi,
        }
    }
}

pub struct Compositor {
    settings: CompositorSettings,
    fetcher: Arc<dyn ImageFetcher>,
    storage: Arc<dyn ObjectStorage>,
    metrics: Metrics,
}

impl Compositor {
    pub fn new(
        settings: CompositorSettings,
        fetcher: Arc<dyn ImageFetcher>,
        storage: Arc<dyn ObjectStorage>,
        metrics: Metrics,
    ) -> Self {
        Self {
            settings,
            fetcher,
            storage,
            metrics,
        }
    }

    pub fn settings(&self) -> &CompositorSettings {
        &self.settings
    }

    /// Decode an image from an inline data URI, a remote URL, or raw bytes.
    pub async fn resolve_source(&self, source: &ImageSource) -> CompositorResult<DynamicImage> {
        let bytes = match source {
            ImageSource::DataUri(payload) => Arc::new(decode_base64_padded(payload)?),
            ImageSource::Url(url) => Arc::new(self.fetcher.fetch(url).await?),
            ImageSource::Bytes(bytes) => Arc::clone(bytes),
        };
        load_image_from_memory_async(bytes).await
    }

    /// Key-color removal without the upload: returns the DPI-tagged PNG.
    #[instrument(skip(self, source, mask_png))]
    pub async fn key_composite(
        &self,
        source: &ImageSource,
        mask_png: Arc<Vec<u8>>,
        flow: PrintFlow,
    ) -> CompositorResult<Vec<u8>> {
        let size = self.settings.canonical_size;
        let key = self.settings.key_color;
        let dpi = self.settings.dpi(flow);
        let scratch_dir = self.settings.scratch_dir.clone();

        // Step 1: normalized mask template
        let mask = load_image_from_memory_async(mask_png).await?;

        // Step 2: source at canonical size
        let source = self.resolve_source(source).await?;
        let source = resize_exact_async(source, size, size, FilterType::CatmullRom)
            .await?
            .to_rgba8();

        tokio::task::spawn_blocking(move || -> CompositorResult<Vec<u8>> {
            let mut mask = mask.to_rgba8();
            if mask.dimensions() != (size, size) {
                debug!(
                    "Scaling {}x{} mask to {}px",
                    mask.width(),
                    mask.height(),
                    size
                );
                mask = image::imageops::resize(&mask, size, size, FilterType::Nearest);
            }
            keying::normalize_mask(&mut mask, key);

            // Step 3: mask over source, round-tripped through a scratch PNG
            let blended = keying::blend_mask_over(&mask, &source);
            let reloaded = round_trip_scratch(&blended, &scratch_dir)?;

            // Step 4: key out, tag DPI
            let keyed = keying::remove_key_color(&reloaded, key);
            encode_png_with_dpi(&keyed, dpi)
        })
        .await?
    }

    /// Key a source image against a mask template, upload the result to the
    /// masked-images bucket, and return a presigned URL.
    #[instrument(skip(self, source, mask_png))]
    pub async fn composite_and_key(
        &self,
        source: &ImageSource,
        mask_png: Arc<Vec<u8>>,
        output_id: &str,
        flow: PrintFlow,
    ) -> CompositorResult<String> {
        let result = async {
            let png = self.key_composite(source, mask_png, flow).await?;
            let key = format!("{}.png", output_id);
            let bucket = &self.settings.masked_bucket;

            self.storage
                .upload(png, &key, bucket, CONTENT_TYPE_PNG)
                .await?;
            let url = self
                .storage
                .presigned_url(&key, bucket, self.settings.presign_ttl)
                .await?;
            Ok::<_, CompositorError>(url)
        }
        .await;

        self.metrics.record_composite(result.is_ok());
        match &result {
            Ok(_) => info!("Keyed composite stored"),
            Err(e) => warn!("Keyed composite failed: {}", e),
        }
        result
    }

    /// Place a pattern onto a garment and return a PNG data URL.
    pub async fn try_place_pattern(
        &self,
        pattern: &ImageSource,
        base_garment_base64: &str,
        geometry: &PlacementGeometry,
    ) -> CompositorResult<String> {
        let garment_bytes = Arc::new(decode_base64_padded(base_garment_base64)?);
        let garment = load_image_from_memory_async(garment_bytes).await?;
        let pattern = self.resolve_source(pattern).await?;
        let geometry = *geometry;

        tokio::task::spawn_blocking(move || -> CompositorResult<String> {
            let preview =
                placement::compose_preview(&pattern.to_rgba8(), &garment.to_rgba8(), &geometry)?;
            let png = encode_png(&DynamicImage::ImageRgba8(preview))?;
            Ok(png_data_url(&png))
        })
        .await?
    }

    /// Best-effort preview: `None` when anything goes wrong.
    #[instrument(skip(self, pattern, base_garment_base64))]
    pub async fn place_pattern(
        &self,
        pattern: &ImageSource,
        base_garment_base64: &str,
        geometry: &PlacementGeometry,
    ) -> Option<String> {
        let result = self
            .try_place_pattern(pattern, base_garment_base64, geometry)
            .await;
        self.metrics.record_preview(result.is_ok());
        match result {
            Ok(data_url) => Some(data_url),
            Err(e) => {
                warn!("No preview available: {}", e);
                None
            }
        }
    }
}

/// Write to a uniquely named scratch file and decode it back. The file is
/// removed when the handle drops, on every path.
fn round_trip_scratch(img: &RgbaImage, dir: &std::path::Path) -> CompositorResult<RgbaImage> {
    let scratch = tempfile::Builder::new()
        .prefix("composite-")
        .suffix(".png")
        .tempfile_in(dir)?;

    img.save_with_format(scratch.path(), ImageFormat::Png)?;
    let reloaded = image::open(scratch.path())?.to_rgba8();
    Ok(reloaded)
}
