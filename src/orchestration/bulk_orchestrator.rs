// Bulk Orchestrator: generation workflow for bulk orders

use chrono::Utc;
use futures::future::join_all;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::retry_budget::RetryBudget;
use super::task_registry::{TaskGuard, TaskRegistry};
use crate::core::config::Config;
use crate::core::errors::{
    CompositorError, CompositorResult, LookupMiss, OrchestratorError, OrchestratorResult,
    PromptError,
};
use crate::core::types::{
    BatchTaskState, BulkLineItem, GeneratedImage, GenerationRequest, ImageSource, Order,
    OrderItem, OrderStatus, Organization, THUMBNAIL_NONE,
};
use crate::services::compositor::Compositor;
use crate::services::generation::{GenerationGate, ImageGenerator, PromptExpander};
use crate::services::storage::{ObjectStorage, CONTENT_TYPE_JPEG};
use crate::services::store::{OrderStore, OrganizationStore};
use crate::utils::image_ops::{decode_base64_padded, encode_jpeg_flattened, reencode_jpeg_async};
use crate::utils::Metrics;

const JPEG_QUALITY: u8 = 85;

/// Buckets and limits the orchestrator needs from the process config
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry_floor: usize,
    pub generated_bucket: String,
    pub thumbnail_bucket: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry_floor: config.retry_floor(),
            generated_bucket: config.storage.generated_bucket.clone(),
            thumbnail_bucket: config.storage.thumbnail_bucket.clone(),
        }
    }
}

/// Services a batch talks to
#[derive(Clone)]
pub struct BulkCollaborators {
    pub generator: Arc<dyn ImageGenerator>,
    pub expander: Arc<dyn PromptExpander>,
    /// Must be the single process-wide instance
    pub gate: GenerationGate,
    pub compositor: Arc<Compositor>,
    pub storage: Arc<dyn ObjectStorage>,
    pub orders: Arc<dyn OrderStore>,
    pub organizations: Arc<dyn OrganizationStore>,
}

/// Outcome of a completed batch
#[derive(Debug, Clone, Serialize)]
pub struct BulkBatchReport {
    pub items: Vec<BulkLineItem>,
    pub progress: BatchTaskState,
}

/// Runs bulk batches and answers progress queries
pub struct BulkOrchestrator {
    services: BulkCollaborators,
    registry: TaskRegistry,
    settings: OrchestratorSettings,
    metrics: Metrics,
}

impl BulkOrchestrator {
    pub fn new(
        services: BulkCollaborators,
        registry: TaskRegistry,
        settings: OrchestratorSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            services,
            registry,
            settings,
            metrics,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Current state of a running batch; `None` once it has finished.
    pub fn get_progress(&self, task_id: &str) -> Option<BatchTaskState> {
        self.registry.get(task_id)
    }

    /// Generate one design per line item, attach previews and persist orders.
    ///
    /// # Workflow:
    /// 1. Expand the themes into one prompt per item
    /// 2. Generate every image in one gated pass
    /// 3. Per item, in order: regenerate on failure (shared retry budget),
    ///    build the thumbnail, spawn uploads, persist the order
    /// 4. Await all uploads; an aborted batch cancels the ones still pending
    ///
    /// The task's progress entry exists for exactly the duration of this
    /// call, including when it returns an error.
    #[instrument(skip(self, items, themes), fields(task_id = %task_id, items = items.len()))]
    pub async fn run_bulk_batch(
        &self,
        items: Vec<BulkLineItem>,
        themes: Vec<String>,
        task_id: &str,
    ) -> OrchestratorResult<BulkBatchReport> {
        if items.is_empty() {
            return Err(OrchestratorError::EmptyBatch);
        }
        if themes.is_empty() {
            return Err(OrchestratorError::PromptExpansion(PromptError::NoThemes));
        }

        let start = Instant::now();
        let total = items.len();
        let guard = self.registry.begin(task_id, total)?;

        let result = self.process(&guard, items, &themes).await;
        self.metrics.record_batch(result.is_ok(), total, start.elapsed());

        match &result {
            Ok(report) => info!(
                "Batch {} done in {:.2}s: {} succeeded, {} failed",
                task_id,
                start.elapsed().as_secs_f64(),
                report.progress.success,
                report.progress.failed
            ),
            Err(e) => error!("Batch {} aborted: {}", task_id, e),
        }
        result
    }

    async fn process(
        &self,
        guard: &TaskGuard,
        items: Vec<BulkLineItem>,
        themes: &[String],
    ) -> OrchestratorResult<BulkBatchReport> {
        let total = items.len();

        // Step 1: prompts
        let request = GenerationRequest::new(themes.to_vec(), total);
        let mut prompts = self.services.expander.expand(&request).await?;
        prompts.truncate(total);
        if prompts.len() < total {
            warn!(
                "Expander returned {} prompts for {} items; the rest will be regenerated",
                prompts.len(),
                total
            );
        }

        // Step 2: first generation pass
        let pass_start = Instant::now();
        let results = self
            .services
            .gate
            .generate_all(self.services.generator.as_ref(), &prompts)
            .await;
        let pass_time = pass_start.elapsed();

        let mut generated: Vec<Option<GeneratedImage>> = Vec::with_capacity(total);
        for result in results {
            match result {
                Ok(image) => generated.push(Some(image)),
                Err(e) => {
                    debug!("First-pass generation failed: {}", e);
                    generated.push(None);
                }
            }
        }
        generated.resize_with(total, || None);
        info!(
            "First pass: {}/{} images in {:.2}s",
            generated.iter().filter(|g| g.is_some()).count(),
            total,
            pass_time.as_secs_f64()
        );

        // Step 3: per-item loop
        let mut uploads: Vec<JoinHandle<()>> = Vec::new();
        let updated = match self
            .process_items(guard, items, generated, themes, &mut uploads)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                // Nothing from an aborted batch may land in storage
                for handle in &uploads {
                    handle.abort();
                }
                debug!("Cancelled {} pending uploads", uploads.len());
                return Err(e);
            }
        };

        // Step 4: uploads
        for joined in join_all(uploads).await {
            if let Err(e) = joined {
                warn!("Upload task did not complete: {}", e);
            }
        }

        let progress = guard
            .snapshot()
            .unwrap_or_else(|| BatchTaskState::new(guard.task_id(), total));
        Ok(BulkBatchReport {
            items: updated,
            progress,
        })
    }

    /// Sequential per-item pass. Spawned upload handles are pushed to
    /// `uploads` so the caller can await or cancel them.
    async fn process_items(
        &self,
        guard: &TaskGuard,
        items: Vec<BulkLineItem>,
        generated: Vec<Option<GeneratedImage>>,
        themes: &[String],
        uploads: &mut Vec<JoinHandle<()>>,
    ) -> OrchestratorResult<Vec<BulkLineItem>> {
        let budget = RetryBudget::for_batch(items.len(), self.settings.retry_floor);
        let mut updated = Vec::with_capacity(items.len());

        for (index, (mut item, first)) in items.into_iter().zip(generated).enumerate() {
            let image = match first {
                Some(image) => image,
                None => self.regenerate(guard, index, themes, &budget).await?,
            };

            let thumbnail = self.build_thumbnail(&item, &image).await;

            uploads.push(self.spawn_generated_upload(&image));
            if let Some(data_url) = &thumbnail {
                uploads.push(self.spawn_thumbnail_upload(data_url.clone(), &image.image_id));
            }

            let stored_thumbnail = match &thumbnail {
                Some(_) => format!("t_{}", image.image_id),
                None => THUMBNAIL_NONE.to_string(),
            };
            item.img_id = Some(image.image_id.clone());
            item.prompt = Some(image.prompt.clone());
            item.thumbnail = Some(thumbnail.unwrap_or_else(|| THUMBNAIL_NONE.to_string()));

            if let Err(e) = self.persist(&mut item, index, stored_thumbnail).await {
                guard.record_failure();
                return Err(e);
            }

            guard.record_success();
            updated.push(item);
        }

        Ok(updated)
    }

    /// Regenerate one image with random themes until it succeeds or the
    /// shared budget runs out. Every failed attempt, including the first
    /// pass, is charged.
    async fn regenerate(
        &self,
        guard: &TaskGuard,
        index: usize,
        themes: &[String],
        budget: &RetryBudget,
    ) -> OrchestratorResult<GeneratedImage> {
        loop {
            if let Err(failures) = budget.charge() {
                guard.record_failure();
                return Err(OrchestratorError::RetryBudgetExceeded {
                    task_id: guard.task_id().to_string(),
                    failures,
                    limit: budget.limit(),
                });
            }
            self.metrics.record_generation_retry();

            let prompt = themes
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or(OrchestratorError::PromptExpansion(PromptError::NoThemes))?;
            debug!(
                "Regenerating item {} ({} of {} retries used)",
                index,
                budget.used(),
                budget.limit()
            );

            let result = self
                .services
                .gate
                .generate(self.services.generator.as_ref(), index, &prompt)
                .await;

            match result {
                Ok(image) => return Ok(image),
                Err(e) => warn!("Regeneration for item {} failed: {}", index, e),
            }
        }
    }

    /// Preview of the design on the item's garment, or `None` on any miss.
    async fn build_thumbnail(&self, item: &BulkLineItem, image: &GeneratedImage) -> Option<String> {
        let organization = match self.find_organization(item).await {
            Ok(organization) => organization,
            Err(miss) => {
                self.metrics.record_lookup_miss();
                warn!("No thumbnail for {}: {}", image.image_id, miss);
                return None;
            }
        };

        let (product, variant) = match organization.resolve_variant(&item.apparel, &item.color) {
            Ok(found) => found,
            Err(miss) => {
                self.metrics.record_lookup_miss();
                warn!("No thumbnail for {}: {}", image.image_id, miss);
                return None;
            }
        };

        self.services
            .compositor
            .place_pattern(
                &ImageSource::Bytes(Arc::clone(&image.bytes)),
                &variant.asset.front,
                &product.dimensions,
            )
            .await
    }

    async fn find_organization(
        &self,
        item: &BulkLineItem,
    ) -> Result<Organization, LookupMiss> {
        let org_id = item
            .org_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(LookupMiss::NoOrganization)?;

        match self.services.organizations.get_organization(org_id).await {
            Ok(Some(organization)) => Ok(organization),
            Ok(None) => Err(LookupMiss::Organization(org_id.to_string())),
            Err(e) => {
                warn!("Organization lookup for {} failed: {}", org_id, e);
                Err(LookupMiss::Organization(org_id.to_string()))
            }
        }
    }

    /// Append to the item's order, or open a new one. Never retried.
    async fn persist(
        &self,
        item: &mut BulkLineItem,
        index: usize,
        thumbnail: String,
    ) -> OrchestratorResult<()> {
        let now = Utc::now();
        let order_item = OrderItem {
            apparel: item.apparel.clone(),
            size: item.size.clone(),
            color: item.color.clone(),
            img_id: item.img_id.clone().unwrap_or_default(),
            prompt: item.prompt.clone().unwrap_or_default(),
            timestamp: now,
            thumbnail,
            toggled: false,
            price: item.price,
        };

        let stored = match item.order_id.as_deref().filter(|id| !id.is_empty()) {
            Some(order_id) => self.services.orders.append_item(order_id, order_item).await,
            None => {
                let order = Order {
                    order_id: Uuid::new_v4().to_string(),
                    user_id: item.email.clone(),
                    user_type: item.user_type.clone(),
                    org_id: item.org_id.clone(),
                    status: OrderStatus::Pending,
                    timestamp: now,
                    shipping_info: item.shipping_info(),
                    items: vec![order_item],
                };
                let order_id = order.order_id.clone();
                let created = self.services.orders.create_order(order).await;
                if created.is_ok() {
                    item.order_id = Some(order_id);
                }
                created
            }
        };

        stored.map_err(|source| OrchestratorError::Persistence { index, source })
    }

    fn spawn_generated_upload(&self, image: &GeneratedImage) -> JoinHandle<()> {
        let storage = Arc::clone(&self.services.storage);
        let bucket = self.settings.generated_bucket.clone();
        let key = format!("{}.jpg", image.image_id);
        let bytes = Arc::clone(&image.bytes);
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let result = async {
                let jpeg = reencode_jpeg_async(bytes, JPEG_QUALITY).await?;
                storage.upload(jpeg, &key, &bucket, CONTENT_TYPE_JPEG).await?;
                Ok::<_, CompositorError>(())
            }
            .await;
            report_upload(&metrics, &bucket, &key, result);
        })
    }

    fn spawn_thumbnail_upload(&self, data_url: String, image_id: &str) -> JoinHandle<()> {
        let storage = Arc::clone(&self.services.storage);
        let bucket = self.settings.thumbnail_bucket.clone();
        let key = format!("t_{}.jpg", image_id);
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let result = async {
                let jpeg = tokio::task::spawn_blocking(move || -> CompositorResult<Vec<u8>> {
                    let png = decode_base64_padded(&data_url)?;
                    let img = image::load_from_memory(&png)?;
                    encode_jpeg_flattened(&img, JPEG_QUALITY)
                })
                .await??;
                storage.upload(jpeg, &key, &bucket, CONTENT_TYPE_JPEG).await?;
                Ok::<_, CompositorError>(())
            }
            .await;
            report_upload(&metrics, &bucket, &key, result);
        })
    }
}

fn report_upload(metrics: &Metrics, bucket: &str, key: &str, result: CompositorResult<()>) {
    metrics.record_upload(result.is_ok());
    match result {
        Ok(()) => debug!("Uploaded {}/{}", bucket, key),
        Err(e) => warn!("Upload of {}/{} failed: {}", bucket, key, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::DEFAULT_KEY_COLOR;
    use crate::core::errors::{GenerationError, StorageResult, StoreError};
    use crate::core::types::{Asset, ColorVariant, PlacementGeometry, Product};
    use crate::services::compositor::CompositorSettings;
    use crate::services::fetch::MockImageFetcher;
    use crate::services::generation::{MockImageGenerator, PassthroughExpander};
    use crate::services::storage::MemoryStorage;
    use crate::services::store::{MemoryStore, MockOrderStore};
    use crate::utils::image_ops::encode_png;
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const GENERATED: &str = "browse-image-v2";
    const THUMBNAILS: &str = "thumbnails-cart";

    fn png(color: [u8; 4], size: u32) -> Vec<u8> {
        encode_png(&DynamicImage::ImageRgba8(RgbaImage::from_pixel(size, size, Rgba(color))))
            .unwrap()
    }

    fn generated(index: usize, prompt: &str) -> GeneratedImage {
        GeneratedImage {
            index,
            image_id: format!("img-{}", index),
            prompt: prompt.to_string(),
            bytes: Arc::new(png([0, 0, 255, 255], 32)),
            model_tag: "mock".to_string(),
        }
    }

    fn line_item(org_id: Option<&str>) -> BulkLineItem {
        BulkLineItem {
            email: "buyer@example.com".to_string(),
            first_name: "Ada".to_string(),
            apparel: "tshirt".to_string(),
            size: "M".to_string(),
            color: "black".to_string(),
            org_id: org_id.map(str::to_string),
            ..Default::default()
        }
    }

    fn organization() -> Organization {
        let mut colors = BTreeMap::new();
        colors.insert(
            "black".to_string(),
            ColorVariant {
                name: "black".to_string(),
                asset: Asset {
                    front: STANDARD.encode(png([0, 0, 0, 0], 64)),
                    back: String::new(),
                },
                color_map: "#000000".to_string(),
            },
        );
        Organization {
            org_id: "org-1".to_string(),
            name: Some("Campus Store".to_string()),
            products: vec![Product {
                name: "tshirt".to_string(),
                default_color: Some("black".to_string()),
                sizes: vec!["M".to_string()],
                mask: None,
                colors,
                dimensions: PlacementGeometry {
                    left: 25.0,
                    top: 25.0,
                    width: 50.0,
                    height: 50.0,
                },
            }],
        }
    }

    /// Memory storage whose uploads land only after `delay`
    struct DelayedStorage {
        inner: Arc<MemoryStorage>,
        delay: Duration,
    }

    #[async_trait]
    impl ObjectStorage for DelayedStorage {
        async fn upload(
            &self,
            bytes: Vec<u8>,
            key: &str,
            bucket: &str,
            content_type: &str,
        ) -> StorageResult<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.upload(bytes, key, bucket, content_type).await
        }

        async fn presigned_url(
            &self,
            key: &str,
            bucket: &str,
            ttl: Duration,
        ) -> StorageResult<String> {
            self.inner.presigned_url(key, bucket, ttl).await
        }
    }

    struct Harness {
        orchestrator: BulkOrchestrator,
        storage: Arc<MemoryStorage>,
        store: MemoryStore,
        _scratch: tempfile::TempDir,
    }

    fn harness(generator: MockImageGenerator, orders: Option<Arc<dyn OrderStore>>) -> Harness {
        harness_with_upload_delay(generator, orders, Duration::ZERO)
    }

    fn harness_with_upload_delay(
        generator: MockImageGenerator,
        orders: Option<Arc<dyn OrderStore>>,
        upload_delay: Duration,
    ) -> Harness {
        let scratch = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let store = MemoryStore::new();
        store.insert_organization(organization());
        let metrics = Metrics::new();

        let compositor = Arc::new(Compositor::new(
            CompositorSettings {
                key_color: DEFAULT_KEY_COLOR,
                canonical_size: 64,
                cart_dpi: 400,
                batch_dpi: 200,
                scratch_dir: scratch.path().to_path_buf(),
                masked_bucket: "masked-images".to_string(),
                presign_ttl: Duration::from_secs(3600),
            },
            Arc::new(MockImageFetcher::new()),
            storage.clone(),
            metrics.clone(),
        ));

        let uploads: Arc<dyn ObjectStorage> = if upload_delay.is_zero() {
            storage.clone()
        } else {
            Arc::new(DelayedStorage {
                inner: storage.clone(),
                delay: upload_delay,
            })
        };

        let services = BulkCollaborators {
            generator: Arc::new(generator),
            expander: Arc::new(PassthroughExpander),
            gate: GenerationGate::new(100, metrics.clone()),
            compositor,
            storage: uploads,
            orders: orders.unwrap_or_else(|| Arc::new(store.clone())),
            organizations: Arc::new(store.clone()),
        };
        let settings = OrchestratorSettings {
            retry_floor: 10,
            generated_bucket: GENERATED.to_string(),
            thumbnail_bucket: THUMBNAILS.to_string(),
        };

        Harness {
            orchestrator: BulkOrchestrator::new(services, TaskRegistry::new(), settings, metrics),
            storage,
            store,
            _scratch: scratch,
        }
    }

    fn themes() -> Vec<String> {
        vec!["a paper crane".to_string()]
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_aborts_and_cleans_up() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut generator = MockImageGenerator::new();
        generator.expect_generate().returning(move |index, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(GenerationError::Simulated { index })
        });

        let h = harness(generator, None);
        let items = vec![line_item(None); 4];
        let result = h.orchestrator.run_bulk_batch(items, themes(), "task-retry").await;

        match result {
            Err(OrchestratorError::RetryBudgetExceeded {
                task_id,
                failures,
                limit,
            }) => {
                assert_eq!(task_id, "task-retry");
                assert_eq!(failures, 11);
                assert_eq!(limit, 10);
            }
            other => panic!("expected retry budget error, got {:?}", other.map(|r| r.items.len())),
        }
        // four first-pass calls plus ten regenerations
        assert_eq!(calls.load(Ordering::SeqCst), 14);
        assert!(h.orchestrator.get_progress("task-retry").is_none());
        assert_eq!(h.store.order_count(), 0);
    }

    #[tokio::test]
    async fn test_two_item_batch_end_to_end() {
        let mut generator = MockImageGenerator::new();
        generator
            .expect_generate()
            .times(2)
            .returning(|index, prompt| Ok(generated(index, prompt)));

        let h = harness(generator, None);
        let items = vec![line_item(Some("org-1")), line_item(Some("org-missing"))];
        let report = h
            .orchestrator
            .run_bulk_batch(items, themes(), "task-e2e")
            .await
            .unwrap();

        assert_eq!(report.progress.success, 2);
        assert_eq!(report.progress.failed, 0);
        assert_eq!(report.progress.progress, 100);
        assert!(h.orchestrator.get_progress("task-e2e").is_none());

        let first = &report.items[0];
        assert!(first
            .thumbnail
            .as_deref()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert_eq!(report.items[1].thumbnail.as_deref(), Some(THUMBNAIL_NONE));

        assert_eq!(h.store.order_count(), 2);
        let order = h
            .store
            .get_order(first.order_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.items[0].thumbnail, "t_img-0");
        let second = h
            .store
            .get_order(report.items[1].order_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(second.items[0].thumbnail, THUMBNAIL_NONE);

        // uploads are awaited before the batch returns
        assert_eq!(h.storage.keys(GENERATED), vec!["img-0.jpg", "img-1.jpg"]);
        assert_eq!(h.storage.keys(THUMBNAILS), vec!["t_img-0.jpg"]);
    }

    #[tokio::test]
    async fn test_failed_items_recover_within_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut generator = MockImageGenerator::new();
        generator.expect_generate().returning(move |index, prompt| {
            // first three calls fail, everything after succeeds
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(GenerationError::Request("throttled".to_string()))
            } else {
                Ok(generated(index, prompt))
            }
        });

        let h = harness(generator, None);
        let report = h
            .orchestrator
            .run_bulk_batch(vec![line_item(None); 2], themes(), "task-recover")
            .await
            .unwrap();

        assert_eq!(report.progress.success, 2);
        assert!(report.items.iter().all(|i| i.img_id.is_some()));
        assert_eq!(h.store.order_count(), 2);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_fatal() {
        let mut generator = MockImageGenerator::new();
        generator
            .expect_generate()
            .returning(|index, prompt| Ok(generated(index, prompt)));

        let mut orders = MockOrderStore::new();
        orders
            .expect_create_order()
            .times(1)
            .returning(|_| Err(StoreError::Backend("connection reset".to_string())));

        let h = harness(generator, Some(Arc::new(orders)));
        let result = h
            .orchestrator
            .run_bulk_batch(vec![line_item(None); 3], themes(), "task-persist")
            .await;

        assert!(matches!(
            result,
            Err(OrchestratorError::Persistence { index: 0, .. })
        ));
        assert!(h.orchestrator.get_progress("task-persist").is_none());
    }

    #[tokio::test]
    async fn test_aborted_batch_cancels_pending_uploads() {
        let mut generator = MockImageGenerator::new();
        generator
            .expect_generate()
            .returning(|index, prompt| Ok(generated(index, prompt)));

        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let mut orders = MockOrderStore::new();
        orders.expect_create_order().returning(move |_| {
            // the first item persists, the second hits a dead backend
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(())
            } else {
                Err(StoreError::Backend("connection reset".to_string()))
            }
        });

        let h = harness_with_upload_delay(
            generator,
            Some(Arc::new(orders)),
            Duration::from_millis(300),
        );
        let result = h
            .orchestrator
            .run_bulk_batch(vec![line_item(None); 2], themes(), "task-cancel")
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::Persistence { index: 1, .. })
        ));

        // item 0's upload was in flight when the batch aborted
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(h.storage.is_empty());
        assert_eq!(h.orchestrator.metrics.snapshot().uploads_ok, 0);
    }

    #[tokio::test]
    async fn test_generation_latency_is_recorded_per_call() {
        let mut generator = MockImageGenerator::new();
        generator
            .expect_generate()
            .returning(|index, prompt| Ok(generated(index, prompt)));

        let h = harness(generator, None);
        h.orchestrator
            .run_bulk_batch(vec![line_item(None); 3], themes(), "task-latency")
            .await
            .unwrap();

        let snapshot = h.orchestrator.metrics.snapshot();
        assert_eq!(snapshot.generation_calls_total, 3);
        assert_eq!(snapshot.generation_retries, 0);
        assert_eq!(snapshot.batches_completed, 1);
    }

    #[tokio::test]
    async fn test_existing_order_is_appended() {
        let mut generator = MockImageGenerator::new();
        generator
            .expect_generate()
            .returning(|index, prompt| Ok(generated(index, prompt)));

        let mut orders = MockOrderStore::new();
        orders.expect_create_order().never();
        orders
            .expect_append_item()
            .withf(|order_id, item| order_id.to_string() == "order-7" && item.img_id == "img-0")
            .times(1)
            .returning(|_, _| Ok(()));

        let h = harness(generator, Some(Arc::new(orders)));
        let mut item = line_item(None);
        item.order_id = Some("order-7".to_string());

        let report = h
            .orchestrator
            .run_bulk_batch(vec![item], themes(), "task-append")
            .await
            .unwrap();
        assert_eq!(report.items[0].order_id.as_deref(), Some("order-7"));
    }

    #[tokio::test]
    async fn test_duplicate_task_id_is_rejected_while_running() {
        let h = harness(MockImageGenerator::new(), None);
        let _guard = h.orchestrator.registry().begin("task-dup", 1).unwrap();

        let result = h
            .orchestrator
            .run_bulk_batch(vec![line_item(None)], themes(), "task-dup")
            .await;
        assert!(matches!(result, Err(OrchestratorError::DuplicateTask(_))));
        // the running batch keeps its entry
        assert!(h.orchestrator.get_progress("task-dup").is_some());
    }

    #[tokio::test]
    async fn test_empty_inputs_are_rejected() {
        let h = harness(MockImageGenerator::new(), None);
        assert!(matches!(
            h.orchestrator.run_bulk_batch(vec![], themes(), "t").await,
            Err(OrchestratorError::EmptyBatch)
        ));
        assert!(matches!(
            h.orchestrator
                .run_bulk_batch(vec![line_item(None)], vec![], "t")
                .await,
            Err(OrchestratorError::PromptExpansion(PromptError::NoThemes))
        ));
    }
}
