//! Document store collaborators for orders and organizations

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::errors::{StoreError, StoreResult};
use crate::core::types::{Order, OrderItem, Organization};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn create_order(&self, order: Order) -> StoreResult<()>;

    /// Append an item to an existing order
    async fn append_item(&self, order_id: &str, item: OrderItem) -> StoreResult<()>;

    async fn get_order(&self, order_id: &str) -> StoreResult<Order>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrganizationStore: Send + Sync {
    /// `Ok(None)` when no organization has this id
    async fn get_organization(&self, org_id: &str) -> StoreResult<Option<Organization>>;

    /// Insert or replace the organization keyed by its `org_id`
    async fn upsert_organization(&self, organization: Organization) -> StoreResult<()>;
}

/// DashMap-backed document store used when no database is configured
#[derive(Default, Clone)]
pub struct MemoryStore {
    orders: Arc<DashMap<String, Order>>,
    organizations: Arc<DashMap<String, Organization>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_organization(&self, organization: Organization) {
        self.organizations
            .insert(organization.org_id.clone(), organization);
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn organization_count(&self) -> usize {
        self.organizations.len()
    }

    /// Insert every organization of a JSON array, replacing existing ids.
    /// Returns how many were loaded.
    pub fn seed_organizations(&self, json: &str) -> StoreResult<usize> {
        let organizations: Vec<Organization> = serde_json::from_str(json)?;
        let count = organizations.len();
        for organization in organizations {
            self.insert_organization(organization);
        }
        Ok(count)
    }

    /// Load a seed file written as a JSON array of organizations.
    pub async fn load_organizations(&self, path: &Path) -> StoreResult<usize> {
        let json = tokio::fs::read_to_string(path).await?;
        let count = self.seed_organizations(&json)?;
        info!("Loaded {} organizations from {}", count, path.display());
        Ok(count)
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn create_order(&self, order: Order) -> StoreResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.orders.entry(order.order_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict {
                kind: "order",
                id: order.order_id,
            }),
            Entry::Vacant(slot) => {
                debug!("Created order {}", order.order_id);
                slot.insert(order);
                Ok(())
            }
        }
    }

    async fn append_item(&self, order_id: &str, item: OrderItem) -> StoreResult<()> {
        let mut order = self.orders.get_mut(order_id).ok_or_else(|| StoreError::NotFound {
            kind: "order",
            id: order_id.to_string(),
        })?;
        order.items.push(item);
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> StoreResult<Order> {
        self.orders
            .get(order_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                kind: "order",
                id: order_id.to_string(),
            })
    }
}

#[async_trait]
impl OrganizationStore for MemoryStore {
    async fn get_organization(&self, org_id: &str) -> StoreResult<Option<Organization>> {
        Ok(self
            .organizations
            .get(org_id)
            .map(|entry| entry.value().clone()))
    }

    async fn upsert_organization(&self, organization: Organization) -> StoreResult<()> {
        debug!("Upserted organization {}", organization.org_id);
        self.insert_organization(organization);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{OrderStatus, ShippingInfo};
    use chrono::Utc;

    fn order(id: &str) -> Order {
        Order {
            order_id: id.to_string(),
            user_id: "buyer@example.com".to_string(),
            user_type: "student".to_string(),
            org_id: None,
            status: OrderStatus::Pending,
            timestamp: Utc::now(),
            shipping_info: ShippingInfo {
                first_name: "Ada".to_string(),
                last_name: "L".to_string(),
                email: "buyer@example.com".to_string(),
                phone: String::new(),
                street_address: "1 Main St".to_string(),
                street_address2: String::new(),
                city: "Springfield".to_string(),
                state_province: "IL".to_string(),
                postal_zipcode: "62701".to_string(),
                address_type: "primary".to_string(),
            },
            items: vec![],
        }
    }

    fn item(img_id: &str) -> OrderItem {
        OrderItem {
            apparel: "tshirt".to_string(),
            size: "M".to_string(),
            color: "black".to_string(),
            img_id: img_id.to_string(),
            prompt: "a fox".to_string(),
            timestamp: Utc::now(),
            thumbnail: "null".to_string(),
            toggled: false,
            price: None,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let store = MemoryStore::new();
        store.create_order(order("o-1")).await.unwrap();
        assert!(matches!(
            store.create_order(order("o-1")).await,
            Err(StoreError::Conflict { .. })
        ));
        assert_eq!(store.order_count(), 1);
    }

    #[tokio::test]
    async fn test_append_item() {
        let store = MemoryStore::new();
        store.create_order(order("o-2")).await.unwrap();
        store.append_item("o-2", item("img-1")).await.unwrap();
        assert_eq!(store.get_order("o-2").await.unwrap().items.len(), 1);

        assert!(matches!(
            store.append_item("missing", item("img-2")).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    const SEED: &str = r#"[
        {
            "org_id": "org-1",
            "name": "Riverside High",
            "products": [{
                "name": "hoodie",
                "colors": {
                    "grey": {"name": "grey", "asset": {"front": "AAAA", "back": "AAAA"}}
                },
                "dimensions": {"left": 25.0, "top": 20.0, "width": 40.0, "height": 40.0}
            }]
        },
        {"org_id": "org-2"}
    ]"#;

    #[tokio::test]
    async fn test_seed_file_populates_organizations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("organizations.json");
        std::fs::write(&path, SEED).unwrap();

        let store = MemoryStore::new();
        assert_eq!(store.load_organizations(&path).await.unwrap(), 2);
        assert_eq!(store.organization_count(), 2);

        let org = store.get_organization("org-1").await.unwrap().unwrap();
        assert_eq!(org.products[0].dimensions.width, 40.0);
        assert!(org.resolve_variant("hoodie", "grey").is_ok());
    }

    #[tokio::test]
    async fn test_bad_seed_is_reported() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.seed_organizations("{\"org_id\": 1}"),
            Err(StoreError::SeedFormat(_))
        ));
        assert!(matches!(
            store
                .load_organizations(Path::new("/nonexistent/organizations.json"))
                .await,
            Err(StoreError::SeedIo(_))
        ));
        assert_eq!(store.organization_count(), 0);
    }

    #[tokio::test]
    async fn test_upsert_replaces_organization() {
        let store = MemoryStore::new();
        store.seed_organizations(SEED).unwrap();

        let mut renamed = store.get_organization("org-2").await.unwrap().unwrap();
        renamed.name = Some("Lakeside".to_string());
        store.upsert_organization(renamed).await.unwrap();

        let org = store.get_organization("org-2").await.unwrap().unwrap();
        assert_eq!(org.name.as_deref(), Some("Lakeside"));
        assert_eq!(store.organization_count(), 2);
    }
}
