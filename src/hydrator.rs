//! Product references embedded in assistant and staff text, and their
//! lazy resolution to live catalog data.
//!
//! Scanning is best-effort: anything that does not parse yields no
//! references. Hydration never blocks rendering; a reference without a
//! cache entry renders as [`ProductState::Pending`] and upgrades in place.

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use tokio::{sync::OnceCell, task::JoinHandle};

use crate::catalog::{
    best_promotion, AppliedPromotion, Catalog, HttpCatalog, HttpPromotions, PromotionScope,
    Promotions,
};
use crate::config::Config;
use crate::types::{ChatMessage, ProductSnapshot, Sender};

#[derive(Debug, Clone, PartialEq)]
pub struct ProductRef {
    pub name: String,
    pub slug: String,
    pub image: Option<String>,
    pub price: Option<f64>,
    pub rating: Option<f64>,
}

const STRUCTURED_BLOCK_PATTERNS: [&str; 2] = [
    r"(?s)```(?:json|products)\s*(.*?)```",
    r"(?s)\[PRODUCTS\](.*?)\[/PRODUCTS\]",
];

pub fn scan(text: &str) -> Vec<ProductRef> {
    let structured = scan_structured(text);
    let refs = if structured.is_empty() {
        scan_inline_links(text)
    } else {
        structured
    };
    dedupe_by_slug(refs)
}

/// Display text with the structured product block removed.
pub fn strip_product_blocks(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in STRUCTURED_BLOCK_PATTERNS {
        if let Ok(re) = Regex::new(pattern) {
            out = re.replace_all(&out, "").into_owned();
        }
    }
    out.trim().to_string()
}

fn scan_structured(text: &str) -> Vec<ProductRef> {
    let mut refs = Vec::new();
    for pattern in STRUCTURED_BLOCK_PATTERNS {
        let Ok(re) = Regex::new(pattern) else {
            continue;
        };
        for capture in re.captures_iter(text) {
            let Some(body) = capture.get(1) else {
                continue;
            };
            let Ok(parsed) = serde_json::from_str::<Value>(body.as_str().trim()) else {
                continue;
            };
            let items = match &parsed {
                Value::Array(items) => items.as_slice(),
                Value::Object(map) => match map.get("products") {
                    Some(Value::Array(items)) => items.as_slice(),
                    _ => continue,
                },
                _ => continue,
            };
            refs.extend(items.iter().filter_map(product_ref_from_json));
        }
    }
    refs
}

fn product_ref_from_json(item: &Value) -> Option<ProductRef> {
    let text_field = |key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let number_field = |key: &str| match item.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let slug = text_field("slug").or_else(|| text_field("url").and_then(|u| slug_from_url(&u)))?;
    Some(ProductRef {
        name: text_field("name").unwrap_or_else(|| slug.clone()),
        slug,
        image: text_field("image"),
        price: number_field("price"),
        rating: number_field("rating"),
    })
}

fn slug_from_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/product/")?;
    let slug = rest
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or("")
        .trim();
    (!slug.is_empty()).then(|| slug.to_string())
}

fn scan_inline_links(text: &str) -> Vec<ProductRef> {
    let Ok(re) = Regex::new(r"\[([^\]]+)\]\(\s*([^)\s]*/product/[^)\s]+)\s*\)") else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|capture| {
            let name = capture.get(1)?.as_str().trim().to_string();
            let slug = slug_from_url(capture.get(2)?.as_str())?;
            Some(ProductRef {
                name,
                slug,
                image: None,
                price: None,
                rating: None,
            })
        })
        .collect()
}

fn dedupe_by_slug(refs: Vec<ProductRef>) -> Vec<ProductRef> {
    let mut seen = std::collections::HashSet::new();
    refs.into_iter()
        .filter(|r| seen.insert(r.slug.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct HydratedProduct {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub image: Option<String>,
    pub rating: Option<f64>,
    pub base_price: f64,
    pub promotion: Option<AppliedPromotion>,
}

impl HydratedProduct {
    pub fn final_price(&self) -> f64 {
        self.promotion
            .as_ref()
            .map(|p| p.final_price)
            .unwrap_or(self.base_price)
    }

    /// The card a staff member attaches to a reply.
    pub fn snapshot(&self) -> ProductSnapshot {
        ProductSnapshot {
            id: Some(self.id.clone()),
            slug: self.slug.clone(),
            name: self.name.clone(),
            image: self.image.clone(),
            price: self.final_price(),
            original_price: self.promotion.as_ref().map(|_| self.base_price),
            discount_percent: self.promotion.as_ref().map(|p| p.discount_percent),
            promotion_code: self.promotion.as_ref().map(|p| p.code.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Hydration {
    Ready(HydratedProduct),
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProductState {
    Pending,
    Ready(HydratedProduct),
    Unavailable,
}

/// Slugs a bot or staff message points at: scanned references plus the
/// attached product card. Customer text is never hydrated.
pub fn referenced_slugs(message: &ChatMessage) -> Vec<String> {
    let card = match &message.sender {
        Sender::User => return Vec::new(),
        Sender::Bot => None,
        Sender::Staff { product_data, .. } => product_data.as_ref().map(|p| p.slug.clone()),
    };
    let mut slugs = scan(&message.text)
        .into_iter()
        .map(|r| r.slug)
        .collect::<Vec<_>>();
    if let Some(slug) = card.filter(|slug| !slugs.contains(slug)) {
        slugs.push(slug);
    }
    slugs
}

/// Per-viewer cache. Each slug is fetched at most once, however many
/// messages reference it or how many callers race for it.
pub struct ProductHydrator {
    catalog: Arc<dyn Catalog>,
    promotions: Arc<dyn Promotions>,
    cells: DashMap<String, Arc<OnceCell<Hydration>>>,
}

impl ProductHydrator {
    pub fn new(catalog: Arc<dyn Catalog>, promotions: Arc<dyn Promotions>) -> Self {
        Self {
            catalog,
            promotions,
            cells: DashMap::new(),
        }
    }

    /// HTTP-backed hydrator, or `None` when no catalog is configured.
    pub fn from_config(client: reqwest::Client, config: &Config) -> Option<Self> {
        let catalog_url = config.catalog_api_url.as_deref()?;
        let promotions_url = config.promotions_api_url.as_deref().unwrap_or(catalog_url);
        Some(Self::new(
            Arc::new(HttpCatalog::new(client.clone(), catalog_url)),
            Arc::new(HttpPromotions::new(client, promotions_url)),
        ))
    }

    pub async fn hydrate(&self, slug: &str) -> Hydration {
        let cell = self.cells.entry(slug.to_string()).or_default().clone();
        cell.get_or_init(|| self.fetch(slug)).await.clone()
    }

    pub fn state(&self, slug: &str) -> ProductState {
        let cached = self.cells.get(slug).and_then(|cell| cell.get().cloned());
        match cached {
            None => ProductState::Pending,
            Some(Hydration::Ready(product)) => ProductState::Ready(product),
            Some(Hydration::Unavailable) => ProductState::Unavailable,
        }
    }

    /// Starts hydration for every slug in the background.
    pub fn spawn_hydrate(
        self: &Arc<Self>,
        slugs: impl IntoIterator<Item = String>,
    ) -> Vec<JoinHandle<Hydration>> {
        slugs
            .into_iter()
            .map(|slug| {
                let hydrator = Arc::clone(self);
                tokio::spawn(async move { hydrator.hydrate(&slug).await })
            })
            .collect()
    }

    /// Drives the muted "some items unavailable" notice.
    pub fn unavailable_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|entry| matches!(entry.value().get(), Some(Hydration::Unavailable)))
            .count()
    }

    async fn fetch(&self, slug: &str) -> Hydration {
        let product = match self.catalog.product_by_slug(slug).await {
            Ok(Some(product)) => product,
            Ok(None) => {
                tracing::debug!(slug, "product not found");
                return Hydration::Unavailable;
            }
            Err(err) => {
                tracing::warn!(slug, error = %err, "product lookup failed");
                return Hydration::Unavailable;
            }
        };

        let scope = PromotionScope {
            product_ids: vec![product.id.clone()],
            category_ids: product.category_ids.clone(),
        };
        let promotion = match self.promotions.eligible(product.price, &scope).await {
            Ok(promotions) => best_promotion(product.price, &promotions),
            Err(err) => {
                tracing::warn!(slug, error = %err, "promotion lookup failed");
                None
            }
        };

        Hydration::Ready(HydratedProduct {
            id: product.id,
            slug: product.slug,
            name: product.name,
            image: product.image,
            rating: product.rating,
            base_price: product.price,
            promotion,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::catalog::{CatalogError, ProductDetail, Promotion, PromotionKind};

    #[test]
    fn structured_block_wins_over_inline_links() {
        let text = "Try these:\n```json\n{\"products\": [{\"name\": \"Áo thun\", \"slug\": \"ao-thun\", \"price\": \"199000\", \"rating\": 4.5}]}\n```\nor [Quần](/product/quan-jean)";
        let refs = scan(text);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].slug, "ao-thun");
        assert_eq!(refs[0].price, Some(199000.0));
        assert_eq!(refs[0].rating, Some(4.5));
    }

    #[test]
    fn bracket_block_accepts_bare_array() {
        let text = "[PRODUCTS][{\"name\":\"Mũ\",\"url\":\"https://shop.vn/product/mu-len?ref=bot\"}][/PRODUCTS]";
        let refs = scan(text);
        assert_eq!(refs[0].slug, "mu-len");
        assert_eq!(refs[0].name, "Mũ");
    }

    #[test]
    fn inline_links_are_deduped_by_slug() {
        let text = "See [Giày A](https://shop.vn/product/giay-a) and [Giày A again](/product/giay-a/) or [Blog](https://shop.vn/blog/x)";
        let refs = scan(text);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "Giày A");
    }

    #[test]
    fn malformed_input_yields_nothing() {
        assert!(scan("```json\n{not json\n```").is_empty());
        assert!(scan("[PRODUCTS]{\"products\": 3}[/PRODUCTS]").is_empty());
        assert!(scan("").is_empty());
    }

    #[test]
    fn strip_removes_only_the_block() {
        let text = "Here you go!\n[PRODUCTS][{\"slug\":\"a\"}][/PRODUCTS]";
        assert_eq!(strip_product_blocks(text), "Here you go!");
    }

    #[test]
    fn only_bot_and_staff_messages_reference_products() {
        let message = |sender: Sender| ChatMessage {
            id: "m1".to_string(),
            session_id: "s1".to_string(),
            sender,
            text: "[Áo](/product/ao)".to_string(),
            attachment: None,
            client_message_id: None,
            created_at: chrono::Utc::now(),
        };
        assert!(referenced_slugs(&message(Sender::User)).is_empty());
        assert_eq!(referenced_slugs(&message(Sender::Bot)), vec!["ao"]);

        let card = ProductSnapshot {
            id: None,
            slug: "mu".to_string(),
            name: "Mũ".to_string(),
            image: None,
            price: 50_000.0,
            original_price: None,
            discount_percent: None,
            promotion_code: None,
        };
        let staff = message(Sender::Staff {
            staff_id: "a".to_string(),
            staff_name: "Lan".to_string(),
            product_data: Some(card),
        });
        assert_eq!(referenced_slugs(&staff), vec!["ao", "mu"]);
    }

    #[test]
    fn from_config_needs_a_catalog_url() {
        let client = reqwest::Client::new();
        assert!(ProductHydrator::from_config(client.clone(), &Config::default()).is_none());
        let config = Config {
            catalog_api_url: Some("http://127.0.0.1:9".to_string()),
            ..Config::default()
        };
        assert!(ProductHydrator::from_config(client, &config).is_some());
    }

    struct CountingCatalog {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl Catalog for CountingCatalog {
        async fn product_by_slug(&self, slug: &str) -> Result<Option<ProductDetail>, CatalogError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            match slug {
                "gone" => Ok(None),
                "broken" => Err(CatalogError::Transport("connection refused".to_string())),
                _ => Ok(Some(ProductDetail {
                    id: format!("id-{slug}"),
                    slug: slug.to_string(),
                    name: slug.to_uppercase(),
                    image: None,
                    price: 100_000.0,
                    rating: Some(5.0),
                    category_ids: vec!["shirts".to_string()],
                })),
            }
        }
    }

    struct FixedPromotions;

    #[async_trait]
    impl Promotions for FixedPromotions {
        async fn eligible(
            &self,
            _base_price: f64,
            scope: &PromotionScope,
        ) -> Result<Vec<Promotion>, CatalogError> {
            assert_eq!(scope.category_ids, vec!["shirts".to_string()]);
            Ok(vec![Promotion {
                id: "p1".to_string(),
                code: "SALE20".to_string(),
                kind: PromotionKind::Percent,
                value: 20.0,
                max_discount: None,
            }])
        }
    }

    fn hydrator() -> (Arc<ProductHydrator>, Arc<CountingCatalog>) {
        let catalog = Arc::new(CountingCatalog {
            fetches: AtomicUsize::new(0),
        });
        (
            Arc::new(ProductHydrator::new(catalog.clone(), Arc::new(FixedPromotions))),
            catalog,
        )
    }

    #[tokio::test]
    async fn concurrent_references_share_one_fetch() {
        let (hydrator, catalog) = hydrator();
        let handles = hydrator.spawn_hydrate(std::iter::repeat("ao".to_string()).take(5));
        assert_eq!(hydrator.state("ao"), ProductState::Pending);
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Hydration::Ready(_)));
        }
        assert_eq!(catalog.fetches.load(Ordering::SeqCst), 1);

        let ProductState::Ready(product) = hydrator.state("ao") else {
            panic!("expected ready state");
        };
        assert_eq!(product.final_price(), 80_000.0);
        let snapshot = product.snapshot();
        assert_eq!(snapshot.original_price, Some(100_000.0));
        assert_eq!(snapshot.discount_percent, Some(20));
        assert_eq!(snapshot.promotion_code.as_deref(), Some("SALE20"));
    }

    #[tokio::test]
    async fn missing_products_are_negatively_cached() {
        let (hydrator, catalog) = hydrator();
        assert_eq!(hydrator.hydrate("gone").await, Hydration::Unavailable);
        assert_eq!(hydrator.hydrate("gone").await, Hydration::Unavailable);
        assert_eq!(hydrator.hydrate("broken").await, Hydration::Unavailable);
        assert_eq!(catalog.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(hydrator.unavailable_count(), 2);
        assert_eq!(hydrator.state("gone"), ProductState::Unavailable);
    }
}
