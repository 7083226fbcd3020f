//! Catalog and promotion collaborators, plus the rule that picks the best
//! promotion for a product.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Transport(String),

    #[error("catalog returned status {0}")]
    Status(u16),

    #[error("catalog payload could not be decoded: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for CatalogError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CatalogError::Decode(err.to_string())
        } else {
            CatalogError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDetail {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    pub price: f64,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub category_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionKind {
    Percent,
    Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    pub id: String,
    pub code: String,
    #[serde(rename = "type")]
    pub kind: PromotionKind,
    pub value: f64,
    /// Ceiling for percent promotions.
    #[serde(default)]
    pub max_discount: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionScope {
    pub product_ids: Vec<String>,
    pub category_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedPromotion {
    pub code: String,
    pub discount_amount: f64,
    pub discount_percent: u32,
    pub final_price: f64,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn product_by_slug(&self, slug: &str) -> Result<Option<ProductDetail>, CatalogError>;
}

#[async_trait]
pub trait Promotions: Send + Sync {
    async fn eligible(
        &self,
        base_price: f64,
        scope: &PromotionScope,
    ) -> Result<Vec<Promotion>, CatalogError>;
}

impl Promotion {
    fn discount_for(&self, base_price: f64) -> f64 {
        let raw = match self.kind {
            PromotionKind::Percent => {
                let amount = base_price * self.value / 100.0;
                match self.max_discount {
                    Some(cap) if cap > 0.0 => amount.min(cap),
                    _ => amount,
                }
            }
            PromotionKind::Amount => self.value,
        };
        raw.clamp(0.0, base_price.max(0.0))
    }
}

/// Largest absolute discount wins; on a tie the earlier promotion is kept.
pub fn best_promotion(base_price: f64, promotions: &[Promotion]) -> Option<AppliedPromotion> {
    if base_price <= 0.0 {
        return None;
    }
    let mut best: Option<(&Promotion, f64)> = None;
    for promotion in promotions {
        let discount = promotion.discount_for(base_price);
        if discount <= 0.0 {
            continue;
        }
        if best.map_or(true, |(_, current)| discount > current) {
            best = Some((promotion, discount));
        }
    }
    let (promotion, discount_amount) = best?;
    let discount_percent = match promotion.kind {
        PromotionKind::Percent => promotion.value.round().max(0.0) as u32,
        PromotionKind::Amount => (discount_amount / base_price * 100.0).round() as u32,
    };
    Some(AppliedPromotion {
        code: promotion.code.clone(),
        discount_amount,
        discount_percent,
        final_price: base_price - discount_amount,
    })
}

pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn product_by_slug(&self, slug: &str) -> Result<Option<ProductDetail>, CatalogError> {
        let response = self
            .client
            .get(format!("{}/products/slug/{slug}", self.base_url))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<ProductDetail>().await?)),
            status => Err(CatalogError::Status(status.as_u16())),
        }
    }
}

pub struct HttpPromotions {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPromotions {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Promotions for HttpPromotions {
    async fn eligible(
        &self,
        base_price: f64,
        scope: &PromotionScope,
    ) -> Result<Vec<Promotion>, CatalogError> {
        let response = self
            .client
            .post(format!("{}/promotions/eligible", self.base_url))
            .json(&json!({
                "basePrice": base_price,
                "productIds": scope.product_ids,
                "categoryIds": scope.category_ids,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status().as_u16()));
        }
        Ok(response.json::<Vec<Promotion>>().await?)
    }
}
