use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;

use super::PriceLookup;
use crate::error::LookupError;

/// eBay Browse API keyword search over US listings.
pub struct EbayPriceLookup {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    zip: String,
}

impl EbayPriceLookup {
    pub fn new(endpoint: &str, token: &str, zip: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            token: token.to_string(),
            zip: zip.to_string(),
        })
    }
}

#[async_trait]
impl PriceLookup for EbayPriceLookup {
    async fn price_query(&self, query: &str) -> Result<Vec<Decimal>, LookupError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .bearer_auth(&self.token)
            .header(
                "X-EBAY-C-ENDUSERCTX",
                format!("contextualLocation=country=US,zip={}", self.zip),
            )
            .query(&[
                ("q", query),
                ("sort", "price"),
                ("filter", "itemLocationCountry:US"),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(LookupError::from_status(status));
        }
        let body = resp.text().await?;
        parse_prices(&body)
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(rename = "itemSummaries", default)]
    item_summaries: Vec<ItemSummary>,
}

#[derive(Deserialize)]
struct ItemSummary {
    price: Option<Price>,
}

#[derive(Deserialize)]
struct Price {
    value: PriceValue,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PriceValue {
    Number(serde_json::Number),
    Text(String),
}

impl PriceValue {
    fn to_decimal(&self) -> Result<Decimal, LookupError> {
        let raw = match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.trim().to_string(),
        };
        raw.parse::<Decimal>()
            .or_else(|_| Decimal::from_scientific(&raw))
            .map_err(|_| LookupError::Permanent(format!("malformed price value '{}'", raw)))
    }
}

/// Listing prices from a search response. No listings is an empty set.
pub fn parse_prices(body: &str) -> Result<Vec<Decimal>, LookupError> {
    let parsed: SearchResponse = serde_json::from_str(body)
        .map_err(|e| LookupError::Permanent(format!("malformed price response: {}", e)))?;

    parsed
        .item_summaries
        .into_iter()
        .filter_map(|item| item.price)
        .map(|p| p.value.to_decimal())
        .collect()
}

/// Arithmetic mean rounded to cents, halves away from zero; `None` for no prices.
pub fn mean_price(prices: &[Decimal]) -> Option<Decimal> {
    if prices.is_empty() {
        return None;
    }
    let sum: Decimal = prices.iter().sum();
    let mean = sum / Decimal::from(prices.len());
    Some(mean.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}
