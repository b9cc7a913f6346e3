//! Archive catalog access.
//!
//! The [`Catalog`] trait is the seam between the search executor and the
//! imagery archive. [`StacCatalog`] talks to a STAC API: it posts
//! `/search` requests, follows `next` links until the result set is
//! exhausted, and retries rate-limited or failed requests with exponential
//! backoff.
//!
//! Retry strategy:
//! - HTTP 429 or 5xx → retry with exponential backoff
//! - HTTP 4xx (not 429) → fail immediately
//! - Network error → retry

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::CatalogConfig;
use crate::models::{AreaOfInterest, DateChunk, RawItem};

/// Environment variable holding the archive API key id.
pub const KEY_ID_ENV: &str = "TILESTACK_KEY_ID";
/// Environment variable holding the archive API key secret.
pub const KEY_SECRET_ENV: &str = "TILESTACK_KEY_SECRET";

/// Upper bound on `next` links followed for one query.
const MAX_PAGES: usize = 1000;

/// A searchable imagery archive.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// All items intersecting `aoi` whose capture time falls in `chunk`.
    async fn search(&self, aoi: &AreaOfInterest, chunk: &DateChunk) -> Result<Vec<RawItem>>;

    /// All items belonging to one outcome, regardless of time or place.
    async fn search_outcome(&self, outcome_id: &str) -> Result<Vec<RawItem>>;
}

#[derive(Debug, Clone)]
enum PageRequest {
    Post { url: String, body: Value },
    Get { url: String },
}

/// STAC API client.
pub struct StacCatalog {
    client: reqwest::Client,
    base_url: String,
    collections: Vec<String>,
    page_limit: usize,
    max_retries: u32,
    credentials: Option<(String, String)>,
}

impl StacCatalog {
    /// Build a client from configuration, picking up credentials from
    /// [`KEY_ID_ENV`] and [`KEY_SECRET_ENV`] when both are set.
    pub fn from_config(config: &CatalogConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let credentials = match (std::env::var(KEY_ID_ENV), std::env::var(KEY_SECRET_ENV)) {
            (Ok(id), Ok(secret)) if !id.is_empty() && !secret.is_empty() => Some((id, secret)),
            _ => None,
        };
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            collections: config.collections.clone(),
            page_limit: config.page_limit,
            max_retries: config.max_retries,
            credentials,
        })
    }

    pub fn with_credentials(mut self, key_id: &str, key_secret: &str) -> Self {
        self.credentials = Some((key_id.to_string(), key_secret.to_string()));
        self
    }

    /// Value of the `authorizationToken` header, when credentials are known.
    pub fn auth_token(&self) -> Option<String> {
        self.credentials
            .as_ref()
            .map(|(id, secret)| format!("Key,Secret {},{}", id, secret))
    }

    fn search_url(&self) -> String {
        format!("{}/search", self.base_url)
    }

    async fn collect_pages(&self, body: Value) -> Result<Vec<RawItem>> {
        let mut items = Vec::new();
        let mut next = Some(PageRequest::Post {
            url: self.search_url(),
            body,
        });
        let mut pages = 0;

        while let Some(request) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                bail!("catalog returned more than {} pages", MAX_PAGES);
            }
            let page = self.fetch_page(&request).await?;
            items.extend(parse_feature_collection(&page)?);
            next = next_page(&page, &request);
        }

        Ok(items)
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut builder = match request {
                PageRequest::Post { url, body } => self.client.post(url).json(body),
                PageRequest::Get { url } => self.client.get(url),
            };
            if let Some(token) = self.auth_token() {
                builder = builder.header("authorizationToken", token);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        tracing::debug!(attempt, %status, "catalog request will be retried");
                        last_err = Some(anyhow::anyhow!(
                            "catalog error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("catalog error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("catalog request failed after retries")))
    }
}

#[async_trait]
impl Catalog for StacCatalog {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn search(&self, aoi: &AreaOfInterest, chunk: &DateChunk) -> Result<Vec<RawItem>> {
        let body = json!({
            "intersects": aoi.to_geojson(),
            "collections": self.collections,
            "datetime": chunk.interval(),
            "limit": self.page_limit,
        });
        self.collect_pages(body).await
    }

    async fn search_outcome(&self, outcome_id: &str) -> Result<Vec<RawItem>> {
        let body = json!({
            "collections": self.collections,
            "query": { "satl:outcome_id": { "eq": outcome_id } },
            "limit": self.page_limit,
        });
        self.collect_pages(body).await
    }
}

/// Follow-up request for the `next` link of a page, if any.
///
/// A POST link carries its own body; with `merge: true` that body is
/// layered over the previous request's body.
fn next_page(page: &Value, previous: &PageRequest) -> Option<PageRequest> {
    let link = page
        .get("links")?
        .as_array()?
        .iter()
        .find(|l| l.get("rel").and_then(Value::as_str) == Some("next"))?;
    let url = link.get("href")?.as_str()?.to_string();
    let method = link
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .to_ascii_uppercase();

    if method != "POST" {
        return Some(PageRequest::Get { url });
    }

    let link_body = link.get("body").cloned().unwrap_or_else(|| json!({}));
    let merge = link.get("merge").and_then(Value::as_bool).unwrap_or(false);
    let body = match (merge, previous) {
        (true, PageRequest::Post { body: prev, .. }) => {
            let mut merged = prev.clone();
            if let (Some(target), Some(extra)) = (merged.as_object_mut(), link_body.as_object()) {
                for (k, v) in extra {
                    target.insert(k.clone(), v.clone());
                }
            }
            merged
        }
        _ => link_body,
    };
    Some(PageRequest::Post { url, body })
}

/// Parse a STAC `FeatureCollection` page into raw items.
pub fn parse_feature_collection(page: &Value) -> Result<Vec<RawItem>> {
    if page.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        bail!("catalog response is not a FeatureCollection");
    }
    let features = match page.get("features").and_then(Value::as_array) {
        Some(features) => features,
        None => return Ok(Vec::new()),
    };
    Ok(features.iter().filter_map(parse_item).collect())
}

/// Parse one STAC item. Items without an id are skipped; every other
/// field is optional at this stage.
pub fn parse_item(feature: &Value) -> Option<RawItem> {
    let id = feature.get("id")?.as_str()?.to_string();
    let props = feature.get("properties").cloned().unwrap_or(Value::Null);

    let datetime = props
        .get("datetime")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let epsg = props
        .get("proj:epsg")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok());

    let assets: HashMap<String, String> = feature
        .get("assets")
        .and_then(Value::as_object)
        .map(|assets| {
            assets
                .iter()
                .filter_map(|(role, asset)| {
                    let href = asset.get("href")?.as_str()?;
                    Some((role.clone(), href.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Some(RawItem {
        id,
        datetime,
        epsg,
        geometry: feature.get("geometry").filter(|g| !g.is_null()).cloned(),
        cloud_cover: props.get("eo:cloud_cover").and_then(Value::as_f64),
        valid_pixel_percent: props.get("satl:valid_pixel").and_then(Value::as_f64),
        product_version: props.get("satl:product_version").and_then(scalar_string),
        outcome_id: props.get("satl:outcome_id").and_then(scalar_string),
        grid_cell: props.get("grid:code").and_then(scalar_string),
        assets,
    })
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature() -> Value {
        json!({
            "type": "Feature",
            "id": "20230601_103000_SN12_QUICKVIEW_VISUAL_1_0_0_SATL-2KM-31N_430_4582",
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[2.1, 41.3], [2.2, 41.3], [2.2, 41.4], [2.1, 41.4], [2.1, 41.3]]]
            },
            "properties": {
                "datetime": "2023-06-01T10:30:00.250000Z",
                "proj:epsg": 32631,
                "eo:cloud_cover": 12.5,
                "satl:valid_pixel": 99.0,
                "satl:product_version": "1.0.0",
                "satl:outcome_id": "a1b2c3d4--171210",
                "grid:code": "SATL-2KM-31N_430_4582"
            },
            "assets": {
                "analytic": { "href": "https://example.test/a.tif" },
                "preview": { "href": "https://example.test/p.png" },
                "thumbnail": { "title": "no href" }
            }
        })
    }

    #[test]
    fn parses_stac_item() {
        let item = parse_item(&feature()).unwrap();
        assert_eq!(item.epsg, Some(32631));
        assert_eq!(item.cloud_cover, Some(12.5));
        assert_eq!(item.outcome_id.as_deref(), Some("a1b2c3d4--171210"));
        assert_eq!(item.grid_cell.as_deref(), Some("SATL-2KM-31N_430_4582"));
        assert_eq!(item.assets.len(), 2);
        assert_eq!(
            item.datetime.unwrap().timestamp_subsec_millis(),
            250
        );
    }

    #[test]
    fn tolerates_missing_properties() {
        let item = parse_item(&json!({ "id": "bare" })).unwrap();
        assert!(item.epsg.is_none() && item.datetime.is_none() && item.geometry.is_none());
        assert!(parse_item(&json!({ "properties": {} })).is_none());
    }

    #[test]
    fn numeric_version_becomes_string() {
        let mut f = feature();
        f["properties"]["satl:product_version"] = json!(2);
        assert_eq!(parse_item(&f).unwrap().product_version.as_deref(), Some("2"));
    }

    #[test]
    fn rejects_non_collection_response() {
        assert!(parse_feature_collection(&json!({ "type": "Feature" })).is_err());
        let empty = parse_feature_collection(&json!({ "type": "FeatureCollection" })).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn next_link_variants() {
        let prev = PageRequest::Post {
            url: "https://x/search".into(),
            body: json!({ "limit": 100, "datetime": "a/b" }),
        };
        let page = json!({ "links": [{ "rel": "next", "href": "https://x/search?page=2" }] });
        assert!(matches!(next_page(&page, &prev), Some(PageRequest::Get { .. })));

        let page = json!({ "links": [{
            "rel": "next", "href": "https://x/search", "method": "POST",
            "body": { "token": "abc" }, "merge": true
        }] });
        match next_page(&page, &prev) {
            Some(PageRequest::Post { body, .. }) => {
                assert_eq!(body["token"], "abc");
                assert_eq!(body["limit"], 100);
            }
            other => panic!("unexpected {:?}", other),
        }

        let page = json!({ "links": [{ "rel": "self", "href": "https://x" }] });
        assert!(next_page(&page, &prev).is_none());
    }

    #[test]
    fn auth_header_format() {
        let catalog = StacCatalog::from_config(&CatalogConfig::default())
            .unwrap()
            .with_credentials("id", "secret");
        assert_eq!(catalog.auth_token().as_deref(), Some("Key,Secret id,secret"));
    }
}
