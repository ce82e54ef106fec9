//! Catalog service client.
//!
//! Speaks GraphQL POST against the catalog endpoint with headers derived
//! from the remote configuration sheet (`configuration =
//! merge(default_config, path_overrides)`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::http::{HttpClient, HttpError, RequestOptions};
use crate::types::RuntimeError;

const PRODUCT_QUERY: &str = r#"query ProductQuery($sku: String!) {
  products(skus: [$sku]) {
    sku
    name
    urlKey
    shortDescription
    description
    inStock
    images(roles: ["image"]) { url label }
    priceRange { minimum { final { amount { value currency } } } }
    options { id title values { title } }
  }
}"#;

const PRODUCT_BY_URL_KEY_QUERY: &str = r#"query ProductByUrlKey($urlKey: String!) {
  productSearch(phrase: "", filter: [{ attribute: "url_key", eq: $urlKey }], page_size: 1) {
    items {
      productView {
        sku
        name
        urlKey
        shortDescription
        description
        inStock
        images(roles: ["image"]) { url label }
        priceRange { minimum { final { amount { value currency } } } }
        options { id title values { title } }
      }
    }
  }
}"#;

const LAST_MODIFIED_QUERY: &str = r#"query GetLastModifiedQuery($skus: [String]!) {
  products(skus: $skus) { sku lastModifiedAt }
}"#;

const URL_KEY_QUERY: &str = r#"query GetUrlKeyQuery($skus: [String]!) {
  products(skus: $skus) { sku urlKey }
}"#;

const VARIANTS_QUERY: &str = r#"query VariantsQuery($sku: String!) {
  variants(sku: $sku) { variants { product { sku name inStock images(roles: ["image"]) { url } } } }
}"#;

const CATEGORIES_QUERY: &str = r#"query CategoriesQuery {
  categories(ids: []) { id name urlPath }
}"#;

const PRODUCT_COUNT_QUERY: &str = r#"query ProductCountQuery($categoryPath: String!) {
  productSearch(phrase: "", filter: [{ attribute: "categoryPath", eq: $categoryPath }], page_size: 1) {
    total_count
  }
}"#;

const PRODUCTS_QUERY: &str = r#"query ProductsQuery($currentPage: Int!, $categoryPath: String!) {
  productSearch(phrase: "", filter: [{ attribute: "categoryPath", eq: $categoryPath }], page_size: 100, current_page: $currentPage) {
    items { productView { sku urlKey } }
    page_info { current_page total_pages }
  }
}"#;

/// Catalog endpoint and request headers resolved from remote configuration.
#[derive(Debug, Clone, Default)]
pub struct CatalogConfig {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
}

/// Merge configuration maps: later maps win.
pub fn merge_config(
    defaults: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Derive the catalog endpoint and headers from a merged configuration map.
///
/// Keys shaped `commerce.headers.cs.<Header-Name>` become request headers;
/// `commerce-endpoint` is the GraphQL endpoint.
pub fn derive_catalog_config(rows: &HashMap<String, String>) -> Result<CatalogConfig, RuntimeError> {
    const HEADER_PREFIX: &str = "commerce.headers.cs.";

    let endpoint = rows
        .get("commerce-endpoint")
        .cloned()
        .ok_or_else(|| RuntimeError::Validation("configuration lacks commerce-endpoint".into()))?;

    let mut headers: Vec<(String, String)> = rows
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(HEADER_PREFIX)
                .map(|name| (name.to_string(), value.clone()))
        })
        .collect();
    headers.sort();
    Ok(CatalogConfig { endpoint, headers })
}

/// Fetch the remote configuration sheet and return its key/value rows.
pub async fn fetch_remote_config(
    http: &HttpClient,
    content_url: &str,
    config_name: &str,
    config_sheet: Option<&str>,
) -> Result<HashMap<String, String>, RuntimeError> {
    let mut url = format!("{}/{}.json", content_url.trim_end_matches('/'), config_name);
    if let Some(sheet) = config_sheet {
        url.push_str(&format!("?sheet={sheet}"));
    }
    let response = http
        .request("remote-config", &url, RequestOptions::get())
        .await?
        .unwrap_or(Value::Null);

    let rows = response
        .get("data")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let mut map = HashMap::new();
    for row in rows {
        if let (Some(key), Some(value)) = (
            row.get("key").and_then(|v| v.as_str()),
            row.get("value").and_then(|v| v.as_str()),
        ) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    Ok(map)
}

/// Product lookups used by the render pipeline and deletion diffing. The
/// HTTP client implements this; tests provide scripted catalogs.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch a product by SKU. Missing products are `NotFound`.
    async fn product_by_sku(&self, sku: &str) -> Result<Value, RuntimeError>;

    /// Fetch a product by its URL key.
    async fn product_by_url_key(&self, url_key: &str) -> Result<Value, RuntimeError>;

    /// Last-modified stamps for up to a page of SKUs. SKUs absent from the
    /// result are no longer in the catalog.
    async fn last_modified(&self, skus: &[String])
        -> Result<HashMap<String, String>, RuntimeError>;
}

/// GraphQL catalog client.
pub struct CatalogClient {
    http: Arc<HttpClient>,
    config: CatalogConfig,
}

impl CatalogClient {
    pub fn new(http: Arc<HttpClient>, config: CatalogConfig) -> Self {
        Self { http, config }
    }

    async fn query(&self, name: &str, query: &str, variables: Value) -> Result<Value, RuntimeError> {
        let mut opts = RequestOptions::post_json(json!({
            "query": query,
            "variables": variables,
        }));
        for (header, value) in &self.config.headers {
            opts = opts.with_header(header.clone(), value.clone());
        }

        let response = self
            .http
            .request(name, &self.config.endpoint, opts)
            .await?
            .unwrap_or(Value::Null);

        if let Some(errors) = response.get("errors").and_then(|v| v.as_array()) {
            if !errors.is_empty() {
                let message = errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(HttpError::Decode {
                    name: name.to_string(),
                    message: format!("graphql errors: {message}"),
                }
                .into());
            }
        }
        Ok(response.get("data").cloned().unwrap_or(Value::Null))
    }

    /// SKUs and URL keys of one catalog page; returns `(skus, has_more)`.
    pub async fn products_page(
        &self,
        current_page: u32,
        category_path: &str,
    ) -> Result<(Vec<String>, bool), RuntimeError> {
        let data = self
            .query(
                "catalog-products",
                PRODUCTS_QUERY,
                json!({"currentPage": current_page, "categoryPath": category_path}),
            )
            .await?;
        let search = data.get("productSearch").cloned().unwrap_or(Value::Null);
        let skus = search
            .get("items")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| {
                        i.get("productView")
                            .and_then(|p| p.get("sku"))
                            .and_then(|s| s.as_str())
                            .map(|s| s.to_string())
                    })
                    .collect()
            })
            .unwrap_or_default();
        let has_more = search
            .get("page_info")
            .map(|p| {
                let current = p.get("current_page").and_then(|v| v.as_u64()).unwrap_or(0);
                let total = p.get("total_pages").and_then(|v| v.as_u64()).unwrap_or(0);
                current < total
            })
            .unwrap_or(false);
        Ok((skus, has_more))
    }

    pub async fn url_keys(
        &self,
        skus: &[String],
    ) -> Result<HashMap<String, String>, RuntimeError> {
        let data = self
            .query("catalog-url-keys", URL_KEY_QUERY, json!({ "skus": skus }))
            .await?;
        Ok(sku_field_map(&data, "urlKey"))
    }

    pub async fn variants(&self, sku: &str) -> Result<Vec<Value>, RuntimeError> {
        let data = self
            .query("catalog-variants", VARIANTS_QUERY, json!({ "sku": sku }))
            .await?;
        Ok(data
            .get("variants")
            .and_then(|v| v.get("variants"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub async fn categories(&self) -> Result<Vec<Value>, RuntimeError> {
        let data = self.query("catalog-categories", CATEGORIES_QUERY, json!({})).await?;
        Ok(data
            .get("categories")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub async fn product_count(&self, category_path: &str) -> Result<u64, RuntimeError> {
        let data = self
            .query(
                "catalog-product-count",
                PRODUCT_COUNT_QUERY,
                json!({ "categoryPath": category_path }),
            )
            .await?;
        Ok(data
            .get("productSearch")
            .and_then(|v| v.get("total_count"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }
}

#[async_trait]
impl CatalogSource for CatalogClient {
    async fn product_by_sku(&self, sku: &str) -> Result<Value, RuntimeError> {
        let data = self
            .query("catalog-product", PRODUCT_QUERY, json!({ "sku": sku }))
            .await?;
        data.get("products")
            .and_then(|v| v.as_array())
            .and_then(|products| products.first())
            .filter(|p| !p.is_null())
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound {
                sku: sku.to_string(),
            })
    }

    async fn product_by_url_key(&self, url_key: &str) -> Result<Value, RuntimeError> {
        let data = self
            .query(
                "catalog-product-by-url-key",
                PRODUCT_BY_URL_KEY_QUERY,
                json!({ "urlKey": url_key }),
            )
            .await?;
        data.get("productSearch")
            .and_then(|v| v.get("items"))
            .and_then(|v| v.as_array())
            .and_then(|items| items.first())
            .and_then(|i| i.get("productView"))
            .filter(|p| !p.is_null())
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound {
                sku: url_key.to_string(),
            })
    }

    async fn last_modified(
        &self,
        skus: &[String],
    ) -> Result<HashMap<String, String>, RuntimeError> {
        let data = self
            .query(
                "catalog-last-modified",
                LAST_MODIFIED_QUERY,
                json!({ "skus": skus }),
            )
            .await?;
        Ok(sku_field_map(&data, "lastModifiedAt"))
    }
}

fn sku_field_map(data: &Value, field: &str) -> HashMap<String, String> {
    data.get("products")
        .and_then(|v| v.as_array())
        .map(|products| {
            products
                .iter()
                .filter_map(|p| {
                    let sku = p.get("sku").and_then(|s| s.as_str())?;
                    let value = p.get(field).and_then(|s| s.as_str()).unwrap_or_default();
                    Some((sku.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}
