//! Render pipeline: catalog fetch → deterministic HTML → content hash →
//! blob write.
//!
//! The renderer is a pure function of the product payload; identical
//! upstream data always produces identical bytes, which is what makes the
//! skip-if-unchanged comparison and crash re-processing safe.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use crate::catalog::CatalogSource;
use crate::storage::BlobStore;
use crate::types::RuntimeError;

/// Upper bound on concurrent renders per process.
pub const MAX_CONCURRENT_RENDERS: usize = 50;

/// Prefix under which rendered pages are persisted.
pub const PAGE_BLOB_PREFIX: &str = "/public/pdps";

/// Per-run rendering inputs.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub locale: Option<String>,
    /// Path template with `{locale}`, `{urlKey}`, `{sku}` tokens.
    pub path_format: String,
    pub store_url: String,
    /// Layout frame fetched once per run, when configured.
    pub template: Option<String>,
}

/// A successfully rendered page.
#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub sku: String,
    /// Publish path (input to the admin API).
    pub path: String,
    /// Blob path the page bytes were written to.
    pub blob_path: String,
    pub content_hash: String,
}

/// Result of processing one SKU.
#[derive(Debug, Clone)]
pub enum RenderResult {
    /// Rendered bytes hash identically to the stored state; nothing to
    /// preview or publish.
    Unchanged { sku: String },
    Rendered(RenderOutcome),
}

/// Renders product pages and persists them to blob storage.
pub struct RenderPipeline {
    catalog: Arc<dyn CatalogSource>,
    blobs: Arc<dyn BlobStore>,
    ctx: RenderContext,
    semaphore: Arc<Semaphore>,
}

impl RenderPipeline {
    pub fn new(
        catalog: Arc<dyn CatalogSource>,
        blobs: Arc<dyn BlobStore>,
        ctx: RenderContext,
    ) -> Self {
        Self {
            catalog,
            blobs,
            ctx,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_RENDERS)),
        }
    }

    /// Render one SKU, comparing against `prior_hash` before writing.
    pub async fn process(
        &self,
        sku: &str,
        url_key: Option<&str>,
        prior_hash: Option<&str>,
    ) -> Result<RenderResult, RuntimeError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| RuntimeError::JobFailed("render semaphore closed".into()))?;

        let product = match url_key {
            Some(key) => match self.catalog.product_by_url_key(key).await {
                Ok(product) => product,
                Err(RuntimeError::NotFound { .. }) => self.catalog.product_by_sku(sku).await?,
                Err(e) => return Err(e),
            },
            None => self.catalog.product_by_sku(sku).await?,
        };

        let url_key = url_key
            .map(|s| s.to_string())
            .or_else(|| {
                product
                    .get("urlKey")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            });

        let html = render_product(sku, &product, self.ctx.template.as_deref());
        let hash = content_hash(&html);

        if prior_hash == Some(hash.as_str()) {
            tracing::debug!(sku, "content unchanged, skipping publish");
            return Ok(RenderResult::Unchanged {
                sku: sku.to_string(),
            });
        }

        let path = product_path(
            &self.ctx.path_format,
            self.ctx.locale.as_deref(),
            sku,
            url_key.as_deref(),
        );
        let blob_path = page_blob_path(&path);
        self.blobs.write(&blob_path, html.as_bytes()).await?;
        tracing::info!(sku, path = %path, hash = %hash, "page rendered");

        Ok(RenderResult::Rendered(RenderOutcome {
            sku: sku.to_string(),
            path,
            blob_path,
            content_hash: hash,
        }))
    }
}

/// Blob path of a rendered page.
pub fn page_blob_path(path: &str) -> String {
    format!("{PAGE_BLOB_PREFIX}{path}.html")
}

/// Expand the path template and sanitize the result per the delivery
/// platform's document-naming rules: lowercase, `[a-z0-9/]` kept, runs of
/// anything else folded to a single `-`.
pub fn product_path(
    format: &str,
    locale: Option<&str>,
    sku: &str,
    url_key: Option<&str>,
) -> String {
    let mut path = format.to_string();
    match locale.filter(|l| !l.is_empty()) {
        Some(locale) => path = path.replace("{locale}", locale),
        None => {
            path = path.replace("/{locale}", "").replace("{locale}", "");
        }
    }
    path = path.replace("{urlKey}", url_key.unwrap_or(sku));
    path = path.replace("{sku}", &sku.to_lowercase());
    sanitize_document_path(&path)
}

fn sanitize_document_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    let mut last_dash = false;
    for c in path.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '/' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    // Dashes hugging segment boundaries are noise.
    let cleaned = out
        .split('/')
        .map(|segment| segment.trim_matches('-'))
        .collect::<Vec<_>>()
        .join("/");
    if cleaned.is_empty() || cleaned == "/" {
        "/".to_string()
    } else {
        cleaned
    }
}

/// SHA-256 of the rendered bytes, hex-encoded.
pub fn content_hash(html: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(html.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic HTML for a product payload.
///
/// Field order is fixed and collections are emitted in payload order, so
/// identical payloads yield identical bytes. When a layout template is
/// given, the product markup replaces its `<main></main>` slot.
pub fn render_product(sku: &str, product: &serde_json::Value, template: Option<&str>) -> String {
    let name = product
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or(sku);
    let description = product
        .get("shortDescription")
        .or_else(|| product.get("description"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let mut body = String::new();
    body.push_str(&format!("<div class=\"product\" data-sku=\"{}\">\n", escape(sku)));
    body.push_str(&format!("  <h1>{}</h1>\n", escape(name)));

    if let Some(price) = product
        .get("priceRange")
        .and_then(|v| v.get("minimum"))
        .and_then(|v| v.get("final"))
        .and_then(|v| v.get("amount"))
    {
        let value = price.get("value").map(render_number).unwrap_or_default();
        let currency = price
            .get("currency")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        body.push_str(&format!(
            "  <p class=\"price\">{} {}</p>\n",
            escape(&value),
            escape(currency)
        ));
    }

    if !description.is_empty() {
        body.push_str(&format!(
            "  <div class=\"description\">{}</div>\n",
            escape(description)
        ));
    }

    if let Some(images) = product.get("images").and_then(|v| v.as_array()) {
        body.push_str("  <ul class=\"images\">\n");
        for image in images {
            if let Some(url) = image.get("url").and_then(|v| v.as_str()) {
                let label = image.get("label").and_then(|v| v.as_str()).unwrap_or("");
                body.push_str(&format!(
                    "    <li><img src=\"{}\" alt=\"{}\"></li>\n",
                    escape(url),
                    escape(label)
                ));
            }
        }
        body.push_str("  </ul>\n");
    }

    if let Some(options) = product.get("options").and_then(|v| v.as_array()) {
        if !options.is_empty() {
            body.push_str("  <ul class=\"options\">\n");
            for option in options {
                if let Some(title) = option.get("title").and_then(|v| v.as_str()) {
                    body.push_str(&format!("    <li>{}</li>\n", escape(title)));
                }
            }
            body.push_str("  </ul>\n");
        }
    }
    body.push_str("</div>");

    match template {
        Some(frame) if frame.contains("<main></main>") => {
            frame.replace("<main></main>", &format!("<main>\n{body}\n</main>"))
        }
        _ => format!(
            "<!DOCTYPE html>\n<html>\n<head>\n  <title>{}</title>\n  <meta name=\"description\" content=\"{}\">\n</head>\n<body>\n<main>\n{}\n</main>\n</body>\n</html>\n",
            escape(name),
            escape(description),
            body
        ),
    }
}

fn render_number(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Number(n) => format!("{n}"),
        serde_json::Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobs;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;

    struct FixedCatalog {
        product: Value,
    }

    #[async_trait]
    impl CatalogSource for FixedCatalog {
        async fn product_by_sku(&self, sku: &str) -> Result<Value, RuntimeError> {
            if self.product.is_null() {
                return Err(RuntimeError::NotFound {
                    sku: sku.to_string(),
                });
            }
            Ok(self.product.clone())
        }

        async fn product_by_url_key(&self, url_key: &str) -> Result<Value, RuntimeError> {
            self.product_by_sku(url_key).await
        }

        async fn last_modified(
            &self,
            _skus: &[String],
        ) -> Result<HashMap<String, String>, RuntimeError> {
            Ok(HashMap::new())
        }
    }

    fn context() -> RenderContext {
        RenderContext {
            locale: None,
            path_format: "/products/{urlKey}/{sku}".to_string(),
            store_url: "https://store.example".to_string(),
            template: None,
        }
    }

    fn product() -> Value {
        json!({
            "sku": "ADB177",
            "name": "Bezier Tee",
            "urlKey": "bezier-tee",
            "shortDescription": "A tee.",
            "priceRange": {"minimum": {"final": {"amount": {"value": 19.99, "currency": "USD"}}}},
            "images": [{"url": "https://cdn.example/adb177.jpg", "label": "front"}],
        })
    }

    #[test]
    fn product_path_expands_and_sanitizes_tokens() {
        assert_eq!(
            product_path("/products/{urlKey}/{sku}", None, "ADB177", Some("bezier-tee")),
            "/products/bezier-tee/adb177"
        );
        assert_eq!(
            product_path("/{locale}/products/{urlKey}/{sku}", Some("en-us"), "ADB177", Some("bezier-tee")),
            "/en-us/products/bezier-tee/adb177"
        );
        // Locale token collapses cleanly when absent.
        assert_eq!(
            product_path("/{locale}/products/{sku}", None, "ADB177", None),
            "/products/adb177"
        );
        // Invalid characters fold to single dashes.
        assert_eq!(
            product_path("/products/{urlKey}/{sku}", None, "AB 17/7!", None),
            "/products/ab-17/7/ab-17/7"
        );
    }

    #[test]
    fn renderer_is_deterministic() {
        let a = render_product("ADB177", &product(), None);
        let b = render_product("ADB177", &product(), None);
        assert_eq!(a, b);
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn renderer_uses_template_slot() {
        let frame = "<!DOCTYPE html><html><body><header>H</header><main></main></body></html>";
        let html = render_product("ADB177", &product(), Some(frame));
        assert!(html.contains("<header>H</header>"));
        assert!(html.contains("Bezier Tee"));
    }

    #[tokio::test]
    async fn unchanged_hash_skips_blob_write() {
        let catalog = Arc::new(FixedCatalog { product: product() });
        let blobs = Arc::new(MemoryBlobs::new());
        let pipeline = RenderPipeline::new(catalog, blobs.clone(), context());

        let html = render_product("ADB177", &product(), None);
        let hash = content_hash(&html);
        let result = pipeline
            .process("ADB177", Some("bezier-tee"), Some(&hash))
            .await
            .unwrap();
        assert!(matches!(result, RenderResult::Unchanged { .. }));
        assert_eq!(blobs.len(), 0);
    }

    #[tokio::test]
    async fn changed_hash_writes_page_blob() {
        let catalog = Arc::new(FixedCatalog { product: product() });
        let blobs = Arc::new(MemoryBlobs::new());
        let pipeline = RenderPipeline::new(catalog, blobs.clone(), context());

        let result = pipeline.process("ADB177", None, None).await.unwrap();
        let RenderResult::Rendered(outcome) = result else {
            panic!("expected a rendered outcome");
        };
        assert_eq!(outcome.path, "/products/bezier-tee/adb177");
        assert_eq!(outcome.blob_path, "/public/pdps/products/bezier-tee/adb177.html");
        assert!(blobs.contains(&outcome.blob_path));
    }

    #[tokio::test]
    async fn missing_product_is_not_found() {
        let catalog = Arc::new(FixedCatalog {
            product: Value::Null,
        });
        let blobs = Arc::new(MemoryBlobs::new());
        let pipeline = RenderPipeline::new(catalog, blobs, context());

        let err = pipeline.process("GONE", None, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound { .. }));
    }
}
