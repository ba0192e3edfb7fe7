use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Product {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub name: String,
    pub brand: String,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub image: String,
}

// Catalog documents in the wild use numeric ids; selections always store strings.
fn id_as_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid product id: {}", other))),
    }
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    products: Vec<Product>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read catalog {path}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error("failed to fetch catalog: {0}")]
    Http(#[from] reqwest::Error),

    #[error("catalog request returned {0}")]
    Status(u16),

    #[error("malformed catalog: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSource {
    File(PathBuf),
    Url(url::Url),
}

impl CatalogSource {
    /// `http(s)://` locations are fetched, anything else is read from disk.
    pub fn parse(location: &str) -> Self {
        match url::Url::parse(location) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => CatalogSource::Url(u),
            _ => CatalogSource::File(PathBuf::from(location)),
        }
    }

    async fn fetch(&self) -> Result<String, LoadError> {
        match self {
            CatalogSource::File(path) => {
                tokio::fs::read_to_string(path).await.map_err(|source| LoadError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
            CatalogSource::Url(url) => {
                let resp = reqwest::get(url.clone()).await?;
                if !resp.status().is_success() {
                    return Err(LoadError::Status(resp.status().as_u16()));
                }
                Ok(resp.text().await?)
            }
        }
    }
}

/// The full product list, fetched at most once. A failed load leaves the
/// store empty so the next call tries again.
pub struct CatalogStore {
    source: CatalogSource,
    products: OnceCell<Vec<Product>>,
}

impl CatalogStore {
    pub fn new(source: CatalogSource) -> Self {
        Self { source, products: OnceCell::new() }
    }

    #[cfg(test)]
    pub fn from_products(products: Vec<Product>) -> Self {
        Self {
            source: CatalogSource::File(PathBuf::new()),
            products: OnceCell::new_with(Some(products)),
        }
    }

    pub async fn load(&self) -> Result<&[Product], LoadError> {
        let products = self
            .products
            .get_or_try_init(|| async {
                let raw = self.source.fetch().await?;
                let doc: CatalogDocument = serde_json::from_str(&raw)?;
                tracing::info!(count = doc.products.len(), source = ?self.source, "catalog loaded");
                Ok::<_, LoadError>(doc.products)
            })
            .await?;
        Ok(products.as_slice())
    }

    pub async fn filter(
        &self,
        category: Option<&str>,
        search: Option<&str>,
    ) -> Result<Vec<Product>, LoadError> {
        let products = self.load().await?;
        Ok(filter_products(products, category, search))
    }

    pub async fn categories(&self) -> Result<Vec<String>, LoadError> {
        let products = self.load().await?;
        let mut out: Vec<String> = Vec::new();
        for p in products {
            if !out.iter().any(|c| c == &p.category) {
                out.push(p.category.clone());
            }
        }
        Ok(out)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Product>, LoadError> {
        let products = self.load().await?;
        Ok(products.iter().find(|p| p.id == id).cloned())
    }
}

/// Category is an exact match; the search term is a case-insensitive
/// substring of the name or the description. Empty inputs match everything.
pub fn filter_products(
    products: &[Product],
    category: Option<&str>,
    search: Option<&str>,
) -> Vec<Product> {
    let category = category.filter(|c| !c.is_empty());
    let needle = search.filter(|s| !s.is_empty()).map(str::to_lowercase);
    products
        .iter()
        .filter(|p| category.map_or(true, |c| p.category == c))
        .filter(|p| {
            needle.as_deref().map_or(true, |n| {
                p.name.to_lowercase().contains(n) || p.description.to_lowercase().contains(n)
            })
        })
        .cloned()
        .collect()
}

#[cfg(test)]
pub(crate) fn product(id: &str, name: &str, category: &str, description: &str) -> Product {
    Product {
        id: id.into(),
        name: name.into(),
        brand: "CeraVe".into(),
        category: category.into(),
        description: description.into(),
        image: format!("https://img.example/{}.png", id),
    }
}
