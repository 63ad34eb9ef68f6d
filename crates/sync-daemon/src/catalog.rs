//! Product catalog loading

use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use aurum_core::PricedEntity;

const LIST_FIELDS: &[&str] = &["data", "products"];

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Catalog is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Catalog must be an array of products or an object wrapping one")]
    Shape,
}

/// Read a catalog file
pub fn load_catalog(path: &Path) -> Result<Vec<PricedEntity>, CatalogError> {
    let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let entities = parse_catalog(&text)?;
    info!(path = %path.display(), products = entities.len(), "Catalog loaded");
    Ok(entities)
}

/// Parse products from `[...]`, `{"data": [...]}` or `{"products": [...]}`.
/// Records without an id are skipped; other bad fields leave the product
/// unpriced.
pub fn parse_catalog(text: &str) -> Result<Vec<PricedEntity>, CatalogError> {
    let value: Value = serde_json::from_str(text)?;
    let records = unwrap_list(value).ok_or(CatalogError::Shape)?;

    let mut entities = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        match serde_json::from_value::<PricedEntity>(record) {
            Ok(entity) => entities.push(entity),
            Err(e) => warn!(index, error = %e, "Skipping catalog record"),
        }
    }
    Ok(entities)
}

fn unwrap_list(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => LIST_FIELDS
            .iter()
            .find_map(|field| map.remove(*field))
            .and_then(unwrap_list),
        _ => None,
    }
}
