use std::env;

use mongodb::bson::Document;
use mongodb::{Client, Collection};

use crate::error::{Error, Result};

pub const DEFAULT_URI: &str = "mongodb://localhost:27017";

/// Connection settings for a live collection, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub uri: String,
    pub database: String,
    pub collection: String,
}

impl StoreConfig {
    /// `MONGIST_URI` (optional), `MONGIST_DB` and `MONGIST_COLLECTION`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or(Error::MissingEnv(key))
        };
        Ok(Self {
            uri: lookup("MONGIST_URI").unwrap_or_else(|| DEFAULT_URI.to_string()),
            database: required("MONGIST_DB")?,
            collection: required("MONGIST_COLLECTION")?,
        })
    }

    /// Connect and bind the configured collection. The driver connects
    /// lazily; the first operation surfaces connectivity errors.
    pub async fn connect(&self) -> Result<Collection<Document>> {
        let client = Client::with_uri_str(&self.uri)
            .await
            .map_err(Error::execution)?;
        tracing::info!(database = %self.database, collection = %self.collection, "bound collection");
        Ok(client
            .database(&self.database)
            .collection::<Document>(&self.collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> =
            pairs.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn uri_defaults_to_localhost() {
        let cfg = StoreConfig::from_lookup(lookup_from(&[
            ("MONGIST_DB", "cinema"),
            ("MONGIST_COLLECTION", "movies"),
        ]))
        .unwrap();
        assert_eq!(cfg.uri, DEFAULT_URI);
        assert_eq!(cfg.database, "cinema");
        assert_eq!(cfg.collection, "movies");
    }

    #[test]
    fn missing_collection_is_reported() {
        let err = StoreConfig::from_lookup(lookup_from(&[("MONGIST_DB", "cinema")])).unwrap_err();
        assert!(matches!(err, Error::MissingEnv("MONGIST_COLLECTION")));
    }

    #[test]
    fn empty_database_counts_as_missing() {
        let err = StoreConfig::from_lookup(lookup_from(&[
            ("MONGIST_DB", ""),
            ("MONGIST_COLLECTION", "movies"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::MissingEnv("MONGIST_DB")));
    }
}
