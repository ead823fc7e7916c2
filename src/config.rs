use crate::catalog::{Catalog, LocalStore};
use crate::defaults;
use crate::query::SearchSettings;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Where index definitions are persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatalogBackend {
    Local,
    S3,
    Memory,
}

impl FromStr for CatalogBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "fs" => Ok(CatalogBackend::Local),
            "s3" | "minio" => Ok(CatalogBackend::S3),
            "memory" | "mem" => Ok(CatalogBackend::Memory),
            other => bail!("unknown catalog backend: {other} (expected local, s3 or memory)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: String,
    pub catalog: CatalogBackend,
    pub data_dir: PathBuf,
    pub log_level: tracing::Level,
    pub search: SearchSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: defaults::DEFAULT_BIND.to_string(),
            catalog: CatalogBackend::Local,
            data_dir: PathBuf::from(defaults::DEFAULT_DATA_DIR),
            log_level: tracing::Level::INFO,
            search: SearchSettings::default(),
        }
    }
}

impl Config {
    /// Read `BEANSTORE_*` variables from the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(bind) = lookup("BEANSTORE_BIND") {
            config.bind = bind;
        }
        if let Some(backend) = lookup("BEANSTORE_CATALOG") {
            config.catalog = backend.parse()?;
        }
        if let Some(dir) = lookup("BEANSTORE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("BEANSTORE_LOG") {
            config.log_level = level
                .parse()
                .with_context(|| format!("invalid BEANSTORE_LOG level: {level}"))?;
        }
        if let Some(k) = lookup("BEANSTORE_DEFAULT_TOP_K") {
            let k: usize = k.parse().context("BEANSTORE_DEFAULT_TOP_K must be a number")?;
            if k == 0 {
                bail!("BEANSTORE_DEFAULT_TOP_K must be at least 1");
            }
            config.search.default_top_k = k;
        }
        if let Some(nprobe) = lookup("BEANSTORE_DEFAULT_NPROBE") {
            config.search.default_nprobe =
                Some(nprobe.parse().context("BEANSTORE_DEFAULT_NPROBE must be a number")?);
        }
        if let Some(score) = lookup("BEANSTORE_DEFAULT_MIN_SCORE") {
            config.search.default_min_score =
                Some(score.parse().context("BEANSTORE_DEFAULT_MIN_SCORE must be a number")?);
        }
        Ok(config)
    }

    pub async fn open_catalog(&self) -> Result<Catalog> {
        match self.catalog {
            CatalogBackend::Local => {
                tracing::info!("Using local catalog in {}", self.data_dir.display());
                Ok(Catalog::new(Arc::new(LocalStore::new(&self.data_dir))))
            }
            CatalogBackend::Memory => {
                tracing::warn!("Using in-memory catalog; index definitions will not survive a restart");
                Ok(Catalog::in_memory())
            }
            #[cfg(feature = "s3")]
            CatalogBackend::S3 => {
                let client = crate::minio::S3Client::from_env().await?;
                Ok(Catalog::new(Arc::new(client)))
            }
            #[cfg(not(feature = "s3"))]
            CatalogBackend::S3 => bail!("this build has no S3 support (enable the `s3` feature)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind, "0.0.0.0:8081");
        assert_eq!(config.catalog, CatalogBackend::Local);
        assert_eq!(config.search.default_top_k, 5);
        assert_eq!(config.search.default_nprobe, None);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("BEANSTORE_CATALOG", "memory"),
            ("BEANSTORE_DEFAULT_TOP_K", "10"),
            ("BEANSTORE_DEFAULT_NPROBE", "3"),
            ("BEANSTORE_DEFAULT_MIN_SCORE", "0.5"),
            ("BEANSTORE_LOG", "debug"),
        ]))
        .unwrap();
        assert_eq!(config.catalog, CatalogBackend::Memory);
        assert_eq!(config.search.default_top_k, 10);
        assert_eq!(config.search.default_nprobe, Some(3));
        assert_eq!(config.search.default_min_score, Some(0.5));
        assert_eq!(config.log_level, tracing::Level::DEBUG);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_lookup(lookup(&[("BEANSTORE_CATALOG", "redis")])).is_err());
        assert!(Config::from_lookup(lookup(&[("BEANSTORE_DEFAULT_TOP_K", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("BEANSTORE_LOG", "chatty")])).is_err());
    }
}
