//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Maximum database connections in pool (default: 10).
    pub database_max_connections: u32,

    /// Directory holding one YAML file per entity (default: ./entities).
    pub entities_dir: PathBuf,

    /// Path to uploads directory (default: ./uploads).
    pub uploads_dir: PathBuf,

    /// AES-256 key for private file uploads, 64 hex characters. When None,
    /// private files are stored unencrypted.
    pub file_encryption_key: Option<[u8; 32]>,

    /// CORS allowed origins (comma-separated, default: "*").
    pub cors_allowed_origins: Vec<String>,

    /// Upper bound for an explicit `itemsPerPage` (default: 500).
    pub max_items_per_page: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("PORT must be a valid u16")?;

        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        let entities_dir = env::var("ENTITIES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./entities"));

        let uploads_dir = env::var("UPLOADS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./uploads"));

        let file_encryption_key = match env::var("FILE_ENCRYPTION_KEY") {
            Ok(raw) if !raw.trim().is_empty() => Some(parse_key(raw.trim())?),
            _ => None,
        };

        let cors_allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|_| vec!["*".to_string()]);

        let max_items_per_page = env::var("MAX_ITEMS_PER_PAGE")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .context("MAX_ITEMS_PER_PAGE must be a valid u64")?;
        if max_items_per_page == 0 {
            bail!("MAX_ITEMS_PER_PAGE must be at least 1");
        }

        Ok(Self {
            port,
            database_url,
            database_max_connections,
            entities_dir,
            uploads_dir,
            file_encryption_key,
            cors_allowed_origins,
            max_items_per_page,
        })
    }
}

fn parse_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(raw).context("FILE_ENCRYPTION_KEY must be hex encoded")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("FILE_ENCRYPTION_KEY must decode to exactly 32 bytes"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_key() {
        let key = parse_key(&"ab".repeat(32)).unwrap();
        assert_eq!(key, [0xab; 32]);
    }

    #[test]
    fn rejects_short_or_invalid_keys() {
        assert!(parse_key("abcd").is_err());
        assert!(parse_key(&"zz".repeat(32)).is_err());
    }
}
