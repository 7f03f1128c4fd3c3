use jsonwebtoken::Algorithm;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub algorithm: Algorithm,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub redis_host: String,
    pub redis_port: u16,
    /// TTL for the cached user listing, in seconds.
    pub listing_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub cache: CacheConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            algorithm: std::env::var("JWT_ALGORITHM")
                .unwrap_or_else(|_| "HS256".into())
                .parse::<Algorithm>()
                .map_err(|e| anyhow::anyhow!("JWT_ALGORITHM: {e}"))?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "userdir".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "userdir-users".into()),
            ttl_minutes: std::env::var("JWT_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(30),
        };
        let cache = CacheConfig {
            redis_host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            redis_port: std::env::var("REDIS_PORT")
                .ok()
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(6379),
            listing_ttl_seconds: std::env::var("CACHE_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60),
        };
        Ok(Self {
            database_url,
            jwt,
            cache,
        })
    }
}
