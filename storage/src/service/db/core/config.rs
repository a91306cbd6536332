//! 데이터베이스 서비스 설정 모듈
//!
//! 빌더 패턴으로 데이터베이스 서비스 설정을 관리

use crate::config::db::DbConfig;
use crate::tool::error::DbError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// 데이터베이스 서비스 설정
#[derive(Debug, Clone)]
pub struct DbServiceConfig {
    /// 방언 선택 및 연결 정보
    pub db_config: DbConfig,

    /// 연결 풀 및 재시도 설정
    pub pool_config: PoolConfig,

    /// 쿼리 실행 설정
    pub query_config: QueryConfig,

    /// 마이그레이션 설정
    pub migration_config: MigrationConfig,

    /// 캐시 설정
    pub cache_config: CacheConfig,
}

/// 연결 풀 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 풀의 최대 연결 수
    pub max_connections: u32,

    /// 연결 획득 타임아웃
    pub acquire_timeout: Duration,

    /// 최대 연결 시도 횟수
    pub connect_attempts: u32,

    /// 첫 재시도 대기 시간 (매 시도마다 두 배)
    pub initial_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            connect_attempts: 10,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// 쿼리 실행 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// 쿼리 로깅 활성화
    pub enable_query_logging: bool,

    /// 느린 쿼리 로깅 임계값 (ms)
    pub slow_query_threshold_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            enable_query_logging: false,
            slow_query_threshold_ms: 1000,
        }
    }
}

/// 마이그레이션 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// 방언별 하위 디렉토리(`postgres/`, `sqlite3/`)를 가진 루트 디렉토리
    pub dir: PathBuf,

    /// 마이그레이션 후 실행할 시드 스크립트
    pub seed_file: Option<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("db"),
            seed_file: None,
        }
    }
}

/// 캐시 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 항목 수명
    pub ttl: Duration,

    /// 캐시 종류별 최대 항목 수
    pub capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            capacity: 10_000,
        }
    }
}

impl DbServiceConfig {
    /// Create configuration with defaults for everything but the dialect
    pub fn new(db_config: DbConfig) -> Self {
        Self {
            db_config,
            pool_config: PoolConfig::default(),
            query_config: QueryConfig::default(),
            migration_config: MigrationConfig::default(),
            cache_config: CacheConfig::default(),
        }
    }

    /// Create new configuration from environment
    pub fn from_env() -> Result<Self, DbError> {
        let mut config = Self::new(DbConfig::from_env()?);

        config.pool_config.max_connections =
            env_or("DB_MAX_CONNECTIONS", config.pool_config.max_connections);
        config.pool_config.connect_attempts =
            env_or("DB_CONNECT_ATTEMPTS", config.pool_config.connect_attempts);
        config.query_config.enable_query_logging =
            env_or("DB_QUERY_LOGGING", config.query_config.enable_query_logging);
        config.query_config.slow_query_threshold_ms =
            env_or("DB_SLOW_QUERY_MS", config.query_config.slow_query_threshold_ms);

        if let Ok(dir) = std::env::var("DB_MIGRATIONS_DIR") {
            config.migration_config.dir = PathBuf::from(dir);
        }
        config.migration_config.seed_file = std::env::var("DB_SEED_FILE").ok().map(PathBuf::from);

        let ttl_secs = env_or("CACHE_TTL_SECS", config.cache_config.ttl.as_secs());
        config.cache_config.ttl = Duration::from_secs(ttl_secs);
        config.cache_config.capacity = env_or("CACHE_CAPACITY", config.cache_config.capacity);

        if config.pool_config.connect_attempts == 0 {
            return Err(DbError::Configuration(
                "DB_CONNECT_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    /// Builder: set connection attempt ceiling and first backoff delay
    pub fn with_retry(mut self, attempts: u32, initial_backoff: Duration) -> Self {
        self.pool_config.connect_attempts = attempts.max(1);
        self.pool_config.initial_backoff = initial_backoff;
        self
    }

    /// Builder: set the migration root and optional seed script
    pub fn with_migrations(mut self, dir: impl Into<PathBuf>, seed_file: Option<PathBuf>) -> Self {
        self.migration_config.dir = dir.into();
        self.migration_config.seed_file = seed_file;
        self
    }

    /// Builder: set cache TTL and capacity
    pub fn with_cache(mut self, ttl: Duration, capacity: u64) -> Self {
        self.cache_config.ttl = ttl;
        self.cache_config.capacity = capacity;
        self
    }

    /// Builder: bound how long one connect/acquire may take
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.acquire_timeout = timeout;
        self
    }

    /// Builder: set the pool size
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.pool_config.max_connections = max_connections.max(1);
        self
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Debug>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} 환경변수 값 '{}'이 잘못되어 {:?}를 사용합니다.", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let config = DbServiceConfig::new(DbConfig::sqlite("t.db"))
            .with_retry(0, Duration::from_millis(5))
            .with_cache(Duration::from_secs(1), 16)
            .with_migrations("migrations", None);
        assert_eq!(config.pool_config.connect_attempts, 1);
        assert_eq!(config.pool_config.initial_backoff, Duration::from_millis(5));
        assert_eq!(config.cache_config.capacity, 16);
        assert_eq!(config.migration_config.dir, PathBuf::from("migrations"));
    }

    #[test]
    fn test_defaults() {
        let pool = PoolConfig::default();
        assert_eq!(pool.connect_attempts, 10);
        assert_eq!(pool.initial_backoff, Duration::from_secs(1));
    }
}
