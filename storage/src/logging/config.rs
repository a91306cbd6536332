//! 로깅 설정 관리
//!
//! 로깅 시스템의 설정 파라미터를 담당합니다.

use serde::{Deserialize, Serialize};

/// 로깅 시스템 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `RUST_LOG`가 없을 때 쓰는 필터 (기본값: "info")
    pub level: String,

    /// JSON 형식 여부 (기본값: false)
    pub json_format: bool,

    /// 타임스탬프 UTC 사용 여부 (기본값: true)
    pub use_utc: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            use_utc: true,
        }
    }
}

impl LoggingConfig {
    /// 환경변수에서 설정 로드
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LOG_LEVEL") {
            if !val.trim().is_empty() {
                config.level = val;
            }
        }

        if let Ok(val) = std::env::var("LOG_JSON") {
            config.json_format = val.to_lowercase() == "true";
        }

        if let Ok(val) = std::env::var("LOG_USE_UTC") {
            config.use_utc = val.to_lowercase() == "true";
        }

        config
    }

    /// 설정 유효성 검증
    pub fn validate(&self) -> anyhow::Result<()> {
        tracing_subscriber::EnvFilter::try_new(&self.level)
            .map_err(|e| anyhow::anyhow!("invalid log level '{}': {}", self.level, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.json_format);
        assert!(config.use_utc);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = LoggingConfig {
            level: "storage=debug,sqlx=warn".to_string(),
            ..LoggingConfig::default()
        };
        assert!(config.validate().is_ok());

        let config = LoggingConfig {
            level: "storage=verbose".to_string(),
            ..LoggingConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
