//! 영속성 계층 에러 관리
//!
//! 내부 계층(`DbError`)과 서비스 경계(`AppError`)의 두 단계로 에러를 나눕니다.
//! 캐시/설정/마이그레이션 내부에서는 `DbError`가 그대로 전파되고,
//! 서비스 경계에서 한 번만 `AppError`로 변환됩니다.

use thiserror::Error;
use tracing::{error, info, warn};

/// Internal error taxonomy of the persistence layer.
#[derive(Error, Debug)]
pub enum DbError {
    /// Ambiguous or missing dialect selection, bad environment values.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database connection failed after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("Interrupted while connecting to the database")]
    Interrupted,

    #[error("Database query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Expected exactly one affected row, got {0}")]
    UnexpectedRowCount(u64),

    #[error("Migration I/O error at {path}: {source}")]
    MigrationIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration {filename} failed: {message}")]
    Migration { filename: String, message: String },

    #[error("Checksum mismatch for {filename}: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid onChecksumMismatch policy '{value}' in {filename}")]
    InvalidPolicy { filename: String, value: String },

    #[error("Unknown config item key: {0}")]
    UnknownConfigKey(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidConfigValue { key: String, reason: String },

    #[error("Invalid attribute: {0}")]
    InvalidAttribute(String),

    #[error("Config store is not initialised")]
    StoreNotInitialised,

    #[error("Not found: {0}")]
    NotFound(String),
}

/// 에러 심각도 레벨
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical, // 시스템 장애
    High,     // 무결성/쿼리 실패
    Medium,   // 입력값 오류
    Low,      // 일반적인 경고
}

impl DbError {
    /// 에러의 심각도를 반환합니다.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DbError::Configuration(_)
            | DbError::Connection { .. }
            | DbError::MigrationIo { .. }
            | DbError::Migration { .. }
            | DbError::ChecksumMismatch { .. }
            | DbError::InvalidPolicy { .. } => ErrorSeverity::Critical,

            DbError::Query(_) | DbError::UnexpectedRowCount(_) | DbError::StoreNotInitialised => {
                ErrorSeverity::High
            }

            DbError::UnknownConfigKey(_)
            | DbError::InvalidConfigValue { .. }
            | DbError::InvalidAttribute(_) => ErrorSeverity::Medium,

            DbError::Interrupted | DbError::NotFound(_) => ErrorSeverity::Low,
        }
    }

    /// Whether the error is a caller input problem rather than a system fault.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DbError::UnknownConfigKey(_)
                | DbError::InvalidConfigValue { .. }
                | DbError::InvalidAttribute(_)
        )
    }

    /// 에러를 심각도에 맞는 레벨로 로깅합니다.
    pub fn log(&self, context: &str) {
        match self.severity() {
            ErrorSeverity::Critical => error!("[CRITICAL] {} - {}", context, self),
            ErrorSeverity::High => error!("[HIGH] {} - {}", context, self),
            ErrorSeverity::Medium => warn!("[MEDIUM] {} - {}", context, self),
            ErrorSeverity::Low => info!("[LOW] {} - {}", context, self),
        }
    }
}

/// 서비스 경계에서 노출되는 닫힌 에러 집합
///
/// 드라이버 에러 원문은 이 경계를 넘지 않습니다.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal server error")]
    Internal,
}

impl AppError {
    /// Translates an internal error, logging the original once.
    pub fn translate(err: DbError, context: &str) -> Self {
        err.log(context);
        match err {
            DbError::NotFound(what) => AppError::NotFound(what),
            DbError::Query(sqlx::Error::RowNotFound) => {
                AppError::NotFound("Database record not found".to_string())
            }
            e if e.is_validation() => AppError::InvalidInput(e.to_string()),
            _ => AppError::Internal,
        }
    }
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        AppError::translate(err, "service")
    }
}
