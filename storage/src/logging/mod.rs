//! 통합 로깅 시스템
//!
//! `tracing` 구독자를 한 번만 설치합니다. 두 번째 호출부터는 아무것도 하지 않습니다.
//!
//! # 사용 예시
//! ```no_run
//! use storage::logging::{init_logging, LoggingConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LoggingConfig::from_env())?;
//!     tracing::info!("storage ready");
//!     Ok(())
//! }
//! ```

pub mod config;

pub use config::LoggingConfig;

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::fmt::time::{ChronoLocal, ChronoUtc};
use tracing_subscriber::EnvFilter;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// 로깅 시스템 초기화 함수
///
/// `RUST_LOG`가 설정되어 있으면 `config.level`보다 우선합니다.
///
/// # Returns
/// 이번 호출에서 구독자가 설치되었으면 `true`
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    config.validate()?;
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = match (config.json_format, config.use_utc) {
        (true, true) => builder.json().with_timer(ChronoUtc::rfc_3339()).try_init(),
        (true, false) => builder.json().with_timer(ChronoLocal::rfc_3339()).try_init(),
        (false, true) => builder.with_timer(ChronoUtc::rfc_3339()).try_init(),
        (false, false) => builder.with_timer(ChronoLocal::rfc_3339()).try_init(),
    };

    // Another global subscriber (e.g. a test harness) already owns the slot.
    Ok(installed.is_ok())
}
