//! 트랜잭션 인식 TTL 캐시
//!
//! 도메인 설정 캐시와 소유자별 속성 캐시를 제공합니다.

pub mod attributes;
pub mod domain_config;
pub mod scoped;

pub use attributes::AttributeCache;
pub use domain_config::DomainConfigCache;
pub use scoped::{CacheStats, KeyLock, ScopedCache};

/// User attributes table, owner column `user_id`
pub const USER_ATTRS_TABLE: &str = "cm_user_attrs";

/// Domain attributes table, owner column `domain_id`
pub const DOMAIN_ATTRS_TABLE: &str = "cm_domain_attrs";
