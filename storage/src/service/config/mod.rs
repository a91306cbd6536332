//! 설정 저장소
//!
//! 인스턴스/도메인 수준의 타입 검증 설정 항목과 기본값 상속을 관리합니다.

pub mod defaults;
pub mod item;
pub mod store;

pub use defaults::{
    instance_defaults, DefaultSource, DerivedDefaults, DomainKey, InstanceKey, KeyMapping,
    StaticDefaults, DOMAIN_KEY_MAP,
};
pub use item::{ConfigItem, DataType};
pub use store::{ConfigStore, ConfigTable};

/// Instance-level settings table
pub const INSTANCE_CONFIG_TABLE: &str = "cm_configuration";

/// Per-domain overrides table, scoped by `domain_id`
pub const DOMAIN_CONFIG_TABLE: &str = "cm_domain_configuration";
