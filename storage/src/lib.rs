//! 댓글 호스팅 백엔드의 영속성 계층
//!
//! - `service::db`: 연결 관리, 문장 빌더, 트랜잭션, 스키마 마이그레이션
//! - `service::config`: 타입 검증 설정 저장소와 기본값 상속
//! - `service::cache`: 트랜잭션 롤백 시 자가 복구되는 TTL 캐시
//! - `service_factory`: 위 구성요소를 묶는 `ServiceContext`

pub mod config;
pub mod logging;
pub mod service;
pub mod service_factory;
pub mod tool;

pub use service_factory::ServiceContext;
pub use tool::error::{AppError, DbError};
