//! 데이터베이스 서비스 모듈
//!
//! PostgreSQL/SQLite 데이터베이스와의 모든 상호작용을 처리합니다.
//! 연결, 문장 빌더, 트랜잭션, 마이그레이션이 `core` 아래에 분리되어 있습니다.

pub mod core;

// 핵심 컴포넌트들 내보내기
pub use core::{
    // 설정 관련
    config::{CacheConfig, DbServiceConfig, MigrationConfig, PoolConfig, QueryConfig},
    // 연결 관리
    connection::ConnectionManager,
    // 방언
    dialect::Dialect,
    // 쿼리 실행
    executor::{verify_one, DbExecutor},
    // 마이그레이션
    migration::{MigrationEngine, MigrationOutcome, MigrationReport, MismatchPolicy},
    // 문장 빌더
    statement::{DeleteBuilder, InsertBuilder, SelectBuilder, Statement, UpdateBuilder},
    // 트랜잭션 관리
    transaction::{participant_key, TransactionManager, Tx, TxParticipant, TxState},
    // 데이터 타입들
    types::{ConnectionStats, MigrationLogEntry, MigrationRecord, MigrationStatus, SqlValue},
};
