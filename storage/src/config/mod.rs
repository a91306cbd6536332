//! 환경 설정
//!
//! `.env`/환경변수에서 데이터베이스 방언과 연결 정보를 읽습니다.

pub mod db;

pub use db::{DbConfig, PostgresConfig, SqliteConfig};
