//! MySQL Binlog → SQL 재구성 (replay / flashback)
//!
//! 이 라이브러리는 MySQL 바이너리 로그를 읽어 변경 사항을 SQL 로 되돌려 놓습니다.
//! 주요 기능:
//! - 위치 / 시간 / GTID 범위로 이벤트 선택
//! - 행 이미지 → 정방향 SQL 또는 롤백 (flashback) SQL
//! - 트랜잭션 경계 추적 및 주석
//! - 파일, 테이블별 파일, 콘솔, 다른 서버로의 실시간 실행
//! - 제한된 메모리로 flashback 결과를 역순 출력
//! - 체크포인트 파일로 마지막 트랜잭션 이후부터 재시작

pub mod binlog_client;
pub mod cdc_engine;
pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod flashback;
pub mod gtid;
pub mod offset;
pub mod options;
pub mod predicate;
pub mod rename;
pub mod router;
pub mod sql_builder;
pub mod window;

pub use binlog_client::{EventSource, MySqlBinlogSource};
pub use cdc_engine::{CdcEngine, RunSummary, StopReason};
pub use checkpoint::Checkpoint;
pub use config::Config;
pub use connection::MySqlConnection;
pub use error::{BinlogSqlError, Result};
pub use events::{RowChange, SourceEvent};
pub use gtid::GtidSet;
pub use offset::BinlogPosition;
pub use options::ReconstructionOptions;
pub use sql_builder::GeneratedStatement;
