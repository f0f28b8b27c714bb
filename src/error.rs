//! binlog → SQL 변환 관련 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BinlogSqlError {
    /// 스트리밍 시작 전에 발견되는 설정 오류 (치명적)
    #[error("설정 에러: {0}")]
    Configuration(String),

    #[error("MySQL 연결 에러: {0}")]
    Connection(String),

    #[error("쿼리 실행 에러: {0}")]
    Query(String),

    /// 한 행의 SQL 재구성 실패. 해당 행만 건너뛴다.
    #[error("행 재구성 에러: {0}")]
    RowReconstruction(String),

    /// sync 대상에서의 실행 실패. 실행 전체를 중단한다.
    #[error("sync 실행 에러 ({position}, 트랜잭션 시작 {tx_start_pos}): {message}")]
    SinkExecution {
        position: String,
        tx_start_pos: u64,
        message: String,
    },

    #[error("GTID 처리 에러: {0}")]
    Gtid(String),

    #[error("I/O 에러: {0}")]
    Io(String),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<io::Error> for BinlogSqlError {
    fn from(err: io::Error) -> Self {
        BinlogSqlError::Io(err.to_string())
    }
}

impl From<mysql_async::Error> for BinlogSqlError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Server(e) => BinlogSqlError::Query(e.to_string()),
            other => BinlogSqlError::Connection(other.to_string()),
        }
    }
}

impl BinlogSqlError {
    pub fn config(msg: impl Into<String>) -> Self {
        BinlogSqlError::Configuration(msg.into())
    }

    pub fn row(msg: impl Into<String>) -> Self {
        BinlogSqlError::RowReconstruction(msg.into())
    }

    /// 실행을 중단해야 하는 에러인지 여부
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BinlogSqlError::RowReconstruction(_))
    }
}

pub type Result<T> = std::result::Result<T, BinlogSqlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_error_is_recoverable() {
        assert!(!BinlogSqlError::row("bad image").is_fatal());
        assert!(BinlogSqlError::config("missing start file").is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: BinlogSqlError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, BinlogSqlError::Io(_)));
    }
}
