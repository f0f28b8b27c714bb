//! Binlog 처리 위치 추적 (BinlogPosition 및 트랜잭션 경계)
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// MySQL binlog v4 는 4 바이트 매직 넘버 다음부터 이벤트가 시작된다
pub const BINLOG_START_POS: u64 = 4;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        file_sequence(&self.filename)
    }

    pub fn is_at(&self, filename: &str, position: u64) -> bool {
        self.filename == filename && self.position == position
    }
}

/// "mysql-bin.000123" → 123
pub fn file_sequence(filename: &str) -> Option<u64> {
    filename.rsplit('.').next().and_then(|s| s.parse().ok())
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file_sequence()
            .cmp(&other.file_sequence())
            .then_with(|| self.filename.cmp(&other.filename))
            .then_with(|| self.position.cmp(&other.position))
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// 트랜잭션 경계 추적기
///
/// `last_pos` 는 마지막으로 처리된 (제어 이벤트가 아닌) 이벤트의 끝 위치,
/// `tx_start_pos` 는 `BEGIN` 을 만났을 때의 `last_pos` 이다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionTracker {
    last_pos: u64,
    tx_start_pos: u64,
}

impl TransactionTracker {
    pub fn new(start_pos: u64) -> Self {
        TransactionTracker {
            last_pos: start_pos,
            tx_start_pos: start_pos,
        }
    }

    /// 이벤트 처리 완료 후 위치 갱신
    pub fn advance(&mut self, log_pos: u64) {
        self.last_pos = log_pos;
    }

    /// `BEGIN` 관측 시 호출
    pub fn begin_transaction(&mut self) {
        self.tx_start_pos = self.last_pos;
    }

    pub fn last_pos(&self) -> u64 {
        self.last_pos
    }

    pub fn tx_start_pos(&self) -> u64 {
        self.tx_start_pos
    }
}
