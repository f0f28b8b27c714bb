//! 위치 / 시간 윈도우 필터
//!
//! 각 이벤트를 윈도우 이전, 윈도우 내부, 마지막 이벤트, 종료 중 하나로 분류한다.

use crate::error::{BinlogSqlError, Result};
use crate::events::EventHeader;
use crate::offset::BinlogPosition;
use chrono::{Local, NaiveDate, NaiveDateTime, TimeZone};

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 이벤트 분류 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// 시작 시간 이전 (건너뛰지만 위치는 추적)
    BeforeWindow,
    InWindow,
    /// 처리 후 스트림 종료 (종료 위치 또는 EOF 에 정확히 도달)
    InWindowLast,
    Terminate,
}

/// 시간 윈도우 (시작 포함, 종료 미포함), 로컬 시간 기준
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub stop: NaiveDateTime,
}

impl Default for TimeWindow {
    fn default() -> Self {
        TimeWindow {
            start: fallback_event_time(),
            stop: NaiveDate::from_ymd_opt(2999, 12, 31)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or(NaiveDateTime::MAX),
        }
    }
}

impl TimeWindow {
    pub fn parse(start: Option<&str>, stop: Option<&str>) -> Result<Self> {
        let mut window = TimeWindow::default();
        if let Some(start) = start {
            window.start = parse_time(start)?;
        }
        if let Some(stop) = stop {
            window.stop = parse_time(stop)?;
        }
        if window.start > window.stop {
            return Err(BinlogSqlError::config(format!(
                "start time {} is after stop time {}",
                window.start, window.stop
            )));
        }
        Ok(window)
    }
}

fn parse_time(text: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text.trim(), TIME_FORMAT).map_err(|e| {
        BinlogSqlError::config(format!("invalid time '{}' (expected {}): {}", text, TIME_FORMAT, e))
    })
}

/// 표현할 수 없는 타임스탬프 대신 쓰는 과거 시각
pub fn fallback_event_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MIN)
}

/// 이벤트 타임스탬프 → 로컬 시각
pub fn event_time(timestamp: u32) -> NaiveDateTime {
    Local
        .timestamp_opt(i64::from(timestamp), 0)
        .single()
        .map(|dt| dt.naive_local())
        .unwrap_or_else(fallback_event_time)
}

/// 위치 + 시간 윈도우 필터
#[derive(Debug, Clone)]
pub struct PositionWindow {
    time: TimeWindow,
    end_file: String,
    end_pos: Option<u64>,
    /// 시작 시점에 조회한 서버의 현재 binlog 끝
    eof: Option<BinlogPosition>,
    /// 시작 파일 ~ 종료 파일 사이의 서버 binlog 파일들
    candidate_files: Vec<String>,
    stop_never: bool,
}

impl PositionWindow {
    pub fn new(
        time: TimeWindow,
        end_file: impl Into<String>,
        end_pos: Option<u64>,
        eof: Option<BinlogPosition>,
        candidate_files: Vec<String>,
    ) -> Self {
        PositionWindow {
            time,
            end_file: end_file.into(),
            end_pos,
            eof,
            candidate_files,
            stop_never: false,
        }
    }

    /// tail -f 모드: 모든 이벤트가 윈도우 내부
    pub fn stop_never(mut self, stop_never: bool) -> Self {
        self.stop_never = stop_never;
        self
    }

    pub fn classify(&self, header: &EventHeader) -> WindowDecision {
        if self.stop_never {
            return WindowDecision::InWindow;
        }

        let file = header.log_file.as_str();
        let pos = header.log_pos;
        let at_end = self.end_pos.map(|end| file == self.end_file && pos == end).unwrap_or(false);
        let at_eof = self.eof.as_ref().map(|eof| eof.is_at(file, pos)).unwrap_or(false);
        if at_end || at_eof {
            return WindowDecision::InWindowLast;
        }

        let time = event_time(header.timestamp);
        if time < self.time.start {
            return WindowDecision::BeforeWindow;
        }

        let outside_files = !self.candidate_files.iter().any(|f| f == file);
        let past_end = self
            .end_pos
            .map(|end| file == self.end_file && pos > end)
            .unwrap_or(false);
        let past_eof = self
            .eof
            .as_ref()
            .map(|eof| eof.filename == file && pos > eof.position)
            .unwrap_or(false);
        if outside_files || past_end || past_eof || time >= self.time.stop {
            return WindowDecision::Terminate;
        }

        WindowDecision::InWindow
    }
}

/// 서버의 binlog 목록에서 시작~종료 파일 사이의 파일들을 고른다
pub fn candidate_files(server_logs: &[String], start_file: &str, end_file: &str) -> Vec<String> {
    let start = crate::offset::file_sequence(start_file);
    let end = crate::offset::file_sequence(end_file);
    server_logs
        .iter()
        .filter(|name| {
            let seq = crate::offset::file_sequence(name);
            match (start, end, seq) {
                (Some(s), Some(e), Some(n)) => s <= n && n <= e,
                _ => name.as_str() == start_file || name.as_str() == end_file,
            }
        })
        .cloned()
        .collect()
}
