//! 디코딩된 Binlog 이벤트 타입 및 데이터 구조 정의

use crate::offset::BinlogPosition;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 모든 이벤트가 공통으로 갖는 위치/시간 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventHeader {
    /// 이벤트가 속한 binlog 파일
    pub log_file: String,
    /// 이벤트 끝 위치 (= 다음 이벤트 시작 위치)
    pub log_pos: u64,
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
}

impl EventHeader {
    pub fn new(log_file: impl Into<String>, log_pos: u64, timestamp: u32) -> Self {
        EventHeader {
            log_file: log_file.into(),
            log_pos,
            timestamp,
        }
    }

    pub fn position(&self) -> BinlogPosition {
        BinlogPosition::new(self.log_file.clone(), self.log_pos)
    }
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    /// 데이터베이스명 (없으면 빈 문자열)
    pub schema: String,
    /// 쿼리 문자열
    pub query: String,
}

impl QueryEventData {
    pub fn is_begin(&self) -> bool {
        self.query.trim().eq_ignore_ascii_case("BEGIN")
    }
}

/// 행 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(OperationType::Insert),
            "UPDATE" => Some(OperationType::Update),
            "DELETE" => Some(OperationType::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 컬럼 타입 (`DATA_TYPE`, `COLUMN_TYPE`)
///
/// binlog 값만으로는 TIMESTAMP 와 문자열, unsigned 와 signed 정수를 구분할 수 없다.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnType {
    /// 소문자 `DATA_TYPE` (e.g. "timestamp", "bigint")
    pub data_type: String,
    pub unsigned: bool,
}

impl ColumnType {
    pub fn new(data_type: &str, column_type: &str) -> Self {
        ColumnType {
            data_type: data_type.trim().to_ascii_lowercase(),
            unsigned: column_type.to_ascii_lowercase().contains("unsigned"),
        }
    }

    pub fn is_timestamp(&self) -> bool {
        self.data_type == "timestamp"
    }

    /// 정수 컬럼의 비트 폭
    pub fn integer_bits(&self) -> Option<u32> {
        match self.data_type.as_str() {
            "tinyint" => Some(8),
            "smallint" => Some(16),
            "mediumint" => Some(24),
            "int" | "integer" => Some(32),
            "bigint" => Some(64),
            _ => None,
        }
    }
}

/// 테이블 메타데이터 (INFORMATION_SCHEMA 기준)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMeta {
    /// 컬럼명 (ordinal 순서)
    pub columns: Vec<String>,
    /// `columns` 와 같은 순서의 타입. 비어 있을 수 있다.
    pub column_types: Vec<ColumnType>,
    /// 기본키 컬럼들
    pub primary_key: Vec<String>,
    /// auto_increment 컬럼
    pub auto_increment: Option<String>,
}

impl TableMeta {
    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|c| c == column)
    }

    pub fn column_type(&self, index: usize) -> Option<&ColumnType> {
        self.column_types.get(index)
    }
}

/// 셀 값 (다양한 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    /// 'YYYY-MM-DD HH:MM:SS[.ffffff]'
    DateTime(String),
    Date(String),
    Time(String),
    Decimal(String),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// 조건식 비교용 텍스트 표현
    pub fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Int64(i) => Some(i.to_string()),
            CellValue::UInt64(u) => Some(u.to_string()),
            CellValue::Float(f) => Some(f.to_string()),
            CellValue::Double(d) => Some(d.to_string()),
            CellValue::String(s)
            | CellValue::DateTime(s)
            | CellValue::Date(s)
            | CellValue::Time(s)
            | CellValue::Decimal(s) => Some(s.clone()),
            CellValue::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            CellValue::Json(v) => Some(v.to_string()),
        }
    }

    /// SQL 리터럴로 렌더링. 결과는 항상 한 줄이다.
    pub fn to_sql_literal(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Int64(i) => i.to_string(),
            CellValue::UInt64(u) => u.to_string(),
            CellValue::Float(f) => f.to_string(),
            CellValue::Double(d) => d.to_string(),
            CellValue::Decimal(s) => s.clone(),
            CellValue::String(s)
            | CellValue::DateTime(s)
            | CellValue::Date(s)
            | CellValue::Time(s) => quote_string(s),
            CellValue::Json(v) => quote_string(&v.to_string()),
            CellValue::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => quote_string(s),
                Err(_) if b.is_empty() => "''".to_string(),
                Err(_) => {
                    let hex: String = b.iter().map(|byte| format!("{:02X}", byte)).collect();
                    format!("0x{}", hex)
                }
            },
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql_literal())
    }
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '\x1a' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// 컬럼 순서를 보존하는 행 이미지
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowImage(Vec<(String, CellValue)>);

impl RowImage {
    pub fn new(columns: Vec<(String, CellValue)>) -> Self {
        RowImage(columns)
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.0.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.0.iter().map(|(name, v)| (name.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 조건을 만족하는 컬럼만 남긴 새 이미지
    pub fn retain<F>(&self, mut keep: F) -> RowImage
    where
        F: FnMut(&str) -> bool,
    {
        RowImage(
            self.0
                .iter()
                .filter(|(name, _)| keep(name))
                .cloned()
                .collect(),
        )
    }
}

impl FromIterator<(String, CellValue)> for RowImage {
    fn from_iter<I: IntoIterator<Item = (String, CellValue)>>(iter: I) -> Self {
        RowImage(iter.into_iter().collect())
    }
}

/// 한 행의 변경 (RowChange)
#[derive(Debug, Clone)]
pub struct RowChange {
    pub op: OperationType,
    pub schema: String,
    pub table: String,
    /// 변경 전 데이터 (UPDATE/DELETE)
    pub before: Option<RowImage>,
    /// 변경 후 데이터 (INSERT/UPDATE)
    pub after: Option<RowImage>,
    /// 원본 이벤트 위치
    pub position: BinlogPosition,
    pub table_meta: Arc<TableMeta>,
}

/// 행 이벤트 하나 (여러 행 포함 가능)
#[derive(Debug, Clone)]
pub struct RowsEventData {
    pub op: OperationType,
    pub schema: String,
    pub table: String,
    pub rows: Vec<RowChange>,
    /// 디코딩 단계에서 버려진 행 수 (e.g. JSON 바이너리 값)
    pub skipped_rows: u64,
}

/// 엔진이 소비하는 디코딩된 이벤트
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Rotate {
        header: EventHeader,
        next_binlog: String,
    },
    FormatDescription(EventHeader),
    Gtid {
        header: EventHeader,
        gtid: String,
    },
    Query {
        header: EventHeader,
        data: QueryEventData,
    },
    TableMap {
        header: EventHeader,
        schema: String,
        table: String,
    },
    Rows {
        header: EventHeader,
        data: RowsEventData,
    },
    Xid(EventHeader),
    /// 엔진이 다루지 않는 기타 이벤트 (위치 추적만)
    Other(EventHeader),
}

impl SourceEvent {
    pub fn header(&self) -> &EventHeader {
        match self {
            SourceEvent::Rotate { header, .. }
            | SourceEvent::Gtid { header, .. }
            | SourceEvent::Query { header, .. }
            | SourceEvent::TableMap { header, .. }
            | SourceEvent::Rows { header, .. } => header,
            SourceEvent::FormatDescription(header)
            | SourceEvent::Xid(header)
            | SourceEvent::Other(header) => header,
        }
    }

    /// 페이로드가 없는 제어 이벤트 (위치 추적에서 제외)
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            SourceEvent::Rotate { .. } | SourceEvent::FormatDescription(_)
        )
    }
}
