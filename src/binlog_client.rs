//! Binlog 이벤트 소스
//!
//! `mysql_async` 의 binlog 스트림을 읽어 엔진이 소비하는 [`SourceEvent`] 로 바꾼다.
//! 행 이벤트의 컬럼 이름 / 기본키는 메타데이터 연결로 조회해 테이블별로 캐시하고,
//! DDL 을 만나면 캐시를 비운다.

use crate::connection::{ConnectionConfig, MySqlConnection};
use crate::error::{BinlogSqlError, Result};
use crate::events::{
    CellValue, ColumnType, EventHeader, OperationType, QueryEventData, RowChange, RowImage,
    RowsEventData, SourceEvent, TableMeta,
};
use crate::offset::BinlogPosition;
use crate::window::TIME_FORMAT;
use async_trait::async_trait;
use chrono::{Local, TimeZone};
use futures_util::StreamExt;
use mysql_async::binlog::events::{Event, EventData, RowsEventData as RawRowsEvent};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::{BinlogStream, BinlogStreamRequest, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 엔진이 이벤트를 당겨오는 소스
#[async_trait]
pub trait EventSource: Send {
    /// 다음 이벤트. 스트림이 끝나면 `None`.
    async fn next_event(&mut self) -> Result<Option<SourceEvent>>;

    async fn close(&mut self) -> Result<()>;
}

/// 스키마 / 테이블 포함·제외 필터
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    pub only_schemas: Vec<String>,
    pub only_tables: Vec<String>,
    pub ignore_schemas: Vec<String>,
    pub ignore_tables: Vec<String>,
}

impl TableFilter {
    pub fn accepts(&self, schema: &str, table: &str) -> bool {
        if !self.only_schemas.is_empty() && !self.only_schemas.iter().any(|s| s == schema) {
            return false;
        }
        if !self.only_tables.is_empty() && !self.only_tables.iter().any(|t| t == table) {
            return false;
        }
        !self.ignore_schemas.iter().any(|s| s == schema)
            && !self.ignore_tables.iter().any(|t| t == table)
    }
}

/// MySQL 서버에서 직접 binlog 를 읽는 소스
pub struct MySqlBinlogSource {
    stream: Option<BinlogStream>,
    meta: Option<MySqlConnection>,
    filter: TableFilter,
    current_file: String,
    table_cache: HashMap<(String, String), Arc<TableMeta>>,
}

impl MySqlBinlogSource {
    /// `start` 위치부터 binlog 덤프를 시작한다
    pub async fn open(
        config: &ConnectionConfig,
        server_id: u32,
        start: &BinlogPosition,
        filter: TableFilter,
    ) -> Result<Self> {
        let meta = MySqlConnection::connect(config).await?;
        let conn = config.open().await?;

        let request = BinlogStreamRequest::new(server_id)
            .with_filename(start.filename.as_bytes())
            .with_pos(start.position);
        let stream = conn.get_binlog_stream(request).await?;
        info!("Binlog streaming started from {}", start);

        Ok(MySqlBinlogSource {
            stream: Some(stream),
            meta: Some(meta),
            filter,
            current_file: start.filename.clone(),
            table_cache: HashMap::new(),
        })
    }

    async fn table_meta(&mut self, schema: &str, table: &str) -> Result<Arc<TableMeta>> {
        let key = (schema.to_string(), table.to_string());
        if let Some(meta) = self.table_cache.get(&key) {
            return Ok(meta.clone());
        }
        let conn = self
            .meta
            .as_mut()
            .ok_or_else(|| BinlogSqlError::Connection("metadata connection is closed".into()))?;
        let meta = Arc::new(conn.get_table_meta(schema, table).await?);
        debug!("Loaded metadata for `{}`.`{}`", schema, table);
        self.table_cache.insert(key, meta.clone());
        Ok(meta)
    }

    /// 행 이벤트의 테이블 이름 (table map 이벤트에서)
    fn table_names(&self, table_id: u64) -> Option<(String, String)> {
        let tme = self.stream.as_ref()?.get_tme(table_id)?;
        Some((
            tme.database_name().into_owned(),
            tme.table_name().into_owned(),
        ))
    }

    fn decode_rows(
        &self,
        event: &Event,
        header: &EventHeader,
        schema: &str,
        table: &str,
        meta: &Arc<TableMeta>,
    ) -> Result<Option<RowsEventData>> {
        let rows_event = match event.read_data()? {
            Some(EventData::RowsEvent(rows_event)) => rows_event,
            _ => return Ok(None),
        };
        let op = operation(&rows_event);
        let tme = self
            .stream
            .as_ref()
            .and_then(|s| s.get_tme(rows_event.table_id()))
            .ok_or_else(|| {
                BinlogSqlError::Query(format!(
                    "no table map for table id {} at {}",
                    rows_event.table_id(),
                    header.position()
                ))
            })?;

        let mut rows = Vec::new();
        let mut skipped_rows = 0;
        for row in rows_event.rows(tme) {
            let (before, after) = row?;
            match row_images(before.as_ref(), after.as_ref(), meta) {
                Ok((before, after)) => rows.push(RowChange {
                    op,
                    schema: schema.to_string(),
                    table: table.to_string(),
                    before,
                    after,
                    position: header.position(),
                    table_meta: meta.clone(),
                }),
                Err(e) => {
                    warn!("Skipping row of `{}`.`{}` at {}: {}", schema, table, header.position(), e);
                    skipped_rows += 1;
                }
            }
        }

        Ok(Some(RowsEventData {
            op,
            schema: schema.to_string(),
            table: table.to_string(),
            rows,
            skipped_rows,
        }))
    }
}

/// 디코딩 후 비동기 후처리가 필요한 이벤트
enum Decoded {
    Ready(SourceEvent),
    Rows { header: EventHeader, table_id: u64 },
}

#[async_trait]
impl EventSource for MySqlBinlogSource {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(None),
        };
        let event = match stream.next().await {
            Some(event) => event?,
            None => {
                info!("Binlog stream ended");
                return Ok(None);
            }
        };

        let raw = event.header();
        let mut header = EventHeader::new(
            self.current_file.clone(),
            u64::from(raw.log_pos()),
            raw.timestamp(),
        );

        let decoded = match event.read_data()? {
            Some(EventData::RotateEvent(rotate)) => {
                let next_binlog = rotate.name().into_owned();
                debug!("Rotate to {}:{}", next_binlog, rotate.position());
                self.current_file = next_binlog.clone();
                header.log_file = next_binlog.clone();
                header.log_pos = rotate.position();
                Decoded::Ready(SourceEvent::Rotate {
                    header,
                    next_binlog,
                })
            }
            Some(EventData::FormatDescriptionEvent(_)) => {
                Decoded::Ready(SourceEvent::FormatDescription(header))
            }
            Some(EventData::GtidEvent(gtid)) => {
                let gtid = format!("{}:{}", Uuid::from_bytes(gtid.sid()), gtid.gno());
                Decoded::Ready(SourceEvent::Gtid { header, gtid })
            }
            Some(EventData::QueryEvent(query)) => {
                let data = QueryEventData {
                    schema: query.schema().into_owned(),
                    query: query.query().into_owned(),
                };
                if !data.is_begin() && !data.query.trim().eq_ignore_ascii_case("COMMIT") {
                    // 테이블 정의가 바뀌었을 수 있다
                    self.table_cache.clear();
                }
                Decoded::Ready(SourceEvent::Query { header, data })
            }
            Some(EventData::TableMapEvent(tme)) => Decoded::Ready(SourceEvent::TableMap {
                header,
                schema: tme.database_name().into_owned(),
                table: tme.table_name().into_owned(),
            }),
            Some(EventData::RowsEvent(rows_event)) => Decoded::Rows {
                header,
                table_id: rows_event.table_id(),
            },
            Some(EventData::XidEvent(_)) => Decoded::Ready(SourceEvent::Xid(header)),
            _ => Decoded::Ready(SourceEvent::Other(header)),
        };

        let (header, table_id) = match decoded {
            Decoded::Ready(event) => return Ok(Some(event)),
            Decoded::Rows { header, table_id } => (header, table_id),
        };

        let (schema, table) = self.table_names(table_id).ok_or_else(|| {
            BinlogSqlError::Query(format!(
                "no table map for table id {} at {}",
                table_id,
                header.position()
            ))
        })?;
        if !self.filter.accepts(&schema, &table) {
            return Ok(Some(SourceEvent::Other(header)));
        }

        let meta = self.table_meta(&schema, &table).await?;
        match self.decode_rows(&event, &header, &schema, &table, &meta)? {
            Some(data) => Ok(Some(SourceEvent::Rows { header, data })),
            None => Ok(Some(SourceEvent::Other(header))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.close().await?;
        }
        if let Some(meta) = self.meta.take() {
            meta.close().await?;
        }
        debug!("Binlog source closed");
        Ok(())
    }
}

fn operation(rows_event: &RawRowsEvent<'_>) -> OperationType {
    match rows_event {
        RawRowsEvent::WriteRowsEvent(_) | RawRowsEvent::WriteRowsEventV1(_) => {
            OperationType::Insert
        }
        RawRowsEvent::DeleteRowsEvent(_) | RawRowsEvent::DeleteRowsEventV1(_) => {
            OperationType::Delete
        }
        _ => OperationType::Update,
    }
}

fn row_images(
    before: Option<&BinlogRow>,
    after: Option<&BinlogRow>,
    meta: &TableMeta,
) -> Result<(Option<RowImage>, Option<RowImage>)> {
    let before = before.map(|r| row_image(r, meta)).transpose()?;
    let after = after.map(|r| row_image(r, meta)).transpose()?;
    Ok((before, after))
}

/// binlog 행 → 컬럼 이름이 붙은 이미지. 이름은 INFORMATION_SCHEMA 순서를 따른다.
fn row_image(row: &BinlogRow, meta: &TableMeta) -> Result<RowImage> {
    (0..row.len())
        .map(|i| {
            let name = meta
                .columns
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("@{}", i));
            let value = match row.as_ref(i) {
                Some(BinlogValue::Value(value)) => cell_value(value, meta.column_type(i)),
                Some(_) => {
                    return Err(BinlogSqlError::row(format!(
                        "column `{}` holds a JSON binary value, which is not supported",
                        name
                    )))
                }
                None => CellValue::Null,
            };
            Ok((name, value))
        })
        .collect()
}

/// binlog 값 → 셀. 컬럼 타입을 알면 TIMESTAMP 와 unsigned 정수를 바로잡는다.
pub(crate) fn cell_value(value: &Value, column: Option<&ColumnType>) -> CellValue {
    if let Some(column) = column {
        if column.is_timestamp() {
            if let Some(cell) = timestamp_cell(value) {
                return cell;
            }
        }
        if let (true, Value::Int(i), Some(bits)) = (column.unsigned, value, column.integer_bits()) {
            return CellValue::UInt64(unsigned_from_signed(*i, bits));
        }
    }

    match value {
        Value::NULL => CellValue::Null,
        Value::Int(i) => CellValue::Int64(*i),
        Value::UInt(u) => CellValue::UInt64(*u),
        Value::Float(f) => CellValue::Float(*f),
        Value::Double(d) => CellValue::Double(*d),
        Value::Bytes(bytes) => match String::from_utf8(bytes.clone()) {
            Ok(s) => CellValue::String(s),
            Err(_) => CellValue::Bytes(bytes.clone()),
        },
        Value::Date(year, month, day, 0, 0, 0, 0) => {
            CellValue::Date(format!("{:04}-{:02}-{:02}", year, month, day))
        }
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let mut text = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            );
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            CellValue::DateTime(text)
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let hours = u64::from(*days) * 24 + u64::from(*hours);
            let mut text = format!(
                "{}{:02}:{:02}:{:02}",
                if *negative { "-" } else { "" },
                hours,
                minutes,
                seconds
            );
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            CellValue::Time(text)
        }
    }
}

/// TIMESTAMP 는 epoch 초 (`"1700000000"` 또는 `"1700000000.123"`) 로 디코딩된다.
/// 로컬 시각 리터럴로 바꾼다.
fn timestamp_cell(value: &Value) -> Option<CellValue> {
    let text = match value {
        Value::Bytes(bytes) => std::str::from_utf8(bytes).ok()?.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        _ => return None,
    };
    let (seconds, fraction) = match text.split_once('.') {
        Some((seconds, fraction)) => (seconds, Some(fraction)),
        None => (text.as_str(), None),
    };
    let seconds: i64 = seconds.parse().ok()?;
    if seconds == 0 {
        return Some(CellValue::DateTime("0000-00-00 00:00:00".to_string()));
    }

    let mut literal = Local
        .timestamp_opt(seconds, 0)
        .single()?
        .naive_local()
        .format(TIME_FORMAT)
        .to_string();
    if let Some(fraction) = fraction.filter(|f| !f.is_empty()) {
        literal.push('.');
        literal.push_str(fraction);
    }
    Some(CellValue::DateTime(literal))
}

/// 메타데이터 없이 기록된 unsigned 정수는 signed 로 읽힌다
fn unsigned_from_signed(value: i64, bits: u32) -> u64 {
    if value >= 0 || bits >= 64 {
        value as u64
    } else {
        (value + (1i64 << bits)) as u64
    }
}

/// 미리 디코딩된 이벤트 목록을 순서대로 돌려주는 소스
#[derive(Debug, Default)]
pub struct MemoryEventSource {
    events: VecDeque<SourceEvent>,
    closed: bool,
}

impl MemoryEventSource {
    pub fn new(events: impl IntoIterator<Item = SourceEvent>) -> Self {
        MemoryEventSource {
            events: events.into_iter().collect(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.events.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_filter() {
        let filter = TableFilter {
            only_schemas: vec!["shop".into()],
            ignore_tables: vec!["audit".into()],
            ..Default::default()
        };
        assert!(filter.accepts("shop", "orders"));
        assert!(!filter.accepts("crm", "orders"));
        assert!(!filter.accepts("shop", "audit"));
        assert!(TableFilter::default().accepts("any", "thing"));
    }

    #[test]
    fn test_cell_value_conversion() {
        assert_eq!(cell_value(&Value::NULL, None), CellValue::Null);
        assert_eq!(cell_value(&Value::Int(-3), None), CellValue::Int64(-3));
        assert_eq!(
            cell_value(&Value::Bytes(b"abc".to_vec()), None),
            CellValue::String("abc".into())
        );
        assert_eq!(
            cell_value(&Value::Bytes(vec![0xff, 0xfe]), None),
            CellValue::Bytes(vec![0xff, 0xfe])
        );
        assert_eq!(
            cell_value(&Value::Date(2024, 3, 9, 0, 0, 0, 0), None),
            CellValue::Date("2024-03-09".into())
        );
        assert_eq!(
            cell_value(&Value::Date(2024, 3, 9, 13, 5, 7, 120), None),
            CellValue::DateTime("2024-03-09 13:05:07.000120".into())
        );
        assert_eq!(
            cell_value(&Value::Time(true, 1, 2, 3, 4, 0), None),
            CellValue::Time("-26:03:04".into())
        );
    }

    fn typed_row(created_at: CellValue) -> RowChange {
        let meta = Arc::new(TableMeta {
            columns: vec!["id".into(), "created_at".into()],
            column_types: vec![
                ColumnType::new("bigint", "bigint(20)"),
                ColumnType::new("timestamp", "timestamp"),
            ],
            primary_key: vec!["id".into()],
            auto_increment: None,
        });
        let after: RowImage = vec![
            ("id".to_string(), CellValue::Int64(1)),
            ("created_at".to_string(), created_at),
        ]
        .into_iter()
        .collect();
        RowChange {
            op: OperationType::Insert,
            schema: "db".into(),
            table: "t".into(),
            before: None,
            after: Some(after),
            position: BinlogPosition::new("mysql-bin.000001", 400),
            table_meta: meta,
        }
    }

    #[test]
    fn test_timestamp_becomes_local_datetime() {
        let expected = Local
            .timestamp_opt(1_700_000_000, 0)
            .unwrap()
            .naive_local()
            .format(TIME_FORMAT)
            .to_string();
        let ts = ColumnType::new("timestamp", "timestamp");
        assert_eq!(
            cell_value(&Value::Bytes(b"1700000000".to_vec()), Some(&ts)),
            CellValue::DateTime(expected.clone())
        );
        assert_eq!(
            cell_value(&Value::Bytes(b"1700000000.250".to_vec()), Some(&ts)),
            CellValue::DateTime(format!("{}.250", expected))
        );
        assert_eq!(
            cell_value(&Value::Bytes(b"0".to_vec()), Some(&ts)),
            CellValue::DateTime("0000-00-00 00:00:00".into())
        );
        // 타입을 모르면 문자열 그대로
        assert_eq!(
            cell_value(&Value::Bytes(b"1700000000".to_vec()), None),
            CellValue::String("1700000000".into())
        );
    }

    #[test]
    fn test_flashback_of_timestamp_insert_matches_the_row() {
        use crate::options::ReconstructionOptions;
        use crate::sql_builder::{SqlBuilder, StatementContext};
        use crate::window::fallback_event_time;

        let ts = ColumnType::new("timestamp", "timestamp");
        let created_at = cell_value(&Value::Bytes(b"1700000000".to_vec()), Some(&ts));
        let literal = created_at.to_sql_literal();
        let row = typed_row(created_at);
        let ctx = StatementContext {
            tx_start_pos: 120,
            event_end: BinlogPosition::new("mysql-bin.000001", 400),
            event_time: fallback_event_time(),
            gtid: None,
        };

        let forward = ReconstructionOptions::builder().need_comment(false).build().unwrap();
        let stmt = SqlBuilder::new(&forward).build_row(&row, &ctx).unwrap().unwrap();
        assert_eq!(
            stmt.sql,
            format!("INSERT INTO `db`.`t` (`id`,`created_at`) VALUES (1,{});", literal)
        );

        let flashback = ReconstructionOptions::builder()
            .flashback(true)
            .need_comment(false)
            .build()
            .unwrap();
        let stmt = SqlBuilder::new(&flashback).build_row(&row, &ctx).unwrap().unwrap();
        assert_eq!(
            stmt.sql,
            format!("DELETE FROM `db`.`t` WHERE `id`=1 AND `created_at`={};", literal)
        );
        assert_ne!(literal, "'1700000000'");
    }

    #[test]
    fn test_unsigned_integers_are_reinterpreted() {
        let big = ColumnType::new("bigint", "bigint(20) unsigned");
        assert_eq!(
            cell_value(&Value::Int(-1), Some(&big)),
            CellValue::UInt64(u64::MAX)
        );
        assert_eq!(
            cell_value(&Value::Int(i64::MIN), Some(&big)),
            CellValue::UInt64(1 << 63)
        );
        let int = ColumnType::new("int", "int(10) unsigned");
        assert_eq!(
            cell_value(&Value::Int(-1), Some(&int)),
            CellValue::UInt64(u64::from(u32::MAX))
        );
        let tiny = ColumnType::new("tinyint", "tinyint(3) unsigned");
        assert_eq!(cell_value(&Value::Int(-56), Some(&tiny)), CellValue::UInt64(200));
        let signed = ColumnType::new("int", "int(11)");
        assert_eq!(cell_value(&Value::Int(-1), Some(&signed)), CellValue::Int64(-1));
    }

    #[tokio::test]
    async fn test_memory_source_stops_after_close() {
        let mut source = MemoryEventSource::new(vec![
            SourceEvent::Xid(EventHeader::new("mysql-bin.000001", 100, 0)),
            SourceEvent::Xid(EventHeader::new("mysql-bin.000001", 200, 0)),
        ]);
        assert!(source.next_event().await.unwrap().is_some());
        source.close().await.unwrap();
        assert!(source.is_closed());
        assert!(source.next_event().await.unwrap().is_none());
    }
}
