//! MySQL 데이터베이스 연결 관리
//!
//! 메타데이터 조회 (binlog 목록, 현재 위치, server_id, 테이블 컬럼) 와
//! sync 대상에 대한 실시간 실행을 담당한다.

use crate::error::{BinlogSqlError, Result};
use crate::events::{ColumnType, TableMeta};
use crate::offset::BinlogPosition;
use crate::router::SyncTarget;
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "127.0.0.1".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub(crate) fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .conn_ttl(Some(self.timeout))
            .into()
    }

    pub(crate) async fn open(&self) -> Result<Conn> {
        Conn::new(self.build_opts()).await.map_err(|e| {
            BinlogSqlError::Connection(format!(
                "Failed to connect to MySQL {}:{}: {}",
                self.hostname, self.port, e
            ))
        })
    }
}

/// 서버 버전에 따라 달라지는 binlog 관리 구문
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinlogStatements {
    pub status: &'static str,
    pub files: &'static str,
}

impl BinlogStatements {
    /// MySQL 8.2.0 이후 `SHOW MASTER ...` 구문이 `SHOW BINARY LOG(S) ...` 로 바뀌었다.
    /// MariaDB 는 버전 번호와 상관없이 예전 구문만 지원한다.
    pub fn for_version(version: &str) -> Self {
        let mariadb = version.to_ascii_lowercase().contains("mariadb");
        if !mariadb && parse_version(version) > (8, 2, 0) {
            BinlogStatements {
                status: "SHOW BINARY LOG STATUS",
                files: "SHOW BINARY LOGS",
            }
        } else {
            BinlogStatements {
                status: "SHOW MASTER STATUS",
                files: "SHOW MASTER LOGS",
            }
        }
    }
}

/// "8.0.35-log" → (8, 0, 35)
fn parse_version(version: &str) -> (u32, u32, u32) {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u32>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
    statements: Option<BinlogStatements>,
}

impl MySqlConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn = config.open().await?;
        debug!("Connected to {}:{}", config.hostname, config.port);
        Ok(MySqlConnection {
            conn,
            statements: None,
        })
    }

    async fn statements(&mut self) -> Result<BinlogStatements> {
        if let Some(statements) = self.statements {
            return Ok(statements);
        }
        let version: Option<String> = self.conn.query_first("SELECT VERSION()").await?;
        let version = version.unwrap_or_default();
        info!("MySQL server version: {}", version);
        let statements = BinlogStatements::for_version(&version);
        self.statements = Some(statements);
        Ok(statements)
    }

    /// 서버의 현재 binlog 끝 위치
    pub async fn get_binlog_status(&mut self) -> Result<BinlogPosition> {
        let statements = self.statements().await?;
        let row: Option<Row> = self.conn.query_first(statements.status).await?;
        let row = row.ok_or_else(|| {
            BinlogSqlError::config("binary logging is not enabled on the source server")
        })?;

        let file = column::<String>(&row, 0)?;
        let position = column::<u64>(&row, 1)?;
        Ok(BinlogPosition::new(file, position))
    }

    /// 서버에 남아 있는 binlog 파일 목록
    pub async fn get_binary_logs(&mut self) -> Result<Vec<String>> {
        let statements = self.statements().await?;
        let rows: Vec<Row> = self.conn.query(statements.files).await?;
        rows.iter().map(|row| column::<String>(row, 0)).collect()
    }

    /// MySQL 서버 정보 조회
    pub async fn get_server_id(&mut self) -> Result<u32> {
        let server_id: Option<u32> = self.conn.query_first("SELECT @@server_id").await?;
        match server_id {
            Some(id) if id != 0 => Ok(id),
            _ => Err(BinlogSqlError::config("missing server_id on the source server")),
        }
    }

    /// 테이블 컬럼 / 타입 / 기본키 / auto_increment 컬럼 조회
    pub async fn get_table_meta(&mut self, database: &str, table: &str) -> Result<TableMeta> {
        let rows: Vec<(String, String, String, String, String)> = self
            .conn
            .exec(
                "SELECT COLUMN_NAME, DATA_TYPE, COLUMN_TYPE, COLUMN_KEY, EXTRA \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (database, table),
            )
            .await?;

        let mut meta = TableMeta::default();
        for (name, data_type, column_type, column_key, extra) in rows {
            meta.column_types.push(ColumnType::new(&data_type, &column_type));
            if column_key.eq_ignore_ascii_case("PRI") {
                meta.primary_key.push(name.clone());
            }
            if extra.to_ascii_lowercase().contains("auto_increment") {
                meta.auto_increment = Some(name.clone());
            }
            meta.columns.push(name);
        }

        if meta.columns.is_empty() {
            warn!("No column metadata for `{}`.`{}`", database, table);
        }
        Ok(meta)
    }

    pub async fn close(self) -> Result<()> {
        self.conn.disconnect().await?;
        Ok(())
    }
}

fn column<T: FromValue>(row: &Row, index: usize) -> Result<T> {
    match row.get_opt::<T, usize>(index) {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(BinlogSqlError::Query(format!(
            "unexpected value in column {}: {}",
            index, e
        ))),
        None => Err(BinlogSqlError::Query(format!("missing column {}", index))),
    }
}

/// sync 대상 서버. 각 문장 실행 전에 ping 하고 끊겼으면 다시 연결한다.
pub struct MySqlSyncTarget {
    config: ConnectionConfig,
    conn: Option<Conn>,
}

impl MySqlSyncTarget {
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let conn = config.open().await?;
        info!(
            "Sync target connected: {}:{}/{}",
            config.hostname,
            config.port,
            config.database.as_deref().unwrap_or("")
        );
        Ok(MySqlSyncTarget {
            config,
            conn: Some(conn),
        })
    }
}

#[async_trait]
impl SyncTarget for MySqlSyncTarget {
    async fn ping_or_reconnect(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.as_mut() {
            if conn.ping().await.is_ok() {
                return Ok(());
            }
            warn!("Sync target connection lost, reconnecting");
        }
        self.conn = Some(self.config.open().await?);
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| BinlogSqlError::Connection("sync target is closed".into()))?;
        conn.query_drop(sql).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.disconnect().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "127.0.0.1");
        assert_eq!(config.port, 3306);
    }

    #[test]
    fn test_statements_follow_server_version() {
        assert_eq!(
            BinlogStatements::for_version("8.0.35-log").status,
            "SHOW MASTER STATUS"
        );
        assert_eq!(BinlogStatements::for_version("5.7.44").files, "SHOW MASTER LOGS");
        assert_eq!(BinlogStatements::for_version("8.2.0").files, "SHOW MASTER LOGS");
        assert_eq!(
            BinlogStatements::for_version("8.4.0").status,
            "SHOW BINARY LOG STATUS"
        );
        assert_eq!(BinlogStatements::for_version("9.0.1").files, "SHOW BINARY LOGS");

        let mariadb = BinlogStatements::for_version("10.11.6-MariaDB");
        assert_eq!(mariadb.status, "SHOW MASTER STATUS");
        assert_eq!(mariadb.files, "SHOW MASTER LOGS");
        assert_eq!(
            BinlogStatements::for_version("11.4.2-MariaDB-ubu2404-log").status,
            "SHOW MASTER STATUS"
        );
    }

    #[test]
    fn test_parse_version_suffixes() {
        assert_eq!(parse_version("8.0.35-0ubuntu0.22.04.1"), (8, 0, 35));
        assert_eq!(parse_version("10.11.6-MariaDB"), (10, 11, 6));
        assert_eq!(parse_version(""), (0, 0, 0));
    }
}
