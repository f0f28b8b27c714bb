//! 생성된 SQL 의 출력 경로
//!
//! 실행마다 정확히 하나의 sink 만 활성화된다:
//! 단일 파일, 테이블별 파일, sync 대상 실시간 실행, 콘솔(기본).

use crate::error::{BinlogSqlError, Result};
use crate::sql_builder::GeneratedStatement;
use async_trait::async_trait;
use chrono::Local;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// 실시간 실행 대상 (두 번째 MySQL 서버)
#[async_trait]
pub trait SyncTarget: Send {
    /// 연결 상태 확인, 끊겼으면 재연결
    async fn ping_or_reconnect(&mut self) -> Result<()>;

    async fn execute(&mut self, sql: &str) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// 테이블별 파일 이름 규칙
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileNaming {
    /// `<schema>.<table>.<stamp>.sql`
    #[default]
    DateSuffix,
    /// `<stamp>.<schema>.<table>.sql`
    DatePrefix,
    /// `<schema>.<table>.sql`
    NoDate,
}

impl FileNaming {
    pub fn file_name(&self, schema: Option<&str>, table: Option<&str>, stamp: &str) -> String {
        let base = match (schema, table) {
            (Some(s), Some(t)) => format!("{}.{}", s, t),
            _ => "others".to_string(),
        };
        match self {
            FileNaming::DateSuffix => format!("{}.{}.sql", base, stamp),
            FileNaming::DatePrefix => format!("{}.{}.sql", stamp, base),
            FileNaming::NoDate => format!("{}.sql", base),
        }
    }
}

/// 동시에 열어 둘 테이블별 파일 수
pub const MAX_OPEN_FILES: usize = 64;

/// 최근에 쓴 파일만 열어 둔다. 한도를 넘으면 가장 오래 쓰지 않은 파일을 flush 하고 닫는다.
struct PerTableSink {
    dir: PathBuf,
    naming: FileNaming,
    stamp: String,
    max_open: usize,
    /// 앞쪽이 가장 오래 전에 쓴 파일
    files: VecDeque<(PathBuf, BufWriter<File>)>,
}

impl PerTableSink {
    fn write(&mut self, stmt: &GeneratedStatement, line: &str) -> io::Result<()> {
        let name = self
            .naming
            .file_name(stmt.schema.as_deref(), stmt.table.as_deref(), &self.stamp);
        let path = self.dir.join(name);

        let entry = match self.files.iter().position(|(p, _)| *p == path) {
            Some(idx) => self.files.remove(idx),
            None => None,
        };
        let entry = match entry {
            Some(entry) => entry,
            None => {
                while self.files.len() >= self.max_open.max(1) {
                    if let Some((old, mut writer)) = self.files.pop_front() {
                        writer.flush()?;
                        debug!("Closing per-table output {}", old.display());
                    }
                }
                debug!("Opening per-table output {}", path.display());
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                (path, BufWriter::new(file))
            }
        };
        self.files.push_back(entry);

        match self.files.back_mut() {
            Some((_, writer)) => writeln!(writer, "{}", line),
            None => Ok(()),
        }
    }

    fn open_files(&self) -> usize {
        self.files.len()
    }

    fn flush(&mut self) -> io::Result<()> {
        for (_, writer) in self.files.iter_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

enum Sink {
    Console(io::Stdout),
    SingleFile(BufWriter<File>),
    PerTable(PerTableSink),
    Live(Box<dyn SyncTarget>),
}

/// 출력 라우터
pub struct OutputRouter {
    sink: Sink,
    comments: bool,
    routed: u64,
}

impl OutputRouter {
    fn with_sink(sink: Sink, comments: bool) -> Self {
        OutputRouter {
            sink,
            comments,
            routed: 0,
        }
    }

    pub fn console(comments: bool) -> Self {
        Self::with_sink(Sink::Console(io::stdout()), comments)
    }

    /// 단일 파일 (append 모드로 한 번만 연다)
    pub fn single_file(path: impl AsRef<Path>, comments: bool) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Saving result into file: [{}]", path.display());
        Ok(Self::with_sink(Sink::SingleFile(BufWriter::new(file)), comments))
    }

    /// 테이블별 파일. 파일은 문장이 도착할 때 열리고 append 된다.
    pub fn per_table(dir: impl Into<PathBuf>, naming: FileNaming, comments: bool) -> Result<Self> {
        Self::per_table_with_limit(dir, naming, comments, MAX_OPEN_FILES)
    }

    pub fn per_table_with_limit(
        dir: impl Into<PathBuf>,
        naming: FileNaming,
        comments: bool,
        max_open: usize,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("Saving table per file into dir: [{}]", dir.display());
        Ok(Self::with_sink(
            Sink::PerTable(PerTableSink {
                dir,
                naming,
                stamp: Local::now().format("%Y%m%d%H%M%S").to_string(),
                max_open,
                files: VecDeque::new(),
            }),
            comments,
        ))
    }

    pub fn live(target: Box<dyn SyncTarget>) -> Self {
        Self::with_sink(Sink::Live(target), false)
    }

    pub fn is_live(&self) -> bool {
        matches!(self.sink, Sink::Live(_))
    }

    pub fn routed(&self) -> u64 {
        self.routed
    }

    /// 현재 열려 있는 출력 파일 수
    pub fn open_files(&self) -> usize {
        match &self.sink {
            Sink::SingleFile(_) => 1,
            Sink::PerTable(sink) => sink.open_files(),
            Sink::Console(_) | Sink::Live(_) => 0,
        }
    }

    /// 문장 하나를 활성 sink 로 보낸다. 실시간 실행 실패는 치명적이다.
    pub async fn route(&mut self, stmt: &GeneratedStatement) -> Result<()> {
        match &mut self.sink {
            Sink::Console(out) => {
                let mut lock = out.lock();
                writeln!(lock, "{}", stmt.render(self.comments))?;
            }
            Sink::SingleFile(writer) => {
                writeln!(writer, "{}", stmt.render(self.comments))?;
            }
            Sink::PerTable(sink) => {
                sink.write(stmt, &stmt.render(self.comments))?;
            }
            Sink::Live(target) => {
                let sql = strip_use_prefix(&stmt.sql);
                target.ping_or_reconnect().await?;
                if let Err(e) = target.execute(sql).await {
                    error!("Could not execute sql: {}", sql);
                    error!(
                        "Sync failed, resume from file {} start pos {} end pos {}",
                        stmt.position.filename, stmt.tx_start_pos, stmt.position.position
                    );
                    return Err(BinlogSqlError::SinkExecution {
                        position: stmt.position.to_string(),
                        tx_start_pos: stmt.tx_start_pos,
                        message: e.to_string(),
                    });
                }
            }
        }
        self.routed += 1;
        Ok(())
    }

    pub async fn route_all(&mut self, stmts: &[GeneratedStatement]) -> Result<()> {
        for stmt in stmts {
            self.route(stmt).await?;
        }
        Ok(())
    }

    /// 버퍼를 비우고 sink 를 닫는다
    pub async fn close(&mut self) -> Result<()> {
        match &mut self.sink {
            Sink::Console(out) => out.flush()?,
            Sink::SingleFile(writer) => writer.flush()?,
            Sink::PerTable(sink) => sink.flush()?,
            Sink::Live(target) => target.close().await?,
        }
        debug!("Output router closed after {} statements", self.routed);
        Ok(())
    }
}

/// 실시간 실행 시 `USE <schema>;\n` 접두어 제거
fn strip_use_prefix(sql: &str) -> &str {
    if sql.starts_with("USE ") {
        if let Some(idx) = sql.find(";\n") {
            return &sql[idx + 2..];
        }
    }
    sql
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::offset::BinlogPosition;
    use std::sync::{Arc, Mutex};

    /// 실행된 SQL 을 기록하는 가짜 sync 대상
    #[derive(Clone, Default)]
    pub(crate) struct RecordingTarget {
        pub executed: Arc<Mutex<Vec<String>>>,
        pub pings: Arc<Mutex<u32>>,
        pub fail_on: Option<String>,
    }

    #[async_trait]
    impl SyncTarget for RecordingTarget {
        async fn ping_or_reconnect(&mut self) -> Result<()> {
            *self.pings.lock().unwrap() += 1;
            Ok(())
        }

        async fn execute(&mut self, sql: &str) -> Result<()> {
            if self.fail_on.as_deref().map(|f| sql.contains(f)).unwrap_or(false) {
                return Err(BinlogSqlError::Query("Duplicate entry".into()));
            }
            self.executed.lock().unwrap().push(sql.to_string());
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) fn stmt(sql: &str, table: Option<&str>) -> GeneratedStatement {
        GeneratedStatement {
            sql: sql.to_string(),
            schema: table.map(|_| "shop".to_string()),
            table: table.map(str::to_string),
            position: BinlogPosition::new("mysql-bin.000001", 400),
            tx_start_pos: 4,
            comment: Some("start 4 end 400".to_string()),
        }
    }

    #[tokio::test]
    async fn test_single_file_appends_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sql");
        fs::write(&path, "-- existing\n").unwrap();

        let mut router = OutputRouter::single_file(&path, true).unwrap();
        router.route(&stmt("DELETE FROM t;", Some("t"))).await.unwrap();
        router.close().await.unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "-- existing\nDELETE FROM t; #start 4 end 400\n");
    }

    #[tokio::test]
    async fn test_per_table_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut router = OutputRouter::per_table(dir.path(), FileNaming::NoDate, false).unwrap();
        router.route(&stmt("INSERT INTO a;", Some("orders"))).await.unwrap();
        router.route(&stmt("INSERT INTO b;", Some("users"))).await.unwrap();
        router.route(&stmt("INSERT INTO c;", Some("orders"))).await.unwrap();
        router.route(&stmt("CREATE TABLE x (id INT);", None)).await.unwrap();
        router.close().await.unwrap();

        let orders = fs::read_to_string(dir.path().join("shop.orders.sql")).unwrap();
        assert_eq!(orders, "INSERT INTO a;\nINSERT INTO c;\n");
        let users = fs::read_to_string(dir.path().join("shop.users.sql")).unwrap();
        assert_eq!(users, "INSERT INTO b;\n");
        assert!(dir.path().join("others.sql").exists());
        assert_eq!(router.routed(), 4);
    }

    #[tokio::test]
    async fn test_per_table_files_stay_under_open_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut router =
            OutputRouter::per_table_with_limit(dir.path(), FileNaming::NoDate, false, 2).unwrap();

        for round in 0..2 {
            for i in 0..5 {
                let table = format!("t{}", i);
                router
                    .route(&stmt(&format!("INSERT INTO {} VALUES ({});", table, round), Some(&table)))
                    .await
                    .unwrap();
                assert!(router.open_files() <= 2);
            }
        }
        router.close().await.unwrap();

        for i in 0..5 {
            let content = fs::read_to_string(dir.path().join(format!("shop.t{}.sql", i))).unwrap();
            assert_eq!(
                content,
                format!("INSERT INTO t{i} VALUES (0);\nINSERT INTO t{i} VALUES (1);\n")
            );
        }
    }

    #[test]
    fn test_file_naming_schemes() {
        let stamp = "20240101120000";
        assert_eq!(
            FileNaming::DateSuffix.file_name(Some("db"), Some("t"), stamp),
            "db.t.20240101120000.sql"
        );
        assert_eq!(
            FileNaming::DatePrefix.file_name(Some("db"), Some("t"), stamp),
            "20240101120000.db.t.sql"
        );
        assert_eq!(FileNaming::DateSuffix.file_name(None, None, stamp), "others.20240101120000.sql");
    }

    #[tokio::test]
    async fn test_live_sink_strips_use_prefix_and_pings() {
        let target = RecordingTarget::default();
        let executed = target.executed.clone();
        let pings = target.pings.clone();
        let mut router = OutputRouter::live(Box::new(target));

        router
            .route(&stmt("USE `shop`;\nALTER TABLE t ADD c INT;", None))
            .await
            .unwrap();
        router.route(&stmt("DELETE FROM t;", Some("t"))).await.unwrap();

        assert_eq!(
            *executed.lock().unwrap(),
            vec!["ALTER TABLE t ADD c INT;".to_string(), "DELETE FROM t;".to_string()]
        );
        assert_eq!(*pings.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_live_sink_failure_is_fatal() {
        let target = RecordingTarget {
            fail_on: Some("boom".into()),
            ..Default::default()
        };
        let mut router = OutputRouter::live(Box::new(target));
        let err = router.route(&stmt("INSERT boom;", Some("t"))).await.unwrap_err();
        match err {
            BinlogSqlError::SinkExecution {
                position,
                tx_start_pos,
                ..
            } => {
                assert_eq!(position, "mysql-bin.000001:400");
                assert_eq!(tx_start_pos, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
