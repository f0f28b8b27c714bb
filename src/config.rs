//! 실행 설정
//!
//! CLI 인자에서 한 번 만들어지고 스트리밍이 시작되면 바뀌지 않는다.

use crate::binlog_client::TableFilter;
use crate::checkpoint::Checkpoint;
use crate::connection::ConnectionConfig;
use crate::error::{BinlogSqlError, Result};
use crate::events::OperationType;
use crate::flashback::DEFAULT_CHUNK_SIZE;
use crate::offset::{BinlogPosition, BINLOG_START_POS};
use crate::options::ReconstructionOptions;
use crate::router::FileNaming;
use crate::window::{candidate_files, PositionWindow, TimeWindow};
use std::path::PathBuf;
use tracing::info;

/// 생성된 SQL 의 목적지
#[derive(Debug, Clone, Default)]
pub enum OutputTarget {
    #[default]
    Console,
    File(PathBuf),
    PerTable {
        dir: PathBuf,
        naming: FileNaming,
    },
    /// 두 번째 서버에서 바로 실행
    Sync(ConnectionConfig),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub start_file: Option<String>,
    pub start_pos: u64,
    /// 없으면 시작 파일
    pub end_file: Option<String>,
    pub end_pos: Option<u64>,
    pub start_time: Option<String>,
    pub stop_time: Option<String>,
    pub stop_never: bool,
    pub tables: TableFilter,
    /// false 면 쿼리 이벤트 (DDL, BEGIN) 도 출력
    pub only_dml: bool,
    pub sql_types: Vec<OperationType>,
    pub include_gtids: Option<String>,
    pub exclude_gtids: Option<String>,
    pub output: OutputTarget,
    pub chunk_size: usize,
    pub tmp_dir: PathBuf,
    /// 재시작 체크포인트 파일 (`<file>=<offset>` 줄)
    pub checkpoint: Option<PathBuf>,
    pub options: ReconstructionOptions,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connection: ConnectionConfig::default(),
            start_file: None,
            start_pos: BINLOG_START_POS,
            end_file: None,
            end_pos: None,
            start_time: None,
            stop_time: None,
            stop_never: false,
            tables: TableFilter::default(),
            only_dml: true,
            sql_types: vec![
                OperationType::Insert,
                OperationType::Update,
                OperationType::Delete,
            ],
            include_gtids: None,
            exclude_gtids: None,
            output: OutputTarget::Console,
            chunk_size: DEFAULT_CHUNK_SIZE,
            tmp_dir: std::env::temp_dir(),
            checkpoint: None,
            options: ReconstructionOptions::default(),
        }
    }
}

impl Config {
    /// 스트리밍 전에 잡아낼 수 있는 설정 오류 검사
    pub fn validate(&self) -> Result<()> {
        if self.start_file.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return Err(BinlogSqlError::config("lack of parameter: start_file"));
        }
        if self.options.flashback() && self.stop_never {
            return Err(BinlogSqlError::config(
                "only one of flashback or stop-never can be set",
            ));
        }
        if self.options.flashback() && !self.only_dml {
            return Err(BinlogSqlError::config(
                "flashback only works with DML statements, add --only-dml",
            ));
        }
        if self.options.flashback() && self.checkpoint.is_some() {
            return Err(BinlogSqlError::config(
                "checkpoint only tracks forward runs, it cannot be used with flashback",
            ));
        }
        if self.chunk_size == 0 {
            return Err(BinlogSqlError::config("chunk size must be greater than 0"));
        }
        if self.sql_types.is_empty() {
            return Err(BinlogSqlError::config("at least one sql type must be selected"));
        }
        if let OutputTarget::Sync(target) = &self.output {
            if target.database.as_deref().unwrap_or("").is_empty() {
                return Err(BinlogSqlError::config("--sync requires --sync-database"));
            }
        }
        TimeWindow::parse(self.start_time.as_deref(), self.stop_time.as_deref())?;
        Ok(())
    }

    /// 체크포인트로 시작 위치를 정한다. 시작 파일이 주어졌으면 그 파일의 기록만 본다.
    pub fn resume_from(&mut self, checkpoint: &Checkpoint) {
        if checkpoint.is_empty() {
            return;
        }
        let explicit = self.start_file.as_deref().filter(|f| !f.trim().is_empty());
        match explicit {
            Some(file) => {
                if let Some(offset) = checkpoint.offset(file).filter(|o| *o > self.start_pos) {
                    info!("Resuming {} from checkpoint position {}", file, offset);
                    self.start_pos = offset;
                }
            }
            None => {
                if let Some(position) = checkpoint.resume_position() {
                    info!("Resuming from checkpoint position {}", position);
                    self.start_file = Some(position.filename);
                    self.start_pos = position.position;
                }
            }
        }
    }

    pub fn start_file(&self) -> &str {
        self.start_file.as_deref().unwrap_or("")
    }

    pub fn end_file(&self) -> &str {
        self.end_file
            .as_deref()
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| self.start_file())
    }

    pub fn start_position(&self) -> BinlogPosition {
        BinlogPosition::new(self.start_file(), self.start_pos)
    }

    pub fn wants(&self, op: OperationType) -> bool {
        self.sql_types.contains(&op)
    }

    /// 서버 상태 (binlog 목록, 현재 끝 위치) 로 위치/시간 윈도우를 만든다
    pub fn build_window(
        &self,
        server_logs: &[String],
        eof: BinlogPosition,
    ) -> Result<PositionWindow> {
        let start_file = self.start_file();
        if !server_logs.iter().any(|f| f == start_file) {
            return Err(BinlogSqlError::config(format!(
                "parameter error: start_file {} not in mysql server",
                start_file
            )));
        }
        let files = candidate_files(server_logs, start_file, self.end_file());
        info!("Binlog files to parse: {:?}", files);

        let time = TimeWindow::parse(self.start_time.as_deref(), self.stop_time.as_deref())?;
        Ok(
            PositionWindow::new(time, self.end_file(), self.end_pos, Some(eof), files)
                .stop_never(self.stop_never),
        )
    }
}
