//! binlog → SQL 변환 엔진
//!
//! 이벤트 소스를 끝까지 (또는 윈도우 / GTID 조건이 끝날 때까지) 한 번 순회하면서:
//! 1. 위치 / 시간 윈도우로 이벤트를 분류하고
//! 2. GTID 필터를 적용한 뒤
//! 3. 행 이벤트 (비 DML 모드에서는 쿼리 이벤트도) 를 SQL 로 재구성해
//! 4. 라우터로 바로 보내거나, flashback 이면 spool 에 쌓았다가 역순으로 보낸다.

use crate::binlog_client::EventSource;
use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::error::{BinlogSqlError, Result};
use crate::events::SourceEvent;
use crate::flashback::FlashbackSpool;
use crate::gtid::{GtidFilter, GtidProgress};
use crate::offset::{BinlogPosition, TransactionTracker};
use crate::router::OutputRouter;
use crate::sql_builder::{GeneratedStatement, SqlBuilder, StatementContext};
use crate::window::{event_time, PositionWindow, WindowDecision};
use tracing::{debug, error, info, warn};

/// 스트림이 멈춘 이유. 에러가 아니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 소스에 더 이상 이벤트가 없음
    EndOfStream,
    /// 종료 위치 또는 시작 시점의 EOF 에 정확히 도달
    LastEvent,
    /// 윈도우 밖 (종료 시간, 종료 위치 초과, 대상 파일 밖)
    WindowEnd,
    /// include GTID 를 모두 처리함
    GtidSatisfied,
}

/// 한 번의 실행 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub events: u64,
    pub statements: u64,
    pub skipped_rows: u64,
    /// 마지막으로 처리한 이벤트의 끝 위치
    pub last_position: BinlogPosition,
    /// 마지막으로 끝난 트랜잭션의 끝 위치 (재시작 지점)
    pub resume_position: Option<BinlogPosition>,
}

/// binlog → SQL 엔진
pub struct CdcEngine {
    config: Config,
    window: PositionWindow,
    gtid_filter: GtidFilter,
    checkpoint: Checkpoint,
}

impl CdcEngine {
    /// 설정을 검증하고 엔진을 만든다
    pub fn new(config: Config, window: PositionWindow) -> Result<Self> {
        config.validate()?;
        let gtid_filter = GtidFilter::parse(
            config.include_gtids.as_deref(),
            config.exclude_gtids.as_deref(),
        )
        .map_err(|e| BinlogSqlError::config(format!("invalid gtid set: {}", e)))?;

        Ok(CdcEngine {
            config,
            window,
            gtid_filter,
            checkpoint: Checkpoint::new(),
        })
    }

    /// 이전 실행의 체크포인트를 이어서 갱신한다
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 전체 실행. 어떤 경로로 끝나든 소스를 닫고, spool 을 지우고, 라우터를 닫는다.
    pub async fn run(
        &self,
        source: &mut dyn EventSource,
        router: &mut OutputRouter,
    ) -> Result<RunSummary> {
        info!("Start parsing binlog from {}", self.config.start_position());

        let mut spool = if self.config.options.flashback() {
            Some(FlashbackSpool::create(
                &self.config.tmp_dir,
                &self.config.connection.hostname,
                self.config.connection.port,
            )?)
        } else {
            None
        };

        let mut checkpoint = self.checkpoint.clone();
        let processed = self
            .process(source, router, spool.as_mut(), &mut checkpoint)
            .await;
        if let Err(e) = source.close().await {
            warn!("Failed to close binlog source: {}", e);
        }

        let result = match (processed, spool) {
            (Ok(summary), Some(spool)) => spool
                .replay_reversed(self.config.chunk_size, router)
                .await
                .map(|_| summary),
            (result, _) => result,
        };
        let closed = router.close().await;
        let saved = self.save_checkpoint(&checkpoint);

        let summary = result?;
        closed?;
        saved?;
        info!(
            "Parsing finished ({:?}): {} events, {} statements, {} rows skipped, last position {}",
            summary.stop_reason,
            summary.events,
            summary.statements,
            summary.skipped_rows,
            summary.last_position
        );
        Ok(summary)
    }

    /// 체크포인트가 바뀌었을 때만 저장한다. 출력이 모두 닫힌 뒤에 호출된다.
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        match &self.config.checkpoint {
            Some(path) if *checkpoint != self.checkpoint => checkpoint.save(path).map_err(|e| {
                error!("Failed to save checkpoint {}: {}", path.display(), e);
                e
            }),
            _ => Ok(()),
        }
    }

    async fn process(
        &self,
        source: &mut dyn EventSource,
        router: &mut OutputRouter,
        mut spool: Option<&mut FlashbackSpool>,
        checkpoint: &mut Checkpoint,
    ) -> Result<RunSummary> {
        let builder = SqlBuilder::new(&self.config.options);
        let mut gtid_filter = self.gtid_filter.clone();
        let mut tracker = TransactionTracker::new(self.config.start_pos);
        let mut current_gtid: Option<String> = None;
        let mut summary = RunSummary {
            stop_reason: StopReason::EndOfStream,
            events: 0,
            statements: 0,
            skipped_rows: 0,
            last_position: self.config.start_position(),
            resume_position: None,
        };

        summary.stop_reason = loop {
            let event = match source.next_event().await? {
                Some(event) => event,
                None => break StopReason::EndOfStream,
            };
            summary.events += 1;
            let header = event.header().clone();

            let decision = self.window.classify(&header);
            match decision {
                WindowDecision::BeforeWindow => {
                    if !event.is_control() {
                        tracker.advance(header.log_pos);
                    }
                    continue;
                }
                WindowDecision::Terminate => break StopReason::WindowEnd,
                WindowDecision::InWindow | WindowDecision::InWindowLast => {}
            }

            match &event {
                SourceEvent::Query { data, .. } if data.is_begin() => tracker.begin_transaction(),
                SourceEvent::Gtid { gtid, .. } => {
                    if gtid_filter.observe(gtid) == GtidProgress::Satisfied {
                        info!(
                            "The parse process exited because the gtid condition reached \
                             the maximum value"
                        );
                        break StopReason::GtidSatisfied;
                    }
                    current_gtid = Some(gtid.clone());
                }
                _ => {}
            }

            let wanted = match current_gtid.as_deref() {
                Some(gtid) if gtid_filter.is_active() => gtid_filter.is_wanted(gtid),
                _ => true,
            };
            if wanted {
                let ctx = StatementContext {
                    tx_start_pos: tracker.tx_start_pos(),
                    event_end: header.position(),
                    event_time: event_time(header.timestamp),
                    gtid: current_gtid.clone(),
                };
                for stmt in self.statements(&builder, &event, &ctx, &mut summary)? {
                    self.emit(&stmt, router, spool.as_deref_mut()).await?;
                    summary.statements += 1;
                }
            } else if let Some(gtid) = current_gtid.as_deref() {
                debug!("Skipping event at {} of unwanted gtid {}", header.position(), gtid);
            }

            if !event.is_control() {
                tracker.advance(header.log_pos);
                summary.last_position = BinlogPosition::new(header.log_file.clone(), header.log_pos);
            }
            if ends_transaction(&event) {
                checkpoint.record(&summary.last_position);
                summary.resume_position = Some(summary.last_position.clone());
            }
            if decision == WindowDecision::InWindowLast {
                break StopReason::LastEvent;
            }
        };

        Ok(summary)
    }

    /// 이벤트 하나에서 나오는 문장들. 행 재구성 실패는 기록하고 건너뛴다.
    fn statements(
        &self,
        builder: &SqlBuilder<'_>,
        event: &SourceEvent,
        ctx: &StatementContext,
        summary: &mut RunSummary,
    ) -> Result<Vec<GeneratedStatement>> {
        let data = match event {
            SourceEvent::Query { data, .. } if !self.config.only_dml => {
                return Ok(builder.build_query(data, ctx).into_iter().collect())
            }
            SourceEvent::Xid(_) if !self.config.only_dml => {
                return Ok(vec![builder.build_commit(ctx)])
            }
            SourceEvent::Rows { data, .. } if self.config.wants(data.op) => data,
            _ => return Ok(Vec::new()),
        };

        // 소스가 디코딩하지 못한 행
        summary.skipped_rows += data.skipped_rows;

        let mut stmts = Vec::with_capacity(data.rows.len());
        for row in &data.rows {
            match builder.build_row(row, ctx) {
                Ok(stmt) => stmts.extend(stmt),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        "Skipping {} row of `{}`.`{}` at {}: {} (before: {:?}, after: {:?})",
                        row.op, row.schema, row.table, row.position, e, row.before, row.after
                    );
                    summary.skipped_rows += 1;
                }
            }
        }
        Ok(stmts)
    }

    /// flashback 이면 spool 로, 아니면 바로 라우터로. 실시간 실행 실패는 라우터가 위치와 함께 기록한다.
    async fn emit(
        &self,
        stmt: &GeneratedStatement,
        router: &mut OutputRouter,
        spool: Option<&mut FlashbackSpool>,
    ) -> Result<()> {
        match spool {
            Some(spool) => spool.append(stmt),
            None => router.route(stmt).await,
        }
    }
}

/// 트랜잭션 (또는 자동 커밋되는 DDL) 이 끝나는 이벤트
fn ends_transaction(event: &SourceEvent) -> bool {
    match event {
        SourceEvent::Xid(_) => true,
        SourceEvent::Query { data, .. } => !data.is_begin(),
        _ => false,
    }
}
