//! binlog2sql: MySQL binlog 에서 원본 SQL / 롤백 SQL 을 만들어 낸다
use binlog_sql::binlog_client::{MySqlBinlogSource, TableFilter};
use binlog_sql::cdc_engine::CdcEngine;
use binlog_sql::checkpoint::Checkpoint;
use binlog_sql::config::{Config, OutputTarget};
use binlog_sql::connection::{ConnectionConfig, MySqlConnection, MySqlSyncTarget};
use binlog_sql::events::OperationType;
use binlog_sql::flashback::DEFAULT_CHUNK_SIZE;
use binlog_sql::options::ReconstructionOptions;
use binlog_sql::rename::RenameMap;
use binlog_sql::router::{FileNaming, OutputRouter};
use binlog_sql::{BinlogSqlError, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "binlog2sql")]
#[command(about = "Parse MySQL binlog into forward or flashback SQL")]
#[command(version)]
struct Cli {
    /// Host the MySQL database server located
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// MySQL port to use
    #[arg(short = 'P', long, default_value_t = 3306)]
    port: u16,

    /// MySQL user name to use
    #[arg(short, long, default_value = "root")]
    user: String,

    /// MySQL password to use
    #[arg(short, long, env = "BINLOG2SQL_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Start binlog file to be parsed
    #[arg(long)]
    start_file: Option<String>,

    /// Start position of the --start-file
    #[arg(long, visible_alias = "start-pos", default_value_t = 4)]
    start_position: u64,

    /// Stop binlog file to be parsed. default: '--start-file'
    #[arg(long)]
    stop_file: Option<String>,

    /// Stop position. default: latest position of '--stop-file'
    #[arg(long, visible_alias = "end-pos")]
    stop_position: Option<u64>,

    /// Start time. format %Y-%m-%d %H:%M:%S
    #[arg(long)]
    start_datetime: Option<String>,

    /// Stop Time. format %Y-%m-%d %H:%M:%S
    #[arg(long)]
    stop_datetime: Option<String>,

    /// Continuously parse binlog. default: stop at the latest event when you start
    #[arg(long)]
    stop_never: bool,

    /// dbs you want to process
    #[arg(short, long = "databases", num_args = 1..)]
    databases: Vec<String>,

    /// tables you want to process
    #[arg(short, long = "tables", num_args = 1..)]
    tables: Vec<String>,

    #[arg(long, num_args = 1..)]
    ignore_databases: Vec<String>,

    #[arg(long, num_args = 1..)]
    ignore_tables: Vec<String>,

    /// Columns removed from generated SQL
    #[arg(long, num_args = 1..)]
    ignore_columns: Vec<String>,

    /// Rename databases, e.g. old_db:new_db
    #[arg(long, num_args = 1..)]
    rename_db: Vec<String>,

    /// Rename tables, e.g. db.t:new_t or t:new_t or *:new_t
    #[arg(long, num_args = 1..)]
    rename_tb: Vec<String>,

    /// Generate insert sql without primary key if exists
    #[arg(short = 'K', long)]
    no_pk: bool,

    /// Only generate primary key columns for insert
    #[arg(long)]
    only_pk: bool,

    /// Flashback data to start_position of start_file
    #[arg(short = 'B', long)]
    flashback: bool,

    /// Also output DDL and transaction statements. default: only DML
    #[arg(long, alias = "ddl")]
    with_ddl: bool,

    /// Sql type you want to process, support INSERT, UPDATE, DELETE
    #[arg(long, num_args = 1.., default_values_t = ["INSERT".to_string(), "UPDATE".to_string(), "DELETE".to_string()])]
    sql_type: Vec<String>,

    /// Use REPLACE INTO instead of INSERT INTO
    #[arg(long)]
    replace: bool,

    /// Use INSERT IGNORE INTO
    #[arg(long)]
    insert_ignore: bool,

    /// Turn UPDATE into REPLACE INTO
    #[arg(long)]
    update_to_replace: bool,

    /// Only keep changed (and --keep-not-update-col) columns in UPDATE
    #[arg(long)]
    remove_not_update_col: bool,

    #[arg(long, num_args = 1..)]
    keep_not_update_col: Vec<String>,

    /// Row filter, e.g. "id > 10 and name = 'a' or status is null"
    #[arg(long = "where")]
    where_clause: Option<String>,

    /// Write all SQL to this file
    #[arg(long)]
    result_file: Option<PathBuf>,

    /// Write one file per table into --result-dir
    #[arg(long)]
    table_per_file: bool,

    #[arg(long, default_value = ".")]
    result_dir: PathBuf,

    /// Per-table file names start with the date
    #[arg(long)]
    date_prefix: bool,

    /// Per-table file names without date
    #[arg(long)]
    no_date: bool,

    /// Execute generated SQL on another MySQL server
    #[arg(long)]
    sync: bool,

    #[arg(long, default_value = "127.0.0.1")]
    sync_host: String,

    #[arg(long, default_value_t = 3306)]
    sync_port: u16,

    #[arg(long, default_value = "root")]
    sync_user: String,

    #[arg(long, env = "BINLOG2SQL_SYNC_PASSWORD", default_value = "", hide_env_values = true)]
    sync_password: String,

    #[arg(long)]
    sync_database: Option<String>,

    /// Flashback statements replayed per chunk
    #[arg(long = "chunk", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Directory for the flashback spool file
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Checkpoint file of `<binlog file>=<offset>` lines. Resumes from it and is updated
    /// with the end of the last finished transaction.
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// GTIDs to include, e.g. uuid:1-5:7,uuid2:3
    #[arg(long)]
    include_gtids: Option<String>,

    /// GTIDs to exclude
    #[arg(long)]
    exclude_gtids: Option<String>,

    /// Do not append the position comment to each statement
    #[arg(long)]
    no_comment: bool,

    /// Log level filter when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn sql_types(&self) -> Result<Vec<OperationType>> {
        self.sql_type
            .iter()
            .map(|t| {
                OperationType::parse(t)
                    .ok_or_else(|| BinlogSqlError::config(format!("unknown sql type '{}'", t)))
            })
            .collect()
    }

    fn output(&self) -> OutputTarget {
        if self.sync {
            OutputTarget::Sync(ConnectionConfig {
                hostname: self.sync_host.clone(),
                port: self.sync_port,
                username: self.sync_user.clone(),
                password: self.sync_password.clone(),
                database: self.sync_database.clone(),
                ..Default::default()
            })
        } else if let Some(path) = &self.result_file {
            OutputTarget::File(path.clone())
        } else if self.table_per_file {
            let naming = if self.no_date {
                FileNaming::NoDate
            } else if self.date_prefix {
                FileNaming::DatePrefix
            } else {
                FileNaming::DateSuffix
            };
            OutputTarget::PerTable {
                dir: self.result_dir.clone(),
                naming,
            }
        } else {
            OutputTarget::Console
        }
    }

    fn into_config(self) -> Result<Config> {
        let mut rename_db = RenameMap::parse(&self.rename_db)?;
        if self.sync {
            if let Some(db) = self.sync_database.as_deref().filter(|d| !d.is_empty()) {
                rename_db = RenameMap::wildcard(db);
            }
        }

        let mut builder = ReconstructionOptions::builder()
            .ignore_columns(self.ignore_columns.clone())
            .rename_db(rename_db)
            .rename_tb(RenameMap::parse(&self.rename_tb)?)
            .only_pk(self.only_pk)
            .no_pk(self.no_pk)
            .replace(self.replace)
            .insert_ignore(self.insert_ignore)
            .update_to_replace(self.update_to_replace)
            .remove_not_update_col(self.remove_not_update_col)
            .keep_not_update_col(self.keep_not_update_col.clone())
            .flashback(self.flashback)
            .need_comment(!self.no_comment);
        if let Some(text) = &self.where_clause {
            builder = builder.where_clause(text.clone());
        }

        Ok(Config {
            connection: ConnectionConfig {
                hostname: self.host.clone(),
                port: self.port,
                username: self.user.clone(),
                password: self.password.clone(),
                ..Default::default()
            },
            start_file: self.start_file.clone(),
            start_pos: self.start_position,
            end_file: self.stop_file.clone(),
            end_pos: self.stop_position,
            start_time: self.start_datetime.clone(),
            stop_time: self.stop_datetime.clone(),
            stop_never: self.stop_never,
            tables: TableFilter {
                only_schemas: self.databases.clone(),
                only_tables: self.tables.clone(),
                ignore_schemas: self.ignore_databases.clone(),
                ignore_tables: self.ignore_tables.clone(),
            },
            only_dml: !self.with_ddl,
            sql_types: self.sql_types()?,
            include_gtids: self.include_gtids.clone(),
            exclude_gtids: self.exclude_gtids.clone(),
            output: self.output(),
            chunk_size: self.chunk_size,
            tmp_dir: self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir),
            checkpoint: self.checkpoint.clone(),
            options: builder.build()?,
        })
    }
}

async fn open_router(config: &Config) -> Result<OutputRouter> {
    let comments = config.options.need_comment();
    match &config.output {
        OutputTarget::Console => Ok(OutputRouter::console(comments)),
        OutputTarget::File(path) => OutputRouter::single_file(path, comments),
        OutputTarget::PerTable { dir, naming } => OutputRouter::per_table(dir, *naming, comments),
        OutputTarget::Sync(target) => {
            let target = MySqlSyncTarget::connect(target.clone()).await?;
            Ok(OutputRouter::live(Box::new(target)))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = cli.into_config()?;
    let checkpoint = match &config.checkpoint {
        Some(path) => Checkpoint::load(path)?,
        None => Checkpoint::new(),
    };
    config.resume_from(&checkpoint);
    config.validate()?;

    info!(
        "Connecting to {}:{}",
        config.connection.hostname, config.connection.port
    );
    let mut conn = MySqlConnection::connect(&config.connection).await?;
    let eof = conn.get_binlog_status().await?;
    let server_logs = conn.get_binary_logs().await?;
    let server_id = conn.get_server_id().await?;
    conn.close().await?;
    info!("Current binlog end: {}, server_id: {}", eof, server_id);

    let window = config.build_window(&server_logs, eof)?;
    let start = config.start_position();
    let filter = config.tables.clone();
    let connection = config.connection.clone();

    let engine = CdcEngine::new(config, window)?.with_checkpoint(checkpoint);
    let mut router = open_router(engine.config()).await?;
    let mut source = MySqlBinlogSource::open(&connection, server_id, &start, filter).await?;

    engine.run(&mut source, &mut router).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("binlog2sql").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["--start-file", "mysql-bin.000001"]);
        let config = cli.into_config().unwrap();
        assert!(config.validate().is_ok());
        assert!(config.only_dml);
        assert_eq!(config.start_pos, 4);
        assert!(matches!(config.output, OutputTarget::Console));
        assert!(config.options.need_comment());
    }

    #[test]
    fn test_sync_renames_every_schema() {
        let cli = parse(&[
            "--start-file",
            "mysql-bin.000001",
            "--sync",
            "--sync-database",
            "shop_copy",
            "--rename-db",
            "shop:other",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.options.rename_db().schema("shop"), "shop_copy");
        assert_eq!(config.options.rename_db().schema("crm"), "shop_copy");
    }

    #[test]
    fn test_per_table_naming() {
        let cli = parse(&[
            "--start-file",
            "mysql-bin.000001",
            "--table-per-file",
            "--result-dir",
            "/tmp/out",
            "--no-date",
        ]);
        match cli.output() {
            OutputTarget::PerTable { naming, .. } => assert_eq!(naming, FileNaming::NoDate),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn test_checkpoint_supplies_start_file() {
        let cli = parse(&["--checkpoint", "/var/lib/binlog2sql/offsets"]);
        let mut config = cli.into_config().unwrap();
        assert!(config.validate().is_err());

        config.resume_from(&Checkpoint::parse("mysql-bin.000007=1024").unwrap());
        assert!(config.validate().is_ok());
        assert_eq!(config.start_position().to_string(), "mysql-bin.000007:1024");
    }

    #[test]
    fn test_bad_sql_type() {
        let cli = parse(&["--start-file", "mysql-bin.000001", "--sql-type", "MERGE"]);
        assert!(cli.into_config().is_err());
    }
}
