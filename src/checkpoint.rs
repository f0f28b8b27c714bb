//! 재시작 체크포인트
//!
//! binlog 파일마다 마지막으로 끝난 트랜잭션의 끝 위치를 `<file>=<offset>` 한 줄로 기록한다.
//! 덮어쓰기 전에 이전 파일을 `<path>.bak` 으로 복사해 둔다.

use crate::error::{BinlogSqlError, Result};
use crate::offset::BinlogPosition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// 파일별 처리 완료 위치
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    offsets: BTreeMap<String, u64>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// 파일이 없으면 빈 체크포인트
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => {
                let checkpoint = Self::parse(&text)?;
                info!("Loaded checkpoint {}: {}", path.display(), checkpoint.to_json());
                Ok(checkpoint)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "Checkpoint file '{}' not found. Starting with empty offsets.",
                    path.display()
                );
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut checkpoint = Self::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (file, offset) = line
                .split_once('=')
                .and_then(|(file, offset)| Some((file.trim(), offset.trim().parse::<u64>().ok()?)))
                .filter(|(file, _)| !file.is_empty())
                .ok_or_else(|| {
                    BinlogSqlError::config(format!("invalid checkpoint line: {}", line))
                })?;
            checkpoint.offsets.insert(file.to_string(), offset);
        }
        Ok(checkpoint)
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn offset(&self, file: &str) -> Option<u64> {
        self.offsets.get(file).copied()
    }

    /// 가장 최근 binlog 파일의 위치
    pub fn resume_position(&self) -> Option<BinlogPosition> {
        self.offsets
            .iter()
            .map(|(file, offset)| BinlogPosition::new(file.clone(), *offset))
            .max()
    }

    /// 앞으로만 움직인다. 값이 바뀌었으면 true.
    pub fn record(&mut self, position: &BinlogPosition) -> bool {
        let entry = self.offsets.entry(position.filename.clone()).or_insert(0);
        if position.position > *entry {
            *entry = position.position;
            true
        } else {
            false
        }
    }

    /// `.bak` 백업 후 같은 디렉터리의 임시 파일을 써서 교체한다
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        if path.exists() {
            fs::copy(path, backup_path(path))?;
        }

        let mut tmp = NamedTempFile::new_in(&dir)?;
        write!(tmp, "{}", self)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| BinlogSqlError::from(e.error))?;
        info!("Checkpoint saved to {}: {}", path.display(), self.to_json());
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (file, offset) in &self.offsets {
            writeln!(f, "{}={}", file, offset)?;
        }
        Ok(())
    }
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}
