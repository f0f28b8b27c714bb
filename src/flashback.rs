//! Flashback 역순 처리기
//!
//! flashback 문장은 생성 순서(정방향)대로 임시 spool 파일에 한 줄씩 기록된다.
//! 메인 처리가 끝나면 파일을 끝에서부터 블록 단위로 읽어 역순으로 라우터에
//! 전달한다. 메모리 사용량은 chunk 하나 + 읽기 블록 하나로 제한된다.

use crate::error::{BinlogSqlError, Result};
use crate::router::OutputRouter;
use crate::sql_builder::GeneratedStatement;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

const READ_BLOCK_SIZE: usize = 64 * 1024;

/// 실행 하나에 하나씩 존재하는 임시 spool 파일. drop 시 삭제된다.
pub struct FlashbackSpool {
    file: NamedTempFile,
    writer: Option<BufWriter<File>>,
    count: u64,
    warned: bool,
}

impl FlashbackSpool {
    /// `<tmp_dir>/<host>.<port>.<random>.spool`
    pub fn create(tmp_dir: impl AsRef<Path>, host: &str, port: u16) -> Result<Self> {
        let tmp_dir = tmp_dir.as_ref();
        fs::create_dir_all(tmp_dir)?;
        let file = tempfile::Builder::new()
            .prefix(&format!("{}.{}.", host, port))
            .suffix(".spool")
            .tempfile_in(tmp_dir)?;
        let writer = BufWriter::new(file.reopen()?);
        debug!("Created flashback spool {}", file.path().display());
        Ok(FlashbackSpool {
            file,
            writer: Some(writer),
            count: 0,
            warned: false,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.file.path().to_path_buf()
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// 문장 하나를 spool 끝에 추가
    pub fn append(&mut self, stmt: &GeneratedStatement) -> Result<()> {
        if !self.warned {
            warn!(
                "Saving the result into the temp file, please wait until the parsing process \
                 is done, then reverse the order of results to you."
            );
            self.warned = true;
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BinlogSqlError::Io("flashback spool already sealed".into()))?;
        serde_json::to_writer(&mut *writer, stmt)?;
        writer.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }

    /// spool 을 역순으로 `chunk_size` 개씩 라우터에 전달한다
    pub async fn replay_reversed(mut self, chunk_size: usize, router: &mut OutputRouter) -> Result<u64> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        let chunk_size = chunk_size.max(1);
        info!(
            "Reversing {} flashback statements in chunks of {}",
            self.count, chunk_size
        );

        let mut reader = ReverseLineReader::new(self.file.reopen()?)?;
        let mut chunk: Vec<GeneratedStatement> = Vec::with_capacity(chunk_size);
        let mut replayed = 0u64;

        while let Some(line) = reader.next_line()? {
            if line.trim().is_empty() {
                continue;
            }
            chunk.push(serde_json::from_str(&line)?);
            if chunk.len() == chunk_size {
                router.route_all(&chunk).await?;
                replayed += chunk.len() as u64;
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            router.route_all(&chunk).await?;
            replayed += chunk.len() as u64;
        }

        debug!("Replayed {} flashback statements", replayed);
        Ok(replayed)
    }
}

/// 파일을 끝에서부터 읽어 마지막 줄부터 돌려주는 reader
struct ReverseLineReader<R> {
    inner: R,
    /// 아직 읽지 않은 영역의 끝 (앞쪽으로 줄어듦)
    remaining: u64,
    /// 완성되지 않은 줄 조각 (파일 순서 그대로)
    pending: Vec<u8>,
    /// 완성된 줄들. pop 하면 파일 기준 뒤쪽 줄부터 나온다.
    lines: Vec<Vec<u8>>,
}

impl<R: Read + Seek> ReverseLineReader<R> {
    fn new(mut inner: R) -> Result<Self> {
        let remaining = inner.seek(SeekFrom::End(0))?;
        Ok(ReverseLineReader {
            inner,
            remaining,
            pending: Vec::new(),
            lines: Vec::new(),
        })
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.lines.pop() {
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.remaining == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let first = std::mem::take(&mut self.pending);
                return Ok(Some(String::from_utf8_lossy(&first).into_owned()));
            }
            self.read_block()?;
        }
    }

    fn read_block(&mut self) -> Result<()> {
        let size = (READ_BLOCK_SIZE as u64).min(self.remaining) as usize;
        self.remaining -= size as u64;
        self.inner.seek(SeekFrom::Start(self.remaining))?;
        let mut block = vec![0u8; size];
        self.inner.read_exact(&mut block)?;

        block.extend_from_slice(&self.pending);
        let mut segments: Vec<&[u8]> = block.split(|b| *b == b'\n').collect();
        // 첫 조각은 앞 블록과 이어질 수 있으므로 보류
        self.pending = segments.remove(0).to_vec();
        // 파일 순서대로 쌓아 두고 뒤에서부터 pop
        self.lines = segments
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(<[u8]>::to_vec)
            .collect();
        Ok(())
    }
}
