//! GTID (Global Transaction ID) 관리 및 필터링
//!
//! GTID 형식: UUID:sequence-number
//! 여러 서버의 GTID 집합을 추적: "uuid1:1-100:200,uuid2:1-50"

use crate::error::{BinlogSqlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// GTID 범위 (sequence 범위, 양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(BinlogSqlError::Gtid(format!(
                "Invalid range: {} > {}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    pub fn merge(&self, other: &GtidRange) -> Option<GtidRange> {
        // 연접하거나 겹치는 범위만 병합
        if self.end.saturating_add(1) >= other.start && other.end.saturating_add(1) >= self.start {
            Some(GtidRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }

    fn parse(text: &str) -> Result<Self> {
        let invalid = || BinlogSqlError::Gtid(format!("Invalid interval: {}", text));
        match text.split_once('-') {
            Some((start, end)) => {
                let start = start.trim().parse::<u64>().map_err(|_| invalid())?;
                let end = end.trim().parse::<u64>().map_err(|_| invalid())?;
                GtidRange::new(start, end)
            }
            None => {
                let seq = text.trim().parse::<u64>().map_err(|_| invalid())?;
                GtidRange::new(seq, seq)
            }
        }
    }
}

/// UUID별 GTID 범위들 (정렬 및 병합 상태 유지)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidGtidSet {
    pub uuid: String,
    pub ranges: Vec<GtidRange>,
}

impl UuidGtidSet {
    pub fn new(uuid: String) -> Self {
        UuidGtidSet {
            uuid,
            ranges: Vec::new(),
        }
    }

    pub fn add_range(&mut self, range: GtidRange) {
        self.ranges.push(range);
        self.ranges.sort();

        let mut merged: Vec<GtidRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) => match last.merge(&range) {
                    Some(m) => *last = m,
                    None => merged.push(range),
                },
                None => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(sequence))
    }

    /// 포함된 가장 큰 sequence
    pub fn max_sequence(&self) -> Option<u64> {
        self.ranges.iter().map(|r| r.end).max()
    }
}

impl fmt::Display for UuidGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)?;
        for r in &self.ranges {
            if r.start == r.end {
                write!(f, ":{}", r.start)?;
            } else {
                write!(f, ":{}-{}", r.start, r.end)?;
            }
        }
        Ok(())
    }
}

/// 전체 GTID 집합 (여러 UUID)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    pub sets: BTreeMap<String, UuidGtidSet>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet {
            sets: BTreeMap::new(),
        }
    }

    /// GTID 집합 문자열 파싱
    ///
    /// 지원 형식:
    /// - "uuid1:1-100:200,uuid2:1-50" (MySQL 표준)
    /// - "uuid1:1-100,200,300-400" (UUID 없는 항목은 직전 UUID 에 속함)
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = GtidSet::new();
        let trimmed = gtid_str.trim();

        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("NULL") {
            return Ok(gtid_set);
        }

        let mut current_uuid: Option<String> = None;
        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let mut pieces = part.split(':');
            let intervals: Vec<&str> = if part.contains(':') {
                let uuid = pieces.next().unwrap_or_default().trim().to_ascii_lowercase();
                if uuid.is_empty() {
                    return Err(BinlogSqlError::Gtid(format!("Missing UUID in: {}", part)));
                }
                current_uuid = Some(uuid);
                pieces.collect()
            } else {
                vec![part]
            };

            let uuid = current_uuid.clone().ok_or_else(|| {
                BinlogSqlError::Gtid(format!("Interval without UUID: {}", part))
            })?;
            let entry = gtid_set
                .sets
                .entry(uuid.clone())
                .or_insert_with(|| UuidGtidSet::new(uuid));
            for interval in intervals {
                entry.add_range(GtidRange::parse(interval)?);
            }
        }

        Ok(gtid_set)
    }

    pub fn contains(&self, gtid: &str) -> bool {
        match split_gtid(gtid) {
            Some((uuid, sequence)) => self
                .sets
                .get(&uuid)
                .map(|set| set.contains(sequence))
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|set| set.ranges.is_empty())
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .sets
            .values()
            .filter(|set| !set.ranges.is_empty())
            .map(|set| set.to_string())
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// "uuid:seq" → (소문자 uuid, seq)
pub fn split_gtid(gtid: &str) -> Option<(String, u64)> {
    let (uuid, sequence) = gtid.trim().rsplit_once(':')?;
    let sequence = sequence.parse::<u64>().ok()?;
    if uuid.is_empty() {
        return None;
    }
    Some((uuid.to_ascii_lowercase(), sequence))
}

/// GTID 관측 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtidProgress {
    Continue,
    /// include 집합의 모든 UUID 가 최대 sequence 에 도달함
    Satisfied,
}

/// include/exclude 집합과 조기 종료용 카운트다운
#[derive(Debug, Clone, Default)]
pub struct GtidFilter {
    include: GtidSet,
    exclude: GtidSet,
    /// UUID → 남은 최대 sequence
    remaining: BTreeMap<String, u64>,
    countdown: bool,
}

impl GtidFilter {
    pub fn new(include: GtidSet, exclude: GtidSet) -> Self {
        let remaining: BTreeMap<String, u64> = include
            .sets
            .iter()
            .filter_map(|(uuid, set)| set.max_sequence().map(|max| (uuid.clone(), max)))
            .collect();
        let countdown = !remaining.is_empty();
        GtidFilter {
            include,
            exclude,
            remaining,
            countdown,
        }
    }

    pub fn parse(include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        let include = include.map(GtidSet::parse).transpose()?.unwrap_or_default();
        let exclude = exclude.map(GtidSet::parse).transpose()?.unwrap_or_default();
        Ok(GtidFilter::new(include, exclude))
    }

    /// include 나 exclude 중 하나라도 설정되어 있는지
    pub fn is_active(&self) -> bool {
        !self.include.is_empty() || !self.exclude.is_empty()
    }

    pub fn is_wanted(&self, gtid: &str) -> bool {
        let included = self.include.is_empty() || self.include.contains(gtid);
        included && !self.exclude.contains(gtid)
    }

    /// GTID 이벤트 관측. 이미 카운트다운이 끝났다면 `Satisfied`.
    pub fn observe(&mut self, gtid: &str) -> GtidProgress {
        if self.countdown && self.remaining.is_empty() {
            return GtidProgress::Satisfied;
        }

        if let Some((uuid, sequence)) = split_gtid(gtid) {
            let reached = self
                .remaining
                .get(&uuid)
                .map(|max| sequence >= *max)
                .unwrap_or(false);
            if reached {
                debug!("GTID countdown reached for {}", uuid);
                self.remaining.remove(&uuid);
            }
        }
        GtidProgress::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID_A: &str = "550e8400-e29b-41d4-a716-446655440000";
    const UUID_B: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    #[test]
    fn test_gtid_parse() {
        let set = GtidSet::parse(&format!("{}:1-100,200,300-400", UUID_A)).unwrap();
        assert!(set.contains(&format!("{}:50", UUID_A)));
        assert!(set.contains(&format!("{}:200", UUID_A)));
        assert!(!set.contains(&format!("{}:250", UUID_A)));
    }

    #[test]
    fn test_gtid_parse_mysql_format() {
        let set = GtidSet::parse(&format!("{}:1-5:7, {}:3", UUID_A, UUID_B.to_uppercase())).unwrap();
        assert!(set.contains(&format!("{}:7", UUID_A)));
        assert!(!set.contains(&format!("{}:6", UUID_A)));
        assert!(set.contains(&format!("{}:3", UUID_B)));
        assert_eq!(set.to_string(), format!("{}:3,{}:1-5:7", UUID_B, UUID_A));
    }

    #[test]
    fn test_gtid_parse_rejects_garbage() {
        assert!(GtidSet::parse("1-5").is_err());
        assert!(GtidSet::parse(&format!("{}:9-2", UUID_A)).is_err());
    }

    #[test]
    fn test_gtid_contains() {
        let gtid_set = GtidSet::parse(&format!("{}:50:51", UUID_A)).unwrap();
        assert!(gtid_set.contains(&format!("{}:50", UUID_A)));
        assert!(!gtid_set.contains(&format!("{}:52", UUID_A)));
        assert_eq!(gtid_set.sets[UUID_A].ranges.len(), 1);
    }

    #[test]
    fn test_excluded_gtid_is_not_wanted() {
        let filter = GtidFilter::parse(None, Some(&format!("{}:3", UUID_A))).unwrap();
        assert!(filter.is_active());
        assert!(!filter.is_wanted(&format!("{}:3", UUID_A)));
        assert!(filter.is_wanted(&format!("{}:4", UUID_A)));
    }

    #[test]
    fn test_gtid_outside_non_empty_include_is_not_wanted() {
        let filter = GtidFilter::parse(Some(&format!("{}:1-3", UUID_A)), None).unwrap();
        assert!(filter.is_wanted(&format!("{}:2", UUID_A)));
        assert!(!filter.is_wanted(&format!("{}:4", UUID_A)));
        assert!(!filter.is_wanted(&format!("{}:2", UUID_B)));
    }

    #[test]
    fn test_countdown_satisfied_after_last_wanted_transaction() {
        let mut filter = GtidFilter::parse(Some(&format!("{}:1-2", UUID_A)), None).unwrap();
        assert_eq!(filter.observe(&format!("{}:1", UUID_A)), GtidProgress::Continue);
        // 마지막 트랜잭션 자체는 처리되어야 한다
        assert_eq!(filter.observe(&format!("{}:2", UUID_A)), GtidProgress::Continue);
        assert_eq!(filter.observe(&format!("{}:3", UUID_A)), GtidProgress::Satisfied);
    }

    #[test]
    fn test_no_countdown_without_include() {
        let mut filter = GtidFilter::default();
        assert!(!filter.is_active());
        assert_eq!(filter.observe(&format!("{}:1", UUID_A)), GtidProgress::Continue);
        assert_eq!(filter.observe(&format!("{}:2", UUID_A)), GtidProgress::Continue);
    }
}
