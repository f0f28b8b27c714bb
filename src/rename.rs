//! 스키마 / 테이블 이름 치환

use crate::error::{BinlogSqlError, Result};
use std::collections::HashMap;

pub const WILDCARD: &str = "*";

/// `old:new` 매핑. `*` 키는 나머지 전부에 적용된다.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameMap {
    entries: HashMap<String, String>,
}

impl RenameMap {
    pub fn new() -> Self {
        RenameMap::default()
    }

    /// `["db1:db2", "a:b,c:d"]` 형식의 인자들을 하나로 합친다
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut map = RenameMap::new();
        for arg in args {
            for pair in arg.as_ref().split(',') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                let (from, to) = pair.split_once(':').ok_or_else(|| {
                    BinlogSqlError::config(format!("rename must look like old:new, got '{}'", pair))
                })?;
                let (from, to) = (from.trim(), to.trim());
                if from.is_empty() || to.is_empty() {
                    return Err(BinlogSqlError::config(format!("invalid rename '{}'", pair)));
                }
                map.insert(from, to);
            }
        }
        Ok(map)
    }

    /// 모든 이름을 `target` 으로 바꾸는 맵 (sync 모드)
    pub fn wildcard(target: impl Into<String>) -> Self {
        let mut map = RenameMap::new();
        map.entries.insert(WILDCARD.to_string(), target.into());
        map
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.entries.insert(from.into(), to.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 스키마 이름 치환: 정확히 일치 → `*` → 원래 이름
    pub fn schema<'a>(&'a self, schema: &'a str) -> &'a str {
        self.entries
            .get(schema)
            .or_else(|| self.entries.get(WILDCARD))
            .map(String::as_str)
            .unwrap_or(schema)
    }

    /// 테이블 이름 치환: `schema.table` → `table` → `*` → 원래 이름
    pub fn table<'a>(&'a self, schema: &str, table: &'a str) -> &'a str {
        self.entries
            .get(&format!("{}.{}", schema, table))
            .or_else(|| self.entries.get(table))
            .or_else(|| self.entries.get(WILDCARD))
            .map(String::as_str)
            .unwrap_or(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_before_wildcard() {
        let map = RenameMap::parse(&["shop:shop_bak", "*:archive"]).unwrap();
        assert_eq!(map.schema("shop"), "shop_bak");
        assert_eq!(map.schema("crm"), "archive");
    }

    #[test]
    fn test_table_rename_lookup_order() {
        let map = RenameMap::parse(&["shop.orders:orders_v2,users:members"]).unwrap();
        assert_eq!(map.table("shop", "orders"), "orders_v2");
        assert_eq!(map.table("crm", "orders"), "orders");
        assert_eq!(map.table("crm", "users"), "members");
    }

    #[test]
    fn test_invalid_pair() {
        assert!(RenameMap::parse(&["no_colon"]).is_err());
        assert!(RenameMap::parse(&[":x"]).is_err());
    }

    #[test]
    fn test_empty_map_keeps_names() {
        let map = RenameMap::new();
        assert_eq!(map.schema("db"), "db");
        assert_eq!(map.table("db", "t"), "t");
    }
}
