//! SQL 재구성 옵션 (불변 값 객체 + 빌더)

use crate::error::{BinlogSqlError, Result};
use crate::predicate::RowFilter;
use crate::rename::RenameMap;
use tracing::warn;

/// 스트리밍 시작 전에 한 번 만들어지고 이후 변경되지 않는 옵션 묶음
#[derive(Debug, Clone, Default)]
pub struct ReconstructionOptions {
    pub(crate) ignore_columns: Vec<String>,
    pub(crate) rename_db: RenameMap,
    pub(crate) rename_tb: RenameMap,
    pub(crate) only_pk: bool,
    pub(crate) no_pk: bool,
    pub(crate) replace: bool,
    pub(crate) insert_ignore: bool,
    pub(crate) update_to_replace: bool,
    pub(crate) remove_not_update_col: bool,
    pub(crate) keep_not_update_col: Vec<String>,
    pub(crate) flashback: bool,
    pub(crate) filter: RowFilter,
    pub(crate) need_comment: bool,
}

impl ReconstructionOptions {
    pub fn builder() -> ReconstructionOptionsBuilder {
        ReconstructionOptionsBuilder::default()
    }

    pub fn flashback(&self) -> bool {
        self.flashback
    }

    pub fn need_comment(&self) -> bool {
        self.need_comment
    }

    pub fn is_ignored(&self, column: &str) -> bool {
        self.ignore_columns.iter().any(|c| c == column)
    }

    pub fn is_pinned(&self, column: &str) -> bool {
        self.keep_not_update_col.iter().any(|c| c == column)
    }

    pub fn rename_db(&self) -> &RenameMap {
        &self.rename_db
    }
}

#[derive(Debug, Clone)]
pub struct ReconstructionOptionsBuilder {
    inner: ReconstructionOptions,
    where_clause: Option<String>,
}

impl Default for ReconstructionOptionsBuilder {
    fn default() -> Self {
        ReconstructionOptionsBuilder {
            inner: ReconstructionOptions {
                need_comment: true,
                ..Default::default()
            },
            where_clause: None,
        }
    }
}

impl ReconstructionOptionsBuilder {
    pub fn ignore_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.ignore_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn rename_db(mut self, map: RenameMap) -> Self {
        self.inner.rename_db = map;
        self
    }

    pub fn rename_tb(mut self, map: RenameMap) -> Self {
        self.inner.rename_tb = map;
        self
    }

    pub fn only_pk(mut self, on: bool) -> Self {
        self.inner.only_pk = on;
        self
    }

    pub fn no_pk(mut self, on: bool) -> Self {
        self.inner.no_pk = on;
        self
    }

    pub fn replace(mut self, on: bool) -> Self {
        self.inner.replace = on;
        self
    }

    pub fn insert_ignore(mut self, on: bool) -> Self {
        self.inner.insert_ignore = on;
        self
    }

    pub fn update_to_replace(mut self, on: bool) -> Self {
        self.inner.update_to_replace = on;
        self
    }

    pub fn remove_not_update_col(mut self, on: bool) -> Self {
        self.inner.remove_not_update_col = on;
        self
    }

    pub fn keep_not_update_col<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.keep_not_update_col = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn flashback(mut self, on: bool) -> Self {
        self.inner.flashback = on;
        self
    }

    pub fn where_clause(mut self, text: impl Into<String>) -> Self {
        self.where_clause = Some(text.into());
        self
    }

    pub fn need_comment(mut self, on: bool) -> Self {
        self.inner.need_comment = on;
        self
    }

    /// 검증 후 불변 옵션 생성
    ///
    /// `remove_not_update_col` 과 where 조건을 함께 쓰면 조건식의 컬럼이
    /// keep 목록에 자동으로 추가된다. 단 ignore 목록에 있는 컬럼은 제외된다.
    pub fn build(self) -> Result<ReconstructionOptions> {
        let mut options = self.inner;

        if options.replace && options.insert_ignore {
            return Err(BinlogSqlError::config(
                "--replace and --insert-ignore cannot be used together",
            ));
        }
        if options.only_pk && options.no_pk {
            return Err(BinlogSqlError::config(
                "--only-pk and --no-pk cannot be used together",
            ));
        }

        if let Some(text) = self.where_clause.as_deref().filter(|t| !t.trim().is_empty()) {
            options.filter = RowFilter::parse(text)?;
        }

        if options.remove_not_update_col {
            let referenced: Vec<String> = options.filter.columns().map(str::to_string).collect();
            for column in referenced {
                if options.is_ignored(&column) {
                    warn!(
                        "Where column `{}` is also ignored; it will not be kept in UPDATE statements",
                        column
                    );
                    continue;
                }
                if !options.is_pinned(&column) {
                    options.keep_not_update_col.push(column);
                }
            }
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_columns_are_pinned_with_remove_not_update_col() {
        let options = ReconstructionOptions::builder()
            .remove_not_update_col(true)
            .where_clause("status = 'paid' or amount > 10")
            .build()
            .unwrap();
        assert!(options.is_pinned("status"));
        assert!(options.is_pinned("amount"));
    }

    #[test]
    fn test_ignored_where_column_is_not_pinned() {
        let options = ReconstructionOptions::builder()
            .remove_not_update_col(true)
            .ignore_columns(["status"])
            .where_clause("status = 'paid'")
            .build()
            .unwrap();
        assert!(!options.is_pinned("status"));
    }

    #[test]
    fn test_conflicting_flags_rejected() {
        let err = ReconstructionOptions::builder()
            .replace(true)
            .insert_ignore(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, BinlogSqlError::Configuration(_)));
    }

    #[test]
    fn test_comments_on_by_default() {
        let options = ReconstructionOptions::builder().build().unwrap();
        assert!(options.need_comment());
        assert!(!options.flashback());
    }
}
