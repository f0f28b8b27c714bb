//! 행 이미지 / 쿼리 이벤트 → SQL 재구성
//!
//! 정방향(replay)과 flashback(rollback) 두 방향을 모두 처리한다.
//! flashback 에서는 INSERT ↔ DELETE 가 뒤바뀌고, UPDATE 는 이전/이후 이미지가
//! 서로 바뀐다 (SET 은 이전 값, WHERE 는 이후 값).

use crate::error::{BinlogSqlError, Result};
use crate::events::{CellValue, OperationType, QueryEventData, RowChange, RowImage, TableMeta};
use crate::offset::BinlogPosition;
use crate::options::ReconstructionOptions;
use crate::window::TIME_FORMAT;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// 생성된 SQL 한 문장
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedStatement {
    pub sql: String,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub position: BinlogPosition,
    /// 문장이 속한 트랜잭션의 시작 위치 (재시작 지점)
    #[serde(default)]
    pub tx_start_pos: u64,
    pub comment: Option<String>,
}

impl GeneratedStatement {
    /// 출력용 한 줄. `comments` 가 꺼져 있으면 주석을 붙이지 않는다.
    pub fn render(&self, comments: bool) -> String {
        match (&self.comment, comments) {
            (Some(comment), true) => format!("{} #{}", self.sql, comment),
            _ => self.sql.clone(),
        }
    }
}

/// 문장의 출처 정보 (주석에 기록)
#[derive(Debug, Clone)]
pub struct StatementContext {
    pub tx_start_pos: u64,
    pub event_end: BinlogPosition,
    pub event_time: NaiveDateTime,
    pub gtid: Option<String>,
}

impl StatementContext {
    fn comment(&self) -> String {
        let mut comment = format!(
            "start {} end {} time {}",
            self.tx_start_pos,
            self.event_end.position,
            self.event_time.format(TIME_FORMAT)
        );
        if let Some(gtid) = &self.gtid {
            comment.push_str(" gtid ");
            comment.push_str(gtid);
        }
        comment
    }
}

/// SQL 재구성 엔진
pub struct SqlBuilder<'a> {
    options: &'a ReconstructionOptions,
}

impl<'a> SqlBuilder<'a> {
    pub fn new(options: &'a ReconstructionOptions) -> Self {
        SqlBuilder { options }
    }

    /// 한 행 → 0 또는 1 개의 문장
    pub fn build_row(
        &self,
        row: &RowChange,
        ctx: &StatementContext,
    ) -> Result<Option<GeneratedStatement>> {
        let (before, after) = validate_images(row)?;

        let filter_image = match row.op {
            OperationType::Insert => after,
            OperationType::Update | OperationType::Delete => before,
        };
        if let Some(image) = filter_image {
            if !self.options.filter.matches(image)? {
                return Ok(None);
            }
        }

        let strip = |image: Option<&RowImage>| {
            image.map(|i| i.retain(|c| !self.options.is_ignored(c)))
        };
        let before = strip(before);
        let after = strip(after);

        let schema = self.options.rename_db.schema(&row.schema).to_string();
        let table = self.options.rename_tb.table(&row.schema, &row.table).to_string();
        let target = format!("{}.{}", quote_ident(&schema), quote_ident(&table));
        let meta = row.table_meta.as_ref();

        let sql = match (row.op, self.options.flashback) {
            (OperationType::Insert, false) => self.insert(&target, after.as_ref(), meta),
            (OperationType::Delete, true) => self.insert(&target, before.as_ref(), meta),
            (OperationType::Delete, false) => self.delete(&target, before.as_ref(), meta),
            (OperationType::Insert, true) => self.undo_insert(&target, after.as_ref()),
            (OperationType::Update, false) => {
                self.update(&target, before.as_ref(), after.as_ref(), meta)
            }
            (OperationType::Update, true) => {
                self.update(&target, after.as_ref(), before.as_ref(), meta)
            }
        };

        Ok(sql.map(|sql| GeneratedStatement {
            sql,
            schema: Some(schema),
            table: Some(table),
            position: ctx.event_end.clone(),
            tx_start_pos: ctx.tx_start_pos,
            comment: Some(ctx.comment()),
        }))
    }

    /// 비 DML 모드: 쿼리 이벤트 원문 통과 (`USE` 스키마만 치환)
    pub fn build_query(
        &self,
        query: &QueryEventData,
        ctx: &StatementContext,
    ) -> Option<GeneratedStatement> {
        let text = query.query.trim().trim_end_matches(';').trim_end();
        if text.is_empty() {
            return None;
        }

        let mut sql = String::new();
        if !query.schema.is_empty() && !query.is_begin() {
            let schema = self.options.rename_db.schema(&query.schema);
            sql.push_str(&format!("USE {};\n", quote_ident(schema)));
        }
        sql.push_str(text);
        sql.push(';');

        Some(GeneratedStatement {
            sql,
            schema: None,
            table: None,
            position: ctx.event_end.clone(),
            tx_start_pos: ctx.tx_start_pos,
            comment: Some(ctx.comment()),
        })
    }

    /// 비 DML 모드에서 Xid 이벤트가 트랜잭션을 닫는다
    pub fn build_commit(&self, ctx: &StatementContext) -> GeneratedStatement {
        GeneratedStatement {
            sql: "COMMIT;".to_string(),
            schema: None,
            table: None,
            position: ctx.event_end.clone(),
            tx_start_pos: ctx.tx_start_pos,
            comment: Some(ctx.comment()),
        }
    }

    fn insert(&self, target: &str, image: Option<&RowImage>, meta: &TableMeta) -> Option<String> {
        let image = image?;
        let image = if self.options.only_pk && !meta.primary_key.is_empty() {
            image.retain(|c| meta.is_primary_key(c))
        } else if self.options.no_pk {
            image.retain(|c| meta.auto_increment.as_deref() != Some(c))
        } else {
            image.clone()
        };
        if image.is_empty() {
            return None;
        }

        let keyword = if self.options.replace {
            "REPLACE INTO"
        } else if self.options.insert_ignore {
            "INSERT IGNORE INTO"
        } else {
            "INSERT INTO"
        };
        Some(values_statement(keyword, target, &image))
    }

    fn delete(&self, target: &str, image: Option<&RowImage>, meta: &TableMeta) -> Option<String> {
        let image = image?;
        let keys = self.key_columns(image, meta);
        let conditions = where_clause(image, |c| keys.iter().any(|k| k == c))?;
        Some(format!("DELETE FROM {} WHERE {} LIMIT 1;", target, conditions))
    }

    /// INSERT 를 되돌리는 DELETE 는 삽입된 이미지 전체와 일치해야 한다
    fn undo_insert(&self, target: &str, image: Option<&RowImage>) -> Option<String> {
        let conditions = where_clause(image?, |_| true)?;
        Some(format!("DELETE FROM {} WHERE {};", target, conditions))
    }

    /// `where_image` 로 행을 찾고 `set_image` 값으로 갱신한다
    fn update(
        &self,
        target: &str,
        where_image: Option<&RowImage>,
        set_image: Option<&RowImage>,
        meta: &TableMeta,
    ) -> Option<String> {
        let (where_image, set_image) = (where_image?, set_image?);

        if self.options.update_to_replace {
            if set_image.is_empty() {
                return None;
            }
            return Some(values_statement("REPLACE INTO", target, set_image));
        }

        let changed = |column: &str| where_image.get(column) != set_image.get(column);
        let keys = self.key_columns(where_image, meta);
        let is_key = |column: &str| keys.iter().any(|k| k == column);

        let set_columns: Vec<(&str, &CellValue)> = if self.options.remove_not_update_col {
            set_image
                .iter()
                .filter(|(c, _)| changed(c) || self.options.is_pinned(c))
                .collect()
        } else {
            set_image
                .iter()
                .filter(|(c, _)| changed(c) || !is_key(c))
                .collect()
        };
        if set_columns.is_empty() || !set_image.columns().any(|c| changed(c)) {
            return None;
        }

        let pinned_in_where = self.options.remove_not_update_col;
        let conditions = where_clause(where_image, |c| {
            is_key(c) || (pinned_in_where && self.options.is_pinned(c))
        })?;

        let assignments: Vec<String> = set_columns
            .iter()
            .map(|(c, v)| format!("{}={}", quote_ident(c), v.to_sql_literal()))
            .collect();
        Some(format!(
            "UPDATE {} SET {} WHERE {} LIMIT 1;",
            target,
            assignments.join(", "),
            conditions
        ))
    }

    /// WHERE 에 쓰일 키 컬럼: 기본키 (no-pk 모드거나 기본키가 없으면 전체 컬럼)
    fn key_columns(&self, image: &RowImage, meta: &TableMeta) -> Vec<String> {
        let pk: Vec<String> = meta
            .primary_key
            .iter()
            .filter(|c| image.contains(c))
            .cloned()
            .collect();
        if self.options.no_pk || pk.is_empty() {
            image.columns().map(str::to_string).collect()
        } else {
            pk
        }
    }
}

fn validate_images(row: &RowChange) -> Result<(Option<&RowImage>, Option<&RowImage>)> {
    let before = row.before.as_ref();
    let after = row.after.as_ref();
    let missing = |which: &str| {
        BinlogSqlError::row(format!(
            "{} row for `{}`.`{}` at {} has no {} image",
            row.op, row.schema, row.table, row.position, which
        ))
    };

    match row.op {
        OperationType::Insert => {
            after.ok_or_else(|| missing("after"))?;
        }
        OperationType::Delete => {
            before.ok_or_else(|| missing("before"))?;
        }
        OperationType::Update => {
            let b = before.ok_or_else(|| missing("before"))?;
            let a = after.ok_or_else(|| missing("after"))?;
            if !b.columns().eq(a.columns()) {
                return Err(BinlogSqlError::row(format!(
                    "UPDATE row for `{}`.`{}` at {} has mismatched before/after columns",
                    row.schema, row.table, row.position
                )));
            }
        }
    }
    Ok((before, after))
}

fn values_statement(keyword: &str, target: &str, image: &RowImage) -> String {
    let columns: Vec<String> = image.columns().map(quote_ident).collect();
    let values: Vec<String> = image.iter().map(|(_, v)| v.to_sql_literal()).collect();
    format!(
        "{} {} ({}) VALUES ({});",
        keyword,
        target,
        columns.join(","),
        values.join(",")
    )
}

fn where_clause<F>(image: &RowImage, mut include: F) -> Option<String>
where
    F: FnMut(&str) -> bool,
{
    let conditions: Vec<String> = image
        .iter()
        .filter(|(c, _)| include(c))
        .map(|(c, v)| {
            if v.is_null() {
                format!("{} IS NULL", quote_ident(c))
            } else {
                format!("{}={}", quote_ident(c), v.to_sql_literal())
            }
        })
        .collect();
    if conditions.is_empty() {
        None
    } else {
        Some(conditions.join(" AND "))
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rename::RenameMap;
    use crate::window::fallback_event_time;
    use std::sync::Arc;

    fn meta() -> Arc<TableMeta> {
        Arc::new(TableMeta {
            columns: vec!["id".into(), "name".into(), "qty".into()],
            primary_key: vec!["id".into()],
            auto_increment: Some("id".into()),
            ..Default::default()
        })
    }

    fn image(id: i64, name: &str, qty: i64) -> RowImage {
        vec![
            ("id".to_string(), CellValue::Int64(id)),
            ("name".to_string(), CellValue::String(name.to_string())),
            ("qty".to_string(), CellValue::Int64(qty)),
        ]
        .into_iter()
        .collect()
    }

    fn row(op: OperationType, before: Option<RowImage>, after: Option<RowImage>) -> RowChange {
        RowChange {
            op,
            schema: "shop".into(),
            table: "items".into(),
            before,
            after,
            position: BinlogPosition::new("mysql-bin.000001", 400),
            table_meta: meta(),
        }
    }

    fn ctx() -> StatementContext {
        StatementContext {
            tx_start_pos: 120,
            event_end: BinlogPosition::new("mysql-bin.000001", 400),
            event_time: fallback_event_time(),
            gtid: None,
        }
    }

    fn sql(options: &ReconstructionOptions, row: &RowChange) -> Option<String> {
        SqlBuilder::new(options)
            .build_row(row, &ctx())
            .unwrap()
            .map(|s| s.sql)
    }

    #[test]
    fn test_forward_insert_and_keywords() {
        let r = row(OperationType::Insert, None, Some(image(1, "pen", 3)));
        let options = ReconstructionOptions::builder().build().unwrap();
        assert_eq!(
            sql(&options, &r).unwrap(),
            "INSERT INTO `shop`.`items` (`id`,`name`,`qty`) VALUES (1,'pen',3);"
        );

        let options = ReconstructionOptions::builder().replace(true).build().unwrap();
        assert!(sql(&options, &r).unwrap().starts_with("REPLACE INTO "));

        let options = ReconstructionOptions::builder().insert_ignore(true).build().unwrap();
        assert!(sql(&options, &r).unwrap().starts_with("INSERT IGNORE INTO "));
    }

    #[test]
    fn test_no_pk_drops_auto_increment_column() {
        let r = row(OperationType::Insert, None, Some(image(1, "pen", 3)));
        let options = ReconstructionOptions::builder().no_pk(true).build().unwrap();
        assert_eq!(
            sql(&options, &r).unwrap(),
            "INSERT INTO `shop`.`items` (`name`,`qty`) VALUES ('pen',3);"
        );
    }

    #[test]
    fn test_only_pk_insert() {
        let r = row(OperationType::Insert, None, Some(image(7, "pen", 3)));
        let options = ReconstructionOptions::builder().only_pk(true).build().unwrap();
        assert_eq!(
            sql(&options, &r).unwrap(),
            "INSERT INTO `shop`.`items` (`id`) VALUES (7);"
        );
    }

    #[test]
    fn test_forward_update_uses_primary_key() {
        let r = row(
            OperationType::Update,
            Some(image(1, "pen", 3)),
            Some(image(1, "pen", 5)),
        );
        let options = ReconstructionOptions::builder().build().unwrap();
        assert_eq!(
            sql(&options, &r).unwrap(),
            "UPDATE `shop`.`items` SET `name`='pen', `qty`=5 WHERE `id`=1 LIMIT 1;"
        );
    }

    #[test]
    fn test_no_pk_update_matches_all_columns() {
        let r = row(
            OperationType::Update,
            Some(image(1, "pen", 3)),
            Some(image(1, "pen", 5)),
        );
        let options = ReconstructionOptions::builder().no_pk(true).build().unwrap();
        assert_eq!(
            sql(&options, &r).unwrap(),
            "UPDATE `shop`.`items` SET `qty`=5 WHERE `id`=1 AND `name`='pen' AND `qty`=3 LIMIT 1;"
        );
    }

    #[test]
    fn test_flashback_update_swaps_images() {
        let r = row(
            OperationType::Update,
            Some(image(1, "pen", 3)),
            Some(image(2, "pen", 5)),
        );
        let options = ReconstructionOptions::builder().flashback(true).build().unwrap();
        assert_eq!(
            sql(&options, &r).unwrap(),
            "UPDATE `shop`.`items` SET `id`=1, `name`='pen', `qty`=3 WHERE `id`=2 LIMIT 1;"
        );
    }

    #[test]
    fn test_forward_delete_and_flashback_delete() {
        let r = row(OperationType::Delete, Some(image(4, "ink", 0)), None);
        let options = ReconstructionOptions::builder().build().unwrap();
        assert_eq!(
            sql(&options, &r).unwrap(),
            "DELETE FROM `shop`.`items` WHERE `id`=4 LIMIT 1;"
        );

        let options = ReconstructionOptions::builder().flashback(true).build().unwrap();
        assert_eq!(
            sql(&options, &r).unwrap(),
            "INSERT INTO `shop`.`items` (`id`,`name`,`qty`) VALUES (4,'ink',0);"
        );
    }

    #[test]
    fn test_flashback_insert_matches_full_image() {
        let r = row(OperationType::Insert, None, Some(image(9, "cap", 1)));
        let options = ReconstructionOptions::builder().flashback(true).build().unwrap();
        assert_eq!(
            sql(&options, &r).unwrap(),
            "DELETE FROM `shop`.`items` WHERE `id`=9 AND `name`='cap' AND `qty`=1;"
        );
    }

    #[test]
    fn test_remove_not_update_col_keeps_where_column() {
        let r = row(
            OperationType::Update,
            Some(image(1, "pen", 3)),
            Some(image(1, "pen", 5)),
        );
        let options = ReconstructionOptions::builder()
            .remove_not_update_col(true)
            .where_clause("name = 'pen'")
            .build()
            .unwrap();
        assert_eq!(
            sql(&options, &r).unwrap(),
            "UPDATE `shop`.`items` SET `name`='pen', `qty`=5 WHERE `id`=1 AND `name`='pen' LIMIT 1;"
        );
    }

    #[test]
    fn test_update_without_remaining_changes_is_dropped() {
        let r = row(
            OperationType::Update,
            Some(image(1, "pen", 3)),
            Some(image(1, "pen", 5)),
        );
        let options = ReconstructionOptions::builder()
            .ignore_columns(["qty"])
            .remove_not_update_col(true)
            .build()
            .unwrap();
        assert_eq!(sql(&options, &r), None);
    }

    #[test]
    fn test_update_to_replace() {
        let r = row(
            OperationType::Update,
            Some(image(1, "pen", 3)),
            Some(image(1, "pen", 5)),
        );
        let options = ReconstructionOptions::builder()
            .update_to_replace(true)
            .build()
            .unwrap();
        assert_eq!(
            sql(&options, &r).unwrap(),
            "REPLACE INTO `shop`.`items` (`id`,`name`,`qty`) VALUES (1,'pen',5);"
        );
    }

    #[test]
    fn test_predicate_filters_rows() {
        let options = ReconstructionOptions::builder()
            .where_clause("qty > 2")
            .build()
            .unwrap();
        let kept = row(OperationType::Delete, Some(image(1, "pen", 3)), None);
        let dropped = row(OperationType::Delete, Some(image(2, "pen", 1)), None);
        assert!(sql(&options, &kept).is_some());
        assert!(sql(&options, &dropped).is_none());
    }

    #[test]
    fn test_ignored_columns_and_renames() {
        let r = row(OperationType::Insert, None, Some(image(1, "pen", 3)));
        let options = ReconstructionOptions::builder()
            .ignore_columns(["qty"])
            .rename_db(RenameMap::parse(&["shop:shop_copy"]).unwrap())
            .rename_tb(RenameMap::parse(&["*:items_v2"]).unwrap())
            .build()
            .unwrap();
        let stmt = SqlBuilder::new(&options).build_row(&r, &ctx()).unwrap().unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO `shop_copy`.`items_v2` (`id`,`name`) VALUES (1,'pen');"
        );
        assert_eq!(stmt.schema.as_deref(), Some("shop_copy"));
        assert_eq!(stmt.table.as_deref(), Some("items_v2"));
    }

    #[test]
    fn test_null_in_where_uses_is_null() {
        let before: RowImage = vec![
            ("id".to_string(), CellValue::Int64(1)),
            ("name".to_string(), CellValue::Null),
            ("qty".to_string(), CellValue::Int64(1)),
        ]
        .into_iter()
        .collect();
        let r = row(OperationType::Delete, Some(before), None);
        let options = ReconstructionOptions::builder().no_pk(true).build().unwrap();
        assert_eq!(
            sql(&options, &r).unwrap(),
            "DELETE FROM `shop`.`items` WHERE `id`=1 AND `name` IS NULL AND `qty`=1 LIMIT 1;"
        );
    }

    #[test]
    fn test_malformed_update_is_row_error() {
        let r = row(OperationType::Update, Some(image(1, "pen", 3)), None);
        let options = ReconstructionOptions::builder().build().unwrap();
        let err = SqlBuilder::new(&options).build_row(&r, &ctx()).unwrap_err();
        assert!(matches!(err, BinlogSqlError::RowReconstruction(_)));
    }

    #[test]
    fn test_query_passthrough_with_schema_rename() {
        let options = ReconstructionOptions::builder()
            .rename_db(RenameMap::parse(&["shop:shop_copy"]).unwrap())
            .build()
            .unwrap();
        let builder = SqlBuilder::new(&options);
        let ddl = QueryEventData {
            schema: "shop".into(),
            query: "ALTER TABLE items ADD COLUMN sku INT".into(),
        };
        let stmt = builder.build_query(&ddl, &ctx()).unwrap();
        assert_eq!(
            stmt.sql,
            "USE `shop_copy`;\nALTER TABLE items ADD COLUMN sku INT;"
        );

        let begin = QueryEventData {
            schema: "shop".into(),
            query: "BEGIN".into(),
        };
        assert_eq!(builder.build_query(&begin, &ctx()).unwrap().sql, "BEGIN;");
    }

    #[test]
    fn test_render_comment() {
        let r = row(OperationType::Delete, Some(image(4, "ink", 0)), None);
        let options = ReconstructionOptions::builder().build().unwrap();
        let mut context = ctx();
        context.gtid = Some("3e11fa47-71ca-11e1-9e33-c80aa9429562:5".into());
        let stmt = SqlBuilder::new(&options).build_row(&r, &context).unwrap().unwrap();
        assert_eq!(
            stmt.render(true),
            "DELETE FROM `shop`.`items` WHERE `id`=4 LIMIT 1; #start 120 end 400 time 1980-01-01 00:00:00 gtid 3e11fa47-71ca-11e1-9e33-c80aa9429562:5"
        );
        assert_eq!(stmt.render(false), "DELETE FROM `shop`.`items` WHERE `id`=4 LIMIT 1;");
    }
}
