//! `--where` 조건식 파싱 및 평가
//!
//! `id > 10 and name = 'a' or status is null` 처럼 AND 로 묶인 그룹들을
//! OR 로 연결한다. 괄호는 지원하지 않는다.

use crate::error::{BinlogSqlError, Result};
use crate::events::{CellValue, RowImage};
use regex::Regex;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    NotLike,
    Is,
    IsNot,
}

impl CompareOp {
    fn parse(op: &str) -> Option<Self> {
        let normalized = op.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
        match normalized.as_str() {
            "=" => Some(CompareOp::Eq),
            "!=" | "<>" => Some(CompareOp::NotEq),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Ge),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Le),
            "LIKE" => Some(CompareOp::Like),
            "NOT LIKE" => Some(CompareOp::NotLike),
            "IS" => Some(CompareOp::Is),
            "IS NOT" => Some(CompareOp::IsNot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Number(f64, String),
    Text(String),
}

/// 단일 비교 조건
#[derive(Debug, Clone)]
pub struct FilterCondition {
    pub column: String,
    pub op: CompareOp,
    pub value: Literal,
    like: Option<Regex>,
}

impl FilterCondition {
    pub fn new(column: impl Into<String>, op: CompareOp, value: Literal) -> Result<Self> {
        let like = match (&op, &value) {
            (CompareOp::Like | CompareOp::NotLike, Literal::Text(p)) => Some(like_to_regex(p)?),
            (CompareOp::Like | CompareOp::NotLike, Literal::Number(_, raw)) => {
                Some(like_to_regex(raw)?)
            }
            (CompareOp::Like | CompareOp::NotLike, Literal::Null) => {
                return Err(BinlogSqlError::config("LIKE requires a pattern, not NULL"))
            }
            _ => None,
        };
        if matches!(op, CompareOp::Is | CompareOp::IsNot) && value != Literal::Null {
            return Err(BinlogSqlError::config("IS / IS NOT only accept NULL"));
        }
        Ok(FilterCondition {
            column: column.into(),
            op,
            value,
            like,
        })
    }

    pub fn matches(&self, image: &RowImage) -> Result<bool> {
        let cell = image.get(&self.column).ok_or_else(|| {
            BinlogSqlError::row(format!(
                "where condition references unknown column `{}`",
                self.column
            ))
        })?;
        Ok(self.evaluate(cell))
    }

    fn evaluate(&self, cell: &CellValue) -> bool {
        if let Literal::Null = self.value {
            return match self.op {
                CompareOp::Eq | CompareOp::Is => cell.is_null(),
                CompareOp::NotEq | CompareOp::IsNot => !cell.is_null(),
                _ => false,
            };
        }

        let text = match cell.as_text() {
            Some(t) => t,
            None => return false,
        };

        if let Some(re) = &self.like {
            let hit = re.is_match(&text);
            return if self.op == CompareOp::Like { hit } else { !hit };
        }

        let ordering = match &self.value {
            Literal::Number(n, _) => match text.trim().parse::<f64>() {
                Ok(v) => v.partial_cmp(n),
                Err(_) => return false,
            },
            Literal::Text(s) => Some(text.as_str().cmp(s.as_str())),
            Literal::Null => None,
        };

        match ordering {
            Some(ord) => match self.op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::NotEq => ord != Ordering::Equal,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                _ => false,
            },
            None => false,
        }
    }
}

/// OR-of-AND 조건
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    groups: Vec<Vec<FilterCondition>>,
}

impl RowFilter {
    pub fn parse(text: &str) -> Result<Self> {
        let condition_re = Regex::new(
            r"(?is)^\s*`?([A-Za-z0-9_$]+)`?\s*(>=|<=|!=|<>|=|>|<|not\s+like\b|like\b|is\s+not\b|is\b)\s*(.+?)\s*$",
        )
        .map_err(|e| BinlogSqlError::config(e.to_string()))?;

        let mut groups = Vec::new();
        for group_text in split_keyword(text, "or") {
            let mut group = Vec::new();
            for cond_text in split_keyword(&group_text, "and") {
                let caps = condition_re.captures(&cond_text).ok_or_else(|| {
                    BinlogSqlError::config(format!("cannot parse where condition: {}", cond_text.trim()))
                })?;
                let op = CompareOp::parse(&caps[2]).ok_or_else(|| {
                    BinlogSqlError::config(format!("unsupported operator: {}", &caps[2]))
                })?;
                group.push(FilterCondition::new(&caps[1], op, parse_literal(&caps[3])?)?);
            }
            if group.is_empty() {
                return Err(BinlogSqlError::config(format!("empty where group in: {}", text)));
            }
            groups.push(group);
        }
        if groups.is_empty() {
            return Err(BinlogSqlError::config("empty where condition"));
        }
        Ok(RowFilter { groups })
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// 조건식이 참조하는 모든 컬럼
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().flatten().map(|c| c.column.as_str())
    }

    /// 어느 한 그룹이라도 전부 참이면 true. 조건이 없으면 항상 true.
    pub fn matches(&self, image: &RowImage) -> Result<bool> {
        if self.groups.is_empty() {
            return Ok(true);
        }
        for group in &self.groups {
            let mut all = true;
            for cond in group {
                if !cond.matches(image)? {
                    all = false;
                    break;
                }
            }
            if all {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn parse_literal(raw: &str) -> Result<Literal> {
    let raw = raw.trim().trim_end_matches(';').trim();
    if raw.eq_ignore_ascii_case("null") {
        return Ok(Literal::Null);
    }
    for quote in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            let inner = &raw[1..raw.len() - 1];
            let escaped = format!("\\{}", quote);
            return Ok(Literal::Text(inner.replace(&escaped, &quote.to_string())));
        }
    }
    match raw.parse::<f64>() {
        Ok(n) => Ok(Literal::Number(n, raw.to_string())),
        Err(_) => Err(BinlogSqlError::config(format!(
            "where value must be a quoted string, a number or NULL: {}",
            raw
        ))),
    }
}

fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("(?s)^");
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    re.push_str(&regex::escape(&next.to_string()));
                }
            }
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| BinlogSqlError::config(e.to_string()))
}

/// 따옴표 밖에 있는 단어 `keyword` (대소문자 무시) 기준으로 분리
fn split_keyword(text: &str, keyword: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let chars: Vec<char> = text.chars().collect();
    let kw: Vec<char> = keyword.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == '\\' && i + 1 < chars.len() {
                    current.push(chars[i + 1]);
                    i += 1;
                } else if ch == q {
                    quote = None;
                }
            }
            None if ch == '\'' || ch == '"' => {
                quote = Some(ch);
                current.push(ch);
            }
            None => {
                let boundary_before = i == 0 || chars[i - 1].is_whitespace();
                let end = i + kw.len();
                let word_matches = end <= chars.len()
                    && chars[i..end]
                        .iter()
                        .zip(kw.iter())
                        .all(|(a, b)| a.eq_ignore_ascii_case(b));
                let boundary_after = end >= chars.len() || chars[end].is_whitespace();
                if boundary_before && word_matches && boundary_after {
                    parts.push(std::mem::take(&mut current));
                    i = end;
                    continue;
                }
                current.push(ch);
            }
        }
        i += 1;
    }
    parts.push(current);
    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}
