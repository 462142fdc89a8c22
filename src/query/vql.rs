//! VQL, the restricted read-only query language.
//!
//! A hand-written tokenizer and recursive-descent parser produce a typed
//! plan; execution pushes whitelisted predicates and the row limit down to
//! the store and evaluates projection, grouping, and ordering in the
//! engine. User text never reaches a statement: columns and operators are
//! closed enums, literals travel as bound parameters.

use std::cmp::Ordering;
use std::fmt::Write as _;

use serde_json::{Map, Number, Value};

use crate::error::ApiError;
use crate::model::MetricRow;
use crate::storage::{CompareOp, FilterColumn, Literal, MetricStore, Predicate};

pub const MAX_LIMIT: u32 = 10_000;
pub const DEFAULT_LIMIT: u32 = 1_000;
pub const MAX_WHERE_TERMS: usize = 10;
const MAX_QUERY_LEN: usize = 5_000;

/// Statements that end the parse immediately, wherever they appear.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "ATTACH", "DETACH", "TRUNCATE", "GRANT",
    "REVOKE", "CREATE", "REPLACE", "EXEC", "PRAGMA",
];

#[derive(Debug, Clone, PartialEq)]
pub struct VqlError {
    pub message: String,
    pub token: String,
}

impl VqlError {
    fn new(message: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            token: token.into(),
        }
    }
}

impl From<VqlError> for ApiError {
    fn from(err: VqlError) -> Self {
        ApiError::invalid_query(err.message, &err.token)
    }
}

/// Queryable columns of the `metrics` table. The whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Id,
    Timestamp,
    ServiceName,
    MetricName,
    MetricType,
    Value,
    Endpoint,
    Method,
    StatusCode,
    DurationMs,
    Tags,
    TraceId,
    SpanId,
    Environment,
    Aggregated,
    ResolutionMinutes,
    MinValue,
    MaxValue,
    P50,
    P95,
    P99,
    SampleCount,
    ErrorCount,
}

impl Column {
    pub const ALL: &'static [Column] = &[
        Column::Id,
        Column::Timestamp,
        Column::ServiceName,
        Column::MetricName,
        Column::MetricType,
        Column::Value,
        Column::Endpoint,
        Column::Method,
        Column::StatusCode,
        Column::DurationMs,
        Column::Tags,
        Column::TraceId,
        Column::SpanId,
        Column::Environment,
        Column::Aggregated,
        Column::ResolutionMinutes,
        Column::MinValue,
        Column::MaxValue,
        Column::P50,
        Column::P95,
        Column::P99,
        Column::SampleCount,
        Column::ErrorCount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::Timestamp => "timestamp",
            Column::ServiceName => "service_name",
            Column::MetricName => "metric_name",
            Column::MetricType => "metric_type",
            Column::Value => "value",
            Column::Endpoint => "endpoint",
            Column::Method => "method",
            Column::StatusCode => "status_code",
            Column::DurationMs => "duration_ms",
            Column::Tags => "tags",
            Column::TraceId => "trace_id",
            Column::SpanId => "span_id",
            Column::Environment => "environment",
            Column::Aggregated => "aggregated",
            Column::ResolutionMinutes => "resolution_minutes",
            Column::MinValue => "min_value",
            Column::MaxValue => "max_value",
            Column::P50 => "p50",
            Column::P95 => "p95",
            Column::P99 => "p99",
            Column::SampleCount => "sample_count",
            Column::ErrorCount => "error_count",
        }
    }

    fn parse(ident: &str) -> Option<Self> {
        let lowered = ident.to_ascii_lowercase();
        Column::ALL
            .iter()
            .copied()
            .find(|column| column.as_str() == lowered)
    }

    /// Columns the store adapters can evaluate; the rest are residual.
    fn pushdown(self) -> Option<FilterColumn> {
        match self {
            Column::Timestamp => Some(FilterColumn::Timestamp),
            Column::ServiceName => Some(FilterColumn::ServiceName),
            Column::MetricName => Some(FilterColumn::MetricName),
            Column::MetricType => Some(FilterColumn::MetricType),
            Column::Value => Some(FilterColumn::Value),
            Column::Endpoint => Some(FilterColumn::Endpoint),
            Column::Method => Some(FilterColumn::Method),
            Column::StatusCode => Some(FilterColumn::StatusCode),
            Column::DurationMs => Some(FilterColumn::DurationMs),
            Column::Environment => Some(FilterColumn::Environment),
            Column::Aggregated => Some(FilterColumn::Aggregated),
            Column::ResolutionMinutes => Some(FilterColumn::ResolutionMinutes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Avg,
    Sum,
    Min,
    Max,
    Count,
    P50,
    P95,
    P99,
}

impl AggFunc {
    pub fn as_str(self) -> &'static str {
        match self {
            AggFunc::Avg => "AVG",
            AggFunc::Sum => "SUM",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
            AggFunc::Count => "COUNT",
            AggFunc::P50 => "P50",
            AggFunc::P95 => "P95",
            AggFunc::P99 => "P99",
        }
    }

    fn parse(ident: &str) -> Option<Self> {
        match ident.to_ascii_uppercase().as_str() {
            "AVG" => Some(AggFunc::Avg),
            "SUM" => Some(AggFunc::Sum),
            "MIN" => Some(AggFunc::Min),
            "MAX" => Some(AggFunc::Max),
            "COUNT" => Some(AggFunc::Count),
            "P50" => Some(AggFunc::P50),
            "P95" => Some(AggFunc::P95),
            "P99" => Some(AggFunc::P99),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectItem {
    Column(Column),
    Agg(AggFunc, Column),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    All,
    Items(Vec<SelectItem>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cond {
    pub column: Column,
    pub op: CompareOp,
    pub value: Literal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub projection: Projection,
    pub conds: Vec<Cond>,
    pub group_by: Vec<Column>,
    pub order_by: Option<(Column, SortDir)>,
    pub limit: u32,
}

// Tokenizer

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Int(i64),
    Float(f64),
    Str(String),
    Star,
    Comma,
    LParen,
    RParen,
    Op(CompareOp),
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    tok: Tok,
    text: String,
}

fn tokenize(input: &str) -> Result<Vec<Token>, VqlError> {
    if input.len() > MAX_QUERY_LEN {
        return Err(VqlError::new("query too long", "..."));
    }

    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            ';' => return Err(VqlError::new("statement stacking is not allowed", ";")),
            '\'' | '"' => {
                let quote = ch;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(VqlError::new(
                                "unterminated string literal",
                                format!("{quote}{literal}"),
                            ));
                        }
                        Some(&c) if c == quote => {
                            i += 1;
                            break;
                        }
                        Some(&c) => {
                            literal.push(c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token {
                    text: literal.clone(),
                    tok: Tok::Str(literal),
                });
            }
            '*' => {
                tokens.push(Token {
                    tok: Tok::Star,
                    text: "*".into(),
                });
                i += 1;
            }
            ',' => {
                tokens.push(Token {
                    tok: Tok::Comma,
                    text: ",".into(),
                });
                i += 1;
            }
            '(' => {
                tokens.push(Token {
                    tok: Tok::LParen,
                    text: "(".into(),
                });
                i += 1;
            }
            ')' => {
                tokens.push(Token {
                    tok: Tok::RParen,
                    text: ")".into(),
                });
                i += 1;
            }
            '=' => {
                tokens.push(Token {
                    tok: Tok::Op(CompareOp::Eq),
                    text: "=".into(),
                });
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token {
                        tok: Tok::Op(CompareOp::Ne),
                        text: "!=".into(),
                    });
                    i += 2;
                } else {
                    return Err(VqlError::new("unexpected character", "!"));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token {
                        tok: Tok::Op(CompareOp::Le),
                        text: "<=".into(),
                    });
                    i += 2;
                } else {
                    tokens.push(Token {
                        tok: Tok::Op(CompareOp::Lt),
                        text: "<".into(),
                    });
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token {
                        tok: Tok::Op(CompareOp::Ge),
                        text: ">=".into(),
                    });
                    i += 2;
                } else {
                    tokens.push(Token {
                        tok: Tok::Op(CompareOp::Gt),
                        text: ">".into(),
                    });
                    i += 1;
                }
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                return Err(VqlError::new("comments are not allowed", "--"));
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                return Err(VqlError::new("comments are not allowed", "/*"));
            }
            '-' | '0'..='9' => {
                let start = i;
                i += 1;
                let mut is_float = false;
                while let Some(&c) = chars.get(i) {
                    if c.is_ascii_digit() {
                        i += 1;
                    } else if c == '.' && !is_float {
                        is_float = true;
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let tok = if is_float {
                    Tok::Float(
                        text.parse::<f64>()
                            .map_err(|_| VqlError::new("malformed number", &text))?,
                    )
                } else {
                    Tok::Int(
                        text.parse::<i64>()
                            .map_err(|_| VqlError::new("malformed number", &text))?,
                    )
                };
                tokens.push(Token { tok, text });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while let Some(&c) = chars.get(i) {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word: String = chars[start..i].iter().collect();
                let upper = word.to_ascii_uppercase();
                if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
                    return Err(VqlError::new("write statements are not allowed", upper));
                }
                tokens.push(Token {
                    text: word.clone(),
                    tok: Tok::Word(word),
                });
            }
            other => {
                return Err(VqlError::new("unexpected character", other.to_string()));
            }
        }
    }
    Ok(tokens)
}

// Parser

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(
            self.peek(),
            Some(Token { tok: Tok::Word(word), .. }) if word.eq_ignore_ascii_case(keyword)
        )
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), VqlError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            let found = self.peek().map(|t| t.text.clone()).unwrap_or_default();
            Err(VqlError::new(format!("expected {keyword}"), found))
        }
    }

    fn expect_column(&mut self) -> Result<Column, VqlError> {
        match self.next() {
            Some(Token { tok: Tok::Word(word), .. }) => Column::parse(&word)
                .ok_or_else(|| VqlError::new("unknown column", word)),
            Some(token) => Err(VqlError::new("expected a column name", token.text)),
            None => Err(VqlError::new("expected a column name", "")),
        }
    }
}

/// Parse a VQL query, enforcing the safety contract.
pub fn parse(input: &str) -> Result<Query, VqlError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };

    parser.expect_keyword("SELECT")?;

    let projection = if matches!(parser.peek(), Some(Token { tok: Tok::Star, .. })) {
        parser.next();
        Projection::All
    } else {
        let mut items = vec![parse_select_item(&mut parser)?];
        while matches!(parser.peek(), Some(Token { tok: Tok::Comma, .. })) {
            parser.next();
            items.push(parse_select_item(&mut parser)?);
        }
        Projection::Items(items)
    };

    parser.expect_keyword("FROM")?;
    match parser.next() {
        Some(Token { tok: Tok::Word(table), .. }) if table.eq_ignore_ascii_case("metrics") => {}
        Some(token) => return Err(VqlError::new("unknown table", token.text)),
        None => return Err(VqlError::new("expected a table name", "")),
    }

    let mut conds = Vec::new();
    if parser.eat_keyword("WHERE") {
        conds.push(parse_cond(&mut parser)?);
        while parser.eat_keyword("AND") {
            if conds.len() >= MAX_WHERE_TERMS {
                let token = parser.peek().map(|t| t.text.clone()).unwrap_or_default();
                return Err(VqlError::new(
                    format!("at most {MAX_WHERE_TERMS} WHERE terms"),
                    token,
                ));
            }
            conds.push(parse_cond(&mut parser)?);
        }
    }

    let mut group_by = Vec::new();
    if parser.eat_keyword("GROUP") {
        parser.expect_keyword("BY")?;
        group_by.push(parser.expect_column()?);
        while matches!(parser.peek(), Some(Token { tok: Tok::Comma, .. })) {
            parser.next();
            group_by.push(parser.expect_column()?);
        }
    }

    let mut order_by = None;
    if parser.eat_keyword("ORDER") {
        parser.expect_keyword("BY")?;
        let column = parser.expect_column()?;
        let dir = if parser.eat_keyword("DESC") {
            SortDir::Desc
        } else {
            // ASC is the default and may be written explicitly.
            parser.eat_keyword("ASC");
            SortDir::Asc
        };
        order_by = Some((column, dir));
    }

    let mut limit = DEFAULT_LIMIT;
    if parser.eat_keyword("LIMIT") {
        match parser.next() {
            Some(Token { tok: Tok::Int(value), text }) => {
                if value <= 0 || value > MAX_LIMIT as i64 {
                    return Err(VqlError::new(
                        format!("LIMIT must be in 1..={MAX_LIMIT}"),
                        text,
                    ));
                }
                limit = value as u32;
            }
            Some(token) => return Err(VqlError::new("expected a LIMIT value", token.text)),
            None => return Err(VqlError::new("expected a LIMIT value", "")),
        }
    }

    if let Some(trailing) = parser.peek() {
        return Err(VqlError::new("unexpected trailing input", trailing.text.clone()));
    }

    Ok(Query {
        projection,
        conds,
        group_by,
        order_by,
        limit,
    })
}

fn parse_select_item(parser: &mut Parser) -> Result<SelectItem, VqlError> {
    let word = match parser.next() {
        Some(Token { tok: Tok::Word(word), .. }) => word,
        Some(token) => return Err(VqlError::new("expected a column or function", token.text)),
        None => return Err(VqlError::new("expected a column or function", "")),
    };

    let is_call = matches!(parser.peek(), Some(Token { tok: Tok::LParen, .. }));
    if is_call {
        let func = AggFunc::parse(&word).ok_or_else(|| VqlError::new("unknown function", word))?;
        parser.next(); // (
        let column = parser.expect_column()?;
        match parser.next() {
            Some(Token { tok: Tok::RParen, .. }) => Ok(SelectItem::Agg(func, column)),
            Some(token) => Err(VqlError::new("expected )", token.text)),
            None => Err(VqlError::new("expected )", "")),
        }
    } else {
        let column =
            Column::parse(&word).ok_or_else(|| VqlError::new("unknown column", word))?;
        Ok(SelectItem::Column(column))
    }
}

fn parse_cond(parser: &mut Parser) -> Result<Cond, VqlError> {
    let column = parser.expect_column()?;
    let op = match parser.next() {
        Some(Token { tok: Tok::Op(op), .. }) => op,
        Some(token) => return Err(VqlError::new("expected a comparison operator", token.text)),
        None => return Err(VqlError::new("expected a comparison operator", "")),
    };
    let value = match parser.next() {
        Some(Token { tok: Tok::Int(value), .. }) => Literal::Int(value),
        Some(Token { tok: Tok::Float(value), .. }) => Literal::Float(value),
        Some(Token { tok: Tok::Str(value), .. }) => Literal::Str(value),
        Some(token) => return Err(VqlError::new("expected a literal", token.text)),
        None => return Err(VqlError::new("expected a literal", "")),
    };
    Ok(Cond { column, op, value })
}

/// Render a query back to canonical text. `parse(unparse(q)) == q` for
/// every query `parse` accepts.
pub fn unparse(query: &Query) -> String {
    let mut out = String::from("SELECT ");
    match &query.projection {
        Projection::All => out.push('*'),
        Projection::Items(items) => {
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                match item {
                    SelectItem::Column(column) => out.push_str(column.as_str()),
                    SelectItem::Agg(func, column) => {
                        let _ = write!(out, "{}({})", func.as_str(), column.as_str());
                    }
                }
            }
        }
    }
    out.push_str(" FROM metrics");
    for (index, cond) in query.conds.iter().enumerate() {
        out.push_str(if index == 0 { " WHERE " } else { " AND " });
        let _ = write!(out, "{} {} ", cond.column.as_str(), cond.op.as_sql());
        match &cond.value {
            Literal::Int(value) => {
                let _ = write!(out, "{value}");
            }
            Literal::Float(value) => {
                let _ = write!(out, "{value:?}");
            }
            Literal::Str(value) => {
                let _ = write!(out, "'{value}'");
            }
        }
    }
    if !query.group_by.is_empty() {
        out.push_str(" GROUP BY ");
        for (index, column) in query.group_by.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            out.push_str(column.as_str());
        }
    }
    if let Some((column, dir)) = &query.order_by {
        let _ = write!(
            out,
            " ORDER BY {} {}",
            column.as_str(),
            match dir {
                SortDir::Asc => "ASC",
                SortDir::Desc => "DESC",
            }
        );
    }
    let _ = write!(out, " LIMIT {}", query.limit);
    out
}

// Execution

/// Parse and execute a query against the store.
pub async fn execute(
    store: &dyn MetricStore,
    input: &str,
) -> Result<Vec<Map<String, Value>>, ApiError> {
    let query = parse(input)?;
    run(store, &query).await
}

pub async fn run(
    store: &dyn MetricStore,
    query: &Query,
) -> Result<Vec<Map<String, Value>>, ApiError> {
    let mut pushdown = Vec::new();
    let mut residual = Vec::new();
    for cond in &query.conds {
        match cond.column.pushdown() {
            Some(column) => pushdown.push(Predicate {
                column,
                op: cond.op,
                value: cond.value.clone(),
            }),
            None => residual.push(cond.clone()),
        }
    }

    let aggregating = query.projection_aggregates() || !query.group_by.is_empty();
    // The row limit only pushes down when nothing is evaluated post-fetch
    // and the requested order matches the store's timestamp order.
    let order_matches_store = matches!(
        query.order_by,
        None | Some((Column::Timestamp, SortDir::Asc))
    );
    let fetch_limit = if aggregating || !residual.is_empty() || !order_matches_store {
        MAX_LIMIT
    } else {
        query.limit
    };

    let mut rows = store.fetch_rows(&pushdown, fetch_limit).await?;
    rows.retain(|row| residual.iter().all(|cond| cond_matches(row, cond)));

    let mut out = if aggregating {
        aggregate_rows(query, &rows)
    } else {
        project_rows(query, &rows)
    };

    if let Some((column, dir)) = &query.order_by {
        let key = column.as_str();
        out.sort_by(|a, b| {
            let ordering = compare_json(a.get(key), b.get(key));
            match dir {
                SortDir::Asc => ordering,
                SortDir::Desc => ordering.reverse(),
            }
        });
    }
    out.truncate(query.limit as usize);
    Ok(out)
}

impl Query {
    fn projection_aggregates(&self) -> bool {
        match &self.projection {
            Projection::All => false,
            Projection::Items(items) => items
                .iter()
                .any(|item| matches!(item, SelectItem::Agg(_, _))),
        }
    }
}

fn project_rows(query: &Query, rows: &[MetricRow]) -> Vec<Map<String, Value>> {
    rows.iter()
        .map(|row| {
            let mut record = Map::new();
            match &query.projection {
                Projection::All => {
                    for column in Column::ALL {
                        record.insert(column.as_str().to_string(), column_value(row, *column));
                    }
                }
                Projection::Items(items) => {
                    for item in items {
                        if let SelectItem::Column(column) = item {
                            record
                                .insert(column.as_str().to_string(), column_value(row, *column));
                        }
                    }
                }
            }
            record
        })
        .collect()
}

fn aggregate_rows(query: &Query, rows: &[MetricRow]) -> Vec<Map<String, Value>> {
    use std::collections::BTreeMap;

    let mut groups: BTreeMap<String, Vec<&MetricRow>> = BTreeMap::new();
    for row in rows {
        let key = query
            .group_by
            .iter()
            .map(|column| column_value(row, *column).to_string())
            .collect::<Vec<_>>()
            .join("\u{1f}");
        groups.entry(key).or_default().push(row);
    }

    let items: Vec<SelectItem> = match &query.projection {
        Projection::All => query.group_by.iter().map(|c| SelectItem::Column(*c)).collect(),
        Projection::Items(items) => items.clone(),
    };

    groups
        .into_values()
        .map(|group| {
            let mut record = Map::new();
            for column in &query.group_by {
                if let Some(first) = group.first() {
                    record.insert(column.as_str().to_string(), column_value(first, *column));
                }
            }
            for item in &items {
                match item {
                    SelectItem::Column(column) => {
                        if let Some(first) = group.first() {
                            record
                                .entry(column.as_str().to_string())
                                .or_insert_with(|| column_value(first, *column));
                        }
                    }
                    SelectItem::Agg(func, column) => {
                        let key = format!("{}({})", func.as_str(), column.as_str());
                        record.insert(key, aggregate_value(*func, *column, &group));
                    }
                }
            }
            record
        })
        .collect()
}

fn aggregate_value(func: AggFunc, column: Column, rows: &[&MetricRow]) -> Value {
    let values: Vec<f64> = rows
        .iter()
        .filter_map(|row| column_number(row, column))
        .collect();
    if func == AggFunc::Count {
        let non_null = rows
            .iter()
            .filter(|row| !column_value(row, column).is_null())
            .count();
        return Value::from(non_null as u64);
    }
    if values.is_empty() {
        return Value::Null;
    }
    let result = match func {
        AggFunc::Avg => values.iter().sum::<f64>() / values.len() as f64,
        AggFunc::Sum => values.iter().sum::<f64>(),
        AggFunc::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggFunc::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggFunc::P50 | AggFunc::P95 | AggFunc::P99 => {
            let mut sorted = values.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let q = match func {
                AggFunc::P50 => 0.50,
                AggFunc::P95 => 0.95,
                _ => 0.99,
            };
            let index = ((sorted.len() as f64) * q) as usize;
            sorted[index.min(sorted.len() - 1)]
        }
        AggFunc::Count => unreachable!(),
    };
    Number::from_f64(result).map(Value::Number).unwrap_or(Value::Null)
}

fn column_value(row: &MetricRow, column: Column) -> Value {
    let float = |value: Option<f64>| {
        value
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    };
    match column {
        Column::Id => Value::from(row.id),
        Column::Timestamp => Value::from(row.timestamp),
        Column::ServiceName => Value::from(row.service_name.clone()),
        Column::MetricName => Value::from(row.metric_name.clone()),
        Column::MetricType => Value::from(row.metric_type.as_str()),
        Column::Value => float(Some(row.value)),
        Column::Endpoint => row.endpoint.clone().map(Value::from).unwrap_or(Value::Null),
        Column::Method => row.method.clone().map(Value::from).unwrap_or(Value::Null),
        Column::StatusCode => row
            .status_code
            .map(|code| Value::from(u64::from(code)))
            .unwrap_or(Value::Null),
        Column::DurationMs => float(row.duration_ms),
        Column::Tags => serde_json::to_value(&row.tags).unwrap_or(Value::Null),
        Column::TraceId => row.trace_id.clone().map(Value::from).unwrap_or(Value::Null),
        Column::SpanId => row.span_id.clone().map(Value::from).unwrap_or(Value::Null),
        Column::Environment => row
            .environment
            .clone()
            .map(Value::from)
            .unwrap_or(Value::Null),
        Column::Aggregated => Value::from(u64::from(row.aggregated)),
        Column::ResolutionMinutes => Value::from(u64::from(row.resolution_minutes)),
        Column::MinValue => float(row.summary.map(|s| s.min_value)),
        Column::MaxValue => float(row.summary.map(|s| s.max_value)),
        Column::P50 => float(row.summary.map(|s| s.p50)),
        Column::P95 => float(row.summary.map(|s| s.p95)),
        Column::P99 => float(row.summary.map(|s| s.p99)),
        Column::SampleCount => row
            .summary
            .map(|s| Value::from(s.sample_count))
            .unwrap_or(Value::Null),
        Column::ErrorCount => row
            .summary
            .map(|s| Value::from(s.error_count))
            .unwrap_or(Value::Null),
    }
}

fn column_number(row: &MetricRow, column: Column) -> Option<f64> {
    match column_value(row, column) {
        Value::Number(number) => number.as_f64(),
        _ => None,
    }
}

fn cond_matches(row: &MetricRow, cond: &Cond) -> bool {
    let lhs = column_value(row, cond.column);
    let ordering = match (&lhs, &cond.value) {
        (Value::Number(number), Literal::Int(rhs)) => {
            number.as_f64().map(|lhs| lhs.total_cmp(&(*rhs as f64)))
        }
        (Value::Number(number), Literal::Float(rhs)) => {
            number.as_f64().map(|lhs| lhs.total_cmp(rhs))
        }
        (Value::String(lhs), Literal::Str(rhs)) => Some(lhs.as_str().cmp(rhs.as_str())),
        _ => None,
    };
    match ordering {
        Some(ordering) => cond.op.matches(ordering),
        // NULL never matches, as in SQL.
        None => false,
    }
}

fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .unwrap_or(f64::NAN)
            .total_cmp(&b.as_f64().unwrap_or(f64::NAN)),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_query() {
        let query = parse(
            "SELECT AVG(value), COUNT(id) FROM metrics \
             WHERE service_name = 'api' AND value > 10 \
             GROUP BY endpoint ORDER BY endpoint DESC LIMIT 50",
        )
        .expect("parse");
        assert_eq!(
            query.projection,
            Projection::Items(vec![
                SelectItem::Agg(AggFunc::Avg, Column::Value),
                SelectItem::Agg(AggFunc::Count, Column::Id),
            ])
        );
        assert_eq!(query.conds.len(), 2);
        assert_eq!(query.group_by, vec![Column::Endpoint]);
        assert_eq!(query.order_by, Some((Column::Endpoint, SortDir::Desc)));
        assert_eq!(query.limit, 50);
    }

    #[test]
    fn missing_limit_gets_the_server_default() {
        let query = parse("SELECT * FROM metrics").expect("parse");
        assert_eq!(query.limit, DEFAULT_LIMIT);
    }

    #[test]
    fn rejects_statement_stacking_with_the_offending_token() {
        let err = parse("SELECT * FROM metrics; DROP TABLE metrics").expect_err("reject");
        assert_eq!(err.token, ";");
    }

    #[test]
    fn semicolon_inside_a_literal_is_fine() {
        let query = parse("SELECT * FROM metrics WHERE endpoint = '/a;b' LIMIT 5").expect("parse");
        assert_eq!(
            query.conds[0].value,
            Literal::Str("/a;b".into()),
        );
    }

    #[test]
    fn rejects_write_keywords_anywhere() {
        for keyword in [
            "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "ATTACH", "DETACH", "TRUNCATE",
            "GRANT", "REVOKE",
        ] {
            let input = format!("SELECT * FROM metrics {keyword} something");
            let err = parse(&input).expect_err("reject");
            assert_eq!(err.token, keyword, "keyword {keyword} not rejected");
        }
    }

    #[test]
    fn rejects_unknown_identifiers() {
        assert_eq!(parse("SELECT * FROM users LIMIT 1").expect_err("table").token, "users");
        assert_eq!(
            parse("SELECT secrets FROM metrics LIMIT 1").expect_err("column").token,
            "secrets"
        );
        assert_eq!(
            parse("SELECT STDDEV(value) FROM metrics LIMIT 1").expect_err("function").token,
            "STDDEV"
        );
    }

    #[test]
    fn rejects_comments() {
        assert_eq!(parse("SELECT * FROM metrics -- sneaky").expect_err("comment").token, "--");
        assert_eq!(parse("SELECT * FROM metrics /* x */").expect_err("comment").token, "/*");
    }

    #[test]
    fn enforces_limit_and_where_caps() {
        let err = parse("SELECT * FROM metrics LIMIT 10001").expect_err("limit");
        assert_eq!(err.token, "10001");

        let conds: Vec<String> = (0..11).map(|i| format!("value > {i}")).collect();
        let input = format!("SELECT * FROM metrics WHERE {}", conds.join(" AND "));
        assert!(parse(&input).is_err());

        let ten: Vec<String> = (0..10).map(|i| format!("value > {i}")).collect();
        let input = format!("SELECT * FROM metrics WHERE {}", ten.join(" AND "));
        assert!(parse(&input).is_ok());
    }

    #[test]
    fn unparse_round_trips() {
        let inputs = [
            "SELECT * FROM metrics LIMIT 100",
            "SELECT service_name, AVG(value) FROM metrics WHERE status_code >= 500 GROUP BY service_name LIMIT 20",
            "SELECT P95(duration_ms) FROM metrics WHERE service_name = 'api' AND value > 1.5 ORDER BY timestamp ASC LIMIT 10",
            "select avg(value) from metrics where endpoint != '/health' limit 7",
        ];
        for input in inputs {
            let query = parse(input).expect("parse");
            let rendered = unparse(&query);
            let reparsed = parse(&rendered).expect("reparse");
            assert_eq!(query, reparsed, "round-trip failed for {input}");
        }
    }
}
