use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// One row of a multi-row booking INSERT.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingRow {
    pub id: Ulid,
    pub theater_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub patient: Option<String>,
    pub procedure: Option<String>,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTheater {
        id: Ulid,
        name: Option<String>,
    },
    UpdateTheater {
        id: Ulid,
        name: Option<String>,
    },
    DeleteTheater {
        id: Ulid,
    },
    InsertBooking {
        row: BookingRow,
    },
    BatchInsertBookings {
        rows: Vec<BookingRow>,
    },
    UpdateBookingTime {
        id: Ulid,
        start: Ms,
        end: Ms,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectTheaters,
    SelectBookings {
        theater_id: Ulid,
    },
    SelectConflicts {
        theater_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    InsertEscalation {
        id: Ulid,
        booking_id: Ulid,
        reason: String,
    },
    DeleteEscalation {
        id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches(';').to_string();
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "theaters" => {
            let values = extract_insert_values(insert)?;
            if values.is_empty() {
                return Err(SqlError::WrongArity("theaters", 1, 0));
            }
            let id = parse_ulid(&values[0])?;
            let name = if values.len() >= 2 {
                parse_string_or_null(&values[1])?
            } else {
                None
            };
            Ok(Command::InsertTheater { id, name })
        }
        "bookings" => {
            let all_rows = extract_all_insert_rows(insert)?;
            let mut rows = Vec::with_capacity(all_rows.len());
            for (i, row) in all_rows.iter().enumerate() {
                rows.push(
                    parse_booking_row(row)
                        .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                );
            }
            if rows.len() == 1 {
                Ok(Command::InsertBooking { row: rows.pop().unwrap() })
            } else {
                Ok(Command::BatchInsertBookings { rows })
            }
        }
        "escalations" => {
            let values = extract_insert_values(insert)?;
            if values.len() < 3 {
                return Err(SqlError::WrongArity("escalations", 3, values.len()));
            }
            Ok(Command::InsertEscalation {
                id: parse_ulid(&values[0])?,
                booking_id: parse_ulid(&values[1])?,
                reason: parse_string(&values[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_booking_row(values: &[Expr]) -> Result<BookingRow, SqlError> {
    if values.len() < 4 {
        return Err(SqlError::WrongArity("bookings", 4, values.len()));
    }
    Ok(BookingRow {
        id: parse_ulid(&values[0])?,
        theater_id: parse_ulid(&values[1])?,
        start: parse_i64(&values[2])?,
        end: parse_i64(&values[3])?,
        patient: if values.len() >= 5 {
            parse_string_or_null(&values[4])?
        } else {
            None
        },
        procedure: if values.len() >= 6 {
            parse_string_or_null(&values[5])?
        } else {
            None
        },
    })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = assignment_column(&a.target)
            .ok_or_else(|| SqlError::Parse("unsupported assignment target".into()))?;
        set.push((col, &a.value));
    }

    match table.as_str() {
        "theaters" => {
            let (_, value) = set
                .iter()
                .find(|(c, _)| c == "name")
                .ok_or(SqlError::MissingFilter("name"))?;
            Ok(Command::UpdateTheater {
                id,
                name: parse_string_or_null(value)?,
            })
        }
        "bookings" => {
            if let Some((_, value)) = set.iter().find(|(c, _)| c == "status") {
                let raw = parse_string(value)?;
                let status: BookingStatus = raw
                    .parse()
                    .map_err(|e: String| SqlError::Parse(e))?;
                return Ok(Command::UpdateBookingStatus { id, status });
            }
            let start = set
                .iter()
                .find(|(c, _)| c == "start")
                .ok_or(SqlError::MissingFilter("start"))?;
            let end = set
                .iter()
                .find(|(c, _)| c == "end")
                .ok_or(SqlError::MissingFilter("end"))?;
            Ok(Command::UpdateBookingTime {
                id,
                start: parse_i64(start.1)?,
                end: parse_i64(end.1)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "theaters" => Ok(Command::DeleteTheater { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "escalations" => Ok(Command::DeleteEscalation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "theaters" => Ok(Command::SelectTheaters),
        "bookings" => {
            let sel = select
                .selection
                .as_ref()
                .ok_or(SqlError::MissingFilter("theater_id"))?;
            let mut theater_id = None;
            extract_eq_filters(sel, &mut |col, value| {
                if col == "theater_id" {
                    theater_id = Some(parse_ulid_expr(value)?);
                }
                Ok(())
            })?;
            Ok(Command::SelectBookings {
                theater_id: theater_id.ok_or(SqlError::MissingFilter("theater_id"))?,
            })
        }
        "conflicts" => {
            let sel = select
                .selection
                .as_ref()
                .ok_or(SqlError::MissingFilter("theater_id"))?;
            let (mut theater_id, mut start, mut end, mut exclude) = (None, None, None, None);
            extract_eq_filters(sel, &mut |col, value| {
                match col {
                    "theater_id" => theater_id = Some(parse_ulid_expr(value)?),
                    "start" => start = Some(parse_i64_expr(value)?),
                    "end" => end = Some(parse_i64_expr(value)?),
                    "exclude" => exclude = Some(parse_ulid_expr(value)?),
                    _ => {}
                }
                Ok(())
            })?;
            Ok(Command::SelectConflicts {
                theater_id: theater_id.ok_or(SqlError::MissingFilter("theater_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                exclude,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Walk an AND-chain of `col = value` terms, invoking the callback per term.
fn extract_eq_filters(
    expr: &Expr,
    on_eq: &mut impl FnMut(&str, &Expr) -> Result<(), SqlError>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_eq_filters(left, on_eq)?;
                extract_eq_filters(right, on_eq)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    on_eq(&col, right)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn assignment_column(target: &ast::AssignmentTarget) -> Option<String> {
    match target {
        ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
