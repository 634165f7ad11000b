use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Default tile length when `interval_minutes` is omitted.
pub const DEFAULT_INTERVAL_MINUTES: u32 = 30;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertDoctor {
        id: Ulid,
        specialty: Option<String>,
    },
    DeleteDoctor {
        id: Ulid,
    },
    /// `upsert` is set by `ON CONFLICT`: update the block if it exists.
    InsertSchedule {
        block: ScheduleBlock,
        upsert: bool,
    },
    DeleteSchedule {
        id: Ulid,
    },
    /// `upsert` is set by `ON CONFLICT`: reschedule the existing appointment.
    InsertAppointment {
        id: Ulid,
        doctor_id: Ulid,
        patient_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        reason: Option<String>,
        upsert: bool,
    },
    /// Cancels; the row is kept with status CANCELLED.
    DeleteAppointment {
        id: Ulid,
    },
    SetAppointmentStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    ConfirmToken {
        token: String,
    },
    SelectAvailability {
        doctor_id: Ulid,
        date: NaiveDate,
    },
    SelectDoctors,
    SelectSchedules {
        doctor_id: Ulid,
    },
    SelectAppointments {
        doctor_id: Ulid,
        date: Option<NaiveDate>,
    },
    SelectConfirmation {
        appointment_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let upsert = insert.on.is_some();
    let arity = |min: usize| {
        if values.len() < min {
            Err(SqlError::WrongArity(table_label(&table), min, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "doctors" => {
            arity(1)?;
            Ok(Command::InsertDoctor {
                id: parse_ulid(&values[0])?,
                specialty: values.get(1).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "schedules" => {
            arity(5)?;
            let interval_minutes = match values.get(5) {
                Some(expr) => parse_u32(expr)?,
                None => DEFAULT_INTERVAL_MINUTES,
            };
            let active = match values.get(6) {
                Some(expr) => parse_bool(expr)?,
                None => true,
            };
            let block = ScheduleBlock {
                id: parse_ulid(&values[0])?,
                doctor_id: parse_ulid(&values[1])?,
                day_of_week: parse_u8(&values[2])?,
                range: TimeRange::new(parse_time(&values[3])?, parse_time(&values[4])?),
                interval_minutes,
                active,
            };
            Ok(Command::InsertSchedule { block, upsert })
        }
        "appointments" => {
            arity(6)?;
            Ok(Command::InsertAppointment {
                id: parse_ulid(&values[0])?,
                doctor_id: parse_ulid(&values[1])?,
                patient_id: parse_ulid(&values[2])?,
                date: parse_date(&values[3])?,
                range: TimeRange::new(parse_time(&values[4])?, parse_time(&values[5])?),
                reason: values.get(6).map(parse_string_or_null).transpose()?.flatten(),
                upsert,
            })
        }
        "appointment_status" => {
            arity(2)?;
            let label = parse_string(&values[1])?;
            let status = AppointmentStatus::from_label(&label)
                .ok_or_else(|| SqlError::Parse(format!("unknown status: {label}")))?;
            Ok(Command::SetAppointmentStatus {
                id: parse_ulid(&values[0])?,
                status,
            })
        }
        "confirmations" => {
            arity(1)?;
            Ok(Command::ConfirmToken {
                token: parse_string(&values[0])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_eq_filters(delete.selection.as_ref())?;
    let id = required_ulid(&filters, "id")?;

    match table.as_str() {
        "doctors" => Ok(Command::DeleteDoctor { id }),
        "schedules" => Ok(Command::DeleteSchedule { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = collect_eq_filters(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            doctor_id: required_ulid(&filters, "doctor_id")?,
            date: parse_date(find_filter(&filters, "date").ok_or(SqlError::MissingFilter("date"))?)?,
        }),
        "doctors" => Ok(Command::SelectDoctors),
        "schedules" => Ok(Command::SelectSchedules {
            doctor_id: required_ulid(&filters, "doctor_id")?,
        }),
        "appointments" => Ok(Command::SelectAppointments {
            doctor_id: required_ulid(&filters, "doctor_id")?,
            date: find_filter(&filters, "date").map(parse_date).transpose()?,
        }),
        "confirmations" => Ok(Command::SelectConfirmation {
            appointment_id: required_ulid(&filters, "appointment_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND …` into `(column, value)` pairs. Any other
/// operator is rejected rather than silently ignored.
fn collect_eq_filters(selection: Option<&Expr>) -> Result<Vec<(String, &Expr)>, SqlError> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
}

fn find_filter<'a>(filters: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|(col, _)| col == column)
        .map(|(_, expr)| *expr)
}

fn required_ulid(filters: &[(String, &Expr)], column: &'static str) -> Result<Ulid, SqlError> {
    parse_ulid(find_filter(filters, column).ok_or(SqlError::MissingFilter(column))?)
}

fn table_label(table: &str) -> &'static str {
    match table {
        "doctors" => "doctors",
        "schedules" => "schedules",
        "appointments" => "appointments",
        "appointment_status" => "appointment_status",
        "confirmations" => "confirmations",
        _ => "table",
    }
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

/// Values of a single-row INSERT, positional.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
        .map_err(|_| SqlError::Parse(format!("bad time {s:?}: expected HH:MM")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("bad date {s:?}: expected YYYY-MM-DD")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
