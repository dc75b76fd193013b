use std::collections::BTreeMap;

use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{BookingRequest, StatusChange};
use crate::model::*;

/// Which bookings a `SELECT … FROM bookings` asks for.
#[derive(Debug, PartialEq)]
pub enum BookingFilter {
    ById(Ulid),
    ByDay { provider: ProviderKey, date: NaiveDate },
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertConfig(ProviderSerialConfig),
    DeactivateConfig {
        id: Ulid,
    },
    UpsertOverride(DateOverride),
    /// The reply carries no id, so clients should send their own. A NULL id
    /// is filled in server-side and is only discoverable through the day listing.
    InsertBooking {
        request: BookingRequest,
        source: BookingSource,
    },
    ChangeStatus {
        booking_id: Ulid,
        change: StatusChange,
    },
    SelectSettings {
        provider: ProviderKey,
        date: NaiveDate,
    },
    SelectSerials {
        provider: ProviderKey,
        date: NaiveDate,
    },
    SelectBookings(BookingFilter),
    SelectConfigs {
        provider: Option<ProviderKey>,
    },
    SelectOverrides {
        config_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Positional VALUES, one row. Column lists are accepted but not reordered.
fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "configs" => {
            require_arity("configs", &values, 9)?;
            let provider = provider_key(&values[1], &values[2], &values[3])?;
            Ok(Command::UpsertConfig(ProviderSerialConfig {
                id: parse_ulid(&values[0])?,
                provider,
                total_slots: parse_u32(&values[4])?,
                window: parse_window(&values[5], &values[6])?
                    .ok_or(SqlError::Parse("config window is required".into()))?,
                price: parse_u64(&values[7])?,
                available_days: parse_days(&values[8])?,
                is_active: match values.get(9) {
                    Some(v) => parse_bool(v)?,
                    None => true,
                },
            }))
        }
        "overrides" => {
            require_arity("overrides", &values, 8)?;
            Ok(Command::UpsertOverride(DateOverride {
                config_id: parse_ulid(&values[0])?,
                date: parse_date(&values[1])?,
                total_slots: optional(&values[2], parse_u32)?,
                window: parse_window(&values[3], &values[4])?,
                price: optional(&values[5], parse_u64)?,
                admin_note: literal_text(&values[6])?,
                enabled: parse_bool(&values[7])?,
            }))
        }
        "bookings" | "walk_ins" => {
            require_arity(if table == "bookings" { "bookings" } else { "walk_ins" }, &values, 7)?;
            let provider = provider_key(&values[1], &values[2], &values[3])?;
            let mut request = BookingRequest::new(
                provider,
                parse_date(&values[4])?,
                parse_u32(&values[5])?,
                required_text(&values[6], "patient_id")?,
            );
            if let Some(id) = optional(&values[0], parse_ulid)? {
                request = request.with_id(id);
            }
            if values.len() >= 9
                && let Some(window) = parse_window(&values[7], &values[8])?
            {
                request = request.with_window(window);
            }
            let source = if table == "bookings" {
                BookingSource::SelfService
            } else {
                BookingSource::Staff
            };
            Ok(Command::InsertBooking { request, source })
        }
        "status_changes" => {
            require_arity("status_changes", &values, 3)?;
            let status = required_text(&values[1], "status")?;
            let actor = required_text(&values[2], "actor")?;
            let change = StatusChange {
                to: BookingStatus::parse(&status)
                    .ok_or_else(|| SqlError::Parse(format!("unknown status: {status}")))?,
                actor: Actor::parse(&actor)
                    .ok_or_else(|| SqlError::Parse(format!("unknown actor: {actor}")))?,
                reason: match values.get(3) {
                    Some(v) => literal_text(v)?,
                    None => None,
                },
            };
            Ok(Command::ChangeStatus {
                booking_id: parse_ulid(&values[0])?,
                change,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn require_arity(table: &'static str, values: &[Expr], min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

fn provider_key(kind: &Expr, id: &Expr, parent: &Expr) -> Result<ProviderKey, SqlError> {
    let kind_text = required_text(kind, "provider_kind")?;
    let kind = ProviderKind::parse(&kind_text)
        .ok_or_else(|| SqlError::Parse(format!("unknown provider kind: {kind_text}")))?;
    Ok(ProviderKey::new(
        kind,
        required_text(id, "provider_id")?,
        literal_text(parent)?,
    ))
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "configs" => Ok(Command::DeactivateConfig {
            id: filter_ulid(&filters, "id")?,
        }),
        _ => Err(SqlError::Unsupported(format!(
            "DELETE FROM {table}: bookings are cancelled through status_changes"
        ))),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = collect_filters(select.selection.as_ref())?;

    match table.as_str() {
        "settings" => Ok(Command::SelectSettings {
            provider: filter_provider(&filters)?,
            date: filter_date(&filters)?,
        }),
        "serials" => Ok(Command::SelectSerials {
            provider: filter_provider(&filters)?,
            date: filter_date(&filters)?,
        }),
        "bookings" => {
            if filters.contains_key("id") {
                return Ok(Command::SelectBookings(BookingFilter::ById(filter_ulid(
                    &filters, "id",
                )?)));
            }
            Ok(Command::SelectBookings(BookingFilter::ByDay {
                provider: filter_provider(&filters)?,
                date: filter_date(&filters)?,
            }))
        }
        "configs" => {
            let provider = if filters.contains_key("provider_kind") {
                Some(filter_provider(&filters)?)
            } else {
                None
            };
            Ok(Command::SelectConfigs { provider })
        }
        "overrides" => Ok(Command::SelectOverrides {
            config_id: filter_ulid(&filters, "config_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Column → literal for every `col = literal` joined by AND. `None` is SQL NULL.
type Filters = BTreeMap<String, Option<String>>;

fn collect_filters(selection: Option<&Expr>) -> Result<Filters, SqlError> {
    let mut filters = Filters::new();
    if let Some(expr) = selection {
        walk_filters(expr, &mut filters)?;
    }
    Ok(filters)
}

fn walk_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => walk_filters(inner, filters),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            walk_filters(left, filters)?;
            walk_filters(right, filters)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            filters.insert(col, literal_text(right)?);
            Ok(())
        }
        Expr::IsNull(inner) => {
            let col = expr_column_name(inner)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {inner}")))?;
            filters.insert(col, None);
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn filter_text(filters: &Filters, col: &'static str) -> Result<String, SqlError> {
    filters
        .get(col)
        .cloned()
        .flatten()
        .ok_or(SqlError::MissingFilter(col))
}

fn filter_ulid(filters: &Filters, col: &'static str) -> Result<Ulid, SqlError> {
    ulid_from_text(&filter_text(filters, col)?)
}

fn filter_provider(filters: &Filters) -> Result<ProviderKey, SqlError> {
    let kind_text = filter_text(filters, "provider_kind")?;
    let kind = ProviderKind::parse(&kind_text)
        .ok_or_else(|| SqlError::Parse(format!("unknown provider kind: {kind_text}")))?;
    Ok(ProviderKey::new(
        kind,
        filter_text(filters, "provider_id")?,
        filters.get("parent_org_id").cloned().flatten(),
    ))
}

/// `date` and `booking_date` are accepted interchangeably.
fn filter_date(filters: &Filters) -> Result<NaiveDate, SqlError> {
    let text = filter_text(filters, "booking_date").or_else(|_| filter_text(filters, "date"))?;
    date_from_text(&text)
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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
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

/// The text of a literal, `None` for NULL. Numbers keep their source text.
fn literal_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(literal_text(expr)?.map(|s| format!("-{s}"))),
        other => Err(SqlError::Parse(format!("expected literal, got {other}"))),
    }
}

fn required_text(expr: &Expr, what: &'static str) -> Result<String, SqlError> {
    literal_text(expr)?.ok_or(SqlError::NullValue(what))
}

fn optional<T>(
    expr: &Expr,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match literal_text(expr)? {
        None => Ok(None),
        Some(_) => parse(expr).map(Some),
    }
}

fn ulid_from_text(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn date_from_text(s: &str) -> Result<NaiveDate, SqlError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    ulid_from_text(&required_text(expr, "id")?)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    date_from_text(&required_text(expr, "date")?)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = required_text(expr, "integer")?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("{s} is not a valid u32")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let s = required_text(expr, "integer")?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("{s} is not a valid amount")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    let s = required_text(expr, "boolean")?;
    match s.to_lowercase().as_str() {
        "true" | "t" | "1" | "yes" => Ok(true),
        "false" | "f" | "0" | "no" => Ok(false),
        _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
    }
}

fn parse_days(expr: &Expr) -> Result<AvailableDays, SqlError> {
    let s = required_text(expr, "available_days")?;
    AvailableDays::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad weekday list: {s}")))
}

/// Both ends or neither. Each end is `HH:MM`.
fn parse_window(start: &Expr, end: &Expr) -> Result<Option<TimeWindow>, SqlError> {
    match (literal_text(start)?, literal_text(end)?) {
        (None, None) => Ok(None),
        (Some(s), Some(e)) => TimeWindow::parse(&s, &e)
            .map(Some)
            .ok_or_else(|| SqlError::Parse(format!("bad time window {s}-{e}, expected HH:MM"))),
        _ => Err(SqlError::Parse(
            "window_start and window_end must both be set or both be NULL".into(),
        )),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("{0} must not be NULL")]
    NullValue(&'static str),
}
