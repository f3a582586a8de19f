use std::collections::HashMap;

use chrono::{NaiveDate, Weekday};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// One window per distinct `id`; each row contributes one day entry.
    DeclareAvailability {
        windows: Vec<AvailabilityWindow>,
    },
    WithdrawAvailability {
        id: Ulid,
    },
    SelectAvailability {
        provider_id: Ulid,
        date: NaiveDate,
    },
    PutSurchargeRule {
        rule: SurchargeRule,
    },
    DeleteSurchargeRule {
        id: Ulid,
    },
    SelectSurchargeRules {
        active_only: bool,
    },
    GenerateSlots {
        provider_id: Ulid,
        date: NaiveDate,
        base_price: Amount,
    },
    SelectSlots {
        provider_id: Ulid,
        date: NaiveDate,
    },
    SelectSlot {
        id: Ulid,
    },
    SelectAvailableSlots {
        provider_id: Ulid,
        date: NaiveDate,
    },
    RevokeSlots {
        provider_id: Ulid,
        date: NaiveDate,
    },
    InsertHold {
        slot_id: Ulid,
        user_id: Ulid,
        ttl_seconds: Option<u64>,
    },
    DeleteHold {
        slot_id: Ulid,
        user_id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        slot_id: Ulid,
        user_id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

// Column order assumed when an INSERT omits its column list.
const AVAILABILITY_COLUMNS: &[&str] = &[
    "id",
    "provider_id",
    "valid_from",
    "valid_until",
    "day",
    "is_available",
    "start_time",
    "end_time",
];
const SURCHARGE_COLUMNS: &[&str] = &["id", "start_time", "end_time", "amount", "is_active"];
const SLOT_COLUMNS: &[&str] = &["provider_id", "date", "base_price"];
const HOLD_COLUMNS: &[&str] = &["slot_id", "user_id", "ttl_seconds"];
const BOOKING_COLUMNS: &[&str] = &["id", "slot_id", "user_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        return Ok(Command::Listen {
            channel: unquote_channel(&trimmed[7..]),
        });
    }
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        return Ok(Command::Unlisten {
            channel: unquote_channel(&trimmed[9..]),
        });
    }

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

fn unquote_channel(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "availability" => {
            let rows = bind_rows("availability", AVAILABILITY_COLUMNS, &columns, &rows)?;
            Ok(Command::DeclareAvailability {
                windows: group_windows(&rows)?,
            })
        }
        "surcharge_rules" => {
            let row = single_row(bind_rows("surcharge_rules", SURCHARGE_COLUMNS, &columns, &rows)?)?;
            Ok(Command::PutSurchargeRule {
                rule: SurchargeRule {
                    id: parse_ulid_expr(row.require("id")?)?,
                    start_time: parse_time_expr(row.require("start_time")?)?,
                    end_time: parse_time_expr(row.require("end_time")?)?,
                    surcharge_amount: parse_i64_expr(row.require("amount")?)?,
                    is_active: match row.get("is_active") {
                        Some(expr) => parse_bool(expr)?,
                        None => true,
                    },
                },
            })
        }
        "slots" => {
            let row = single_row(bind_rows("slots", SLOT_COLUMNS, &columns, &rows)?)?;
            Ok(Command::GenerateSlots {
                provider_id: parse_ulid_expr(row.require("provider_id")?)?,
                date: parse_date_expr(row.require("date")?)?,
                base_price: parse_i64_expr(row.require("base_price")?)?,
            })
        }
        "holds" => {
            let row = single_row(bind_rows("holds", HOLD_COLUMNS, &columns, &rows)?)?;
            let ttl_seconds = match row.get("ttl_seconds") {
                Some(expr) => parse_i64_or_null(expr)?
                    .map(|v| u64::try_from(v).map_err(|_| SqlError::Parse(format!("negative ttl_seconds: {v}"))))
                    .transpose()?,
                None => None,
            };
            Ok(Command::InsertHold {
                slot_id: parse_ulid_expr(row.require("slot_id")?)?,
                user_id: parse_ulid_expr(row.require("user_id")?)?,
                ttl_seconds,
            })
        }
        "bookings" => {
            let row = single_row(bind_rows("bookings", BOOKING_COLUMNS, &columns, &rows)?)?;
            Ok(Command::InsertBooking {
                id: parse_ulid_expr(row.require("id")?)?,
                slot_id: parse_ulid_expr(row.require("slot_id")?)?,
                user_id: parse_ulid_expr(row.require("user_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row addressed by column name.
struct Row<'a> {
    table: &'static str,
    cells: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells.get(column).copied()
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn {
            table: self.table,
            column,
        })
    }
}

/// Pair every row with its column names, falling back to `defaults` when the INSERT omits them.
fn bind_rows<'a>(
    table: &'static str,
    defaults: &[&str],
    columns: &[String],
    rows: &'a [Vec<Expr>],
) -> Result<Vec<Row<'a>>, SqlError> {
    let names: Vec<String> = if columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        columns.to_vec()
    };
    rows.iter()
        .map(|values| {
            // Trailing optional columns may be left out when positional.
            if values.len() > names.len() || (!columns.is_empty() && values.len() != names.len()) {
                return Err(SqlError::WrongArity {
                    table,
                    expected: names.len(),
                    got: values.len(),
                });
            }
            Ok(Row {
                table,
                cells: names.iter().cloned().zip(values.iter()).collect(),
            })
        })
        .collect()
}

fn single_row(mut rows: Vec<Row<'_>>) -> Result<Row<'_>, SqlError> {
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT ({} rows)", rows.len())));
    }
    rows.pop().ok_or(SqlError::Parse("empty VALUES".into()))
}

/// Fold availability rows into windows keyed by `id`, keeping first-seen order.
fn group_windows(rows: &[Row<'_>]) -> Result<Vec<AvailabilityWindow>, SqlError> {
    let mut windows: Vec<AvailabilityWindow> = Vec::new();
    for row in rows {
        let id = parse_ulid_expr(row.require("id")?)?;
        let provider_id = parse_ulid_expr(row.require("provider_id")?)?;
        let valid_from = parse_date_expr(row.require("valid_from")?)?;
        let valid_until = parse_date_expr(row.require("valid_until")?)?;
        let entry = DayEntry {
            selector: parse_day_selector(row.require("day")?)?,
            is_available: match row.get("is_available") {
                Some(expr) => parse_bool(expr)?,
                None => true,
            },
            start_time: parse_time_expr(row.require("start_time")?)?,
            end_time: parse_time_expr(row.require("end_time")?)?,
        };

        match windows.iter_mut().find(|w| w.id == id) {
            Some(window) => {
                if window.provider_id != provider_id
                    || window.valid_from != valid_from
                    || window.valid_until != valid_until
                {
                    return Err(SqlError::Parse(format!(
                        "rows of availability window {id} disagree on provider or validity range"
                    )));
                }
                window.entries.push(entry);
            }
            None => windows.push(AvailabilityWindow {
                id,
                provider_id,
                valid_from,
                valid_until,
                entries: vec![entry],
            }),
        }
    }
    Ok(windows)
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "availability" => Ok(Command::WithdrawAvailability {
            id: filters.ulid("id")?,
        }),
        "surcharge_rules" => Ok(Command::DeleteSurchargeRule {
            id: filters.ulid("id")?,
        }),
        "slots" => Ok(Command::RevokeSlots {
            provider_id: filters.ulid("provider_id")?,
            date: filters.date("date")?,
        }),
        "holds" => Ok(Command::DeleteHold {
            slot_id: filters.ulid("slot_id")?,
            user_id: filters.ulid("user_id")?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id: filters.ulid("id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
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
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            provider_id: filters.ulid("provider_id")?,
            date: filters.date("date")?,
        }),
        "surcharge_rules" => Ok(Command::SelectSurchargeRules {
            active_only: match filters.get("is_active") {
                Some(expr) => parse_bool(expr)?,
                None => false,
            },
        }),
        "slots" if filters.get("id").is_some() => Ok(Command::SelectSlot {
            id: filters.ulid("id")?,
        }),
        "slots" => Ok(Command::SelectSlots {
            provider_id: filters.ulid("provider_id")?,
            date: filters.date("date")?,
        }),
        "available_slots" => Ok(Command::SelectAvailableSlots {
            provider_id: filters.ulid("provider_id")?,
            date: filters.date("date")?,
        }),
        "bookings" => Ok(Command::SelectBooking {
            id: filters.ulid("id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column = value` conjuncts of a WHERE clause.
struct Filters<'a>(HashMap<String, &'a Expr>);

impl<'a> Filters<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.0.get(column).copied()
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.require(column)?)
    }

    fn date(&self, column: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date_expr(self.require(column)?)
    }
}

fn where_filters(selection: Option<&Expr>) -> Result<Filters<'_>, SqlError> {
    let mut filters = HashMap::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut filters)?;
    }
    Ok(Filters(filters))
}

fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on expression {left}")))?;
            out.insert(column, right.as_ref());
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
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

/// Text content of a string or numeric literal.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| SqlError::InvalidDate(s.to_string()))
}

fn parse_time_expr(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    Ok(literal_text(expr)?.parse::<TimeOfDay>()?)
}

/// A calendar date (`2025-03-10`) or a weekday name (`mon`, `Monday`).
fn parse_day_selector(expr: &Expr) -> Result<DaySelector, SqlError> {
    let s = literal_text(expr)?.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(DaySelector::Date(date));
    }
    s.parse::<Weekday>()
        .map(DaySelector::Weekday)
        .map_err(|_| SqlError::InvalidDate(s.to_string()))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_i64_expr(expr)?)),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{table}: expected {expected} values, got {got}")]
    WrongArity {
        table: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{table}: missing column {column}")]
    MissingColumn { table: &'static str, column: &'static str },
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error(transparent)]
    InvalidTime(#[from] TimeFormatError),
    #[error("invalid date: {0:?} (expected YYYY-MM-DD)")]
    InvalidDate(String),
}
