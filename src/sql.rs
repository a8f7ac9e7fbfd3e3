use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_STATEMENT_LEN;
use crate::model::*;

const GUEST_COLUMNS: &[&str] = &["id", "first_name", "last_name"];
const ROOM_COLUMNS: &[&str] = &["id", "number"];
const RESERVATION_COLUMNS: &[&str] = &["id", "guest_id", "room_id", "arrival", "departure", "status"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertGuest {
        id: Ulid,
        first_name: String,
        last_name: Option<String>,
    },
    UpdateGuest {
        id: Ulid,
        patch: GuestPatch,
    },
    InsertRoom {
        id: Ulid,
        number: String,
    },
    UpdateRoom {
        id: Ulid,
        number: String,
    },
    InsertReservation(NewReservation),
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    SelectGuests {
        id: Option<Ulid>,
    },
    SelectRooms {
        id: Option<Ulid>,
    },
    SelectReservations {
        id: Option<Ulid>,
        room_id: Option<Ulid>,
    },
    SelectUpcoming,
    SelectAvailability {
        room_id: Ulid,
        arrival: NaiveDate,
        departure: NaiveDate,
        /// Reservation to leave out of the check, e.g. the one being edited.
        exclude: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_STATEMENT_LEN {
        return Err(SqlError::TooLong(sql.len()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        Statement::Delete(_) => Err(SqlError::Unsupported("records are never deleted".into())),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let values = &rows[0];
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "guests" => {
            let mut f = Fields::from_row("guests", &columns, values, GUEST_COLUMNS)?;
            let cmd = Command::InsertGuest {
                id: parse_ulid_expr(&f.require("id")?)?,
                first_name: parse_string_expr(&f.require("first_name")?)?,
                last_name: f.take("last_name").map(|e| parse_string_or_null(&e)).transpose()?.flatten(),
            };
            f.finish()?;
            Ok(cmd)
        }
        "rooms" => {
            let mut f = Fields::from_row("rooms", &columns, values, ROOM_COLUMNS)?;
            let cmd = Command::InsertRoom {
                id: parse_ulid_expr(&f.require("id")?)?,
                number: parse_string_expr(&f.require("number")?)?,
            };
            f.finish()?;
            Ok(cmd)
        }
        "reservations" => {
            let mut f = Fields::from_row("reservations", &columns, values, RESERVATION_COLUMNS)?;
            let cmd = Command::InsertReservation(NewReservation {
                id: parse_ulid_expr(&f.require("id")?)?,
                guest_id: parse_ulid_expr(&f.require("guest_id")?)?,
                room_id: parse_ulid_expr(&f.require("room_id")?)?,
                arrival: parse_date_expr(&f.require("arrival")?)?,
                departure: parse_date_expr(&f.require("departure")?)?,
                status: f.take("status").map(|e| parse_status_expr(&e)).transpose()?,
            });
            f.finish()?;
            Ok(cmd)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "guests" => {
            let mut f = Fields::from_assignments("guests", assignments)?;
            let patch = GuestPatch {
                first_name: f.take("first_name").map(|e| parse_string_expr(&e)).transpose()?,
                last_name: f.take("last_name").map(|e| parse_string_or_null(&e)).transpose()?,
            };
            f.finish()?;
            Ok(Command::UpdateGuest { id, patch })
        }
        "rooms" => {
            let mut f = Fields::from_assignments("rooms", assignments)?;
            let number = parse_string_expr(&f.require("number")?)?;
            f.finish()?;
            Ok(Command::UpdateRoom { id, number })
        }
        "reservations" => {
            let mut f = Fields::from_assignments("reservations", assignments)?;
            let patch = ReservationPatch {
                status: f.take("status").map(|e| parse_status_expr(&e)).transpose()?,
                room_id: f.take("room_id").map(|e| parse_ulid_expr(&e)).transpose()?,
                guest_id: f.take("guest_id").map(|e| parse_ulid_expr(&e)).transpose()?,
                arrival: f.take("arrival").map(|e| parse_date_expr(&e)).transpose()?,
                departure: f.take("departure").map(|e| parse_date_expr(&e)).transpose()?,
            };
            f.finish()?;
            Ok(Command::UpdateReservation { id, patch })
        }
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
    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "guests" => {
            let mut f = Fields::new("guests", filters)?;
            let id = f.take("id").map(|e| parse_ulid_expr(&e)).transpose()?;
            f.finish()?;
            Ok(Command::SelectGuests { id })
        }
        "rooms" => {
            let mut f = Fields::new("rooms", filters)?;
            let id = f.take("id").map(|e| parse_ulid_expr(&e)).transpose()?;
            f.finish()?;
            Ok(Command::SelectRooms { id })
        }
        "reservations" => {
            let mut f = Fields::new("reservations", filters)?;
            let id = f.take("id").map(|e| parse_ulid_expr(&e)).transpose()?;
            let room_id = f.take("room_id").map(|e| parse_ulid_expr(&e)).transpose()?;
            f.finish()?;
            Ok(Command::SelectReservations { id, room_id })
        }
        "upcoming_reservations" => {
            Fields::new("upcoming_reservations", filters)?.finish()?;
            Ok(Command::SelectUpcoming)
        }
        "availability" => {
            let mut f = Fields::new("availability", filters)?;
            let room_id = parse_ulid_expr(&f.require_filter("room_id")?)?;
            let arrival = parse_date_expr(&f.require_filter("arrival")?)?;
            let departure = parse_date_expr(&f.require_filter("departure")?)?;
            let exclude = f.take("reservation_id").map(|e| parse_ulid_expr(&e)).transpose()?;
            f.finish()?;
            Ok(Command::SelectAvailability {
                room_id,
                arrival,
                departure,
                exclude,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = 1 AND b = 2 ...` into `(column, value)` pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                out.push((col, right.as_ref().clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Named values ──────────────────────────────────────────────

/// Column → value pairs of one statement. Consumers `take` what they know;
/// `finish` rejects the rest.
struct Fields {
    table: &'static str,
    values: Vec<(String, Expr)>,
}

impl Fields {
    fn new(table: &'static str, values: Vec<(String, Expr)>) -> Result<Self, SqlError> {
        for (i, (col, _)) in values.iter().enumerate() {
            if values[..i].iter().any(|(c, _)| c == col) {
                return Err(SqlError::Parse(format!("{table}: column {col} given twice")));
            }
        }
        Ok(Self { table, values })
    }

    /// Pair a VALUES row with its column list, or with `positional` when the
    /// statement names no columns.
    fn from_row(
        table: &'static str,
        columns: &[String],
        row: &[Expr],
        positional: &[&str],
    ) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            if row.len() > positional.len() {
                return Err(SqlError::WrongArity(table, positional.len(), row.len()));
            }
            positional.iter().map(|c| c.to_string()).collect()
        } else {
            if columns.len() != row.len() {
                return Err(SqlError::WrongArity(table, columns.len(), row.len()));
            }
            columns.to_vec()
        };
        Self::new(table, names.into_iter().zip(row.iter().cloned()).collect())
    }

    fn from_assignments(
        table: &'static str,
        assignments: &[ast::Assignment],
    ) -> Result<Self, SqlError> {
        let mut values = Vec::with_capacity(assignments.len());
        for a in assignments {
            let col = match &a.target {
                AssignmentTarget::ColumnName(name) => object_name_last(name),
                AssignmentTarget::Tuple(_) => None,
            }
            .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
            values.push((col, a.value.clone()));
        }
        Self::new(table, values)
    }

    fn take(&mut self, col: &str) -> Option<Expr> {
        let pos = self.values.iter().position(|(c, _)| c == col)?;
        Some(self.values.remove(pos).1)
    }

    fn require(&mut self, col: &'static str) -> Result<Expr, SqlError> {
        self.take(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn require_filter(&mut self, col: &'static str) -> Result<Expr, SqlError> {
        self.take(col).ok_or(SqlError::MissingFilter(col))
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.values.into_iter().next() {
            Some((col, _)) => Err(SqlError::UnknownColumn(self.table, col)),
            None => Ok(()),
        }
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Strings, plus bare numbers so `number = 101` works for rooms.
fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected 'YYYY-MM-DD', got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_status_expr(expr: &Expr) -> Result<Status, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => s.parse().map_err(SqlError::Parse),
        Some(value) => Err(SqlError::Parse(format!("expected status string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    TooLong(usize),
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::TooLong(len) => write!(f, "statement too long: {len} bytes"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
