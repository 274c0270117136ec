use sqlparser::ast::{
    self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: RoomId,
        number: String,
        capacity: u32,
        occupancy: u32,
    },
    UpdateRoom {
        id: RoomId,
        number: Option<String>,
        capacity: Option<u32>,
    },
    InsertTenant {
        id: TenantId,
        name: String,
        email: Option<String>,
        room_id: Option<RoomId>,
    },
    DeactivateTenant {
        id: TenantId,
    },
    ReassignTenant {
        id: TenantId,
        room_id: Option<RoomId>,
    },
    SubmitRequest {
        id: RequestId,
        tenant_id: TenantId,
        current_room: RoomId,
        kind: RequestKind,
        reason: String,
        moving_date: Ms,
    },
    ApproveRequest {
        id: RequestId,
        decided_by: String,
    },
    RejectRequest {
        id: RequestId,
        decided_by: String,
        reason: String,
    },
    SelectRequests {
        filter: RequestFilter,
        page: Page,
    },
    SelectRequest {
        id: RequestId,
    },
    SelectOutstanding {
        tenant_id: TenantId,
    },
    SelectRooms,
    SelectTenants,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(table, assignments, selection)
        }
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = insert_values(insert)?;

    match table.as_str() {
        "rooms" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity { table: "rooms", expected: 2, got: values.len() });
            }
            let id = parse_ulid(&values[0])?;
            let number = parse_string(&values[1])?;
            let capacity = if values.len() >= 3 { parse_u32(&values[2])? } else { 1 };
            let occupancy = if values.len() >= 4 { parse_u32(&values[3])? } else { 0 };
            Ok(Command::InsertRoom { id, number, capacity, occupancy })
        }
        "tenants" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity { table: "tenants", expected: 2, got: values.len() });
            }
            let id = parse_ulid(&values[0])?;
            let name = parse_string(&values[1])?;
            let email = if values.len() >= 3 { parse_string_or_null(&values[2])? } else { None };
            let room_id = if values.len() >= 4 { parse_ulid_or_null(&values[3])? } else { None };
            Ok(Command::InsertTenant { id, name, email, room_id })
        }
        "requests" => {
            if values.len() < 7 {
                return Err(SqlError::WrongArity { table: "requests", expected: 7, got: values.len() });
            }
            let id = parse_ulid(&values[0])?;
            let tenant_id = parse_ulid(&values[1])?;
            let kind_label = parse_string(&values[2])?;
            let current_room = parse_ulid(&values[3])?;
            let desired_room = parse_ulid_or_null(&values[4])?;
            let reason = parse_string(&values[5])?;
            let moving_date = parse_i64(&values[6])?;

            let kind = match kind_label.to_lowercase().as_str() {
                "exchange" => {
                    let desired_room =
                        desired_room.ok_or(SqlError::MissingFilter("desired_room_id"))?;
                    RequestKind::Exchange { desired_room }
                }
                "vacate" => {
                    if desired_room.is_some() {
                        return Err(SqlError::Parse(
                            "vacate requests take no desired_room_id".into(),
                        ));
                    }
                    RequestKind::Vacate
                }
                other => return Err(SqlError::Parse(format!("bad request kind: {other}"))),
            };
            Ok(Command::SubmitRequest { id, tenant_id, current_room, kind, reason, moving_date })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::new();
    for assignment in assignments {
        let col = assignment_column(assignment)?;
        set.push((col, &assignment.value));
    }

    match table.as_str() {
        "rooms" => {
            let mut number = None;
            let mut capacity = None;
            for (col, value) in &set {
                match col.as_str() {
                    "number" => number = Some(parse_string(value)?),
                    "capacity" => capacity = Some(parse_u32(value)?),
                    other => return Err(SqlError::Parse(format!("cannot set rooms.{other}"))),
                }
            }
            if number.is_none() && capacity.is_none() {
                return Err(SqlError::Parse("UPDATE rooms with nothing to set".into()));
            }
            Ok(Command::UpdateRoom { id, number, capacity })
        }
        "tenants" => {
            if set.len() != 1 {
                return Err(SqlError::Parse(
                    "UPDATE tenants sets exactly one of active, room_id".into(),
                ));
            }
            let (col, value) = &set[0];
            match col.as_str() {
                "active" => {
                    if parse_bool(value)? {
                        return Err(SqlError::Unsupported(
                            "tenants cannot be reactivated".into(),
                        ));
                    }
                    Ok(Command::DeactivateTenant { id })
                }
                "room_id" => Ok(Command::ReassignTenant {
                    id,
                    room_id: parse_ulid_or_null(value)?,
                }),
                other => Err(SqlError::Parse(format!("cannot set tenants.{other}"))),
            }
        }
        "requests" => {
            let mut status = None;
            let mut decided_by = None;
            let mut reason = None;
            for (col, value) in &set {
                match col.as_str() {
                    "status" => status = Some(parse_string(value)?.to_lowercase()),
                    "decided_by" => decided_by = Some(parse_string(value)?),
                    "rejection_reason" => reason = Some(parse_string(value)?),
                    other => return Err(SqlError::Parse(format!("cannot set requests.{other}"))),
                }
            }
            let status = status.ok_or(SqlError::MissingFilter("status"))?;
            let decided_by = decided_by.ok_or(SqlError::MissingFilter("decided_by"))?;
            match status.as_str() {
                "approved" => Ok(Command::ApproveRequest { id, decided_by }),
                "rejected" => {
                    let reason = reason.ok_or(SqlError::MissingFilter("rejection_reason"))?;
                    Ok(Command::RejectRequest { id, decided_by, reason })
                }
                other => Err(SqlError::Unsupported(format!(
                    "status can only be set to 'approved' or 'rejected', not '{other}'"
                ))),
            }
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

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "tenants" => Ok(Command::SelectTenants),
        "outstanding" => {
            let mut filters = RequestSelection::default();
            if let Some(selection) = &select.selection {
                extract_request_filters(selection, &mut filters)?;
            }
            let tenant_id = filters.tenant.ok_or(SqlError::MissingFilter("tenant_id"))?;
            Ok(Command::SelectOutstanding { tenant_id })
        }
        "requests" => {
            let mut filters = RequestSelection::default();
            if let Some(selection) = &select.selection {
                extract_request_filters(selection, &mut filters)?;
            }
            if let Some(id) = filters.id {
                return Ok(Command::SelectRequest { id });
            }
            let page = extract_page(query)?;
            Ok(Command::SelectRequests {
                filter: RequestFilter {
                    status: filters.status,
                    kind: filters.kind,
                    tenant: filters.tenant,
                    text: filters.text,
                },
                page,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct RequestSelection {
    id: Option<RequestId>,
    status: Option<RequestStatus>,
    kind: Option<KindFilter>,
    tenant: Option<TenantId>,
    text: Option<String>,
}

fn extract_request_filters(expr: &Expr, out: &mut RequestSelection) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_request_filters(left, out)?;
                extract_request_filters(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                match column_name(left).as_deref() {
                    Some("id") => out.id = Some(parse_ulid_expr(right)?),
                    Some("tenant_id") => out.tenant = Some(parse_ulid_expr(right)?),
                    Some("status") => out.status = Some(parse_status(right)?),
                    Some("kind") => out.kind = Some(parse_kind_filter(right)?),
                    _ => return Err(SqlError::Parse(format!("unsupported filter: {left}"))),
                }
            }
            _ => return Err(SqlError::Unsupported(format!("operator {op} in WHERE"))),
        },
        Expr::Like { negated: false, expr, pattern, .. } => {
            if column_name(expr).as_deref() != Some("reason") {
                return Err(SqlError::Parse("LIKE is only supported on reason".into()));
            }
            out.text = Some(parse_like_pattern(pattern)?);
        }
        Expr::Nested(inner) => extract_request_filters(inner, out)?,
        _ => return Err(SqlError::Unsupported(format!("expression {expr} in WHERE"))),
    }
    Ok(())
}

fn extract_page(query: &ast::Query) -> Result<Page, SqlError> {
    let mut page = Page { limit: DEFAULT_PAGE_SIZE, offset: 0 };
    if let Some(ast::LimitClause::LimitOffset { limit, offset, .. }) = &query.limit_clause {
        if let Some(limit) = limit {
            let n = parse_i64_expr(limit)?;
            if n <= 0 || n as usize > MAX_PAGE_SIZE {
                return Err(SqlError::Parse(format!("LIMIT {n} out of range")));
            }
            page.limit = n as usize;
        }
        if let Some(offset) = offset {
            let n = parse_i64_expr(&offset.value)?;
            if n < 0 {
                return Err(SqlError::Parse(format!("OFFSET {n} out of range")));
            }
            page.offset = n as usize;
        }
    }
    Ok(page)
}

fn parse_status(expr: &Expr) -> Result<RequestStatus, SqlError> {
    match parse_string(expr)?.to_lowercase().as_str() {
        "pending" => Ok(RequestStatus::Pending),
        "approved" => Ok(RequestStatus::Approved),
        "rejected" => Ok(RequestStatus::Rejected),
        "completed" => Ok(RequestStatus::Completed),
        other => Err(SqlError::Parse(format!("bad status: {other}"))),
    }
}

fn parse_kind_filter(expr: &Expr) -> Result<KindFilter, SqlError> {
    match parse_string(expr)?.to_lowercase().as_str() {
        "exchange" => Ok(KindFilter::Exchange),
        "vacate" => Ok(KindFilter::Vacate),
        other => Err(SqlError::Parse(format!("bad request kind: {other}"))),
    }
}

fn parse_like_pattern(pattern: &Expr) -> Result<String, SqlError> {
    let raw = parse_string(pattern)?;
    let trimmed = raw.trim_matches('%');
    if trimmed.contains('%') || trimmed.contains('_') {
        return Err(SqlError::Unsupported(
            "only '%text%' LIKE patterns are supported".into(),
        ));
    }
    Ok(trimmed.to_string())
}

// ── Helpers ───────────────────────────────────────────────────

/// Last identifier segment of a (possibly schema-qualified) name.
fn last_ident(name: &ast::ObjectName) -> Result<String, SqlError> {
    match name.0.last() {
        Some(ObjectNamePart::Identifier(ident)) => Ok(ident.value.to_lowercase()),
        _ => Err(SqlError::Parse("empty object name".into())),
    }
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => last_ident(name),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => last_ident(name),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn assignment_column(assignment: &ast::Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => last_ident(name),
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

/// The single VALUES row of an INSERT.
fn insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    match values.rows.as_slice() {
        [] => Err(SqlError::Parse("empty VALUES".into())),
        [row] => Ok(row.clone()),
        _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
    }
}

/// Every UPDATE targets exactly one record: `WHERE id = '...'`.
fn where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    if let Some(Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right }) = selection
        && column_name(left).as_deref() == Some("id")
    {
        return parse_ulid_expr(right);
    }
    Err(SqlError::MissingFilter("id"))
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Unwrap a literal value; anything else (subquery, function, column) is
/// out of dialect.
fn scalar(expr: &Expr) -> Result<&Value, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Ok(value),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match scalar(expr)? {
        Value::SingleQuotedString(s) | Value::Number(s, _) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        other => Err(SqlError::Parse(format!("expected an id, got {other:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64_expr(expr)?);
    }
    match scalar(expr)? {
        Value::Number(s, _) | Value::SingleQuotedString(s) => {
            s.parse().map_err(|e| SqlError::Parse(format!("bad i64: {e}")))
        }
        other => Err(SqlError::Parse(format!("expected a number, got {other:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match scalar(expr)? {
        Value::Null => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match scalar(expr)? {
        Value::SingleQuotedString(s) => Ok(s.clone()),
        other => Err(SqlError::Parse(format!("expected a string, got {other:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match scalar(expr)? {
        Value::Null => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match scalar(expr)? {
        Value::Boolean(b) => Ok(*b),
        Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Value::Number(n, _) => Ok(n != "0"),
        other => Err(SqlError::Parse(format!("expected a bool, got {other:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity {
        table: &'static str,
        expected: usize,
        got: usize,
    },
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity { table, expected, got } => {
                write!(f, "INSERT INTO {table} takes at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
