use chrono::DateTime;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// The tables the SQL surface understands. `scenes` and `bookings` are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Artists,
    Stages,
    RunningOrder,
    Conflicts,
}

impl Table {
    fn from_name(name: &str) -> Result<Self, SqlError> {
        match name {
            "artists" => Ok(Table::Artists),
            "stages" | "scenes" => Ok(Table::Stages),
            "running_order" | "bookings" => Ok(Table::RunningOrder),
            "conflicts" => Ok(Table::Conflicts),
            other => Err(SqlError::UnknownTable(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Artists => "artists",
            Table::Stages => "stages",
            Table::RunningOrder => "running_order",
            Table::Conflicts => "conflicts",
        }
    }

    /// Column order assumed by an INSERT without a column list.
    fn insert_columns(&self) -> &'static [&'static str] {
        match self {
            Table::Artists => &["id", "name", "description", "image_url"],
            Table::Stages => &["id", "name", "description", "latitude", "longitude"],
            Table::RunningOrder => &["id", "artist_id", "stage_id", "start", "end"],
            Table::Conflicts => &[],
        }
    }
}

/// Changes to an artist; `None` keeps the current value.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ArtistPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub image_url: Option<Option<String>>,
}

impl ArtistPatch {
    pub fn apply(self, mut profile: ArtistProfile) -> ArtistProfile {
        if let Some(name) = self.name {
            profile.name = name;
        }
        if let Some(description) = self.description {
            profile.description = description;
        }
        if let Some(image_url) = self.image_url {
            profile.image_url = image_url;
        }
        profile
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct StagePatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub latitude: Option<Option<f64>>,
    pub longitude: Option<Option<f64>>,
}

impl StagePatch {
    pub fn apply(self, mut profile: StageProfile) -> StageProfile {
        if let Some(name) = self.name {
            profile.name = name;
        }
        if let Some(description) = self.description {
            profile.description = description;
        }
        if let Some(latitude) = self.latitude {
            profile.latitude = latitude;
        }
        if let Some(longitude) = self.longitude {
            profile.longitude = longitude;
        }
        profile
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BookingPatch {
    pub artist_id: Option<Ulid>,
    pub stage_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl BookingPatch {
    pub fn apply(self, current: &Booking) -> Candidate {
        Candidate {
            artist_id: self.artist_id.unwrap_or(current.artist_id),
            stage_id: self.stage_id.unwrap_or(current.stage_id),
            start: self.start.unwrap_or(current.span.start),
            end: self.end.unwrap_or(current.span.end),
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertArtist { id: Ulid, profile: ArtistProfile },
    UpdateArtist { id: Ulid, patch: ArtistPatch },
    DeleteArtist { id: Ulid },
    InsertStage { id: Ulid, profile: StageProfile },
    UpdateStage { id: Ulid, patch: StagePatch },
    DeleteStage { id: Ulid },
    InsertBooking { id: Ulid, candidate: Candidate },
    UpdateBooking { id: Ulid, patch: BookingPatch },
    DeleteBooking { id: Ulid },
    SelectArtists,
    SelectStages,
    SelectRunningOrder { filter: BookingFilter },
    SelectConflicts { candidate: Candidate, exclude: Option<Ulid> },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| SqlError::Parse(e.to_string()))?;
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
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The table a SELECT reads from. Works on statements that still carry `$n` placeholders.
pub fn select_table(sql: &str) -> Option<Table> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    let from = select.from.first()?;
    Table::from_name(&table_factor_name(&from.relation).ok()?).ok()
}

// ── INSERT ────────────────────────────────────────────────────

/// One INSERT row as `(column, value)` pairs.
struct Row<'a> {
    table: Table,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &'static str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn check_columns(&self) -> Result<(), SqlError> {
        let known = self.table.insert_columns();
        match self.cells.iter().find(|(name, _)| !known.contains(&name.as_str())) {
            Some((name, _)) => Err(SqlError::UnknownColumn {
                table: self.table.as_str(),
                column: name.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = match &insert.table {
        TableObject::TableName(name) => Table::from_name(&object_name_last(name)?)?,
        _ => return Err(SqlError::Parse("unsupported table object in INSERT".into())),
    };
    if table == Table::Conflicts {
        return Err(SqlError::Unsupported("conflicts is read-only".into()));
    }

    let values = insert_rows(insert)?;
    let [values] = values.as_slice() else {
        return Err(SqlError::Unsupported("one row per INSERT".into()));
    };
    let columns: Vec<String> = if insert.columns.is_empty() {
        table.insert_columns().iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table.as_str(), columns.len(), values.len()));
    }
    let row = Row {
        table,
        cells: columns.into_iter().zip(values.iter()).collect(),
    };
    row.check_columns()?;

    let id = parse_ulid(row.require("id")?)?;
    match table {
        Table::Artists => Ok(Command::InsertArtist {
            id,
            profile: ArtistProfile {
                name: parse_string(row.require("name")?)?,
                description: row.get("description").map(parse_opt_string).transpose()?.flatten(),
                image_url: row.get("image_url").map(parse_opt_string).transpose()?.flatten(),
            },
        }),
        Table::Stages => Ok(Command::InsertStage {
            id,
            profile: StageProfile {
                name: parse_string(row.require("name")?)?,
                description: row.get("description").map(parse_opt_string).transpose()?.flatten(),
                latitude: row.get("latitude").map(parse_opt_f64).transpose()?.flatten(),
                longitude: row.get("longitude").map(parse_opt_f64).transpose()?.flatten(),
            },
        }),
        Table::RunningOrder => Ok(Command::InsertBooking {
            id,
            candidate: Candidate {
                artist_id: parse_ulid(row.require("artist_id")?)?,
                stage_id: parse_ulid(row.require("stage_id")?)?,
                start: parse_instant(row.require("start")?)?,
                end: parse_instant(row.require("end")?)?,
            },
        }),
        Table::Conflicts => unreachable!("rejected above"),
    }
}

fn insert_rows(insert: &ast::Insert) -> Result<&Vec<Vec<Expr>>, SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match source.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = Table::from_name(&table_factor_name(&table.relation)?)?;
    let id = extract_where_id(selection)?;
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    let mut sets = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((column, &assignment.value));
    }

    let unknown = |column: &str| SqlError::UnknownColumn {
        table: table.as_str(),
        column: column.to_string(),
    };
    match table {
        Table::Artists => {
            let mut patch = ArtistPatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "description" => patch.description = Some(parse_opt_string(value)?),
                    "image_url" => patch.image_url = Some(parse_opt_string(value)?),
                    other => return Err(unknown(other)),
                }
            }
            Ok(Command::UpdateArtist { id, patch })
        }
        Table::Stages => {
            let mut patch = StagePatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "description" => patch.description = Some(parse_opt_string(value)?),
                    "latitude" => patch.latitude = Some(parse_opt_f64(value)?),
                    "longitude" => patch.longitude = Some(parse_opt_f64(value)?),
                    other => return Err(unknown(other)),
                }
            }
            Ok(Command::UpdateStage { id, patch })
        }
        Table::RunningOrder => {
            let mut patch = BookingPatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "artist_id" => patch.artist_id = Some(parse_ulid(value)?),
                    "stage_id" => patch.stage_id = Some(parse_ulid(value)?),
                    "start" => patch.start = Some(parse_instant(value)?),
                    "end" => patch.end = Some(parse_instant(value)?),
                    other => return Err(unknown(other)),
                }
            }
            Ok(Command::UpdateBooking { id, patch })
        }
        Table::Conflicts => Err(SqlError::Unsupported("conflicts is read-only".into())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    let table = Table::from_name(&table_factor_name(&first.relation)?)?;
    let id = extract_where_id(&delete.selection)?;

    match table {
        Table::Artists => Ok(Command::DeleteArtist { id }),
        Table::Stages => Ok(Command::DeleteStage { id }),
        Table::RunningOrder => Ok(Command::DeleteBooking { id }),
        Table::Conflicts => Err(SqlError::Unsupported("conflicts is read-only".into())),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Default)]
struct Filters {
    artist_id: Option<Ulid>,
    stage_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
    exclude_id: Option<Ulid>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = Table::from_name(&table_factor_name(&from.relation)?)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(table, selection, &mut filters)?;
    }

    match table {
        Table::Artists => Ok(Command::SelectArtists),
        Table::Stages => Ok(Command::SelectStages),
        Table::RunningOrder => Ok(Command::SelectRunningOrder {
            filter: BookingFilter {
                artist_id: filters.artist_id,
                stage_id: filters.stage_id,
            },
        }),
        Table::Conflicts => Ok(Command::SelectConflicts {
            candidate: Candidate {
                artist_id: filters.artist_id.ok_or(SqlError::MissingFilter("artist_id"))?,
                stage_id: filters.stage_id.ok_or(SqlError::MissingFilter("stage_id"))?,
                start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
                end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
            },
            exclude: filters.exclude_id,
        }),
    }
}

/// Whether `column <op> value` is a predicate the table's WHERE clause may AND together.
fn filter_allowed(table: Table, column: &str, op: &ast::BinaryOperator) -> bool {
    use ast::BinaryOperator::{Eq, GtEq, LtEq};
    match table {
        Table::Artists | Table::Stages => false,
        Table::RunningOrder => matches!((column, op), ("artist_id" | "stage_id", Eq)),
        Table::Conflicts => matches!(
            (column, op),
            ("artist_id" | "stage_id" | "exclude_id", Eq) | ("start", GtEq) | ("end", LtEq)
        ),
    }
}

/// Conjunction of the table's allowed predicates, each column at most once.
/// Any other shape is rejected rather than silently widening the result.
fn collect_filters(table: Table, expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    let unsupported = || SqlError::Unsupported(format!("WHERE clause on {}", table.as_str()));
    let (left, op, right) = match expr {
        Expr::Nested(inner) => return collect_filters(table, inner, filters),
        Expr::BinaryOp { left, op, right } => (left, op, right),
        _ => return Err(unsupported()),
    };
    if *op == ast::BinaryOperator::And {
        collect_filters(table, left, filters)?;
        return collect_filters(table, right, filters);
    }
    let column = expr_column_name(left).ok_or_else(unsupported)?;
    if !filter_allowed(table, &column, op) {
        return Err(unsupported());
    }
    let duplicate = match column.as_str() {
        "artist_id" => filters.artist_id.replace(parse_ulid(right)?).is_some(),
        "stage_id" => filters.stage_id.replace(parse_ulid(right)?).is_some(),
        "exclude_id" => filters.exclude_id.replace(parse_ulid(right)?).is_some(),
        "start" => filters.start.replace(parse_instant(right)?).is_some(),
        "end" => filters.end.replace(parse_instant(right)?).is_some(),
        _ => return Err(unsupported()),
    };
    if duplicate {
        return Err(SqlError::Unsupported(format!("{column} filtered twice")));
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Result<String, SqlError> {
    name.0
        .last()
        .and_then(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
            _ => None,
        })
        .ok_or_else(|| SqlError::Parse("empty name".into()))
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn expected(what: &str, expr: &Expr) -> SqlError {
    SqlError::Parse(format!("expected {what}, got {expr}"))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        _ => Err(expected("ULID string", expr)),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(expected("string", expr)),
    }
}

fn parse_opt_string(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr: inner,
    } = expr
    {
        return Ok(-parse_f64(inner)?);
    }
    match extract_value(expr) {
        Some(Value::Number(n, _)) => n
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad number {n}: {e}"))),
        _ => Err(expected("number", expr)),
    }
}

fn parse_opt_f64(expr: &Expr) -> Result<Option<f64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_f64(expr).map(Some),
    }
}

/// Unix milliseconds, given as an integer or as an RFC 3339 string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr: inner,
    } = expr
    {
        return Ok(-parse_instant(inner)?);
    }
    match extract_value(expr) {
        Some(Value::Number(n, _)) => n
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad timestamp {n}: {e}"))),
        Some(Value::SingleQuotedString(s)) => match s.parse::<Ms>() {
            Ok(ms) => Ok(ms),
            Err(_) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}"))),
        },
        _ => Err(expected("timestamp", expr)),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {column} in {table}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
