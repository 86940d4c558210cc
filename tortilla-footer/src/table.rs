//! In-memory columnar table backing the footer.
//!
//! The footer carries one row per item. Three well-known columns are always
//! present (`tortilla:id`, `tortilla:offset`, `tortilla:length`); everything
//! else is discovered at read time as typed, nullable columns.

use std::collections::HashSet;
use std::fmt;

/// Type descriptor for a footer column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Str,
    I64,
    F64,
    Bool,
    I64List,
    F64List,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Str => "str",
            ColumnType::I64 => "i64",
            ColumnType::F64 => "f64",
            ColumnType::Bool => "bool",
            ColumnType::I64List => "list<i64>",
            ColumnType::F64List => "list<f64>",
        };
        f.write_str(name)
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    I64(i64),
    F64(f64),
    Bool(bool),
    I64List(Vec<i64>),
    F64List(Vec<f64>),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Str(_) => ColumnType::Str,
            Value::I64(_) => ColumnType::I64,
            Value::F64(_) => ColumnType::F64,
            Value::Bool(_) => ColumnType::Bool,
            Value::I64List(_) => ColumnType::I64List,
            Value::F64List(_) => ColumnType::F64List,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("column {column}: expected {expected}, got {found}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        found: ColumnType,
    },

    #[error("column {0} has {1} rows, table has {2}")]
    LengthMismatch(String, usize, usize),

    #[error("duplicate column {0}")]
    DuplicateColumn(String),

    #[error("missing column {0}")]
    MissingColumn(String),
}

/// Typed, nullable storage for one column.
#[derive(Debug, Clone, PartialEq)]
enum ColumnValues {
    Str(Vec<Option<String>>),
    I64(Vec<Option<i64>>),
    F64(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
    I64List(Vec<Option<Vec<i64>>>),
    F64List(Vec<Option<Vec<f64>>>),
}

impl ColumnValues {
    fn new(dtype: ColumnType) -> Self {
        match dtype {
            ColumnType::Str => ColumnValues::Str(Vec::new()),
            ColumnType::I64 => ColumnValues::I64(Vec::new()),
            ColumnType::F64 => ColumnValues::F64(Vec::new()),
            ColumnType::Bool => ColumnValues::Bool(Vec::new()),
            ColumnType::I64List => ColumnValues::I64List(Vec::new()),
            ColumnType::F64List => ColumnValues::F64List(Vec::new()),
        }
    }

    fn dtype(&self) -> ColumnType {
        match self {
            ColumnValues::Str(_) => ColumnType::Str,
            ColumnValues::I64(_) => ColumnType::I64,
            ColumnValues::F64(_) => ColumnType::F64,
            ColumnValues::Bool(_) => ColumnType::Bool,
            ColumnValues::I64List(_) => ColumnType::I64List,
            ColumnValues::F64List(_) => ColumnType::F64List,
        }
    }

    fn len(&self) -> usize {
        match self {
            ColumnValues::Str(v) => v.len(),
            ColumnValues::I64(v) => v.len(),
            ColumnValues::F64(v) => v.len(),
            ColumnValues::Bool(v) => v.len(),
            ColumnValues::I64List(v) => v.len(),
            ColumnValues::F64List(v) => v.len(),
        }
    }

    fn get(&self, row: usize) -> Option<Value> {
        match self {
            ColumnValues::Str(v) => v.get(row)?.clone().map(Value::Str),
            ColumnValues::I64(v) => v.get(row)?.map(Value::I64),
            ColumnValues::F64(v) => v.get(row)?.map(Value::F64),
            ColumnValues::Bool(v) => v.get(row)?.map(Value::Bool),
            ColumnValues::I64List(v) => v.get(row)?.clone().map(Value::I64List),
            ColumnValues::F64List(v) => v.get(row)?.clone().map(Value::F64List),
        }
    }

    fn push_null(&mut self) {
        match self {
            ColumnValues::Str(v) => v.push(None),
            ColumnValues::I64(v) => v.push(None),
            ColumnValues::F64(v) => v.push(None),
            ColumnValues::Bool(v) => v.push(None),
            ColumnValues::I64List(v) => v.push(None),
            ColumnValues::F64List(v) => v.push(None),
        }
    }

    fn push(&mut self, value: Value) -> Result<(), ColumnType> {
        match (self, value) {
            (ColumnValues::Str(v), Value::Str(x)) => v.push(Some(x)),
            (ColumnValues::I64(v), Value::I64(x)) => v.push(Some(x)),
            (ColumnValues::F64(v), Value::F64(x)) => v.push(Some(x)),
            (ColumnValues::Bool(v), Value::Bool(x)) => v.push(Some(x)),
            (ColumnValues::I64List(v), Value::I64List(x)) => v.push(Some(x)),
            (ColumnValues::F64List(v), Value::F64List(x)) => v.push(Some(x)),
            (_, value) => return Err(value.column_type()),
        }
        Ok(())
    }
}

/// A named, typed, nullable column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    values: ColumnValues,
}

impl Column {
    pub fn new(name: impl Into<String>, dtype: ColumnType) -> Self {
        Self {
            name: name.into(),
            values: ColumnValues::new(dtype),
        }
    }

    /// Build a fully-populated column from values; `None` entries are nulls.
    pub fn from_values(
        name: impl Into<String>,
        dtype: ColumnType,
        values: Vec<Option<Value>>,
    ) -> Result<Self, TableError> {
        let mut col = Column::new(name, dtype);
        for value in values {
            col.push(value)?;
        }
        Ok(col)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> ColumnType {
        self.values.dtype()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cell value at `row`; `None` for nulls and out-of-range rows.
    pub fn get(&self, row: usize) -> Option<Value> {
        self.values.get(row)
    }

    pub fn push(&mut self, value: Option<Value>) -> Result<(), TableError> {
        match value {
            None => {
                self.values.push_null();
                Ok(())
            }
            Some(v) => self.values.push(v).map_err(|found| TableError::TypeMismatch {
                column: self.name.clone(),
                expected: self.dtype(),
                found,
            }),
        }
    }

    /// All values of an i64 column in row order, nulls skipped.
    pub fn i64_values(&self) -> Vec<i64> {
        match &self.values {
            ColumnValues::I64(v) => v.iter().flatten().copied().collect(),
            _ => Vec::new(),
        }
    }

    fn take(&self, indices: &[usize]) -> Self {
        let mut out = Column::new(self.name.clone(), self.dtype());
        for &i in indices {
            // take() callers hold valid indices; get() maps OOB to null
            out.push(self.get(i)).expect("same dtype");
        }
        out
    }
}

/// One row of a table, borrowed.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    table: &'a Table,
    row: usize,
}

impl RowRef<'_> {
    pub fn index(&self) -> usize {
        self.row
    }

    pub fn get(&self, column: &str) -> Option<Value> {
        self.table.value(self.row, column)
    }

    pub fn i64(&self, column: &str) -> Option<i64> {
        self.get(column)?.as_i64()
    }

    pub fn str(&self, column: &str) -> Option<String> {
        match self.get(column)? {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Column-oriented table with a dynamic schema.
///
/// Column order is preserved end to end: footer encode/decode round-trips it,
/// and readers rely on it for display ordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from row-oriented input. The schema is the first-seen
    /// column order across all rows; missing cells become nulls.
    pub fn from_rows(rows: &[Vec<(String, Value)>]) -> Result<Self, TableError> {
        let mut table = Table::new();
        for (n_done, row) in rows.iter().enumerate() {
            for (name, value) in row {
                if table.column(name).is_none() {
                    let mut col = Column::new(name.clone(), value.column_type());
                    // Backfill nulls for the rows seen before this column
                    for _ in 0..n_done {
                        col.push(None)?;
                    }
                    table.columns.push(col);
                }
            }
            for col in &mut table.columns {
                let cell = row
                    .iter()
                    .find(|(name, _)| name == col.name())
                    .map(|(_, v)| v.clone());
                col.push(cell)?;
            }
        }
        Ok(table)
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(Column::name).collect()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<Value> {
        self.column(column)?.get(row)
    }

    pub fn i64(&self, row: usize, column: &str) -> Option<i64> {
        self.value(row, column)?.as_i64()
    }

    pub fn str_value(&self, row: usize, column: &str) -> Option<String> {
        match self.value(row, column)? {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Append a column. Its length must match the table (any length is
    /// accepted for an empty table).
    pub fn push_column(&mut self, column: Column) -> Result<(), TableError> {
        if self.column(column.name()).is_some() {
            return Err(TableError::DuplicateColumn(column.name().to_string()));
        }
        if !self.columns.is_empty() && column.len() != self.n_rows() {
            return Err(TableError::LengthMismatch(
                column.name().to_string(),
                column.len(),
                self.n_rows(),
            ));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Swap out a column in place, keeping its position in the schema.
    pub fn replace_column(&mut self, column: Column) -> Result<(), TableError> {
        let n_rows = self.n_rows();
        let slot = self
            .columns
            .iter_mut()
            .find(|c| c.name() == column.name())
            .ok_or_else(|| TableError::MissingColumn(column.name().to_string()))?;
        if column.len() != n_rows {
            return Err(TableError::LengthMismatch(
                column.name().to_string(),
                column.len(),
                n_rows,
            ));
        }
        *slot = column;
        Ok(())
    }

    /// Move the named columns to the front, in the given order. Columns not
    /// named keep their relative order after them.
    pub fn reorder(&mut self, names: &[String]) -> Result<(), TableError> {
        let mut front = Vec::with_capacity(self.columns.len());
        for name in names {
            let idx = self
                .columns
                .iter()
                .position(|c| c.name() == name)
                .ok_or_else(|| TableError::MissingColumn(name.clone()))?;
            front.push(self.columns.remove(idx));
        }
        front.append(&mut self.columns);
        self.columns = front;
        Ok(())
    }

    pub fn drop_columns(&mut self, names: &[&str]) {
        self.columns.retain(|c| !names.contains(&c.name()));
    }

    /// Drop every column whose name starts with `prefix`.
    pub fn drop_prefixed(&mut self, prefix: &str) {
        self.columns.retain(|c| !c.name().starts_with(prefix));
    }

    pub fn rows(&self) -> impl Iterator<Item = RowRef<'_>> {
        (0..self.n_rows()).map(move |row| RowRef { table: self, row })
    }

    /// New table with the given rows, in the given order. Repeats allowed.
    pub fn take(&self, indices: &[usize]) -> Table {
        Table {
            columns: self.columns.iter().map(|c| c.take(indices)).collect(),
        }
    }

    pub fn filter<F>(&self, mut predicate: F) -> Table
    where
        F: FnMut(RowRef<'_>) -> bool,
    {
        let indices: Vec<usize> = self
            .rows()
            .filter(|r| predicate(*r))
            .map(|r| r.index())
            .collect();
        self.take(&indices)
    }

    /// Stable sort of rows by an i64 column, nulls last.
    pub fn sort_by_i64(&self, column: &str) -> Result<Table, TableError> {
        let col = self
            .column(column)
            .ok_or_else(|| TableError::MissingColumn(column.to_string()))?;
        if col.dtype() != ColumnType::I64 {
            return Err(TableError::TypeMismatch {
                column: column.to_string(),
                expected: ColumnType::I64,
                found: col.dtype(),
            });
        }
        let mut indices: Vec<usize> = (0..self.n_rows()).collect();
        indices.sort_by_key(|&i| match col.get(i) {
            Some(Value::I64(v)) => (0, v),
            _ => (1, 0),
        });
        Ok(self.take(&indices))
    }

    /// Vertical concatenation. The result carries the union of both schemas
    /// (self's columns first); cells absent on either side become nulls.
    pub fn vstack(&self, other: &Table) -> Result<Table, TableError> {
        let mut names: Vec<String> = self.column_names().iter().map(|s| s.to_string()).collect();
        let seen: HashSet<&str> = self.column_names().into_iter().collect();
        for col in other.columns() {
            if !seen.contains(col.name()) {
                names.push(col.name().to_string());
            }
        }

        let mut out = Table::new();
        for name in &names {
            let dtype = match (self.column(name), other.column(name)) {
                (Some(a), Some(b)) if a.dtype() != b.dtype() => {
                    return Err(TableError::TypeMismatch {
                        column: name.clone(),
                        expected: a.dtype(),
                        found: b.dtype(),
                    });
                }
                (Some(a), _) => a.dtype(),
                (None, Some(b)) => b.dtype(),
                (None, None) => unreachable!("name came from one of the tables"),
            };
            let mut col = Column::new(name.clone(), dtype);
            for part in [self, other] {
                match part.column(name) {
                    Some(src) => {
                        for row in 0..part.n_rows() {
                            col.push(src.get(row))?;
                        }
                    }
                    None => {
                        for _ in 0..part.n_rows() {
                            col.push(None)?;
                        }
                    }
                }
            }
            out.push_column(col)?;
        }
        Ok(out)
    }
}
