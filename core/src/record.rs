use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Deserializer};

/// A single sale as it appears in the landed NDJSON files.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SalesRecord {
    pub transaction_id: i64,
    #[serde(deserialize_with = "deserialize_date")]
    pub transaction_date: NaiveDate,
    pub transaction_time: NaiveTime,
    pub transaction_qty: i32,
    pub store_id: i32,
    pub store_location: String,
    pub product_id: i32,
    pub unit_price: f64,
    pub product_category: String,
    pub product_type: String,
    pub product_detail: String,
}

// Exports from the point-of-sale system use either ISO dates or US-style m/d/Y.
fn deserialize_date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&raw, "%m/%d/%Y"))
        .map_err(|_| serde::de::Error::custom(format!("invalid transaction_date `{raw}`")))
}

impl SalesRecord {
    /// Values in [`SALES_COLUMNS`] order.
    pub fn into_row(self) -> Vec<Cell> {
        vec![
            Cell::Int(self.transaction_id),
            Cell::Date(self.transaction_date),
            Cell::Time(self.transaction_time),
            Cell::Int(self.transaction_qty.into()),
            Cell::Int(self.store_id.into()),
            Cell::Text(self.store_location),
            Cell::Int(self.product_id.into()),
            Cell::Float(self.unit_price),
            Cell::Text(self.product_category),
            Cell::Text(self.product_type),
            Cell::Text(self.product_detail),
        ]
    }
}

pub const SALES_COLUMNS: [&str; 11] = [
    "transaction_id",
    "transaction_date",
    "transaction_time",
    "transaction_qty",
    "store_id",
    "store_location",
    "product_id",
    "unit_price",
    "product_category",
    "product_type",
    "product_detail",
];

pub const DEFAULT_TABLE: &str = "sales_coffee";

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
}

/// Ordered rows sharing one column layout. Produced by the extractor and
/// consumed once by the sink loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl RecordBatch {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }

    pub fn from_records(records: Vec<SalesRecord>) -> Self {
        Self {
            columns: SALES_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: records.into_iter().map(SalesRecord::into_row).collect(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Integer,
    Date,
    Time,
    Decimal { precision: u8, scale: u8 },
    Varchar(u16),
}

impl ColumnType {
    pub fn sql(&self) -> String {
        match self {
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Time => "TIME".to_string(),
            ColumnType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
            ColumnType::Varchar(len) => format!("VARCHAR({len})"),
        }
    }

    fn accepts(&self, cell: &Cell) -> bool {
        match (self, cell) {
            (_, Cell::Null) => true,
            (ColumnType::BigInt, Cell::Int(_)) => true,
            (ColumnType::Integer, Cell::Int(v)) => i32::try_from(*v).is_ok(),
            (ColumnType::Date, Cell::Date(_)) => true,
            (ColumnType::Time, Cell::Time(_)) => true,
            (ColumnType::Decimal { .. }, Cell::Int(_)) => true,
            (ColumnType::Decimal { .. }, Cell::Float(v)) => v.is_finite(),
            (ColumnType::Varchar(len), Cell::Text(s)) => s.len() <= usize::from(*len),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    const fn required(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
        }
    }
}

/// The fixed destination table layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    table: String,
    columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn sales(table: impl Into<String>) -> Self {
        use ColumnType::*;

        Self {
            table: table.into(),
            columns: vec![
                ColumnDef::required("transaction_id", BigInt),
                ColumnDef::required("transaction_date", Date),
                ColumnDef::required("transaction_time", Time),
                ColumnDef::required("transaction_qty", Integer),
                ColumnDef::required("store_id", Integer),
                ColumnDef::required("store_location", Varchar(64)),
                ColumnDef::required("product_id", Integer),
                ColumnDef::required("unit_price", Decimal { precision: 10, scale: 2 }),
                ColumnDef::required("product_category", Varchar(64)),
                ColumnDef::required("product_type", Varchar(64)),
                ColumnDef::required("product_detail", Varchar(128)),
            ],
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn create_table_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| {
                let null = if c.nullable { "" } else { " NOT NULL" };
                format!("    {} {}{}", c.name, c.column_type.sql(), null)
            })
            .collect::<Vec<_>>()
            .join(",\n");

        format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n)", self.table, columns)
    }

    /// Checks column order, row arity and per-cell types. Returns a
    /// description of the first mismatch.
    pub fn check(&self, batch: &RecordBatch) -> Result<(), String> {
        if !batch.columns().iter().map(String::as_str).eq(self.column_names()) {
            return Err(format!(
                "expected columns ({}), got ({})",
                self.column_names().collect::<Vec<_>>().join(", "),
                batch.columns().join(", ")
            ));
        }

        for (index, row) in batch.rows().iter().enumerate() {
            if row.len() != self.arity() {
                return Err(format!(
                    "row {index} has {} values, table {} has {} columns",
                    row.len(),
                    self.table,
                    self.arity()
                ));
            }
            for (cell, column) in row.iter().zip(&self.columns) {
                if matches!(cell, Cell::Null) && !column.nullable {
                    return Err(format!("row {index}: column {} is NOT NULL", column.name));
                }
                if !column.column_type.accepts(cell) {
                    return Err(format!(
                        "row {index}: value {cell:?} does not fit column {} {}",
                        column.name,
                        column.column_type.sql()
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Accepts `name` or `schema.name` made of ASCII letters, digits and underscores.
pub fn is_valid_table_identifier(identifier: &str) -> bool {
    let parts: Vec<&str> = identifier.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
