pub mod redshift;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::{IngestionError, SinkError};
use crate::record::{Cell, RecordBatch, TableSchema};

/// The `Warehouse` trait is the contract for the destination system: it runs
/// one SQL statement and reports how many rows it touched. The statement is
/// committed by the time the call returns.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<u64, SinkError>;
}

/// Creates the destination table when needed and appends record batches to
/// it with a single multi-row INSERT per batch.
#[derive(Clone)]
pub struct SinkLoader {
    warehouse: Arc<dyn Warehouse>,
    schema: TableSchema,
}

impl SinkLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, schema: TableSchema) -> Self {
        Self { warehouse, schema }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub async fn ensure_table(&self) -> Result<(), IngestionError> {
        self.warehouse
            .execute(&self.schema.create_table_sql())
            .await?;
        Ok(())
    }

    /// Loads the whole batch or nothing. Returns the number of rows inserted.
    pub async fn load(&self, batch: &RecordBatch) -> Result<usize, IngestionError> {
        self.schema
            .check(batch)
            .map_err(|reason| IngestionError::SchemaMismatch { reason })?;

        self.ensure_table().await?;

        if batch.is_empty() {
            debug!(table = self.schema.table(), "Empty batch, nothing to insert");
            return Ok(0);
        }

        let statement = insert_sql(&self.schema, batch);
        debug!(table = self.schema.table(), statement = %statement, "Running insert");
        self.warehouse.execute(&statement).await?;

        info!(table = self.schema.table(), rows = batch.len(), "Inserted batch");
        Ok(batch.len())
    }
}

/// Renders `INSERT INTO table (columns) VALUES (...), (...)` with every value
/// inlined as a SQL literal. The batch must already match the schema.
pub fn insert_sql(schema: &TableSchema, batch: &RecordBatch) -> String {
    let columns = schema.column_names().collect::<Vec<_>>().join(", ");
    let rows = batch
        .rows()
        .iter()
        .map(|row| {
            let values = row.iter().map(sql_literal).collect::<Vec<_>>().join(", ");
            format!("({values})")
        })
        .collect::<Vec<_>>()
        .join(",\n");

    format!("INSERT INTO {} ({})\nVALUES\n{}", schema.table(), columns, rows)
}

pub fn sql_literal(cell: &Cell) -> String {
    match cell {
        Cell::Null => "NULL".to_string(),
        Cell::Int(v) => v.to_string(),
        Cell::Float(v) => v.to_string(),
        // Redshift treats backslash as an escape character inside literals.
        Cell::Text(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''")),
        Cell::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        Cell::Time(t) => format!("'{}'", t.format("%H:%M:%S%.f")),
    }
}
