use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{DataPoint, RowError};
use crate::normalize::normalize_row;
use crate::source::SourceRow;
use crate::store::BenchmarkStore;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistOutcome {
    pub inserted: u64,
    pub with_signal: usize,
    pub without_signal: usize,
    pub row_errors: Vec<RowError>,
}

#[derive(Clone)]
pub struct BatchPersister {
    store: Arc<dyn BenchmarkStore>,
    batch_size: usize,
}

impl BatchPersister {
    pub fn new(store: Arc<dyn BenchmarkStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// `rows[i]` is source row `first_row + i`, which becomes its natural key.
    /// A store failure aborts the window; rows already written stay written.
    pub async fn persist(
        &self,
        benchmark_id: Uuid,
        rows: &[SourceRow],
        first_row: usize,
    ) -> Result<PersistOutcome> {
        let mut outcome = PersistOutcome::default();
        let mut batch: Vec<DataPoint> = Vec::with_capacity(self.batch_size);

        for (offset, row) in rows.iter().enumerate() {
            let index = first_row + offset;
            let record = match row {
                Ok(record) => record,
                Err(message) => {
                    outcome.row_errors.push(RowError {
                        row: index,
                        message: message.clone(),
                    });
                    continue;
                }
            };

            let normalized = normalize_row(benchmark_id, index as i64, record);
            if !normalized.has_signal {
                outcome.without_signal += 1;
                continue;
            }
            outcome.with_signal += 1;
            batch.push(normalized.point);

            if batch.len() >= self.batch_size {
                outcome.inserted += self.flush(&mut batch).await?;
            }
        }
        outcome.inserted += self.flush(&mut batch).await?;

        debug!(
            %benchmark_id,
            first_row,
            inserted = outcome.inserted,
            skipped = outcome.without_signal,
            errors = outcome.row_errors.len(),
            "window persisted"
        );
        Ok(outcome)
    }

    async fn flush(&self, batch: &mut Vec<DataPoint>) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let inserted = self.store.insert_data_points(batch).await?;
        batch.clear();
        Ok(inserted)
    }
}
