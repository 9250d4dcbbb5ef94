//! In-memory sheet for tests and dry runs

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{BatchWriteReport, CellUpdate, SheetError, SheetWriter};

#[derive(Debug, Clone)]
enum Scripted {
    Fail(SheetError),
    Partial(Vec<usize>),
}

#[derive(Default)]
struct State {
    cells: HashMap<(String, String, u32, u32), String>,
    batches: Vec<(String, Vec<CellUpdate>)>,
    script: VecDeque<Scripted>,
}

/// Records every batch and keeps the resulting cell contents
#[derive(Clone, Default)]
pub struct MemorySheet {
    state: Arc<Mutex<State>>,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Fail the next `batch_write` call with `error`.
    pub fn fail_next(&self, error: SheetError) {
        self.with_state(|state| state.script.push_back(Scripted::Fail(error)));
    }

    /// Confirm only `indices` of the next batch.
    pub fn confirm_next(&self, indices: Vec<usize>) {
        self.with_state(|state| state.script.push_back(Scripted::Partial(indices)));
    }

    pub fn cell(&self, document_id: &str, sheet_name: &str, row: u32, col: u32) -> Option<String> {
        self.with_state(|state| {
            state
                .cells
                .get(&(document_id.to_string(), sheet_name.to_string(), row, col))
                .cloned()
        })
    }

    /// Every accepted batch, in call order
    pub fn batches(&self) -> Vec<(String, Vec<CellUpdate>)> {
        self.with_state(|state| state.batches.clone())
    }
}

#[async_trait]
impl SheetWriter for MemorySheet {
    async fn batch_write(
        &self,
        document_id: &str,
        updates: &[CellUpdate],
    ) -> Result<BatchWriteReport, SheetError> {
        self.with_state(|state| {
            let report = match state.script.pop_front() {
                Some(Scripted::Fail(error)) => return Err(error),
                Some(Scripted::Partial(indices)) => BatchWriteReport {
                    confirmed: indices.into_iter().filter(|i| *i < updates.len()).collect(),
                },
                None => BatchWriteReport::all(updates.len()),
            };

            for index in &report.confirmed {
                let update = &updates[*index];
                state.cells.insert(
                    (
                        document_id.to_string(),
                        update.sheet_name.clone(),
                        update.row,
                        update.col,
                    ),
                    update.value.clone(),
                );
            }
            state.batches.push((document_id.to_string(), updates.to_vec()));
            Ok(report)
        })
    }
}
