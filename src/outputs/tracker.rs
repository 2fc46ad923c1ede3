//! Stable per-cell output index allocation.
//!
//! Outputs get monotonically increasing indices within a cell, and a
//! `display_id` is pinned to the index it first received so later
//! `update_display_data` messages can re-target it.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct OutputIndexTracker {
    last_index_by_cell: HashMap<String, i64>,
    index_by_display_id: HashMap<String, i64>,
    display_ids_by_cell: HashMap<String, HashSet<String>>,
}

impl OutputIndexTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next index for a cell. A known `display_id` returns its
    /// existing index unchanged.
    pub fn allocate(&mut self, cell_id: &str, display_id: Option<&str>) -> i64 {
        let last_index = self.last_index_by_cell.get(cell_id).copied().unwrap_or(-1);

        if let Some(display_id) = display_id {
            if let Some(index) = self.index_by_display_id.get(display_id) {
                return *index;
            }
            let new_index = last_index + 1;
            self.index_by_display_id
                .insert(display_id.to_string(), new_index);
            self.display_ids_by_cell
                .entry(cell_id.to_string())
                .or_default()
                .insert(display_id.to_string());
            self.last_index_by_cell
                .insert(cell_id.to_string(), new_index);
            new_index
        } else {
            let new_index = last_index + 1;
            self.last_index_by_cell
                .insert(cell_id.to_string(), new_index);
            new_index
        }
    }

    pub fn get(&self, display_id: &str) -> Option<i64> {
        self.index_by_display_id.get(display_id).copied()
    }

    /// Drop all per-cell state, including its display-id bindings.
    pub fn clear_cell(&mut self, cell_id: &str) {
        self.last_index_by_cell.remove(cell_id);
        if let Some(display_ids) = self.display_ids_by_cell.remove(cell_id) {
            for display_id in display_ids {
                self.index_by_display_id.remove(&display_id);
            }
        }
    }
}
