//! Structured views over the shared document.
//!
//! A notebook document exposes three roots: an ordered `cells` array of cell
//! maps, a `meta` map (nbformat metadata), and a `state` map holding editor
//! state such as the `dirty` flag. A plain text document exposes a single
//! `source` text root.

use super::{any_to_json, json_to_any};
use serde_json::{json, Value};
use std::sync::Arc;
use yrs::types::{EntryChange, ToJson};
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, DeepObservable, Doc, GetString, Map, MapPrelim, MapRef,
    Observable, Out, ReadTxn, Subscription, Text, TextPrelim, TextRef, Transact, TransactionMut,
};

/// Kind of cell created through the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Code,
    Markdown,
    Raw,
}

impl CellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellKind::Code => "code",
            CellKind::Markdown => "markdown",
            CellKind::Raw => "raw",
        }
    }
}

/// Notebook-shaped view over a shared document.
pub struct NotebookView {
    doc: Doc,
    cells: ArrayRef,
    meta: MapRef,
    state: MapRef,
}

impl NotebookView {
    pub fn new(doc: &Doc) -> Self {
        Self {
            cells: doc.get_or_insert_array("cells"),
            meta: doc.get_or_insert_map("meta"),
            state: doc.get_or_insert_map("state"),
            doc: doc.clone(),
        }
    }

    /// Replace the document content from an nbformat JSON value.
    pub fn set_source(&self, notebook: &Value) {
        let mut txn = self.doc.transact_mut();

        let len = self.cells.len(&txn);
        if len > 0 {
            self.cells.remove_range(&mut txn, 0, len);
        }

        if let Some(cells) = notebook.get("cells").and_then(Value::as_array) {
            for (i, cell) in cells.iter().enumerate() {
                insert_cell_in_txn(&self.cells, &mut txn, i as u32, cell);
            }
        }

        let metadata = notebook.get("metadata").cloned().unwrap_or_else(|| json!({}));
        self.meta.insert(&mut txn, "metadata", json_to_any(&metadata));
        let nbformat = notebook.get("nbformat").and_then(Value::as_i64).unwrap_or(4);
        self.meta.insert(&mut txn, "nbformat", Any::BigInt(nbformat));
        let minor = notebook
            .get("nbformat_minor")
            .and_then(Value::as_i64)
            .unwrap_or(5);
        self.meta.insert(&mut txn, "nbformat_minor", Any::BigInt(minor));

        self.state.insert(&mut txn, "dirty", false);
    }

    /// Serialize the document back to nbformat JSON.
    pub fn to_source(&self) -> Value {
        let txn = self.doc.transact();

        let mut notebook = match any_to_json(&self.meta.to_json(&txn)) {
            Value::Object(object) => Value::Object(object),
            _ => json!({}),
        };
        if notebook.get("nbformat").is_none() {
            notebook["nbformat"] = json!(4);
        }
        if notebook.get("nbformat_minor").is_none() {
            notebook["nbformat_minor"] = json!(5);
        }
        if notebook.get("metadata").is_none() {
            notebook["metadata"] = json!({});
        }

        let mut cells = Vec::new();
        for item in self.cells.iter(&txn) {
            cells.push(cell_to_json(&item, &txn));
        }
        notebook["cells"] = Value::Array(cells);
        notebook
    }

    pub fn cell_count(&self) -> usize {
        let txn = self.doc.transact();
        self.cells.len(&txn) as usize
    }

    /// Locate a cell by id. Scans in reverse order: users run cells towards
    /// the end of the notebook more often.
    pub fn find_cell(&self, cell_id: &str) -> Option<usize> {
        let txn = self.doc.transact();
        find_cell_in_txn(&self.cells, &txn, cell_id).map(|(i, _)| i as usize)
    }

    /// Read one cell as JSON.
    pub fn cell_json(&self, cell_id: &str) -> Option<Value> {
        let txn = self.doc.transact();
        let (index, _) = find_cell_in_txn(&self.cells, &txn, cell_id)?;
        self.cells.get(&txn, index).map(|out| cell_to_json(&out, &txn))
    }

    /// Insert a cell from nbformat JSON at the given index.
    pub fn insert_cell(&self, index: usize, cell: &Value) {
        let mut txn = self.doc.transact_mut();
        let len = self.cells.len(&txn);
        let index = (index as u32).min(len);
        insert_cell_in_txn(&self.cells, &mut txn, index, cell);
    }

    /// Append a fresh cell of the given kind, returning its generated id.
    pub fn create_cell(&self, kind: CellKind, source: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let cell = json!({
            "id": id,
            "cell_type": kind.as_str(),
            "source": source,
            "metadata": {},
        });
        let mut txn = self.doc.transact_mut();
        let len = self.cells.len(&txn);
        insert_cell_in_txn(&self.cells, &mut txn, len, &cell);
        id
    }

    pub fn delete_cell(&self, index: usize) -> bool {
        let mut txn = self.doc.transact_mut();
        let len = self.cells.len(&txn);
        if (index as u32) < len {
            self.cells.remove(&mut txn, index as u32);
            true
        } else {
            false
        }
    }

    pub fn set_execution_count(&self, cell_id: &str, count: i64) -> bool {
        let mut txn = self.doc.transact_mut();
        match find_cell_map(&self.cells, &txn, cell_id) {
            Some(cell) => {
                cell.insert(&mut txn, "execution_count", Any::BigInt(count));
                true
            }
            None => false,
        }
    }

    /// Persistent per-cell execution state, kept alongside the ephemeral
    /// awareness entry.
    pub fn set_cell_execution_state(&self, cell_id: &str, state: &str) -> bool {
        let mut txn = self.doc.transact_mut();
        match find_cell_map(&self.cells, &txn, cell_id) {
            Some(cell) => {
                cell.insert(&mut txn, "execution_state", state);
                true
            }
            None => false,
        }
    }

    /// Remove every output of a cell.
    pub fn clear_outputs(&self, cell_id: &str) -> bool {
        let mut txn = self.doc.transact_mut();
        let Some(cell) = find_cell_map(&self.cells, &txn, cell_id) else {
            return false;
        };
        if let Some(Out::YArray(outputs)) = cell.get(&txn, "outputs") {
            let len = outputs.len(&txn);
            if len > 0 {
                outputs.remove_range(&mut txn, 0, len);
            }
        }
        true
    }

    /// Write an output at a stable index, replacing any previous output there.
    pub fn set_output(&self, cell_id: &str, index: usize, output: &Value) -> bool {
        let mut txn = self.doc.transact_mut();
        let Some(cell) = find_cell_map(&self.cells, &txn, cell_id) else {
            return false;
        };
        let outputs = match cell.get(&txn, "outputs") {
            Some(Out::YArray(outputs)) => outputs,
            _ => cell.insert(&mut txn, "outputs", ArrayPrelim::default()),
        };
        let len = outputs.len(&txn) as usize;
        if index < len {
            outputs.remove(&mut txn, index as u32);
            outputs.insert(&mut txn, index as u32, json_to_any(output));
        } else {
            outputs.push_back(&mut txn, json_to_any(output));
        }
        true
    }

    pub fn outputs_json(&self, cell_id: &str) -> Vec<Value> {
        self.cell_json(cell_id)
            .and_then(|cell| cell.get("outputs").cloned())
            .and_then(|outputs| match outputs {
                Value::Array(items) => Some(items),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Merge `language_info` into the notebook metadata.
    pub fn set_language_info(&self, language_info: &Value) {
        let mut txn = self.doc.transact_mut();
        let mut metadata = match self.meta.get(&txn, "metadata") {
            Some(Out::Any(any)) => any_to_json(&any),
            Some(Out::YMap(map)) => any_to_json(&map.to_json(&txn)),
            _ => json!({}),
        };
        if !metadata.is_object() {
            metadata = json!({});
        }
        metadata["language_info"] = language_info.clone();
        self.meta.insert(&mut txn, "metadata", json_to_any(&metadata));
    }

    pub fn dirty(&self) -> bool {
        let txn = self.doc.transact();
        matches!(self.state.get(&txn, "dirty"), Some(Out::Any(Any::Bool(true))))
    }

    /// Set the dirty flag. Writing the current value again is skipped so a
    /// save never produces a follow-up update that would re-schedule a save.
    pub fn set_dirty(&self, dirty: bool) {
        let mut txn = self.doc.transact_mut();
        let current = match self.state.get(&txn, "dirty") {
            Some(Out::Any(Any::Bool(b))) => Some(b),
            _ => None,
        };
        if current == Some(dirty) {
            return;
        }
        self.state.insert(&mut txn, "dirty", dirty);
    }

    /// Register change observers that schedule saves. Updates to the `state`
    /// map whose net effect is zero are ignored; the CRDT emits those even
    /// when a key is rewritten with its current value.
    pub fn observe_changes(&self, on_change: Arc<dyn Fn() + Send + Sync>) -> Vec<Subscription> {
        let mut subscriptions = Vec::new();

        let f = on_change.clone();
        subscriptions.push(self.cells.observe_deep(move |_txn, _events| f()));

        let f = on_change.clone();
        subscriptions.push(self.meta.observe_deep(move |_txn, _events| f()));

        let f = on_change;
        subscriptions.push(self.state.observe(move |txn, event| {
            let noop = event
                .keys(txn)
                .values()
                .all(|change| matches!(change, EntryChange::Updated(old, new) if old == new));
            if !noop {
                f();
            }
        }));

        subscriptions
    }
}

/// Plain-text view over a shared document (non-notebook files).
pub struct TextView {
    doc: Doc,
    source: TextRef,
}

impl TextView {
    pub fn new(doc: &Doc) -> Self {
        Self {
            source: doc.get_or_insert_text("source"),
            doc: doc.clone(),
        }
    }

    pub fn set_source(&self, content: &str) {
        let mut txn = self.doc.transact_mut();
        let len = self.source.len(&txn);
        if len > 0 {
            self.source.remove_range(&mut txn, 0, len);
        }
        self.source.insert(&mut txn, 0, content);
    }

    pub fn to_source(&self) -> String {
        let txn = self.doc.transact();
        self.source.get_string(&txn)
    }

    pub fn observe_changes(&self, on_change: Arc<dyn Fn() + Send + Sync>) -> Vec<Subscription> {
        vec![self.source.observe(move |_txn, _event| on_change())]
    }
}

fn insert_cell_in_txn(cells: &ArrayRef, txn: &mut TransactionMut, index: u32, cell: &Value) {
    let cell_ref: MapRef = cells.insert(txn, index, MapPrelim::default());

    let id = cell
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    cell_ref.insert(txn, "id", id.as_str());

    let cell_type = cell
        .get("cell_type")
        .and_then(Value::as_str)
        .unwrap_or("code")
        .to_string();
    cell_ref.insert(txn, "cell_type", cell_type.as_str());

    let source_text = match cell.get("source") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(lines)) => lines
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .concat(),
        _ => String::new(),
    };
    cell_ref.insert(txn, "source", TextPrelim::new(source_text));

    let metadata = cell.get("metadata").cloned().unwrap_or_else(|| json!({}));
    cell_ref.insert(txn, "metadata", json_to_any(&metadata));

    if cell_type == "code" {
        let execution_count = cell.get("execution_count").cloned().unwrap_or(Value::Null);
        cell_ref.insert(txn, "execution_count", json_to_any(&execution_count));

        let outputs: ArrayRef = cell_ref.insert(txn, "outputs", ArrayPrelim::default());
        if let Some(Value::Array(items)) = cell.get("outputs") {
            for output in items {
                outputs.push_back(txn, json_to_any(output));
            }
        }
    }
}

fn find_cell_in_txn<T: ReadTxn>(cells: &ArrayRef, txn: &T, cell_id: &str) -> Option<(u32, Out)> {
    let len = cells.len(txn);
    for i in (0..len).rev() {
        if let Some(out) = cells.get(txn, i) {
            if out_cell_id(&out, txn).as_deref() == Some(cell_id) {
                return Some((i, out));
            }
        }
    }
    None
}

fn find_cell_map<T: ReadTxn>(cells: &ArrayRef, txn: &T, cell_id: &str) -> Option<MapRef> {
    match find_cell_in_txn(cells, txn, cell_id) {
        Some((_, Out::YMap(map))) => Some(map),
        _ => None,
    }
}

fn out_cell_id<T: ReadTxn>(out: &Out, txn: &T) -> Option<String> {
    match out {
        Out::YMap(map) => match map.get(txn, "id") {
            Some(Out::Any(Any::String(s))) => Some(s.to_string()),
            _ => None,
        },
        Out::Any(Any::Map(map)) => match map.get("id") {
            Some(Any::String(s)) => Some(s.to_string()),
            _ => None,
        },
        _ => None,
    }
}

fn cell_to_json<T: ReadTxn>(out: &Out, txn: &T) -> Value {
    match out {
        Out::YMap(map) => any_to_json(&map.to_json(txn)),
        Out::Any(any) => any_to_json(any),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::new_doc;

    fn sample_notebook() -> Value {
        json!({
            "nbformat": 4,
            "nbformat_minor": 5,
            "metadata": {"kernelspec": {"name": "python3"}},
            "cells": [
                {
                    "id": "c1",
                    "cell_type": "code",
                    "source": "1+1",
                    "metadata": {},
                    "execution_count": null,
                    "outputs": []
                },
                {
                    "id": "c2",
                    "cell_type": "markdown",
                    "source": ["# Title\n", "text"],
                    "metadata": {}
                }
            ]
        })
    }

    #[test]
    fn test_notebook_roundtrip() {
        let doc = new_doc();
        let view = NotebookView::new(&doc);
        view.set_source(&sample_notebook());

        let out = view.to_source();
        assert_eq!(out["nbformat"], 4);
        assert_eq!(out["cells"].as_array().unwrap().len(), 2);
        assert_eq!(out["cells"][0]["id"], "c1");
        assert_eq!(out["cells"][0]["source"], "1+1");
        // multi-line sources are joined
        assert_eq!(out["cells"][1]["source"], "# Title\ntext");
        assert_eq!(out["metadata"]["kernelspec"]["name"], "python3");
    }

    #[test]
    fn test_find_cell_reverse_scan() {
        let doc = new_doc();
        let view = NotebookView::new(&doc);
        view.set_source(&sample_notebook());

        assert_eq!(view.find_cell("c1"), Some(0));
        assert_eq!(view.find_cell("c2"), Some(1));
        assert_eq!(view.find_cell("missing"), None);
    }

    #[test]
    fn test_outputs_set_and_clear() {
        let doc = new_doc();
        let view = NotebookView::new(&doc);
        view.set_source(&sample_notebook());

        let output = json!({"output_type": "stream", "name": "stdout", "text": "hello\n"});
        assert!(view.set_output("c1", 0, &output));
        assert_eq!(view.outputs_json("c1"), vec![output.clone()]);

        // replacement at the same index
        let replaced = json!({"output_type": "stream", "name": "stdout", "text": "bye\n"});
        assert!(view.set_output("c1", 0, &replaced));
        assert_eq!(view.outputs_json("c1"), vec![replaced]);

        assert!(view.clear_outputs("c1"));
        assert!(view.outputs_json("c1").is_empty());
    }

    #[test]
    fn test_execution_count_and_state() {
        let doc = new_doc();
        let view = NotebookView::new(&doc);
        view.set_source(&sample_notebook());

        assert!(view.set_execution_count("c1", 3));
        assert!(view.set_cell_execution_state("c1", "busy"));
        let cell = view.cell_json("c1").unwrap();
        assert_eq!(cell["execution_count"], 3);
        assert_eq!(cell["execution_state"], "busy");
    }

    #[test]
    fn test_create_and_delete_cell() {
        let doc = new_doc();
        let view = NotebookView::new(&doc);
        view.set_source(&sample_notebook());

        let id = view.create_cell(CellKind::Code, "2+2");
        assert_eq!(view.cell_count(), 3);
        assert_eq!(view.find_cell(&id), Some(2));

        assert!(view.delete_cell(2));
        assert_eq!(view.cell_count(), 2);
        assert!(!view.delete_cell(17));
    }

    #[test]
    fn test_language_info_merges_into_metadata() {
        let doc = new_doc();
        let view = NotebookView::new(&doc);
        view.set_source(&sample_notebook());

        view.set_language_info(&json!({"name": "python", "version": "3.12"}));
        let out = view.to_source();
        assert_eq!(out["metadata"]["language_info"]["name"], "python");
        // previous metadata survives
        assert_eq!(out["metadata"]["kernelspec"]["name"], "python3");
    }

    #[test]
    fn test_dirty_rewrite_is_skipped() {
        let doc = new_doc();
        let view = NotebookView::new(&doc);
        view.set_source(&sample_notebook());

        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired_in = fired.clone();
        let _subs = view.observe_changes(Arc::new(move || {
            fired_in.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        view.set_dirty(true);
        let after_first = fired.load(std::sync::atomic::Ordering::SeqCst);
        assert!(after_first >= 1);

        // same value again: no CRDT write, no observer fire
        view.set_dirty(true);
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), after_first);
    }

    #[test]
    fn test_cell_change_schedules_save() {
        let doc = new_doc();
        let view = NotebookView::new(&doc);
        view.set_source(&sample_notebook());

        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired_in = fired.clone();
        let _subs = view.observe_changes(Arc::new(move || {
            fired_in.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        view.set_execution_count("c1", 1);
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_text_view_roundtrip() {
        let doc = new_doc();
        let view = TextView::new(&doc);
        view.set_source("hello\nworld");
        assert_eq!(view.to_source(), "hello\nworld");

        view.set_source("replaced");
        assert_eq!(view.to_source(), "replaced");
    }
}
