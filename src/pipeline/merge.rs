//! Cross-entity merge: unions variable definitions and sums cells that share
//! an identity key.

use crate::api::document::{Cell, CellKey, Document, MergedDocument, Variable};
use std::collections::{HashMap, HashSet};

/// Incremental accumulator behind [`merge`].
///
/// Variables keep the definition from the first document that declares
/// them. Cells keep first-seen order; later cells with the same key add their
/// value into the existing entry.
#[derive(Debug, Default)]
pub struct Merger {
    variables: Vec<Variable>,
    seen_variables: HashSet<String>,
    cells: Vec<Cell>,
    index: HashMap<CellKey, usize>,
}

impl Merger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, document: &Document) {
        for variable in &document.variables {
            if self.seen_variables.insert(variable.code.clone()) {
                self.variables.push(variable.clone());
            }
        }

        for cell in &document.cells {
            let key = cell.key();
            match self.index.get(&key) {
                Some(&position) => self.cells[position].value += cell.value,
                None => {
                    self.index.insert(key, self.cells.len());
                    self.cells.push(cell.clone());
                }
            }
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn finish(self) -> MergedDocument {
        Document::new(self.variables, self.cells)
    }
}

/// Merges documents in iteration order.
pub fn merge<'a, I>(documents: I) -> MergedDocument
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut merger = Merger::new();
    for document in documents {
        merger.add(document);
    }
    merger.finish()
}
