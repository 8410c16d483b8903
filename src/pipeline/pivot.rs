//! Pivot reduction of a merged document into
//! `category -> subcategory -> accumulated value` tables, plus the row and
//! export views built from them.

use crate::api::document::{Cell, MergedDocument, Variable};
use std::collections::HashMap;

/// Index that [`reorder_rows`] moves the last row to.
pub const TOTAL_ROW_POSITION: usize = 0;

/// Accumulated values for one measure, keyed by primary then secondary code.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotTable {
    measure: String,
    primary_variable: String,
    secondary_variable: String,
    primary_definition: Option<Variable>,
    secondary_definition: Option<Variable>,
    categories: Vec<String>,
    subcategories: Vec<String>,
    values: HashMap<String, HashMap<String, f64>>,
    skipped_cells: usize,
}

/// One rendered cell of a [`PivotRow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotCell {
    pub code: String,
    pub label: String,
    pub value: i64,
}

/// One primary category with a value for every column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotRow {
    pub code: String,
    pub label: String,
    pub cells: Vec<PivotCell>,
}

impl PivotRow {
    pub fn value(&self, secondary_code: &str) -> Option<i64> {
        self.cells
            .iter()
            .find(|cell| cell.code == secondary_code)
            .map(|cell| cell.value)
    }
}

/// Flat record handed to chart and export consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    pub primary_code: String,
    pub secondary_code: String,
    pub rounded_value: i64,
}

impl PivotTable {
    fn empty(document: &MergedDocument, primary: &str, secondary: &str, measure: &str) -> Self {
        Self {
            measure: measure.to_owned(),
            primary_variable: primary.to_owned(),
            secondary_variable: secondary.to_owned(),
            primary_definition: document.variable(primary).cloned(),
            secondary_definition: document.variable(secondary).cloned(),
            categories: Vec::new(),
            subcategories: Vec::new(),
            values: HashMap::new(),
            skipped_cells: 0,
        }
    }

    fn accumulate(&mut self, primary_code: &str, secondary_code: &str, value: f64) {
        if !self.values.contains_key(primary_code) {
            self.categories.push(primary_code.to_owned());
        }
        if !self.subcategories.iter().any(|code| code == secondary_code) {
            self.subcategories.push(secondary_code.to_owned());
        }

        *self
            .values
            .entry(primary_code.to_owned())
            .or_default()
            .entry(secondary_code.to_owned())
            .or_insert(0.0) += value;
    }

    pub fn measure(&self) -> &str {
        &self.measure
    }

    pub fn primary_variable(&self) -> &str {
        &self.primary_variable
    }

    pub fn secondary_variable(&self) -> &str {
        &self.secondary_variable
    }

    /// Primary codes in first-seen order.
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Cells with the right measure that lacked one of the two modalities.
    pub fn skipped_cells(&self) -> usize {
        self.skipped_cells
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Unrounded accumulated value for one slot.
    pub fn value(&self, primary_code: &str, secondary_code: &str) -> Option<f64> {
        self.values
            .get(primary_code)
            .and_then(|row| row.get(secondary_code))
            .copied()
    }

    /// Column codes: the secondary variable's declared modality order, then
    /// any undeclared codes in first-seen order.
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = self
            .secondary_definition
            .as_ref()
            .map(|variable| {
                variable
                    .modalities
                    .iter()
                    .map(|modality| modality.code.clone())
                    .collect()
            })
            .unwrap_or_default();

        for code in &self.subcategories {
            if !columns.contains(code) {
                columns.push(code.clone());
            }
        }
        columns
    }

    pub fn primary_label<'a>(&'a self, code: &'a str) -> &'a str {
        resolve_label(self.primary_definition.as_ref(), code)
    }

    pub fn secondary_label<'a>(&'a self, code: &'a str) -> &'a str {
        resolve_label(self.secondary_definition.as_ref(), code)
    }

    /// Flattens the table into one row per category, in first-seen order.
    ///
    /// Missing slots render as zero. Row order is not adjusted; see
    /// [`reorder_rows`].
    pub fn rows(&self) -> Vec<PivotRow> {
        let columns = self.columns();
        self.categories
            .iter()
            .map(|category| {
                let cells = columns
                    .iter()
                    .map(|column| PivotCell {
                        code: column.clone(),
                        label: self.secondary_label(column).to_owned(),
                        value: round_value(self.value(category, column).unwrap_or(0.0)),
                    })
                    .collect();
                PivotRow {
                    code: category.clone(),
                    label: self.primary_label(category).to_owned(),
                    cells,
                }
            })
            .collect()
    }

    /// Populated slots as flat records, in row then column order.
    pub fn export_records(&self) -> Vec<ExportRecord> {
        let columns = self.columns();
        let mut records = Vec::new();
        for category in &self.categories {
            for column in &columns {
                if let Some(value) = self.value(category, column) {
                    records.push(ExportRecord {
                        primary_code: category.clone(),
                        secondary_code: column.clone(),
                        rounded_value: round_value(value),
                    });
                }
            }
        }
        records
    }
}

/// Builds the pivot table for `measure`.
///
/// Cells with another measure are ignored. Cells with the right measure but
/// without a modality for both variables are skipped and counted.
pub fn pivot(
    document: &MergedDocument,
    primary_variable: &str,
    secondary_variable: &str,
    measure: &str,
) -> PivotTable {
    pivot_measures(document, primary_variable, secondary_variable, &[measure])
        .into_iter()
        .next()
        .unwrap_or_else(|| PivotTable::empty(document, primary_variable, secondary_variable, measure))
}

/// Builds one table per measure from a single pass over the cells.
///
/// Tables come back in the order of `measures`; a repeated measure code is
/// built once.
pub fn pivot_measures<S: AsRef<str>>(
    document: &MergedDocument,
    primary_variable: &str,
    secondary_variable: &str,
    measures: &[S],
) -> Vec<PivotTable> {
    let mut tables: Vec<PivotTable> = Vec::with_capacity(measures.len());
    for measure in measures {
        let measure = measure.as_ref();
        if !tables.iter().any(|table| table.measure == measure) {
            tables.push(PivotTable::empty(
                document,
                primary_variable,
                secondary_variable,
                measure,
            ));
        }
    }

    for (index, cell) in document.cells.iter().enumerate() {
        let Some(table) = tables.iter_mut().find(|table| table.measure == cell.measure) else {
            continue;
        };

        match slot_codes(cell, primary_variable, secondary_variable) {
            Some((primary_code, secondary_code)) => {
                table.accumulate(primary_code, secondary_code, cell.value)
            }
            None => {
                table.skipped_cells += 1;
                tracing::debug!(
                    cell_index = index,
                    measure = %cell.measure,
                    primary_variable,
                    secondary_variable,
                    "cell lacks a pivot modality; skipping"
                );
            }
        }
    }

    for table in &tables {
        if table.skipped_cells > 0 {
            tracing::warn!(
                measure = %table.measure,
                skipped = table.skipped_cells,
                "pivot skipped cells with missing modalities"
            );
        }
    }

    tables
}

fn slot_codes<'a>(cell: &'a Cell, primary: &str, secondary: &str) -> Option<(&'a str, &'a str)> {
    let primary_code = cell.modality_for(primary)?.code.as_str();
    let secondary_code = cell.modality_for(secondary)?.code.as_str();
    Some((primary_code, secondary_code))
}

fn resolve_label<'a>(definition: Option<&'a Variable>, code: &'a str) -> &'a str {
    definition
        .and_then(|variable| variable.modality(code))
        .map(|modality| modality.label.as_str())
        .filter(|label| !label.is_empty())
        .unwrap_or(code)
}

fn round_value(value: f64) -> i64 {
    value.round() as i64
}

/// Moves the last row to `index` when there is more than one row.
pub fn move_last_row_to<T>(rows: &mut Vec<T>, index: usize) {
    if rows.len() <= 1 {
        return;
    }
    let index = index.min(rows.len() - 1);
    if let Some(last) = rows.pop() {
        rows.insert(index, last);
    }
}

/// Presentation ordering step: the last row (the service's total line) is
/// brought to [`TOTAL_ROW_POSITION`].
pub fn reorder_rows<T>(rows: &mut Vec<T>) {
    move_last_row_to(rows, TOTAL_ROW_POSITION);
}

/// Formats an integer with a space every three digits, e.g. `1 234 567`.
pub fn format_grouped(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        grouped.push('-');
    }
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(digit);
    }
    grouped
}
