//! Census document model and the JSON wire format it is parsed from.
//!
//! The data service answers one request per commune with a list of variable
//! definitions (`Variable`) and a list of observations (`Cellule`). The wire
//! keys use the service's `@code`/`@variable`/`Libelle` spelling; the plain
//! `code`/`variableCode`/`label` spelling is accepted as well so fixtures and
//! re-serialised documents parse the same way.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Opaque identifier of one geographic unit (for example a commune code).
pub type EntityId = String;

/// Document produced by a single successful fetch.
pub type RawDocument = Document;

/// Document produced by merging any number of raw documents.
pub type MergedDocument = Document;

/// One coded value of a [`Variable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modality {
    pub variable_code: String,
    pub code: String,
    pub label: String,
}

/// Categorical dimension definition with its modalities in service order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub code: String,
    pub label: String,
    pub modalities: Vec<Modality>,
}

impl Variable {
    pub fn modality(&self, code: &str) -> Option<&Modality> {
        self.modalities.iter().find(|modality| modality.code == code)
    }
}

/// Reference from a cell to one modality of one variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellModality {
    pub variable_code: String,
    pub code: String,
}

/// One observation: modality references, the measure being counted and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub modalities: Vec<CellModality>,
    pub measure: String,
    pub value: f64,
}

/// Identity used to decide whether two cells describe the same slot.
///
/// Modality codes are sorted so the pair is unordered. The measure code is
/// part of the key: cells with the same modalities but different measures are
/// never summed together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    codes: Vec<String>,
    measure: String,
}

impl Cell {
    pub fn new(modalities: Vec<CellModality>, measure: impl Into<String>, value: f64) -> Self {
        Self {
            modalities,
            measure: measure.into(),
            value,
        }
    }

    /// Returns the modality this cell carries for `variable_code`, if any.
    pub fn modality_for(&self, variable_code: &str) -> Option<&CellModality> {
        self.modalities
            .iter()
            .find(|modality| modality.variable_code == variable_code)
    }

    pub fn key(&self) -> CellKey {
        let mut codes: Vec<String> = self
            .modalities
            .iter()
            .map(|modality| modality.code.clone())
            .collect();
        codes.sort();
        CellKey {
            codes,
            measure: self.measure.clone(),
        }
    }
}

/// Variable definitions plus cells, as returned for one entity or merged across many.
///
/// Equality ignores the order of variables and cells: two documents are equal
/// when they define the same variables and carry the same value for every
/// cell identity key.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub variables: Vec<Variable>,
    pub cells: Vec<Cell>,
}

impl Document {
    pub fn new(variables: Vec<Variable>, cells: Vec<Cell>) -> Self {
        Self { variables, cells }
    }

    pub fn variable(&self, code: &str) -> Option<&Variable> {
        self.variables.iter().find(|variable| variable.code == code)
    }

    /// Resolves a modality label, falling back to the raw code.
    pub fn label_for<'a>(&'a self, variable_code: &str, code: &'a str) -> &'a str {
        self.variable(variable_code)
            .and_then(|variable| variable.modality(code))
            .map(|modality| modality.label.as_str())
            .filter(|label| !label.is_empty())
            .unwrap_or(code)
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn canonical_cells(&self) -> Vec<(CellKey, f64)> {
        let mut cells: Vec<(CellKey, f64)> =
            self.cells.iter().map(|cell| (cell.key(), cell.value)).collect();
        cells.sort_by(|left, right| {
            left.0
                .cmp(&right.0)
                .then(left.1.partial_cmp(&right.1).unwrap_or(Ordering::Equal))
        });
        cells
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        let ours: BTreeMap<&str, &Variable> = self
            .variables
            .iter()
            .map(|variable| (variable.code.as_str(), variable))
            .collect();
        let theirs: BTreeMap<&str, &Variable> = other
            .variables
            .iter()
            .map(|variable| (variable.code.as_str(), variable))
            .collect();

        ours == theirs && self.canonical_cells() == other.canonical_cells()
    }
}

/// Outcome of parsing one response body.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub document: RawDocument,
    /// Cells dropped because their structure, measure or value could not be read.
    pub malformed_cells: usize,
    /// Variable definitions dropped because their structure could not be read.
    pub malformed_variables: usize,
}

/// Parses a response body into a [`RawDocument`].
///
/// Only a body that is not a JSON object fails. Unreadable cells and
/// variable definitions are skipped one by one and counted.
pub fn parse_document(body: &str) -> Result<ParsedDocument> {
    let wire: WireDocument =
        serde_json::from_str(body).context("response body is not a census document")?;

    let mut malformed_variables = 0usize;
    let mut variables = Vec::new();
    for (index, raw) in wire.variables.into_vec().into_iter().enumerate() {
        match serde_json::from_value::<WireVariable>(raw) {
            Ok(variable) => variables.push(variable.into_variable()),
            Err(err) => {
                malformed_variables += 1;
                tracing::warn!(variable_index = index, error = %err, "skipping malformed variable");
            }
        }
    }

    let mut malformed_cells = 0usize;
    let mut cells = Vec::new();
    for (index, raw) in wire.cells.into_vec().into_iter().enumerate() {
        let parsed = serde_json::from_value::<WireCell>(raw)
            .map_err(|err| err.to_string())
            .and_then(|wire_cell| wire_cell.into_cell().map_err(str::to_owned));
        match parsed {
            Ok(cell) => cells.push(cell),
            Err(reason) => {
                malformed_cells += 1;
                tracing::warn!(cell_index = index, reason = %reason, "skipping malformed cell");
            }
        }
    }

    Ok(ParsedDocument {
        document: Document::new(variables, cells),
        malformed_cells,
        malformed_variables,
    })
}

fn parse_value(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

#[derive(Debug, Deserialize)]
struct WireDocument {
    #[serde(rename = "Variable", default)]
    variables: OneOrMany<Value>,
    #[serde(rename = "Cellule", default)]
    cells: OneOrMany<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireVariable {
    #[serde(rename = "@code", alias = "code")]
    code: String,
    #[serde(rename = "Libelle", alias = "label", default)]
    label: String,
    #[serde(rename = "Modalite", alias = "modalities", default)]
    modalities: OneOrMany<WireModality>,
}

impl WireVariable {
    fn into_variable(self) -> Variable {
        let code = self.code;
        let modalities = self
            .modalities
            .into_vec()
            .into_iter()
            .map(|modality| Modality {
                variable_code: modality.variable_code.unwrap_or_else(|| code.clone()),
                code: modality.code,
                label: modality.label,
            })
            .collect();

        Variable {
            code,
            label: self.label,
            modalities,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireModality {
    #[serde(rename = "@code", alias = "code")]
    code: String,
    #[serde(rename = "@variable", alias = "variableCode", default)]
    variable_code: Option<String>,
    #[serde(rename = "Libelle", alias = "label", default)]
    label: String,
}

#[derive(Debug, Deserialize)]
struct WireMeasure {
    #[serde(rename = "@code", alias = "code")]
    code: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireValue {
    Text(String),
    Number(f64),
}

#[derive(Debug, Deserialize)]
struct WireCell {
    #[serde(rename = "Modalite", default)]
    modalities: OneOrMany<WireModality>,
    #[serde(rename = "Mesure", default)]
    measure: Option<WireMeasure>,
    #[serde(rename = "Valeur", default)]
    value: Option<WireValue>,
}

impl WireCell {
    fn into_cell(self) -> std::result::Result<Cell, &'static str> {
        let measure = self.measure.ok_or("missing Mesure")?.code;
        let value = match self.value.ok_or("missing Valeur")? {
            WireValue::Text(text) => parse_value(&text).ok_or("Valeur is not a decimal number")?,
            WireValue::Number(number) if number.is_finite() => number,
            WireValue::Number(_) => return Err("Valeur is not finite"),
        };

        let modalities = self
            .modalities
            .into_vec()
            .into_iter()
            .map(|modality| CellModality {
                variable_code: modality.variable_code.unwrap_or_default(),
                code: modality.code,
            })
            .collect();

        Ok(Cell::new(modalities, measure, value))
    }
}
