//! Column-ordered result tables.
//!
//! Every sheet the snapshot writes goes through [`Table`], which fixes column
//! order and applies the rounding policy, so the CSV text (and therefore the
//! content hash) is a pure function of the computed values.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::Result;

pub const ROUND_DECIMALS: i32 = 6;

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    let rounded = (value * factor).round() / factor;
    // avoid writing "-0"
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Cell {
    /// Render with the rounding policy; missing and non-finite values
    /// become `null_repr`.
    pub fn render(&self, null_repr: &str) -> String {
        match self {
            Cell::Null => null_repr.to_string(),
            Cell::Text(s) => s.clone(),
            Cell::Int(v) => v.to_string(),
            Cell::Float(v) if v.is_finite() => round_to(*v, ROUND_DECIMALS).to_string(),
            Cell::Float(_) => null_repr.to_string(),
            Cell::Bool(v) => v.to_string(),
        }
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Float(value)
    }
}

impl From<Option<f64>> for Cell {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Cell::Null, Cell::Float)
    }
}

impl From<usize> for Cell {
    fn from(value: usize) -> Self {
        Cell::Int(value as i64)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Int(value)
    }
}

impl From<u32> for Cell {
    fn from(value: u32) -> Self {
        Cell::Int(i64::from(value))
    }
}

impl From<Option<i64>> for Cell {
    fn from(value: Option<i64>) -> Self {
        value.map_or(Cell::Null, Cell::Int)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<&String> for Cell {
    fn from(value: &String) -> Self {
        Cell::Text(value.clone())
    }
}

impl From<Option<&str>> for Cell {
    fn from(value: Option<&str>) -> Self {
        value.map_or(Cell::Null, Cell::from)
    }
}

impl From<Option<String>> for Cell {
    fn from(value: Option<String>) -> Self {
        value.map_or(Cell::Null, Cell::Text)
    }
}

impl From<Option<DateTime<Utc>>> for Cell {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        value.map_or(Cell::Null, |ts| {
            Cell::Text(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        })
    }
}

/// A row type that knows its sheet columns.
pub trait Tabular {
    fn columns() -> Vec<&'static str>;
    fn cells(&self) -> Vec<Cell>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows<T: Tabular>(rows: &[T]) -> Self {
        Self {
            columns: T::columns().into_iter().map(String::from).collect(),
            rows: rows.iter().map(Tabular::cells).collect(),
        }
    }

    pub fn push(&mut self, row: Vec<Cell>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write as CSV. An empty table with no columns writes nothing.
    pub fn write_csv<W: std::io::Write>(&self, writer: W, null_repr: &str) -> Result<()> {
        let mut out = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(writer);
        if !self.columns.is_empty() {
            out.write_record(&self.columns)?;
        }
        for row in &self.rows {
            out.write_record(row.iter().map(|cell| cell.render(null_repr)))?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn to_csv_string(&self, null_repr: &str) -> Result<String> {
        let mut buffer = Vec::new();
        self.write_csv(&mut buffer, null_repr)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_are_rounded_and_missing_values_rendered() {
        assert_eq!(Cell::Float(1.234_567_89).render(""), "1.234568");
        assert_eq!(Cell::Float(-0.000_000_1).render(""), "0");
        assert_eq!(Cell::Float(f64::NAN).render("__NA__"), "__NA__");
        assert_eq!(Cell::from(None::<f64>).render("__NA__"), "__NA__");
    }

    #[test]
    fn csv_keeps_column_order() {
        let mut table = Table::new(vec!["b".to_string(), "a".to_string()]);
        table.push(vec![Cell::from("x,y"), Cell::from(2usize)]);
        let text = table.to_csv_string("").unwrap();
        assert_eq!(text, "b,a\n\"x,y\",2\n");
    }
}
