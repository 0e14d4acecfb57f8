//! Tabular and array projections of campaign results.

use sem_core::{ParamValue, SemError, SemResult};
use serde::Serialize;
use std::collections::BTreeSet;

/// Output of an array parser: a scalar, a vector or a rectangular table.
///
/// The parser output's own shape becomes the trailing dimensions of the
/// [`ResultArray`]; a scalar adds none.
pub trait ParsedValues {
    /// Shape of this output and its values in row-major order.
    fn into_shaped(self) -> SemResult<(Vec<usize>, Vec<f64>)>;
}

impl ParsedValues for f64 {
    fn into_shaped(self) -> SemResult<(Vec<usize>, Vec<f64>)> {
        Ok((Vec::new(), vec![self]))
    }
}

impl ParsedValues for Vec<f64> {
    fn into_shaped(self) -> SemResult<(Vec<usize>, Vec<f64>)> {
        Ok((vec![self.len()], self))
    }
}

impl ParsedValues for Vec<Vec<f64>> {
    fn into_shaped(self) -> SemResult<(Vec<usize>, Vec<f64>)> {
        let cols = self.first().map_or(0, Vec::len);
        if let Some(row) = self.iter().find(|row| row.len() != cols) {
            return Err(SemError::bad_structure(format!(
                "ragged table: row of {} values, expected {}",
                row.len(),
                cols
            )));
        }
        let rows = self.len();
        Ok((vec![rows, cols], self.into_iter().flatten().collect()))
    }
}

/// Dense row-major array of parsed results.
///
/// The shape is `(|axis_1|, ..., |axis_n|, runs)` followed by the shape of
/// the parser output: nothing for a scalar, `width` for a vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl ResultArray {
    /// The block addressed by a prefix of the dimensions.
    ///
    /// An index covering every axis and the run yields that run's parser
    /// output; a shorter index yields everything below it.
    pub fn get(&self, index: &[usize]) -> Option<&[f64]> {
        if index.len() > self.shape.len() || index.iter().zip(&self.shape).any(|(i, n)| i >= n) {
            return None;
        }
        let block: usize = self.shape[index.len()..].iter().product();
        let offset = index
            .iter()
            .zip(&self.shape)
            .fold(0, |acc, (i, n)| acc * n + i)
            * block;
        self.data.get(offset..offset + block)
    }

    /// Single element at a full index.
    pub fn value(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.shape.len() {
            return None;
        }
        self.get(index).and_then(|block| block.first().copied())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Long-form table: one row per parsed result row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ParamValue>>,
}

impl ResultFrame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<&ParamValue>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Removes columns holding a single distinct value.
    pub fn drop_constant_columns(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let keep: Vec<bool> = (0..self.columns.len())
            .map(|idx| {
                let distinct: BTreeSet<String> =
                    self.rows.iter().map(|row| row[idx].canonical()).collect();
                distinct.len() > 1
            })
            .collect();
        self.columns = std::mem::take(&mut self.columns)
            .into_iter()
            .zip(&keep)
            .filter_map(|(c, k)| k.then_some(c))
            .collect();
        self.rows = std::mem::take(&mut self.rows)
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(&keep)
                    .filter_map(|(v, k)| k.then_some(v))
                    .collect()
            })
            .collect();
    }

    /// Comma-separated rendering with a header line.
    pub fn to_csv(&self) -> String {
        let mut out = self.columns.join(",");
        out.push('\n');
        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            out.push_str(&cells.join(","));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_indexing() {
        let array = ResultArray {
            shape: vec![2, 3, 1],
            data: (0..6).map(f64::from).collect(),
        };
        assert_eq!(array.get(&[0, 0]), Some(&[0.0][..]));
        assert_eq!(array.get(&[1, 2]), Some(&[5.0][..]));
        assert_eq!(array.get(&[1]), Some(&[3.0, 4.0, 5.0][..]));
        assert_eq!(array.get(&[2, 0]), None);
        assert_eq!(array.get(&[0, 0, 0, 0]), None);
        assert_eq!(array.value(&[1, 2, 0]), Some(5.0));
        assert_eq!(array.value(&[1, 2]), None);
    }

    #[test]
    fn test_scalar_array_has_no_width() {
        let array = ResultArray {
            shape: vec![2, 2],
            data: vec![1.0, 2.0, 3.0, 4.0],
        };
        assert_eq!(array.get(&[1, 0]), Some(&[3.0][..]));
        assert_eq!(array.value(&[1, 1]), Some(4.0));
        assert_eq!(array.get(&[]), Some(&array.data[..]));
    }

    #[test]
    fn test_parsed_value_shapes() {
        assert_eq!(2.5_f64.into_shaped().unwrap(), (vec![], vec![2.5]));
        assert_eq!(vec![1.0_f64, 2.0].into_shaped().unwrap(), (vec![2], vec![1.0, 2.0]));
        assert_eq!(
            vec![vec![1.0_f64, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]].into_shaped().unwrap(),
            (vec![3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
        );
        let err = vec![vec![1.0_f64, 2.0], vec![3.0]].into_shaped().unwrap_err();
        assert!(matches!(err, SemError::BadStructure(_)));
    }

    #[test]
    fn test_drop_constant_columns() {
        let mut frame = ResultFrame::new(vec!["a".into(), "b".into(), "c".into()]);
        frame.rows.push(vec![ParamValue::Int(1), ParamValue::from("x"), ParamValue::Float(0.5)]);
        frame.rows.push(vec![ParamValue::Int(2), ParamValue::from("x"), ParamValue::Float(0.5)]);
        frame.drop_constant_columns();
        assert_eq!(frame.columns, vec!["a"]);
        assert_eq!(frame.rows, vec![vec![ParamValue::Int(1)], vec![ParamValue::Int(2)]]);
        assert_eq!(frame.to_csv(), "a\n1\n2\n");
    }
}
