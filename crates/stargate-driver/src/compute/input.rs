//! Feature-matrix staging
//!
//! Input reaches the clustering kernel as a dense row-major `f32` matrix.
//! It is built either from a caller buffer of known shape or from a text
//! file with one row per line:
//!
//! ```text
//! id1 1.0 2.0 3.0
//! id2 4.0,5.0,6.0
//! ```
//!
//! The first token on each line is a row identifier and is discarded. It is
//! separated by whitespace; feature values may also be separated by commas.
//! Blank lines are skipped. The first data line fixes the column count.

use crate::error::{DispatchError, Result};
use std::path::Path;
use tracing::debug;

const ID_DELIMITERS: [char; 3] = [' ', '\t', '\r'];
const FEATURE_DELIMITERS: [char; 4] = [' ', ',', '\t', '\r'];

/// Feature matrix staged for one kernel run
#[derive(Debug, Clone, PartialEq)]
pub struct StagedInput {
    rows: usize,
    cols: usize,
    features: Vec<f32>,
}

impl StagedInput {
    /// Parse a row-per-line text file
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read, or `InputParse` naming the
    /// offending line.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let staged = Self::parse(path, &text)?;
        debug!(
            "Staged {}x{} features from {}",
            staged.rows,
            staged.cols,
            path.display()
        );
        Ok(staged)
    }

    /// Parse file contents; `path` is only used in error messages
    ///
    /// # Errors
    ///
    /// Returns `InputParse` on a malformed value, a row whose width differs
    /// from the first, or an input with no data rows.
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let parse_error = |line: usize, reason: String| DispatchError::InputParse {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let mut cols = None;
        let mut rows = 0;
        let mut features = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = line.trim_start_matches(ID_DELIMITERS);
            if line.is_empty() {
                continue;
            }

            let values = match line.split_once(ID_DELIMITERS) {
                Some((_id, rest)) => rest,
                None => "",
            };

            let start = features.len();
            for token in values.split(FEATURE_DELIMITERS).filter(|t| !t.is_empty()) {
                let value = token
                    .parse::<f32>()
                    .map_err(|e| parse_error(line_no, format!("'{token}': {e}")))?;
                features.push(value);
            }

            let width = features.len() - start;
            match cols {
                None if width == 0 => {
                    return Err(parse_error(line_no, "row has no feature values".into()));
                }
                None => cols = Some(width),
                Some(expected) if expected != width => {
                    return Err(parse_error(
                        line_no,
                        format!("expected {expected} features, found {width}"),
                    ));
                }
                Some(_) => {}
            }
            rows += 1;
        }

        let Some(cols) = cols else {
            return Err(parse_error(0, "no data rows".into()));
        };

        Ok(Self {
            rows,
            cols,
            features,
        })
    }

    /// Stage native-endian `f32` values from a caller buffer
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the shape is empty or the buffer is
    /// shorter than `rows * cols` values.
    pub fn from_f32_bytes(data: &[u8], rows: usize, cols: usize) -> Result<Self> {
        let bytes = checked_len(data, rows, cols)?;
        Ok(Self {
            rows,
            cols,
            features: bytemuck::pod_collect_to_vec::<u8, f32>(&data[..bytes]),
        })
    }

    /// Stage native-endian `i32` values, widened to `f32`
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the shape is empty or the buffer is
    /// shorter than `rows * cols` values.
    pub fn from_i32_bytes(data: &[u8], rows: usize, cols: usize) -> Result<Self> {
        let bytes = checked_len(data, rows, cols)?;
        #[allow(clippy::cast_precision_loss)]
        let features = bytemuck::pod_collect_to_vec::<u8, i32>(&data[..bytes])
            .into_iter()
            .map(|v| v as f32)
            .collect();
        Ok(Self {
            rows,
            cols,
            features,
        })
    }

    /// Number of rows (points)
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (features per point)
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// Row-major feature values
    #[must_use]
    pub fn features(&self) -> &[f32] {
        &self.features
    }

    /// Size of the staged matrix in bytes
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.features.len() * std::mem::size_of::<f32>()
    }
}

fn checked_len(data: &[u8], rows: usize, cols: usize) -> Result<usize> {
    if rows == 0 || cols == 0 {
        return Err(DispatchError::invalid_argument(format!(
            "raw input needs a non-empty shape, got {rows}x{cols}"
        )));
    }
    let bytes = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| DispatchError::invalid_argument(format!("shape {rows}x{cols} overflows")))?;
    if data.len() < bytes {
        return Err(DispatchError::invalid_argument(format!(
            "raw input holds {} bytes, {rows}x{cols} needs {bytes}",
            data.len()
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<StagedInput> {
        StagedInput::parse(Path::new("points.txt"), text)
    }

    #[test]
    fn leading_id_is_discarded() {
        let staged = parse("id1 1.0 2.0 3.0\nid2 4.0 5.0 6.0\n").unwrap();
        assert_eq!((staged.rows(), staged.cols()), (2, 3));
        assert_eq!(staged.features(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn blank_lines_and_commas_are_accepted() {
        let staged = parse("\n7\t0.5,1.5\n\n   \n8 2.5, 3.5\r\n").unwrap();
        assert_eq!((staged.rows(), staged.cols()), (2, 2));
        assert_eq!(staged.features(), &[0.5, 1.5, 2.5, 3.5]);
    }

    #[test]
    fn ragged_rows_report_their_line() {
        let err = parse("a 1 2\nb 3\n").unwrap_err();
        assert!(matches!(err, DispatchError::InputParse { line: 2, .. }));
    }

    #[test]
    fn bad_values_and_empty_files_are_errors() {
        assert!(matches!(
            parse("a 1 x\n"),
            Err(DispatchError::InputParse { line: 1, .. })
        ));
        assert!(matches!(
            parse("only-an-id\n"),
            Err(DispatchError::InputParse { line: 1, .. })
        ));
        assert!(matches!(parse("\n\n"), Err(DispatchError::InputParse { .. })));
    }

    #[test]
    fn raw_buffers_are_staged_by_shape() {
        let values = [1.0f32, 2.0, 3.0, 4.0];
        let staged = StagedInput::from_f32_bytes(bytemuck::cast_slice(&values), 2, 2).unwrap();
        assert_eq!(staged.features(), &values);
        assert_eq!(staged.byte_len(), 16);

        let ints = [3i32, -1];
        let staged = StagedInput::from_i32_bytes(bytemuck::cast_slice(&ints), 1, 2).unwrap();
        assert_eq!(staged.features(), &[3.0, -1.0]);

        assert!(StagedInput::from_f32_bytes(&[0u8; 12], 2, 2).is_err());
        assert!(StagedInput::from_f32_bytes(&[], 0, 2).is_err());
    }
}
