//! Image container and text I/O
//!
//! A CCD exposure is a dense row-major array of pixel values in units of
//! electrons. Row 0 is the row closest to the readout register; parallel
//! clocking moves charge from high row indices toward row 0. Serial
//! clocking works on the transpose, so the container keeps transposition
//! cheap and explicit (one copy) rather than offering strided views.
//!
//! The text format is the one used by the command-line tools: a `# rows
//! cols` header followed by whitespace-separated decimals in row-major
//! order. Comment lines (`#`) after the header are ignored.

#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

/// Errors from image construction and text I/O.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// Underlying file read/write failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The file did not start with a `# rows cols` header.
    #[error("missing `# rows cols` header in {path}")]
    MissingHeader {
        /// Offending file.
        path: String,
    },
    /// A token could not be parsed as a pixel value.
    #[error("bad pixel value `{token}` at line {line}")]
    BadToken {
        /// 1-indexed line number.
        line: usize,
        /// The unparseable token.
        token: String,
    },
    /// The pixel count did not match the header.
    #[error("expected {expected} pixel values, found {found}")]
    WrongPixelCount {
        /// rows × cols from the header.
        expected: usize,
        /// Values actually present.
        found: usize,
    },
    /// Zero rows or columns, or ragged row data.
    #[error("image dimensions must be positive and rectangular")]
    BadShape,
}

/// A rectangular array of pixel values in electrons, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    n_rows: usize,
    n_columns: usize,
    data: Vec<f64>,
}

impl Image {
    /// An all-zero image of the given shape.
    pub fn zeros(n_rows: usize, n_columns: usize) -> Result<Self, ImageError> {
        if n_rows == 0 || n_columns == 0 {
            return Err(ImageError::BadShape);
        }
        Ok(Self { n_rows, n_columns, data: vec![0.0; n_rows * n_columns] })
    }

    /// Build from nested rows; every row must have the same length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, ImageError> {
        if rows.is_empty() || rows[0].is_empty() {
            return Err(ImageError::BadShape);
        }
        let n_columns = rows[0].len();
        if rows.iter().any(|r| r.len() != n_columns) {
            return Err(ImageError::BadShape);
        }
        let mut data = Vec::with_capacity(rows.len() * n_columns);
        for r in rows {
            data.extend_from_slice(r);
        }
        Ok(Self { n_rows: rows.len(), n_columns, data })
    }

    /// Number of rows (the clocking axis; row 0 nearest the readout).
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Number of columns.
    #[inline]
    pub fn n_columns(&self) -> usize {
        self.n_columns
    }

    /// Pixel value at `(row, column)`.
    #[inline]
    pub fn get(&self, row: usize, column: usize) -> f64 {
        debug_assert!(row < self.n_rows && column < self.n_columns);
        self.data[row * self.n_columns + column]
    }

    /// Overwrite the pixel at `(row, column)`.
    #[inline]
    pub fn set(&mut self, row: usize, column: usize, value: f64) {
        debug_assert!(row < self.n_rows && column < self.n_columns);
        self.data[row * self.n_columns + column] = value;
    }

    /// The backing row-major slice.
    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Mutable access to the backing row-major slice.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Sum of all pixel values.
    pub fn total_electrons(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Largest absolute pixel value.
    pub fn abs_max(&self) -> f64 {
        self.data.iter().fold(0.0, |m, v| m.max(v.abs()))
    }

    /// Largest absolute per-pixel difference against `other`.
    ///
    /// Shapes must match; used by the correction loop and the tests.
    pub fn abs_max_difference(&self, other: &Image) -> f64 {
        debug_assert_eq!(self.n_rows, other.n_rows);
        debug_assert_eq!(self.n_columns, other.n_columns);
        self.data
            .iter()
            .zip(other.data.iter())
            .fold(0.0, |m, (a, b)| m.max((a - b).abs()))
    }

    /// An explicit transposed copy.
    ///
    /// Serial clocking runs on the transpose so the inner loop always walks
    /// contiguous memory; the cost is one extra image of memory.
    pub fn transpose(&self) -> Image {
        let mut out = Image {
            n_rows: self.n_columns,
            n_columns: self.n_rows,
            data: vec![0.0; self.data.len()],
        };
        for r in 0..self.n_rows {
            for c in 0..self.n_columns {
                out.data[c * self.n_rows + r] = self.data[r * self.n_columns + c];
            }
        }
        out
    }

    /// Load from the whitespace text format with a `# rows cols` header.
    pub fn load_txt(path: &Path) -> Result<Self, ImageError> {
        let text = fs::read_to_string(path)?;
        let mut lines = text.lines().enumerate();

        // Header: first non-empty line, `# rows cols`.
        let (n_rows, n_columns) = loop {
            let (_, line) = lines.next().ok_or_else(|| ImageError::MissingHeader {
                path: path.display().to_string(),
            })?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let rest = line.strip_prefix('#').ok_or_else(|| ImageError::MissingHeader {
                path: path.display().to_string(),
            })?;
            let mut fields = rest.split_whitespace();
            let parse = |tok: Option<&str>| {
                tok.and_then(|t| t.parse::<usize>().ok()).ok_or_else(|| {
                    ImageError::MissingHeader { path: path.display().to_string() }
                })
            };
            break (parse(fields.next())?, parse(fields.next())?);
        };
        if n_rows == 0 || n_columns == 0 {
            return Err(ImageError::BadShape);
        }

        let mut data = Vec::with_capacity(n_rows * n_columns);
        for (lineno, line_raw) in lines {
            let mut line = line_raw;
            if let Some(hash) = line.find('#') {
                line = &line[..hash];
            }
            for token in line.split_whitespace() {
                let value: f64 = token.parse().map_err(|_| ImageError::BadToken {
                    line: lineno + 1,
                    token: token.to_string(),
                })?;
                data.push(value);
            }
        }
        if data.len() != n_rows * n_columns {
            return Err(ImageError::WrongPixelCount {
                expected: n_rows * n_columns,
                found: data.len(),
            });
        }
        Ok(Self { n_rows, n_columns, data })
    }

    /// Write in the whitespace text format with a `# rows cols` header.
    pub fn save_txt(&self, path: &Path) -> Result<(), ImageError> {
        let mut out = String::with_capacity(self.data.len() * 12);
        out.push_str(&format!("# {} {}\n", self.n_rows, self.n_columns));
        for r in 0..self.n_rows {
            let row = &self.data[r * self.n_columns..(r + 1) * self.n_columns];
            let line: Vec<String> = row.iter().map(|v| format!("{}", v)).collect();
            out.push_str(&line.join(" "));
            out.push('\n');
        }
        fs::write(path, out)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_round_trips() {
        let image = Image::from_rows(&[
            vec![0.0, 1.0, 2.0, 3.0],
            vec![4.0, 5.0, 6.0, 7.0],
            vec![8.0, 9.0, 10.0, 11.0],
        ])
        .unwrap();

        let t = image.transpose();
        assert_eq!(t.n_rows(), 4);
        assert_eq!(t.n_columns(), 3);
        assert_eq!(t.data(), &[0.0, 4.0, 8.0, 1.0, 5.0, 9.0, 2.0, 6.0, 10.0, 3.0, 7.0, 11.0]);
        assert_eq!(t.transpose(), image);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = Image::from_rows(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert!(matches!(err, ImageError::BadShape));
    }

    #[test]
    fn txt_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.txt");

        let image = Image::from_rows(&[vec![0.0, 800.5], vec![1.25, -3.0], vec![0.0, 0.0]])
            .unwrap();
        image.save_txt(&path).unwrap();
        let loaded = Image::load_txt(&path).unwrap();
        assert_eq!(loaded, image);
    }

    #[test]
    fn txt_parsing_reports_bad_tokens_and_counts() {
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("bad_token.txt");
        fs::write(&path, "# 1 2\n1.0 oops\n").unwrap();
        match Image::load_txt(&path).unwrap_err() {
            ImageError::BadToken { line, token } => {
                assert_eq!(line, 2);
                assert_eq!(token, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }

        let path = dir.path().join("short.txt");
        fs::write(&path, "# 2 2\n1 2 3\n").unwrap();
        assert!(matches!(
            Image::load_txt(&path).unwrap_err(),
            ImageError::WrongPixelCount { expected: 4, found: 3 }
        ));

        let path = dir.path().join("no_header.txt");
        fs::write(&path, "1 2\n3 4\n").unwrap();
        assert!(matches!(Image::load_txt(&path).unwrap_err(), ImageError::MissingHeader { .. }));
    }

    #[test]
    fn comments_after_header_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comments.txt");
        fs::write(&path, "# 2 2\n1 2 # trailing note\n# a full comment line\n3 4\n").unwrap();
        let image = Image::load_txt(&path).unwrap();
        assert_eq!(image.data(), &[1.0, 2.0, 3.0, 4.0]);
    }
}
