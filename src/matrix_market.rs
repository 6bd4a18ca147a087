//! Matrix Market reader and writer.
//!
//! Supports the subset used for exchanging linear systems:
//!
//! ```text
//! %%MatrixMarket matrix coordinate real general
//! % ISTL_STRUCT blocked 3 3
//! 12 12 90
//! 1 1 4.0
//! ...
//! ```
//!
//! Coordinate matrices (`general` or `symmetric`) are grouped into blocks of
//! the size given by the optional `ISTL_STRUCT` comment. Vectors may be stored
//! in `array` or `coordinate` layout.

use std::io::Write;
use std::path::Path;

use nom::branch::alt;
use nom::bytes::complete::tag_no_case;
use nom::character::complete::{char, digit1, space0, space1};
use nom::combinator::{map, map_res};
use nom::number::complete::double;
use nom::IResult;
use nom::Parser;

use crate::error::{FlowbridgeError, Result};
use crate::sparse::BlockCsrMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Coordinate,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symmetry {
    General,
    Symmetric,
}

#[derive(Debug)]
struct Document {
    symmetry: Symmetry,
    block: Option<(usize, usize)>,
    rows: usize,
    cols: usize,
    /// Zero-based coordinate entries; array data is converted on read.
    entries: Vec<(usize, usize, f64)>,
}

/// Read a square block matrix.
pub fn read_block_matrix(input: &str) -> Result<BlockCsrMatrix> {
    let doc = parse_document(input)?;
    let block_size = match doc.block {
        Some((r, c)) if r == c => r,
        Some((r, c)) => {
            return Err(FlowbridgeError::Parse(format!(
                "matrix blocks must be square, header declares {r}x{c}"
            )))
        }
        None => 1,
    };
    if doc.rows != doc.cols {
        return Err(FlowbridgeError::Parse(format!(
            "system matrix must be square, got {}x{}",
            doc.rows, doc.cols
        )));
    }
    BlockCsrMatrix::from_scalar_triplets(doc.rows, doc.cols, block_size, &doc.entries)
        .map_err(|e| FlowbridgeError::Parse(e.to_string()))
}

/// Read a column vector.
pub fn read_vector(input: &str) -> Result<Vec<f64>> {
    let doc = parse_document(input)?;
    if doc.cols != 1 {
        return Err(FlowbridgeError::Parse(format!(
            "expected a single column, got {} columns",
            doc.cols
        )));
    }
    let mut out = vec![0.0; doc.rows];
    for (row, _, v) in doc.entries {
        out[row] += v;
    }
    Ok(out)
}

pub fn load_block_matrix(path: impl AsRef<Path>) -> Result<BlockCsrMatrix> {
    read_block_matrix(&std::fs::read_to_string(path)?)
}

pub fn load_vector(path: impl AsRef<Path>) -> Result<Vec<f64>> {
    read_vector(&std::fs::read_to_string(path)?)
}

/// Write a block matrix in coordinate layout with its block structure hint.
pub fn write_block_matrix<W: Write>(matrix: &BlockCsrMatrix, writer: &mut W) -> Result<()> {
    let bs = matrix.block_size;
    let entries = matrix.to_scalar_triplets();
    writeln!(writer, "%%MatrixMarket matrix coordinate real general")?;
    writeln!(writer, "% ISTL_STRUCT blocked {bs} {bs}")?;
    writeln!(writer, "{} {} {}", matrix.n(), matrix.n_cols(), entries.len())?;
    for (r, c, v) in entries {
        writeln!(writer, "{} {} {:e}", r + 1, c + 1, v)?;
    }
    Ok(())
}

/// Write a vector in array layout.
pub fn write_vector<W: Write>(values: &[f64], block_size: usize, writer: &mut W) -> Result<()> {
    writeln!(writer, "%%MatrixMarket matrix array real general")?;
    writeln!(writer, "% ISTL_STRUCT blocked {block_size} 1")?;
    writeln!(writer, "{} 1", values.len())?;
    for v in values {
        writeln!(writer, "{v:e}")?;
    }
    Ok(())
}

fn parse_document(input: &str) -> Result<Document> {
    let mut lines = input
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty());

    let (line_num, first) = lines
        .next()
        .ok_or_else(|| FlowbridgeError::Parse("empty Matrix Market input".into()))?;
    let (_, (layout, symmetry)) =
        header(first).map_err(|_| parse_err(line_num, first, "invalid %%MatrixMarket header"))?;

    let mut block = None;
    let mut size_line = None;
    for (line_num, line) in lines.by_ref() {
        if line.starts_with('%') {
            if let Ok((_, hint)) = block_hint(line) {
                block = Some(hint);
            }
            continue;
        }
        size_line = Some((line_num, line));
        break;
    }
    let (line_num, line) =
        size_line.ok_or_else(|| FlowbridgeError::Parse("missing size line".into()))?;

    let mut doc = Document {
        symmetry,
        block,
        rows: 0,
        cols: 0,
        entries: Vec::new(),
    };

    match layout {
        Layout::Coordinate => {
            let (_, (rows, cols, nnz)) = coordinate_size(line)
                .map_err(|_| parse_err(line_num, line, "expected 'rows cols nnz'"))?;
            doc.rows = rows;
            doc.cols = cols;
            for (line_num, line) in lines {
                if line.starts_with('%') {
                    continue;
                }
                let (_, (r, c, v)) = coordinate_entry(line)
                    .map_err(|_| parse_err(line_num, line, "expected 'row col value'"))?;
                if r == 0 || c == 0 || r > rows || c > cols {
                    return Err(parse_err(line_num, line, "index out of range"));
                }
                doc.entries.push((r - 1, c - 1, v));
                if doc.symmetry == Symmetry::Symmetric && r != c {
                    doc.entries.push((c - 1, r - 1, v));
                }
            }
            let stored = doc
                .entries
                .iter()
                .filter(|(r, c, _)| doc.symmetry == Symmetry::General || r >= c)
                .count();
            if stored != nnz {
                return Err(FlowbridgeError::Parse(format!(
                    "header declares {nnz} entries, found {stored}"
                )));
            }
        }
        Layout::Array => {
            let (_, (rows, cols)) = array_size(line)
                .map_err(|_| parse_err(line_num, line, "expected 'rows cols'"))?;
            doc.rows = rows;
            doc.cols = cols;
            let declared = rows
                .checked_mul(cols)
                .ok_or_else(|| parse_err(line_num, line, "array size overflows"))?;
            let mut k = 0usize;
            for (line_num, line) in lines {
                if line.starts_with('%') {
                    continue;
                }
                let (_, v) = array_value(line)
                    .map_err(|_| parse_err(line_num, line, "expected a value"))?;
                if k >= declared {
                    return Err(parse_err(line_num, line, "more values than declared"));
                }
                // Column-major
                doc.entries.push((k % rows, k / rows, v));
                k += 1;
            }
            if k != declared {
                return Err(FlowbridgeError::Parse(format!(
                    "header declares {declared} values, found {k}"
                )));
            }
        }
    }
    Ok(doc)
}

fn parse_err(line_num: usize, line: &str, detail: &str) -> FlowbridgeError {
    FlowbridgeError::Parse(format!("line {line_num}: {detail}: '{line}'"))
}

// ---------------------------------------------------------------------------
// Line parsers
// ---------------------------------------------------------------------------

fn index(input: &str) -> IResult<&str, usize> {
    map_res(digit1, |s: &str| s.parse::<usize>()).parse(input)
}

fn header(input: &str) -> IResult<&str, (Layout, Symmetry)> {
    let (rest, (_, _, _, _, layout, _, _, _, symmetry)) = (
        tag_no_case("%%MatrixMarket"),
        space1,
        tag_no_case("matrix"),
        space1,
        alt((
            map(tag_no_case("coordinate"), |_: &str| Layout::Coordinate),
            map(tag_no_case("array"), |_: &str| Layout::Array),
        )),
        space1,
        alt((tag_no_case("real"), tag_no_case("double"), tag_no_case("integer"))),
        space1,
        alt((
            map(tag_no_case("general"), |_: &str| Symmetry::General),
            map(tag_no_case("symmetric"), |_: &str| Symmetry::Symmetric),
        )),
    )
        .parse(input)?;
    Ok((rest, (layout, symmetry)))
}

/// `% ISTL_STRUCT blocked r c`
fn block_hint(input: &str) -> IResult<&str, (usize, usize)> {
    let (rest, (_, _, _, _, _, _, r, _, c)) = (
        char('%'),
        space0,
        tag_no_case("ISTL_STRUCT"),
        space1,
        tag_no_case("blocked"),
        space1,
        index,
        space1,
        index,
    )
        .parse(input)?;
    Ok((rest, (r, c)))
}

fn coordinate_size(input: &str) -> IResult<&str, (usize, usize, usize)> {
    let (rest, (r, _, c, _, nnz, _)) = (index, space1, index, space1, index, space0).parse(input)?;
    Ok((rest, (r, c, nnz)))
}

fn array_size(input: &str) -> IResult<&str, (usize, usize)> {
    let (rest, (r, _, c, _)) = (index, space1, index, space0).parse(input)?;
    Ok((rest, (r, c)))
}

fn coordinate_entry(input: &str) -> IResult<&str, (usize, usize, f64)> {
    let (rest, (r, _, c, _, v, _)) = (index, space1, index, space1, double, space0).parse(input)?;
    Ok((rest, (r, c, v)))
}

fn array_value(input: &str) -> IResult<&str, f64> {
    let (rest, (v, _)) = (double, space0).parse(input)?;
    Ok((rest, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCKED: &str = "%%MatrixMarket matrix coordinate real general
% ISTL_STRUCT blocked 2 2
4 4 6
1 1 4.0
2 2 5.0
1 3 -1.0
3 1 -1.5
3 3 4.0
4 4 6e-1
";

    #[test]
    fn test_header() {
        let (_, (layout, symmetry)) =
            header("%%MatrixMarket matrix coordinate real symmetric").unwrap();
        assert_eq!(layout, Layout::Coordinate);
        assert_eq!(symmetry, Symmetry::Symmetric);
        assert!(header("%%MatrixMarket vector coordinate real general").is_err());
    }

    #[test]
    fn test_read_blocked_matrix() {
        let m = read_block_matrix(BLOCKED).unwrap();
        assert_eq!(m.block_size, 2);
        assert_eq!(m.nb, 2);
        assert_eq!(m.nnzb(), 4);
        assert_eq!(m.block(0), &[4.0, 0.0, 0.0, 5.0]);
        assert_eq!(m.block(1), &[-1.0, 0.0, 0.0, 0.0]);
        assert_eq!(m.block(2), &[-1.5, 0.0, 0.0, 0.0]);
        assert_eq!(m.block(3), &[4.0, 0.0, 0.0, 0.6]);
    }

    #[test]
    fn test_symmetric_entries_are_mirrored() {
        let input = "%%MatrixMarket matrix coordinate real symmetric
2 2 3
1 1 2.0
2 1 -1.0
2 2 2.0
";
        let m = read_block_matrix(input).unwrap();
        assert_eq!(m.to_dense(), vec![vec![2.0, -1.0], vec![-1.0, 2.0]]);
    }

    #[test]
    fn test_read_array_vector() {
        let input = "%%MatrixMarket matrix array real general
% ISTL_STRUCT blocked 3 1
3 1
1.5
-2
3e2
";
        assert_eq!(read_vector(input).unwrap(), vec![1.5, -2.0, 300.0]);
    }

    #[test]
    fn test_entry_count_mismatch() {
        let input = "%%MatrixMarket matrix coordinate real general
2 2 3
1 1 1.0
";
        let err = read_block_matrix(input).unwrap_err();
        assert!(format!("{err}").contains("declares 3"), "{err}");
    }

    #[test]
    fn test_oversized_entry_count() {
        let input = "%%MatrixMarket matrix coordinate real general
2 2 18446744073709551615
1 1 1.0
";
        let err = read_block_matrix(input).unwrap_err();
        assert!(matches!(err, FlowbridgeError::Parse(_)), "{err}");
    }

    #[test]
    fn test_overflowing_array_size() {
        let input = "%%MatrixMarket matrix array real general
18446744073709551615 2
1.0
";
        let err = read_vector(input).unwrap_err();
        assert!(format!("{err}").contains("overflows"), "{err}");
    }

    #[test]
    fn test_out_of_range_index() {
        let input = "%%MatrixMarket matrix coordinate real general
2 2 1
3 1 1.0
";
        let err = read_block_matrix(input).unwrap_err();
        assert!(format!("{err}").contains("line 3"), "{err}");
    }

    #[test]
    fn test_write_then_read_matrix() {
        let m = read_block_matrix(BLOCKED).unwrap();
        let mut buf = Vec::new();
        write_block_matrix(&m, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("ISTL_STRUCT blocked 2 2"));
        assert_eq!(read_block_matrix(&text).unwrap(), m);
    }
}
