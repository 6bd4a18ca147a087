//! Results output formatting (CSV).

use crate::bridge::SolveResult;
use crate::error::Result;
use std::io::Write;

/// Write a solution vector as CSV.
///
/// Format:
/// ```csv
/// index,value
/// 0,1.25
/// 1,-0.5
/// ```
pub fn write_solution_csv<W: Write>(values: &[f64], writer: &mut W) -> Result<()> {
    writeln!(writer, "index,value")?;
    for (i, v) in values.iter().enumerate() {
        writeln!(writer, "{},{}", i, v)?;
    }
    Ok(())
}

/// Write the one-line solve summary.
pub fn write_summary<W: Write>(result: &SolveResult, backend: &str, writer: &mut W) -> Result<()> {
    writeln!(
        writer,
        "{} after {} iterations, reduction {:.3e}, {:.3}s on {}",
        if result.converged { "converged" } else { "not converged" },
        result.iterations,
        result.reduction,
        result.wall_time.as_secs_f64(),
        backend
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn solution_csv_layout() {
        let mut buf = Vec::new();
        write_solution_csv(&[1.5, -2.0], &mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "index,value\n0,1.5\n1,-2\n");
    }

    #[test]
    fn summary_mentions_status() {
        let result = SolveResult {
            converged: false,
            iterations: 10,
            reduction: 0.5,
            wall_time: Duration::from_millis(5),
        };
        let mut buf = Vec::new();
        write_summary(&result, "cpu", &mut buf).unwrap();
        let line = String::from_utf8(buf).unwrap();
        assert!(line.starts_with("not converged after 10 iterations"));
        assert!(line.trim_end().ends_with("on cpu"));
    }
}
