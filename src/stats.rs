//! Performance statistics collection for `--stats` output.

use std::time::{Duration, Instant};

/// Solve counters and phase timings accumulated by a bridge.
pub struct Stats {
    total_start: Instant,
    phases: Vec<(&'static str, Duration)>,
    pub solves: u32,
    pub converged: u32,
    /// Solves that ended in an error.
    pub failures: u32,
    /// Times the bridge moved from the device to the host.
    pub fallbacks: u32,
    pub bicgstab_iters_per_solve: Vec<u32>,
    // Sub-phase accumulators
    pub upload: Duration,
    pub preconditioner_setup: Duration,
    pub krylov: Duration,
    // Device counters (read from the backend after each solve)
    pub gpu_dispatches: u32,
    pub gpu_readbacks: u32,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_start: Instant::now(),
            phases: Vec::new(),
            solves: 0,
            converged: 0,
            failures: 0,
            fallbacks: 0,
            bicgstab_iters_per_solve: Vec::new(),
            upload: Duration::ZERO,
            preconditioner_setup: Duration::ZERO,
            krylov: Duration::ZERO,
            gpu_dispatches: 0,
            gpu_readbacks: 0,
        }
    }

    /// Record a completed phase with its duration.
    pub fn add_phase(&mut self, name: &'static str, duration: Duration) {
        self.phases.push((name, duration));
    }

    pub fn total_iterations(&self) -> u64 {
        self.bicgstab_iters_per_solve.iter().map(|&i| i as u64).sum()
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        let total = self.total_start.elapsed();
        eprintln!();
        eprintln!("=== Flowbridge Performance Stats ===");

        for (name, dur) in &self.phases {
            eprintln!("  {:<24} {:>8.3}s", name, dur.as_secs_f64());
        }

        if self.solves > 0 {
            eprintln!(
                "  Linear solves:          {}  (converged {}, errors {})",
                self.solves, self.converged, self.failures
            );
            eprintln!("    Upload:               {:>8.3}s", self.upload.as_secs_f64());
            eprintln!("    Preconditioner setup: {:>8.3}s", self.preconditioner_setup.as_secs_f64());
            eprintln!("    Krylov loop:          {:>8.3}s", self.krylov.as_secs_f64());
            if !self.bicgstab_iters_per_solve.is_empty() {
                let avg = self.total_iterations() as f64 / self.bicgstab_iters_per_solve.len() as f64;
                let iters_str: Vec<String> =
                    self.bicgstab_iters_per_solve.iter().map(|i| i.to_string()).collect();
                eprintln!("      BiCGSTAB iters:     {}", iters_str.join(" / "));
                eprintln!("      BiCGSTAB avg:       {:.1}", avg);
            }
        }

        if self.fallbacks > 0 {
            eprintln!("  CPU fallbacks:          {}", self.fallbacks);
        }

        eprintln!("  ─────────────────────────────────");
        eprintln!("  Total:                  {:>8.3}s", total.as_secs_f64());
        eprintln!("  GPU dispatches:         {}", self.gpu_dispatches);
        eprintln!("  GPU readbacks:          {}", self.gpu_readbacks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterations_accumulate() {
        let mut stats = Stats::new();
        stats.bicgstab_iters_per_solve.extend([3, 4, 5]);
        stats.add_phase("read input", Duration::from_millis(2));
        assert_eq!(stats.total_iterations(), 12);
        assert_eq!(stats.phases.len(), 1);
    }
}
