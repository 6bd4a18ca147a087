use clap::Parser;
use flowbridge::config::{AcceleratorMode, BridgeConfig, PreconditionerKind};
use flowbridge::matrix_market;
use flowbridge::output;
use flowbridge::{Bridge, FlowbridgeError, SolveResult, WellContributions};
use std::io;
use std::time::Instant;

/// Accelerated block-sparse BiCGSTAB solver
#[derive(Parser)]
#[command(name = "flowbridge", version)]
struct Cli {
    /// Matrix Market file with the system matrix
    matrix: String,

    /// Matrix Market file with the right-hand side (defaults to A·1)
    rhs: Option<String>,

    /// TOML file with bridge options; flags below override it
    #[arg(long)]
    options: Option<String>,

    /// Accelerator: none, vulkan, metal, dx12 or auto
    #[arg(long)]
    accelerator: Option<String>,

    /// Adapter index within the selected accelerator
    #[arg(long)]
    device: Option<usize>,

    /// Preconditioner: jacobi, ilu0 or cpr
    #[arg(long)]
    preconditioner: Option<String>,

    /// Relative residual reduction target
    #[arg(long)]
    tol: Option<f64>,

    /// Maximum BiCGSTAB iterations
    #[arg(long)]
    maxiter: Option<usize>,

    /// Number of independent row partitions for the preconditioner
    #[arg(long, default_value_t = 0)]
    jacobi_blocks: usize,

    #[arg(long)]
    verbosity: Option<u32>,

    /// Use CPU solver instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Print performance stats to stderr
    #[arg(long)]
    stats: bool,

    /// Write the solution as CSV here instead of stdout
    #[arg(long, short)]
    output: Option<String>,
}

fn build_config(cli: &Cli) -> flowbridge::Result<BridgeConfig> {
    let mut config = match &cli.options {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(name) = &cli.accelerator {
        config.accelerator = AcceleratorMode::from_name(name)
            .ok_or_else(|| FlowbridgeError::Config(format!("unknown accelerator '{name}'")))?;
    }
    if cli.cpu {
        config.accelerator = AcceleratorMode::None;
    }
    if let Some(id) = cli.device {
        config.device_id = id;
    }
    if let Some(name) = &cli.preconditioner {
        config.preconditioner = PreconditionerKind::from_name(name)
            .ok_or_else(|| FlowbridgeError::Config(format!("unknown preconditioner '{name}'")))?;
    }
    if let Some(tol) = cli.tol {
        config.tolerance = tol;
    }
    if let Some(maxiter) = cli.maxiter {
        config.max_iterations = maxiter;
    }
    if let Some(v) = cli.verbosity {
        config.verbosity = v;
    }
    config.validate()?;
    Ok(config)
}

fn solve(
    config: BridgeConfig,
    matrix: &flowbridge::BlockCsrMatrix,
    rhs: &[f64],
    jacobi_blocks: usize,
) -> flowbridge::Result<(Bridge, SolveResult)> {
    let mode = config.accelerator;
    let mut wells = WellContributions::create(mode.name(), mode.uses_device())?;
    let mut bridge = Bridge::new(config)?;
    let result = bridge.solve(matrix, rhs, jacobi_blocks, &mut wells)?;
    Ok((bridge, result))
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = build_config(&cli).unwrap_or_else(|e| {
        eprintln!("{}", e);
        std::process::exit(1);
    });

    let read_start = Instant::now();
    let matrix = matrix_market::load_block_matrix(&cli.matrix).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {}", cli.matrix, e);
        std::process::exit(1);
    });
    let rhs = match &cli.rhs {
        Some(path) => matrix_market::load_vector(path).unwrap_or_else(|e| {
            eprintln!("Error reading {}: {}", path, e);
            std::process::exit(1);
        }),
        None => matrix.spmv(&vec![1.0; matrix.n_cols()]).unwrap_or_else(|e| {
            eprintln!("{}", e);
            std::process::exit(1);
        }),
    };
    let read_time = read_start.elapsed();

    let cpu_config = BridgeConfig {
        accelerator: AcceleratorMode::None,
        ..config.clone()
    };
    let (mut bridge, result) = match solve(config, &matrix, &rhs, cli.jacobi_blocks) {
        Ok(done) => done,
        Err(e) if e.is_device_failure() => {
            eprintln!("{}; retrying on the CPU", e);
            solve(cpu_config, &matrix, &rhs, cli.jacobi_blocks).unwrap_or_else(|e| {
                eprintln!("{}", e);
                std::process::exit(1);
            })
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let mut solution = vec![0.0; matrix.n()];
    if let Err(e) = bridge.get_result(&mut solution) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let backend = bridge.backend_name().unwrap_or_default();
    if let Err(e) = output::write_summary(&result, &backend, &mut io::stderr()) {
        eprintln!("Output error: {}", e);
        std::process::exit(1);
    }

    let write_start = Instant::now();
    let written = match &cli.output {
        Some(path) => std::fs::File::create(path)
            .map_err(FlowbridgeError::from)
            .and_then(|file| output::write_solution_csv(&solution, &mut io::BufWriter::new(file))),
        None => output::write_solution_csv(&solution, &mut io::stdout()),
    };
    if let Err(e) = written {
        eprintln!("Output error: {}", e);
        std::process::exit(1);
    }

    if cli.stats {
        let stats = bridge.stats_mut();
        stats.add_phase("Read input", read_time);
        stats.add_phase("Write output", write_start.elapsed());
        stats.display();
    }

    if !result.converged {
        std::process::exit(2);
    }
}
