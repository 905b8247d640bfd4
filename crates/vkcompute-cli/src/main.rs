//! vkcompute CLI
//!
//! Runs the sum kernel (`out[i] = in[i] + in[i]`) once per allocation
//! strategy on the selected Vulkan device and verifies every element.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use vkcompute::{
    kernels, AllocationStrategy, BatchRunner, ComputeConfig, DeviceContext, SpirvModule,
};

mod exit;
mod payload;

use payload::{generate_payload, verify_doubled};

/// Shader file looked up next to the executable when `--shader` is absent.
const SHADER_NAME: &str = "sum.spv";

/// Single-shot Vulkan compute driver
#[derive(Parser, Debug)]
#[command(name = "vkcompute")]
#[command(about = "Run the sum compute kernel under each buffer allocation strategy")]
#[command(long_about = r#"
Selects a Vulkan device (preferring virtio-gpu), builds the sum kernel and runs
it once per allocation strategy, checking out[i] == in[i] + in[i].

Examples:
  # All strategies with the shader next to the binary (or the embedded one)
  vkcompute

  # Only the shared-allocation strategy, failing unless virtio-gpu is present
  USE_VIRTIOGPU=1 vkcompute --strategy shared-allocation

  # Custom shader and a larger payload
  vkcompute --shader build/sum.spv --elements 65536
"#)]
#[command(version)]
struct Cli {
    /// SPIR-V file to load (default: sum.spv next to the executable, else the
    /// embedded kernel)
    #[arg(long, value_name = "PATH")]
    shader: Option<PathBuf>,

    /// Shader entry point
    #[arg(long, value_name = "NAME", default_value = kernels::ENTRY_POINT)]
    entry_point: String,

    /// Number of i32 elements to process
    #[arg(long, value_name = "N", default_value_t = 1024)]
    elements: usize,

    /// Allocation strategy: all, single-buffer, shared-allocation, separate-allocations
    #[arg(long, value_name = "STRATEGY", default_value = "all")]
    strategy: String,

    /// Configuration file path
    #[arg(short, long, value_name = "PATH", env = "VKCOMPUTE_CONFIG")]
    config: Option<PathBuf>,

    /// Fail unless the preferred device is present
    #[arg(long)]
    strict: bool,

    /// Fence wait bound in milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// Where the SPIR-V came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ShaderSource {
    File(PathBuf),
    Embedded,
}

impl fmt::Display for ShaderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Embedded => f.write_str("embedded sum kernel"),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.log_format);

    let code = match run(&cli) {
        Ok(()) => exit::EXIT_SUCCESS,
        Err(e) => {
            error!("Command failed: {}", e);
            for cause in e.chain().skip(1) {
                error!("  Caused by: {}", cause);
            }
            exit::for_error(&e)
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    let config = load_configuration(cli)?;
    let strategies = parse_strategies(&cli.strategy)?;
    let (bytecode, source) = resolve_shader(cli.shader.as_deref())?;
    let module = SpirvModule::parse(&bytecode).context("invalid shader")?;
    info!(source = %source, words = module.words().len(), "loaded shader");

    let ctx = DeviceContext::create(&config).context("failed to initialize Vulkan device")?;
    let mut runner = BatchRunner::with_config(&ctx, &config, &bytecode, &cli.entry_point)
        .context("failed to build compute pipeline")?;

    let input = generate_payload(cli.elements);
    for strategy in strategies {
        let output = runner
            .run(strategy, &input)
            .with_context(|| format!("strategy {strategy} failed"))?;
        verify_doubled(&input, &output.values)
            .with_context(|| format!("strategy {strategy} produced wrong output"))?;
        info!(
            %strategy,
            workgroups = output.report.workgroups,
            elapsed_us = output.report.elapsed.as_micros() as u64,
            "output verified"
        );
        println!(
            "{strategy}: ok ({} elements, {} workgroups, {:?})",
            output.values.len(),
            output.report.workgroups,
            output.report.elapsed
        );
    }
    Ok(())
}

/// Load configuration from file (or defaults) and apply CLI overrides.
fn load_configuration(cli: &Cli) -> Result<ComputeConfig> {
    let mut config = match &cli.config {
        Some(path) => ComputeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ComputeConfig::from_env().context("invalid environment configuration")?,
    };
    if cli.strict {
        config.device.strict = true;
    }
    if let Some(ms) = cli.timeout_ms {
        config.fence_timeout_ms = ms;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn parse_strategies(s: &str) -> Result<Vec<AllocationStrategy>> {
    if s == "all" {
        return Ok(AllocationStrategy::ALL.to_vec());
    }
    s.split(',')
        .map(|part| part.trim().parse::<AllocationStrategy>().map_err(anyhow::Error::from))
        .collect()
}

/// Explicit path, else `sum.spv` beside the executable, else the embedded
/// kernel.
fn resolve_shader(explicit: Option<&Path>) -> Result<(Vec<u8>, ShaderSource)> {
    if let Some(path) = explicit {
        let bytes = std::fs::read(path)
            .with_context(|| format!("unable to load the shader from {}", path.display()))?;
        return Ok((bytes, ShaderSource::File(path.to_path_buf())));
    }
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(SHADER_NAME)))
        .filter(|p| p.is_file());
    match beside_exe {
        Some(path) => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("unable to load the shader from {}", path.display()))?;
            Ok((bytes, ShaderSource::File(path)))
        }
        None => {
            warn!("{SHADER_NAME} not found next to the executable, using the embedded kernel");
            Ok((kernels::sum_kernel_bytes(), ShaderSource::Embedded))
        }
    }
}

/// Setup logging based on CLI flags
fn setup_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => {
            subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).init();
        }
        LogFormat::Compact => {
            subscriber.compact().init();
        }
        LogFormat::Pretty => {
            subscriber.pretty().init();
        }
    }
}
