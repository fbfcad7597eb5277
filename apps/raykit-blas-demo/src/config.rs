//! Command line configuration.

use anyhow::{bail, Context};
use raykit_accel::DEFAULT_HINT_BUDGET;

/// Default number of BLAS to build.
pub const DEFAULT_COUNT: usize = 256;

/// Default scratch memory budget in bytes.
pub const DEFAULT_SCRATCH_BUDGET: u64 = 64 * 1024 * 1024;

/// Demo configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoConfig {
    /// Number of BLAS to build.
    pub count: usize,
    /// Structure memory built per command buffer.
    pub budget: u64,
    /// Upper bound for the shared scratch buffer.
    pub scratch_budget: u64,
    /// Build with `ALLOW_COMPACTION` and compact after every submission.
    pub compact: bool,
    /// Build one structure at a time through a single scratch region.
    pub serial: bool,
    /// Print usage and exit.
    pub help: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_COUNT,
            budget: DEFAULT_HINT_BUDGET,
            scratch_budget: DEFAULT_SCRATCH_BUDGET,
            compact: true,
            serial: false,
            help: false,
        }
    }
}

impl DemoConfig {
    /// Parse the process arguments.
    pub fn from_args() -> anyhow::Result<Self> {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse arguments, excluding the program name.
    pub fn parse<I>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--count" | "-n" => config.count = parse_value(&arg, args.next())?,
                "--budget" | "-b" => config.budget = parse_value(&arg, args.next())?,
                "--scratch-budget" | "-s" => {
                    config.scratch_budget = parse_value(&arg, args.next())?;
                }
                "--no-compact" => config.compact = false,
                "--serial" => config.serial = true,
                "--help" | "-h" => config.help = true,
                other => bail!("unknown argument `{other}`, see --help"),
            }
        }

        if config.count == 0 {
            bail!("--count must be at least 1");
        }

        Ok(config)
    }
}

fn parse_value<T>(flag: &str, value: Option<String>) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = value.with_context(|| format!("{flag} needs a value"))?;
    value
        .parse()
        .with_context(|| format!("invalid value `{value}` for {flag}"))
}

pub fn print_help() {
    println!("raykit BLAS demo");
    println!();
    println!("Builds procedural AABB BLAS under a memory budget, compacts them");
    println!("and builds a TLAS over the result.");
    println!();
    println!("Usage: raykit-blas-demo [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -n, --count <N>              Number of BLAS to build (default: {DEFAULT_COUNT})");
    println!(
        "  -b, --budget <BYTES>         BLAS memory per submission (default: {DEFAULT_HINT_BUDGET})"
    );
    println!(
        "  -s, --scratch-budget <BYTES> Scratch memory budget (default: {DEFAULT_SCRATCH_BUDGET})"
    );
    println!("      --no-compact             Skip compaction");
    println!("      --serial                 Build one BLAS at a time");
    println!("  -h, --help                   Show this help message");
    println!();
    println!("Environment:");
    println!("  RUST_LOG                     Log filter (default: info)");
}
