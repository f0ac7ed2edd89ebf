//! LayerMap CLI
//!
//! Inspect device memory and preview how a model's layers would be spread
//! across the visible accelerators.
//!
//! # Usage
//!
//! ```bash
//! # Free memory on every device
//! layermap devices
//!
//! # Per-device layer counts for a model
//! layermap distribute --model THUDM/chatglm-6b
//!
//! # Full placement map, dry run against two simulated 24 GiB cards
//! layermap plan --model THUDM/chatglm-6b --free-mem 24G,24G
//!
//! # Placement map for a model wrapped by an adapter
//! layermap plan --model decapoda-research/llama-7b-hf --adapter
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use layermap_core::{
    AllocatorConfig, DeviceInventory, LayerAllocator, RuntimeInventory, SimulatedRuntime,
};

#[derive(Parser)]
#[command(name = "layermap")]
#[command(version)]
#[command(about = "Memory-proportional transformer layer placement across GPUs")]
#[command(long_about = r#"
LayerMap

Splits a model's repeating layer blocks across every visible accelerator in
proportion to each device's free memory, and prints the resulting
layer -> device map that a loader consumes.

Examples:
  # Check what the allocator sees
  layermap devices

  # Dry run without a GPU
  layermap distribute -m THUDM/chatglm-6b --free-mem 24G,24G,80G

  # Adapter placement map as JSON
  layermap plan -m decapoda-research/llama-7b-hf --adapter
"#)]
struct Cli {
    #[command(flatten)]
    options: SharedOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SharedOptions {
    /// TOML allocator configuration (defaults to LAYERMAP_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Topology store path, overriding the configuration
    #[arg(short, long, global = true)]
    topology: Option<PathBuf>,

    /// Simulate devices with these free-memory sizes instead of querying CUDA
    /// (bytes, or with a K/M/G/T suffix)
    #[arg(long, global = true, value_delimiter = ',', value_parser = parse_size)]
    free_mem: Option<Vec<u64>>,

    /// Place the whole model on cuda:0
    #[arg(long, global = true)]
    no_device_aware: bool,

    /// Adapter name prefix, overriding the configuration
    #[arg(long, global = true)]
    prefix: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show free memory on every visible device
    Devices,

    /// Show how many layers each device would receive
    Distribute {
        /// Model identifier as listed in the topology store
        #[arg(short, long)]
        model: String,
    },

    /// Print the layer -> device placement map as JSON
    Plan {
        /// Model identifier as listed in the topology store
        #[arg(short, long)]
        model: String,

        /// Rewrite the map for a model wrapped by an adapter
        #[arg(short, long)]
        adapter: bool,
    },
}

fn main() -> Result<()> {
    // Logs go to stderr so `plan` output stays pipeable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("layermap=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.options)?;
    let inventory = build_inventory(cli.options.free_mem.clone())?;

    match cli.command {
        Commands::Devices => run_devices(inventory.as_ref()),
        Commands::Distribute { model } => {
            let allocator = LayerAllocator::from_config(config, inventory)
                .context("failed to load topology store")?;
            run_distribute(&allocator, &model)
        }
        Commands::Plan { model, adapter } => {
            let allocator = LayerAllocator::from_config(config, inventory)
                .context("failed to load topology store")?;
            run_plan(&allocator, &model, adapter)
        }
    }
}

fn load_config(options: &SharedOptions) -> Result<AllocatorConfig> {
    let mut config = match &options.config {
        Some(path) => AllocatorConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => AllocatorConfig::from_env(),
    };

    if let Some(path) = &options.topology {
        config.topology_path = path.clone();
    }
    if let Some(prefix) = &options.prefix {
        config.adapter_prefix = prefix.clone();
    }
    if options.no_device_aware {
        config.device_aware = false;
    }

    tracing::debug!(?config, "resolved configuration");
    Ok(config)
}

fn build_inventory(free_mem: Option<Vec<u64>>) -> Result<Box<dyn DeviceInventory>> {
    if let Some(free) = free_mem {
        return Ok(Box::new(RuntimeInventory::new(SimulatedRuntime::new(free))));
    }

    #[cfg(feature = "cuda")]
    {
        Ok(Box::new(RuntimeInventory::new(layermap_core::CudaRuntime::new())))
    }

    #[cfg(not(feature = "cuda"))]
    {
        anyhow::bail!("built without CUDA support; pass --free-mem to simulate devices")
    }
}

fn run_devices(inventory: &dyn DeviceInventory) -> Result<()> {
    let sample = inventory.sample().context("failed to query device memory")?;

    if sample.is_empty() {
        println!("{} No accelerator devices visible", style("[WARN]").yellow().bold());
        return Ok(());
    }

    println!("{}", style("Free device memory").cyan().bold());
    for device in sample.devices() {
        println!("  {:<8} {:>12}", device.id.to_string(), format_bytes(device.free_bytes as u128));
    }
    println!("  {:<8} {:>12}", "total", format_bytes(sample.total_free()));
    Ok(())
}

fn run_distribute(allocator: &LayerAllocator<Box<dyn DeviceInventory>>, model: &str) -> Result<()> {
    let plan = allocator.plan(model)?;

    let distribution = match plan.distribution {
        Some(distribution) => distribution,
        None => {
            println!(
                "{} {} is placed whole on cuda:0",
                style("[OK]").green().bold(),
                model
            );
            return Ok(());
        }
    };

    println!(
        "{} {} layers of {}",
        style("Distribution:").cyan().bold(),
        distribution.total_layers(),
        model
    );
    for share in distribution.shares() {
        let layers = if share.layers < 0 {
            style(share.layers.to_string()).red()
        } else {
            style(share.layers.to_string()).white()
        };
        println!(
            "  {:<8} {:>12}  {:>4} layers",
            share.device.to_string(),
            format_bytes(share.free_bytes as u128),
            layers
        );
    }
    if distribution.shares().iter().any(|share| share.layers < 0) {
        println!(
            "{} rounding correction left a device with a negative count",
            style("[WARN]").yellow().bold()
        );
    }
    Ok(())
}

fn run_plan(allocator: &LayerAllocator<Box<dyn DeviceInventory>>, model: &str, adapter: bool) -> Result<()> {
    let mapping = if adapter {
        allocator.allocate_for_adapter(model)?
    } else {
        allocator.allocate(model)?
    };
    println!("{}", mapping.to_json()?);
    Ok(())
}

/// Parse a byte count with an optional binary K/M/G/T suffix
fn parse_size(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    let (digits, shift) = match value.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                other => return Err(format!("unknown size suffix '{}'", other)),
            };
            (&value[..i], shift)
        }
        _ => (value, 0),
    };

    let base: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{}'", value))?;
    base.checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{}' overflows", value))
}

fn format_bytes(bytes: u128) -> String {
    const GIB: f64 = (1u64 << 30) as f64;
    const MIB: f64 = (1u64 << 20) as f64;
    let bytes = bytes as f64;
    if bytes >= GIB {
        format!("{:.1} GiB", bytes / GIB)
    } else {
        format!("{:.1} MiB", bytes / MIB)
    }
}
