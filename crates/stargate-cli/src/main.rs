//! `stargate`: command-line interface for the device registry.
//!
//! ```text
//! USAGE:
//!   stargate list                    List every device, compute first
//!   stargate info <id>               Details for one logical id
//!   stargate loopback <id>           Send a counting pattern and read it back
//!   stargate kmeans <points.txt>     Cluster a points file on the compute path
//! ```
//!
//! `RUST_LOG=debug` shows enumeration and transfer detail.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use stargate_driver::prelude::*;
use stargate_driver::{BackendParams, EmulationMode};
use stargate_wire::pcie::{bytes_to_words, vendor_name};
use stargate_wire::response;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stargate", about = "FPGA device registry CLI", version)]
struct Cli {
    /// Kernel DMA device (overrides STARGATE_DEVICE_PATH).
    #[arg(long, global = true)]
    device: Option<PathBuf>,

    /// Skip the lspci presence check before compute discovery.
    #[arg(long, global = true)]
    skip_probe: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List all devices.
    List,
    /// Print details for one device.
    Info {
        /// Logical device id.
        id: usize,
    },
    /// Write a counting pattern to a DMA channel and verify the echo.
    Loopback {
        /// Logical device id of a PCIe board.
        id: usize,
        /// DMA channel.
        #[arg(long, default_value_t = 0)]
        channel: u32,
        /// Transfer length in 32-bit words.
        #[arg(long, default_value_t = 512)]
        words: u32,
        /// Per-transfer timeout in milliseconds.
        #[arg(long, default_value_t = 2500)]
        timeout: u64,
    },
    /// Cluster a points file (`id f1 f2 ...` per line) through the registry.
    Kmeans {
        /// Input points file.
        input: PathBuf,
        /// Smallest cluster count.
        #[arg(long, default_value_t = 5)]
        min: usize,
        /// Largest cluster count.
        #[arg(long, default_value_t = 5)]
        max: usize,
        /// Convergence threshold.
        #[arg(long, default_value_t = 0.001)]
        threshold: f32,
        /// Runs per cluster count.
        #[arg(long, default_value_t = 1)]
        loops: usize,
        /// Select the cluster count by RMSE.
        #[arg(long)]
        rmse: bool,
        /// Write `row cluster` lines here.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = RegistryConfig::from_env();
    if let Some(path) = &cli.device {
        config = config.with_device_path(path);
    }
    if cli.skip_probe {
        config = config.without_probe();
    }

    match cli.command {
        Cmd::List => cmd_list(&config),
        Cmd::Info { id } => cmd_info(&config, id),
        Cmd::Loopback {
            id,
            channel,
            words,
            timeout,
        } => cmd_loopback(&config, id, channel, words, timeout),
        Cmd::Kmeans {
            input,
            min,
            max,
            threshold,
            loops,
            rmse,
            output,
        } => {
            let params = ComputeParams {
                min_clusters: min,
                max_clusters: max,
                threshold,
                loops,
                compute_rmse: rmse,
                ..ComputeParams::default()
            };
            cmd_kmeans(config, input, output, params)
        }
    }
}

fn registry(config: &RegistryConfig) -> DeviceRegistry {
    DeviceRegistry::from_config(
        config,
        Box::new(SoftwarePlatform::new(
            &config.compute_vendor,
            config.emulation.clone(),
        )),
        Box::new(SoftwareKmeans::new()),
    )
}

fn cmd_list(config: &RegistryConfig) -> Result<()> {
    let reg = registry(config);
    let devices = reg.list_all();

    println!("Devices: {}", devices.len());
    println!();
    for d in &devices {
        print_summary(d);
    }
    Ok(())
}

fn cmd_info(config: &RegistryConfig, id: usize) -> Result<()> {
    let reg = registry(config);
    let d = reg.descriptor(id)?;

    println!("Id           : {}", d.id);
    println!("Backend      : {}", d.backend);
    println!("Name         : {}", d.name);
    println!("Channels     : {}", d.channel_count);
    println!(
        "Vendor       : {:#06x} ({})",
        d.vendor_id,
        u16::try_from(d.vendor_id).map_or("unknown", vendor_name)
    );
    println!("Device id    : {:#06x}", d.device_id);
    if d.backend == BackendKind::Compute {
        println!("Clock        : {} MHz", d.frequency_mhz);
        println!("Memory       : {} MB", d.global_memory_bytes >> 20);
        println!("Mode         : {}", config.emulation.as_str());
    } else {
        println!("Device file  : {}", config.device_path.display());
    }
    Ok(())
}

fn cmd_loopback(
    config: &RegistryConfig,
    id: usize,
    channel: u32,
    words: u32,
    timeout: u64,
) -> Result<()> {
    let reg = registry(config);
    let d = reg.descriptor(id)?;
    if d.backend != BackendKind::Pcie {
        bail!("Device {id} is a {} device, loopback needs a PCIe board", d.backend);
    }

    let handle = reg.open(id)?;
    handle.update(|c| {
        c.input_len = words;
        c.output_len = words;
        c.write_timeout_ms = timeout;
        c.read_timeout_ms = timeout;
    });
    reg.configure(id)?;

    let tx: Vec<u32> = (0..words).collect();
    let tx_bytes: &[u8] = bytemuck::cast_slice(&tx);
    let written = reg.write(&handle, channel, tx_bytes).context("write")?;

    let mut rx_bytes = vec![0u8; tx_bytes.len()];
    let read = reg.read(&handle, channel, &mut rx_bytes).context("read")?;
    reg.close(&handle)?;

    let rx: Vec<u32> = bytemuck::pod_collect_to_vec(&rx_bytes);
    let mismatches: Vec<usize> = (0..tx.len()).filter(|&i| tx[i] != rx[i]).collect();

    println!(
        "{} chnl {channel}: wrote {} words, read {} words",
        d.name,
        bytes_to_words(written),
        bytes_to_words(read)
    );
    for &i in mismatches.iter().take(8) {
        println!("  index {i}: tx {} rx {}", tx[i], rx[i]);
    }
    if !mismatches.is_empty() {
        bail!("{} of {words} words differ", mismatches.len());
    }
    println!("Loopback OK");
    Ok(())
}

fn cmd_kmeans(
    config: RegistryConfig,
    input: PathBuf,
    output: Option<PathBuf>,
    params: ComputeParams,
) -> Result<()> {
    // The host kernel needs no board; keep discovery on the software platform.
    let mut config = config.without_probe().with_compute_defaults(params);
    if matches!(config.emulation, EmulationMode::Hardware) {
        config.emulation = EmulationMode::SoftwareEmulation;
    }
    let reg = registry(&config);

    let Some(d) = reg
        .list_all()
        .into_iter()
        .find(|d| d.backend == BackendKind::Compute)
    else {
        bail!("No compute device for vendor '{}'", config.compute_vendor);
    };

    let handle = reg.open(d.id)?;
    handle.update(|c| {
        c.input_kind = InputKind::File;
        c.input_path = Some(input.clone());
        c.output_path = output;
    });
    reg.configure(d.id)?;

    let staged = reg
        .write(&handle, 0, &[])
        .with_context(|| format!("clustering {}", input.display()))?;

    if let BackendParams::Compute(p) = handle.snapshot().params {
        println!(
            "{}: {staged} bytes staged, k {}..={}",
            input.display(),
            p.min_clusters,
            p.max_clusters
        );
    }

    // membership + centres, generously sized from the staged input
    let mut buf = vec![0u8; staged * 2 + 1024];
    let n = reg.read(&handle, 0, &mut buf)?;
    let values: Vec<f32> = bytemuck::pod_collect_to_vec(&buf[..n]);
    let result = response::decode(&values)?;
    reg.close(&handle)?;

    let features = (staged / 4) / result.membership.len().max(1);
    let clusters = result.centres.len() / features.max(1);
    println!("Points   : {}", result.membership.len());
    println!("Clusters : {clusters}");
    for (k, centre) in result.centres.chunks(features.max(1)).enumerate() {
        let size = result
            .membership
            .iter()
            .filter(|&&m| usize::try_from(m).ok() == Some(k))
            .count();
        println!("  [{k}] n={size:<6} centre={centre:?}");
    }
    Ok(())
}

fn print_summary(d: &DeviceDescriptor) {
    println!("[{}] {} {}", d.id, d.backend, d.name);
    match d.backend {
        BackendKind::Pcie => println!(
            "     {} channels  vendor {:#06x}  device {:#06x}",
            d.channel_count, d.vendor_id, d.device_id
        ),
        BackendKind::Compute => println!(
            "     {} MHz  {} MB global memory",
            d.frequency_mhz,
            d.global_memory_bytes >> 20
        ),
    }
}
