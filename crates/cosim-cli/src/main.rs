mod demo;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use cosim_bridge::{
    spawn_cpu, BridgeBuilder, BridgeConfig, CpuModule, DmiMode, ModuleRegistry, ParamValue,
};
use cosim_mem::{DenseRam, DeviceWindow, DmiBacking, MemoryMap, PendingIrqs, ScratchBar};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DmiArg {
    Off,
    Host,
    Device,
}

impl From<DmiArg> for DmiMode {
    fn from(arg: DmiArg) -> Self {
        match arg {
            DmiArg::Off => DmiMode::Off,
            DmiArg::Host => DmiMode::Host,
            DmiArg::Device => DmiMode::Device,
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "Runs a CPU model against the quantum-synchronised simulation kernel")]
struct Args {
    /// JSON configuration file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Quantum length in nanoseconds of simulated time.
    #[arg(long)]
    quantum_ns: Option<u64>,

    /// Halt after this many completed quanta.
    #[arg(long)]
    max_quanta: Option<u64>,

    /// Direct-memory fast path.
    #[arg(long, value_enum)]
    dmi: Option<DmiArg>,

    /// Base address of the DMI window (decimal or 0x-prefixed hex).
    #[arg(long, value_parser = parse_u64)]
    dmi_base: Option<u64>,

    /// Size of the DMI window in bytes (decimal or 0x-prefixed hex).
    #[arg(long, value_parser = parse_u64)]
    dmi_size: Option<u64>,

    /// CPU model shared library. Without it the built-in demo model runs.
    #[arg(long)]
    library: Option<PathBuf>,

    /// GDB port, passed through to the CPU model as a parameter.
    #[arg(long)]
    gdb_port: Option<u16>,

    /// Extra `name=value` parameter for the CPU model. May be repeated.
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, ParamValue)>,
}

fn parse_u64(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number `{s}`: {e}"))
}

fn parse_param(s: &str) -> std::result::Result<(String, ParamValue), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{s}`"))?;
    if name.is_empty() {
        return Err(format!("empty parameter name in `{s}`"));
    }
    let value = if let Ok(v) = value.parse::<u64>() {
        ParamValue::UInt(v)
    } else if let Ok(v) = value.parse::<i64>() {
        ParamValue::Int(v)
    } else if let Ok(v) = value.parse::<bool>() {
        ParamValue::Bool(v)
    } else {
        ParamValue::Str(value.to_owned())
    };
    Ok((name.to_owned(), value))
}

fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_path(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(quantum_ns) = args.quantum_ns {
        config.quantum_ns = quantum_ns;
    }
    if args.max_quanta.is_some() {
        config.max_quanta = args.max_quanta;
    }
    if let Some(dmi) = args.dmi {
        config.dmi.mode = dmi.into();
    }
    if let Some(base) = args.dmi_base {
        config.dmi.base_address = base;
    }
    if let Some(size) = args.dmi_size {
        config.dmi.size = size;
    }
    if args.library.is_some() {
        config.library = args.library.clone();
    }
    if args.gdb_port.is_some() {
        config.gdb_port = args.gdb_port;
    }
    for (name, value) in &args.params {
        config.params.insert(name.clone(), value.clone());
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let mut map = MemoryMap::new();
    map.map_ram(0, DenseRam::new(demo::RAM_SIZE)?)?;
    map.map_mmio(
        demo::UART_BASE,
        demo::UART_LEN,
        demo::Uart::new(std::io::stdout()),
    )?;

    let dmi_len = usize::try_from(config.dmi.size).context("dmi.size does not fit in memory")?;
    let mut builder = BridgeBuilder::new(config.clone());
    match config.dmi.mode {
        DmiMode::Off => {}
        DmiMode::Host => {
            let backing = DmiBacking::new(config.dmi.base_address, dmi_len);
            map.map_dmi(backing.clone())?;
            builder = builder.dmi_host(backing);
        }
        DmiMode::Device => {
            let bar = Arc::new(Mutex::new(ScratchBar::new(config.dmi.size)));
            builder = builder.dmi_device(DeviceWindow::new(
                config.dmi.base_address,
                config.dmi.size,
                bar,
            ));
        }
    }

    let irqs = PendingIrqs::new();
    let (mut bridge, exec) = builder
        .transport(map)
        .irq_sink(irqs.clone())
        .build()
        .context("failed to set up the bridge")?;

    let (cpu, module) = match &config.library {
        Some(path) => {
            let module = CpuModule::load(&ModuleRegistry::global(), path, exec)
                .with_context(|| format!("failed to attach CPU module {}", path.display()))?;
            bridge.set_irq_sink(module.irq_sink());
            let notifier = module.clone();
            bridge.set_notify_handler(move |_now| notifier.notify());
            tracing::info!(path = %path.display(), "running CPU module");
            (None, Some(module))
        }
        None => {
            let dmi_base = (config.dmi.mode != DmiMode::Off).then_some(config.dmi.base_address);
            (Some(spawn_cpu(exec, demo::DemoCpu { dmi_base, irqs })?), None)
        }
    };

    let report = bridge.run()?;
    // Halted: the model sees `Stopped` and can wind down. The module's last reference goes
    // with it, which runs `cosim_destroy` and unloads the library.
    drop(bridge);
    drop(module);
    if let Some(cpu) = cpu {
        if cpu.join().is_err() {
            bail!("CPU thread panicked");
        }
    }

    tracing::info!(?report, "simulation finished");
    println!(
        "halted: reason={:?} now_ns={} quanta={} transactions={} dmi_hits={}",
        report.reason, report.now_ns, report.quanta, report.transactions, report.dmi_hits
    );
    Ok(())
}
