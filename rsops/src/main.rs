use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
#[rustfmt::skip]
use log::{debug, info, warn};
use tokio::signal;

use rsops_common::{PROG_DUMP, PROG_PASS, PROG_REDIRECT_CPU};

mod config;
mod dump;
mod ebpf;
mod error;
mod raw_socket;
mod stats;

use config::{
    Config, DumpConfig, FlowsConfig, PassConfig, RedirectConfig, XdpMode, DEFAULT_CONFIG_PATH,
};
use dump::TcpDump;
use ebpf::{possible_cpus, xdp_flags, EbpfManager};
use stats::{FlowStats, FlowTotals, RxStats};

#[derive(Debug, Parser)]
#[clap(name = "rsops", about = "IPv4 flow counter and XDP CPU redirector")]
struct Opt {
    /// Configuration file; defaults are used when it does not exist
    #[clap(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count packets per IPv4 (source, destination) pair seen on an interface
    Flows(FlowsArgs),
    /// Steer every frame received on an interface to one CPU
    Redirect(RedirectArgs),
    /// Attach the placeholder XDP program
    Pass(PassArgs),
    /// Print every TCP connection attempt seen on an interface
    Dump(DumpArgs),
}

#[derive(Debug, Args)]
struct FlowsArgs {
    #[clap(short, long)]
    iface: Option<String>,
    /// Capacity of the kernel flow table
    #[clap(long)]
    max_flows: Option<u32>,
    /// Seconds between reports
    #[clap(short, long)]
    stats_interval: Option<u64>,
    /// Read and delete each flow every interval, reporting per-interval
    /// counts and running totals
    #[clap(long)]
    drain: bool,
}

#[derive(Debug, Args)]
struct RedirectArgs {
    #[clap(short, long)]
    iface: Option<String>,
    /// CPU receiving the redirected frames
    #[clap(long)]
    cpu: Option<u32>,
    /// Leave the target CPU unset so every frame passes through
    #[clap(long, conflicts_with = "cpu")]
    unconfigured: bool,
    /// cpumap queue size, in frames
    #[clap(long)]
    queue_size: Option<u32>,
    #[clap(long, value_enum)]
    xdp_mode: Option<XdpMode>,
    /// Fail instead of replacing an XDP program already on the interface
    #[clap(long)]
    update_if_noexist: bool,
    /// Seconds between reports
    #[clap(short, long)]
    stats_interval: Option<u64>,
}

#[derive(Debug, Args)]
struct PassArgs {
    #[clap(short, long)]
    iface: Option<String>,
    #[clap(long, value_enum)]
    xdp_mode: Option<XdpMode>,
}

#[derive(Debug, Args)]
struct DumpArgs {
    #[clap(short, long)]
    iface: Option<String>,
    #[clap(long, value_enum)]
    xdp_mode: Option<XdpMode>,
    /// Pages per CPU for the event buffer, a power of two
    #[clap(long)]
    perf_pages: Option<usize>,
}

impl FlowsArgs {
    fn apply(self, config: &mut FlowsConfig) {
        if let Some(iface) = self.iface {
            config.iface = iface;
        }
        if let Some(max_flows) = self.max_flows {
            config.max_flows = max_flows;
        }
        if let Some(secs) = self.stats_interval {
            config.report_interval_secs = secs;
        }
        config.drain |= self.drain;
    }
}

impl RedirectArgs {
    fn apply(self, config: &mut RedirectConfig) {
        if let Some(iface) = self.iface {
            config.iface = iface;
        }
        if self.unconfigured {
            config.cpu = None;
        } else if let Some(cpu) = self.cpu {
            config.cpu = Some(cpu);
        }
        if let Some(queue_size) = self.queue_size {
            config.queue_size = queue_size;
        }
        if let Some(mode) = self.xdp_mode {
            config.xdp_mode = mode;
        }
        config.update_if_noexist |= self.update_if_noexist;
        if let Some(secs) = self.stats_interval {
            config.report_interval_secs = secs;
        }
    }
}

impl PassArgs {
    fn apply(self, config: &mut PassConfig) {
        if let Some(iface) = self.iface {
            config.iface = iface;
        }
        if let Some(mode) = self.xdp_mode {
            config.xdp_mode = mode;
        }
    }
}

impl DumpArgs {
    fn apply(self, config: &mut DumpConfig) {
        if let Some(iface) = self.iface {
            config.iface = iface;
        }
        if let Some(mode) = self.xdp_mode {
            config.xdp_mode = mode;
        }
        if let Some(pages) = self.perf_pages {
            config.perf_pages = pages;
        }
    }
}

fn init_logger(config: &Config) -> anyhow::Result<()> {
    let level = config.logging.level_filter()?;
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .try_init()
        .context("failed to initialize logger")
}

/// Report why the run is ending. A failed Ctrl-C handler still leads to a
/// clean detach.
fn log_shutdown<T, E: Display>(result: Result<T, E>) {
    match result {
        Ok(_) => println!("Received Ctrl-C, shutting down..."),
        Err(e) => warn!("failed to listen for Ctrl-C, shutting down: {e}"),
    }
}

fn bump_memlock_rlimit() {
    // Bump the memlock rlimit. This is needed for older kernels that don't use the
    // new memcg based accounting, see https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let mut config = Config::load(&opt.config)
        .with_context(|| format!("failed to load {}", opt.config.display()))?;

    init_logger(&config)?;
    bump_memlock_rlimit();

    match opt.command {
        Command::Flows(args) => {
            args.apply(&mut config.flows);
            run_flows(config.flows).await
        }
        Command::Redirect(args) => {
            args.apply(&mut config.redirect);
            run_redirect(config.redirect).await
        }
        Command::Pass(args) => {
            args.apply(&mut config.pass);
            run_pass(config.pass).await
        }
        Command::Dump(args) => {
            args.apply(&mut config.dump);
            run_dump(config.dump).await
        }
    }
}

async fn run_flows(config: FlowsConfig) -> anyhow::Result<()> {
    config.validate()?;

    let mut manager = EbpfManager::load(config.max_flows)?;
    manager.attach_flow_counter(&config.iface)?;
    let mut flows = FlowStats::new(manager.take_flow_counts()?);

    println!("Counting flows on {}. Press Ctrl-C to stop.", config.iface);
    println!(
        "Statistics will be displayed every {} seconds.\n",
        config.report_interval_secs
    );

    let mut totals = FlowTotals::default();
    let result = stats::report_until(
        Duration::from_secs(config.report_interval_secs),
        signal::ctrl_c(),
        || {
            let records = if config.drain {
                flows.drain()
            } else {
                flows.snapshot()
            };
            match records {
                Ok(records) => {
                    stats::display_flows(&records);
                    if config.drain {
                        totals.add(&records);
                    }
                }
                Err(e) => warn!("Failed to read flows: {e}"),
            }
        },
    )
    .await;
    log_shutdown(result);
    manager.detach_all()?;

    let records = if config.drain {
        // Nothing counts any more, so this last drain is exact
        flows.drain().map(|records| {
            totals.add(&records);
            totals.records()
        })
    } else {
        flows.snapshot()
    };
    match records {
        Ok(records) => {
            println!("\nFinal Statistics:");
            println!("{}", stats::flows_json(&config.iface, &records));
        }
        Err(e) => println!("\nFailed to get final statistics: {e}"),
    }
    Ok(())
}

async fn run_redirect(config: RedirectConfig) -> anyhow::Result<()> {
    config.validate(possible_cpus()?)?;

    let mut manager = EbpfManager::load(rsops_common::MAX_FLOW_ENTRIES)?;
    // A freshly loaded CPU_CONFIG is empty, which is the unconfigured state
    match config.cpu {
        Some(cpu) => manager.set_target_cpu(cpu, config.queue_size)?,
        None => info!("no target cpu configured, frames will pass through"),
    }
    manager.attach_xdp(
        PROG_REDIRECT_CPU,
        &config.iface,
        xdp_flags(config.xdp_mode, config.update_if_noexist),
    )?;
    let mut rx = RxStats::new(manager.take_rx_count()?);

    println!(
        "{PROG_REDIRECT_CPU} is running on {}. Press Ctrl-C to stop.",
        config.iface
    );

    let result = stats::report_until(
        Duration::from_secs(config.report_interval_secs),
        signal::ctrl_c(),
        || match rx.per_cpu() {
            Ok(per_cpu) => {
                let rates = rx.rates(&per_cpu);
                stats::display_rx(&per_cpu, &rates);
            }
            Err(e) => warn!("Failed to read rx counters: {e}"),
        },
    )
    .await;
    log_shutdown(result);
    manager.detach_all()?;

    match rx.per_cpu() {
        Ok(per_cpu) => {
            println!("\nFinal Statistics:");
            println!("{}", stats::rx_json(&config.iface, config.cpu, &per_cpu));
        }
        Err(e) => println!("\nFailed to get final statistics: {e}"),
    }
    Ok(())
}

async fn run_pass(config: PassConfig) -> anyhow::Result<()> {
    config.validate()?;

    let mut manager = EbpfManager::load(rsops_common::MAX_FLOW_ENTRIES)?;
    manager.attach_xdp(PROG_PASS, &config.iface, xdp_flags(config.xdp_mode, false))?;

    println!("{PROG_PASS} attached to {}. Press Ctrl-C to detach.", config.iface);
    log_shutdown(signal::ctrl_c().await);

    manager.detach_all()
}

async fn run_dump(config: DumpConfig) -> anyhow::Result<()> {
    config.validate()?;

    let mut manager = EbpfManager::load(rsops_common::MAX_FLOW_ENTRIES)?;
    manager.attach_xdp(PROG_DUMP, &config.iface, xdp_flags(config.xdp_mode, false))?;
    let dump = TcpDump::start(manager.take_tcp_events()?, config.perf_pages, |cpu, event| {
        debug!("event from cpu {cpu}");
        println!("{event}");
    })?;

    println!("Dumping TCP connection attempts on {}. Press Ctrl-C to stop.", config.iface);
    log_shutdown(signal::ctrl_c().await);

    manager.detach_all()?;
    let totals = dump.stop();
    println!("\nFinal Statistics:");
    println!("{}", dump::dump_json(&config.iface, &totals));
    Ok(())
}
