use anyhow::{anyhow, Context as _, Result};
use aya::maps::{AsyncPerfEventArray, CpuMap, HashMap, MapData, PerCpuArray};
use aya::programs::{
    socket_filter::SocketFilterLinkId, xdp::XdpLinkId, SocketFilter, Xdp, XdpFlags,
};
use aya::{include_bytes_aligned, Ebpf, EbpfLoader};
use log::{debug, info, warn};

use rsops_common::{
    FlowKey, CPU_CONFIG_KEY, MAP_CPU_CONFIG, MAP_CPU_MAP, MAP_FLOW_COUNTS, MAP_RX_COUNT,
    MAP_TCP_EVENTS, PROG_FLOW_COUNTER,
};

use crate::config::XdpMode;
use crate::raw_socket::RawSocket;

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/rsops"));

/// Loads the eBPF object, attaches its programs and hands out its maps.
pub struct EbpfManager {
    ebpf: Ebpf,
    links: Vec<Link>,
}

enum Link {
    SocketFilter {
        link: SocketFilterLinkId,
        // Closing the socket would drop the filter with it
        socket: RawSocket,
    },
    Xdp {
        program: &'static str,
        iface: String,
        link: XdpLinkId,
    },
}

/// Number of possible CPUs, which is also the size of the kernel cpumap.
pub fn possible_cpus() -> Result<u32> {
    let cpus = aya::util::nr_cpus().map_err(|(path, e)| anyhow!("failed to read {path}: {e}"))?;
    Ok(cpus as u32)
}

pub fn xdp_flags(mode: XdpMode, update_if_noexist: bool) -> XdpFlags {
    let flags = match mode {
        XdpMode::Default => XdpFlags::default(),
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Drv => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    };
    if update_if_noexist {
        flags | XdpFlags::UPDATE_IF_NOEXIST
    } else {
        flags
    }
}

impl EbpfManager {
    /// Load the embedded object, sizing the flow table to `max_flows` entries
    /// and the cpumap to the number of possible CPUs.
    pub fn load(max_flows: u32) -> Result<Self> {
        let cpus = possible_cpus()?;
        debug!("sizing {MAP_FLOW_COUNTS} to {max_flows} entries and {MAP_CPU_MAP} to {cpus}");

        let mut loader = EbpfLoader::new();
        loader.set_max_entries(MAP_FLOW_COUNTS, max_flows);
        loader.set_max_entries(MAP_CPU_MAP, cpus);
        let mut ebpf = loader
            .load(EBPF_BYTES)
            .context("failed to load eBPF object")?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            // This can happen if you remove all log statements from your eBPF program.
            warn!("failed to initialize eBPF logger: {e}");
        }

        Ok(Self {
            ebpf,
            links: Vec::new(),
        })
    }

    /// Open a raw socket on `iface` and attach the flow counting filter to it.
    pub fn attach_flow_counter(&mut self, iface: &str) -> Result<()> {
        let socket = RawSocket::bind(iface)
            .with_context(|| format!("failed to open raw socket on {iface}"))?;

        let program: &mut SocketFilter = self
            .ebpf
            .program_mut(PROG_FLOW_COUNTER)
            .with_context(|| format!("program {PROG_FLOW_COUNTER} not found"))?
            .try_into()
            .context("socket filter program has wrong type")?;
        program
            .load()
            .context("failed to load socket filter program")?;
        let link = program
            .attach(&socket)
            .with_context(|| format!("failed to attach socket filter on {iface}"))?;

        info!(
            "{PROG_FLOW_COUNTER} attached to raw socket on {iface} (ifindex {})",
            socket.ifindex()
        );
        self.links.push(Link::SocketFilter { link, socket });
        Ok(())
    }

    /// Load and attach one of the XDP programs.
    pub fn attach_xdp(&mut self, name: &'static str, iface: &str, flags: XdpFlags) -> Result<()> {
        let program: &mut Xdp = self
            .ebpf
            .program_mut(name)
            .with_context(|| format!("program {name} not found"))?
            .try_into()
            .context("xdp program has wrong type")?;
        program
            .load()
            .with_context(|| format!("failed to load xdp program {name}"))?;
        let link = program.attach(iface, flags).with_context(|| {
            format!("failed to attach {name} to {iface} - try a different --xdp-mode, e.g. skb")
        })?;

        info!("{name} attached to {iface}");
        self.links.push(Link::Xdp {
            program: name,
            iface: iface.to_string(),
            link,
        });
        Ok(())
    }

    /// Create the cpumap queue for `cpu` and point the redirector at it.
    ///
    /// The queue is created first so the program never sees a configured CPU
    /// without a queue behind it.
    pub fn set_target_cpu(&mut self, cpu: u32, queue_size: u32) -> Result<()> {
        let map = self
            .ebpf
            .map_mut(MAP_CPU_MAP)
            .with_context(|| format!("map {MAP_CPU_MAP} not found"))?;
        let mut cpumap = CpuMap::try_from(map).context("cpu map has unexpected type")?;
        cpumap
            .set(cpu, queue_size, None, 0)
            .with_context(|| format!("failed to create queue of {queue_size} frames on cpu {cpu}"))?;

        let map = self
            .ebpf
            .map_mut(MAP_CPU_CONFIG)
            .with_context(|| format!("map {MAP_CPU_CONFIG} not found"))?;
        let mut config =
            HashMap::<_, u32, u32>::try_from(map).context("cpu config map has unexpected type")?;
        config
            .insert(CPU_CONFIG_KEY, cpu, 0)
            .context("failed to write target cpu")?;

        info!("redirecting to cpu {cpu} (queue size {queue_size})");
        Ok(())
    }

    pub fn take_flow_counts(&mut self) -> Result<HashMap<MapData, FlowKey, i64>> {
        let map = self
            .ebpf
            .take_map(MAP_FLOW_COUNTS)
            .with_context(|| format!("map {MAP_FLOW_COUNTS} not found"))?;
        HashMap::try_from(map).context("flow count map has unexpected type")
    }

    pub fn take_rx_count(&mut self) -> Result<PerCpuArray<MapData, i64>> {
        let map = self
            .ebpf
            .take_map(MAP_RX_COUNT)
            .with_context(|| format!("map {MAP_RX_COUNT} not found"))?;
        PerCpuArray::try_from(map).context("rx count map has unexpected type")
    }

    pub fn take_tcp_events(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self
            .ebpf
            .take_map(MAP_TCP_EVENTS)
            .with_context(|| format!("map {MAP_TCP_EVENTS} not found"))?;
        AsyncPerfEventArray::try_from(map).context("tcp event map has unexpected type")
    }

    pub fn is_attached(&self) -> bool {
        !self.links.is_empty()
    }

    /// Detach every program attached through this manager.
    pub fn detach_all(&mut self) -> Result<()> {
        while let Some(link) = self.links.pop() {
            match link {
                Link::SocketFilter { link, socket } => {
                    let program: &mut SocketFilter = self
                        .ebpf
                        .program_mut(PROG_FLOW_COUNTER)
                        .with_context(|| format!("program {PROG_FLOW_COUNTER} not found"))?
                        .try_into()
                        .context("socket filter program has wrong type")?;
                    program
                        .detach(link)
                        .context("failed to detach socket filter")?;
                    drop(socket);
                    info!("{PROG_FLOW_COUNTER} detached");
                }
                Link::Xdp {
                    program: name,
                    iface,
                    link,
                } => {
                    let program: &mut Xdp = self
                        .ebpf
                        .program_mut(name)
                        .with_context(|| format!("program {name} not found"))?
                        .try_into()
                        .context("xdp program has wrong type")?;
                    program
                        .detach(link)
                        .with_context(|| format!("failed to detach {name} from {iface}"))?;
                    info!("{name} detached from {iface}");
                }
            }
        }
        Ok(())
    }
}

impl Drop for EbpfManager {
    fn drop(&mut self) {
        if self.is_attached() {
            warn!("eBPF programs still attached during drop, relying on link teardown");
        }
    }
}
