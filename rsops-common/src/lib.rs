#![no_std]

// Types and packet decision logic shared between the eBPF programs and the
// userspace loader. Everything here must stay `no_std` and allocation free so
// it can be linked into the eBPF object unchanged.

use core::fmt;
use core::net::Ipv4Addr;

#[cfg(feature = "user")]
use aya::Pod;

pub mod dump;
pub mod flow;
pub mod frame;
pub mod pass;
pub mod redirect;
pub mod tables;

pub use dump::{tcp_event_of, TcpEvent};
pub use flow::{classify_and_count, flow_key_of};
pub use frame::Frame;
pub use pass::pass_through;
pub use redirect::select_target;
pub use tables::{CpuConfigTable, FlowCountTable, PerCpuPacketCounter, TableError};

/// Length of an untagged Ethernet header
pub const ETH_HLEN: usize = 14;

/// Length of an IPv4 header without options
pub const IPV4_MIN_HLEN: usize = 20;

/// Shortest frame the flow counter will look at
pub const FLOW_MIN_FRAME_LEN: usize = ETH_HLEN + IPV4_MIN_HLEN;

// Offsets inside the IPv4 header
pub const IPV4_PROTOCOL_OFFSET: usize = 9;
pub const IPV4_SADDR_OFFSET: usize = 12;
pub const IPV4_DADDR_OFFSET: usize = 16;

// Transport protocols tallied by the flow counter
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Default capacity of the flow count table
pub const MAX_FLOW_ENTRIES: u32 = 256;

/// Compile-time capacity of the cpumap; the loader resizes it to the number
/// of possible CPUs before loading.
pub const MAX_CPUS: u32 = 64;

/// Key of the only slot in the CPU configuration table
pub const CPU_CONFIG_KEY: u32 = 0;

/// Index of the only slot in the per-CPU receive counter
pub const RX_COUNT_INDEX: u32 = 0;

/// Flags passed to `bpf_redirect_map` for the cpumap
pub const REDIRECT_FLAGS: u64 = 0;

/// Socket filter return value that keeps the whole packet
pub const SK_FILTER_KEEP: i64 = -1;

/// Socket filter return value that truncates the packet to zero bytes
pub const SK_FILTER_DROP: i64 = 0;

// Offsets inside the TCP header
pub const TCP_SPORT_OFFSET: usize = 0;
pub const TCP_DPORT_OFFSET: usize = 2;
pub const TCP_FLAGS_OFFSET: usize = 13;

/// SYN bit of the TCP flags byte
pub const TCP_FLAG_SYN: u8 = 0x02;

/// EtherType of IPv4
pub const ETH_P_IP: u16 = 0x0800;

/// Offset of the EtherType inside the Ethernet header
pub const ETH_TYPE_OFFSET: usize = 12;

// Map names as they appear in the eBPF object
pub const MAP_FLOW_COUNTS: &str = "FLOW_COUNTS";
pub const MAP_CPU_CONFIG: &str = "CPU_CONFIG";
pub const MAP_RX_COUNT: &str = "RX_COUNT";
pub const MAP_CPU_MAP: &str = "CPU_MAP";
pub const MAP_TCP_EVENTS: &str = "TCP_EVENTS";

// Program names as they appear in the eBPF object
pub const PROG_FLOW_COUNTER: &str = "flow_counter";
pub const PROG_REDIRECT_CPU: &str = "xdp_redirect_cpu";
pub const PROG_PASS: &str = "xdp_pass";
pub const PROG_DUMP: &str = "xdp_dump";

/// XDP action codes
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XdpAction {
    /// Abort processing (error state)
    Aborted = 0,
    /// Drop the packet
    Drop = 1,
    /// Pass the packet to the network stack
    Pass = 2,
    /// Transmit the packet back out the same interface
    Tx = 3,
    /// Redirect the packet to another interface, CPU or socket
    Redirect = 4,
}

/// Outcome of the flow counter and the passthrough program
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Continue normal processing of the packet
    Continue,
    /// Do not process the packet any further
    Drop,
}

impl Decision {
    /// Return code for a socket filter program
    pub const fn socket_filter_code(self) -> i64 {
        match self {
            Decision::Continue => SK_FILTER_KEEP,
            Decision::Drop => SK_FILTER_DROP,
        }
    }

    /// Action code for an XDP program
    pub const fn xdp_action(self) -> XdpAction {
        match self {
            Decision::Continue => XdpAction::Pass,
            Decision::Drop => XdpAction::Drop,
        }
    }
}

/// Outcome of the CPU redirector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedirectDecision {
    /// No CPU configured, let the packet through untouched
    PassThrough,
    /// Frame too short to carry an Ethernet header
    Drop,
    /// Enqueue the frame on the cpumap entry of this CPU
    RedirectTo(u32),
}

impl RedirectDecision {
    /// Action code for the non-redirect outcomes. A redirect has to go
    /// through `bpf_redirect_map`, which produces its own action code.
    pub const fn fallback_action(self) -> Option<XdpAction> {
        match self {
            RedirectDecision::PassThrough => Some(XdpAction::Pass),
            RedirectDecision::Drop => Some(XdpAction::Drop),
            RedirectDecision::RedirectTo(_) => None,
        }
    }
}

/// Flow aggregation key: source address in the high half, destination in the
/// low half, both in host order after a big-endian decode of the header.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey(pub u64);

impl FlowKey {
    pub const fn new(saddr: u32, daddr: u32) -> Self {
        Self(((saddr as u64) << 32) | daddr as u64)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn saddr(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn daddr(self) -> u32 {
        self.0 as u32
    }

    pub fn source(self) -> Ipv4Addr {
        Ipv4Addr::from(self.saddr())
    }

    pub fn destination(self) -> Ipv4Addr {
        Ipv4Addr::from(self.daddr())
    }
}

impl From<u64> for FlowKey {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source(), self.destination())
    }
}

#[cfg(feature = "user")]
unsafe impl Pod for FlowKey {}
