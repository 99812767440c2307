#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::{xdp_action, BPF_NOEXIST},
    macros::{map, socket_filter, xdp},
    maps::{CpuMap, HashMap, PerCpuArray, PerfEventArray},
    programs::{SkBuffContext, XdpContext},
};
use aya_log_ebpf::warn;
use rsops_common::{
    classify_and_count, pass_through, select_target, tcp_event_of, CpuConfigTable,
    FlowCountTable, FlowKey, Frame, PerCpuPacketCounter, RedirectDecision, TableError, TcpEvent,
    CPU_CONFIG_KEY, MAX_CPUS, MAX_FLOW_ENTRIES, REDIRECT_FLAGS, RX_COUNT_INDEX,
};

/// errno returned by `bpf_map_update_elem` when `BPF_NOEXIST` hits a live key
const EEXIST: i64 = 17;

// Packet count per (saddr, daddr), filled by the socket filter
#[map(name = "FLOW_COUNTS")]
static FLOW_COUNTS: HashMap<FlowKey, i64> = HashMap::with_max_entries(MAX_FLOW_ENTRIES, 0);

// Target CPU for redirected frames, written by userspace at key 0
#[map(name = "CPU_CONFIG")]
static CPU_CONFIG: HashMap<u32, u32> = HashMap::with_max_entries(1, 0);

// Frames seen by the redirector, one slot per receiving CPU
#[map(name = "RX_COUNT")]
static RX_COUNT: PerCpuArray<i64> = PerCpuArray::with_max_entries(1, 0);

// Per-CPU queues; userspace sizes this map and fills the target entry
#[map(name = "CPU_MAP")]
static CPU_MAP: CpuMap = CpuMap::with_max_entries(MAX_CPUS, 0);

// TCP connection attempts, one ring per CPU
#[map(name = "TCP_EVENTS")]
static TCP_EVENTS: PerfEventArray<TcpEvent> = PerfEventArray::new(0);

/// Socket filter counting packets per IPv4 flow
#[socket_filter]
pub fn flow_counter(ctx: SkBuffContext) -> i64 {
    classify_and_count(&SkbFrame(&ctx), &mut FlowCounts(&ctx)).socket_filter_code()
}

/// XDP program steering every frame to the configured CPU
#[xdp]
pub fn xdp_redirect_cpu(ctx: XdpContext) -> u32 {
    let decision = select_target(&XdpFrame(&ctx), &CpuConfig, &mut RxCount);
    if let RedirectDecision::RedirectTo(cpu) = decision {
        return match CPU_MAP.redirect(cpu, REDIRECT_FLAGS) {
            Ok(action) | Err(action) => action,
        };
    }
    // Unconfigured frames pass silently; the loader logs that state once
    decision
        .fallback_action()
        .map_or(xdp_action::XDP_ABORTED, |action| action as u32)
}

/// XDP program reporting TCP connection attempts; never alters the frame
#[xdp]
pub fn xdp_dump(ctx: XdpContext) -> u32 {
    if let Some(event) = tcp_event_of(&XdpFrame(&ctx)) {
        TCP_EVENTS.output(&ctx, &event, 0);
    }
    xdp_action::XDP_PASS
}

/// Placeholder XDP program
#[xdp]
pub fn xdp_pass(ctx: XdpContext) -> u32 {
    pass_through(&XdpFrame(&ctx)).xdp_action() as u32
}

/// Packet as seen by a socket filter; reads go through `bpf_skb_load_bytes`
struct SkbFrame<'a>(&'a SkBuffContext);

impl Frame for SkbFrame<'_> {
    #[inline(always)]
    fn len(&self) -> usize {
        self.0.len() as usize
    }

    #[inline(always)]
    fn load_u8(&self, offset: usize) -> Option<u8> {
        self.0.load::<u8>(offset).ok()
    }

    #[inline(always)]
    fn load_be_u16(&self, offset: usize) -> Option<u16> {
        self.0.load::<u16>(offset).ok().map(u16::from_be)
    }

    #[inline(always)]
    fn load_be_u32(&self, offset: usize) -> Option<u32> {
        self.0.load::<u32>(offset).ok().map(u32::from_be)
    }
}

/// Packet as seen by an XDP program; reads are checked against `data_end`
struct XdpFrame<'a>(&'a XdpContext);

impl XdpFrame<'_> {
    #[inline(always)]
    fn ptr_at<T>(&self, offset: usize) -> Option<*const T> {
        let start = self.0.data();
        let end = self.0.data_end();
        if start + offset + core::mem::size_of::<T>() > end {
            return None;
        }
        Some((start + offset) as *const T)
    }
}

impl Frame for XdpFrame<'_> {
    #[inline(always)]
    fn len(&self) -> usize {
        self.0.data_end().saturating_sub(self.0.data())
    }

    #[inline(always)]
    fn load_u8(&self, offset: usize) -> Option<u8> {
        let ptr = self.ptr_at::<u8>(offset)?;
        Some(unsafe { *ptr })
    }

    #[inline(always)]
    fn load_be_u16(&self, offset: usize) -> Option<u16> {
        let ptr = self.ptr_at::<u16>(offset)?;
        Some(u16::from_be(unsafe { core::ptr::read_unaligned(ptr) }))
    }

    #[inline(always)]
    fn load_be_u32(&self, offset: usize) -> Option<u32> {
        let ptr = self.ptr_at::<u32>(offset)?;
        Some(u32::from_be(unsafe { core::ptr::read_unaligned(ptr) }))
    }
}

struct FlowCounts<'a>(&'a SkBuffContext);

impl FlowCountTable for FlowCounts<'_> {
    #[inline(always)]
    fn increment(&mut self, key: FlowKey) -> bool {
        match FLOW_COUNTS.get_ptr_mut(&key) {
            Some(count) => {
                // Plain read-modify-write: concurrent cores may lose updates.
                unsafe { *count = (*count).wrapping_add(1) };
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    fn insert(&mut self, key: FlowKey, count: i64) -> Result<(), TableError> {
        FLOW_COUNTS
            .insert(&key, &count, BPF_NOEXIST as u64)
            .map_err(|err| {
                if err == -EEXIST {
                    TableError::Occupied
                } else {
                    warn!(
                        self.0,
                        "flow table full, {:i} -> {:i} not counted",
                        key.saddr(),
                        key.daddr()
                    );
                    TableError::Full
                }
            })
    }
}

struct CpuConfig;

impl CpuConfigTable for CpuConfig {
    #[inline(always)]
    fn target_cpu(&self) -> Option<u32> {
        unsafe { CPU_CONFIG.get(&CPU_CONFIG_KEY) }.copied()
    }
}

struct RxCount;

impl PerCpuPacketCounter for RxCount {
    #[inline(always)]
    fn increment_local(&mut self) {
        if let Some(count) = RX_COUNT.get_ptr_mut(RX_COUNT_INDEX) {
            unsafe { *count = (*count).wrapping_add(1) };
        }
    }
}

/// Panic handler for eBPF programs
#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

/// License declaration required for eBPF programs
#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
