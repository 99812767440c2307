//! XDP CPU redirector.

use crate::{CpuConfigTable, Frame, PerCpuPacketCounter, RedirectDecision, ETH_HLEN};

/// Pick the CPU whose queue should receive this frame.
///
/// The receive counter is bumped on the core running the program, not on the
/// target core, so it measures ingress per receiving CPU.
#[inline(always)]
pub fn select_target<F, C, P>(frame: &F, config: &C, rx_count: &mut P) -> RedirectDecision
where
    F: Frame + ?Sized,
    C: CpuConfigTable,
    P: PerCpuPacketCounter,
{
    if frame.len() < ETH_HLEN {
        return RedirectDecision::Drop;
    }

    let Some(cpu) = config.target_cpu() else {
        return RedirectDecision::PassThrough;
    };

    rx_count.increment_local();
    RedirectDecision::RedirectTo(cpu)
}
