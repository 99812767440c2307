use crate::{Decision, Frame};

/// Placeholder program body: keeps an attach point alive without touching
/// the packet or any map.
#[inline(always)]
pub fn pass_through<F: Frame + ?Sized>(_frame: &F) -> Decision {
    Decision::Continue
}
