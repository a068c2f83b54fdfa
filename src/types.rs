use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Virtual address in the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub fn addr(self) -> u64 {
        self.0
    }

    /// Offset of `self` from `base`, if `self` is not below it.
    pub fn offset_from(self, base: VirtAddr) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    pub fn is_aligned(self, align: usize) -> bool {
        align <= 1 || self.0 % align as u64 == 0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::ops::Add<u64> for VirtAddr {
    type Output = VirtAddr;
    fn add(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for VirtAddr {
    type Output = VirtAddr;
    fn sub(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0 - rhs)
    }
}

/// Opaque handle for a trap (breakpoint or watchpoint) installed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrapHandle(pub u32);

impl fmt::Display for TrapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why the target stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Hit a breakpoint or watchpoint.
    TrapHit { addr: VirtAddr },
    /// Completed a single-step.
    SingleStep,
    /// Received a signal.
    Signal(i32),
    /// Process exited normally.
    Exited(i32),
    /// Process was killed by a signal.
    Terminated(i32),
    /// The backend lost the target.
    Detached,
}

/// A stop notification from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopEvent {
    pub reason: StopReason,
    /// The trap that fired, if the stop was a trap hit.
    pub handle: Option<TrapHandle>,
}

impl StopEvent {
    pub fn new(reason: StopReason) -> Self {
        StopEvent { reason, handle: None }
    }

    pub fn trap(addr: VirtAddr, handle: TrapHandle) -> Self {
        StopEvent {
            reason: StopReason::TrapHit { addr },
            handle: Some(handle),
        }
    }

    /// The target is gone; no further control requests make sense.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.reason,
            StopReason::Exited(_) | StopReason::Terminated(_) | StopReason::Detached
        )
    }
}

/// Process execution state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Running,
    Exited,
    Terminated,
}

/// Cooperative cancellation flag shared between a caller and a long-running
/// scan, dissection or trace.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can be reused for the next operation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_display() {
        let addr = VirtAddr(0x400000);
        assert_eq!(format!("{}", addr), "0x400000");
    }

    #[test]
    fn virt_addr_arithmetic() {
        let addr = VirtAddr(0x1000);
        assert_eq!((addr + 0x10).addr(), 0x1010);
        assert_eq!((addr - 0x10).addr(), 0x0FF0);
        assert_eq!(VirtAddr(0x1010).offset_from(addr), Some(0x10));
        assert_eq!(VirtAddr(0x0fff).offset_from(addr), None);
    }

    #[test]
    fn virt_addr_alignment() {
        assert!(VirtAddr(0x1004).is_aligned(4));
        assert!(!VirtAddr(0x1002).is_aligned(4));
        assert!(VirtAddr(0x1003).is_aligned(1));
        assert!(VirtAddr(0x1003).is_aligned(0));
    }

    #[test]
    fn stop_event_terminal() {
        assert!(StopEvent::new(StopReason::Exited(0)).is_terminal());
        assert!(StopEvent::new(StopReason::Detached).is_terminal());
        assert!(!StopEvent::new(StopReason::SingleStep).is_terminal());
        assert!(!StopEvent::trap(VirtAddr(0x10), TrapHandle(1)).is_terminal());
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(!worker.is_canceled());
        token.cancel();
        assert!(worker.is_canceled());
        worker.reset();
        assert!(!token.is_canceled());
    }
}
