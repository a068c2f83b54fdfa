//! Capabilities consumed from the debugger backend.
//!
//! The engine never touches the target directly: memory access, trap
//! installation, execution control and register reads all go through these
//! traits, as does instruction decoding. A ptrace backend, a remote
//! debugger protocol or an emulator are all valid implementations.

use std::fmt;

use crate::error::Result;
use crate::procfs::Region;
use crate::registers::{RegisterGroups, RegisterSnapshot};
use crate::types::{ProcessState, StopEvent, TrapHandle, VirtAddr};

/// Byte-level access to a target address space.
pub trait AddressSpace {
    /// Enumerate mapped regions, ordered by start address.
    fn list_regions(&self) -> Result<Vec<Region>>;

    /// Read `len` bytes at `addr`. Fails with `NotReadable`.
    fn read_memory(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `addr`. Fails with `NotWritable`.
    fn write_memory(&self, addr: VirtAddr, data: &[u8]) -> Result<()>;
}

/// What kind of access a watchpoint traps on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAccess {
    Write,
    Read,
    ReadWrite,
}

impl fmt::Display for WatchAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchAccess::Write => write!(f, "write"),
            WatchAccess::Read => write!(f, "read"),
            WatchAccess::ReadWrite => write!(f, "rw"),
        }
    }
}

/// Execution control over a stopped target.
///
/// Every method assumes the caller holds the debug session exclusively;
/// the backend cannot multiplex concurrent stop/resume requests.
pub trait DebugControl: AddressSpace {
    /// Install a breakpoint. Fails with `BackendRejected`.
    fn set_breakpoint(&mut self, addr: VirtAddr, condition: Option<&str>) -> Result<TrapHandle>;

    /// Install a watchpoint over `[addr, addr + len)`. Fails with `BackendRejected`.
    fn set_watchpoint(
        &mut self,
        addr: VirtAddr,
        len: usize,
        access: WatchAccess,
        condition: Option<&str>,
    ) -> Result<TrapHandle>;

    /// Remove a trap. Fails with `NotFound`.
    fn remove_trap(&mut self, handle: TrapHandle) -> Result<()>;

    /// Execute one machine instruction and wait for the resulting stop.
    fn single_step(&mut self) -> Result<StopEvent>;

    /// Let the target run. Returns once the request is issued.
    fn resume(&mut self) -> Result<()>;

    /// Block until the running target stops.
    fn wait_for_stop(&mut self) -> Result<StopEvent>;

    /// Read the registers of the given groups.
    fn read_registers(&mut self, groups: RegisterGroups) -> Result<RegisterSnapshot>;

    /// Current instruction pointer.
    fn program_counter(&mut self) -> Result<VirtAddr>;

    /// Evaluate a condition expression in the target's current context.
    fn evaluate_condition(&mut self, expression: &str) -> Result<bool>;

    fn state(&self) -> ProcessState;
}

/// Control-flow class of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Sequential,
    Call,
    IndirectCall,
    Jump,
    ConditionalJump,
    IndirectJump,
    Return,
    Interrupt,
}

impl FlowKind {
    pub fn is_call(self) -> bool {
        matches!(self, FlowKind::Call | FlowKind::IndirectCall)
    }

    pub fn is_jump(self) -> bool {
        matches!(
            self,
            FlowKind::Jump | FlowKind::ConditionalJump | FlowKind::IndirectJump
        )
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub address: VirtAddr,
    pub length: usize,
    pub mnemonic: String,
    pub operands: String,
    pub flow: FlowKind,
    /// Statically known branch target of a call or jump.
    pub target: Option<VirtAddr>,
    /// Statically known memory address the instruction refers to
    /// (absolute or RIP-relative memory operand, or an address-sized immediate).
    pub memory_reference: Option<VirtAddr>,
}

impl DecodedInstruction {
    /// Address of the instruction following this one.
    pub fn next_address(&self) -> VirtAddr {
        self.address + self.length as u64
    }

    pub fn text(&self) -> String {
        if self.operands.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.operands)
        }
    }
}

/// Instruction decoder.
pub trait Disassembler {
    /// Decode the instruction at the start of `bytes`, located at `addr`.
    /// Fails with `Decode` when no valid instruction starts there.
    fn decode_instruction(&self, bytes: &[u8], addr: VirtAddr) -> Result<DecodedInstruction>;

    /// Longest instruction the decoder can produce.
    fn max_instruction_len(&self) -> usize {
        15
    }
}
