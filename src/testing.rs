//! Scripted debugger backend for unit tests.
//!
//! [`ScriptedTarget`] runs x86_64 code held in a [`MemoryImage`] with a
//! minimal control-flow model: calls push a return address, returns pop it,
//! direct jumps are taken, conditional jumps fall through and everything
//! else advances to the next instruction. Running off mapped code exits the
//! target.

use std::cell::Cell;
use std::collections::HashMap;

use indexmap::IndexMap;

use crate::backend::{AddressSpace, DebugControl, Disassembler, FlowKind, WatchAccess};
use crate::disasm::IcedDisassembler;
use crate::error::{Error, Result};
use crate::memory::MemoryImage;
use crate::procfs::{Permissions, Region};
use crate::registers::{RegisterGroups, RegisterSnapshot, RegisterValue};
use crate::types::{ProcessState, StopEvent, StopReason, TrapHandle, VirtAddr};

pub const CODE_BASE: u64 = 0x1000;
const STACK_TOP: u64 = 0x7fff_0000;
const RUN_LIMIT: usize = 100_000;

/// How the target answers a condition expression.
pub enum Condition {
    Const(bool),
    Fails,
    /// True on the 1st, 3rd, 5th... evaluation.
    Alternating,
    /// True from the n-th evaluation on.
    TrueFromEval(u32),
    AtPc(VirtAddr),
}

pub struct ScriptedTarget {
    image: MemoryImage,
    pc: VirtAddr,
    stack: Vec<VirtAddr>,
    state: ProcessState,
    breakpoints: IndexMap<TrapHandle, VirtAddr>,
    watchpoints: IndexMap<TrapHandle, (VirtAddr, usize)>,
    next_handle: u32,
    refused: Vec<VirtAddr>,
    conditions: HashMap<String, Condition>,
    evaluations: HashMap<String, u32>,
    register_reads_left: Option<usize>,
    fail_next_wait: bool,
    pub steps: usize,
    pub resumes: usize,
}

impl ScriptedTarget {
    /// A page of NOPs at `CODE_BASE`, with `code` at its start.
    pub fn with_code(code: &[u8]) -> Self {
        let mut image = MemoryImage::new();
        let mut page = vec![0x90; 0x1000];
        page[..code.len()].copy_from_slice(code);
        image
            .map_with(Region::new(CODE_BASE, CODE_BASE + 0x1000, Permissions::RX), &page)
            .unwrap();
        image
            .map(Region::new(0x8000, 0x9000, Permissions::RW))
            .unwrap();
        ScriptedTarget {
            image,
            pc: VirtAddr(CODE_BASE),
            stack: Vec::new(),
            state: ProcessState::Stopped,
            breakpoints: IndexMap::new(),
            watchpoints: IndexMap::new(),
            next_handle: 1,
            refused: Vec::new(),
            conditions: HashMap::new(),
            evaluations: HashMap::new(),
            register_reads_left: None,
            fail_next_wait: false,
            steps: 0,
            resumes: 0,
        }
    }

    pub fn nops() -> Self {
        Self::with_code(&[])
    }

    pub fn image(&self) -> &MemoryImage {
        &self.image
    }

    pub fn pc(&self) -> VirtAddr {
        self.pc
    }

    pub fn set_pc(&mut self, pc: VirtAddr) {
        self.pc = pc;
    }

    /// Refuse any trap installed exactly at `addr`.
    pub fn refuse(&mut self, addr: VirtAddr) {
        self.refused.push(addr);
    }

    pub fn set_condition(&mut self, expression: &str, condition: Condition) {
        self.conditions.insert(expression.to_string(), condition);
    }

    /// The target dies on the register read after the next `n`.
    pub fn die_after_register_reads(&mut self, n: usize) {
        self.register_reads_left = Some(n);
    }

    /// The next `wait_for_stop` fails with a backend error.
    pub fn fail_next_wait(&mut self) {
        self.fail_next_wait = true;
    }

    pub fn trap_count(&self) -> usize {
        self.breakpoints.len() + self.watchpoints.len()
    }

    fn is_gone(&self) -> bool {
        matches!(self.state, ProcessState::Exited | ProcessState::Terminated)
    }

    fn new_handle(&mut self, addr: VirtAddr) -> Result<TrapHandle> {
        if self.is_gone() {
            return Err(Error::TargetTerminated);
        }
        if self.refused.contains(&addr) {
            return Err(Error::BackendRejected(format!("no trap slot for {}", addr)));
        }
        let handle = TrapHandle(self.next_handle);
        self.next_handle += 1;
        Ok(handle)
    }

    /// Execute one instruction; returns false once the target has exited.
    fn execute(&mut self) -> bool {
        let regions = self.image.list_regions().unwrap_or_default();
        let Some(region) = regions.iter().find(|r| r.contains(self.pc) && r.perms.execute) else {
            self.state = ProcessState::Exited;
            return false;
        };
        let len = (region.end.addr() - self.pc.addr()).min(15) as usize;
        let insn = match self
            .image
            .read_memory(self.pc, len)
            .and_then(|bytes| IcedDisassembler::default().decode_instruction(&bytes, self.pc))
        {
            Ok(insn) => insn,
            Err(_) => {
                self.state = ProcessState::Exited;
                return false;
            }
        };
        self.pc = match insn.flow {
            FlowKind::Call | FlowKind::IndirectCall => {
                self.stack.push(insn.next_address());
                insn.target.unwrap_or(insn.next_address())
            }
            FlowKind::Jump => insn.target.unwrap_or(insn.next_address()),
            FlowKind::Return => match self.stack.pop() {
                Some(ret) => ret,
                None => {
                    self.state = ProcessState::Exited;
                    return false;
                }
            },
            _ => insn.next_address(),
        };
        true
    }
}

impl AddressSpace for ScriptedTarget {
    fn list_regions(&self) -> Result<Vec<Region>> {
        self.image.list_regions()
    }

    fn read_memory(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        self.image.read_memory(addr, len)
    }

    fn write_memory(&self, addr: VirtAddr, data: &[u8]) -> Result<()> {
        self.image.write_memory(addr, data)
    }
}

impl DebugControl for ScriptedTarget {
    fn set_breakpoint(&mut self, addr: VirtAddr, _condition: Option<&str>) -> Result<TrapHandle> {
        let handle = self.new_handle(addr)?;
        self.breakpoints.insert(handle, addr);
        Ok(handle)
    }

    fn set_watchpoint(
        &mut self,
        addr: VirtAddr,
        len: usize,
        _access: WatchAccess,
        _condition: Option<&str>,
    ) -> Result<TrapHandle> {
        if len > 8 {
            return Err(Error::BackendRejected(format!("cannot watch {} bytes", len)));
        }
        let handle = self.new_handle(addr)?;
        self.watchpoints.insert(handle, (addr, len));
        Ok(handle)
    }

    fn remove_trap(&mut self, handle: TrapHandle) -> Result<()> {
        if self.breakpoints.shift_remove(&handle).is_some()
            || self.watchpoints.shift_remove(&handle).is_some()
        {
            Ok(())
        } else {
            Err(Error::NotFound(format!("no trap {}", handle)))
        }
    }

    fn single_step(&mut self) -> Result<StopEvent> {
        if self.is_gone() {
            return Err(Error::TargetTerminated);
        }
        self.steps += 1;
        if !self.execute() {
            return Ok(StopEvent::new(StopReason::Exited(0)));
        }
        self.state = ProcessState::Stopped;
        Ok(StopEvent::new(StopReason::SingleStep))
    }

    fn resume(&mut self) -> Result<()> {
        if self.is_gone() {
            return Err(Error::TargetTerminated);
        }
        self.resumes += 1;
        self.state = ProcessState::Running;
        Ok(())
    }

    fn wait_for_stop(&mut self) -> Result<StopEvent> {
        if self.is_gone() {
            return Err(Error::TargetTerminated);
        }
        if self.state != ProcessState::Running {
            return Err(Error::InvalidState("target is not running".into()));
        }
        if std::mem::take(&mut self.fail_next_wait) {
            self.state = ProcessState::Stopped;
            return Err(Error::InvalidState("lost stop event".into()));
        }
        for _ in 0..RUN_LIMIT {
            if !self.execute() {
                return Ok(StopEvent::new(StopReason::Exited(0)));
            }
            if let Some((handle, _)) = self.breakpoints.iter().find(|(_, a)| **a == self.pc) {
                self.state = ProcessState::Stopped;
                return Ok(StopEvent::trap(self.pc, *handle));
            }
        }
        self.state = ProcessState::Stopped;
        Ok(StopEvent::new(StopReason::Signal(19)))
    }

    fn read_registers(&mut self, groups: RegisterGroups) -> Result<RegisterSnapshot> {
        if self.is_gone() {
            return Err(Error::TargetTerminated);
        }
        if let Some(left) = self.register_reads_left.as_mut() {
            if *left == 0 {
                self.state = ProcessState::Terminated;
                return Err(Error::TargetTerminated);
            }
            *left -= 1;
        }
        let mut snapshot = RegisterSnapshot::new();
        if groups.contains(RegisterGroups::GENERAL) {
            snapshot.push_word("rax", self.steps as u64);
            snapshot.push_word("rsp", STACK_TOP - 8 * self.stack.len() as u64);
            snapshot.push_word("rip", self.pc.addr());
        }
        if groups.contains(RegisterGroups::FLAGS) {
            snapshot.push_word("rflags", 0x246);
        }
        if groups.contains(RegisterGroups::SEGMENT) {
            snapshot.push_word("cs", 0x33);
        }
        if groups.contains(RegisterGroups::FLOAT) {
            snapshot.push("xmm0", RegisterValue::Wide(vec![0; 16]));
        }
        Ok(snapshot)
    }

    fn program_counter(&mut self) -> Result<VirtAddr> {
        if self.is_gone() {
            return Err(Error::TargetTerminated);
        }
        Ok(self.pc)
    }

    fn evaluate_condition(&mut self, expression: &str) -> Result<bool> {
        let count = self.evaluations.entry(expression.to_string()).or_insert(0);
        *count += 1;
        let n = *count;
        match self.conditions.get(expression) {
            Some(Condition::Const(value)) => Ok(*value),
            Some(Condition::Alternating) => Ok(n % 2 == 1),
            Some(Condition::TrueFromEval(k)) => Ok(n >= *k),
            Some(Condition::AtPc(addr)) => Ok(self.pc == *addr),
            Some(Condition::Fails) | None => Err(Error::InvalidInput(format!(
                "cannot evaluate '{}'",
                expression
            ))),
        }
    }

    fn state(&self) -> ProcessState {
        self.state
    }
}

/// Reader whose target dies after a fixed number of reads.
pub struct DyingReader<'a> {
    image: &'a MemoryImage,
    reads_left: Cell<usize>,
}

impl<'a> DyingReader<'a> {
    pub fn new(image: &'a MemoryImage, reads: usize) -> Self {
        DyingReader {
            image,
            reads_left: Cell::new(reads),
        }
    }
}

impl AddressSpace for DyingReader<'_> {
    fn list_regions(&self) -> Result<Vec<Region>> {
        self.image.list_regions()
    }

    fn read_memory(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        match self.reads_left.get() {
            0 => Err(Error::TargetTerminated),
            n => {
                self.reads_left.set(n - 1);
                self.image.read_memory(addr, len)
            }
        }
    }

    fn write_memory(&self, addr: VirtAddr, data: &[u8]) -> Result<()> {
        self.image.write_memory(addr, data)
    }
}
