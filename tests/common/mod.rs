//! Scripted debugger backend shared by the integration tests.
//!
//! The target executes a straight line of one-byte instructions: every step
//! advances the program counter by one, breakpoints stop a running target
//! when the counter reaches them, and leaving the code region exits it.
//! Condition expressions are answered from a script keyed by expression.

#![allow(dead_code)]

use std::collections::HashMap;

use memprobe::backend::{AddressSpace, DebugControl, WatchAccess};
use memprobe::error::{Error, Result};
use memprobe::memory::MemoryImage;
use memprobe::procfs::{Permissions, Region};
use memprobe::registers::{RegisterGroups, RegisterSnapshot};
use memprobe::types::{ProcessState, StopEvent, StopReason, TrapHandle, VirtAddr};

pub const CODE: u64 = 0x40_0000;
pub const CODE_LEN: u64 = 0x1000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct LinearTarget {
    pub image: MemoryImage,
    pub pc: VirtAddr,
    pub state: ProcessState,
    traps: HashMap<TrapHandle, VirtAddr>,
    next_handle: u32,
    /// Evaluation number (1-based) from which an expression holds.
    holds_from: HashMap<String, u32>,
    evaluations: HashMap<String, u32>,
}

impl LinearTarget {
    pub fn new() -> Self {
        let mut image = MemoryImage::new();
        image
            .map_with(
                Region::new(CODE, CODE + CODE_LEN, Permissions::RX),
                &vec![0x90; CODE_LEN as usize],
            )
            .unwrap();
        LinearTarget {
            image,
            pc: VirtAddr(CODE),
            state: ProcessState::Stopped,
            traps: HashMap::new(),
            next_handle: 1,
            holds_from: HashMap::new(),
            evaluations: HashMap::new(),
        }
    }

    pub fn condition_holds_from(&mut self, expression: &str, evaluation: u32) {
        self.holds_from.insert(expression.to_string(), evaluation);
    }

    pub fn trap_count(&self) -> usize {
        self.traps.len()
    }

    fn advance(&mut self) -> bool {
        self.pc = self.pc + 1;
        if self.pc.addr() >= CODE + CODE_LEN {
            self.state = ProcessState::Exited;
            return false;
        }
        true
    }

    fn alive(&self) -> Result<()> {
        match self.state {
            ProcessState::Exited | ProcessState::Terminated => Err(Error::TargetTerminated),
            _ => Ok(()),
        }
    }
}

impl AddressSpace for LinearTarget {
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

impl DebugControl for LinearTarget {
    fn set_breakpoint(&mut self, addr: VirtAddr, _condition: Option<&str>) -> Result<TrapHandle> {
        self.alive()?;
        let handle = TrapHandle(self.next_handle);
        self.next_handle += 1;
        self.traps.insert(handle, addr);
        Ok(handle)
    }

    fn set_watchpoint(
        &mut self,
        addr: VirtAddr,
        _len: usize,
        _access: WatchAccess,
        condition: Option<&str>,
    ) -> Result<TrapHandle> {
        self.set_breakpoint(addr, condition)
    }

    fn remove_trap(&mut self, handle: TrapHandle) -> Result<()> {
        self.traps
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("no trap {}", handle)))
    }

    fn single_step(&mut self) -> Result<StopEvent> {
        self.alive()?;
        if !self.advance() {
            return Ok(StopEvent::new(StopReason::Exited(0)));
        }
        self.state = ProcessState::Stopped;
        Ok(StopEvent::new(StopReason::SingleStep))
    }

    fn resume(&mut self) -> Result<()> {
        self.alive()?;
        self.state = ProcessState::Running;
        Ok(())
    }

    fn wait_for_stop(&mut self) -> Result<StopEvent> {
        self.alive()?;
        while self.advance() {
            if let Some((handle, _)) = self.traps.iter().find(|(_, a)| **a == self.pc) {
                self.state = ProcessState::Stopped;
                return Ok(StopEvent::trap(self.pc, *handle));
            }
        }
        Ok(StopEvent::new(StopReason::Exited(0)))
    }

    fn read_registers(&mut self, groups: RegisterGroups) -> Result<RegisterSnapshot> {
        self.alive()?;
        let mut snapshot = RegisterSnapshot::new();
        if groups.contains(RegisterGroups::GENERAL) {
            snapshot.push_word("rip", self.pc.addr());
        }
        if groups.contains(RegisterGroups::FLAGS) {
            snapshot.push_word("rflags", 0x202);
        }
        Ok(snapshot)
    }

    fn program_counter(&mut self) -> Result<VirtAddr> {
        self.alive()?;
        Ok(self.pc)
    }

    fn evaluate_condition(&mut self, expression: &str) -> Result<bool> {
        let from = *self
            .holds_from
            .get(expression)
            .ok_or_else(|| Error::InvalidInput(format!("unknown expression '{}'", expression)))?;
        let n = self.evaluations.entry(expression.to_string()).or_insert(0);
        *n += 1;
        Ok(*n >= from)
    }

    fn state(&self) -> ProcessState {
        self.state
    }
}
