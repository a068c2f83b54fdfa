//! Breakpoint and watchpoint bookkeeping.
//!
//! The backend owns the physical traps; [`BreakWatchRegistry`] owns the
//! user-facing entries layered on top of them: conditions, hit counts and
//! what happens to an entry after it fires.
//!
//! Entries can also collect data on every fired hit: the code that touched
//! a watched address ([`HitAction::FindCode`]) or the values of register
//! expressions at a breakpoint ([`HitAction::FindAddress`]).

use std::fmt;

use indexmap::IndexMap;
use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::backend::{DebugControl, DecodedInstruction, WatchAccess};
use crate::disasm::{previous_instruction, IcedDisassembler};
use crate::error::{Error, Result};
use crate::registers::{RegisterExpression, RegisterGroups, RegisterSnapshot};
use crate::types::{TrapHandle, VirtAddr};

/// Identifier of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u32);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Breakpoint,
    Watchpoint { len: usize, access: WatchAccess },
}

/// What happens to an entry after a hit fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    Keep,
    DisableAfterHit,
    /// Disable once the hit count reaches `n`.
    DisableAfterHits(u64),
    DeleteAfterHit,
}

/// Data collected when a hit fires.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HitAction {
    /// Only count hits.
    #[default]
    Count,
    /// Record the instruction that caused each hit, keyed by program counter.
    FindCode,
    /// Count the values each expression takes at the hit.
    FindAddress(Vec<RegisterExpression>),
}

/// Hits seen at one program counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeHit {
    pub pc: VirtAddr,
    pub count: u64,
    /// Instruction ending at `pc`; for a watchpoint, the one that accessed
    /// the watched range.
    pub previous: Option<DecodedInstruction>,
    /// Registers at the latest hit.
    pub registers: RegisterSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Enabled,
    Disabled,
    Deleted,
}

/// A breakpoint or watchpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakWatchEntry {
    pub id: EntryId,
    pub address: VirtAddr,
    pub kind: EntryKind,
    pub condition: Option<String>,
    pub hit_count: u64,
    pub enabled: bool,
    pub disposition: Disposition,
    pub action: HitAction,
    /// Filled by [`HitAction::FindCode`].
    pub code_hits: IndexMap<VirtAddr, CodeHit>,
    /// Filled by [`HitAction::FindAddress`]: expression text to value counts.
    pub address_hits: IndexMap<String, IndexMap<VirtAddr, u64>>,
    /// Backend traps; a long watchpoint is a chain of several.
    pub handles: Vec<TrapHandle>,
}

impl BreakWatchEntry {
    pub fn state(&self) -> EntryState {
        if self.enabled {
            EntryState::Enabled
        } else {
            EntryState::Disabled
        }
    }
}

/// Result of processing a trap hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitOutcome {
    /// The entry is disabled.
    Ignored,
    ConditionNotMet,
    /// The condition could not be evaluated; treated as not met.
    ConditionFailed(String),
    Fired { hit_count: u64, state: EntryState },
}

enum Observation {
    Nothing,
    Code {
        pc: VirtAddr,
        previous: Option<DecodedInstruction>,
        registers: RegisterSnapshot,
    },
    Values(Vec<(String, Option<u64>)>),
}

impl Observation {
    fn record(self, entry: &mut BreakWatchEntry) {
        match self {
            Observation::Nothing => {}
            Observation::Code {
                pc,
                previous,
                registers,
            } => {
                let hit = entry.code_hits.entry(pc).or_insert_with(|| CodeHit {
                    pc,
                    count: 0,
                    previous: None,
                    registers: RegisterSnapshot::new(),
                });
                hit.count += 1;
                hit.previous = previous;
                hit.registers = registers;
            }
            Observation::Values(values) => {
                for (text, value) in values {
                    let counts = entry.address_hits.entry(text).or_default();
                    if let Some(value) = value {
                        *counts.entry(VirtAddr(value)).or_insert(0) += 1;
                    }
                }
            }
        }
    }
}

struct Inner {
    entries: IndexMap<EntryId, BreakWatchEntry>,
    next_id: u32,
}

/// Registry of breakpoints and watchpoints for one target.
pub struct BreakWatchRegistry {
    inner: RwLock<Inner>,
    max_watch_len: usize,
    disassembler: IcedDisassembler,
}

impl Default for BreakWatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything the backend says while installing a trap is a refusal,
/// except losing the target.
fn rejected(e: Error) -> Error {
    match e {
        Error::BackendRejected(_) | Error::TargetTerminated => e,
        other => Error::BackendRejected(other.to_string()),
    }
}

fn remove_traps(backend: &mut dyn DebugControl, handles: &mut Vec<TrapHandle>) {
    for handle in handles.drain(..) {
        if let Err(e) = backend.remove_trap(handle) {
            warn!("failed to remove trap {}: {}", handle, e);
        }
    }
}

impl BreakWatchRegistry {
    pub fn new() -> Self {
        BreakWatchRegistry {
            inner: RwLock::new(Inner {
                entries: IndexMap::new(),
                next_id: 1,
            }),
            max_watch_len: 8,
            disassembler: IcedDisassembler::default(),
        }
    }

    /// Decoder used to find the instruction behind a [`HitAction::FindCode`] hit.
    pub fn with_disassembler(mut self, disassembler: IcedDisassembler) -> Self {
        self.disassembler = disassembler;
        self
    }

    /// Longest range a single backend watchpoint covers.
    pub fn with_max_watch_len(mut self, len: usize) -> Self {
        self.max_watch_len = len.max(1);
        self
    }

    fn install(
        &self,
        backend: &mut dyn DebugControl,
        address: VirtAddr,
        kind: EntryKind,
        condition: Option<&str>,
    ) -> Result<Vec<TrapHandle>> {
        match kind {
            EntryKind::Breakpoint => {
                let handle = backend.set_breakpoint(address, condition).map_err(rejected)?;
                Ok(vec![handle])
            }
            EntryKind::Watchpoint { len, access } => {
                let mut handles = Vec::new();
                let mut offset = 0;
                while offset < len {
                    let piece = (len - offset).min(self.max_watch_len);
                    match backend.set_watchpoint(address + offset as u64, piece, access, condition) {
                        Ok(handle) => handles.push(handle),
                        Err(e) => {
                            remove_traps(backend, &mut handles);
                            return Err(rejected(e));
                        }
                    }
                    offset += piece;
                }
                Ok(handles)
            }
        }
    }

    fn add(
        &self,
        backend: &mut dyn DebugControl,
        address: VirtAddr,
        kind: EntryKind,
        condition: Option<&str>,
        action: HitAction,
    ) -> Result<EntryId> {
        let mut inner = self.inner.write();
        if inner.entries.values().any(|e| e.address == address) {
            return Err(Error::InvalidInput(format!(
                "an entry already exists at {}",
                address
            )));
        }
        let handles = self.install(backend, address, kind, condition)?;
        let id = EntryId(inner.next_id);
        inner.next_id += 1;
        inner.entries.insert(
            id,
            BreakWatchEntry {
                id,
                address,
                kind,
                condition: condition.map(str::to_string),
                hit_count: 0,
                enabled: true,
                disposition: Disposition::Keep,
                action,
                code_hits: IndexMap::new(),
                address_hits: IndexMap::new(),
                handles,
            },
        );
        info!("entry {} set at {}", id, address);
        Ok(id)
    }

    pub fn set_breakpoint(
        &self,
        backend: &mut dyn DebugControl,
        address: VirtAddr,
        condition: Option<&str>,
    ) -> Result<EntryId> {
        self.add(backend, address, EntryKind::Breakpoint, condition, HitAction::Count)
    }

    pub fn set_watchpoint(
        &self,
        backend: &mut dyn DebugControl,
        address: VirtAddr,
        len: usize,
        access: WatchAccess,
        condition: Option<&str>,
    ) -> Result<EntryId> {
        if len == 0 {
            return Err(Error::InvalidInput("watchpoint length must be at least 1".into()));
        }
        self.add(
            backend,
            address,
            EntryKind::Watchpoint { len, access },
            condition,
            HitAction::Count,
        )
    }

    /// Watch `[address, address + len)` and record the code that accesses it.
    pub fn track_watchpoint(
        &self,
        backend: &mut dyn DebugControl,
        address: VirtAddr,
        len: usize,
        access: WatchAccess,
    ) -> Result<EntryId> {
        if len == 0 {
            return Err(Error::InvalidInput("watchpoint length must be at least 1".into()));
        }
        self.add(
            backend,
            address,
            EntryKind::Watchpoint { len, access },
            None,
            HitAction::FindCode,
        )
    }

    /// Break at `address` and count the values of comma separated register
    /// expressions, e.g. `"$rax,$rcx+5,$rbp+$r12"`.
    pub fn track_breakpoint(
        &self,
        backend: &mut dyn DebugControl,
        address: VirtAddr,
        expressions: &str,
    ) -> Result<EntryId> {
        let expressions = RegisterExpression::parse_list(expressions)?;
        if expressions.is_empty() {
            return Err(Error::InvalidInput("no register expressions to track".into()));
        }
        self.add(
            backend,
            address,
            EntryKind::Breakpoint,
            None,
            HitAction::FindAddress(expressions),
        )
    }

    /// Entry owning a backend trap.
    pub fn entry_for_handle(&self, handle: TrapHandle) -> Option<EntryId> {
        self.inner
            .read()
            .entries
            .values()
            .find(|e| e.handles.contains(&handle))
            .map(|e| e.id)
    }

    pub fn get(&self, id: EntryId) -> Option<BreakWatchEntry> {
        self.inner.read().entries.get(&id).cloned()
    }

    /// All entries in creation order.
    pub fn list(&self) -> Vec<BreakWatchEntry> {
        self.inner.read().entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Process a trap hit reported for `id`.
    pub fn on_hit(&self, backend: &mut dyn DebugControl, id: EntryId) -> Result<HitOutcome> {
        let (condition, action) = {
            let inner = self.inner.read();
            let entry = inner
                .entries
                .get(&id)
                .ok_or_else(|| Error::NotFound(format!("no entry {}", id)))?;
            if !entry.enabled {
                return Ok(HitOutcome::Ignored);
            }
            (entry.condition.clone(), entry.action.clone())
        };

        if let Some(expr) = condition.as_deref() {
            match backend.evaluate_condition(expr) {
                Ok(true) => {}
                Ok(false) => return Ok(HitOutcome::ConditionNotMet),
                Err(e) => {
                    warn!("condition '{}' of entry {} failed: {}", expr, id, e);
                    return Ok(HitOutcome::ConditionFailed(e.to_string()));
                }
            }
        }

        let observation = self.observe(backend, &action)?;

        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("no entry {}", id)))?;
        if !entry.enabled {
            return Ok(HitOutcome::Ignored);
        }
        entry.hit_count += 1;
        observation.record(entry);
        let hit_count = entry.hit_count;
        let disposition = entry.disposition;

        let state = match disposition {
            Disposition::Keep => EntryState::Enabled,
            Disposition::DisableAfterHits(n) if hit_count < n => EntryState::Enabled,
            Disposition::DisableAfterHit | Disposition::DisableAfterHits(_) => {
                remove_traps(backend, &mut entry.handles);
                entry.enabled = false;
                debug!("entry {} disabled after {} hits", id, hit_count);
                EntryState::Disabled
            }
            Disposition::DeleteAfterHit => {
                if let Some(mut removed) = inner.entries.shift_remove(&id) {
                    remove_traps(backend, &mut removed.handles);
                }
                debug!("entry {} deleted after hit", id);
                EntryState::Deleted
            }
        };
        Ok(HitOutcome::Fired { hit_count, state })
    }

    fn observe(&self, backend: &mut dyn DebugControl, action: &HitAction) -> Result<Observation> {
        Ok(match action {
            HitAction::Count => Observation::Nothing,
            HitAction::FindCode => {
                let pc = backend.program_counter()?;
                let registers = backend.read_registers(RegisterGroups::all())?;
                let previous = previous_instruction(&*backend, &self.disassembler, pc);
                if previous.is_none() {
                    debug!("no instruction ends at {}", pc);
                }
                Observation::Code {
                    pc,
                    previous,
                    registers,
                }
            }
            HitAction::FindAddress(expressions) => {
                let registers = backend.read_registers(RegisterGroups::GENERAL)?;
                Observation::Values(
                    expressions
                        .iter()
                        .map(|e| (e.text().to_string(), e.evaluate(&registers)))
                        .collect(),
                )
            }
        })
    }

    /// Replace what an entry collects on hits; data collected so far is dropped.
    pub fn set_action(&self, id: EntryId, action: HitAction) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("no entry {}", id)))?;
        entry.action = action;
        entry.code_hits.clear();
        entry.address_hits.clear();
        Ok(())
    }

    /// Code hits of a [`HitAction::FindCode`] entry, in first-seen order.
    pub fn code_hits(&self, id: EntryId) -> Result<Vec<CodeHit>> {
        self.inner
            .read()
            .entries
            .get(&id)
            .map(|e| e.code_hits.values().cloned().collect())
            .ok_or_else(|| Error::NotFound(format!("no entry {}", id)))
    }

    /// Value counts of a [`HitAction::FindAddress`] entry, per expression.
    pub fn address_hits(&self, id: EntryId) -> Result<IndexMap<String, IndexMap<VirtAddr, u64>>> {
        self.inner
            .read()
            .entries
            .get(&id)
            .map(|e| e.address_hits.clone())
            .ok_or_else(|| Error::NotFound(format!("no entry {}", id)))
    }

    /// Reinstall the traps of a disabled entry.
    pub fn enable(&self, backend: &mut dyn DebugControl, id: EntryId) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("no entry {}", id)))?;
        if entry.enabled {
            return Ok(());
        }
        entry.handles = self.install(backend, entry.address, entry.kind, entry.condition.as_deref())?;
        entry.enabled = true;
        Ok(())
    }

    /// Remove the traps of an entry but keep it in the registry.
    pub fn disable(&self, backend: &mut dyn DebugControl, id: EntryId) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("no entry {}", id)))?;
        if entry.enabled {
            remove_traps(backend, &mut entry.handles);
            entry.enabled = false;
        }
        Ok(())
    }

    /// Replace the condition; installed traps are recreated with it.
    pub fn set_condition(
        &self,
        backend: &mut dyn DebugControl,
        id: EntryId,
        condition: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("no entry {}", id)))?;
        if entry.enabled {
            let handles = self.install(backend, entry.address, entry.kind, condition)?;
            let mut old = std::mem::replace(&mut entry.handles, handles);
            remove_traps(backend, &mut old);
        }
        entry.condition = condition.map(str::to_string);
        Ok(())
    }

    pub fn set_disposition(&self, id: EntryId, disposition: Disposition) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("no entry {}", id)))?;
        entry.disposition = disposition;
        Ok(())
    }

    pub fn delete(&self, backend: &mut dyn DebugControl, id: EntryId) -> Result<()> {
        let mut removed = self
            .inner
            .write()
            .entries
            .shift_remove(&id)
            .ok_or_else(|| Error::NotFound(format!("no entry {}", id)))?;
        remove_traps(backend, &mut removed.handles);
        info!("entry {} deleted", id);
        Ok(())
    }
}
