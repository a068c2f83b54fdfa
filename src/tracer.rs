//! Instruction tracing.
//!
//! [`InstructionTracer`] waits for the target to reach a start address (and
//! an optional trigger condition), then steps it one instruction at a time,
//! recording the decoded instruction and the requested registers after
//! every step.

use log::{debug, info, warn};

use crate::backend::{DebugControl, DecodedInstruction, Disassembler, FlowKind};
use crate::error::{Error, Result};
use crate::registers::{RegisterGroups, RegisterSnapshot};
use crate::types::{CancelToken, ProcessState, StopEvent, TrapHandle, VirtAddr};

/// How calls are treated while stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    /// Follow execution into called functions.
    #[default]
    SingleStep,
    /// Run called functions to their return address in one step.
    StepOver,
}

/// Parameters of one trace.
#[derive(Debug, Clone)]
pub struct TraceRequest {
    pub start: VirtAddr,
    pub max_steps: usize,
    pub step_mode: StepMode,
    /// Evaluated when the start address is reached; tracing begins once true.
    pub trigger_condition: Option<String>,
    /// Evaluated after every step; tracing ends once true.
    pub stop_condition: Option<String>,
    pub register_groups: RegisterGroups,
    /// Leave the target stopped when the trace ends.
    pub stop_on_finish: bool,
}

impl TraceRequest {
    pub fn new(start: VirtAddr, max_steps: usize) -> Self {
        TraceRequest {
            start,
            max_steps,
            step_mode: StepMode::SingleStep,
            trigger_condition: None,
            stop_condition: None,
            register_groups: RegisterGroups::default(),
            stop_on_finish: true,
        }
    }

    pub fn step_mode(mut self, mode: StepMode) -> Self {
        self.step_mode = mode;
        self
    }

    pub fn trigger(mut self, condition: impl Into<String>) -> Self {
        self.trigger_condition = Some(condition.into());
        self
    }

    pub fn stop_when(mut self, condition: impl Into<String>) -> Self {
        self.stop_condition = Some(condition.into());
        self
    }

    pub fn registers(mut self, groups: RegisterGroups) -> Self {
        self.register_groups = groups;
        self
    }

    pub fn stop_on_finish(mut self, stop: bool) -> Self {
        self.stop_on_finish = stop;
        self
    }
}

/// One traced instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub index: usize,
    pub address: VirtAddr,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
    /// Call depth relative to the start of the trace.
    pub depth: usize,
    /// Registers after the step; `None` when no groups were requested.
    pub registers: Option<RegisterSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    Completed,
    StopConditionMet,
    Canceled,
    TargetTerminated,
    /// A call could not be stepped over because the backend refused the
    /// breakpoint at its return address. The callee was not entered.
    StepOverRefused,
}

#[derive(Debug, Clone)]
pub struct TraceOutcome {
    pub records: Vec<TraceRecord>,
    pub status: TraceStatus,
}

/// Progress report delivered after every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceProgress {
    pub steps: usize,
    pub max_steps: usize,
    pub address: VirtAddr,
}

enum Trigger {
    Reached,
    Canceled,
    Terminated,
}

/// Drives a target through a trace.
#[derive(Debug, Default)]
pub struct InstructionTracer {
    last: Vec<TraceRecord>,
}

impl InstructionTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records of the most recent trace.
    pub fn records(&self) -> &[TraceRecord] {
        &self.last
    }

    pub fn trace(
        &mut self,
        backend: &mut dyn DebugControl,
        disassembler: &dyn Disassembler,
        request: &TraceRequest,
        cancel: &CancelToken,
        mut progress: impl FnMut(&TraceProgress),
    ) -> Result<TraceOutcome> {
        if request.max_steps == 0 {
            return Err(Error::InvalidInput("trace needs at least one step".into()));
        }
        match backend.state() {
            ProcessState::Exited | ProcessState::Terminated => {
                return Ok(self.finish(backend, request, Vec::new(), TraceStatus::TargetTerminated));
            }
            ProcessState::Running => {
                return Err(Error::InvalidState("target must be stopped to trace".into()));
            }
            ProcessState::Stopped => {}
        }

        match self.wait_for_trigger(backend, request, cancel)? {
            Trigger::Reached => {}
            Trigger::Canceled => {
                return Ok(self.finish(backend, request, Vec::new(), TraceStatus::Canceled));
            }
            Trigger::Terminated => {
                return Ok(self.finish(backend, request, Vec::new(), TraceStatus::TargetTerminated));
            }
        }
        info!("trace started at {}", request.start);

        let mut records = Vec::new();
        let mut depth = 0usize;
        let mut status = TraceStatus::Completed;

        for index in 0..request.max_steps {
            if cancel.is_canceled() {
                status = TraceStatus::Canceled;
                break;
            }
            let pc = match backend.program_counter() {
                Ok(pc) => pc,
                Err(Error::TargetTerminated) => {
                    status = TraceStatus::TargetTerminated;
                    break;
                }
                Err(e) => return Err(e),
            };
            let (insn, bytes) = decode_at(backend, disassembler, pc);

            let event = match request.step_mode {
                StepMode::StepOver if insn.flow.is_call() => {
                    match step_over(backend, insn.next_address()) {
                        Ok(Some(event)) => Ok(event),
                        Ok(None) => {
                            status = TraceStatus::StepOverRefused;
                            break;
                        }
                        Err(e) => Err(e),
                    }
                }
                _ => backend.single_step(),
            };
            match event {
                Ok(event) if event.is_terminal() => {
                    status = TraceStatus::TargetTerminated;
                    break;
                }
                Ok(_) => {}
                Err(Error::TargetTerminated) => {
                    status = TraceStatus::TargetTerminated;
                    break;
                }
                Err(e) => return Err(e),
            }

            let registers = if request.register_groups.is_empty() {
                None
            } else {
                match backend.read_registers(request.register_groups) {
                    Ok(snapshot) => Some(snapshot.restricted_to(request.register_groups)),
                    Err(Error::TargetTerminated) => {
                        status = TraceStatus::TargetTerminated;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            };

            records.push(TraceRecord {
                index,
                address: pc,
                bytes,
                mnemonic: insn.mnemonic.clone(),
                operands: insn.operands.clone(),
                depth,
                registers,
            });
            match insn.flow {
                FlowKind::Call | FlowKind::IndirectCall
                    if request.step_mode == StepMode::SingleStep =>
                {
                    depth += 1
                }
                FlowKind::Return => depth = depth.saturating_sub(1),
                _ => {}
            }
            progress(&TraceProgress {
                steps: records.len(),
                max_steps: request.max_steps,
                address: pc,
            });

            if let Some(expr) = request.stop_condition.as_deref() {
                match backend.evaluate_condition(expr) {
                    Ok(true) => {
                        status = TraceStatus::StopConditionMet;
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("stop condition '{}' failed: {}", expr, e),
                }
            }
        }

        info!("trace finished: {} steps, {:?}", records.len(), status);
        Ok(self.finish(backend, request, records, status))
    }

    fn finish(
        &mut self,
        backend: &mut dyn DebugControl,
        request: &TraceRequest,
        records: Vec<TraceRecord>,
        status: TraceStatus,
    ) -> TraceOutcome {
        if !request.stop_on_finish && status != TraceStatus::TargetTerminated {
            if let Err(e) = backend.resume() {
                warn!("failed to resume target after trace: {}", e);
            }
        }
        self.last = records.clone();
        TraceOutcome { records, status }
    }

    fn wait_for_trigger(
        &self,
        backend: &mut dyn DebugControl,
        request: &TraceRequest,
        cancel: &CancelToken,
    ) -> Result<Trigger> {
        let pc = match backend.program_counter() {
            Ok(pc) => pc,
            Err(Error::TargetTerminated) => return Ok(Trigger::Terminated),
            Err(e) => return Err(e),
        };
        if pc == request.start {
            match request.trigger_condition.as_deref() {
                None => return Ok(Trigger::Reached),
                Some(expr) if condition_holds(backend, expr) => return Ok(Trigger::Reached),
                Some(_) => {}
            }
        }

        let handle = match backend.set_breakpoint(request.start, None) {
            Ok(handle) => handle,
            Err(Error::TargetTerminated) => return Ok(Trigger::Terminated),
            Err(e) => return Err(e),
        };
        let result = self.run_to(backend, handle, request, cancel);
        if !matches!(result, Ok(Trigger::Terminated)) {
            if let Err(e) = backend.remove_trap(handle) {
                warn!("failed to remove start breakpoint {}: {}", handle, e);
            }
        }
        result
    }

    fn run_to(
        &self,
        backend: &mut dyn DebugControl,
        handle: TrapHandle,
        request: &TraceRequest,
        cancel: &CancelToken,
    ) -> Result<Trigger> {
        loop {
            if cancel.is_canceled() {
                return Ok(Trigger::Canceled);
            }
            let event = match backend.resume().and_then(|_| backend.wait_for_stop()) {
                Ok(event) => event,
                Err(Error::TargetTerminated) => return Ok(Trigger::Terminated),
                Err(e) => return Err(e),
            };
            if event.is_terminal() {
                return Ok(Trigger::Terminated);
            }
            if event.handle != Some(handle) {
                debug!("ignoring stop {:?} while waiting for {}", event.reason, request.start);
                continue;
            }
            match request.trigger_condition.as_deref() {
                None => return Ok(Trigger::Reached),
                Some(expr) if condition_holds(backend, expr) => return Ok(Trigger::Reached),
                Some(_) => {}
            }
        }
    }
}

fn condition_holds(backend: &mut dyn DebugControl, expr: &str) -> bool {
    match backend.evaluate_condition(expr) {
        Ok(value) => value,
        Err(e) => {
            warn!("trigger condition '{}' failed: {}", expr, e);
            false
        }
    }
}

/// Decode the instruction at `pc`. Undecodable bytes still yield a record
/// so the trace can step past them.
fn decode_at(
    backend: &mut dyn DebugControl,
    disassembler: &dyn Disassembler,
    pc: VirtAddr,
) -> (DecodedInstruction, Vec<u8>) {
    let max = disassembler.max_instruction_len().max(1);
    let bytes = (1..=max)
        .rev()
        .find_map(|len| backend.read_memory(pc, len).ok())
        .unwrap_or_default();
    match disassembler.decode_instruction(&bytes, pc) {
        Ok(insn) => {
            let len = insn.length.min(bytes.len());
            (insn, bytes[..len].to_vec())
        }
        Err(e) => {
            debug!("{}", e);
            let raw = bytes.first().map(|b| vec![*b]).unwrap_or_default();
            let insn = DecodedInstruction {
                address: pc,
                length: raw.len(),
                mnemonic: "(bad)".into(),
                operands: String::new(),
                flow: FlowKind::Sequential,
                target: None,
                memory_reference: None,
            };
            (insn, raw)
        }
    }
}

/// Run a call to its return address. `None` when the backend refuses the
/// return breakpoint; the target has not moved in that case.
fn step_over(backend: &mut dyn DebugControl, return_addr: VirtAddr) -> Result<Option<StopEvent>> {
    let handle = match backend.set_breakpoint(return_addr, None) {
        Ok(handle) => handle,
        Err(e) if e.is_backend_failure() => {
            warn!("cannot step over call, return breakpoint at {} refused: {}", return_addr, e);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    let result = run_until_hit(backend, handle);
    let terminated = match &result {
        Ok(event) => event.is_terminal(),
        Err(e) => matches!(e, Error::TargetTerminated),
    };
    if !terminated {
        if let Err(e) = backend.remove_trap(handle) {
            warn!("failed to remove step-over breakpoint {}: {}", handle, e);
        }
    }
    result.map(Some)
}

fn run_until_hit(backend: &mut dyn DebugControl, handle: TrapHandle) -> Result<StopEvent> {
    backend.resume()?;
    loop {
        let event = backend.wait_for_stop()?;
        if event.is_terminal() || event.handle == Some(handle) {
            return Ok(event);
        }
        backend.resume()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::IcedDisassembler;
    use crate::testing::{Condition, ScriptedTarget, CODE_BASE};

    /// 0x1000 nop; 0x1001 call 0x1010; 0x1006 nop; ... 0x1010 nop; 0x1011 ret
    fn call_program() -> ScriptedTarget {
        let mut code = vec![0x90; 0x20];
        code[1..6].copy_from_slice(&[0xe8, 0x0a, 0x00, 0x00, 0x00]);
        code[0x11] = 0xc3;
        ScriptedTarget::with_code(&code)
    }

    fn run(target: &mut ScriptedTarget, request: &TraceRequest) -> TraceOutcome {
        InstructionTracer::new()
            .trace(target, &IcedDisassembler::default(), request, &CancelToken::new(), |_| {})
            .unwrap()
    }

    fn addresses(outcome: &TraceOutcome) -> Vec<u64> {
        outcome.records.iter().map(|r| r.address.addr()).collect()
    }

    #[test]
    fn single_step_follows_calls() {
        let mut target = call_program();
        let outcome = run(&mut target, &TraceRequest::new(VirtAddr(CODE_BASE), 6));
        assert_eq!(outcome.status, TraceStatus::Completed);
        assert_eq!(addresses(&outcome), vec![0x1000, 0x1001, 0x1010, 0x1011, 0x1006, 0x1007]);
        let depths: Vec<usize> = outcome.records.iter().map(|r| r.depth).collect();
        assert_eq!(depths, vec![0, 0, 1, 1, 0, 0]);
        assert_eq!(outcome.records[1].mnemonic, "call");
        assert_eq!(outcome.records[1].bytes, vec![0xe8, 0x0a, 0x00, 0x00, 0x00]);
        assert_eq!(outcome.records[3].index, 3);
    }

    #[test]
    fn step_over_skips_callee() {
        let mut target = call_program();
        let request = TraceRequest::new(VirtAddr(CODE_BASE), 4).step_mode(StepMode::StepOver);
        let outcome = run(&mut target, &request);
        assert_eq!(addresses(&outcome), vec![0x1000, 0x1001, 0x1006, 0x1007]);
        assert!(outcome.records.iter().all(|r| r.depth == 0));
        assert_eq!(target.trap_count(), 0);
    }

    #[test]
    fn runs_to_start_address() {
        let mut target = call_program();
        let outcome = run(&mut target, &TraceRequest::new(VirtAddr(0x1006), 2));
        assert_eq!(addresses(&outcome), vec![0x1006, 0x1007]);
        assert_eq!(target.trap_count(), 0);
    }

    #[test]
    fn trigger_condition_waits_for_later_hit() {
        // Loop back from 0x1006 to 0x1000.
        let mut code = vec![0x90; 0x20];
        code[1..6].copy_from_slice(&[0xe8, 0x0a, 0x00, 0x00, 0x00]);
        code[6..8].copy_from_slice(&[0xeb, 0xf8]);
        code[0x11] = 0xc3;
        let mut target = ScriptedTarget::with_code(&code);
        target.set_condition("second pass", Condition::TrueFromEval(2));

        let request = TraceRequest::new(VirtAddr(0x1010), 1).trigger("second pass");
        let outcome = run(&mut target, &request);
        assert_eq!(addresses(&outcome), vec![0x1010]);
        assert_eq!(target.resumes, 2);
    }

    #[test]
    fn failing_trigger_counts_as_not_met() {
        let mut target = ScriptedTarget::nops();
        target.set_condition("broken", Condition::Fails);
        let request = TraceRequest::new(VirtAddr(0x1100), 3).trigger("broken");
        let outcome = run(&mut target, &request);
        assert_eq!(outcome.status, TraceStatus::TargetTerminated);
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn exit_before_start_yields_nothing() {
        let mut target = ScriptedTarget::nops();
        let outcome = run(&mut target, &TraceRequest::new(VirtAddr(0x3000), 5).stop_on_finish(false));
        assert_eq!(outcome.status, TraceStatus::TargetTerminated);
        assert!(outcome.records.is_empty());
        assert_eq!(target.state(), ProcessState::Exited);
    }

    #[test]
    fn exit_mid_trace_keeps_earlier_records() {
        // nop; ret with an empty stack exits.
        let mut target = ScriptedTarget::with_code(&[0x90, 0xc3]);
        let outcome = run(&mut target, &TraceRequest::new(VirtAddr(CODE_BASE), 10));
        assert_eq!(outcome.status, TraceStatus::TargetTerminated);
        assert_eq!(addresses(&outcome), vec![0x1000]);
    }

    #[test]
    fn death_while_reading_registers_keeps_records() {
        let mut target = ScriptedTarget::nops();
        target.die_after_register_reads(3);
        let request = TraceRequest::new(VirtAddr(CODE_BASE), 10).registers(RegisterGroups::GENERAL);
        let outcome = run(&mut target, &request);
        assert_eq!(outcome.status, TraceStatus::TargetTerminated);
        assert_eq!(addresses(&outcome), vec![0x1000, 0x1001, 0x1002]);
        assert!(outcome.records.iter().all(|r| r.registers.is_some()));
    }

    #[test]
    fn refused_step_over_does_not_enter_callee() {
        let mut target = call_program();
        target.refuse(VirtAddr(0x1006));
        let request = TraceRequest::new(VirtAddr(CODE_BASE), 4).step_mode(StepMode::StepOver);
        let outcome = run(&mut target, &request);
        assert_eq!(outcome.status, TraceStatus::StepOverRefused);
        assert_eq!(addresses(&outcome), vec![0x1000]);
        assert_eq!(target.pc(), VirtAddr(0x1001));
        assert_eq!(target.trap_count(), 0);
    }

    #[test]
    fn failed_step_over_removes_return_breakpoint() {
        let mut target = call_program();
        target.fail_next_wait();
        let request = TraceRequest::new(VirtAddr(CODE_BASE), 4).step_mode(StepMode::StepOver);
        let result = InstructionTracer::new().trace(
            &mut target,
            &IcedDisassembler::default(),
            &request,
            &CancelToken::new(),
            |_| {},
        );
        assert!(matches!(result, Err(Error::InvalidState(_))));
        assert_eq!(target.trap_count(), 0);
    }

    #[test]
    fn stop_condition_and_resume() {
        let mut target = ScriptedTarget::nops();
        target.set_condition("done", Condition::TrueFromEval(4));
        let request = TraceRequest::new(VirtAddr(CODE_BASE), 10)
            .stop_when("done")
            .stop_on_finish(false);
        let outcome = run(&mut target, &request);
        assert_eq!(outcome.status, TraceStatus::StopConditionMet);
        assert_eq!(outcome.records.len(), 4);
        assert_eq!(target.state(), ProcessState::Running);
    }

    #[test]
    fn length_is_bounded_by_max_steps() {
        let mut target = ScriptedTarget::nops();
        let outcome = run(&mut target, &TraceRequest::new(VirtAddr(CODE_BASE), 5));
        assert_eq!(outcome.status, TraceStatus::Completed);
        assert_eq!(outcome.records.len(), 5);
        assert_eq!(target.pc(), VirtAddr(0x1005));
        assert_eq!(target.state(), ProcessState::Stopped);
    }

    #[test]
    fn cancel_between_steps() {
        let mut target = ScriptedTarget::nops();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mut tracer = InstructionTracer::new();
        let outcome = tracer
            .trace(
                &mut target,
                &IcedDisassembler::default(),
                &TraceRequest::new(VirtAddr(CODE_BASE), 100),
                &cancel,
                |p| {
                    if p.steps == 3 {
                        trigger.cancel();
                    }
                },
            )
            .unwrap();
        assert_eq!(outcome.status, TraceStatus::Canceled);
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(tracer.records().len(), 3);
    }

    #[test]
    fn register_groups_are_respected() {
        let mut target = ScriptedTarget::nops();
        let request = TraceRequest::new(VirtAddr(CODE_BASE), 1).registers(RegisterGroups::GENERAL);
        let outcome = run(&mut target, &request);
        let regs = outcome.records[0].registers.as_ref().unwrap();
        assert_eq!(regs.word("rip"), Some(0x1001));
        assert!(regs.get("rflags").is_none());

        let mut target = ScriptedTarget::nops();
        let request = TraceRequest::new(VirtAddr(CODE_BASE), 1).registers(RegisterGroups::empty());
        assert!(run(&mut target, &request).records[0].registers.is_none());
    }

    #[test]
    fn zero_steps_rejected() {
        let mut target = ScriptedTarget::nops();
        let result = InstructionTracer::new().trace(
            &mut target,
            &IcedDisassembler::default(),
            &TraceRequest::new(VirtAddr(CODE_BASE), 0),
            &CancelToken::new(),
            |_| {},
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
