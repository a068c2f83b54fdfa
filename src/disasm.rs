//! x86_64 disassembly using iced-x86.
//!
//! [`IcedDisassembler`] implements the [`Disassembler`] capability: it
//! decodes one instruction at a time and classifies its control flow and
//! statically known memory reference for the dissector and the tracer.

use iced_x86::{
    Decoder, DecoderOptions, FlowControl, Formatter, FormatterOutput, FormatterTextKind,
    GasFormatter, Instruction, IntelFormatter, OpKind, Register,
};

use crate::backend::{AddressSpace, DecodedInstruction, Disassembler, FlowKind};
use crate::error::{Error, Result};
use crate::types::VirtAddr;

/// Disassembly output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisasmStyle {
    /// Intel syntax (e.g., `mov rax, [rbx+8]`)
    #[default]
    Intel,
    /// AT&T / GAS syntax (e.g., `movq 8(%rbx), %rax`)
    Gas,
}

/// Decoder for x86 code.
#[derive(Debug, Clone, Copy)]
pub struct IcedDisassembler {
    bitness: u32,
    style: DisasmStyle,
}

impl Default for IcedDisassembler {
    fn default() -> Self {
        Self {
            bitness: 64,
            style: DisasmStyle::Intel,
        }
    }
}

impl IcedDisassembler {
    pub fn new(style: DisasmStyle) -> Self {
        Self {
            style,
            ..Self::default()
        }
    }

    /// Decode 32-bit code instead of 64-bit.
    pub fn with_bitness(mut self, bitness: u32) -> Result<Self> {
        if !matches!(bitness, 16 | 32 | 64) {
            return Err(Error::InvalidInput(format!("unsupported bitness {}", bitness)));
        }
        self.bitness = bitness;
        Ok(self)
    }

    pub fn style(&self) -> DisasmStyle {
        self.style
    }

    /// Decode up to `count` instructions from `code`, stopping at the
    /// first invalid one.
    pub fn disassemble(&self, code: &[u8], base: VirtAddr, count: usize) -> Vec<DecodedInstruction> {
        let mut out = Vec::new();
        let mut off = 0;
        while off < code.len() && out.len() < count {
            match self.decode_instruction(&code[off..], base + off as u64) {
                Ok(insn) => {
                    off += insn.length;
                    out.push(insn);
                }
                Err(_) => break,
            }
        }
        out
    }

    fn render(&self, insn: &Instruction) -> (String, String) {
        let mut mnemonic = FormatterOutputBuffer::default();
        let mut operands = FormatterOutputBuffer::default();
        match self.style {
            DisasmStyle::Intel => {
                let mut formatter = IntelFormatter::new();
                formatter.options_mut().set_hex_prefix("0x");
                formatter.options_mut().set_hex_suffix("");
                formatter.options_mut().set_uppercase_hex(false);
                formatter.options_mut().set_space_after_operand_separator(true);
                formatter.format_mnemonic(insn, &mut mnemonic);
                formatter.format_all_operands(insn, &mut operands);
            }
            DisasmStyle::Gas => {
                let mut formatter = GasFormatter::new();
                formatter.options_mut().set_uppercase_hex(false);
                formatter.options_mut().set_space_after_operand_separator(true);
                formatter.format_mnemonic(insn, &mut mnemonic);
                formatter.format_all_operands(insn, &mut operands);
            }
        }
        (mnemonic.text, operands.text)
    }
}

impl Disassembler for IcedDisassembler {
    fn decode_instruction(&self, bytes: &[u8], addr: VirtAddr) -> Result<DecodedInstruction> {
        if bytes.is_empty() {
            return Err(Error::Decode {
                addr,
                reason: "no bytes".into(),
            });
        }
        let mut decoder = Decoder::with_ip(self.bitness, bytes, addr.addr(), DecoderOptions::NONE);
        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(Error::Decode {
                addr,
                reason: format!("{:?}", decoder.last_error()),
            });
        }

        let flow = flow_kind(&insn);
        let target = match flow {
            FlowKind::Call | FlowKind::Jump | FlowKind::ConditionalJump => {
                Some(VirtAddr(insn.near_branch_target()))
            }
            _ => None,
        };
        let (mnemonic, operands) = self.render(&insn);

        Ok(DecodedInstruction {
            address: addr,
            length: insn.len(),
            mnemonic,
            operands,
            flow,
            target,
            memory_reference: memory_reference(&insn, flow),
        })
    }
}

fn flow_kind(insn: &Instruction) -> FlowKind {
    match insn.flow_control() {
        FlowControl::Call => FlowKind::Call,
        FlowControl::IndirectCall => FlowKind::IndirectCall,
        FlowControl::UnconditionalBranch => FlowKind::Jump,
        FlowControl::ConditionalBranch => FlowKind::ConditionalJump,
        FlowControl::IndirectBranch => FlowKind::IndirectJump,
        FlowControl::Return => FlowKind::Return,
        FlowControl::Interrupt => FlowKind::Interrupt,
        _ => FlowKind::Sequential,
    }
}

/// Statically known address referenced by an operand: a RIP-relative or
/// absolute memory operand, or a 32/64-bit immediate.
fn memory_reference(insn: &Instruction, flow: FlowKind) -> Option<VirtAddr> {
    for i in 0..insn.op_count() {
        match insn.op_kind(i) {
            OpKind::Memory if insn.is_ip_rel_memory_operand() => {
                return Some(VirtAddr(insn.ip_rel_memory_address()));
            }
            OpKind::Memory
                if insn.memory_base() == Register::None
                    && insn.memory_index() == Register::None =>
            {
                return Some(VirtAddr(insn.memory_displacement64()));
            }
            OpKind::Immediate32 | OpKind::Immediate64 | OpKind::Immediate32to64
                if !flow.is_call() && !flow.is_jump() =>
            {
                let value = insn.immediate(i);
                if value != 0 {
                    return Some(VirtAddr(value));
                }
            }
            _ => {}
        }
    }
    None
}

/// Bytes searched backwards for an instruction ending at a given address.
const LOOKBEHIND: u64 = 30;

/// The instruction that ends exactly at `pc`, found by decoding forward from
/// up to 30 bytes before it. A watchpoint stops after the accessing
/// instruction; this recovers the access site.
pub fn previous_instruction<R: AddressSpace + ?Sized>(
    reader: &R,
    disassembler: &dyn Disassembler,
    pc: VirtAddr,
) -> Option<DecodedInstruction> {
    let back = LOOKBEHIND.min(pc.addr());
    let (start, bytes) = (1..=back).rev().find_map(|n| {
        let start = pc.addr() - n;
        reader
            .read_memory(VirtAddr(start), n as usize)
            .ok()
            .map(|bytes| (start, bytes))
    })?;
    (0..bytes.len()).find_map(|skip| {
        let mut offset = skip;
        let mut last = None;
        while offset < bytes.len() {
            let insn = disassembler
                .decode_instruction(&bytes[offset..], VirtAddr(start + offset as u64))
                .ok()?;
            offset += insn.length.max(1);
            last = Some(insn);
        }
        last.filter(|_| offset == bytes.len())
    })
}

/// Format instructions with their raw bytes, one per line.
pub fn format_disassembly(instructions: &[(DecodedInstruction, Vec<u8>)]) -> String {
    let mut out = String::new();
    for (insn, bytes) in instructions {
        out.push_str(&format!("  {:016x}  ", insn.address.addr()));

        let mut bytes_str = String::new();
        for b in bytes {
            bytes_str.push_str(&format!("{:02x} ", b));
        }
        out.push_str(&format!("{:<30} ", bytes_str.trim_end()));

        out.push_str(&insn.text());
        out.push('\n');
    }
    out
}

/// Collects iced-x86 formatter output.
#[derive(Default)]
struct FormatterOutputBuffer {
    text: String,
}

impl FormatterOutput for FormatterOutputBuffer {
    fn write(&mut self, text: &str, _kind: FormatterTextKind) {
        self.text.push_str(text);
    }
}
