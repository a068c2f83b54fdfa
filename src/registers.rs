//! Register groups and register snapshots.
//!
//! Uses a table-driven design: every known x86_64 register name maps to the
//! group it is captured with. Backends produce [`RegisterSnapshot`]s; the
//! tracer restricts them to the groups a trace asked for.

use std::fmt;

use bitflags::bitflags;

use crate::error::{Error, Result};

bitflags! {
    /// Register groups captured per trace step.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegisterGroups: u8 {
        const GENERAL = 0b0001;
        const FLAGS   = 0b0010;
        const SEGMENT = 0b0100;
        const FLOAT   = 0b1000;
    }
}

impl Default for RegisterGroups {
    fn default() -> Self {
        RegisterGroups::GENERAL | RegisterGroups::FLAGS
    }
}

/// Metadata for a single register.
#[derive(Debug, Clone, Copy)]
pub struct RegisterInfo {
    pub name: &'static str,
    pub group: RegisterGroups,
    /// Width in bytes.
    pub size: usize,
}

const fn reg(name: &'static str, group: RegisterGroups, size: usize) -> RegisterInfo {
    RegisterInfo { name, group, size }
}

/// x86_64 register table.
pub const REGISTERS: &[RegisterInfo] = &[
    reg("rax", RegisterGroups::GENERAL, 8),
    reg("rbx", RegisterGroups::GENERAL, 8),
    reg("rcx", RegisterGroups::GENERAL, 8),
    reg("rdx", RegisterGroups::GENERAL, 8),
    reg("rsi", RegisterGroups::GENERAL, 8),
    reg("rdi", RegisterGroups::GENERAL, 8),
    reg("rbp", RegisterGroups::GENERAL, 8),
    reg("rsp", RegisterGroups::GENERAL, 8),
    reg("rip", RegisterGroups::GENERAL, 8),
    reg("r8", RegisterGroups::GENERAL, 8),
    reg("r9", RegisterGroups::GENERAL, 8),
    reg("r10", RegisterGroups::GENERAL, 8),
    reg("r11", RegisterGroups::GENERAL, 8),
    reg("r12", RegisterGroups::GENERAL, 8),
    reg("r13", RegisterGroups::GENERAL, 8),
    reg("r14", RegisterGroups::GENERAL, 8),
    reg("r15", RegisterGroups::GENERAL, 8),
    reg("rflags", RegisterGroups::FLAGS, 8),
    reg("cs", RegisterGroups::SEGMENT, 2),
    reg("ss", RegisterGroups::SEGMENT, 2),
    reg("ds", RegisterGroups::SEGMENT, 2),
    reg("es", RegisterGroups::SEGMENT, 2),
    reg("fs", RegisterGroups::SEGMENT, 2),
    reg("gs", RegisterGroups::SEGMENT, 2),
    reg("st0", RegisterGroups::FLOAT, 10),
    reg("st1", RegisterGroups::FLOAT, 10),
    reg("st2", RegisterGroups::FLOAT, 10),
    reg("st3", RegisterGroups::FLOAT, 10),
    reg("st4", RegisterGroups::FLOAT, 10),
    reg("st5", RegisterGroups::FLOAT, 10),
    reg("st6", RegisterGroups::FLOAT, 10),
    reg("st7", RegisterGroups::FLOAT, 10),
    reg("xmm0", RegisterGroups::FLOAT, 16),
    reg("xmm1", RegisterGroups::FLOAT, 16),
    reg("xmm2", RegisterGroups::FLOAT, 16),
    reg("xmm3", RegisterGroups::FLOAT, 16),
    reg("xmm4", RegisterGroups::FLOAT, 16),
    reg("xmm5", RegisterGroups::FLOAT, 16),
    reg("xmm6", RegisterGroups::FLOAT, 16),
    reg("xmm7", RegisterGroups::FLOAT, 16),
];

/// Look up a register in the table.
pub fn register_info(name: &str) -> Option<&'static RegisterInfo> {
    REGISTERS.iter().find(|r| r.name == name)
}

/// Names of all registers in the given groups, in table order.
pub fn register_names(groups: RegisterGroups) -> impl Iterator<Item = &'static str> {
    REGISTERS
        .iter()
        .filter(move |r| groups.intersects(r.group))
        .map(|r| r.name)
}

/// Value of one register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterValue {
    /// Registers that fit in 64 bits.
    Word(u64),
    /// x87 and SSE registers, raw little-endian bytes.
    Wide(Vec<u8>),
}

/// One captured register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterEntry {
    pub name: String,
    pub group: RegisterGroups,
    pub value: RegisterValue,
}

/// Register values captured at one point of execution, in capture order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    entries: Vec<RegisterEntry>,
}

impl RegisterSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a register. The group comes from the register table; names not
    /// in the table are filed under `GENERAL`.
    pub fn push(&mut self, name: &str, value: RegisterValue) {
        let group = register_info(name)
            .map(|r| r.group)
            .unwrap_or(RegisterGroups::GENERAL);
        self.entries.push(RegisterEntry {
            name: name.to_string(),
            group,
            value,
        });
    }

    pub fn push_word(&mut self, name: &str, value: u64) {
        self.push(name, RegisterValue::Word(value));
    }

    pub fn get(&self, name: &str) -> Option<&RegisterValue> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.value)
    }

    pub fn word(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            RegisterValue::Word(v) => Some(*v),
            RegisterValue::Wide(_) => None,
        }
    }

    /// Groups that have at least one register in the snapshot.
    pub fn groups(&self) -> RegisterGroups {
        self.entries
            .iter()
            .fold(RegisterGroups::empty(), |acc, e| acc | e.group)
    }

    /// Drop every register outside `groups`.
    pub fn restricted_to(mut self, groups: RegisterGroups) -> Self {
        self.entries.retain(|e| groups.intersects(e.group));
        self
    }

    pub fn entries(&self) -> &[RegisterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Register(&'static str),
    Constant(u64),
}

/// Sum of registers and constants, such as `$rax`, `$rcx+5` or
/// `$rbp+$r12-0x10`. Register names carry a `$` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterExpression {
    text: String,
    terms: Vec<(bool, Term)>,
}

impl RegisterExpression {
    pub fn parse(text: &str) -> Result<Self> {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(Error::InvalidInput("empty register expression".into()));
        }
        let mut terms = Vec::new();
        let mut negative = false;
        let mut rest = compact.as_str();
        loop {
            let end = rest.find(['+', '-']).unwrap_or(rest.len());
            let token = &rest[..end];
            let term = match token.strip_prefix('$') {
                Some(name) => Term::Register(
                    register_info(name)
                        .map(|r| r.name)
                        .ok_or_else(|| Error::InvalidInput(format!("unknown register '{}'", name)))?,
                ),
                None => Term::Constant(parse_constant(token).ok_or_else(|| {
                    Error::InvalidInput(format!("invalid term '{}' in '{}'", token, text))
                })?),
            };
            terms.push((negative, term));
            if end == rest.len() {
                break;
            }
            negative = rest[end..].starts_with('-');
            rest = &rest[end + 1..];
        }
        Ok(RegisterExpression {
            text: compact,
            terms,
        })
    }

    /// Parse a comma separated list; empty items are ignored.
    pub fn parse_list(text: &str) -> Result<Vec<Self>> {
        text.split(',')
            .filter(|item| !item.trim().is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Evaluate with wrapping arithmetic; `None` when a register is missing
    /// from the snapshot or does not fit in 64 bits.
    pub fn evaluate(&self, registers: &RegisterSnapshot) -> Option<u64> {
        self.terms.iter().try_fold(0u64, |acc, (negative, term)| {
            let value = match term {
                Term::Register(name) => registers.word(name)?,
                Term::Constant(c) => *c,
            };
            Some(if *negative {
                acc.wrapping_sub(value)
            } else {
                acc.wrapping_add(value)
            })
        })
    }
}

impl fmt::Display for RegisterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn parse_constant(token: &str) -> Option<u64> {
    match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => token.parse().ok(),
    }
}
