//! Static code dissection.
//!
//! [`CodeDissector`] linearly decodes executable regions and records, for
//! every statically known call target, jump target and referenced data
//! address, which instructions refer to it.

use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use regex::{Regex, RegexBuilder};

use crate::backend::{AddressSpace, DecodedInstruction, Disassembler};
use crate::error::{Error, Result};
use crate::memscan::SkippedRange;
use crate::procfs::{find_region_containing, Region};
use crate::types::{CancelToken, VirtAddr};

/// Dissection tuning.
#[derive(Debug, Clone)]
pub struct DissectOptions {
    /// Bytes read per backend request.
    pub buffer_size: usize,
    /// Only record data references that point at a non-empty UTF-8 string.
    pub discard_invalid_strings: bool,
    /// Bytes read when checking a string reference.
    pub string_probe_len: usize,
}

impl Default for DissectOptions {
    fn default() -> Self {
        DissectOptions {
            buffer_size: 0x10000,
            discard_invalid_strings: false,
            string_probe_len: 32,
        }
    }
}

/// What a cross-reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    String,
    Jump,
    Call,
}

/// A target address together with every instruction referring to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossReference {
    pub target: VirtAddr,
    pub kind: RefKind,
    /// Referring instruction addresses with their mnemonic, in discovery
    /// order.
    pub referrers: IndexMap<VirtAddr, String>,
}

impl CrossReference {
    pub fn referrer_count(&self) -> usize {
        self.referrers.len()
    }
}

/// Cross-references grouped by kind, keyed by target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrossReferenceIndex {
    strings: IndexMap<VirtAddr, CrossReference>,
    jumps: IndexMap<VirtAddr, CrossReference>,
    calls: IndexMap<VirtAddr, CrossReference>,
}

/// Options for [`CrossReferenceIndex::search_strings`].
#[derive(Debug, Clone)]
pub struct StringSearch {
    pub case_sensitive: bool,
    /// Treat the query as a regular expression instead of a substring.
    pub regex: bool,
    /// Longest string read per target.
    pub max_len: usize,
}

impl Default for StringSearch {
    fn default() -> Self {
        StringSearch {
            case_sensitive: false,
            regex: false,
            max_len: 256,
        }
    }
}

/// A referenced string that matched a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringMatch {
    pub target: VirtAddr,
    pub referrer_count: usize,
    pub text: String,
}

/// A call target that matched a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMatch {
    pub target: VirtAddr,
    pub referrer_count: usize,
    pub label: String,
}

impl CrossReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: RefKind) -> &IndexMap<VirtAddr, CrossReference> {
        match kind {
            RefKind::String => &self.strings,
            RefKind::Jump => &self.jumps,
            RefKind::Call => &self.calls,
        }
    }

    /// Record that the instruction `mnemonic` at `referrer` refers to `target`.
    pub fn add(&mut self, kind: RefKind, target: VirtAddr, referrer: VirtAddr, mnemonic: &str) {
        let map = match kind {
            RefKind::String => &mut self.strings,
            RefKind::Jump => &mut self.jumps,
            RefKind::Call => &mut self.calls,
        };
        map.entry(target)
            .or_insert_with(|| CrossReference {
                target,
                kind,
                referrers: IndexMap::new(),
            })
            .referrers
            .entry(referrer)
            .or_insert_with(|| mnemonic.to_string());
    }

    pub fn get(&self, kind: RefKind, target: VirtAddr) -> Option<&CrossReference> {
        self.map(kind).get(&target)
    }

    pub fn strings(&self) -> impl Iterator<Item = &CrossReference> {
        self.strings.values()
    }

    pub fn jumps(&self) -> impl Iterator<Item = &CrossReference> {
        self.jumps.values()
    }

    pub fn calls(&self) -> impl Iterator<Item = &CrossReference> {
        self.calls.values()
    }

    /// Number of distinct targets per kind: (strings, jumps, calls).
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.strings.len(), self.jumps.len(), self.calls.len())
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.jumps.is_empty() && self.calls.is_empty()
    }

    /// Read every referenced string and return those matching `query`.
    ///
    /// Targets that can no longer be read are skipped.
    pub fn search_strings(
        &self,
        reader: &dyn AddressSpace,
        query: &str,
        search: &StringSearch,
    ) -> Result<Vec<StringMatch>> {
        let matcher = Matcher::new(query, search)?;
        let regions = reader.list_regions()?;

        let mut matches = Vec::new();
        for xref in self.strings.values() {
            let Some(text) = read_string(reader, &regions, xref.target, search.max_len) else {
                continue;
            };
            if matcher.is_match(&text) {
                matches.push(StringMatch {
                    target: xref.target,
                    referrer_count: xref.referrer_count(),
                    text,
                });
            }
        }
        Ok(matches)
    }

    /// Return the call targets whose label matches `query`. A target is
    /// labelled by `symbolize` when it knows the address, and by its hex
    /// address (`0x401000`) otherwise.
    pub fn search_calls(
        &self,
        query: &str,
        search: &StringSearch,
        symbolize: impl Fn(VirtAddr) -> Option<String>,
    ) -> Result<Vec<CallMatch>> {
        let matcher = Matcher::new(query, search)?;
        Ok(self
            .calls
            .values()
            .filter_map(|xref| {
                let label = symbolize(xref.target).unwrap_or_else(|| xref.target.to_string());
                matcher.is_match(&label).then(|| CallMatch {
                    target: xref.target,
                    referrer_count: xref.referrer_count(),
                    label,
                })
            })
            .collect())
    }
}

/// Substring or regex query built from [`StringSearch`] options.
enum Matcher {
    Pattern(Regex),
    Exact(String),
    Folded(String),
}

impl Matcher {
    fn new(query: &str, search: &StringSearch) -> Result<Self> {
        Ok(if search.regex {
            Matcher::Pattern(
                RegexBuilder::new(query)
                    .case_insensitive(!search.case_sensitive)
                    .build()?,
            )
        } else if search.case_sensitive {
            Matcher::Exact(query.to_string())
        } else {
            Matcher::Folded(query.to_lowercase())
        })
    }

    fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Pattern(re) => re.is_match(text),
            Matcher::Exact(needle) => text.contains(needle.as_str()),
            Matcher::Folded(needle) => text.to_lowercase().contains(needle.as_str()),
        }
    }
}

/// Read up to `max_len` bytes at `addr`, clamped to its region, and return
/// the text before the first NUL.
fn read_string(
    reader: &dyn AddressSpace,
    regions: &[Region],
    addr: VirtAddr,
    max_len: usize,
) -> Option<String> {
    let region = find_region_containing(regions, addr)?;
    let len = (region.end.addr() - addr.addr()).min(max_len as u64) as usize;
    let bytes = reader.read_memory(addr, len).ok()?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// How a dissection pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DissectStatus {
    Completed,
    Canceled,
    TargetTerminated,
}

/// Result of a dissection pass.
#[derive(Debug, Clone)]
pub struct DissectOutcome {
    pub status: DissectStatus,
    pub index: CrossReferenceIndex,
    pub skipped: Vec<SkippedRange>,
}

/// Progress report delivered after every window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DissectProgress {
    pub region_index: usize,
    pub region_count: usize,
    pub current_range: (VirtAddr, VirtAddr),
    pub strings: usize,
    pub jumps: usize,
    pub calls: usize,
}

type ProgressFn = Box<dyn FnMut(&DissectProgress) + Send>;

/// Builds a [`CrossReferenceIndex`] from executable regions.
pub struct CodeDissector {
    options: DissectOptions,
    last: Option<CrossReferenceIndex>,
    progress: Option<ProgressFn>,
}

/// Readable regions at the time of the pass, sorted for lookup.
struct Snapshot {
    regions: Vec<Region>,
}

impl Snapshot {
    fn region_of(&self, addr: VirtAddr) -> Option<&Region> {
        let pos = self.regions.partition_point(|r| r.end <= addr);
        self.regions.get(pos).filter(|r| r.contains(addr))
    }
}

impl CodeDissector {
    pub fn new(options: DissectOptions) -> Self {
        CodeDissector {
            options,
            last: None,
            progress: None,
        }
    }

    pub fn set_progress_handler(&mut self, handler: impl FnMut(&DissectProgress) + Send + 'static) {
        self.progress = Some(Box::new(handler));
    }

    pub fn options(&self) -> &DissectOptions {
        &self.options
    }

    /// Index built by the most recent completed pass.
    pub fn index(&self) -> Option<&CrossReferenceIndex> {
        self.last.as_ref()
    }

    /// Decode every instruction in `regions` and collect cross-references.
    pub fn dissect(
        &mut self,
        reader: &dyn AddressSpace,
        disassembler: &dyn Disassembler,
        regions: &[Region],
        cancel: &CancelToken,
    ) -> Result<DissectOutcome> {
        if regions.is_empty() {
            return Err(Error::InvalidInput("no regions selected for dissection".into()));
        }
        if let Some(region) = regions.iter().find(|r| !r.perms.execute) {
            return Err(Error::InvalidInput(format!(
                "region {}-{} is not executable",
                region.start, region.end
            )));
        }
        let max_len = disassembler.max_instruction_len().max(1);
        if self.options.buffer_size <= max_len {
            return Err(Error::InvalidInput(format!(
                "buffer size must exceed {} bytes",
                max_len
            )));
        }

        let mut snapshot = Snapshot {
            regions: reader
                .list_regions()?
                .into_iter()
                .filter(|r| r.perms.read)
                .collect(),
        };
        snapshot.regions.sort_by_key(|r| r.start);

        let mut regions = regions.to_vec();
        regions.sort_by_key(|r| r.start);

        let mut index = CrossReferenceIndex::new();
        let mut skipped = Vec::new();
        let mut first_read = true;

        for (region_index, region) in regions.iter().enumerate() {
            debug!("dissecting {}-{}", region.start, region.end);
            let region_end = region.end.addr();
            let mut addr = region.start.addr();

            while addr < region_end {
                if cancel.is_canceled() {
                    info!("dissection canceled");
                    return Ok(DissectOutcome {
                        status: DissectStatus::Canceled,
                        index,
                        skipped,
                    });
                }
                let window_end = addr.saturating_add(self.options.buffer_size as u64).min(region_end);
                let buf = match reader.read_memory(VirtAddr(addr), (window_end - addr) as usize) {
                    Ok(buf) => buf,
                    Err(Error::TargetTerminated) => {
                        return Ok(self.terminated(index, skipped));
                    }
                    Err(e) if first_read || !e.is_backend_failure() => return Err(e),
                    Err(e) => {
                        warn!("skipping {:#x}-{:#x}: {}", addr, region_end, e);
                        skipped.push(SkippedRange {
                            start: VirtAddr(addr),
                            end: region.end,
                            reason: e.to_string(),
                        });
                        break;
                    }
                };
                first_read = false;

                let mut off = 0usize;
                while off < buf.len() {
                    // Refill rather than split an instruction across windows.
                    if buf.len() - off < max_len && window_end < region_end {
                        break;
                    }
                    let at = VirtAddr(addr + off as u64);
                    match disassembler.decode_instruction(&buf[off..], at) {
                        Ok(insn) => {
                            match self.record(reader, &snapshot, &insn, &mut index) {
                                Ok(()) => {}
                                Err(Error::TargetTerminated) => {
                                    return Ok(self.terminated(index, skipped));
                                }
                                Err(e) => return Err(e),
                            }
                            off += insn.length.max(1);
                        }
                        Err(e) => {
                            trace!("{}: {}", at, e);
                            off += 1;
                        }
                    }
                }
                addr += off as u64;

                let (strings, jumps, calls) = index.counts();
                if let Some(handler) = self.progress.as_mut() {
                    handler(&DissectProgress {
                        region_index,
                        region_count: regions.len(),
                        current_range: (region.start, VirtAddr(addr)),
                        strings,
                        jumps,
                        calls,
                    });
                }
            }
        }

        let (strings, jumps, calls) = index.counts();
        info!(
            "dissected {} regions: {} strings, {} jumps, {} calls",
            regions.len(),
            strings,
            jumps,
            calls
        );
        self.last = Some(index.clone());
        Ok(DissectOutcome {
            status: DissectStatus::Completed,
            index,
            skipped,
        })
    }

    fn terminated(&self, index: CrossReferenceIndex, skipped: Vec<SkippedRange>) -> DissectOutcome {
        warn!("target terminated during dissection");
        DissectOutcome {
            status: DissectStatus::TargetTerminated,
            index,
            skipped,
        }
    }

    fn record(
        &self,
        reader: &dyn AddressSpace,
        snapshot: &Snapshot,
        insn: &DecodedInstruction,
        index: &mut CrossReferenceIndex,
    ) -> Result<()> {
        if insn.flow.is_call() || insn.flow.is_jump() {
            if let Some(target) = insn.target {
                if snapshot.region_of(target).is_some() {
                    let kind = if insn.flow.is_call() {
                        RefKind::Call
                    } else {
                        RefKind::Jump
                    };
                    index.add(kind, target, insn.address, &insn.mnemonic);
                }
            }
            return Ok(());
        }

        let Some(target) = insn.memory_reference else {
            return Ok(());
        };
        let Some(region) = snapshot.region_of(target) else {
            return Ok(());
        };

        let probe = if self.options.discard_invalid_strings {
            (region.end.addr() - target.addr()).min(self.options.string_probe_len.max(1) as u64)
                as usize
        } else {
            1
        };
        let bytes = match reader.read_memory(target, probe) {
            Ok(bytes) => bytes,
            Err(Error::TargetTerminated) => return Err(Error::TargetTerminated),
            Err(e) => {
                trace!("reference {} from {} unreadable: {}", target, insn.address, e);
                return Ok(());
            }
        };
        if self.options.discard_invalid_strings {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            if end == 0 || std::str::from_utf8(&bytes[..end]).is_err() {
                return Ok(());
            }
        }
        index.add(RefKind::String, target, insn.address, &insn.mnemonic);
        Ok(())
    }
}
