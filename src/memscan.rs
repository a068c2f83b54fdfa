//! Progressive value scanning.
//!
//! A [`ScanSession`] narrows a set of candidate addresses over successive
//! passes: the first scan streams through the selected regions and keeps
//! every aligned address whose value matches; each next scan re-reads the
//! survivors and keeps those that match against their previous value.

use log::{debug, info, warn};

use crate::backend::AddressSpace;
use crate::error::{Error, Result};
use crate::procfs::Region;
use crate::scan_type::ScanType;
use crate::types::{CancelToken, VirtAddr};
use crate::value::{Endianness, Value, ValueType};

/// Scan tuning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Bytes read per backend request.
    pub chunk_size: usize,
    pub endianness: Endianness,
    /// Overrides the value type's natural alignment.
    pub alignment: Option<usize>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            chunk_size: 0x10000,
            endianness: Endianness::default(),
            alignment: None,
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Ready,
}

/// An address still considered a match.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub address: VirtAddr,
    /// Value observed by the most recent pass.
    pub value: Value,
}

/// How a scan pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Completed,
    Canceled,
    /// The target went away; results gathered so far were kept.
    TargetTerminated,
}

/// A region (or the tail of one) that could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRange {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub reason: String,
}

/// Result of one scan pass.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub status: ScanStatus,
    /// Candidates held by the session after the pass.
    pub candidates: usize,
    pub skipped: Vec<SkippedRange>,
}

/// Progress report delivered after every chunk or batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanProgress {
    pub regions_done: usize,
    pub regions_total: usize,
    pub bytes_scanned: u64,
    pub candidates: usize,
}

type ProgressFn = Box<dyn FnMut(&ScanProgress) + Send>;

/// A progressive value scan over one target.
pub struct ScanSession {
    value_type: ValueType,
    options: ScanOptions,
    state: ScanState,
    regions: Vec<Region>,
    candidates: Vec<Candidate>,
    history: Option<Vec<Candidate>>,
    progress: Option<ProgressFn>,
}

/// What a single read produced.
enum Fetch {
    Data(Vec<u8>),
    Unreadable(Error),
    Terminated,
}

fn fetch(reader: &dyn AddressSpace, addr: VirtAddr, len: usize) -> Result<Fetch> {
    match reader.read_memory(addr, len) {
        Ok(data) if data.len() >= len => Ok(Fetch::Data(data)),
        Ok(data) => Ok(Fetch::Unreadable(Error::NotReadable {
            addr: addr + data.len() as u64,
            len: len - data.len(),
        })),
        Err(Error::TargetTerminated) => Ok(Fetch::Terminated),
        Err(e) if e.is_backend_failure() => Ok(Fetch::Unreadable(e)),
        Err(e) => Err(e),
    }
}

impl ScanSession {
    pub fn new(value_type: ValueType, options: ScanOptions) -> Self {
        ScanSession {
            value_type,
            options,
            state: ScanState::Idle,
            regions: Vec::new(),
            candidates: Vec::new(),
            history: None,
            progress: None,
        }
    }

    /// Receive a report after every chunk (first scan) or batch (next scan).
    pub fn set_progress_handler(&mut self, handler: impl FnMut(&ScanProgress) + Send + 'static) {
        self.progress = Some(Box::new(handler));
    }

    /// Change the value type. Only allowed while idle.
    pub fn set_value_type(&mut self, value_type: ValueType) -> Result<()> {
        if self.state != ScanState::Idle {
            return Err(Error::InvalidState(
                "value type can only change before the first scan".into(),
            ));
        }
        self.value_type = value_type;
        Ok(())
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Surviving candidates, ascending by address.
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Regions selected by the first scan.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn can_undo(&self) -> bool {
        self.history.is_some()
    }

    fn alignment(&self) -> usize {
        self.options
            .alignment
            .unwrap_or_else(|| self.value_type.alignment())
            .max(1)
    }

    fn report(&mut self, progress: ScanProgress) {
        if let Some(handler) = self.progress.as_mut() {
            handler(&progress);
        }
    }

    /// Scan `regions` and seed the candidate set.
    pub fn begin_first_scan(
        &mut self,
        reader: &dyn AddressSpace,
        regions: &[Region],
        scan_type: &ScanType,
        cancel: &CancelToken,
    ) -> Result<ScanOutcome> {
        if self.state != ScanState::Idle {
            return Err(Error::InvalidState(
                "first scan requires an idle session; reset it first".into(),
            ));
        }
        if regions.is_empty() {
            return Err(Error::InvalidInput("no regions selected for scanning".into()));
        }
        if let Some(region) = regions.iter().find(|r| r.is_empty()) {
            return Err(Error::InvalidInput(format!(
                "region at {} has zero length",
                region.start
            )));
        }
        if self.options.chunk_size == 0 {
            return Err(Error::InvalidInput("chunk size must be non-zero".into()));
        }
        scan_type.validate(self.value_type, true)?;
        let scan_type = &scan_type.narrowed_to(self.value_type);

        let mut regions = regions.to_vec();
        regions.sort_by_key(|r| r.start);

        self.state = ScanState::Scanning;
        match self.stream_regions(reader, &regions, scan_type, cancel) {
            Ok((ScanStatus::Canceled, _, skipped)) => {
                info!("first scan canceled; session back to idle");
                self.state = ScanState::Idle;
                Ok(ScanOutcome {
                    status: ScanStatus::Canceled,
                    candidates: 0,
                    skipped,
                })
            }
            Ok((status, found, skipped)) => {
                info!(
                    "first scan ({} {}) over {} regions: {} candidates",
                    self.value_type,
                    scan_type,
                    regions.len(),
                    found.len()
                );
                self.regions = regions;
                self.candidates = found;
                self.history = None;
                self.state = ScanState::Ready;
                Ok(ScanOutcome {
                    status,
                    candidates: self.candidates.len(),
                    skipped,
                })
            }
            Err(e) => {
                self.state = ScanState::Idle;
                Err(e)
            }
        }
    }

    fn stream_regions(
        &mut self,
        reader: &dyn AddressSpace,
        regions: &[Region],
        scan_type: &ScanType,
        cancel: &CancelToken,
    ) -> Result<(ScanStatus, Vec<Candidate>, Vec<SkippedRange>)> {
        let size = self.value_type.size() as u64;
        let align = self.alignment() as u64;
        let chunk_size = self.options.chunk_size as u64;
        let endianness = self.options.endianness;

        let mut found = Vec::new();
        let mut skipped = Vec::new();
        let mut first_read = true;
        let mut progress = ScanProgress {
            regions_total: regions.len(),
            ..ScanProgress::default()
        };

        for region in regions {
            let region_end = region.end.addr();
            let mut chunk_start = region.start.addr();
            debug!("scanning region {}-{}", region.start, region.end);

            while chunk_start < region_end {
                if cancel.is_canceled() {
                    return Ok((ScanStatus::Canceled, Vec::new(), skipped));
                }
                let chunk_end = chunk_start.saturating_add(chunk_size).min(region_end);
                // Overlap so values straddling the chunk boundary are seen.
                let read_end = chunk_end.saturating_add(size - 1).min(region_end);
                let len = (read_end - chunk_start) as usize;

                let data = match fetch(reader, VirtAddr(chunk_start), len)? {
                    Fetch::Data(data) => data,
                    Fetch::Unreadable(e) if first_read => return Err(e),
                    Fetch::Unreadable(e) => {
                        warn!(
                            "skipping {:#x}-{:#x}: {}",
                            chunk_start, region_end, e
                        );
                        skipped.push(SkippedRange {
                            start: VirtAddr(chunk_start),
                            end: region.end,
                            reason: e.to_string(),
                        });
                        break;
                    }
                    Fetch::Terminated => {
                        warn!("target terminated during first scan");
                        return Ok((ScanStatus::TargetTerminated, found, skipped));
                    }
                };
                first_read = false;

                let mut addr = chunk_start.div_ceil(align) * align;
                while addr < chunk_end && addr + size <= read_end {
                    let off = (addr - chunk_start) as usize;
                    if let Some(value) = self.value_type.decode(&data[off..], endianness) {
                        if scan_type.matches_as(self.value_type, None, &value) {
                            found.push(Candidate {
                                address: VirtAddr(addr),
                                value,
                            });
                        }
                    }
                    addr += align;
                }

                progress.bytes_scanned += chunk_end - chunk_start;
                progress.candidates = found.len();
                self.report(progress.clone());
                chunk_start = chunk_end;
            }
            progress.regions_done += 1;
        }
        self.report(progress);
        Ok((ScanStatus::Completed, found, skipped))
    }

    /// Re-read every candidate and keep those matching `scan_type`.
    pub fn next_scan(
        &mut self,
        reader: &dyn AddressSpace,
        scan_type: &ScanType,
        cancel: &CancelToken,
    ) -> Result<ScanOutcome> {
        if self.state != ScanState::Ready {
            return Err(Error::InvalidState(
                "next scan requires a completed first scan".into(),
            ));
        }
        scan_type.validate(self.value_type, false)?;
        let scan_type = &scan_type.narrowed_to(self.value_type);

        self.state = ScanState::Scanning;
        let result = self.filter_candidates(reader, scan_type, cancel);
        self.state = ScanState::Ready;

        let (status, kept) = result?;
        if status == ScanStatus::Canceled {
            info!("next scan canceled; candidates unchanged");
            return Ok(ScanOutcome {
                status,
                candidates: self.candidates.len(),
                skipped: Vec::new(),
            });
        }

        info!(
            "next scan ({}): {} -> {} candidates",
            scan_type,
            self.candidates.len(),
            kept.len()
        );
        let previous = std::mem::replace(&mut self.candidates, kept);
        self.history = Some(previous);
        Ok(ScanOutcome {
            status,
            candidates: self.candidates.len(),
            skipped: Vec::new(),
        })
    }

    fn filter_candidates(
        &mut self,
        reader: &dyn AddressSpace,
        scan_type: &ScanType,
        cancel: &CancelToken,
    ) -> Result<(ScanStatus, Vec<Candidate>)> {
        let size = self.value_type.size();
        let window = self.options.chunk_size.max(size) as u64;
        let endianness = self.options.endianness;
        let value_type = self.value_type;
        let total = self.candidates.len();

        let mut kept = Vec::new();
        let mut progress = ScanProgress {
            regions_total: self.regions.len(),
            regions_done: self.regions.len(),
            ..ScanProgress::default()
        };

        let keep_if_match = |candidate: &Candidate, bytes: &[u8], kept: &mut Vec<Candidate>| {
            if let Some(value) = value_type.decode(bytes, endianness) {
                if scan_type.matches_as(value_type, Some(&candidate.value), &value) {
                    kept.push(Candidate {
                        address: candidate.address,
                        value,
                    });
                }
            }
        };

        let mut i = 0;
        while i < total {
            if cancel.is_canceled() {
                return Ok((ScanStatus::Canceled, Vec::new()));
            }
            let base = self.candidates[i].address;
            let mut j = i + 1;
            while j < total
                && self.candidates[j].address.addr() + size as u64 - base.addr() <= window
            {
                j += 1;
            }
            let span = (self.candidates[j - 1].address.addr() + size as u64 - base.addr()) as usize;

            match fetch(reader, base, span)? {
                Fetch::Data(data) => {
                    for candidate in &self.candidates[i..j] {
                        let off = (candidate.address.addr() - base.addr()) as usize;
                        keep_if_match(candidate, &data[off..], &mut kept);
                    }
                }
                Fetch::Unreadable(_) => {
                    // Part of the window went away; unreadable candidates are dropped.
                    for candidate in &self.candidates[i..j] {
                        match fetch(reader, candidate.address, size)? {
                            Fetch::Data(data) => keep_if_match(candidate, &data, &mut kept),
                            Fetch::Unreadable(e) => {
                                debug!("dropping candidate {}: {}", candidate.address, e)
                            }
                            Fetch::Terminated => return Ok((ScanStatus::TargetTerminated, kept)),
                        }
                    }
                }
                Fetch::Terminated => {
                    warn!("target terminated during next scan");
                    return Ok((ScanStatus::TargetTerminated, kept));
                }
            }

            progress.bytes_scanned += span as u64;
            progress.candidates = kept.len();
            if let Some(handler) = self.progress.as_mut() {
                handler(&progress);
            }
            i = j;
        }
        Ok((ScanStatus::Completed, kept))
    }

    /// Restore the candidate set from before the most recent next scan.
    pub fn undo(&mut self) -> Result<()> {
        if self.state != ScanState::Ready {
            return Err(Error::InvalidState("nothing to undo".into()));
        }
        let previous = self
            .history
            .take()
            .ok_or_else(|| Error::InvalidState("no scan to undo".into()))?;
        debug!(
            "undo: {} -> {} candidates",
            self.candidates.len(),
            previous.len()
        );
        self.candidates = previous;
        Ok(())
    }

    /// Drop all candidates and history.
    pub fn reset(&mut self) {
        self.candidates.clear();
        self.history = None;
        self.regions.clear();
        self.state = ScanState::Idle;
    }
}
