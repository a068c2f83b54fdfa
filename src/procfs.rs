//! Memory region model and Linux `/proc/[pid]/maps` parsing.
//!
//! Backends use [`parse_maps`] to implement region enumeration; callers use
//! [`RegionScope`] and [`filter_by_path`] to pick the regions a scan or a
//! dissection pass should cover.

use regex::RegexBuilder;

use crate::error::Result;
use crate::types::VirtAddr;

/// A contiguous mapped range with uniform permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub perms: Permissions,
    pub offset: u64,
    /// Backing path, `[heap]`-style pseudo path, or empty for anonymous maps.
    pub pathname: String,
}

impl Region {
    pub fn new(start: u64, end: u64, perms: Permissions) -> Self {
        Region {
            start: VirtAddr(start),
            end: VirtAddr(end),
            perms,
            offset: 0,
            pathname: String::new(),
        }
    }

    pub fn with_path(mut self, pathname: impl Into<String>) -> Self {
        self.pathname = pathname.into();
        self
    }

    pub fn len(&self) -> u64 {
        self.end.addr().saturating_sub(self.start.addr())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Whether `[addr, addr + len)` lies entirely inside the region.
    pub fn contains_range(&self, addr: VirtAddr, len: u64) -> bool {
        match addr.addr().checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end.addr(),
            None => false,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.pathname.is_empty()
    }
}

/// Memory region permissions (rwxp/s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub private: bool,
}

impl Permissions {
    pub const R: Permissions = Permissions { read: true, write: false, execute: false, private: true };
    pub const RW: Permissions = Permissions { read: true, write: true, execute: false, private: true };
    pub const RX: Permissions = Permissions { read: true, write: false, execute: true, private: true };
    pub const RWX: Permissions = Permissions { read: true, write: true, execute: true, private: true };
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
            if self.private { 'p' } else { 's' },
        )
    }
}

/// Read and parse `/proc/[pid]/maps`.
pub fn read_memory_maps(pid: u32) -> Result<Vec<Region>> {
    let content = std::fs::read_to_string(format!("/proc/{}/maps", pid)).map_err(|e| {
        crate::error::Error::BackendRejected(format!("read /proc/{}/maps: {}", pid, e))
    })?;
    Ok(parse_maps(&content))
}

/// Parse the contents of a maps file.
pub fn parse_maps(content: &str) -> Vec<Region> {
    content.lines().filter_map(parse_map_line).collect()
}

fn parse_map_line(line: &str) -> Option<Region> {
    // Format: 7f8a1000-7f8a2000 r-xp 00000000 08:01 12345  /lib/libc.so.6
    let mut parts = line.splitn(6, char::is_whitespace);

    let addr_range = parts.next()?;
    let perms_str = parts.next()?;
    let offset_str = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let pathname = parts.next().unwrap_or("").trim().to_string();

    let (start_str, end_str) = addr_range.split_once('-')?;
    let perms = perms_str.as_bytes();
    if perms.len() < 4 {
        return None;
    }

    Some(Region {
        start: VirtAddr(u64::from_str_radix(start_str, 16).ok()?),
        end: VirtAddr(u64::from_str_radix(end_str, 16).ok()?),
        perms: Permissions {
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            execute: perms[2] == b'x',
            private: perms[3] == b'p',
        },
        offset: u64::from_str_radix(offset_str, 16).ok()?,
        pathname,
    })
}

/// Find which region contains a given address.
pub fn find_region_containing(regions: &[Region], addr: VirtAddr) -> Option<&Region> {
    regions.iter().find(|r| r.contains(addr))
}

/// Preset region selections for value scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegionScope {
    /// Heap, stack and the writable mappings of the main executable.
    Basic,
    /// `Basic` plus anonymous writable mappings.
    #[default]
    Normal,
    /// Every readable and writable region.
    FullRw,
    /// Every readable region.
    Full,
}

impl RegionScope {
    /// Select the regions covered by this scope. `executable` is the path of
    /// the main binary, used to recognise its data/bss mappings.
    pub fn select(self, regions: &[Region], executable: Option<&str>) -> Vec<Region> {
        regions
            .iter()
            .filter(|r| self.includes(r, executable))
            .cloned()
            .collect()
    }

    fn includes(self, region: &Region, executable: Option<&str>) -> bool {
        if !region.perms.read {
            return false;
        }
        let basic = region.perms.write
            && (region.pathname == "[heap]"
                || region.pathname.starts_with("[stack")
                || executable.is_some_and(|exe| !exe.is_empty() && region.pathname == exe));
        match self {
            RegionScope::Basic => basic,
            RegionScope::Normal => basic || (region.perms.write && region.is_anonymous()),
            RegionScope::FullRw => region.perms.write,
            RegionScope::Full => true,
        }
    }
}

/// Keep only regions whose backing path matches `pattern`.
pub fn filter_by_path(regions: &[Region], pattern: &str, case_sensitive: bool) -> Result<Vec<Region>> {
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()?;
    Ok(regions
        .iter()
        .filter(|r| regex.is_match(&r.pathname))
        .cloned()
        .collect())
}
