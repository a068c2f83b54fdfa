//! In-memory address space.
//!
//! [`MemoryImage`] implements [`AddressSpace`] over owned buffers, one per
//! region. It backs offline analysis of captured memory and gives tests a
//! synthetic target whose contents and protections can be changed between
//! scan passes.

use parking_lot::RwLock;

use crate::backend::AddressSpace;
use crate::error::{Error, Result};
use crate::procfs::{Permissions, Region};
use crate::types::VirtAddr;

struct MappedRegion {
    region: Region,
    data: RwLock<Vec<u8>>,
}

/// A set of non-overlapping regions with their contents.
#[derive(Default)]
pub struct MemoryImage {
    regions: Vec<MappedRegion>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a zero-filled region.
    pub fn map(&mut self, region: Region) -> Result<()> {
        let len = region.len() as usize;
        self.map_with(region, &vec![0; len])
    }

    /// Map a region and fill it from `data` (the tail stays zeroed if
    /// `data` is shorter than the region).
    pub fn map_with(&mut self, region: Region, data: &[u8]) -> Result<()> {
        if region.is_empty() {
            return Err(Error::InvalidInput(format!(
                "region at {} has zero length",
                region.start
            )));
        }
        if data.len() as u64 > region.len() {
            return Err(Error::InvalidInput(format!(
                "{} bytes do not fit in region {}-{}",
                data.len(),
                region.start,
                region.end
            )));
        }
        if self
            .regions
            .iter()
            .any(|m| m.region.start < region.end && region.start < m.region.end)
        {
            return Err(Error::InvalidInput(format!(
                "region {}-{} overlaps an existing mapping",
                region.start, region.end
            )));
        }

        let mut buf = vec![0u8; region.len() as usize];
        buf[..data.len()].copy_from_slice(data);
        let pos = self
            .regions
            .partition_point(|m| m.region.start < region.start);
        self.regions.insert(
            pos,
            MappedRegion {
                region,
                data: RwLock::new(buf),
            },
        );
        Ok(())
    }

    /// Remove the region starting at `start`.
    pub fn unmap(&mut self, start: VirtAddr) -> Result<()> {
        let pos = self
            .regions
            .iter()
            .position(|m| m.region.start == start)
            .ok_or_else(|| Error::NotFound(format!("no region starts at {}", start)))?;
        self.regions.remove(pos);
        Ok(())
    }

    /// Change the permissions of the region starting at `start`.
    pub fn protect(&mut self, start: VirtAddr, perms: Permissions) -> Result<()> {
        let mapped = self
            .regions
            .iter_mut()
            .find(|m| m.region.start == start)
            .ok_or_else(|| Error::NotFound(format!("no region starts at {}", start)))?;
        mapped.region.perms = perms;
        Ok(())
    }

    /// Write bytes regardless of region protection.
    pub fn write(&self, addr: VirtAddr, data: &[u8]) -> Result<()> {
        let mapped = self
            .find(addr, data.len())
            .ok_or(Error::NotWritable { addr })?;
        let off = (addr.addr() - mapped.region.start.addr()) as usize;
        mapped.data.write()[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn find(&self, addr: VirtAddr, len: usize) -> Option<&MappedRegion> {
        self.regions
            .iter()
            .find(|m| m.region.contains_range(addr, len as u64))
    }
}

impl AddressSpace for MemoryImage {
    fn list_regions(&self) -> Result<Vec<Region>> {
        Ok(self.regions.iter().map(|m| m.region.clone()).collect())
    }

    fn read_memory(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        let mapped = self
            .find(addr, len)
            .filter(|m| m.region.perms.read)
            .ok_or(Error::NotReadable { addr, len })?;
        let off = (addr.addr() - mapped.region.start.addr()) as usize;
        Ok(mapped.data.read()[off..off + len].to_vec())
    }

    fn write_memory(&self, addr: VirtAddr, data: &[u8]) -> Result<()> {
        match self.find(addr, data.len()) {
            Some(m) if m.region.perms.write => self.write(addr, data),
            _ => Err(Error::NotWritable { addr }),
        }
    }
}
