//! Boot-time discovery from the flattened device tree.
//!
//! The loader hands the manager a DTB describing the machine. This module
//! pulls out the three things the manager needs before any partition runs:
//! the CPU ids under `/cpus`, the memory ranges (`device_type = "memory"`
//! and `"device_memory"` nodes under `/`), and the initrd bounds from
//! `/chosen`.
//!
//! Parsing fails closed. A missing node or a `reg` property whose length is
//! not a whole number of cells is an error, never a guess. Output tables
//! have fixed capacity: too many CPUs is an error, too many memory ranges
//! is logged and the extra ranges are dropped.

use fdt::node::FdtNode;
use fdt::Fdt;
use heapless::Vec;
use thiserror::Error;

use crate::platform::{MAX_CPUS, MAX_MEM_RANGES};

pub type CpuId = u64;
pub type CpuList = Vec<CpuId, MAX_CPUS>;
pub type MemRanges = Vec<MemRange, MAX_MEM_RANGES>;

const DEFAULT_ADDRESS_CELLS: usize = 2;
const DEFAULT_SIZE_CELLS: usize = 1;

/// Physical range `[begin, end)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemRange {
    pub begin: u64,
    pub end: u64,
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum DiscoveryError {
    #[error("device tree blob is invalid")]
    InvalidBlob,
    #[error("node {0} not found")]
    MissingNode(&'static str),
    #[error("property {0} malformed")]
    MalformedProperty(&'static str),
    #[error("unsupported cell width {0}")]
    UnsupportedCells(usize),
    #[error("more than {} CPUs", MAX_CPUS)]
    TooManyCpus,
}

/// Read one `cells`-wide big-endian number from the front of `data`.
fn take_number<'a>(data: &'a [u8], cells: usize) -> Option<(u64, &'a [u8])> {
    let width = cells * 4;
    let (head, rest) = (data.get(..width)?, data.get(width..)?);
    let value = match cells {
        1 => u32::from_be_bytes(head.try_into().ok()?) as u64,
        2 => u64::from_be_bytes(head.try_into().ok()?),
        _ => return None,
    };
    Some((value, rest))
}

/// Value of a 4- or 8-byte property.
fn read_number(node: &FdtNode, name: &str) -> Option<u64> {
    let value = node.property(name)?.value;
    match value.len() {
        4 | 8 => take_number(value, value.len() / 4).map(|(v, _)| v),
        _ => None,
    }
}

fn cells(node: &FdtNode, name: &'static str, default: usize) -> Result<usize, DiscoveryError> {
    let n = match node.property(name) {
        None => default,
        Some(_) => read_number(node, name).ok_or(DiscoveryError::MalformedProperty(name))? as usize,
    };
    match n {
        1 | 2 => Ok(n),
        other => Err(DiscoveryError::UnsupportedCells(other)),
    }
}

fn device_type_is(node: &FdtNode, device_type: &str) -> bool {
    node.property("device_type")
        .map(|p| p.value.strip_suffix(&[0]).unwrap_or(p.value) == device_type.as_bytes())
        .unwrap_or(false)
}

/// Initrd bounds from `/chosen`.
pub fn find_initrd(fdt: &Fdt) -> Option<MemRange> {
    let Some(chosen) = fdt.find_node("/chosen") else {
        log::error!("dtb: unable to find /chosen");
        return None;
    };
    let Some(begin) = read_number(&chosen, "linux,initrd-start") else {
        log::error!("dtb: unable to read linux,initrd-start");
        return None;
    };
    let Some(end) = read_number(&chosen, "linux,initrd-end") else {
        log::error!("dtb: unable to read linux,initrd-end");
        return None;
    };
    Some(MemRange { begin, end })
}

/// Collect every CPU id listed under `/cpus`. `cpus` is emptied first and
/// is left empty if `/cpus` is missing.
pub fn find_cpus(fdt: &Fdt, cpus: &mut CpuList) -> Result<(), DiscoveryError> {
    cpus.clear();
    let node = fdt.find_node("/cpus").ok_or_else(|| {
        log::error!("dtb: unable to find /cpus");
        DiscoveryError::MissingNode("/cpus")
    })?;
    let addr_cells = cells(&node, "#address-cells", DEFAULT_ADDRESS_CELLS)?;

    for cpu in node.children() {
        if !device_type_is(&cpu, "cpu") {
            continue;
        }
        let Some(reg) = cpu.property("reg") else {
            continue;
        };
        let mut data = reg.value;
        while !data.is_empty() {
            if cpus.is_full() {
                log::error!("dtb: found more than {} CPUs", MAX_CPUS);
                return Err(DiscoveryError::TooManyCpus);
            }
            let (id, rest) =
                take_number(data, addr_cells).ok_or(DiscoveryError::MalformedProperty("reg"))?;
            // Capacity checked above.
            let _ = cpus.push(id);
            data = rest;
        }
    }
    Ok(())
}

/// Append the `reg` ranges of every root child whose `device_type` matches.
/// Ranges past capacity are logged and dropped.
pub fn find_memory_ranges(
    fdt: &Fdt,
    device_type: &str,
    ranges: &mut MemRanges,
) -> Result<(), DiscoveryError> {
    ranges.clear();
    let root = fdt.find_node("/").ok_or(DiscoveryError::MissingNode("/"))?;
    let addr_cells = cells(&root, "#address-cells", DEFAULT_ADDRESS_CELLS)?;
    let size_cells = cells(&root, "#size-cells", DEFAULT_SIZE_CELLS)?;

    for node in root.children() {
        if !device_type_is(&node, device_type) {
            continue;
        }
        let Some(reg) = node.property("reg") else {
            continue;
        };
        let mut data = reg.value;
        while !data.is_empty() {
            let (addr, rest) =
                take_number(data, addr_cells).ok_or(DiscoveryError::MalformedProperty("reg"))?;
            let (len, rest) =
                take_number(rest, size_cells).ok_or(DiscoveryError::MalformedProperty("reg"))?;
            data = rest;
            let end = addr
                .checked_add(len)
                .ok_or(DiscoveryError::MalformedProperty("reg"))?;
            if ranges.push(MemRange { begin: addr, end }).is_err() {
                log::warn!(
                    "dtb: found {} range {} but only {} supported, ignoring range of size {:#x}",
                    device_type,
                    ranges.len(),
                    MAX_MEM_RANGES,
                    len
                );
            }
        }
    }
    Ok(())
}

/// Everything discovered from the boot DTB.
#[derive(Clone, Debug, Default)]
pub struct BootInfo {
    pub cpus: CpuList,
    pub memory: MemRanges,
    pub device_memory: MemRanges,
    pub initrd: Option<MemRange>,
}

impl BootInfo {
    pub fn discover(blob: &[u8]) -> Result<Self, DiscoveryError> {
        let fdt = Fdt::new(blob).map_err(|_| DiscoveryError::InvalidBlob)?;
        let mut info = BootInfo::default();
        find_cpus(&fdt, &mut info.cpus)?;
        find_memory_ranges(&fdt, "memory", &mut info.memory)?;
        find_memory_ranges(&fdt, "device_memory", &mut info.device_memory)?;
        info.initrd = find_initrd(&fdt);
        log::info!(
            "dtb: {} cpus, {} memory ranges, {} device ranges",
            info.cpus.len(),
            info.memory.len(),
            info.device_memory.len()
        );
        Ok(info)
    }
}
