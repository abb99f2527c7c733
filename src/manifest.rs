//! Partition manifests.
//!
//! Partitions are described in the boot DTB under `/hypervisor`, one child
//! node per partition:
//!
//! ```text
//! hypervisor {
//!     sp1 {
//!         debug_name = "sp1";
//!         id = <0x8001>;
//!         kind = "secure";             // "vm" | "secure" | "other"
//!         vcpu_count = <4>;
//!         messaging_method = <0x103>;  // partition property bits
//!         uuid = <a b c d>;
//!         memory-regions {
//!             rx { base-address = /bits/ 64 <..>; pages-count = <1>; attributes = <3>; };
//!         };
//!         device-regions {
//!             uart { base-address = /bits/ 64 <..>; pages-count = <1>;
//!                    interrupts = <id attrs ...>; };
//!         };
//!     };
//! };
//! ```
//!
//! `attributes` uses bit 0 = read, bit 1 = write, bit 2 = execute. An
//! interrupt's `attrs` cell carries the priority in bits 7:0 and the
//! trigger type in bit 8 (set for edge).

use fdt::node::FdtNode;
use fdt::Fdt;
use heapless::{String, Vec};
use thiserror::Error;

use crate::arch::traits::TriggerType;
use crate::ffa::region_index::{Mode, PageRange};
use crate::ffa::PartitionId;
use crate::platform::{
    MAX_DEVICE_INTERRUPTS, MAX_DEVICE_REGIONS, MAX_MANIFEST_MEM_REGIONS, MAX_PARTITIONS,
};
use crate::registry::{PartitionKind, PartitionProperties};

pub type Manifests = Vec<PartitionManifest, MAX_PARTITIONS>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryRegionManifest {
    pub range: PageRange,
    pub mode: Mode,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InterruptManifest {
    pub id: u32,
    pub priority: u8,
    pub trigger: TriggerType,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceManifest {
    pub range: PageRange,
    pub interrupts: Vec<InterruptManifest, MAX_DEVICE_INTERRUPTS>,
}

/// Static description of one partition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionManifest {
    pub id: PartitionId,
    pub kind: PartitionKind,
    pub vcpu_count: u16,
    pub properties: PartitionProperties,
    pub uuid: [u32; 4],
    pub debug_name: String<16>,
    pub memory: Vec<MemoryRegionManifest, MAX_MANIFEST_MEM_REGIONS>,
    pub devices: Vec<DeviceManifest, MAX_DEVICE_REGIONS>,
}

impl PartitionManifest {
    /// Manifest with every messaging property and no memory.
    pub fn new(id: PartitionId, kind: PartitionKind, vcpu_count: u16) -> Self {
        Self {
            id,
            kind,
            vcpu_count,
            properties: PartitionProperties::DIRECT_REQ_RECV
                | PartitionProperties::DIRECT_REQ_SEND
                | PartitionProperties::INDIRECT_MSG
                | PartitionProperties::NOTIFICATION
                | PartitionProperties::AARCH64,
            uuid: [0, 0, 0, id as u32],
            debug_name: String::new(),
            memory: Vec::new(),
            devices: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.debug_name.clear();
        for c in name.chars() {
            if self.debug_name.push(c).is_err() {
                break;
            }
        }
        self
    }

    pub fn with_properties(mut self, properties: PartitionProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_uuid(mut self, uuid: [u32; 4]) -> Self {
        self.uuid = uuid;
        self
    }

    /// # Panics
    /// If the manifest already holds the maximum number of regions.
    pub fn with_memory(mut self, range: PageRange, mode: Mode) -> Self {
        assert!(
            self.memory.push(MemoryRegionManifest { range, mode }).is_ok(),
            "too many memory regions"
        );
        self
    }

    /// # Panics
    /// If the manifest already holds the maximum number of device regions.
    pub fn with_device(mut self, range: PageRange, interrupts: &[InterruptManifest]) -> Self {
        let mut dev = DeviceManifest {
            range,
            interrupts: Vec::new(),
        };
        for irq in interrupts {
            assert!(dev.interrupts.push(*irq).is_ok(), "too many device interrupts");
        }
        assert!(self.devices.push(dev).is_ok(), "too many device regions");
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ManifestError {
    #[error("device tree blob is invalid")]
    InvalidBlob,
    #[error("no /hypervisor node")]
    MissingRoot,
    #[error("{node}: missing property {property}")]
    MissingProperty {
        node: &'static str,
        property: &'static str,
    },
    #[error("malformed property {0}")]
    Malformed(&'static str),
    #[error("too many {0}")]
    TooMany(&'static str),
}

fn be_u32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?))
}

fn prop_u32(node: &FdtNode, name: &'static str) -> Result<Option<u32>, ManifestError> {
    match node.property(name) {
        None => Ok(None),
        Some(p) if p.value.len() == 4 => Ok(be_u32(p.value)),
        Some(_) => Err(ManifestError::Malformed(name)),
    }
}

fn prop_u64(node: &FdtNode, name: &'static str) -> Result<Option<u64>, ManifestError> {
    match node.property(name) {
        None => Ok(None),
        Some(p) => match p.value.len() {
            4 => Ok(be_u32(p.value).map(u64::from)),
            8 => Ok(Some(u64::from_be_bytes(
                p.value.try_into().map_err(|_| ManifestError::Malformed(name))?,
            ))),
            _ => Err(ManifestError::Malformed(name)),
        },
    }
}

fn prop_str<'a>(node: &FdtNode<'_, 'a>, name: &'static str) -> Result<Option<&'a str>, ManifestError> {
    match node.property(name) {
        None => Ok(None),
        Some(p) => {
            let bytes = p.value.strip_suffix(&[0]).unwrap_or(p.value);
            core::str::from_utf8(bytes)
                .map(Some)
                .map_err(|_| ManifestError::Malformed(name))
        }
    }
}

fn required<T>(value: Option<T>, property: &'static str) -> Result<T, ManifestError> {
    value.ok_or(ManifestError::MissingProperty {
        node: "partition",
        property,
    })
}

fn parse_range(node: &FdtNode) -> Result<PageRange, ManifestError> {
    let base = required(prop_u64(node, "base-address")?, "base-address")?;
    let pages = required(prop_u32(node, "pages-count")?, "pages-count")?;
    let range = PageRange::from_pages(base, pages as u64).ok_or(ManifestError::Malformed("pages-count"))?;
    if pages == 0 || !range.is_page_aligned() {
        return Err(ManifestError::Malformed("base-address"));
    }
    Ok(range)
}

fn parse_mode(bits: u32) -> Result<Mode, ManifestError> {
    if bits & !0x7 != 0 {
        return Err(ManifestError::Malformed("attributes"));
    }
    Ok(Mode::from_bits_truncate(bits as u8))
}

fn parse_interrupts(
    node: &FdtNode,
    out: &mut Vec<InterruptManifest, MAX_DEVICE_INTERRUPTS>,
) -> Result<(), ManifestError> {
    let Some(prop) = node.property("interrupts") else {
        return Ok(());
    };
    if prop.value.len() % 8 != 0 {
        return Err(ManifestError::Malformed("interrupts"));
    }
    for pair in prop.value.chunks_exact(8) {
        let id = be_u32(&pair[..4]).ok_or(ManifestError::Malformed("interrupts"))?;
        let attrs = be_u32(&pair[4..]).ok_or(ManifestError::Malformed("interrupts"))?;
        let trigger = if attrs & (1 << 8) != 0 {
            TriggerType::Edge
        } else {
            TriggerType::Level
        };
        out.push(InterruptManifest {
            id,
            priority: (attrs & 0xff) as u8,
            trigger,
        })
        .map_err(|_| ManifestError::TooMany("device interrupts"))?;
    }
    Ok(())
}

/// Parse a single partition node.
pub fn parse_partition(node: &FdtNode) -> Result<PartitionManifest, ManifestError> {
    let id = required(prop_u32(node, "id")?, "id")?;
    let id = PartitionId::try_from(id).map_err(|_| ManifestError::Malformed("id"))?;
    let kind = match required(prop_str(node, "kind")?, "kind")? {
        "vm" => PartitionKind::NormalVm,
        "secure" => PartitionKind::Secure,
        "other" => PartitionKind::Other,
        _ => return Err(ManifestError::Malformed("kind")),
    };
    let vcpu_count = required(prop_u32(node, "vcpu_count")?, "vcpu_count")?;
    let vcpu_count = u16::try_from(vcpu_count).map_err(|_| ManifestError::Malformed("vcpu_count"))?;

    let mut m = PartitionManifest::new(id, kind, vcpu_count);
    if let Some(name) = prop_str(node, "debug_name")? {
        m = m.with_name(name);
    }
    if let Some(bits) = prop_u32(node, "messaging_method")? {
        m.properties = PartitionProperties::from_bits(bits)
            .ok_or(ManifestError::Malformed("messaging_method"))?;
    }
    if let Some(p) = node.property("uuid") {
        if p.value.len() != 16 {
            return Err(ManifestError::Malformed("uuid"));
        }
        for (i, word) in p.value.chunks_exact(4).enumerate() {
            m.uuid[i] = be_u32(word).ok_or(ManifestError::Malformed("uuid"))?;
        }
    }

    for child in node.children() {
        match child.name {
            "memory-regions" => {
                for region in child.children() {
                    let range = parse_range(&region)?;
                    let mode = parse_mode(required(prop_u32(&region, "attributes")?, "attributes")?)?;
                    m.memory
                        .push(MemoryRegionManifest { range, mode })
                        .map_err(|_| ManifestError::TooMany("memory regions"))?;
                }
            }
            "device-regions" => {
                for dev in child.children() {
                    let mut device = DeviceManifest {
                        range: parse_range(&dev)?,
                        interrupts: Vec::new(),
                    };
                    parse_interrupts(&dev, &mut device.interrupts)?;
                    m.devices
                        .push(device)
                        .map_err(|_| ManifestError::TooMany("device regions"))?;
                }
            }
            other => log::warn!("manifest: ignoring node '{}' in partition {:#x}", other, id),
        }
    }
    Ok(m)
}

/// Parse every partition under `/hypervisor`.
pub fn parse_manifests(fdt: &Fdt) -> Result<Manifests, ManifestError> {
    let root = fdt.find_node("/hypervisor").ok_or(ManifestError::MissingRoot)?;
    let mut out = Manifests::new();
    for node in root.children() {
        let m = parse_partition(&node)?;
        log::debug!("manifest: {} -> partition {:#x}", node.name, m.id);
        out.push(m).map_err(|_| ManifestError::TooMany("partitions"))?;
    }
    Ok(out)
}

/// Convenience wrapper over a raw blob.
pub fn parse_blob(blob: &[u8]) -> Result<Manifests, ManifestError> {
    let fdt = Fdt::new(blob).map_err(|_| ManifestError::InvalidBlob)?;
    parse_manifests(&fdt)
}
