//! Boot discovery of CPUs, memory ranges and the initrd from device tree
//! blobs built on the host.

use fdt::Fdt;
use spm::dtb::{find_cpus, find_memory_ranges, BootInfo, CpuList, DiscoveryError, MemRange, MemRanges};
use vm_fdt::{Error, FdtWriter};

/// Root cell widths, CPU `reg` values and `(device_type, [addr, size]...)`
/// nodes for one test blob.
struct Machine<'a> {
    root_cells: Option<(u32, u32)>,
    cpu_cells: u32,
    cpus: &'a [u64],
    memory: &'a [(&'a str, &'a [u64])],
    initrd: Option<(u64, u64)>,
    with_cpus_node: bool,
}

impl Default for Machine<'_> {
    fn default() -> Self {
        Self {
            root_cells: Some((2, 2)),
            cpu_cells: 1,
            cpus: &[0, 1],
            memory: &[("memory", &[0x4000_0000, 0x1000_0000])],
            initrd: None,
            with_cpus_node: true,
        }
    }
}

fn push_cells(out: &mut Vec<u32>, value: u64, cells: u32) {
    if cells == 2 {
        out.push((value >> 32) as u32);
    }
    out.push(value as u32);
}

fn build(m: &Machine) -> Result<Vec<u8>, Error> {
    let mut fdt = FdtWriter::new()?;
    let root = fdt.begin_node("")?;
    fdt.property_string("compatible", "linux,dummy-virt")?;
    let (addr_cells, size_cells) = m.root_cells.unwrap_or((2, 1));
    if let Some((a, s)) = m.root_cells {
        fdt.property_u32("#address-cells", a)?;
        fdt.property_u32("#size-cells", s)?;
    }

    if m.with_cpus_node {
        let cpus = fdt.begin_node("cpus")?;
        fdt.property_u32("#address-cells", m.cpu_cells)?;
        fdt.property_u32("#size-cells", 0)?;
        for &id in m.cpus {
            let cpu = fdt.begin_node(&format!("cpu@{:x}", id))?;
            fdt.property_string("device_type", "cpu")?;
            let mut reg = Vec::new();
            push_cells(&mut reg, id, m.cpu_cells);
            fdt.property_array_u32("reg", &reg)?;
            fdt.end_node(cpu)?;
        }
        fdt.end_node(cpus)?;
    }

    for (i, (device_type, reg)) in m.memory.iter().enumerate() {
        let node = fdt.begin_node(&format!("memory@{}", i))?;
        fdt.property_string("device_type", device_type)?;
        let mut cells = Vec::new();
        for pair in reg.chunks(2) {
            push_cells(&mut cells, pair[0], addr_cells);
            push_cells(&mut cells, pair[1], size_cells);
        }
        fdt.property_array_u32("reg", &cells)?;
        fdt.end_node(node)?;
    }

    let chosen = fdt.begin_node("chosen")?;
    fdt.property_string("bootargs", "console=ttyAMA0")?;
    if let Some((start, end)) = m.initrd {
        fdt.property_u64("linux,initrd-start", start)?;
        fdt.property_u64("linux,initrd-end", end)?;
    }
    fdt.end_node(chosen)?;

    fdt.end_node(root)?;
    fdt.finish()
}

fn dtb(m: &Machine) -> Vec<u8> {
    build(m).expect("valid device tree")
}

#[test]
fn discovers_a_typical_machine() {
    let blob = dtb(&Machine {
        cpus: &[0, 1, 2, 3],
        memory: &[
            ("memory", &[0x4000_0000, 0x4000_0000]),
            ("device_memory", &[0x0900_0000, 0x1000, 0x0a00_0000, 0x200]),
        ],
        initrd: Some((0x4800_0000, 0x4810_0000)),
        ..Machine::default()
    });
    let info = BootInfo::discover(&blob).unwrap();
    assert_eq!(info.cpus.as_slice(), &[0, 1, 2, 3]);
    assert_eq!(
        info.memory.as_slice(),
        &[MemRange {
            begin: 0x4000_0000,
            end: 0x8000_0000
        }]
    );
    assert_eq!(
        info.device_memory.as_slice(),
        &[
            MemRange {
                begin: 0x0900_0000,
                end: 0x0900_1000
            },
            MemRange {
                begin: 0x0a00_0000,
                end: 0x0a00_0200
            },
        ]
    );
    assert_eq!(
        info.initrd,
        Some(MemRange {
            begin: 0x4800_0000,
            end: 0x4810_0000
        })
    );
}

#[test]
fn two_cell_cpu_ids() {
    let blob = dtb(&Machine {
        cpu_cells: 2,
        cpus: &[0x1_0000_0000, 0x100],
        ..Machine::default()
    });
    let fdt = Fdt::new(&blob).unwrap();
    let mut cpus = CpuList::new();
    find_cpus(&fdt, &mut cpus).unwrap();
    assert_eq!(cpus.as_slice(), &[0x1_0000_0000, 0x100]);
}

#[test]
fn missing_cpus_node_leaves_the_list_empty() {
    let blob = dtb(&Machine {
        with_cpus_node: false,
        ..Machine::default()
    });
    let fdt = Fdt::new(&blob).unwrap();
    let mut cpus = CpuList::new();
    cpus.push(7).unwrap();
    assert_eq!(find_cpus(&fdt, &mut cpus), Err(DiscoveryError::MissingNode("/cpus")));
    assert!(cpus.is_empty());
    assert_eq!(BootInfo::discover(&blob).unwrap_err(), DiscoveryError::MissingNode("/cpus"));
}

#[test]
fn too_many_cpus_is_an_error() {
    let ids: Vec<u64> = (0..9).collect();
    let blob = dtb(&Machine {
        cpus: &ids,
        ..Machine::default()
    });
    assert_eq!(BootInfo::discover(&blob).unwrap_err(), DiscoveryError::TooManyCpus);

    let ids: Vec<u64> = (0..8).collect();
    let blob = dtb(&Machine {
        cpus: &ids,
        ..Machine::default()
    });
    assert_eq!(BootInfo::discover(&blob).unwrap().cpus.len(), 8);
}

#[test]
fn default_root_cells_are_two_and_one() {
    let blob = dtb(&Machine {
        root_cells: None,
        memory: &[("memory", &[0x8_0000_0000, 0x8000_0000])],
        ..Machine::default()
    });
    let info = BootInfo::discover(&blob).unwrap();
    assert_eq!(
        info.memory.as_slice(),
        &[MemRange {
            begin: 0x8_0000_0000,
            end: 0x8_8000_0000
        }]
    );
}

#[test]
fn one_cell_memory_ranges() {
    let blob = dtb(&Machine {
        root_cells: Some((1, 1)),
        memory: &[("memory", &[0x4000_0000, 0x100_0000, 0x6000_0000, 0x100_0000])],
        ..Machine::default()
    });
    let fdt = Fdt::new(&blob).unwrap();
    let mut ranges = MemRanges::new();
    find_memory_ranges(&fdt, "memory", &mut ranges).unwrap();
    assert_eq!(ranges.len(), 2);
    assert_eq!(ranges[1].begin, 0x6000_0000);
    assert_eq!(ranges[1].end, 0x6100_0000);

    // The list is rebuilt, not appended to.
    find_memory_ranges(&fdt, "device_memory", &mut ranges).unwrap();
    assert!(ranges.is_empty());
}

#[test]
fn extra_memory_ranges_are_dropped() {
    let reg: Vec<u64> = (0..10u64).flat_map(|i| [0x4000_0000 + i * 0x10_0000, 0x1000]).collect();
    let blob = dtb(&Machine {
        memory: &[("memory", reg.as_slice())],
        ..Machine::default()
    });
    let info = BootInfo::discover(&blob).unwrap();
    assert_eq!(info.memory.len(), 8);
    assert_eq!(info.memory[7].begin, 0x4000_0000 + 7 * 0x10_0000);
}

#[test]
fn range_that_wraps_is_malformed() {
    let blob = dtb(&Machine {
        memory: &[("memory", &[0xFFFF_FFFF_FFFF_F000, 0x2000])],
        ..Machine::default()
    });
    assert_eq!(
        BootInfo::discover(&blob).unwrap_err(),
        DiscoveryError::MalformedProperty("reg")
    );
}

#[test]
fn partial_reg_is_malformed() -> Result<(), Error> {
    let mut fdt = FdtWriter::new()?;
    let root = fdt.begin_node("")?;
    fdt.property_u32("#address-cells", 2)?;
    fdt.property_u32("#size-cells", 2)?;
    let mem = fdt.begin_node("memory@40000000")?;
    fdt.property_string("device_type", "memory")?;
    fdt.property_array_u32("reg", &[0, 0x4000_0000, 0])?;
    fdt.end_node(mem)?;
    fdt.end_node(root)?;
    let blob = fdt.finish()?;

    let fdt = Fdt::new(&blob).unwrap();
    let mut ranges = MemRanges::new();
    assert_eq!(
        find_memory_ranges(&fdt, "memory", &mut ranges),
        Err(DiscoveryError::MalformedProperty("reg"))
    );
    Ok(())
}

#[test]
fn unsupported_cell_width() {
    let blob = dtb(&Machine {
        root_cells: Some((3, 2)),
        memory: &[],
        ..Machine::default()
    });
    let fdt = Fdt::new(&blob).unwrap();
    let mut ranges = MemRanges::new();
    assert_eq!(
        find_memory_ranges(&fdt, "memory", &mut ranges),
        Err(DiscoveryError::UnsupportedCells(3))
    );
}

#[test]
fn initrd_is_optional() {
    let info = BootInfo::discover(&dtb(&Machine::default())).unwrap();
    assert_eq!(info.initrd, None);
}

#[test]
fn garbage_is_not_a_device_tree() {
    assert_eq!(
        BootInfo::discover(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0]).unwrap_err(),
        DiscoveryError::InvalidBlob
    );
}
