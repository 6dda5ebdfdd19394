use kvm_bindings::{kvm_regs, kvm_segment};
use kvm_ioctls::VcpuFd;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use super::error::{Error, Result};

pub const SIZE_2MIB: usize = 2 * 1024 * 1024;
const SIZE_4KIB: u64 = 0x1000;
const PT_ENTRIES: u64 = 512;
// A single page directory covers 1 GiB.
const MAX_MEM_SIZE: usize = 512 * SIZE_2MIB;

const PML4_ADDR: GuestAddress = GuestAddress(0);
const PDPT_ADDR: GuestAddress = GuestAddress(0x1000);
const PD_ADDR: GuestAddress = GuestAddress(0x2000);
// First 4 KiB page table; kept clear of the PD above it.
const PT_BASE: GuestAddress = GuestAddress(0x3000);

// Page-table / PTE flag bits
const PTE_PRESENT: u64 = 0x1;
const PTE_RW: u64 = 0x2;
const PTE_USER: u64 = 0x4;
const PTE_PS: u64 = 0x80;
const TABLE_ENTRY_FLAGS: u64 = PTE_PRESENT | PTE_RW | PTE_USER; // next-level table
const PD_2M_ENTRY_FLAGS: u64 = TABLE_ENTRY_FLAGS | PTE_PS; // 2MB page entry

// Control-register / system constants
const CR4_PAE: u64 = 1 << 5;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;
const CR0_PE: u64 = 1 << 0;
const CR0_PG: u64 = 1 << 31;
const RFLAGS_RESERVED: u64 = 2;

// Segment descriptor types
const CS_TYPE: u8 = 0xB;
const DS_TYPE: u8 = 0x3;

/// Granularity of the guest mapping built by the bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Mib2,
    Kib4,
}

/// Memory sizes the single-directory layout can express.
pub fn validate_mem_size(mem_size: usize) -> Result<()> {
    if mem_size == 0 || mem_size % SIZE_2MIB != 0 || mem_size > MAX_MEM_SIZE {
        return Err(Error::BadMemSize(mem_size));
    }
    Ok(())
}

/// Builds the four-level translation for the guest and returns the
/// guest-physical address the image must be loaded at.
///
/// The leaf entries map guest-virtual 0 onto the load address, so the
/// vCPU enters the image with `RIP = 0` and no trampoline. Physical
/// memory below the load address (the tables themselves) has no virtual
/// alias.
pub fn write_page_tables(
    mem: &GuestMemoryMmap<()>,
    mem_size: usize,
    page_size: PageSize,
) -> Result<u64> {
    validate_mem_size(mem_size)?;

    let pml4_entry: u64 = PDPT_ADDR.0 | TABLE_ENTRY_FLAGS; // PML4[0] -> PDPT
    let pdpt_entry: u64 = PD_ADDR.0 | TABLE_ENTRY_FLAGS; // PDPT[0] -> PD

    mem.write_slice(&pml4_entry.to_le_bytes(), PML4_ADDR)?;
    mem.write_slice(&pdpt_entry.to_le_bytes(), PDPT_ADDR)?;

    match page_size {
        PageSize::Mib2 => {
            // Image at the first 2 MiB boundary past the tables. The last
            // 2 MiB of physical memory stays unmapped; a 2 MiB guest gets
            // no leaf entries at all.
            let load_addr = SIZE_2MIB as u64;
            let slots = mem_size / SIZE_2MIB - 1;
            for i in 0..slots as u64 {
                let entry = (load_addr + i * SIZE_2MIB as u64) | PD_2M_ENTRY_FLAGS;
                mem.write_slice(&entry.to_le_bytes(), GuestAddress(PD_ADDR.0 + i * 8))?;
            }
            Ok(load_addr)
        }
        PageSize::Kib4 => {
            // One page table per 2 MiB of guest memory, packed from
            // PT_BASE; the image follows the last table.
            let tables = (mem_size / SIZE_2MIB) as u64;
            for i in 0..tables {
                let entry = (PT_BASE.0 + i * SIZE_4KIB) | TABLE_ENTRY_FLAGS;
                mem.write_slice(&entry.to_le_bytes(), GuestAddress(PD_ADDR.0 + i * 8))?;
            }

            let load_addr = PT_BASE.0 + tables * SIZE_4KIB;
            let mut frame = load_addr;
            'fill: for i in 0..tables {
                let pt = PT_BASE.0 + i * SIZE_4KIB;
                for j in 0..PT_ENTRIES {
                    if frame + SIZE_4KIB > mem_size as u64 {
                        break 'fill;
                    }
                    let entry = frame | TABLE_ENTRY_FLAGS;
                    mem.write_slice(&entry.to_le_bytes(), GuestAddress(pt + j * 8))?;
                    frame += SIZE_4KIB;
                }
            }
            Ok(load_addr)
        }
    }
}

/// Writes the paging structures and programs the special registers for
/// 64-bit execution. Returns the image load address.
pub fn setup_long_mode(
    vcpu: &VcpuFd,
    mem: &GuestMemoryMmap<()>,
    mem_size: usize,
    page_size: PageSize,
) -> Result<u64> {
    let load_addr = write_page_tables(mem, mem_size, page_size)?;

    // Special registers (control & segment registers) for entering long mode.
    let mut sregs = vcpu.get_sregs()?;
    sregs.cr3 = PML4_ADDR.0; // CR3 = physical address of the PML4 (page-table root)

    // CR4.PAE must be set to enable physical-address-extension paging required
    // by 64-bit mode page tables.
    sregs.cr4 |= CR4_PAE;

    // CR0: enable protected mode (PE) and paging (PG).
    sregs.cr0 |= CR0_PE | CR0_PG;

    // EFER.LME enables Long Mode; EFER.LMA indicates Long Mode Active.
    sregs.efer |= EFER_LME | EFER_LMA;

    // Flat 64-bit code segment.
    let code = kvm_segment {
        base: 0,
        limit: 0xffffffff,
        type_: CS_TYPE, // executable, read, accessed
        present: 1,
        dpl: 0,
        db: 0, // DB = 0 => default operand size is 32-bit (unused in 64-bit)
        s: 1,  // S = 1 => code/data descriptor (not system)
        l: 1,  // L bit = 1 => 64-bit code segment
        g: 1,
        ..Default::default()
    };
    sregs.cs = code;

    // Data, extra, FS, GS and stack share the descriptor, writable type.
    let data = kvm_segment {
        type_: DS_TYPE, // read/write, accessed
        ..code
    };
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;

    vcpu.set_sregs(&sregs)?;

    Ok(load_addr)
}

/// Resets the general-purpose registers for guest entry: everything
/// zeroed, reserved RFLAGS bit set, stack top at guest-virtual 2 MiB.
pub fn setup_registers(vcpu: &VcpuFd) -> Result<()> {
    let regs = kvm_regs {
        rflags: RFLAGS_RESERVED,
        rip: 0,
        rsp: 1 << 21,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;

    Ok(())
}
