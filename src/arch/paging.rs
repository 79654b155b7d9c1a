use align_address::Align;
use x86_64::structures::paging::PageTableFlags;

use crate::{
	GuestPhysAddr, GuestVirtAddr,
	consts::{LARGE_PAGE_SIZE, PAGE_SIZE},
	mem::GuestMemory,
	paging::PagetableError,
};

/// Number of Offset bits of a virtual address for a 4 KiB page.
const PAGE_BITS: u64 = 12;
/// Number of Offset bits of a virtual address for a 4 MiB page.
const LARGE_PAGE_BITS: u64 = 22;
/// Number of bits of the index in each table (PD, PT).
const PAGE_MAP_BITS: u64 = 10;
const ENTRY_SIZE: u64 = 4;

/// Converts a virtual address in the guest to a physical address in the guest
///
/// Walks the 2-level non-PAE page directory rooted at `cr3`. 4 MiB entries
/// are honoured whenever their PS bit is set.
pub fn virt_to_phys(
	addr: GuestVirtAddr,
	mem: &(impl GuestMemory + ?Sized),
	cr3: u64,
) -> Result<GuestPhysAddr, PagetableError> {
	let addr = addr.as_u64() & 0xffff_ffff;
	let index_mask = (1 << PAGE_MAP_BITS) - 1;

	let pd = cr3 & 0xffff_f000;
	let pde_addr = pd + (addr >> LARGE_PAGE_BITS) * ENTRY_SIZE;
	let pde = u64::from(mem.read_u32(GuestPhysAddr::new(pde_addr))?);
	let flags = PageTableFlags::from_bits_truncate(pde);
	if !flags.contains(PageTableFlags::PRESENT) {
		return Err(PagetableError::InvalidAddress);
	}

	if flags.contains(PageTableFlags::HUGE_PAGE) {
		let frame = pde.align_down(LARGE_PAGE_SIZE) & 0xffff_ffff;
		return Ok(GuestPhysAddr::new(frame + (addr & (LARGE_PAGE_SIZE - 1))));
	}

	let pt = pde & 0xffff_f000;
	let pte_addr = pt + ((addr >> PAGE_BITS) & index_mask) * ENTRY_SIZE;
	let pte = u64::from(mem.read_u32(GuestPhysAddr::new(pte_addr))?);
	if !PageTableFlags::from_bits_truncate(pte).contains(PageTableFlags::PRESENT) {
		return Err(PagetableError::InvalidAddress);
	}

	Ok(GuestPhysAddr::new((pte & 0xffff_f000) + (addr & (PAGE_SIZE - 1))))
}

/// Writes a page directory at `pd` that identity maps the first `length`
/// bytes of guest memory with 4 MiB pages.
pub fn initialize_pagetables(
	mem: &(impl GuestMemory + ?Sized),
	pd: GuestPhysAddr,
	length: u64,
) -> Result<(), PagetableError> {
	let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::HUGE_PAGE;
	let entries = length.div_ceil(LARGE_PAGE_SIZE).min(1 << PAGE_MAP_BITS);
	for i in 0..entries {
		let entry = (i * LARGE_PAGE_SIZE) | flags.bits();
		mem.write_u32(pd + i * ENTRY_SIZE, entry as u32)?;
	}
	Ok(())
}
