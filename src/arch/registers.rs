//! Control register and VM-execution control bits the exit handlers care about.
//! See Intel Vol. 3a Section 2.5, especially Figure 2-7, and Vol. 3c Table 24-6.

use bitflags::bitflags;
use x86_64::registers::control::Cr0Flags;

bitflags! {
	/// CR4 bits a guest may set.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct Cr4: u64 {
		/// If set, enables support for the virtual interrupt flag (VIF) in virtual-8086 mode.
		const VME = 1 << 0;
		/// If set, enables support for the virtual interrupt flag (VIF) in protected mode.
		const PVI = 1 << 1;
		/// If set, disables ability to take time-stamps.
		const TSD = 1 << 2;
		/// If set, enables debug register based breaks on I/O space access.
		const DE = 1 << 3;
		/// Enable Page Size Extensions (4 MiB pages in 32-bit paging).
		const PSE = 1 << 4;
		/// Enable Physical Address Extension.
		const PAE = 1 << 5;
		/// Enable machine check interrupts.
		const MCE = 1 << 6;
		/// Enable shared (PDE or PTE) address translation between address spaces.
		const PGE = 1 << 7;
		/// Enable Performance-Monitoring Counters
		const PCE = 1 << 8;
		/// Enables SSE instructions and fast FPU save & restore.
		const OSFXSR = 1 << 9;
		/// Enables unmasked SSE exceptions.
		const OSXMMEXCPT = 1 << 10;
		/// Enables Virtual Machine Extensions.
		const VMXE = 1 << 13;
		/// Enables the instructions RDFSBASE, RDGSBASE, WRFSBASE, and WRGSBASE.
		const FSGSBASE = 1 << 16;
		/// Enables process-context identifiers (PCIDs).
		const PCIDE = 1 << 17;
		/// Enable XSAVE and Processor Extended States.
		const OSXSAVE = 1 << 18;
		/// Enable Supervisor Mode Execution Protection.
		const SMEP = 1 << 20;
	}
}

bitflags! {
	/// Primary processor-based VM-execution controls.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ProcControls: u64 {
		const INTERRUPT_WINDOW_EXITING = 1 << 2;
		const HLT_EXITING = 1 << 7;
		const CR3_LOAD_EXITING = 1 << 15;
		const CR3_STORE_EXITING = 1 << 16;
	}
}

/// CR0 bits no guest may set.
pub fn cr0_reserved_bits(value: u64) -> u64 {
	value & !Cr0Flags::all().bits() & 0xffff_ffff
}

/// CR4 bits no guest may set.
pub fn cr4_reserved_bits(value: u64) -> u64 {
	value & !Cr4::all().bits()
}

/// Merges a guest control register value with the host-owned bits.
///
/// Bits set in `mask` are owned by the host and taken from `host_bits`, the
/// rest come from `value`.
#[inline]
pub fn apply_shadow(value: u64, mask: u64, host_bits: u64) -> u64 {
	(value & !mask) | (host_bits & mask)
}
