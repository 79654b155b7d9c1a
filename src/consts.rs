use crate::GuestPhysAddr;

pub const PAGE_SIZE: u64 = 0x1000;
/// 4 MiB leaf pages of the non-PAE 2-level page table (CR4.PSE).
pub const LARGE_PAGE_SIZE: u64 = 0x40_0000;

pub const APIC_DEFAULT_BASE: u64 = 0xfee00000;
pub const APIC_DEFAULT_PHYS_BASE: GuestPhysAddr = GuestPhysAddr::new(APIC_DEFAULT_BASE);
pub const APIC_MMIO_SIZE: u64 = 0x1000;

/// Architectural upper bound of one x86 instruction.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;
/// Bytes fetched from an AP start-up trampoline before emulating it.
pub const TRAMPOLINE_LENGTH: usize = 100;

pub const PIC_MASTER_COMMAND: u16 = 0x20;
pub const PIC_MASTER_DATA: u16 = 0x21;
pub const PIC_SLAVE_COMMAND: u16 = 0xa0;
pub const PIC_SLAVE_DATA: u16 = 0xa1;
pub const PIC_ELCR_MASTER: u16 = 0x4d0;
pub const PIC_ELCR_SLAVE: u16 = 0x4d1;
/// Lines 0, 1 and 2 of the master are always edge triggered.
pub const PIC_ELCR_MASK_MASTER: u8 = 0xf8;
/// Lines 8 and 13 are always edge triggered.
pub const PIC_ELCR_MASK_SLAVE: u8 = 0xde;
pub const PIC_NUM_PINS: usize = 16;
/// Number of distinct interrupt sources that may share one PIC pin.
pub const PIC_MAX_SOURCES: u8 = 64;

pub const IA32_APIC_BASE_BSP: u64 = 1 << 8;
pub const IA32_APIC_BASE_ENABLE: u64 = 1 << 11;

pub const EFLAGS_IF: u64 = 1 << 9;
