//! Register map of the local APIC MMIO page. See Intel SDM Vol. 3a Table 10-1.

use super::ApicError;

/// Version 0x14 (Xeon / Pentium 4) with six LVT entries.
pub const APIC_VERSION: u32 = 0x14 | ((APIC_LVT_NUM as u32 - 1) << 16);
pub const APIC_LVT_NUM: usize = 6;

pub const APIC_SPIV_APIC_ENABLED: u32 = 1 << 8;
pub const APIC_LVT_MASKED: u32 = 1 << 16;
pub const APIC_SEND_PENDING: u32 = 1 << 12;
pub const APIC_VECTOR_MASK: u32 = 0xff;
pub const APIC_MODE_MASK: u32 = 0x700;
pub const APIC_MODE_EXTINT: u32 = 0x7;
pub const APIC_INPUT_POLARITY: u32 = 1 << 13;
pub const APIC_LVT_REMOTE_IRR: u32 = 1 << 14;
pub const APIC_LVT_LEVEL_TRIGGER: u32 = 1 << 15;
pub const APIC_LDR_MASK: u32 = 0xff00_0000;
pub const APIC_DFR_FLAT: u32 = 0xffff_ffff;
pub const APIC_DFR_CLUSTER: u32 = 0x0fff_ffff;
/// ESR bit for a delivered vector below 16.
pub const APIC_ESR_RECV_ILLEGAL_VECTOR: u32 = 1 << 6;

const LVT_MASK: u32 = APIC_LVT_MASKED | APIC_SEND_PENDING | APIC_VECTOR_MASK;
const LINT_MASK: u32 =
	LVT_MASK | APIC_MODE_MASK | APIC_INPUT_POLARITY | APIC_LVT_REMOTE_IRR | APIC_LVT_LEVEL_TRIGGER;

/// Writable bits per LVT entry, in register order.
pub(super) const APIC_LVT_WRITE_MASK: [u32; APIC_LVT_NUM] = [
	LVT_MASK,
	LVT_MASK | APIC_MODE_MASK,
	LVT_MASK | APIC_MODE_MASK,
	LINT_MASK,
	LINT_MASK,
	LVT_MASK,
];

/// One bit per 16-byte register slot, cleared for every reserved or
/// write-only register.
const READABLE: u64 = 0x43ff_01ff_ffff_e70c;

/// Local vector table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lvt {
	Timer = 0,
	Thermal = 1,
	PerfCounter = 2,
	Lint0 = 3,
	Lint1 = 4,
	Error = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicRegister {
	Id,
	Version,
	TaskPriority,
	ArbitrationPriority,
	ProcessorPriority,
	Eoi,
	RemoteRead,
	LogicalDestination,
	DestinationFormat,
	SpuriousVector,
	/// In-service register word 0..8
	Isr(usize),
	/// Trigger mode register word 0..8
	Tmr(usize),
	/// Interrupt request register word 0..8
	Irr(usize),
	ErrorStatus,
	InterruptCommand,
	InterruptCommandHigh,
	Lvt(Lvt),
	TimerInitialCount,
	TimerCurrentCount,
	TimerDivideConfig,
}

impl ApicRegister {
	/// Whether the register may be read by the guest.
	pub fn readable(offset: u64) -> bool {
		offset <= 0x3f0 && READABLE & (1 << (offset >> 4)) != 0
	}
}

impl TryFrom<u64> for ApicRegister {
	type Error = ApicError;

	fn try_from(offset: u64) -> Result<Self, Self::Error> {
		let reg = match offset {
			0x20 => Self::Id,
			0x30 => Self::Version,
			0x80 => Self::TaskPriority,
			0x90 => Self::ArbitrationPriority,
			0xa0 => Self::ProcessorPriority,
			0xb0 => Self::Eoi,
			0xc0 => Self::RemoteRead,
			0xd0 => Self::LogicalDestination,
			0xe0 => Self::DestinationFormat,
			0xf0 => Self::SpuriousVector,
			0x100..=0x170 => Self::Isr(((offset - 0x100) >> 4) as usize),
			0x180..=0x1f0 => Self::Tmr(((offset - 0x180) >> 4) as usize),
			0x200..=0x270 => Self::Irr(((offset - 0x200) >> 4) as usize),
			0x280 => Self::ErrorStatus,
			0x300 => Self::InterruptCommand,
			0x310 => Self::InterruptCommandHigh,
			0x320 => Self::Lvt(Lvt::Timer),
			0x330 => Self::Lvt(Lvt::Thermal),
			0x340 => Self::Lvt(Lvt::PerfCounter),
			0x350 => Self::Lvt(Lvt::Lint0),
			0x360 => Self::Lvt(Lvt::Lint1),
			0x370 => Self::Lvt(Lvt::Error),
			0x380 => Self::TimerInitialCount,
			0x390 => Self::TimerCurrentCount,
			0x3e0 => Self::TimerDivideConfig,
			offset => return Err(ApicError::ReservedRegister(offset)),
		};
		Ok(reg)
	}
}
