//! Interprocessor interrupt messages as encoded in the ICR.

/// Delivery mode field, ICR bits 8..11.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
	Fixed,
	LowestPriority,
	Smi,
	RemoteRead,
	Nmi,
	Init,
	Startup,
	ExtInt,
}

impl From<u32> for DeliveryMode {
	fn from(icr: u32) -> Self {
		match (icr >> 8) & 0x7 {
			0 => Self::Fixed,
			1 => Self::LowestPriority,
			2 => Self::Smi,
			3 => Self::RemoteRead,
			4 => Self::Nmi,
			5 => Self::Init,
			6 => Self::Startup,
			_ => Self::ExtInt,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationMode {
	Physical,
	Logical,
}

/// Destination shorthand, ICR bits 18..20.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shorthand {
	None,
	SelfOnly,
	AllIncludingSelf,
	AllButSelf,
}

impl From<u32> for Shorthand {
	fn from(icr: u32) -> Self {
		match (icr >> 18) & 0x3 {
			0 => Self::None,
			1 => Self::SelfOnly,
			2 => Self::AllIncludingSelf,
			_ => Self::AllButSelf,
		}
	}
}

/// A decoded ICR write, ready to be routed to its destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipi {
	pub vector: u8,
	pub mode: DeliveryMode,
	pub dest_mode: DestinationMode,
	/// Level bit, de-asserted only for INIT level de-assert.
	pub level: bool,
	/// `true` for level triggered.
	pub trigger: bool,
	pub shorthand: Shorthand,
	/// Destination field from ICR2 bits 24..32.
	pub dest: u8,
}

impl Ipi {
	pub fn from_icr(icr: u32, icr2: u32) -> Self {
		Self {
			vector: (icr & 0xff) as u8,
			mode: DeliveryMode::from(icr),
			dest_mode: if icr & (1 << 11) != 0 {
				DestinationMode::Logical
			} else {
				DestinationMode::Physical
			},
			level: icr & (1 << 14) != 0,
			trigger: icr & (1 << 15) != 0,
			shorthand: Shorthand::from(icr),
			dest: (icr2 >> 24) as u8,
		}
	}
}
