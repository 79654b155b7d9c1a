//! Guest I/O port space.
//!
//! Ports are looked up in a table of inclusive ranges. Each range names the
//! endpoint that serves it and whether the access is forwarded (catch) or
//! left to real hardware (passthrough).

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IoPortError {
	#[error("Invalid I/O port range {start:#x}-{end:#x}")]
	InvalidRange { start: u16, end: u16 },
	#[error("I/O port range {start:#x}-{end:#x} overlaps {name}")]
	Overlap {
		start: u16,
		end: u16,
		name: &'static str,
	},
	#[error("I/O access of {0} bytes is not supported")]
	InvalidSize(usize),
	#[error("{0}")]
	Backend(String),
}

/// Who serves a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEndpoint {
	/// Nobody. Reads return all ones, writes are dropped.
	Ignore,
	/// The VM's 8259 pair and its ELCR.
	InterruptController,
	/// PCI configuration mechanism #1, forwarded to the I/O backend.
	PciConfig,
	/// Owned by a host device, forwarded to the I/O backend.
	Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
	/// The access is emulated by the endpoint.
	Catch,
	/// The guest talks to the real device. Nothing to emulate on an exit.
	Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPortRange {
	pub start: u16,
	/// Last port of the range, inclusive
	pub end: u16,
	pub endpoint: IoEndpoint,
	pub mode: PortMode,
	pub name: &'static str,
}

impl IoPortRange {
	pub const fn new(
		start: u16,
		end: u16,
		endpoint: IoEndpoint,
		mode: PortMode,
		name: &'static str,
	) -> Self {
		Self {
			start,
			end,
			endpoint,
			mode,
			name,
		}
	}

	pub fn contains(&self, port: u16) -> bool {
		self.start <= port && port <= self.end
	}

	fn overlaps(&self, start: u16, end: u16) -> bool {
		self.start <= end && start <= self.end
	}
}

use IoEndpoint::*;
use PortMode::*;

/// The PC legacy port map.
///
/// Some entries overlap. Lookup takes the first match.
pub const LEGACY_IOPORT_MAP: &[IoPortRange] = &[
	IoPortRange::new(0x3f8, 0x3ff, Ignore, Passthrough, "COM1 Serial Port"),
	IoPortRange::new(0x2f8, 0x2ff, Ignore, Passthrough, "COM2 Serial Port"),
	IoPortRange::new(0x3e8, 0x3ef, Ignore, Passthrough, "COM3 Serial Port"),
	IoPortRange::new(0x2e8, 0x2ef, Ignore, Passthrough, "COM4 Serial Port"),
	IoPortRange::new(0x20, 0x21, InterruptController, Catch, "8259 Master PIC"),
	IoPortRange::new(0xa0, 0xa1, InterruptController, Catch, "8259 Slave PIC"),
	IoPortRange::new(0x4d0, 0x4d1, InterruptController, Catch, "ELCR (edge/level control register) for IRQ line"),
	IoPortRange::new(0xcf8, 0xcff, PciConfig, Catch, "PCI Configuration Space"),
	IoPortRange::new(0x70, 0x7f, Ignore, Passthrough, "CMOS Registers"),
	IoPortRange::new(0x40, 0x5f, Ignore, Passthrough, "PIT Timer"),
	IoPortRange::new(0x60, 0x64, Ignore, Passthrough, "PS/2 Controller"),
	IoPortRange::new(0x100, 0x10f, Ignore, Passthrough, "POS Programmable Option Select (PS/2)"),
	IoPortRange::new(0xc000, 0xf000, Ignore, Catch, "PCI device IO space"),
	IoPortRange::new(0x1060, 0x1070, Ignore, Catch, "IDE controller"),
	IoPortRange::new(0x1f0, 0x1f8, Ignore, Catch, "Primary ATA hard disk"),
	IoPortRange::new(0x170, 0x178, Ignore, Catch, "Secondary ATA hard disk"),
	IoPortRange::new(0x3f6, 0x3f7, Ignore, Catch, "Primary ATA hard disk control"),
	IoPortRange::new(0x376, 0x377, Ignore, Catch, "Secondary ATA hard disk control"),
	IoPortRange::new(0x3b0, 0x3df, Ignore, Passthrough, "IBM VGA"),
	IoPortRange::new(0x80, 0x80, Ignore, Catch, "DMA Page Register"),
];

/// Port table of one VM.
#[derive(Debug, Clone, Default)]
pub struct IoPortMap {
	ranges: Vec<IoPortRange>,
}

impl IoPortMap {
	pub fn new() -> Self {
		Self::default()
	}

	/// A map holding [`LEGACY_IOPORT_MAP`].
	pub fn legacy() -> Self {
		Self {
			ranges: LEGACY_IOPORT_MAP.to_vec(),
		}
	}

	/// Adds a range that must not overlap any existing one.
	pub fn add_range(&mut self, range: IoPortRange) -> Result<(), IoPortError> {
		if range.end < range.start {
			return Err(IoPortError::InvalidRange {
				start: range.start,
				end: range.end,
			});
		}
		if let Some(other) = self
			.ranges
			.iter()
			.find(|r| r.overlaps(range.start, range.end))
		{
			return Err(IoPortError::Overlap {
				start: range.start,
				end: range.end,
				name: other.name,
			});
		}
		debug!(
			"Register I/O ports {:#x}-{:#x} ({})",
			range.start, range.end, range.name
		);
		self.ranges.push(range);
		Ok(())
	}

	pub fn lookup(&self, port: u16) -> Option<&IoPortRange> {
		self.ranges.iter().find(|r| r.contains(port))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
	In,
	Out,
}

/// One port access forwarded to an [`IoBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
	pub port: u16,
	pub direction: IoDirection,
	/// 1, 2 or 4 bytes
	pub size: usize,
	/// Value written by an `out`, 0 for an `in`
	pub value: u32,
}

impl IoRequest {
	/// Mask covering the access size.
	pub fn mask(&self) -> u32 {
		match self.size {
			4 => u32::MAX,
			size => (1 << (size * 8)) - 1,
		}
	}
}

/// Host side of the caught ports that are not emulated here, for example PCI
/// configuration space.
///
/// Called synchronously from the exiting vCPU's thread. The returned value
/// of an `in` is masked to the access size by the caller.
pub trait IoBackend: Send + Sync {
	fn handle_io(&self, endpoint: IoEndpoint, request: IoRequest) -> Result<u32, IoPortError>;
}
