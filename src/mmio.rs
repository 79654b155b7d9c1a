//! Guest-physical ranges that are emulated instead of backed by RAM.
//!
//! Accesses to them trap as EPT violations. The exit handler decodes the
//! faulting instruction and forwards it to the device registered for the
//! range.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{GuestPhysAddr, interrupt::InterruptRouter, vcpu::VcpuId};

#[derive(Error, Debug)]
pub enum MmioError {
	#[error("Empty MMIO range {start:#x}..{end:#x}")]
	EmptyRange { start: u64, end: u64 },
	#[error("MMIO access width {0} is not supported")]
	InvalidWidth(usize),
	#[error("MMIO access from unknown vcpu {0}")]
	UnknownVcpu(usize),
	#[error("Device {name} failed: {reason}")]
	Device { name: &'static str, reason: String },
}

/// Direction of a trapped access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioAccess {
	Read,
	Write(u32),
}

/// An emulated device behind a range of guest-physical addresses.
///
/// `offset` is relative to the start of the registered range and `width` is
/// 1, 2 or 4 bytes. Reads return the value in the low `width` bytes.
pub trait MmioDevice: Send + Sync {
	fn read(&self, vcpu: VcpuId, offset: u64, width: usize) -> Result<u32, MmioError>;

	fn write(&self, vcpu: VcpuId, offset: u64, width: usize, value: u32) -> Result<(), MmioError>;
}

/// A registered range `[start, end)`.
#[derive(Clone)]
pub struct MmioRange {
	pub start: GuestPhysAddr,
	pub end: GuestPhysAddr,
	pub name: &'static str,
	device: Arc<dyn MmioDevice>,
}

impl fmt::Debug for MmioRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MmioRange")
			.field("start", &format_args!("{:#x}", self.start.as_u64()))
			.field("end", &format_args!("{:#x}", self.end.as_u64()))
			.field("name", &self.name)
			.finish()
	}
}

impl MmioRange {
	pub fn contains(&self, addr: GuestPhysAddr) -> bool {
		self.start <= addr && addr < self.end
	}

	/// Forwards an access at `addr` to the device. Writes return 0.
	pub fn access(
		&self,
		vcpu: VcpuId,
		addr: GuestPhysAddr,
		width: usize,
		access: MmioAccess,
	) -> Result<u32, MmioError> {
		if !matches!(width, 1 | 2 | 4) {
			return Err(MmioError::InvalidWidth(width));
		}
		let offset = addr.as_u64() - self.start.as_u64();
		match access {
			MmioAccess::Read => self.device.read(vcpu, offset, width),
			MmioAccess::Write(value) => {
				self.device.write(vcpu, offset, width, value)?;
				Ok(0)
			}
		}
	}
}

/// Ranges ordered by their start address.
///
/// Overlaps are not rejected. When ranges overlap, the one that comes first
/// in start order wins, and among equal starts the one registered first.
#[derive(Debug, Default)]
pub struct MmioDispatchTable {
	ranges: Vec<MmioRange>,
}

impl MmioDispatchTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_range(
		&mut self,
		start: GuestPhysAddr,
		end: GuestPhysAddr,
		name: &'static str,
		device: Arc<dyn MmioDevice>,
	) -> Result<(), MmioError> {
		if end <= start {
			return Err(MmioError::EmptyRange {
				start: start.as_u64(),
				end: end.as_u64(),
			});
		}
		debug!(
			"Register MMIO range {name}: {:#x}..{:#x}",
			start.as_u64(),
			end.as_u64()
		);
		let idx = self.ranges.partition_point(|r| r.start <= start);
		self.ranges.insert(
			idx,
			MmioRange {
				start,
				end,
				name,
				device,
			},
		);
		Ok(())
	}

	pub fn find(&self, addr: GuestPhysAddr) -> Option<&MmioRange> {
		self.ranges
			.iter()
			.take_while(|r| r.start <= addr)
			.find(|r| r.contains(addr))
	}

	pub fn len(&self) -> usize {
		self.ranges.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ranges.is_empty()
	}
}

/// The local APIC register page. Every vCPU sees its own APIC behind the
/// same window.
#[derive(Debug, Clone)]
pub struct ApicMmio {
	router: Arc<InterruptRouter>,
}

impl ApicMmio {
	pub fn new(router: Arc<InterruptRouter>) -> Self {
		Self { router }
	}
}

impl MmioDevice for ApicMmio {
	fn read(&self, vcpu: VcpuId, offset: u64, width: usize) -> Result<u32, MmioError> {
		let apic = self
			.router
			.apic(vcpu)
			.map_err(|_| MmioError::UnknownVcpu(vcpu.index()))?;
		match apic.read(offset, width) {
			Ok(val) => Ok(val),
			Err(e) => {
				warn!("{vcpu}: {e}");
				Ok(0)
			}
		}
	}

	fn write(&self, vcpu: VcpuId, offset: u64, width: usize, value: u32) -> Result<(), MmioError> {
		let ipi = {
			let mut apic = self
				.router
				.apic(vcpu)
				.map_err(|_| MmioError::UnknownVcpu(vcpu.index()))?;
			let ipi = apic.write(offset, width, value);
			// the exit handler re-evaluates this vCPU after the access
			apic.take_eval_request();
			ipi
		};
		match ipi {
			Ok(Some(ipi)) => {
				self.router.deliver_ipi(vcpu, ipi);
			}
			Ok(None) => {}
			Err(e) => warn!("{vcpu}: {e}"),
		}
		Ok(())
	}
}
