use std::{ops::Range, sync::RwLock};

use thiserror::Error;

use crate::GuestPhysAddr;

#[derive(Error, Debug)]
pub enum MemoryError {
	#[error("Memory bounds exceeded")]
	BoundsViolation,
}

/// Access to the guest-physical address space.
///
/// Accesses may have any alignment. Implementations must fail with
/// [`MemoryError::BoundsViolation`] rather than touch memory outside the guest.
pub trait GuestMemory: Send + Sync {
	fn read(&self, addr: GuestPhysAddr, buf: &mut [u8]) -> Result<(), MemoryError>;

	fn write(&self, addr: GuestPhysAddr, data: &[u8]) -> Result<(), MemoryError>;

	fn read_u16(&self, addr: GuestPhysAddr) -> Result<u16, MemoryError> {
		let mut buf = [0; 2];
		self.read(addr, &mut buf)?;
		Ok(u16::from_le_bytes(buf))
	}

	fn read_u32(&self, addr: GuestPhysAddr) -> Result<u32, MemoryError> {
		let mut buf = [0; 4];
		self.read(addr, &mut buf)?;
		Ok(u32::from_le_bytes(buf))
	}

	fn write_u16(&self, addr: GuestPhysAddr, val: u16) -> Result<(), MemoryError> {
		self.write(addr, &val.to_le_bytes())
	}

	fn write_u32(&self, addr: GuestPhysAddr, val: u32) -> Result<(), MemoryError> {
		self.write(addr, &val.to_le_bytes())
	}
}

/// Plain heap-backed guest RAM starting at guest-physical address 0.
#[derive(Debug)]
pub struct GuestRam {
	mem: RwLock<Vec<u8>>,
}

impl GuestRam {
	pub fn new(size: usize) -> Self {
		Self {
			mem: RwLock::new(vec![0; size]),
		}
	}

	pub fn size(&self) -> usize {
		self.mem.read().map(|m| m.len()).unwrap_or(0)
	}

	fn range(addr: GuestPhysAddr, len: usize, size: usize) -> Result<Range<usize>, MemoryError> {
		let start = usize::try_from(addr.as_u64()).map_err(|_| MemoryError::BoundsViolation)?;
		let end = start.checked_add(len).ok_or(MemoryError::BoundsViolation)?;
		if end > size {
			return Err(MemoryError::BoundsViolation);
		}
		Ok(start..end)
	}
}

impl GuestMemory for GuestRam {
	fn read(&self, addr: GuestPhysAddr, buf: &mut [u8]) -> Result<(), MemoryError> {
		let mem = self.mem.read().map_err(|_| MemoryError::BoundsViolation)?;
		let range = Self::range(addr, buf.len(), mem.len())?;
		buf.copy_from_slice(&mem[range]);
		Ok(())
	}

	fn write(&self, addr: GuestPhysAddr, data: &[u8]) -> Result<(), MemoryError> {
		let mut mem = self.mem.write().map_err(|_| MemoryError::BoundsViolation)?;
		let range = Self::range(addr, data.len(), mem.len())?;
		mem[range].copy_from_slice(data);
		Ok(())
	}
}
