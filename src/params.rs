use std::{
	env, fmt,
	num::{NonZeroU32, ParseIntError, TryFromIntError},
	str::FromStr,
};

use byte_unit::{Byte, Unit};
use thiserror::Error;

use crate::consts::PAGE_SIZE;

/// Environment switch that flips the default of [`Params::ignore_undefined_ioports`].
pub const IGNORE_IOPORTS_ENV: &str = "X86VMM_IGNORE_UNDEFINED_IOPORTS";

#[derive(Debug, Clone)]
pub struct Params {
	/// Guest RAM size
	pub memory_size: GuestMemorySize,

	/// Number of guest CPUs
	pub cpu_count: CpuCount,

	/// Reads of undefined I/O ports return all ones and writes are dropped,
	/// instead of taking the vCPU offline
	pub ignore_undefined_ioports: bool,

	/// Skip instructions that touch unmapped guest-physical memory instead of
	/// blocking the vCPU
	pub ignore_ept_violations: bool,

	/// Hardware-enable the local APICs at creation
	pub lapic_enabled: bool,

	/// Collect run statistics
	pub stats: bool,
}

impl Default for Params {
	fn default() -> Self {
		let ignore_undefined_ioports = env::var(IGNORE_IOPORTS_ENV)
			.map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
			.unwrap_or(true);
		Self {
			memory_size: Default::default(),
			cpu_count: Default::default(),
			ignore_undefined_ioports,
			ignore_ept_violations: false,
			lapic_enabled: true,
			stats: false,
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct CpuCount(NonZeroU32);

impl CpuCount {
	pub fn get(self) -> u32 {
		self.0.get()
	}
}

impl Default for CpuCount {
	fn default() -> Self {
		Self(NonZeroU32::MIN)
	}
}

impl fmt::Display for CpuCount {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

impl TryFrom<u32> for CpuCount {
	type Error = TryFromIntError;

	fn try_from(value: u32) -> Result<Self, Self::Error> {
		value.try_into().map(Self)
	}
}

impl FromStr for CpuCount {
	type Err = ParseIntError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let count = s.parse()?;
		Ok(Self(count))
	}
}

#[derive(Debug, Clone, Copy)]
pub struct GuestMemorySize(Byte);

impl GuestMemorySize {
	const fn minimum() -> Byte {
		let Some(byte) = Byte::from_u64_with_unit(1, Unit::MiB) else {
			panic!()
		};
		byte
	}

	const fn maximum() -> Byte {
		let Some(byte) = Byte::from_u64_with_unit(4, Unit::GiB) else {
			panic!()
		};
		byte
	}

	pub fn get(self) -> usize {
		// bounded by `maximum`
		self.0.as_u64() as usize
	}
}

impl Default for GuestMemorySize {
	fn default() -> Self {
		Self(Byte::from_u64(64 * 1024 * 1024))
	}
}

impl fmt::Display for GuestMemorySize {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

#[derive(Error, Debug)]
pub enum InvalidGuestMemorySizeError {
	#[error(
		"Not enough guest memory. Must be at least {min:#} (is {cur:#.3})",
		min = GuestMemorySize::minimum().get_adjusted_unit(Unit::MiB),
		cur = .0.get_adjusted_unit(Unit::MiB),
	)]
	MemoryTooSmall(Byte),
	#[error(
		"Too much guest memory for 32-bit paging. Must be at most {max:#} (is {cur:#.3})",
		max = GuestMemorySize::maximum().get_adjusted_unit(Unit::GiB),
		cur = .0.get_adjusted_unit(Unit::MiB),
	)]
	MemoryTooLarge(Byte),
	#[error(
		"Invalid amount of guest memory. Must be a multiple of 4 KiB (is {cur:#.3})",
		cur = .0.get_adjusted_unit(Unit::KiB),
	)]
	NotPageAligned(Byte),
}

impl TryFrom<Byte> for GuestMemorySize {
	type Error = InvalidGuestMemorySizeError;

	fn try_from(value: Byte) -> Result<Self, Self::Error> {
		if value < Self::minimum() {
			Err(InvalidGuestMemorySizeError::MemoryTooSmall(value))
		} else if value > Self::maximum() {
			Err(InvalidGuestMemorySizeError::MemoryTooLarge(value))
		} else if value.as_u64() % PAGE_SIZE != 0 {
			Err(InvalidGuestMemorySizeError::NotPageAligned(value))
		} else {
			Ok(Self(value))
		}
	}
}

#[derive(Error, Debug)]
pub enum ParseByteError {
	#[error(transparent)]
	Parse(#[from] byte_unit::ParseError),

	#[error(transparent)]
	InvalidMemorySize(#[from] InvalidGuestMemorySizeError),
}

impl FromStr for GuestMemorySize {
	type Err = ParseByteError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let requested = Byte::from_str(s)?;
		let memory_size = requested.try_into()?;
		Ok(memory_size)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_memory_size_bounds() {
		assert!(matches!(
			"512KiB".parse::<GuestMemorySize>(),
			Err(ParseByteError::InvalidMemorySize(
				InvalidGuestMemorySizeError::MemoryTooSmall(_)
			))
		));
		assert!(matches!(
			"8GiB".parse::<GuestMemorySize>(),
			Err(ParseByteError::InvalidMemorySize(
				InvalidGuestMemorySizeError::MemoryTooLarge(_)
			))
		));
		assert!(matches!(
			"1049000".parse::<GuestMemorySize>(),
			Err(ParseByteError::InvalidMemorySize(
				InvalidGuestMemorySizeError::NotPageAligned(_)
			))
		));
		let size: GuestMemorySize = "16MiB".parse().unwrap();
		assert_eq!(size.get(), 16 * 1024 * 1024);
	}

	#[test]
	fn test_cpu_count() {
		assert!("0".parse::<CpuCount>().is_err());
		assert_eq!("4".parse::<CpuCount>().unwrap().get(), 4);
		assert_eq!(CpuCount::default().get(), 1);
	}
}
