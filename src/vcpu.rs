//! Guest register state as seen by the exit handlers.

use std::{collections::HashMap, fmt};

use x86_64::registers::control::{Cr0Flags, Cr4Flags};

pub use crate::arch::ProcControls;
use crate::stats::CpuStats;

/// Index of a virtual CPU in the VM's arena. Index 0 is the bootstrap
/// processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuId(usize);

impl VcpuId {
	pub const BSP: Self = Self(0);

	pub const fn new(index: usize) -> Self {
		Self(index)
	}

	pub const fn index(self) -> usize {
		self.0
	}
}

impl From<usize> for VcpuId {
	fn from(index: usize) -> Self {
		Self(index)
	}
}

impl fmt::Display for VcpuId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "vCPU {}", self.0)
	}
}

/// General purpose registers in the order of their x86 encoding, as used by
/// ModRM and the CR access exit qualification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
	Rax = 0,
	Rcx = 1,
	Rdx = 2,
	Rbx = 3,
	Rsp = 4,
	Rbp = 5,
	Rsi = 6,
	Rdi = 7,
}

impl Gpr {
	pub const ALL: [Gpr; 8] = [
		Gpr::Rax,
		Gpr::Rcx,
		Gpr::Rdx,
		Gpr::Rbx,
		Gpr::Rsp,
		Gpr::Rbp,
		Gpr::Rsi,
		Gpr::Rdi,
	];

	pub fn from_index(index: u8) -> Option<Self> {
		Self::ALL.get(usize::from(index)).copied()
	}
}

/// VMCS fields touched by the exit handlers, with their architectural
/// encodings (Intel SDM Vol. 3d Appendix B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VmcsField {
	GuestCsSelector = 0x0802,
	GuestPhysicalAddress = 0x2400,
	ProcBasedControls = 0x4002,
	EntryInterruptionInfo = 0x4016,
	EntryExceptionErrorCode = 0x4018,
	EntryInstructionLength = 0x401a,
	ExitReason = 0x4402,
	ExitInstructionLength = 0x440c,
	GuestGdtrLimit = 0x4810,
	GuestIdtrLimit = 0x4812,
	GuestInterruptibility = 0x4824,
	GuestActivityState = 0x4826,
	Cr0GuestHostMask = 0x6000,
	Cr4GuestHostMask = 0x6002,
	Cr0ReadShadow = 0x6004,
	Cr4ReadShadow = 0x6006,
	ExitQualification = 0x6400,
	GuestLinearAddress = 0x640a,
	GuestCr0 = 0x6800,
	GuestCr3 = 0x6802,
	GuestCr4 = 0x6804,
	GuestCsBase = 0x6808,
	GuestGdtrBase = 0x6816,
	GuestIdtrBase = 0x6818,
	GuestRip = 0x681e,
	GuestRflags = 0x6820,
}

/// Access to the register file of one virtual CPU.
///
/// Implemented by the hypervisor backend. Reads and writes are expected
/// to hit a cached copy that is synchronized on VM entry.
pub trait VcpuState {
	fn read_vmcs(&self, field: VmcsField) -> u64;

	fn write_vmcs(&mut self, field: VmcsField, value: u64);

	fn read_register(&self, reg: Gpr) -> u64;

	fn write_register(&mut self, reg: Gpr, value: u64);

	fn rip(&self) -> u64 {
		self.read_vmcs(VmcsField::GuestRip)
	}

	fn set_rip(&mut self, rip: u64) {
		self.write_vmcs(VmcsField::GuestRip, rip);
	}

	fn rflags(&self) -> u64 {
		self.read_vmcs(VmcsField::GuestRflags)
	}

	fn proc_controls(&self) -> ProcControls {
		ProcControls::from_bits_retain(self.read_vmcs(VmcsField::ProcBasedControls))
	}

	fn set_proc_controls(&mut self, controls: ProcControls) {
		self.write_vmcs(VmcsField::ProcBasedControls, controls.bits());
	}

	/// Advances RIP past the instruction that caused the exit.
	fn skip_instruction(&mut self) {
		let len = self.read_vmcs(VmcsField::ExitInstructionLength);
		let rip = self.rip();
		self.set_rip(rip + len);
	}
}

/// A purely software register file.
///
/// Used by tests and by backends that marshal guest state through
/// messages rather than a real VMCS.
#[derive(Debug, Clone, Default)]
pub struct SoftVcpuState {
	vmcs: HashMap<VmcsField, u64>,
	gprs: [u64; 8],
}

impl SoftVcpuState {
	pub fn new() -> Self {
		Self::default()
	}
}

impl VcpuState for SoftVcpuState {
	fn read_vmcs(&self, field: VmcsField) -> u64 {
		self.vmcs.get(&field).copied().unwrap_or(0)
	}

	fn write_vmcs(&mut self, field: VmcsField, value: u64) {
		self.vmcs.insert(field, value);
	}

	fn read_register(&self, reg: Gpr) -> u64 {
		self.gprs[reg as usize]
	}

	fn write_register(&mut self, reg: Gpr, value: u64) {
		self.gprs[reg as usize] = value;
	}
}

/// Control register virtualization state.
///
/// Bits set in a mask are owned by the host: the guest reads them from the
/// shadow while the real register carries the host bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrVirtState {
	pub cr0_shadow: u64,
	pub cr0_mask: u64,
	pub cr0_host_bits: u64,
	pub cr4_shadow: u64,
	pub cr4_mask: u64,
	pub cr4_host_bits: u64,
	/// CR3 written by the guest before it enabled paging
	pub cr3_guest: u64,
}

impl Default for CrVirtState {
	fn default() -> Self {
		let cr0 = (Cr0Flags::PAGING | Cr0Flags::PROTECTED_MODE_ENABLE).bits();
		Self {
			cr0_shadow: 0,
			cr0_mask: cr0,
			cr0_host_bits: cr0,
			cr4_shadow: 0,
			cr4_mask: Cr4Flags::PAGE_SIZE_EXTENSION.bits(),
			cr4_host_bits: (Cr4Flags::PAGE_SIZE_EXTENSION
				| Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS)
				.bits(),
			cr3_guest: 0,
		}
	}
}

impl CrVirtState {
	pub fn paging_enabled(&self) -> bool {
		self.cr0_shadow & Cr0Flags::PAGING.bits() != 0
	}

	/// Loads the masks and host bits into the VMCS and the real registers.
	pub fn apply<S: VcpuState>(&self, state: &mut S) {
		state.write_vmcs(VmcsField::Cr0GuestHostMask, self.cr0_mask);
		state.write_vmcs(VmcsField::Cr4GuestHostMask, self.cr4_mask);
		state.write_vmcs(VmcsField::Cr0ReadShadow, self.cr0_shadow);
		state.write_vmcs(VmcsField::Cr4ReadShadow, self.cr4_shadow);
		state.write_vmcs(VmcsField::GuestCr0, self.cr0_host_bits);
		state.write_vmcs(VmcsField::GuestCr4, self.cr4_host_bits);
	}
}

/// One virtual CPU: the backend register file plus the bookkeeping the
/// exit handlers need.
#[derive(Debug)]
pub struct Vcpu<S: VcpuState> {
	pub(crate) id: VcpuId,
	pub(crate) state: S,
	pub(crate) cr: CrVirtState,
	/// Blocked in HLT until an interrupt arrives
	pub(crate) halted: bool,
	pub(crate) online: bool,
	pub(crate) stats: Option<CpuStats>,
}

impl<S: VcpuState> Vcpu<S> {
	pub fn new(id: VcpuId, mut state: S, stats: bool) -> Self {
		let cr = CrVirtState::default();
		cr.apply(&mut state);
		// the guest starts in real mode and CR3 accesses are cached until
		// paging is enabled
		let controls =
			state.proc_controls() | ProcControls::CR3_LOAD_EXITING | ProcControls::CR3_STORE_EXITING;
		state.set_proc_controls(controls);
		Self {
			id,
			state,
			cr,
			halted: false,
			online: id == VcpuId::BSP,
			stats: stats.then(|| CpuStats::new(id.index())),
		}
	}

	pub fn id(&self) -> VcpuId {
		self.id
	}

	pub fn state(&self) -> &S {
		&self.state
	}

	pub fn state_mut(&mut self) -> &mut S {
		&mut self.state
	}

	pub fn cr(&self) -> &CrVirtState {
		&self.cr
	}

	pub fn is_halted(&self) -> bool {
		self.halted
	}

	/// Application processors come online with their start-up IPI, any vCPU
	/// goes offline on a fatal exit.
	pub fn is_online(&self) -> bool {
		self.online
	}

	pub fn stats(&self) -> Option<&CpuStats> {
		self.stats.as_ref()
	}

	/// Hands out the collected statistics, stopping the runtime clock.
	pub fn take_stats(&mut self) -> Option<CpuStats> {
		let mut stats = self.stats.take()?;
		stats.stop_time_measurement();
		Some(stats)
	}
}
