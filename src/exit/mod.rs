//! VM exit dispatch.
//!
//! The backend runs the guest until it exits, then calls
//! [`Vcpu::handle_exit`]. On success the instruction pointer has been
//! advanced past the emulated instruction and any pending interrupt has been
//! offered to the guest. An error takes the vCPU offline for good.

mod cpuid;
mod cr;
mod ept;
mod io;
mod msr;

use crate::{
	GuestPhysAddr,
	consts::TRAMPOLINE_LENGTH,
	decode::{
		fetch_instruction,
		realmode::{RealModeOutcome, emulate_realmode},
	},
	error::{HypervisorError, HypervisorResult},
	ioport::IoDirection,
	stats::ExitKind,
	vcpu::{Vcpu, VcpuState, VmcsField},
	vm::Vm,
};

/// Basic exit reasons handled here (Intel SDM Vol. 3d Appendix C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GuestExit {
	ExternalInterrupt = 1,
	InterruptWindow = 7,
	Cpuid = 10,
	Hlt = 12,
	CrAccess = 28,
	Io = 30,
	Rdmsr = 31,
	Wrmsr = 32,
	EptViolation = 48,
}

impl TryFrom<u32> for GuestExit {
	type Error = u32;

	fn try_from(reason: u32) -> Result<Self, Self::Error> {
		Ok(match reason {
			1 => Self::ExternalInterrupt,
			7 => Self::InterruptWindow,
			10 => Self::Cpuid,
			12 => Self::Hlt,
			28 => Self::CrAccess,
			30 => Self::Io,
			31 => Self::Rdmsr,
			32 => Self::Wrmsr,
			48 => Self::EptViolation,
			reason => return Err(reason),
		})
	}
}

/// Exit qualification of a control register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccess {
	MovTo { cr: u8, reg: u8 },
	MovFrom { cr: u8, reg: u8 },
	Clts,
	Lmsw,
}

impl From<u64> for CrAccess {
	fn from(qualification: u64) -> Self {
		let cr = (qualification & 0xf) as u8;
		let reg = ((qualification >> 8) & 0xf) as u8;
		match (qualification >> 4) & 0x3 {
			0 => Self::MovTo { cr, reg },
			1 => Self::MovFrom { cr, reg },
			2 => Self::Clts,
			_ => Self::Lmsw,
		}
	}
}

/// Exit qualification of an I/O instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoQualification {
	pub port: u16,
	/// 1, 2 or 4 bytes
	pub size: usize,
	pub direction: IoDirection,
	pub string: bool,
	pub rep: bool,
}

impl From<u64> for IoQualification {
	fn from(qualification: u64) -> Self {
		Self {
			port: (qualification >> 16) as u16,
			size: (qualification & 0x7) as usize + 1,
			direction: if qualification & (1 << 3) != 0 {
				IoDirection::In
			} else {
				IoDirection::Out
			},
			string: qualification & (1 << 4) != 0,
			rep: qualification & (1 << 5) != 0,
		}
	}
}

/// Exit qualification of an EPT violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptQualification {
	pub read: bool,
	pub write: bool,
	pub fetch: bool,
}

impl From<u64> for EptQualification {
	fn from(qualification: u64) -> Self {
		Self {
			read: qualification & (1 << 0) != 0,
			write: qualification & (1 << 1) != 0,
			fetch: qualification & (1 << 2) != 0,
		}
	}
}

/// A decoded VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
	ExternalInterrupt,
	InterruptWindow,
	Cpuid,
	Hlt,
	CrAccess(CrAccess),
	Io(IoQualification),
	Rdmsr,
	Wrmsr,
	EptViolation {
		gpa: GuestPhysAddr,
		qualification: EptQualification,
	},
	Unhandled(u32),
}

impl VmExit {
	/// Decodes the exit recorded in `state`.
	pub fn read<S: VcpuState>(state: &S) -> Self {
		let reason = (state.read_vmcs(VmcsField::ExitReason) & 0xffff) as u32;
		let qualification = state.read_vmcs(VmcsField::ExitQualification);
		match GuestExit::try_from(reason) {
			Ok(GuestExit::ExternalInterrupt) => Self::ExternalInterrupt,
			Ok(GuestExit::InterruptWindow) => Self::InterruptWindow,
			Ok(GuestExit::Cpuid) => Self::Cpuid,
			Ok(GuestExit::Hlt) => Self::Hlt,
			Ok(GuestExit::CrAccess) => Self::CrAccess(qualification.into()),
			Ok(GuestExit::Io) => Self::Io(qualification.into()),
			Ok(GuestExit::Rdmsr) => Self::Rdmsr,
			Ok(GuestExit::Wrmsr) => Self::Wrmsr,
			Ok(GuestExit::EptViolation) => Self::EptViolation {
				gpa: GuestPhysAddr::new(state.read_vmcs(VmcsField::GuestPhysicalAddress)),
				qualification: qualification.into(),
			},
			Err(reason) => Self::Unhandled(reason),
		}
	}

	pub fn kind(&self) -> ExitKind {
		match self {
			Self::ExternalInterrupt => ExitKind::ExternalInterrupt,
			Self::InterruptWindow => ExitKind::InterruptWindow,
			Self::Cpuid => ExitKind::Cpuid,
			Self::Hlt => ExitKind::Hlt,
			Self::CrAccess(_) => ExitKind::CrAccess,
			Self::Io(q) if q.direction == IoDirection::In => ExitKind::IoIn,
			Self::Io(_) => ExitKind::IoOut,
			Self::Rdmsr => ExitKind::Rdmsr,
			Self::Wrmsr => ExitKind::Wrmsr,
			Self::EptViolation { .. } => ExitKind::EptViolation,
			Self::Unhandled(_) => ExitKind::Other,
		}
	}
}

/// What the backend should do with the vCPU after an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
	/// Enter the guest again.
	Resume,
	/// The guest executed HLT and has nothing to do. Wait for a kick.
	Halted,
}

impl<S: VcpuState> Vcpu<S> {
	pub fn handle_exit(&mut self, vm: &Vm) -> HypervisorResult<ExitOutcome> {
		let exit = VmExit::read(&self.state);
		trace!("{}: {exit:?} at rip {:#x}", self.id, self.state.rip());
		if let Some(stats) = self.stats.as_mut() {
			stats.increment_val(exit.kind());
		}

		match self.dispatch_exit(vm, exit) {
			Ok(outcome) => Ok(outcome),
			Err(e) => {
				error!("{}: {e}", self.id);
				self.online = false;
				Err(e)
			}
		}
	}

	fn dispatch_exit(&mut self, vm: &Vm, exit: VmExit) -> HypervisorResult<ExitOutcome> {
		match exit {
			VmExit::ExternalInterrupt => {}
			VmExit::InterruptWindow => {
				vm.router().pending_interrupt_handler(self)?;
				return Ok(ExitOutcome::Resume);
			}
			VmExit::Cpuid => {
				let source = vm.cpuid_source();
				self.emulate_cpuid(&move |leaf, subleaf| source(leaf, subleaf))?;
			}
			VmExit::Hlt => {
				self.state.skip_instruction();
				self.halted = true;
			}
			VmExit::CrAccess(access) => self.emulate_cr_access(access)?,
			VmExit::Io(qualification) => self.emulate_io(vm, qualification)?,
			VmExit::Rdmsr => self.emulate_rdmsr(vm.router())?,
			VmExit::Wrmsr => self.emulate_wrmsr(vm.router())?,
			VmExit::EptViolation { gpa, qualification } => {
				self.emulate_ept_violation(vm, gpa, qualification)?
			}
			VmExit::Unhandled(reason) => return Err(HypervisorError::UnhandledExit(reason)),
		}

		vm.router().accept_interrupt(self)?;
		Ok(if self.halted {
			ExitOutcome::Halted
		} else {
			ExitOutcome::Resume
		})
	}

	/// Consumes a kick sent by another vCPU or by the PIC.
	///
	/// Starts the vCPU if a start-up IPI arrived and offers pending
	/// interrupts. Returns `false` if there was no kick.
	pub fn handle_kick(&mut self, vm: &Vm) -> HypervisorResult<bool> {
		if !vm.router().take_kick(self.id) {
			return Ok(false);
		}
		let startup = vm.router().apic(self.id)?.take_startup();
		if let Some(vector) = startup {
			self.start_ap(vm, vector)?;
		}
		if self.online {
			vm.router().accept_interrupt(self)?;
		}
		Ok(true)
	}

	/// Starts an application processor at the real-mode trampoline of
	/// start-up vector `vector`.
	///
	/// The trampoline is interpreted until it jumps into protected mode, RIP
	/// is set to the jump target.
	pub fn start_ap(&mut self, vm: &Vm, vector: u8) -> HypervisorResult<()> {
		let mut segment = u16::from(vector) << 8;
		let eip = u64::from(vector) << 12;
		info!("{}: start-up at {eip:#x}", self.id);

		let mut code = [0u8; TRAMPOLINE_LENGTH];
		fetch_instruction(vm.memory(), eip, 0, 0, false, &mut code)?;
		match emulate_realmode(vm.memory(), &code, &mut segment, eip, &mut self.state)? {
			RealModeOutcome::Jump { target, segment } => {
				debug!("{}: trampoline jumps to {segment:#x}:{target:#x}", self.id);
				self.state.set_rip(target);
			}
			RealModeOutcome::Exhausted => {
				return Err(HypervisorError::TrampolineExhausted(eip));
			}
		}
		self.online = true;
		self.halted = false;
		Ok(())
	}
}
