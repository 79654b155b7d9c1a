//! Control register accesses.
//!
//! CR0 and CR4 are shadowed: the guest reads its own value from the read
//! shadow while the host keeps paging, protection and VMX bits set in the
//! real register. CR3 loads are cached until the guest turns on paging.

use x86_64::registers::control::Cr0Flags;

use super::CrAccess;
use crate::{
	arch::{
		Cr4, ProcControls, apply_shadow,
		registers::{cr0_reserved_bits, cr4_reserved_bits},
	},
	error::{HypervisorError, HypervisorResult},
	vcpu::{Gpr, Vcpu, VcpuState, VmcsField},
};

fn operand(reg: u8) -> HypervisorResult<Gpr> {
	match Gpr::from_index(reg) {
		Some(Gpr::Rsp) => Err(HypervisorError::UnsupportedCrAccess(
			"control register access through rsp",
		)),
		Some(gpr) => Ok(gpr),
		None => Err(HypervisorError::UnsupportedCrAccess(
			"control register access through r8-r15",
		)),
	}
}

impl<S: VcpuState> Vcpu<S> {
	pub(crate) fn emulate_cr_access(&mut self, access: CrAccess) -> HypervisorResult<()> {
		match access {
			CrAccess::MovTo { cr, reg } => {
				let value = self.state.read_register(operand(reg)?);
				match cr {
					0 => self.write_cr0(value)?,
					3 => self.write_cr3(value),
					4 => self.write_cr4(value)?,
					_ => {
						return Err(HypervisorError::UnsupportedCrAccess(
							"mov to control register other than cr0, cr3 or cr4",
						));
					}
				}
			}
			CrAccess::MovFrom { cr: 3, reg } => {
				let value = if self.cr.paging_enabled() {
					self.state.read_vmcs(VmcsField::GuestCr3)
				} else {
					self.cr.cr3_guest
				};
				trace!("{}: mov from cr3 {value:#x}", self.id);
				self.state.write_register(operand(reg)?, value);
			}
			CrAccess::MovFrom { .. } => {
				return Err(HypervisorError::UnsupportedCrAccess(
					"mov from control register other than cr3",
				));
			}
			CrAccess::Clts => return Err(HypervisorError::UnsupportedCrAccess("clts")),
			CrAccess::Lmsw => return Err(HypervisorError::UnsupportedCrAccess("lmsw")),
		}

		self.state.skip_instruction();
		Ok(())
	}

	fn write_cr0(&mut self, value: u64) -> HypervisorResult<()> {
		let bits = cr0_reserved_bits(value);
		if bits != 0 {
			return Err(HypervisorError::ReservedBits { cr: 0, bits });
		}

		let paging = value & Cr0Flags::PAGING.bits() != 0;
		match (self.cr.paging_enabled(), paging) {
			(false, true) => self.enable_paging(),
			(true, false) => return Err(HypervisorError::PagingDisable),
			_ => {}
		}

		debug!("{}: mov to cr0 {value:#x}", self.id);
		self.cr.cr0_shadow = value;
		self.state.write_vmcs(VmcsField::Cr0ReadShadow, value);
		self.state.write_vmcs(
			VmcsField::GuestCr0,
			apply_shadow(value, self.cr.cr0_mask, self.cr.cr0_host_bits),
		);
		Ok(())
	}

	/// Hands the paging related CR4 bits to the guest and loads the CR3 it
	/// wrote while paging was off.
	fn enable_paging(&mut self) {
		let old_mask = self.cr.cr4_mask;
		let new_mask = old_mask & !(Cr4::PSE | Cr4::PAE).bits();
		let cr4 = apply_shadow(
			self.state.read_vmcs(VmcsField::GuestCr4),
			new_mask ^ old_mask,
			self.cr.cr4_shadow,
		);
		self.cr.cr4_mask = new_mask;
		self.state.write_vmcs(VmcsField::Cr4GuestHostMask, new_mask);
		self.state.write_vmcs(VmcsField::GuestCr4, cr4);

		let controls = self.state.proc_controls()
			- (ProcControls::CR3_LOAD_EXITING | ProcControls::CR3_STORE_EXITING);
		self.state.set_proc_controls(controls);
		self.state
			.write_vmcs(VmcsField::GuestCr3, self.cr.cr3_guest);
		info!(
			"{}: paging enabled, cr3 {:#x}, cr4 {cr4:#x}",
			self.id, self.cr.cr3_guest
		);
	}

	fn write_cr3(&mut self, value: u64) {
		trace!("{}: mov to cr3 {value:#x}", self.id);
		self.cr.cr3_guest = value;
		if self.cr.paging_enabled() {
			self.state.write_vmcs(VmcsField::GuestCr3, value);
		}
	}

	fn write_cr4(&mut self, value: u64) -> HypervisorResult<()> {
		let bits = cr4_reserved_bits(value);
		if bits != 0 {
			return Err(HypervisorError::ReservedBits { cr: 4, bits });
		}
		debug!("{}: mov to cr4 {value:#x}", self.id);
		self.cr.cr4_shadow = value;
		self.state.write_vmcs(VmcsField::Cr4ReadShadow, value);
		self.state.write_vmcs(
			VmcsField::GuestCr4,
			apply_shadow(value, self.cr.cr4_mask, self.cr.cr4_host_bits),
		);
		Ok(())
	}
}
