//! EPT violations, i.e. accesses to emulated MMIO ranges.

use super::EptQualification;
use crate::{
	GuestPhysAddr,
	arch::apply_shadow,
	consts::MAX_INSTRUCTION_LENGTH,
	decode::{DecodeError, Operand, decode_instruction, fetch_instruction},
	error::{HypervisorError, HypervisorResult},
	mmio::MmioAccess,
	stats::ExitKind,
	vcpu::{Vcpu, VcpuState, VmcsField},
	vm::Vm,
};

impl<S: VcpuState> Vcpu<S> {
	/// CR4 as the guest sees it.
	fn guest_cr4(&self) -> u64 {
		apply_shadow(
			self.state.read_vmcs(VmcsField::GuestCr4),
			self.cr.cr4_mask,
			self.cr.cr4_shadow,
		)
	}

	pub(crate) fn emulate_ept_violation(
		&mut self,
		vm: &Vm,
		gpa: GuestPhysAddr,
		qualification: EptQualification,
	) -> HypervisorResult<()> {
		if qualification.read && qualification.write {
			return Err(HypervisorError::EptWalkFault(gpa.as_u64()));
		}
		if qualification.fetch {
			return Err(HypervisorError::EptFetch(gpa.as_u64()));
		}

		let rip = self.state.rip();
		let Some(range) = vm.mmio().find(gpa) else {
			let linear = self.state.read_vmcs(VmcsField::GuestLinearAddress);
			if vm.params().ignore_ept_violations {
				warn!(
					"{}: skip access to unmapped {:#x} (linear {linear:#x}, rip {rip:#x})",
					self.id,
					gpa.as_u64()
				);
				self.state.skip_instruction();
				return Ok(());
			}
			error!(
				"{}: GUEST OS PAGE FAULT at {:#x} (linear {linear:#x}, rip {rip:#x})",
				self.id,
				gpa.as_u64()
			);
			return Err(HypervisorError::GuestPageFault {
				gpa: gpa.as_u64(),
				linear,
				rip,
			});
		};

		let len = self.state.read_vmcs(VmcsField::ExitInstructionLength) as usize;
		if len == 0 || len > MAX_INSTRUCTION_LENGTH {
			return Err(DecodeError::Truncated(len).into());
		}
		let mut buf = [0u8; MAX_INSTRUCTION_LENGTH];
		let instr = &mut buf[..len];
		fetch_instruction(
			vm.memory(),
			rip,
			self.state.read_vmcs(VmcsField::GuestCr3),
			self.guest_cr4(),
			self.cr.paging_enabled(),
			instr,
		)?;
		let decoded = decode_instruction(instr)?;
		let mask = decoded.width_mask();

		if qualification.write {
			let value = match decoded.operand {
				Operand::Register(reg) => self.state.read_register(reg) as u32,
				Operand::HighByte(reg) => (self.state.read_register(reg) >> 8) as u32,
				Operand::Immediate(imm) => imm,
			} & mask;
			trace!(
				"{}: {} write {value:#x} to {:#x}",
				self.id,
				range.name,
				gpa.as_u64()
			);
			range.access(self.id, gpa, decoded.width, MmioAccess::Write(value))?;
			if let Some(stats) = self.stats.as_mut() {
				stats.increment_val(ExitKind::MmioWrite);
			}
		} else {
			let (reg, shift) = match decoded.operand {
				Operand::Register(reg) => (reg, 0),
				Operand::HighByte(reg) => (reg, 8),
				Operand::Immediate(_) => {
					return Err(DecodeError::UnsupportedOpcode {
						opcode: instr[0],
						bytes: instr.to_vec(),
					}
					.into());
				}
			};
			let value = range.access(self.id, gpa, decoded.width, MmioAccess::Read)?;
			trace!(
				"{}: {} read {value:#x} from {:#x}",
				self.id,
				range.name,
				gpa.as_u64()
			);
			let mask = u64::from(mask) << shift;
			let merged =
				(self.state.read_register(reg) & !mask) | ((u64::from(value) << shift) & mask);
			self.state.write_register(reg, merged);
			if let Some(stats) = self.stats.as_mut() {
				stats.increment_val(ExitKind::MmioRead);
			}
		}

		self.state.skip_instruction();
		Ok(())
	}
}
