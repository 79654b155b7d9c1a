//! rdmsr and wrmsr.
//!
//! Only a handful of informational MSRs and the APIC base are emulated.
//! Everything else raises #GP in the guest, like a real CPU does for a
//! model specific register it does not know.

use crate::{
	error::{HypervisorError, HypervisorResult},
	interrupt::{InterruptRouter, inject_exception},
	vcpu::{Gpr, Vcpu, VcpuState},
};

const IA32_PLATFORM_ID: u32 = 0x17;
const IA32_APIC_BASE: u32 = 0x1b;
const MSR_EBL_CR_POWERON: u32 = 0x2a;
const MSR_EBC_FREQUENCY_ID: u32 = 0x2c;
const IA32_UCODE_WRITE: u32 = 0x79;
const IA32_UCODE_REV: u32 = 0x8b;
const IA32_PERFCTR0: u32 = 0xc1;
const IA32_PERFCTR1: u32 = 0xc2;
const MSR_FSB_FREQ: u32 = 0xcd;
const IA32_PERFEVTSEL0: u32 = 0x186;
const IA32_PERFEVTSEL1: u32 = 0x187;
const IA32_MISC_ENABLE: u32 = 0x1a0;
const IA32_DEBUGCTL: u32 = 0x1d9;
const MSR_LASTBRANCH_FROM_IP: u32 = 0x1db;
const MSR_LASTINT_TO_IP: u32 = 0x1de;
const IA32_PERF_GLOBAL_STATUS_SET: u32 = 0x391;

/// General protection fault.
const GP_VECTOR: u8 = 13;

fn is_perf_counter(msr: u32) -> bool {
	matches!(
		msr,
		IA32_PERFCTR0
			| IA32_PERFCTR1
			| IA32_PERFEVTSEL0
			| IA32_PERFEVTSEL1
			| IA32_PERF_GLOBAL_STATUS_SET
	)
}

impl<S: VcpuState> Vcpu<S> {
	fn read_msr(&self, router: &InterruptRouter, msr: u32) -> HypervisorResult<u64> {
		match msr {
			IA32_PLATFORM_ID | MSR_EBL_CR_POWERON | IA32_MISC_ENABLE | IA32_DEBUGCTL => Ok(0),
			MSR_LASTBRANCH_FROM_IP..=MSR_LASTINT_TO_IP => Ok(0),
			msr if is_perf_counter(msr) => Ok(0),
			IA32_UCODE_REV => Ok(1 << 32),
			MSR_FSB_FREQ => Ok(3),
			MSR_EBC_FREQUENCY_ID => Ok(1 << 24),
			IA32_APIC_BASE => Ok(router.apic(self.id)?.base_msr()),
			msr => Err(HypervisorError::UnsupportedMsr(msr)),
		}
	}

	fn write_msr(&self, router: &InterruptRouter, msr: u32, value: u64) -> HypervisorResult<()> {
		match msr {
			IA32_UCODE_REV | IA32_UCODE_WRITE => {
				debug!("{}: ignore microcode update ({msr:#x})", self.id);
			}
			msr if is_perf_counter(msr) => {
				trace!("{}: ignore write to performance counter {msr:#x}", self.id);
			}
			IA32_APIC_BASE => router.apic(self.id)?.set_base_msr(value & 0xffff_ffff),
			msr => return Err(HypervisorError::UnsupportedMsr(msr)),
		}
		Ok(())
	}

	fn inject_gp(&mut self, err: HypervisorError) -> HypervisorResult<()> {
		warn!("{}: {err}, injecting #GP", self.id);
		inject_exception(&mut self.state, GP_VECTOR, Some(0))
	}

	pub(crate) fn emulate_rdmsr(&mut self, router: &InterruptRouter) -> HypervisorResult<()> {
		let msr = self.state.read_register(Gpr::Rcx) as u32;
		match self.read_msr(router, msr) {
			Ok(value) => {
				trace!("{}: rdmsr {msr:#x} = {value:#x}", self.id);
				self.state.write_register(Gpr::Rax, value & 0xffff_ffff);
				self.state.write_register(Gpr::Rdx, value >> 32);
				self.state.skip_instruction();
				Ok(())
			}
			Err(err @ HypervisorError::UnsupportedMsr(_)) => self.inject_gp(err),
			Err(err) => Err(err),
		}
	}

	pub(crate) fn emulate_wrmsr(&mut self, router: &InterruptRouter) -> HypervisorResult<()> {
		let msr = self.state.read_register(Gpr::Rcx) as u32;
		let value = (self.state.read_register(Gpr::Rdx) << 32)
			| (self.state.read_register(Gpr::Rax) & 0xffff_ffff);
		match self.write_msr(router, msr, value) {
			Ok(()) => {
				trace!("{}: wrmsr {msr:#x} = {value:#x}", self.id);
				self.state.skip_instruction();
				Ok(())
			}
			Err(err @ HypervisorError::UnsupportedMsr(_)) => self.inject_gp(err),
			Err(err) => Err(err),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::vcpu::{SoftVcpuState, VcpuId, VmcsField};

	fn new_vcpu(id: usize) -> Vcpu<SoftVcpuState> {
		let mut vcpu = Vcpu::new(VcpuId::new(id), SoftVcpuState::new(), false);
		vcpu.state.set_rip(0x2000);
		vcpu.state.write_vmcs(VmcsField::ExitInstructionLength, 2);
		vcpu
	}

	fn rdmsr(vcpu: &mut Vcpu<SoftVcpuState>, router: &InterruptRouter, msr: u32) -> u64 {
		vcpu.state.write_register(Gpr::Rcx, u64::from(msr));
		vcpu.emulate_rdmsr(router).unwrap();
		(vcpu.state.read_register(Gpr::Rdx) << 32) | vcpu.state.read_register(Gpr::Rax)
	}

	#[test]
	fn test_rdmsr_table() {
		let router = InterruptRouter::new(2, true);
		let mut vcpu = new_vcpu(0);
		assert_eq!(rdmsr(&mut vcpu, &router, IA32_PLATFORM_ID), 0);
		assert_eq!(rdmsr(&mut vcpu, &router, IA32_UCODE_REV), 0x1_0000_0000);
		assert_eq!(rdmsr(&mut vcpu, &router, MSR_FSB_FREQ), 3);
		assert_eq!(rdmsr(&mut vcpu, &router, MSR_EBC_FREQUENCY_ID), 1 << 24);
		assert_eq!(rdmsr(&mut vcpu, &router, 0x1dc), 0);
		assert_eq!(rdmsr(&mut vcpu, &router, IA32_PERFEVTSEL1), 0);
		assert_eq!(vcpu.state.rip(), 0x200c);

		assert_eq!(rdmsr(&mut vcpu, &router, IA32_APIC_BASE), 0xfee0_0900);
		let mut ap = new_vcpu(1);
		assert_eq!(rdmsr(&mut ap, &router, IA32_APIC_BASE), 0xfee0_0800);
	}

	#[test]
	fn test_wrmsr() {
		let router = InterruptRouter::new(1, true);
		let mut vcpu = new_vcpu(0);
		vcpu.state.write_register(Gpr::Rcx, u64::from(IA32_APIC_BASE));
		vcpu.state.write_register(Gpr::Rax, 0xfee0_0000);
		vcpu.state.write_register(Gpr::Rdx, 0);
		vcpu.emulate_wrmsr(&router).unwrap();
		assert!(!router.apic(VcpuId::BSP).unwrap().hw_enabled());
		assert_eq!(vcpu.state.rip(), 0x2002);

		vcpu.state.write_register(Gpr::Rcx, u64::from(IA32_UCODE_WRITE));
		vcpu.emulate_wrmsr(&router).unwrap();
		assert_eq!(vcpu.state.rip(), 0x2004);
	}

	#[test]
	fn test_unknown_msr_raises_gp() {
		let router = InterruptRouter::new(1, true);
		let mut vcpu = new_vcpu(0);
		vcpu.state.write_register(Gpr::Rcx, 0xc000_0080);
		vcpu.emulate_rdmsr(&router).unwrap();
		assert_eq!(vcpu.state.rip(), 0x2000);
		assert_eq!(
			vcpu.state.read_vmcs(VmcsField::EntryInterruptionInfo),
			0x8000_0b0d
		);
		assert_eq!(vcpu.state.read_vmcs(VmcsField::EntryExceptionErrorCode), 0);

		// a second fault while the first is still queued
		assert!(matches!(
			vcpu.emulate_wrmsr(&router),
			Err(HypervisorError::EventPending)
		));
	}
}
