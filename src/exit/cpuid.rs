//! CPUID, filtered down to what the guest is allowed to see.

use raw_cpuid::{CpuIdReader, CpuIdResult};

use crate::{
	error::{HypervisorError, HypervisorResult},
	vcpu::{Gpr, Vcpu, VcpuState},
};

const MAX_BASIC_LEAF: u32 = 0xb;

// leaf 1, EDX
const FEATURE_FPU: u32 = 1 << 0;
const FEATURE_TSC: u32 = 1 << 4;
const FEATURE_APIC: u32 = 1 << 9;
const FEATURE_SEP: u32 = 1 << 11;
const FEATURE_PGE: u32 = 1 << 13;
const FEATURE_CMOV: u32 = 1 << 15;
const FEATURE_MMX: u32 = 1 << 23;
const FEATURE_FXSR: u32 = 1 << 24;
const FEATURE_SSE: u32 = 1 << 25;
const FEATURE_SSE2: u32 = 1 << 26;
const LEAF1_EDX: u32 = FEATURE_FPU
	| FEATURE_TSC
	| FEATURE_APIC
	| FEATURE_SEP
	| FEATURE_PGE
	| FEATURE_CMOV
	| FEATURE_MMX
	| FEATURE_FXSR
	| FEATURE_SSE
	| FEATURE_SSE2;

// leaf 1, ECX
const FEATURE_SSE3: u32 = 1 << 0;
const FEATURE_SSSE3: u32 = 1 << 9;
const FEATURE_SSE41: u32 = 1 << 19;
const FEATURE_SSE42: u32 = 1 << 20;
const FEATURE_HYPERVISOR: u32 = 1 << 31;
const LEAF1_ECX: u32 = FEATURE_SSE3 | FEATURE_SSSE3 | FEATURE_SSE41 | FEATURE_SSE42;

// leaf 7, EBX
const FEATURE_FSGSBASE: u32 = 1 << 0;
const FEATURE_BMI1: u32 = 1 << 3;
const FEATURE_HLE: u32 = 1 << 4;
const FEATURE_AVX2: u32 = 1 << 5;
const FEATURE_SMEP: u32 = 1 << 7;
const FEATURE_BMI2: u32 = 1 << 8;
const FEATURE_ERMS: u32 = 1 << 9;
const FEATURE_RTM: u32 = 1 << 11;
const LEAF7_EBX: u32 = FEATURE_FSGSBASE
	| FEATURE_BMI1
	| FEATURE_HLE
	| FEATURE_AVX2
	| FEATURE_SMEP
	| FEATURE_BMI2
	| FEATURE_ERMS
	| FEATURE_RTM;

const ZERO: CpuIdResult = CpuIdResult {
	eax: 0,
	ebx: 0,
	ecx: 0,
	edx: 0,
};

/// Filters the host's answer to `leaf`/`subleaf` for the guest.
pub fn filter_cpuid<R: CpuIdReader>(
	reader: &R,
	leaf: u32,
	subleaf: u32,
) -> HypervisorResult<CpuIdResult> {
	let host = || reader.cpuid2(leaf, subleaf);
	let result = match leaf {
		0 => {
			let mut result = host();
			result.eax = result.eax.min(MAX_BASIC_LEAF);
			result
		}
		1 => {
			let mut result = host();
			result.edx &= LEAF1_EDX;
			result.ecx = (result.ecx & LEAF1_ECX) | FEATURE_HYPERVISOR;
			result
		}
		7 => {
			let mut result = host();
			result.ebx &= LEAF7_EBX;
			result
		}
		0x8000_0001 => {
			// no NX, no RDTSCP, no long mode
			let mut result = host();
			result.ecx = 0;
			result.edx = 0;
			result
		}
		2 | 3 | 4 | 0x8000_0000 | 0x8000_0002..=0x8000_0006 | 0x8000_0008 => host(),
		5 | 6 | 0xa | 0xb | 0x4000_0000 | 0x4000_0001 | 0x8000_0007 | 0xc000_0002..=0xc000_0004 => {
			ZERO
		}
		leaf => return Err(HypervisorError::UnsupportedCpuid { leaf, subleaf }),
	};
	Ok(result)
}

impl<S: VcpuState> Vcpu<S> {
	pub(crate) fn emulate_cpuid<R: CpuIdReader>(&mut self, reader: &R) -> HypervisorResult<()> {
		let leaf = self.state.read_register(Gpr::Rax) as u32;
		let subleaf = self.state.read_register(Gpr::Rcx) as u32;
		let result = filter_cpuid(reader, leaf, subleaf)?;
		trace!("{}: cpuid {leaf:#x}/{subleaf:#x} = {result:?}", self.id);

		self.state.write_register(Gpr::Rax, u64::from(result.eax));
		self.state.write_register(Gpr::Rbx, u64::from(result.ebx));
		self.state.write_register(Gpr::Rcx, u64::from(result.ecx));
		self.state.write_register(Gpr::Rdx, u64::from(result.edx));
		self.state.skip_instruction();
		Ok(())
	}
}
