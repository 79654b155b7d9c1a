#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use byte_unit::{Byte, Unit};
use x86vmmlib::{
	GuestPhysAddr,
	consts::{APIC_DEFAULT_BASE, EFLAGS_IF},
	exit::ExitOutcome,
	ioport::{IoBackend, IoEndpoint, IoPortError, IoRequest},
	params::Params,
	vcpu::{Gpr, SoftVcpuState, Vcpu, VcpuId, VcpuState, VmcsField},
	vm::Vm,
	HypervisorResult,
};

pub const EXIT_CPUID: u64 = 10;
pub const EXIT_HLT: u64 = 12;
pub const EXIT_CR_ACCESS: u64 = 28;
pub const EXIT_IO: u64 = 30;
pub const EXIT_RDMSR: u64 = 31;
pub const EXIT_WRMSR: u64 = 32;
pub const EXIT_EPT_VIOLATION: u64 = 48;

/// Where the tests place the instructions that trigger an exit.
pub const CODE_ADDR: u64 = 0x1000;

pub type TestVcpu = Vcpu<SoftVcpuState>;

/// A VM with 16 MiB of RAM and `cpus` vCPUs.
pub fn new_vm(cpus: u32) -> Vm {
	env_logger::try_init().ok();
	let params = Params {
		cpu_count: cpus.try_into().unwrap(),
		memory_size: Byte::from_u64_with_unit(16, Unit::MiB)
			.unwrap()
			.try_into()
			.unwrap(),
		ignore_undefined_ioports: false,
		stats: true,
		..Default::default()
	};
	Vm::new(params).unwrap()
}

/// Creates vCPU `id` with interrupts enabled in RFLAGS.
pub fn new_vcpu(vm: &Vm, id: usize) -> TestVcpu {
	let mut vcpu = vm
		.create_vcpu(VcpuId::new(id), SoftVcpuState::new())
		.unwrap();
	let state = vcpu.state_mut();
	state.write_vmcs(VmcsField::GuestRflags, EFLAGS_IF | 2);
	state.set_rip(CODE_ADDR);
	vcpu
}

/// Software-enables the APIC of `id` with spurious vector 0xff.
pub fn enable_apic(vm: &Vm, id: usize) {
	vm.router()
		.apic(VcpuId::new(id))
		.unwrap()
		.write(0xf0, 4, 0x1ff)
		.unwrap();
}

/// Records an exit in the register file of `vcpu` and handles it.
pub fn exit(
	vm: &Vm,
	vcpu: &mut TestVcpu,
	reason: u64,
	qualification: u64,
	len: u64,
) -> HypervisorResult<ExitOutcome> {
	let state = vcpu.state_mut();
	state.write_vmcs(VmcsField::ExitReason, reason);
	state.write_vmcs(VmcsField::ExitQualification, qualification);
	state.write_vmcs(VmcsField::ExitInstructionLength, len);
	vcpu.handle_exit(vm)
}

fn io_qualification(port: u16, size: u64, is_in: bool) -> u64 {
	(u64::from(port) << 16) | (u64::from(is_in) << 3) | (size - 1)
}

/// `out port, al`
pub fn outb(vm: &Vm, vcpu: &mut TestVcpu, port: u16, value: u8) -> HypervisorResult<ExitOutcome> {
	vcpu.state_mut().write_register(Gpr::Rax, u64::from(value));
	exit(vm, vcpu, EXIT_IO, io_qualification(port, 1, false), 2)
}

/// `in al, port`, returns RAX.
pub fn inb(vm: &Vm, vcpu: &mut TestVcpu, port: u16) -> HypervisorResult<u64> {
	exit(vm, vcpu, EXIT_IO, io_qualification(port, 1, true), 2)?;
	Ok(vcpu.state().read_register(Gpr::Rax))
}

/// Places `instr` at RIP and raises an EPT violation for `gpa`.
pub fn mmio_exit(
	vm: &Vm,
	vcpu: &mut TestVcpu,
	gpa: u64,
	write: bool,
	instr: &[u8],
) -> HypervisorResult<ExitOutcome> {
	let rip = vcpu.state().rip();
	vm.memory().write(GuestPhysAddr::new(rip), instr).unwrap();
	vcpu.state_mut()
		.write_vmcs(VmcsField::GuestPhysicalAddress, gpa);
	let qualification = if write { 0x182 } else { 0x181 };
	exit(
		vm,
		vcpu,
		EXIT_EPT_VIOLATION,
		qualification,
		instr.len() as u64,
	)
}

/// `mov [ebx], eax` on the local APIC register at `offset`.
pub fn apic_write(vm: &Vm, vcpu: &mut TestVcpu, offset: u64, value: u32) {
	vcpu.state_mut().write_register(Gpr::Rax, u64::from(value));
	mmio_exit(vm, vcpu, APIC_DEFAULT_BASE + offset, true, &[0x89, 0x03]).unwrap();
}

/// `mov eax, [ebx]` on the local APIC register at `offset`.
pub fn apic_read(vm: &Vm, vcpu: &mut TestVcpu, offset: u64) -> u32 {
	mmio_exit(vm, vcpu, APIC_DEFAULT_BASE + offset, false, &[0x8b, 0x03]).unwrap();
	vcpu.state().read_register(Gpr::Rax) as u32
}

/// Vector queued for the next VM entry, if any.
pub fn injected(vcpu: &TestVcpu) -> Option<u8> {
	let info = vcpu.state().read_vmcs(VmcsField::EntryInterruptionInfo);
	(info & (1 << 31) != 0).then_some(info as u8)
}

/// Pretends the guest entered and took the queued event.
pub fn enter_guest(vcpu: &mut TestVcpu) {
	vcpu.state_mut()
		.write_vmcs(VmcsField::EntryInterruptionInfo, 0);
}

/// Device backend that answers every `in` with `reply` and remembers all
/// requests.
#[derive(Debug, Default)]
pub struct RecordingBackend {
	pub reply: u32,
	pub requests: Mutex<Vec<(IoEndpoint, IoRequest)>>,
}

impl RecordingBackend {
	pub fn new(reply: u32) -> Arc<Self> {
		Arc::new(Self {
			reply,
			requests: Mutex::new(Vec::new()),
		})
	}
}

impl IoBackend for RecordingBackend {
	fn handle_io(&self, endpoint: IoEndpoint, request: IoRequest) -> Result<u32, IoPortError> {
		self.requests.lock().unwrap().push((endpoint, request));
		Ok(self.reply)
	}
}
