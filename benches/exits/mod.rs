use std::hint::black_box;

use criterion::{Criterion, criterion_group};
use x86vmmlib::{
	GuestPhysAddr,
	consts::APIC_DEFAULT_BASE,
	decode::decode_instruction,
	mem::GuestMemory,
	params::Params,
	vcpu::{Gpr, SoftVcpuState, VcpuId, VcpuState, VmcsField},
	vm::Vm,
};

pub fn decode_mov(c: &mut Criterion) {
	let mut group = c.benchmark_group("decode");
	group.bench_function("mov [ebx], eax", |b| {
		b.iter(|| decode_instruction(black_box(&[0x89, 0x03])).unwrap())
	});
	group.bench_function("movw [ebx+disp32], imm16", |b| {
		b.iter(|| {
			decode_instruction(black_box(&[
				0x66, 0xc7, 0x83, 0x80, 0x00, 0x00, 0x00, 0x34, 0x12,
			]))
			.unwrap()
		})
	});
	group.finish();
}

pub fn lapic_mmio_exit(c: &mut Criterion) {
	let vm = Vm::new(Params::default()).unwrap();
	vm.memory()
		.write(GuestPhysAddr::new(0x1000), &[0x8b, 0x03])
		.unwrap();
	let mut vcpu = vm.create_vcpu(VcpuId::BSP, SoftVcpuState::new()).unwrap();
	let state = vcpu.state_mut();
	state.write_vmcs(VmcsField::ExitReason, 48);
	state.write_vmcs(VmcsField::ExitQualification, 0x181);
	state.write_vmcs(VmcsField::ExitInstructionLength, 2);
	// task priority register
	state.write_vmcs(VmcsField::GuestPhysicalAddress, APIC_DEFAULT_BASE + 0x80);

	c.bench_function("vm exit: local APIC read", |b| {
		b.iter(|| {
			vcpu.state_mut().set_rip(0x1000);
			vcpu.handle_exit(&vm).unwrap();
			vcpu.state().read_register(Gpr::Rax)
		})
	});
}

pub fn mmio_lookup(c: &mut Criterion) {
	let vm = Vm::new(Params::default()).unwrap();
	let addr = GuestPhysAddr::new(APIC_DEFAULT_BASE + 0x300);
	c.bench_function("MmioDispatchTable::find", |b| {
		b.iter(|| vm.mmio().find(black_box(addr)).is_some())
	});
}

criterion_group!(exits_benchmark_group, decode_mov, lapic_mmio_exit, mmio_lookup);
