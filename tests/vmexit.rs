mod common;

use std::sync::Arc;

use common::*;
use raw_cpuid::CpuIdResult;
use x86vmmlib::{
	GuestPhysAddr, HypervisorError,
	exit::ExitOutcome,
	ioport::{IoDirection, IoEndpoint, IoPortError, IoPortRange, IoRequest, PortMode},
	paging::initialize_pagetables,
	stats::ExitKind,
	vcpu::{Gpr, VcpuId, VcpuState, VmcsField},
	vm::Vm,
};

fn io(
	vm: &Vm,
	vcpu: &mut TestVcpu,
	port: u16,
	size: u64,
	direction: IoDirection,
) -> x86vmmlib::HypervisorResult<ExitOutcome> {
	let is_in = u64::from(direction == IoDirection::In);
	let qualification = (u64::from(port) << 16) | (is_in << 3) | (size - 1);
	exit(vm, vcpu, EXIT_IO, qualification, 1)
}

fn mov_to_cr(vm: &Vm, vcpu: &mut TestVcpu, cr: u64, value: u64) -> x86vmmlib::HypervisorResult<ExitOutcome> {
	vcpu.state_mut().write_register(Gpr::Rax, value);
	exit(vm, vcpu, EXIT_CR_ACCESS, cr, 3)
}

#[test]
fn io_goes_to_backend_or_floats() {
	let mut vm = new_vm(1);
	let backend = RecordingBackend::new(0x1234_5678);
	vm.set_io_backend(backend.clone());
	vm.add_ioport_range(IoPortRange::new(
		0x510,
		0x511,
		IoEndpoint::Device,
		PortMode::Catch,
		"firmware config",
	))
	.unwrap();
	let mut bsp = new_vcpu(&vm, 0);

	bsp.state_mut().write_register(Gpr::Rax, 0x8000_0000);
	io(&vm, &mut bsp, 0xcf8, 4, IoDirection::Out).unwrap();
	io(&vm, &mut bsp, 0xcfc, 4, IoDirection::In).unwrap();
	assert_eq!(bsp.state().read_register(Gpr::Rax), 0x1234_5678);

	// the reply is cut to the access size
	bsp.state_mut().write_register(Gpr::Rax, 0xffff_0000);
	io(&vm, &mut bsp, 0x510, 2, IoDirection::In).unwrap();
	assert_eq!(bsp.state().read_register(Gpr::Rax), 0xffff_5678);

	let requests = backend.requests.lock().unwrap();
	assert_eq!(
		*requests,
		[
			(
				IoEndpoint::PciConfig,
				IoRequest {
					port: 0xcf8,
					direction: IoDirection::Out,
					size: 4,
					value: 0x8000_0000
				}
			),
			(
				IoEndpoint::PciConfig,
				IoRequest {
					port: 0xcfc,
					direction: IoDirection::In,
					size: 4,
					value: 0
				}
			),
			(
				IoEndpoint::Device,
				IoRequest {
					port: 0x510,
					direction: IoDirection::In,
					size: 2,
					value: 0
				}
			),
		]
	);
	drop(requests);

	// COM1 belongs to the real device
	bsp.state_mut().write_register(Gpr::Rax, 0x100);
	assert_eq!(inb(&vm, &mut bsp, 0x3f8).unwrap(), 0x1ff);
	assert_eq!(backend.requests.lock().unwrap().len(), 3);
	assert_eq!(bsp.stats().unwrap().count(ExitKind::IoIn), 3);
	assert_eq!(bsp.stats().unwrap().count(ExitKind::IoOut), 1);
}

#[test]
fn overlapping_port_range_is_rejected() {
	let mut vm = new_vm(1);
	assert!(matches!(
		vm.add_ioport_range(IoPortRange::new(
			0x21,
			0x22,
			IoEndpoint::Device,
			PortMode::Catch,
			"clash",
		)),
		Err(HypervisorError::IoPort(IoPortError::Overlap { .. }))
	));
}

#[test]
fn undefined_and_string_io_are_fatal() {
	let vm = new_vm(1);
	let mut bsp = new_vcpu(&vm, 0);
	assert!(matches!(
		io(&vm, &mut bsp, 0x5000, 1, IoDirection::Out),
		Err(HypervisorError::UnmappedPort(0x5000))
	));
	assert!(!bsp.is_online());

	let mut bsp = new_vcpu(&vm, 0);
	// rep outsb to COM1
	let qualification = (0x3f8 << 16) | (1 << 4) | (1 << 5);
	assert!(matches!(
		exit(&vm, &mut bsp, EXIT_IO, qualification, 2),
		Err(HypervisorError::StringIo(0x3f8))
	));
	assert_eq!(bsp.state().rip(), CODE_ADDR);
}

#[test]
fn enable_paging_then_mmio() {
	let vm = new_vm(1);
	let pd = GuestPhysAddr::new(0x20_0000);
	initialize_pagetables(vm.memory(), pd, 16 * 1024 * 1024).unwrap();
	let mut bsp = new_vcpu(&vm, 0);

	mov_to_cr(&vm, &mut bsp, 3, pd.as_u64()).unwrap();
	// mov from cr3 to ecx
	exit(&vm, &mut bsp, EXIT_CR_ACCESS, 0x113, 3).unwrap();
	assert_eq!(bsp.state().read_register(Gpr::Rcx), pd.as_u64());
	assert_eq!(bsp.state().read_vmcs(VmcsField::GuestCr3), 0);

	// PSE, then PG | ET | PE
	mov_to_cr(&vm, &mut bsp, 4, 1 << 4).unwrap();
	mov_to_cr(&vm, &mut bsp, 0, 0x8000_0011).unwrap();
	assert!(bsp.cr().paging_enabled());
	assert_eq!(bsp.state().read_vmcs(VmcsField::GuestCr3), pd.as_u64());

	// the MMIO instruction is fetched through the page tables
	assert_eq!(apic_read(&vm, &mut bsp, 0x30) & 0xff, 0x14);

	assert!(matches!(
		mov_to_cr(&vm, &mut bsp, 0, 0x11),
		Err(HypervisorError::PagingDisable)
	));
	assert!(!bsp.is_online());
}

#[test]
fn msr_access() {
	let vm = new_vm(2);
	let mut bsp = new_vcpu(&vm, 0);

	bsp.state_mut().write_register(Gpr::Rcx, 0x1b);
	exit(&vm, &mut bsp, EXIT_RDMSR, 0, 2).unwrap();
	assert_eq!(bsp.state().read_register(Gpr::Rax), 0xfee0_0900);
	assert_eq!(bsp.state().read_register(Gpr::Rdx), 0);

	// EFER is not emulated, the guest gets #GP and stays at the instruction
	bsp.state_mut().write_register(Gpr::Rcx, 0xc000_0080);
	let rip = bsp.state().rip();
	exit(&vm, &mut bsp, EXIT_WRMSR, 0, 2).unwrap();
	assert_eq!(bsp.state().rip(), rip);
	assert_eq!(
		bsp.state().read_vmcs(VmcsField::EntryInterruptionInfo),
		0x8000_0b0d
	);
	assert!(bsp.is_online());
}

#[test]
fn cpuid_is_filtered() {
	let mut vm = new_vm(1);
	vm.set_cpuid_source(Arc::new(|leaf: u32, _: u32| CpuIdResult {
		eax: if leaf == 0 { 0x16 } else { u32::MAX },
		ebx: u32::MAX,
		ecx: u32::MAX,
		edx: u32::MAX,
	}));
	let mut bsp = new_vcpu(&vm, 0);

	bsp.state_mut().write_register(Gpr::Rax, 0);
	exit(&vm, &mut bsp, EXIT_CPUID, 0, 2).unwrap();
	assert_eq!(bsp.state().read_register(Gpr::Rax), 0xb);

	bsp.state_mut().write_register(Gpr::Rax, 1);
	exit(&vm, &mut bsp, EXIT_CPUID, 0, 2).unwrap();
	assert_ne!(bsp.state().read_register(Gpr::Rcx) & (1 << 31), 0);
	// no VMX for the guest
	assert_eq!(bsp.state().read_register(Gpr::Rcx) & (1 << 5), 0);

	bsp.state_mut().write_register(Gpr::Rax, 0xd);
	assert!(matches!(
		exit(&vm, &mut bsp, EXIT_CPUID, 0, 2),
		Err(HypervisorError::UnsupportedCpuid { leaf: 0xd, .. })
	));
}

#[test]
fn hlt_unhandled_and_stats() {
	let vm = new_vm(2);
	let mut vcpus = vec![new_vcpu(&vm, 0), new_vcpu(&vm, 1)];

	assert_eq!(
		exit(&vm, &mut vcpus[0], EXIT_HLT, 0, 1).unwrap(),
		ExitOutcome::Halted
	);
	assert_eq!(vcpus[0].state().rip(), CODE_ADDR + 1);

	// triple fault
	assert!(matches!(
		exit(&vm, &mut vcpus[1], 2, 0, 0),
		Err(HypervisorError::UnhandledExit(2))
	));

	let stats = Vm::collect_stats(&mut vcpus).unwrap();
	assert_eq!(stats.vm_exits[&ExitKind::Hlt][&0], 1);
	assert_eq!(stats.vm_exits[&ExitKind::Other][&1], 1);
	assert_eq!(stats.cpu_runtimes.len(), 2);
	assert!(Vm::collect_stats(&mut vcpus).is_none());

	assert!(matches!(
		vm.create_vcpu(VcpuId::new(2), x86vmmlib::vcpu::SoftVcpuState::new()),
		Err(HypervisorError::UnknownVcpu(2))
	));
}
