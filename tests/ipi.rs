mod common;

use common::*;
use x86vmmlib::{
	GuestPhysAddr,
	apic::ApicState,
	vcpu::{VcpuId, VcpuState, VmcsField},
	vm::Vm,
};

const ICR_LOW: u64 = 0x300;
const ICR_HIGH: u64 = 0x310;

fn send_ipi(vm: &Vm, sender: &mut TestVcpu, dest: u8, icr: u32) {
	apic_write(vm, sender, ICR_HIGH, u32::from(dest) << 24);
	apic_write(vm, sender, ICR_LOW, icr);
}

fn irr_set(vm: &Vm, id: usize, vector: u8) -> bool {
	vm.router().apic(VcpuId::new(id)).unwrap().irr().test(vector)
}

#[test]
fn fixed_ipi_to_all() {
	let vm = new_vm(2);
	enable_apic(&vm, 1);
	let mut bsp = new_vcpu(&vm, 0);

	// vector 0x30, fixed, physical, no shorthand, destination 0xff
	send_ipi(&vm, &mut bsp, 0xff, 0x30);

	// the sender takes its copy on the way out of the exit
	assert_eq!(injected(&bsp), Some(0x30));
	assert!(
		vm.router()
			.apic(VcpuId::BSP)
			.unwrap()
			.isr()
			.test(0x30)
	);
	assert!(irr_set(&vm, 1, 0x30));
	assert!(vm.router().take_kick(VcpuId::BSP));
	assert!(vm.router().take_kick(VcpuId::new(1)));
}

#[test]
fn lowest_priority_is_deterministic() {
	let winner = || {
		let vm = new_vm(3);
		enable_apic(&vm, 1);
		enable_apic(&vm, 2);
		let mut bsp = new_vcpu(&vm, 0);
		// vector 0x40, lowest priority, physical broadcast
		send_ipi(&vm, &mut bsp, 0xff, 0x140);
		let hits: Vec<_> = (1..3).filter(|id| irr_set(&vm, *id, 0x40)).collect();
		let bsp_hit = injected(&bsp) == Some(0x40);
		assert_eq!(hits.len() + usize::from(bsp_hit), 1);
		(bsp_hit, hits)
	};
	assert_eq!(winner(), winner());
}

#[test]
fn self_ipi_bypasses_destination() {
	let vm = new_vm(2);
	enable_apic(&vm, 1);
	let mut ap = new_vcpu(&vm, 1);
	// logical destination mode with an empty LDR would match nobody
	send_ipi(&vm, &mut ap, 0, (1 << 18) | (1 << 11) | 0x50);
	assert_eq!(injected(&ap), Some(0x50));
	assert!(!irr_set(&vm, 0, 0x50));
	assert!(!vm.router().take_kick(VcpuId::BSP));
}

#[test]
fn init_sipi_starts_ap() {
	let vm = new_vm(2);
	let mut bsp = new_vcpu(&vm, 0);
	let mut ap = new_vcpu(&vm, 1);
	assert!(!ap.is_online());

	// ljmpl 0x08:0x100000 at the start-up page of vector 0x9f
	let mut code = vec![0x66, 0xea, 0x00, 0x00, 0x10, 0x00, 0x08, 0x00];
	code.resize(100, 0x90);
	vm.memory()
		.write(GuestPhysAddr::new(0x9f000), &code)
		.unwrap();

	// INIT, level assert
	send_ipi(&vm, &mut bsp, 1, 0x4500);
	assert_eq!(
		vm.router().apic(VcpuId::new(1)).unwrap().state(),
		ApicState::WaitSipi
	);
	// start-up with vector 0x9f
	send_ipi(&vm, &mut bsp, 1, 0x069f);
	assert!(ap.handle_kick(&vm).unwrap());
	assert!(ap.is_online());
	assert_eq!(ap.state().rip(), 0x10_0000);
	assert_eq!(ap.state().read_vmcs(VmcsField::GuestCsSelector), 0x08);

	// a second SIPI is ignored
	send_ipi(&vm, &mut bsp, 1, 0x069f);
	assert!(!ap.handle_kick(&vm).unwrap());
}
