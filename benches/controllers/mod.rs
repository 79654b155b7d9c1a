use std::hint::black_box;

use criterion::{Criterion, criterion_group};
use x86vmmlib::{
	apic::{DeliveryMode, DestinationMode, Ipi, Shorthand},
	interrupt::InterruptRouter,
	pic::PicPair,
	vcpu::VcpuId,
};

fn init_pic() -> PicPair {
	let mut pic = PicPair::new();
	for (port, val) in [
		(0x20, 0x11),
		(0x21, 0x20),
		(0x21, 0x04),
		(0x21, 0x01),
		(0xa0, 0x11),
		(0xa1, 0x28),
		(0xa1, 0x02),
		(0xa1, 0x01),
		(0x21, 0x00),
		(0xa1, 0x00),
	] {
		pic.write(port, 1, val).unwrap();
	}
	pic
}

pub fn pic_raise_and_ack(c: &mut Criterion) {
	let mut pic = init_pic();
	c.bench_function("pic::set_irq + read_irq + eoi", |b| {
		b.iter(|| {
			pic.set_irq(black_box(10), 0, true).unwrap();
			pic.set_irq(10, 0, false).unwrap();
			let vector = pic.read_irq();
			pic.write(0xa0, 1, 0x20).unwrap();
			pic.write(0x20, 1, 0x20).unwrap();
			vector
		})
	});
}

pub fn ipi_broadcast(c: &mut Criterion) {
	let mut group = c.benchmark_group("ipi");
	for cpus in [2, 8, 32] {
		let router = InterruptRouter::new(cpus, true);
		for idx in 0..cpus {
			router
				.apic(VcpuId::new(idx))
				.unwrap()
				.write(0xf0, 4, 0x1ff)
				.unwrap();
		}
		let ipi = Ipi {
			vector: 0x40,
			mode: DeliveryMode::Fixed,
			dest_mode: DestinationMode::Physical,
			level: true,
			trigger: false,
			shorthand: Shorthand::AllIncludingSelf,
			dest: 0,
		};
		group.bench_function(format!("deliver_ipi(all, {cpus} vCPUs)"), |b| {
			b.iter(|| {
				router.deliver_ipi(VcpuId::BSP, black_box(ipi));
				for idx in 0..cpus {
					router.take_kick(VcpuId::new(idx));
				}
			})
		});
	}
	group.finish();
}

criterion_group!(controllers_benchmark_group, pic_raise_and_ack, ipi_broadcast);
