//! Port I/O (`in`/`out`).

use super::IoQualification;
use crate::{
	error::{HypervisorError, HypervisorResult},
	ioport::{IoDirection, IoEndpoint, IoRequest, PortMode},
	vcpu::{Gpr, Vcpu, VcpuState},
	vm::Vm,
};

/// Value an `in` from a port nobody serves reads.
const FLOATING_BUS: u32 = u32::MAX;

impl<S: VcpuState> Vcpu<S> {
	pub(crate) fn emulate_io(&mut self, vm: &Vm, io: IoQualification) -> HypervisorResult<()> {
		if io.string || io.rep {
			return Err(HypervisorError::StringIo(io.port));
		}

		let rax = self.state.read_register(Gpr::Rax);
		let mut request = IoRequest {
			port: io.port,
			direction: io.direction,
			size: io.size,
			value: 0,
		};
		let mask = request.mask();
		if io.direction == IoDirection::Out {
			request.value = rax as u32 & mask;
		}

		let value = match vm.ioports().lookup(io.port) {
			None if vm.params().ignore_undefined_ioports => {
				trace!("{}: ignore access to undefined port {:#x}", self.id, io.port);
				FLOATING_BUS
			}
			None => return Err(HypervisorError::UnmappedPort(io.port)),
			Some(range) if range.mode == PortMode::Passthrough || range.endpoint == IoEndpoint::Ignore => {
				trace!("{}: ignore access to {} ({:#x})", self.id, range.name, io.port);
				FLOATING_BUS
			}
			Some(range) => match range.endpoint {
				IoEndpoint::InterruptController => {
					let value = {
						let mut pic = vm.router().pic();
						match io.direction {
							IoDirection::In => pic.read(io.port, io.size)?,
							IoDirection::Out => {
								pic.write(io.port, io.size, request.value)?;
								0
							}
						}
					};
					vm.router().check_external_interrupt();
					value
				}
				endpoint => match vm.io_backend() {
					Some(backend) => backend.handle_io(endpoint, request).map_err(|e| {
						HypervisorError::IoBackend {
							port: io.port,
							reason: e.to_string(),
						}
					})?,
					None => {
						debug!("{}: no backend for {} ({:#x})", self.id, range.name, io.port);
						FLOATING_BUS
					}
				},
			},
		};

		if io.direction == IoDirection::In {
			let mask = u64::from(mask);
			let rax = (rax & !mask) | (u64::from(value) & mask);
			trace!("{}: in {:#x} -> {rax:#x}", self.id, io.port);
			self.state.write_register(Gpr::Rax, rax);
		} else {
			trace!("{}: out {:#x} <- {:#x}", self.id, io.port, request.value);
		}
		self.state.skip_instruction();
		Ok(())
	}
}
