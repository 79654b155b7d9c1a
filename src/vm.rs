//! The virtual machine: guest memory, interrupt routing and the device
//! tables shared by all vCPUs.

use std::sync::Arc;

use raw_cpuid::CpuIdResult;

use crate::{
	GuestPhysAddr,
	consts::{APIC_DEFAULT_PHYS_BASE, APIC_MMIO_SIZE},
	error::{HypervisorError, HypervisorResult},
	interrupt::{InterruptRouter, KickHook},
	ioport::{IoBackend, IoPortMap, IoPortRange},
	mem::{GuestMemory, GuestRam},
	mmio::{ApicMmio, MmioDevice, MmioDispatchTable},
	params::Params,
	stats::VmStats,
	vcpu::{Vcpu, VcpuId, VcpuState},
};

/// Host CPUID, `(leaf, subleaf) -> registers`.
pub type CpuIdSource = Arc<dyn Fn(u32, u32) -> CpuIdResult + Send + Sync>;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn host_cpuid() -> CpuIdSource {
	use raw_cpuid::{CpuIdReader, CpuIdReaderNative};

	Arc::new(|leaf, subleaf| CpuIdReaderNative.cpuid2(leaf, subleaf))
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn host_cpuid() -> CpuIdSource {
	Arc::new(|_, _| CpuIdResult {
		eax: 0,
		ebx: 0,
		ecx: 0,
		edx: 0,
	})
}

/// Everything the exit handlers of one guest share.
///
/// vCPUs are created through [`Vm::create_vcpu`] and each is driven by its
/// own thread, which passes the `Vm` to [`Vcpu::handle_exit`].
pub struct Vm {
	params: Params,
	memory: Arc<dyn GuestMemory>,
	router: Arc<InterruptRouter>,
	mmio: MmioDispatchTable,
	ioports: IoPortMap,
	io_backend: Option<Arc<dyn IoBackend>>,
	cpuid: CpuIdSource,
}

impl Vm {
	/// Creates a VM with fresh zeroed RAM of `params.memory_size`.
	pub fn new(params: Params) -> HypervisorResult<Self> {
		let memory = Arc::new(GuestRam::new(params.memory_size.get()));
		Self::with_memory(params, memory)
	}

	pub fn with_memory(params: Params, memory: Arc<dyn GuestMemory>) -> HypervisorResult<Self> {
		Self::build(params, memory, None)
	}

	/// Like [`Vm::with_memory`], `hook` is called with every vCPU that gets
	/// kicked.
	pub fn with_kick_hook(
		params: Params,
		memory: Arc<dyn GuestMemory>,
		hook: KickHook,
	) -> HypervisorResult<Self> {
		Self::build(params, memory, Some(hook))
	}

	fn build(
		params: Params,
		memory: Arc<dyn GuestMemory>,
		hook: Option<KickHook>,
	) -> HypervisorResult<Self> {
		let cpu_count = params.cpu_count.get() as usize;
		let mut router = InterruptRouter::new(cpu_count, params.lapic_enabled);
		if let Some(hook) = hook {
			router = router.with_kick_hook(hook);
		}
		let router = Arc::new(router);

		let mut vm = Self {
			params,
			memory,
			router: router.clone(),
			mmio: MmioDispatchTable::new(),
			ioports: IoPortMap::legacy(),
			io_backend: None,
			cpuid: host_cpuid(),
		};
		vm.register_mmio(
			APIC_DEFAULT_PHYS_BASE,
			APIC_DEFAULT_PHYS_BASE + APIC_MMIO_SIZE,
			"local apic",
			Arc::new(ApicMmio::new(router)),
		)?;
		debug!(
			"Created VM with {cpu_count} vCPUs and {} of memory",
			vm.params.memory_size
		);
		Ok(vm)
	}

	pub fn params(&self) -> &Params {
		&self.params
	}

	pub fn memory(&self) -> &dyn GuestMemory {
		&*self.memory
	}

	pub fn router(&self) -> &Arc<InterruptRouter> {
		&self.router
	}

	pub fn mmio(&self) -> &MmioDispatchTable {
		&self.mmio
	}

	pub fn ioports(&self) -> &IoPortMap {
		&self.ioports
	}

	pub fn io_backend(&self) -> Option<&dyn IoBackend> {
		self.io_backend.as_deref()
	}

	pub fn cpuid_source(&self) -> CpuIdSource {
		self.cpuid.clone()
	}

	/// Emulates `[start, end)` with `device`.
	pub fn register_mmio(
		&mut self,
		start: GuestPhysAddr,
		end: GuestPhysAddr,
		name: &'static str,
		device: Arc<dyn MmioDevice>,
	) -> HypervisorResult<()> {
		self.mmio.register_range(start, end, name, device)?;
		Ok(())
	}

	pub fn add_ioport_range(&mut self, range: IoPortRange) -> HypervisorResult<()> {
		self.ioports.add_range(range)?;
		Ok(())
	}

	pub fn set_io_backend(&mut self, backend: Arc<dyn IoBackend>) {
		self.io_backend = Some(backend);
	}

	/// Replaces the host CPUID the guest's view is filtered from.
	pub fn set_cpuid_source(&mut self, source: CpuIdSource) {
		self.cpuid = source;
	}

	/// Creates the vCPU `id` on top of the backend register file `state`.
	///
	/// Only the bootstrap processor comes up online. Application processors
	/// wait for a start-up IPI, see [`Vcpu::handle_kick`].
	pub fn create_vcpu<S: VcpuState>(&self, id: VcpuId, state: S) -> HypervisorResult<Vcpu<S>> {
		if id.index() >= self.router.cpu_count() {
			return Err(HypervisorError::UnknownVcpu(id.index()));
		}
		Ok(Vcpu::new(id, state, self.params.stats))
	}

	/// Gathers the statistics of all `vcpus`, if they were collected.
	pub fn collect_stats<S: VcpuState>(vcpus: &mut [Vcpu<S>]) -> Option<VmStats> {
		let stats: Vec<_> = vcpus.iter_mut().filter_map(|v| v.take_stats()).collect();
		if stats.is_empty() {
			None
		} else {
			Some(VmStats::new(&stats))
		}
	}
}
