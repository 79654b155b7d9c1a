//! Routing of interrupts between the PIC, the local APICs and the vCPUs.
//!
//! Every APIC sits behind its own mutex, the PIC behind one shared mutex.
//! When both are needed the APIC is locked first. No APIC lock is held while
//! another APIC is locked, which is why an ICR write hands the IPI back to
//! the caller instead of routing it itself.

use std::{
	fmt,
	sync::{Mutex, MutexGuard},
};

use crate::{
	apic::{DeliveryMode, Ipi, LocalApic, Shorthand},
	arch::ProcControls,
	consts::EFLAGS_IF,
	error::{HypervisorError, HypervisorResult},
	kick::Kick,
	pic::PicPair,
	vcpu::{Vcpu, VcpuId, VcpuState, VmcsField},
};

/// Valid bit of the VM-entry interruption information field.
const INTR_INFO_VALID: u64 = 1 << 31;
/// Interruption type "hardware exception", bits 8..11.
const INTR_TYPE_HARD_EXCEPTION: u64 = 3 << 8;
const INTR_INFO_DELIVER_CODE: u64 = 1 << 11;
/// STI, MOV SS, SMI and NMI blocking.
const INTERRUPTIBILITY_BLOCKING: u64 = 0xf;

/// Called with the target of every kick, for example to signal a vCPU
/// thread that is running the guest.
pub type KickHook = Box<dyn Fn(VcpuId) + Send + Sync>;

/// Whether an external interrupt can be injected on the next VM entry.
pub fn can_inject<S: VcpuState>(state: &S) -> bool {
	state.rflags() & EFLAGS_IF != 0
		&& state.read_vmcs(VmcsField::GuestInterruptibility) & INTERRUPTIBILITY_BLOCKING == 0
		&& state.read_vmcs(VmcsField::EntryInterruptionInfo) & INTR_INFO_VALID == 0
}

/// Queues external interrupt `vector` for the next VM entry.
pub fn inject_irq<S: VcpuState>(state: &mut S, vector: u8) -> HypervisorResult<()> {
	if vector < 16 {
		return Err(HypervisorError::InvalidVector(vector));
	}
	trace!("Inject interrupt {vector:#x}");
	state.write_vmcs(
		VmcsField::EntryInterruptionInfo,
		INTR_INFO_VALID | u64::from(vector),
	);
	Ok(())
}

/// Queues hardware exception `vector`, optionally with an error code.
pub fn inject_exception<S: VcpuState>(
	state: &mut S,
	vector: u8,
	error_code: Option<u32>,
) -> HypervisorResult<()> {
	if vector >= 16 {
		return Err(HypervisorError::InvalidVector(vector));
	}
	if state.read_vmcs(VmcsField::EntryInterruptionInfo) & INTR_INFO_VALID != 0 {
		return Err(HypervisorError::EventPending);
	}
	let mut info = INTR_INFO_VALID | INTR_TYPE_HARD_EXCEPTION | u64::from(vector);
	if let Some(code) = error_code {
		state.write_vmcs(VmcsField::EntryExceptionErrorCode, u64::from(code));
		info |= INTR_INFO_DELIVER_CODE;
	}
	debug!("Inject exception {vector} (error code {error_code:?})");
	state.write_vmcs(VmcsField::EntryInterruptionInfo, info);
	Ok(())
}

/// Requests an exit as soon as the guest can take an interrupt.
pub fn wait_for_guest_ready<S: VcpuState>(state: &mut S) {
	let controls = state.proc_controls() | ProcControls::INTERRUPT_WINDOW_EXITING;
	state.set_proc_controls(controls);
}

pub fn resume_guest<S: VcpuState>(state: &mut S) {
	let controls = state.proc_controls() - ProcControls::INTERRUPT_WINDOW_EXITING;
	state.set_proc_controls(controls);
}

/// The interrupt controllers of one VM.
pub struct InterruptRouter {
	apics: Vec<Mutex<LocalApic>>,
	pic: Mutex<PicPair>,
	kicks: Vec<Kick>,
	kick_hook: Option<KickHook>,
}

impl fmt::Debug for InterruptRouter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("InterruptRouter")
			.field("apics", &self.apics)
			.field("pic", &self.pic)
			.field("kicks", &self.kicks)
			.finish_non_exhaustive()
	}
}

impl InterruptRouter {
	pub fn new(cpu_count: usize, lapic_enabled: bool) -> Self {
		Self {
			apics: (0..cpu_count)
				.map(|i| Mutex::new(LocalApic::new(i, lapic_enabled)))
				.collect(),
			pic: Mutex::new(PicPair::new()),
			kicks: (0..cpu_count).map(|_| Kick::new()).collect(),
			kick_hook: None,
		}
	}

	pub fn with_kick_hook(mut self, hook: KickHook) -> Self {
		self.kick_hook = Some(hook);
		self
	}

	pub fn cpu_count(&self) -> usize {
		self.apics.len()
	}

	pub fn apic(&self, id: VcpuId) -> HypervisorResult<MutexGuard<'_, LocalApic>> {
		self.apics
			.get(id.index())
			.map(|apic| apic.lock().unwrap())
			.ok_or(HypervisorError::UnknownVcpu(id.index()))
	}

	pub fn pic(&self) -> MutexGuard<'_, PicPair> {
		self.pic.lock().unwrap()
	}

	pub fn kick(&self, id: VcpuId) {
		let Some(kick) = self.kicks.get(id.index()) else {
			return;
		};
		trace!("Kick {id}");
		kick.kick();
		if let Some(hook) = &self.kick_hook {
			hook(id);
		}
	}

	/// Consumes a pending kick of `id`.
	pub fn take_kick(&self, id: VcpuId) -> bool {
		self.kicks
			.get(id.index())
			.is_some_and(|kick| kick.take())
	}

	/// Blocks until `id` is kicked.
	pub fn park(&self, id: VcpuId) -> HypervisorResult<()> {
		self.kicks
			.get(id.index())
			.ok_or(HypervisorError::UnknownVcpu(id.index()))?
			.park();
		Ok(())
	}

	/// Drives PIC line `irq` on behalf of `source`.
	pub fn set_irq(&self, irq: u8, source: u8, level: bool) -> HypervisorResult<bool> {
		let raised = self.pic().set_irq(irq, source, level)?;
		self.check_external_interrupt();
		Ok(raised)
	}

	/// Raises and lowers `irq` again, the way a host interrupt is forwarded.
	pub fn pulse_irq(&self, irq: u8, source: u8) -> HypervisorResult<()> {
		self.set_irq(irq, source, true)?;
		self.set_irq(irq, source, false)?;
		Ok(())
	}

	/// Kicks the first vCPU that takes PIC interrupts through LINT0 if the
	/// PIC output is raised.
	pub fn check_external_interrupt(&self) {
		let has_irq = {
			let mut pic = self.pic();
			pic.take_wakeup();
			pic.has_irq()
		};
		if !has_irq {
			return;
		}
		let target = self
			.apics
			.iter()
			.position(|apic| apic.lock().unwrap().accept_pic_intr());
		match target {
			Some(idx) => self.kick(VcpuId::new(idx)),
			None => trace!("PIC interrupt pending, no vCPU in virtual wire mode"),
		}
	}

	fn accept(&self, idx: usize, ipi: &Ipi) -> bool {
		let (accepted, eval) = {
			let mut apic = self.apics[idx].lock().unwrap();
			let accepted = apic.accept_irq(ipi.mode, ipi.vector, ipi.level, ipi.trigger);
			(accepted, apic.take_eval_request())
		};
		if eval {
			self.kick(VcpuId::new(idx));
		}
		accepted
	}

	/// Routes `ipi` sent by `source` to its destinations and returns whether
	/// at least one of them took it.
	///
	/// The caller must not hold any APIC lock.
	pub fn deliver_ipi(&self, source: VcpuId, ipi: Ipi) -> bool {
		debug!("Route {ipi:?} from {source}");
		if ipi.shorthand == Shorthand::SelfOnly {
			if source.index() >= self.apics.len() {
				return false;
			}
			return self.accept(source.index(), &ipi);
		}

		if ipi.mode == DeliveryMode::LowestPriority {
			let mut target: Option<(usize, u32)> = None;
			for (idx, apic) in self.apics.iter().enumerate() {
				let apic = apic.lock().unwrap();
				if !apic.enabled() || !apic.match_dest(source.index(), &ipi) {
					continue;
				}
				let prio = apic.arb_prio();
				if target.is_none_or(|(_, lowest)| prio < lowest) {
					target = Some((idx, prio));
				}
			}
			return match target {
				Some((idx, _)) => self.accept(idx, &ipi),
				None => {
					debug!("No destination for {ipi:?}");
					false
				}
			};
		}

		let mut accepted = false;
		for idx in 0..self.apics.len() {
			let matches = {
				let apic = self.apics[idx].lock().unwrap();
				apic.hw_enabled() && apic.match_dest(source.index(), &ipi)
			};
			if matches {
				accepted |= self.accept(idx, &ipi);
			}
		}
		accepted
	}

	/// Offers the highest pending interrupt of `vcpu` to the guest.
	///
	/// Injects it right away if the guest can take it, otherwise arms an
	/// interrupt-window exit. A halted vCPU is woken up and gets the
	/// interrupt on the window exit.
	pub fn accept_interrupt<S: VcpuState>(&self, vcpu: &mut Vcpu<S>) -> HypervisorResult<()> {
		let mut apic = self.apic(vcpu.id)?;
		apic.take_eval_request();
		let mut pic = self.pic();
		if apic.has_interrupt(pic.has_irq()).is_none() {
			return Ok(());
		}

		if !can_inject(&vcpu.state) {
			wait_for_guest_ready(&mut vcpu.state);
			vcpu.halted = false;
		} else if vcpu.halted {
			wait_for_guest_ready(&mut vcpu.state);
			vcpu.halted = false;
		} else {
			if let Some(vector) = apic.get_interrupt(&mut pic) {
				inject_irq(&mut vcpu.state, vector)?;
			}
			if apic.has_interrupt(pic.has_irq()).is_some() {
				wait_for_guest_ready(&mut vcpu.state);
			}
		}
		Ok(())
	}

	/// Interrupt-window exit: the guest is ready, hand it the next interrupt.
	pub fn pending_interrupt_handler<S: VcpuState>(
		&self,
		vcpu: &mut Vcpu<S>,
	) -> HypervisorResult<()> {
		let mut apic = self.apic(vcpu.id)?;
		apic.take_eval_request();
		let mut pic = self.pic();
		let Some(vector) = apic.get_interrupt(&mut pic) else {
			resume_guest(&mut vcpu.state);
			return Ok(());
		};
		inject_irq(&mut vcpu.state, vector)?;
		if apic.has_interrupt(pic.has_irq()).is_none() {
			resume_guest(&mut vcpu.state);
		}
		vcpu.halted = false;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		apic::{ApicState, DestinationMode},
		vcpu::SoftVcpuState,
	};

	const SPIV: u64 = 0xf0;

	fn ipi(vector: u8, mode: DeliveryMode, shorthand: Shorthand, dest: u8) -> Ipi {
		Ipi {
			vector,
			mode,
			dest_mode: DestinationMode::Physical,
			level: true,
			trigger: false,
			shorthand,
			dest,
		}
	}

	fn router(count: usize) -> InterruptRouter {
		let router = InterruptRouter::new(count, true);
		for idx in 0..count {
			router
				.apic(VcpuId::new(idx))
				.unwrap()
				.write(SPIV, 4, 0x1ff)
				.unwrap();
		}
		router
	}

	fn ready_vcpu(id: VcpuId) -> Vcpu<SoftVcpuState> {
		let mut vcpu = Vcpu::new(id, SoftVcpuState::new(), false);
		vcpu.state.write_vmcs(VmcsField::GuestRflags, EFLAGS_IF | 2);
		vcpu
	}

	#[test]
	fn test_injection_fields() {
		let mut state = SoftVcpuState::new();
		assert!(!can_inject(&state));
		state.write_vmcs(VmcsField::GuestRflags, EFLAGS_IF);
		assert!(can_inject(&state));

		inject_irq(&mut state, 0x30).unwrap();
		assert_eq!(
			state.read_vmcs(VmcsField::EntryInterruptionInfo),
			0x8000_0030
		);
		assert!(!can_inject(&state));
		assert!(matches!(
			inject_exception(&mut state, 13, Some(0)),
			Err(HypervisorError::EventPending)
		));

		let mut state = SoftVcpuState::new();
		inject_exception(&mut state, 13, Some(0)).unwrap();
		assert_eq!(
			state.read_vmcs(VmcsField::EntryInterruptionInfo),
			0x8000_0b0d
		);
		assert!(matches!(
			inject_irq(&mut state, 8),
			Err(HypervisorError::InvalidVector(8))
		));

		wait_for_guest_ready(&mut state);
		assert!(
			state
				.proc_controls()
				.contains(ProcControls::INTERRUPT_WINDOW_EXITING)
		);
		resume_guest(&mut state);
		assert!(
			!state
				.proc_controls()
				.contains(ProcControls::INTERRUPT_WINDOW_EXITING)
		);
	}

	#[test]
	fn test_fixed_broadcast() {
		let _ = env_logger::builder()
			.filter(None, log::LevelFilter::Trace)
			.is_test(true)
			.try_init();

		let router = router(3);
		assert!(router.deliver_ipi(
			VcpuId::BSP,
			ipi(0x40, DeliveryMode::Fixed, Shorthand::AllButSelf, 0)
		));
		assert!(!router.apic(VcpuId::BSP).unwrap().irr().test(0x40));
		for idx in 1..3 {
			assert!(router.apic(VcpuId::new(idx)).unwrap().irr().test(0x40));
			assert!(router.take_kick(VcpuId::new(idx)));
		}
		assert!(!router.take_kick(VcpuId::BSP));
	}

	#[test]
	fn test_lowest_priority_is_deterministic() {
		let winners: Vec<_> = (0..2)
			.map(|_| {
				let router = router(2);
				assert!(router.deliver_ipi(
					VcpuId::BSP,
					ipi(0x50, DeliveryMode::LowestPriority, Shorthand::None, 0xff)
				));
				let hits: Vec<_> = (0..2)
					.filter(|idx| router.apic(VcpuId::new(*idx)).unwrap().irr().test(0x50))
					.collect();
				assert_eq!(hits.len(), 1);
				hits[0]
			})
			.collect();
		assert_eq!(winners[0], winners[1]);

		// a target that already won has a higher counter and loses next time
		let router = router(2);
		let lp = ipi(0x50, DeliveryMode::LowestPriority, Shorthand::None, 0xff);
		router.deliver_ipi(VcpuId::BSP, lp);
		router.deliver_ipi(VcpuId::BSP, lp);
		assert!(router.apic(VcpuId::new(0)).unwrap().irr().test(0x50));
		assert!(router.apic(VcpuId::new(1)).unwrap().irr().test(0x50));
	}

	#[test]
	fn test_self_ipi_ignores_destination() {
		let router = router(2);
		// logical mode with an LDR no destination would match
		let mut self_ipi = ipi(0x60, DeliveryMode::Fixed, Shorthand::SelfOnly, 0);
		self_ipi.dest_mode = DestinationMode::Logical;
		assert!(router.deliver_ipi(VcpuId::new(1), self_ipi));
		assert!(router.apic(VcpuId::new(1)).unwrap().irr().test(0x60));
		assert!(!router.apic(VcpuId::BSP).unwrap().irr().test(0x60));
	}

	#[test]
	fn test_init_sipi_kicks_target() {
		let router = router(2);
		let init = Ipi {
			trigger: true,
			..ipi(0, DeliveryMode::Init, Shorthand::None, 1)
		};
		assert!(router.deliver_ipi(VcpuId::BSP, init));
		assert_eq!(
			router.apic(VcpuId::new(1)).unwrap().state(),
			ApicState::WaitSipi
		);
		assert!(router.deliver_ipi(
			VcpuId::BSP,
			ipi(0x9f, DeliveryMode::Startup, Shorthand::None, 1)
		));
		assert!(router.take_kick(VcpuId::new(1)));
		assert_eq!(router.apic(VcpuId::new(1)).unwrap().take_startup(), Some(0x9f));
	}

	#[test]
	fn test_accept_and_window_exit() {
		let router = router(1);
		let mut vcpu = ready_vcpu(VcpuId::BSP);
		router.deliver_ipi(
			VcpuId::BSP,
			ipi(0x30, DeliveryMode::Fixed, Shorthand::SelfOnly, 0),
		);
		router.deliver_ipi(
			VcpuId::BSP,
			ipi(0x31, DeliveryMode::Fixed, Shorthand::SelfOnly, 0),
		);

		router.accept_interrupt(&mut vcpu).unwrap();
		assert_eq!(
			vcpu.state.read_vmcs(VmcsField::EntryInterruptionInfo),
			0x8000_0031
		);
		// 0x30 is blocked by the in-service 0x31 and waits for EOI
		assert!(
			!vcpu
				.state
				.proc_controls()
				.contains(ProcControls::INTERRUPT_WINDOW_EXITING)
		);

		// the guest took the interrupt and signals EOI
		vcpu.state.write_vmcs(VmcsField::EntryInterruptionInfo, 0);
		router.apic(VcpuId::BSP).unwrap().write(0xb0, 4, 0).unwrap();
		router.accept_interrupt(&mut vcpu).unwrap();
		assert_eq!(
			vcpu.state.read_vmcs(VmcsField::EntryInterruptionInfo),
			0x8000_0030
		);
	}

	#[test]
	fn test_halted_vcpu_wakes_through_window() {
		let router = router(1);
		let mut vcpu = ready_vcpu(VcpuId::BSP);
		vcpu.halted = true;
		router.deliver_ipi(
			VcpuId::BSP,
			ipi(0x40, DeliveryMode::Fixed, Shorthand::SelfOnly, 0),
		);

		router.accept_interrupt(&mut vcpu).unwrap();
		assert!(!vcpu.is_halted());
		assert!(
			vcpu.state
				.proc_controls()
				.contains(ProcControls::INTERRUPT_WINDOW_EXITING)
		);
		assert_eq!(vcpu.state.read_vmcs(VmcsField::EntryInterruptionInfo), 0);

		router.pending_interrupt_handler(&mut vcpu).unwrap();
		assert_eq!(
			vcpu.state.read_vmcs(VmcsField::EntryInterruptionInfo),
			0x8000_0040
		);
		assert!(
			!vcpu
				.state
				.proc_controls()
				.contains(ProcControls::INTERRUPT_WINDOW_EXITING)
		);
	}

	#[test]
	fn test_pic_wakes_virtual_wire_cpu() {
		let router = router(2);
		// virtual wire on the BSP: LINT0 as ExtINT
		router
			.apic(VcpuId::BSP)
			.unwrap()
			.write(0x350, 4, 0x700)
			.unwrap();
		{
			let mut pic = router.pic();
			pic.write(0x20, 1, 0x11).unwrap();
			pic.write(0x21, 1, 0x20).unwrap();
			pic.write(0x21, 1, 0x04).unwrap();
			pic.write(0x21, 1, 0x01).unwrap();
			pic.write(0x21, 1, 0x00).unwrap();
		}
		router.pulse_irq(1, 0).unwrap();
		assert!(router.take_kick(VcpuId::BSP));
		assert!(!router.take_kick(VcpuId::new(1)));

		let mut vcpu = ready_vcpu(VcpuId::BSP);
		router.accept_interrupt(&mut vcpu).unwrap();
		assert_eq!(
			vcpu.state.read_vmcs(VmcsField::EntryInterruptionInfo),
			0x8000_0021
		);
	}
}
