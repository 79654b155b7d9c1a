//! Emulated local APIC, one per virtual CPU.
//!
//! The register page is reached through the MMIO dispatch table, see
//! [`crate::mmio::ApicMmio`]. Interrupts arrive through [`LocalApic::accept_irq`]
//! and leave through [`LocalApic::get_interrupt`] when the vCPU is able to
//! take them.

mod ipi;
mod regs;

use thiserror::Error;

pub use self::{
	ipi::{DeliveryMode, DestinationMode, Ipi, Shorthand},
	regs::{ApicRegister, Lvt},
};
use self::regs::*;
use crate::{
	bitmap::VectorBitmap,
	consts::{APIC_DEFAULT_BASE, IA32_APIC_BASE_BSP, IA32_APIC_BASE_ENABLE},
	pic::PicPair,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ApicError {
	#[error("Invalid APIC access of {len} bytes at offset {offset:#x}")]
	InvalidAccess { offset: u64, len: usize },
	#[error("APIC offset {0:#x} is reserved")]
	ReservedRegister(u64),
	#[error("APIC register {0:?} is read only")]
	ReadOnly(ApicRegister),
}

/// Start-up state of the processor owning the APIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicState {
	/// Powered on, not yet initialized.
	New,
	/// Received INIT, waiting for a start-up IPI.
	WaitSipi,
	Run,
}

/// Source of the next interrupt a vCPU should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInterrupt {
	/// The 8259 pair has a request and LINT0 is configured for ExtINT.
	Pic,
	Vector(u8),
}

#[derive(Debug, Clone)]
pub struct LocalApic {
	vcpu: usize,
	id: u8,
	base_msr: u64,

	tpr: u32,
	ppr: u32,
	ldr: u32,
	dfr: u32,
	spiv: u32,
	esr: u32,
	icr: u32,
	icr2: u32,
	lvt: [u32; APIC_LVT_NUM],
	tmict: u32,
	tdcr: u32,

	irr: VectorBitmap,
	isr: VectorBitmap,
	tmr: VectorBitmap,
	irr_pending: bool,
	isr_count: u32,
	highest_isr_cache: Option<u8>,

	/// Lowest priority arbitration counter
	arb_prio: u32,
	state: ApicState,
	sipi_vector: u8,
	pending_startup: Option<u8>,
	/// Set whenever the owner should re-check for deliverable interrupts.
	eval_requested: bool,
}

impl LocalApic {
	/// Creates the APIC of virtual CPU `vcpu`. CPU 0 is the bootstrap
	/// processor and starts out running.
	pub fn new(vcpu: usize, enabled: bool) -> Self {
		let mut base_msr = APIC_DEFAULT_BASE;
		if enabled {
			base_msr |= IA32_APIC_BASE_ENABLE;
		}

		let mut apic = Self {
			vcpu,
			id: vcpu as u8,
			base_msr,
			tpr: 0,
			ppr: 0,
			ldr: 0,
			dfr: APIC_DFR_FLAT,
			spiv: 0,
			esr: 0,
			icr: 0,
			icr2: 0,
			lvt: [APIC_LVT_MASKED; APIC_LVT_NUM],
			tmict: 0,
			tdcr: 0,
			irr: VectorBitmap::new(),
			isr: VectorBitmap::new(),
			tmr: VectorBitmap::new(),
			irr_pending: false,
			isr_count: 0,
			highest_isr_cache: None,
			arb_prio: 0,
			state: if vcpu == 0 {
				ApicState::Run
			} else {
				ApicState::New
			},
			sipi_vector: 0,
			pending_startup: None,
			eval_requested: false,
		};
		apic.reset();
		apic
	}

	/// Puts every register back into its power-on state.
	pub fn reset(&mut self) {
		debug!("Reset local APIC of vCPU {}", self.vcpu);

		self.id = self.vcpu as u8;
		self.lvt = [APIC_LVT_MASKED; APIC_LVT_NUM];
		self.dfr = APIC_DFR_FLAT;
		self.tpr = 0;
		self.ldr = 0;
		self.esr = 0;
		self.icr = 0;
		self.icr2 = 0;
		self.tdcr = 0;
		self.tmict = 0;
		self.irr.clear_all();
		self.isr.clear_all();
		self.tmr.clear_all();
		self.irr_pending = false;
		self.isr_count = 0;
		self.highest_isr_cache = None;
		self.update_ppr();
		self.arb_prio = 0;

		if self.is_bsp() {
			// LINT0 delivers the 8259 output as ExtINT, software enabled
			self.lvt[Lvt::Lint0 as usize] = APIC_MODE_EXTINT << 8;
			self.spiv = APIC_SPIV_APIC_ENABLED;
		} else {
			self.spiv = 0;
		}
	}

	pub fn vcpu(&self) -> usize {
		self.vcpu
	}

	pub fn id(&self) -> u8 {
		self.id
	}

	fn is_bsp(&self) -> bool {
		self.vcpu == 0
	}

	pub fn state(&self) -> ApicState {
		self.state
	}

	pub fn arb_prio(&self) -> u32 {
		self.arb_prio
	}

	pub fn ppr(&self) -> u32 {
		self.ppr
	}

	pub fn tpr(&self) -> u32 {
		self.tpr
	}

	pub fn irr(&self) -> &VectorBitmap {
		&self.irr
	}

	pub fn isr(&self) -> &VectorBitmap {
		&self.isr
	}

	pub fn tmr(&self) -> &VectorBitmap {
		&self.tmr
	}

	pub fn lvt(&self, lvt: Lvt) -> u32 {
		self.lvt[lvt as usize]
	}

	/// Value of the `IA32_APIC_BASE` MSR.
	pub fn base_msr(&self) -> u64 {
		if self.is_bsp() {
			self.base_msr | IA32_APIC_BASE_BSP
		} else {
			self.base_msr & !IA32_APIC_BASE_BSP
		}
	}

	pub fn set_base_msr(&mut self, value: u64) {
		self.base_msr = value & 0xffff_ffff;
		if !self.hw_enabled() {
			warn!("vCPU {} disabled its local APIC", self.vcpu);
		}
	}

	pub fn hw_enabled(&self) -> bool {
		self.base_msr & IA32_APIC_BASE_ENABLE != 0
	}

	pub fn sw_enabled(&self) -> bool {
		self.spiv & APIC_SPIV_APIC_ENABLED != 0
	}

	pub fn enabled(&self) -> bool {
		self.hw_enabled() && self.sw_enabled()
	}

	/// Returns and clears the start-up vector received while waiting for SIPI.
	pub fn take_startup(&mut self) -> Option<u8> {
		self.pending_startup.take()
	}

	/// Returns and clears the request to re-evaluate pending interrupts.
	pub fn take_eval_request(&mut self) -> bool {
		std::mem::take(&mut self.eval_requested)
	}

	fn update_ppr(&mut self) {
		let old = self.ppr;
		let isrv = u32::from(self.highest_isr_cache.unwrap_or(0));
		let ppr = if (self.tpr & 0xf0) >= (isrv & 0xf0) {
			self.tpr & 0xff
		} else {
			isrv & 0xf0
		};
		trace!(
			"vCPU {}: ppr {:#x}, isr {:#x}, tpr {:#x}",
			self.vcpu, ppr, isrv, self.tpr
		);
		self.ppr = ppr;
		if ppr < old {
			self.eval_requested = true;
		}
	}

	fn set_isr(&mut self, vector: u8) {
		if !self.isr.test_and_set(vector) {
			self.isr_count += 1;
		}
		if self.highest_isr_cache.is_none_or(|highest| vector > highest) {
			self.highest_isr_cache = Some(vector);
		}
	}

	fn clear_isr(&mut self, vector: u8) {
		if self.isr.test_and_clear(vector) {
			self.isr_count -= 1;
			self.highest_isr_cache = self.isr.highest();
		}
	}

	fn clear_irr(&mut self, vector: u8) {
		self.irr.clear(vector);
		self.irr_pending = !self.irr.is_empty();
	}

	fn set_eoi(&mut self) {
		let Some(vector) = self.highest_isr_cache else {
			return;
		};
		trace!("vCPU {}: EOI for vector {vector:#x}", self.vcpu);
		self.clear_isr(vector);
		self.update_ppr();
	}

	fn lvt_masked(&self, lvt: Lvt) -> bool {
		self.lvt[lvt as usize] & APIC_LVT_MASKED != 0
	}

	/// Reads the 32-bit register at `offset` into the APIC page.
	pub fn read(&self, offset: u64, len: usize) -> Result<u32, ApicError> {
		if len != 4 || offset & 0xf != 0 {
			return Err(ApicError::InvalidAccess { offset, len });
		}
		if !ApicRegister::readable(offset) {
			return Err(ApicError::ReservedRegister(offset));
		}

		let val = match ApicRegister::try_from(offset)? {
			ApicRegister::Id => u32::from(self.id) << 24,
			ApicRegister::Version => APIC_VERSION,
			ApicRegister::TaskPriority => self.tpr,
			// arbitration priority is not modelled
			ApicRegister::ArbitrationPriority => 0,
			ApicRegister::ProcessorPriority => self.ppr,
			ApicRegister::LogicalDestination => self.ldr,
			ApicRegister::DestinationFormat => self.dfr,
			ApicRegister::SpuriousVector => self.spiv,
			ApicRegister::Isr(i) => self.isr.word(i),
			ApicRegister::Tmr(i) => self.tmr.word(i),
			ApicRegister::Irr(i) => self.irr.word(i),
			ApicRegister::ErrorStatus => self.esr,
			ApicRegister::InterruptCommand => self.icr,
			ApicRegister::InterruptCommandHigh => self.icr2,
			ApicRegister::Lvt(lvt) => self.lvt[lvt as usize],
			ApicRegister::TimerInitialCount => self.tmict,
			// the timer never counts down
			ApicRegister::TimerCurrentCount => 0,
			ApicRegister::TimerDivideConfig => self.tdcr,
			reg @ (ApicRegister::Eoi | ApicRegister::RemoteRead) => {
				return Err(ApicError::ReadOnly(reg));
			}
		};
		trace!("vCPU {}: APIC read {offset:#x} -> {val:#x}", self.vcpu);
		Ok(val)
	}

	/// Writes `val` to the register at `offset`.
	///
	/// A write to the low half of the ICR returns the interprocessor
	/// interrupt it encodes. The caller routes it once this APIC is no
	/// longer borrowed.
	pub fn write(&mut self, offset: u64, len: usize, val: u32) -> Result<Option<Ipi>, ApicError> {
		if len != 4 || offset & 0xf != 0 {
			return Err(ApicError::InvalidAccess { offset, len });
		}
		trace!("vCPU {}: APIC write {offset:#x} <- {val:#x}", self.vcpu);

		match ApicRegister::try_from(offset)? {
			ApicRegister::Id => self.id = (val >> 24) as u8,
			ApicRegister::TaskPriority => {
				self.tpr = val & 0xff;
				self.update_ppr();
			}
			ApicRegister::Eoi => self.set_eoi(),
			ApicRegister::LogicalDestination => self.ldr = val & APIC_LDR_MASK,
			ApicRegister::DestinationFormat => self.dfr = val | APIC_DFR_CLUSTER,
			ApicRegister::SpuriousVector => {
				self.spiv = val & 0x3ff;
				if !self.sw_enabled() {
					for lvt in self.lvt.iter_mut() {
						*lvt |= APIC_LVT_MASKED;
					}
				}
			}
			ApicRegister::InterruptCommand => {
				self.icr = val & !APIC_SEND_PENDING;
				let ipi = Ipi::from_icr(self.icr, self.icr2);
				if ipi.mode == DeliveryMode::ExtInt {
					warn!("vCPU {}: dropping ExtINT IPI {:?}", self.vcpu, ipi);
					return Ok(None);
				}
				debug!("vCPU {}: sending IPI {:?}", self.vcpu, ipi);
				return Ok(Some(ipi));
			}
			ApicRegister::InterruptCommandHigh => self.icr2 = val & APIC_LDR_MASK,
			ApicRegister::Lvt(Lvt::Timer) => self.lvt[Lvt::Timer as usize] = val,
			ApicRegister::Lvt(lvt) => {
				let mut val = val;
				if !self.sw_enabled() {
					val |= APIC_LVT_MASKED;
				}
				self.lvt[lvt as usize] = val & APIC_LVT_WRITE_MASK[lvt as usize];
			}
			ApicRegister::TimerInitialCount => self.tmict = val,
			ApicRegister::TimerDivideConfig => self.tdcr = val,
			reg => return Err(ApicError::ReadOnly(reg)),
		}
		Ok(None)
	}

	fn match_physical(&self, dest: u8) -> bool {
		dest == 0xff || self.id == dest
	}

	fn match_logical(&self, mda: u8) -> bool {
		let logical_id = (self.ldr >> 24) as u8;
		match self.dfr {
			APIC_DFR_FLAT => logical_id & mda != 0,
			APIC_DFR_CLUSTER => {
				(logical_id & 0xf0) == (mda & 0xf0) && (logical_id & mda & 0x0f) != 0
			}
			dfr => {
				debug!("vCPU {}: bad DFR {dfr:#x}", self.vcpu);
				false
			}
		}
	}

	/// Whether `ipi`, sent from vCPU `source`, addresses this APIC.
	pub fn match_dest(&self, source: usize, ipi: &Ipi) -> bool {
		match ipi.shorthand {
			Shorthand::None => match ipi.dest_mode {
				DestinationMode::Physical => self.match_physical(ipi.dest),
				DestinationMode::Logical => self.match_logical(ipi.dest),
			},
			Shorthand::SelfOnly => self.vcpu == source,
			Shorthand::AllIncludingSelf => true,
			Shorthand::AllButSelf => self.vcpu != source,
		}
	}

	/// Accepts an interrupt message. Returns `true` if it was taken.
	pub fn accept_irq(&mut self, mode: DeliveryMode, vector: u8, level: bool, trigger: bool) -> bool {
		match mode {
			DeliveryMode::LowestPriority | DeliveryMode::Fixed => {
				if mode == DeliveryMode::LowestPriority {
					self.arb_prio += 1;
				}
				if !self.enabled() {
					return false;
				}
				if vector < 16 {
					warn!("vCPU {}: illegal vector {vector} delivered", self.vcpu);
					self.esr |= APIC_ESR_RECV_ILLEGAL_VECTOR;
					return false;
				}

				if trigger {
					self.tmr.set(vector);
				} else {
					self.tmr.clear(vector);
				}
				self.irr.set(vector);
				self.irr_pending = true;
				self.eval_requested = true;
				true
			}
			DeliveryMode::RemoteRead | DeliveryMode::Nmi => {
				self.eval_requested = true;
				true
			}
			DeliveryMode::Smi => {
				debug!("vCPU {}: ignoring SMI", self.vcpu);
				false
			}
			DeliveryMode::Init => {
				if trigger && !level {
					// level de-assert
					return false;
				}
				if self.state == ApicState::Run {
					debug!("vCPU {}: INIT while already running", self.vcpu);
					return false;
				}
				self.reset();
				self.arb_prio = u32::from(self.id);
				self.state = ApicState::WaitSipi;
				debug!("vCPU {}: INIT, waiting for SIPI", self.vcpu);
				true
			}
			DeliveryMode::Startup => {
				if self.state != ApicState::WaitSipi {
					debug!(
						"vCPU {}: SIPI {vector:#x} in state {:?}",
						self.vcpu, self.state
					);
					return false;
				}
				self.sipi_vector = vector;
				self.state = ApicState::Run;
				self.pending_startup = Some(vector);
				self.eval_requested = true;
				true
			}
			DeliveryMode::ExtInt => {
				error!("vCPU {}: ExtINT can not be delivered as IPI", self.vcpu);
				debug_assert!(false, "ExtINT IPI");
				false
			}
		}
	}

	/// Whether the 8259 output reaches this CPU through LINT0.
	pub fn accept_pic_intr(&self) -> bool {
		let lvt0 = self.lvt[Lvt::Lint0 as usize];
		!self.lvt_masked(Lvt::Lint0) && (lvt0 >> 8) & 0x7 == APIC_MODE_EXTINT && self.sw_enabled()
	}

	/// Highest priority deliverable interrupt, if any.
	pub fn has_interrupt(&self, pic_has_irq: bool) -> Option<PendingInterrupt> {
		if self.accept_pic_intr() && pic_has_irq {
			return Some(PendingInterrupt::Pic);
		}
		if !self.irr_pending {
			return None;
		}
		let vector = self.irr.highest()?;
		if u32::from(vector) & 0xf0 <= self.ppr & 0xf0 {
			return None;
		}
		Some(PendingInterrupt::Vector(vector))
	}

	/// Acknowledges the highest priority interrupt and returns its vector.
	pub fn get_interrupt(&mut self, pic: &mut PicPair) -> Option<u8> {
		match self.has_interrupt(pic.has_irq())? {
			PendingInterrupt::Pic => Some(pic.read_irq()),
			PendingInterrupt::Vector(vector) => {
				self.set_isr(vector);
				self.update_ppr();
				self.clear_irr(vector);
				Some(vector)
			}
		}
	}
}
