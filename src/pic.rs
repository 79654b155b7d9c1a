//! Emulation of a cascaded pair of Intel 8259 programmable interrupt controllers.
//!
//! The master serves lines 0-7 and the slave lines 8-15. The slave is wired
//! to line 2 of the master.

use thiserror::Error;

use crate::consts::{
	PIC_ELCR_MASK_MASTER, PIC_ELCR_MASK_SLAVE, PIC_ELCR_MASTER, PIC_ELCR_SLAVE,
	PIC_MASTER_COMMAND, PIC_MASTER_DATA, PIC_MAX_SOURCES, PIC_NUM_PINS, PIC_SLAVE_COMMAND,
	PIC_SLAVE_DATA,
};

const MASTER: usize = 0;
const SLAVE: usize = 1;
const CASCADE_LINE: u8 = 2;
/// Returned by the priority search when no line is pending.
const NO_PRIORITY: u8 = 8;
/// Line reported when an acknowledge finds nothing to deliver.
const SPURIOUS_LINE: u8 = 7;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PicError {
	#[error("PIC registers are byte sized, got an access of {0} bytes")]
	InvalidAccessSize(usize),
	#[error("Port {0:#x} does not belong to the PIC")]
	InvalidPort(u16),
	#[error("IRQ line {0} does not exist")]
	InvalidIrq(u8),
	#[error("Interrupt source {0} is out of range")]
	InvalidSource(u8),
}

/// Register state of a single 8259.
#[derive(Debug, Clone, Default)]
pub struct PicState {
	/// Edge detection latch
	pub last_irr: u8,
	/// Interrupt request register
	pub irr: u8,
	/// Interrupt mask register
	pub imr: u8,
	/// In-service register
	pub isr: u8,
	/// Line with the highest priority
	pub priority_add: u8,
	pub irq_base: u8,
	pub read_reg_select: bool,
	pub poll: bool,
	pub special_mask: bool,
	/// 0 in normal operation, 1..=3 while the ICW sequence is in progress
	pub init_state: u8,
	/// ICW1 announced an ICW4
	pub init4: bool,
	pub auto_eoi: bool,
	pub rotate_on_auto_eoi: bool,
	pub special_fully_nested: bool,
	/// Level triggered lines (PIIX edge/level control register)
	pub elcr: u8,
	pub elcr_mask: u8,
}

impl PicState {
	fn new(elcr_mask: u8) -> Self {
		Self {
			elcr_mask,
			..Default::default()
		}
	}

	/// Returns the highest priority found in `mask` (highest = smallest
	/// number) or [`NO_PRIORITY`].
	fn priority(&self, mask: u8) -> u8 {
		if mask == 0 {
			return NO_PRIORITY;
		}
		let mut priority = 0;
		while mask & (1 << ((priority + self.priority_add) & 7)) == 0 {
			priority += 1;
		}
		priority
	}

	/// Level or edge update of line `irq`. Returns `None` if the line is
	/// masked, otherwise whether the request was newly raised.
	fn set_irq1(&mut self, irq: u8, level: bool) -> Option<bool> {
		let mask = 1 << irq;
		let mut ret = true;

		if self.elcr & mask != 0 {
			if level {
				ret = self.irr & mask == 0;
				self.irr |= mask;
				self.last_irr |= mask;
			} else {
				self.irr &= !mask;
				self.last_irr &= !mask;
			}
		} else if level {
			if self.last_irr & mask == 0 {
				ret = self.irr & mask == 0;
				self.irr |= mask;
			}
			self.last_irr |= mask;
		} else {
			self.last_irr &= !mask;
		}

		if self.imr & mask != 0 { None } else { Some(ret) }
	}
}

/// A master/slave pair of 8259s together with the shared line latches.
#[derive(Debug, Clone)]
pub struct PicPair {
	pics: [PicState; 2],
	/// INTR output of the master
	output: bool,
	wakeup_needed: bool,
	/// One bit per interrupt source asserting the pin.
	irq_states: [u64; PIC_NUM_PINS],
	/// Host lines whose in-service bit got cleared since the last drain.
	acked_lines: u16,
}

impl Default for PicPair {
	fn default() -> Self {
		Self::new()
	}
}

impl PicPair {
	pub fn new() -> Self {
		Self {
			pics: [
				PicState::new(PIC_ELCR_MASK_MASTER),
				PicState::new(PIC_ELCR_MASK_SLAVE),
			],
			output: false,
			wakeup_needed: false,
			irq_states: [0; PIC_NUM_PINS],
			acked_lines: 0,
		}
	}

	pub fn master(&self) -> &PicState {
		&self.pics[MASTER]
	}

	pub fn slave(&self) -> &PicState {
		&self.pics[SLAVE]
	}

	/// Whether the master currently signals an interrupt to the CPU.
	pub fn has_irq(&self) -> bool {
		self.output
	}

	/// State of the INTR line, same as [`PicPair::has_irq`].
	pub fn output(&self) -> bool {
		self.output
	}

	/// Returns and resets the flag that is raised whenever the output
	/// goes from idle to asserted.
	pub fn take_wakeup(&mut self) -> bool {
		std::mem::take(&mut self.wakeup_needed)
	}

	/// Drains the bitmask of host lines (0-15) that were acknowledged.
	pub fn take_acked_lines(&mut self) -> u16 {
		std::mem::take(&mut self.acked_lines)
	}

	/// Compares the highest priority request with the in-service lines.
	fn get_irq(&self, idx: usize) -> Option<u8> {
		let s = &self.pics[idx];
		let priority = s.priority(s.irr & !s.imr);
		if priority == NO_PRIORITY {
			return None;
		}
		// In special fully nested mode the slave does not block itself.
		let mut mask = s.isr;
		if s.special_fully_nested && idx == MASTER {
			mask &= !(1 << CASCADE_LINE);
		}
		let cur_priority = s.priority(mask);
		if priority < cur_priority {
			Some((priority + s.priority_add) & 7)
		} else {
			None
		}
	}

	fn clear_isr(&mut self, idx: usize, irq: u8) {
		self.pics[idx].isr &= !(1 << irq);
		let line = if idx == MASTER { irq } else { irq + 8 };
		if line != CASCADE_LINE {
			self.acked_lines |= 1 << line;
		}
	}

	/// Recomputes the output line. Must run after every state change.
	fn update_irq(&mut self) {
		if self.get_irq(SLAVE).is_some() {
			self.pics[MASTER].set_irq1(CASCADE_LINE, true);
			self.pics[MASTER].set_irq1(CASCADE_LINE, false);
		}
		let output = self.get_irq(MASTER).is_some();
		if output && !self.output {
			self.wakeup_needed = true;
		}
		self.output = output;
	}

	fn reset(&mut self, idx: usize) {
		let s = &mut self.pics[idx];
		let edge_irr = s.irr & !s.elcr;

		s.last_irr = 0;
		s.irr &= s.elcr;
		s.imr = 0;
		s.priority_add = 0;
		s.special_mask = false;
		s.read_reg_select = false;
		if !s.init4 {
			s.special_fully_nested = false;
			s.auto_eoi = false;
		}
		s.init_state = 1;

		for irq in 0..8 {
			if edge_irr & (1 << irq) != 0 {
				self.clear_isr(idx, irq);
			}
		}
	}

	fn ioport_write(&mut self, idx: usize, addr: u16, val: u8) {
		if addr & 1 == 0 {
			if val & 0x10 != 0 {
				self.pics[idx].init4 = val & 1 != 0;
				if val & 0x02 != 0 {
					debug!("PIC: single mode not supported");
				}
				if val & 0x08 != 0 {
					debug!("PIC: level sensitive irq not supported");
				}
				self.reset(idx);
			} else if val & 0x08 != 0 {
				let s = &mut self.pics[idx];
				if val & 0x04 != 0 {
					s.poll = true;
				}
				if val & 0x02 != 0 {
					s.read_reg_select = val & 1 != 0;
				}
				if val & 0x40 != 0 {
					s.special_mask = (val >> 5) & 1 != 0;
				}
			} else {
				self.ocw2(idx, val);
			}
			return;
		}

		let s = &mut self.pics[idx];
		match s.init_state {
			0 => {
				s.imr = val;
				self.update_irq();
			}
			1 => {
				s.irq_base = val & 0xf8;
				s.init_state = 2;
			}
			2 => {
				// ICW3 carries the cascade wiring, which is fixed here
				s.init_state = if s.init4 { 3 } else { 0 };
			}
			3 => {
				s.special_fully_nested = (val >> 4) & 1 != 0;
				s.auto_eoi = (val >> 1) & 1 != 0;
				s.init_state = 0;
			}
			state => debug_assert!(false, "invalid PIC init state {state}"),
		}
	}

	fn ocw2(&mut self, idx: usize, val: u8) {
		let cmd = val >> 5;
		match cmd {
			0 | 4 => self.pics[idx].rotate_on_auto_eoi = cmd >> 2 != 0,
			// (rotating) non-specific EOI
			1 | 5 => {
				let s = &mut self.pics[idx];
				let priority = s.priority(s.isr);
				if priority != NO_PRIORITY {
					let irq = (priority + s.priority_add) & 7;
					if cmd == 5 {
						s.priority_add = (irq + 1) & 7;
					}
					self.clear_isr(idx, irq);
					self.update_irq();
				}
			}
			// specific EOI
			3 => {
				self.clear_isr(idx, val & 7);
				self.update_irq();
			}
			// set priority
			6 => {
				self.pics[idx].priority_add = (val + 1) & 7;
				self.update_irq();
			}
			// rotate on specific EOI
			7 => {
				let irq = val & 7;
				self.pics[idx].priority_add = (irq + 1) & 7;
				self.clear_isr(idx, irq);
				self.update_irq();
			}
			_ => {}
		}
	}

	/// Acknowledges the highest pending line of the chip addressed by `addr`.
	fn poll_read(&mut self, idx: usize) -> u8 {
		match self.get_irq(idx) {
			Some(irq) => {
				if idx == SLAVE {
					self.pics[MASTER].isr &= !(1 << CASCADE_LINE);
					self.pics[MASTER].irr &= !(1 << CASCADE_LINE);
				}
				self.pics[idx].irr &= !(1 << irq);
				self.clear_isr(idx, irq);
				if idx == SLAVE || irq != CASCADE_LINE {
					self.update_irq();
				}
				irq
			}
			None => {
				self.update_irq();
				SPURIOUS_LINE
			}
		}
	}

	fn ioport_read(&mut self, idx: usize, addr: u16) -> u8 {
		if self.pics[idx].poll {
			let ret = self.poll_read(idx);
			self.pics[idx].poll = false;
			return ret;
		}

		let s = &self.pics[idx];
		if addr & 1 == 0 {
			if s.read_reg_select { s.isr } else { s.irr }
		} else {
			s.imr
		}
	}

	/// Guest write to one of the PIC or ELCR ports.
	pub fn write(&mut self, port: u16, size: usize, val: u32) -> Result<(), PicError> {
		if size != 1 {
			return Err(PicError::InvalidAccessSize(size));
		}
		let val = val as u8;
		trace!("PIC write {val:#x} to port {port:#x}");
		match port {
			PIC_MASTER_COMMAND | PIC_MASTER_DATA | PIC_SLAVE_COMMAND | PIC_SLAVE_DATA => {
				self.ioport_write(usize::from(port >> 7), port, val);
			}
			PIC_ELCR_MASTER | PIC_ELCR_SLAVE => {
				let s = &mut self.pics[usize::from(port & 1)];
				s.elcr = val & s.elcr_mask;
			}
			port => return Err(PicError::InvalidPort(port)),
		}
		Ok(())
	}

	/// Guest read from one of the PIC or ELCR ports.
	pub fn read(&mut self, port: u16, size: usize) -> Result<u32, PicError> {
		if size != 1 {
			return Err(PicError::InvalidAccessSize(size));
		}
		let val = match port {
			PIC_MASTER_COMMAND | PIC_MASTER_DATA | PIC_SLAVE_COMMAND | PIC_SLAVE_DATA => {
				self.ioport_read(usize::from(port >> 7), port)
			}
			PIC_ELCR_MASTER | PIC_ELCR_SLAVE => self.pics[usize::from(port & 1)].elcr,
			port => return Err(PicError::InvalidPort(port)),
		};
		trace!("PIC read {val:#x} from port {port:#x}");
		Ok(u32::from(val))
	}

	/// Drives line `irq` on behalf of `source`.
	///
	/// The pin level is the OR of all sources sharing it. Returns `false`
	/// when the line is masked or a level triggered request was already
	/// pending.
	pub fn set_irq(&mut self, irq: u8, source: u8, level: bool) -> Result<bool, PicError> {
		if usize::from(irq) >= PIC_NUM_PINS {
			return Err(PicError::InvalidIrq(irq));
		}
		if source >= PIC_MAX_SOURCES {
			return Err(PicError::InvalidSource(source));
		}

		let state = &mut self.irq_states[usize::from(irq)];
		if level {
			*state |= 1 << source;
		} else {
			*state &= !(1 << source);
		}
		let irq_level = *state != 0;

		let ret = self.pics[usize::from(irq >> 3)].set_irq1(irq & 7, irq_level);
		self.update_irq();
		Ok(ret.unwrap_or(false))
	}

	/// Withdraws `source` from every line it asserts.
	pub fn clear_source(&mut self, source: u8) -> Result<(), PicError> {
		if source >= PIC_MAX_SOURCES {
			return Err(PicError::InvalidSource(source));
		}
		for state in self.irq_states.iter_mut() {
			*state &= !(1 << source);
		}
		Ok(())
	}

	fn intack(&mut self, idx: usize, irq: u8) {
		let s = &mut self.pics[idx];
		s.isr |= 1 << irq;
		// level triggered requests stay pending
		if s.elcr & (1 << irq) == 0 {
			s.irr &= !(1 << irq);
		}
		if s.auto_eoi {
			if s.rotate_on_auto_eoi {
				s.priority_add = (irq + 1) & 7;
			}
			self.clear_isr(idx, irq);
		}
	}

	/// Interrupt acknowledge cycle: returns the vector to inject and marks
	/// the line in service.
	pub fn read_irq(&mut self) -> u8 {
		let intno = match self.get_irq(MASTER) {
			Some(irq) => {
				self.intack(MASTER, irq);
				if irq == CASCADE_LINE {
					let irq2 = match self.get_irq(SLAVE) {
						Some(irq2) => {
							self.intack(SLAVE, irq2);
							irq2
						}
						None => SPURIOUS_LINE,
					};
					self.pics[SLAVE].irq_base.wrapping_add(irq2)
				} else {
					self.pics[MASTER].irq_base.wrapping_add(irq)
				}
			}
			None => self.pics[MASTER].irq_base.wrapping_add(SPURIOUS_LINE),
		};
		self.update_irq();
		intno
	}
}
