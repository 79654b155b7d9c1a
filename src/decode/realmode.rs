//! Interpreter for the real-mode start-up trampoline of an application
//! processor.
//!
//! Only tracks a single segment that is used for both code and data. That
//! is enough to follow a typical SMP trampoline through its `lidt`/`lgdt`
//! and the far jump into protected mode.

use super::DecodeError;
use crate::{
	GuestPhysAddr,
	mem::GuestMemory,
	vcpu::{Gpr, VcpuState, VmcsField},
};

/// Real-mode segments are 16 byte aligned.
const SEGMENT_SHIFT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealModeOutcome {
	/// A far jump left the fetched window. Execution continues at `target`
	/// with CS loaded from `segment`.
	Jump { target: u64, segment: u16 },
	/// The window was consumed without leaving it.
	Exhausted,
}

struct Cursor<'a> {
	code: &'a [u8],
	pos: usize,
}

impl Cursor<'_> {
	fn peek(&self) -> Option<u8> {
		self.code.get(self.pos).copied()
	}

	fn skip(&mut self, len: usize) {
		self.pos += len;
	}

	fn u8(&mut self) -> Option<u8> {
		let byte = self.peek()?;
		self.pos += 1;
		Some(byte)
	}

	fn u16(&mut self) -> Option<u16> {
		let bytes = self.code.get(self.pos..self.pos + 2)?;
		self.pos += 2;
		Some(u16::from_le_bytes([bytes[0], bytes[1]]))
	}

	fn u32(&mut self) -> Option<u32> {
		let bytes = self.code.get(self.pos..self.pos + 4)?;
		self.pos += 4;
		Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
	}
}

fn linear(segment: u16, offset: u16) -> GuestPhysAddr {
	GuestPhysAddr::new((u64::from(segment) << SEGMENT_SHIFT) + u64::from(offset))
}

/// Reads a 6 byte pseudo descriptor (16-bit limit, 32-bit base).
fn read_descriptor(
	mem: &(impl GuestMemory + ?Sized),
	addr: GuestPhysAddr,
) -> Result<(u64, u64), DecodeError> {
	let limit = mem.read_u16(addr)?;
	let base = mem.read_u32(addr + 2u64)?;
	Ok((u64::from(base), u64::from(limit)))
}

/// Runs `code`, fetched from linear address `eip`, until a far jump leaves
/// it.
///
/// Descriptor table loads and `mov eax, [mem]` update `state`. Stores of
/// immediates go straight to guest memory. `segment` tracks the code and
/// data segment and is updated by far jumps.
pub fn emulate_realmode<S: VcpuState>(
	mem: &(impl GuestMemory + ?Sized),
	code: &[u8],
	segment: &mut u16,
	eip: u64,
	state: &mut S,
) -> Result<RealModeOutcome, DecodeError> {
	let window_end = eip + code.len() as u64;
	let mut cursor = Cursor { code, pos: 0 };

	loop {
		match step(mem, &mut cursor, segment, eip, window_end, state)? {
			Step::Continue => {}
			Step::Leave(outcome) => return Ok(outcome),
			Step::End => return Ok(RealModeOutcome::Exhausted),
		}
	}
}

enum Step {
	Continue,
	Leave(RealModeOutcome),
	/// The window is consumed or the next instruction is cut off.
	End,
}

/// Interprets one instruction.
fn step<S: VcpuState>(
	mem: &(impl GuestMemory + ?Sized),
	cursor: &mut Cursor<'_>,
	segment: &mut u16,
	eip: u64,
	window_end: u64,
	state: &mut S,
) -> Result<Step, DecodeError> {
	let Some(mut opcode) = cursor.u8() else {
		return Ok(Step::End);
	};
	let operand_size_override = opcode == 0x66;
	if operand_size_override {
		let Some(next) = cursor.u8() else {
			return Ok(Step::End);
		};
		opcode = next;
	}

	match opcode {
		0x0f => {
			if cursor.u8() != Some(0x01) {
				return Ok(Step::Continue);
			}
			let Some(modrm) = cursor.u8() else {
				return Ok(Step::End);
			};
			if !matches!(modrm, 0x1e | 0x16) {
				return Ok(Step::Continue);
			}
			let Some(offset) = cursor.u16() else {
				return Ok(Step::End);
			};
			let addr = linear(*segment, offset);
			let (base, limit) = read_descriptor(mem, addr)?;
			if modrm == 0x1e {
				debug!("lidtl {:#x}: base {base:#x}, limit {limit:#x}", addr.as_u64());
				state.write_vmcs(VmcsField::GuestIdtrBase, base);
				state.write_vmcs(VmcsField::GuestIdtrLimit, limit);
			} else {
				debug!("lgdtl {:#x}: base {base:#x}, limit {limit:#x}", addr.as_u64());
				state.write_vmcs(VmcsField::GuestGdtrBase, base);
				state.write_vmcs(VmcsField::GuestGdtrLimit, limit);
			}
		}
		0xea => {
			// far jump ptr16:16 or, with an operand size override, ptr16:32
			let target = if operand_size_override {
				let Some(offset) = cursor.u32() else {
					return Ok(Step::End);
				};
				let Some(selector) = cursor.u16() else {
					return Ok(Step::End);
				};
				// assumes a flat code descriptor, so the offset is linear
				*segment = selector;
				u64::from(offset)
			} else {
				let Some(offset) = cursor.u16() else {
					return Ok(Step::End);
				};
				let Some(selector) = cursor.u16() else {
					return Ok(Step::End);
				};
				*segment = selector;
				linear(selector, offset).as_u64()
			};
			debug!("ljmp {target:#x}, cs now {:#06x}", *segment);

			if target >= window_end {
				state.write_vmcs(VmcsField::GuestCsSelector, u64::from(*segment));
				return Ok(Step::Leave(RealModeOutcome::Jump {
					target,
					segment: *segment,
				}));
			}
			if target < eip {
				return Err(DecodeError::JumpOutOfWindow(target));
			}
			cursor.pos = (target - eip) as usize;
		}
		0xa1 => {
			// mov eax, moffs16
			let Some(offset) = cursor.u16() else {
				return Ok(Step::End);
			};
			let addr = linear(*segment, offset);
			let eax = mem.read_u32(addr)?;
			trace!("mov {:#x}, eax = {eax:#x}", addr.as_u64());
			state.write_register(Gpr::Rax, u64::from(eax));
		}
		0xc7 => {
			// only the disp16 form of mov r/m, imm
			if cursor.peek() != Some(0x06) {
				return Ok(Step::Continue);
			}
			cursor.skip(1);
			let Some(offset) = cursor.u16() else {
				return Ok(Step::End);
			};
			let addr = linear(*segment, offset);
			if operand_size_override {
				let Some(imm) = cursor.u32() else {
					return Ok(Step::End);
				};
				trace!("movl {imm:#x}, {:#x}", addr.as_u64());
				mem.write_u32(addr, imm)?;
			} else {
				let Some(imm) = cursor.u16() else {
					return Ok(Step::End);
				};
				trace!("movw {imm:#x}, {:#x}", addr.as_u64());
				mem.write_u16(addr, imm)?;
			}
		}
		0xba => {
			// mov dx, imm
			cursor.skip(if operand_size_override { 4 } else { 2 });
		}
		0x8c | 0x8e => {
			// mov to or from a segment register
			cursor.skip(1);
		}
		_ => {
			// anything else is assumed to be a single byte we can ignore
		}
	}

	Ok(Step::Continue)
}
