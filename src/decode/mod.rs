//! Just enough of an x86 instruction decoder to emulate MMIO accesses.
//!
//! Only the register and immediate forms of `mov` are understood, which is
//! what compilers emit for volatile accesses to device registers.

pub mod realmode;

use align_address::Align;
use thiserror::Error;
use x86_64::registers::control::Cr4Flags;

use crate::{
	GuestPhysAddr, GuestVirtAddr,
	consts::PAGE_SIZE,
	mem::{GuestMemory, MemoryError},
	paging::{PagetableError, virt_to_phys},
	vcpu::Gpr,
};

#[derive(Error, Debug)]
pub enum DecodeError {
	#[error("Instruction fetch of {len} bytes at {eip:#x} crosses a page boundary")]
	CrossPage { eip: u64, len: usize },

	#[error("Instruction consists only of prefixes")]
	MissingOpcode,

	#[error("Instruction is truncated after {0} bytes")]
	Truncated(usize),

	#[error("Multi-byte opcode {0:02x?} can not be emulated")]
	MultiByteOpcode(Vec<u8>),

	#[error("Opcode {opcode:#04x} can not be emulated (instruction {bytes:02x?})")]
	UnsupportedOpcode { opcode: u8, bytes: Vec<u8> },

	#[error("Far jump to {0:#x} leaves the fetched code window")]
	JumpOutOfWindow(u64),

	#[error(transparent)]
	Pagetable(#[from] PagetableError),

	#[error(transparent)]
	Memory(#[from] MemoryError),
}

/// Source or destination of the emulated access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
	Register(Gpr),
	/// Bits 8..16 of the register (`%ah` to `%bh`)
	HighByte(Gpr),
	Immediate(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
	pub operand: Operand,
	/// Access width in bytes: 1, 2 or 4
	pub width: usize,
}

impl DecodedInstruction {
	/// Mask covering the access width.
	pub fn width_mask(&self) -> u32 {
		match self.width {
			4 => u32::MAX,
			width => (1 << (width * 8)) - 1,
		}
	}
}

/// Copies `buf.len()` instruction bytes at linear address `eip` out of guest
/// memory.
///
/// With paging enabled, `eip` is translated through the 2-level page
/// directory at `cr3`. Without paging the linear address is the physical
/// address. The fetch window may not span a page boundary.
pub fn fetch_instruction(
	mem: &(impl GuestMemory + ?Sized),
	eip: u64,
	cr3: u64,
	cr4: u64,
	paging: bool,
	buf: &mut [u8],
) -> Result<(), DecodeError> {
	let len = buf.len();
	if cr4 & Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits() != 0 {
		error!("Walking PAE paging structures is not supported");
		return Err(PagetableError::PaeUnsupported.into());
	}
	if eip.align_down(PAGE_SIZE) != (eip + len as u64).align_down(PAGE_SIZE) {
		return Err(DecodeError::CrossPage { eip, len });
	}

	let phys = if paging {
		virt_to_phys(GuestVirtAddr::new(eip), mem, cr3)?
	} else {
		GuestPhysAddr::new(eip)
	};
	trace!("Fetch {len} bytes at {eip:#x} (physical {:#x})", phys.as_u64());
	mem.read(phys, buf)?;
	Ok(())
}

fn is_prefix(byte: u8) -> bool {
	matches!(byte, 0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0x66 | 0x67)
}

/// Decodes the operand and width of a `mov` between a register or
/// immediate and memory.
pub fn decode_instruction(instr: &[u8]) -> Result<DecodedInstruction, DecodeError> {
	let opcode_index = instr
		.iter()
		.position(|byte| !is_prefix(*byte))
		.ok_or(DecodeError::MissingOpcode)?;
	let operand_size_override = instr[..opcode_index].contains(&0x66);

	let opcode = instr[opcode_index];
	if opcode == 0x0f {
		return Err(DecodeError::MultiByteOpcode(instr.to_vec()));
	}
	let width = if operand_size_override {
		2
	} else if opcode & 1 != 0 {
		4
	} else {
		1
	};

	let modrm = *instr
		.get(opcode_index + 1)
		.ok_or(DecodeError::Truncated(instr.len()))?;

	let operand = match opcode {
		0x88..=0x8c => {
			let reg = usize::from((modrm >> 3) & 0x7);
			// without REX, byte indices 4-7 are the high bytes of a..d
			if width == 1 && reg >= 4 {
				Operand::HighByte(Gpr::ALL[reg - 4])
			} else {
				Operand::Register(Gpr::ALL[reg])
			}
		}
		0xc6 | 0xc7 => {
			if instr.len() < opcode_index + 2 + width {
				return Err(DecodeError::Truncated(instr.len()));
			}
			// the immediate forms the tail of the instruction
			let imm = instr[instr.len() - width..]
				.iter()
				.rev()
				.fold(0u32, |imm, byte| (imm << 8) | u32::from(*byte));
			Operand::Immediate(imm)
		}
		opcode => {
			return Err(DecodeError::UnsupportedOpcode {
				opcode,
				bytes: instr.to_vec(),
			});
		}
	};

	trace!("Decoded {instr:02x?} as {operand:?} ({width} bytes)");
	Ok(DecodedInstruction { operand, width })
}
