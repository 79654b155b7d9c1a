use thiserror::Error;

use crate::{
	apic::ApicError, decode::DecodeError, ioport::IoPortError, mem::MemoryError, mmio::MmioError,
	paging::PagetableError, pic::PicError,
};

/// Everything that can take a virtual CPU offline.
#[derive(Error, Debug)]
pub enum HypervisorError {
	#[error("Guest wrote reserved bits {bits:#x} to CR{cr}")]
	ReservedBits { cr: u8, bits: u64 },

	#[error("Guest tried to disable paging")]
	PagingDisable,

	#[error("Unsupported control register access: {0}")]
	UnsupportedCrAccess(&'static str),

	#[error("Unable to access msr {0:#x}")]
	UnsupportedMsr(u32),

	#[error("Unsupported cpuid leaf {leaf:#x} (subleaf {subleaf:#x})")]
	UnsupportedCpuid { leaf: u32, subleaf: u32 },

	#[error("String or rep I/O on port {0:#x} is not supported")]
	StringIo(u16),

	#[error("Access to undefined I/O port {0:#x}")]
	UnmappedPort(u16),

	#[error("I/O backend failed on port {port:#x}: {reason}")]
	IoBackend { port: u16, reason: String },

	#[error("EPT violation at {0:#x} with simultaneous read and write")]
	EptWalkFault(u64),

	#[error("EPT violation at {0:#x} caused by an instruction fetch")]
	EptFetch(u64),

	#[error("Guest page fault at {gpa:#x} (linear {linear:#x}, rip {rip:#x})")]
	GuestPageFault { gpa: u64, linear: u64, rip: u64 },

	#[error("Unhandled exit reason {0}")]
	UnhandledExit(u32),

	#[error("An event is already pending for injection")]
	EventPending,

	#[error("Vector {0} can not be injected as an interrupt")]
	InvalidVector(u8),

	#[error("Start-up trampoline at {0:#x} never leaves real mode")]
	TrampolineExhausted(u64),

	#[error("Unknown vcpu {0}")]
	UnknownVcpu(usize),

	#[error(transparent)]
	Pic(#[from] PicError),

	#[error(transparent)]
	Apic(#[from] ApicError),

	#[error(transparent)]
	Decode(#[from] DecodeError),

	#[error(transparent)]
	Mmio(#[from] MmioError),

	#[error(transparent)]
	Memory(#[from] MemoryError),

	#[error(transparent)]
	Pagetable(#[from] PagetableError),

	#[error(transparent)]
	IoPort(#[from] IoPortError),
}

pub type HypervisorResult<T> = Result<T, HypervisorError>;
