//! General paging related code
use thiserror::Error;

pub use crate::arch::{initialize_pagetables, virt_to_phys};
use crate::mem::MemoryError;

#[derive(Error, Debug)]
pub enum PagetableError {
	#[error("The accessed virtual address is not mapped")]
	InvalidAddress,

	#[error("Page tables with PAE enabled are not supported")]
	PaeUnsupported,

	#[error(transparent)]
	Memory(#[from] MemoryError),
}
