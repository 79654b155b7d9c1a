//! x86 architecture definitions shared by the exit handlers.

pub mod paging;
pub mod registers;

pub use self::{
	paging::{initialize_pagetables, virt_to_phys},
	registers::{Cr4, ProcControls, apply_shadow},
};
