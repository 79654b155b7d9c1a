#![warn(rust_2018_idioms)]

#[macro_use]
extern crate log;

pub mod apic;
pub mod arch;
pub mod bitmap;
pub mod consts;
pub mod decode;
mod error;
pub mod exit;
pub mod interrupt;
pub mod ioport;
mod kick;
pub mod mem;
pub mod mmio;
pub mod paging;
pub mod params;
pub mod pic;
pub mod stats;
pub mod vcpu;
pub mod vm;

pub use error::{HypervisorError, HypervisorResult};
pub use memory_addresses::{PhysAddr as GuestPhysAddr, VirtAddr as GuestVirtAddr};
