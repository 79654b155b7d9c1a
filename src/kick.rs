use std::{
	sync::{
		Mutex,
		atomic::{AtomicBool, Ordering},
	},
	thread::{self, Thread},
};

/// Wake-up signal for one virtual CPU.
///
/// Interrupt delivery from any thread calls [`Kick::kick`]. The vCPU thread
/// either polls with [`Kick::take`] between exits or blocks in
/// [`Kick::park`] while the guest is halted.
#[derive(Debug, Default)]
pub struct Kick {
	pending: AtomicBool,
	waiter: Mutex<Option<Thread>>,
}

impl Kick {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn kick(&self) {
		self.pending.store(true, Ordering::Release);
		if let Some(thread) = self.waiter.lock().unwrap().as_ref() {
			thread.unpark();
		}
	}

	/// Consumes a pending kick.
	pub fn take(&self) -> bool {
		self.pending.swap(false, Ordering::AcqRel)
	}

	pub fn is_pending(&self) -> bool {
		self.pending.load(Ordering::Acquire)
	}

	/// Blocks the calling thread until the next kick and consumes it.
	pub fn park(&self) {
		*self.waiter.lock().unwrap() = Some(thread::current());
		// The waiter is registered before the flag is checked, so a kick
		// racing with `thread::park` leaves an unpark token behind.
		while !self.take() {
			thread::park();
		}
		*self.waiter.lock().unwrap() = None;
	}
}
