use std::{
	collections::HashMap,
	fmt::Display,
	time::{Duration, Instant},
};

/// Possible causes of a VM exit (guest -> host transition)
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitKind {
	ExternalInterrupt,
	InterruptWindow,
	Cpuid,
	Hlt,
	CrAccess,
	IoIn,
	IoOut,
	Rdmsr,
	Wrmsr,
	MmioRead,
	MmioWrite,
	EptViolation,
	Other,
}

#[derive(Debug, Clone)]
pub struct CpuStats {
	id: usize,
	vm_exits: HashMap<ExitKind, usize>,
	runtime: Option<Duration>,
	start_time: Option<Instant>,
}
impl CpuStats {
	pub(crate) fn new(id: usize) -> Self {
		Self {
			id,
			vm_exits: HashMap::new(),
			runtime: None,
			start_time: Some(Instant::now()),
		}
	}

	pub fn id(&self) -> usize {
		self.id
	}

	/// Number of exits of kind `exit` seen so far.
	pub fn count(&self, exit: ExitKind) -> usize {
		self.vm_exits.get(&exit).copied().unwrap_or(0)
	}

	#[inline]
	pub(crate) fn increment_val(&mut self, val: ExitKind) {
		*self.vm_exits.entry(val).or_insert(0) += 1;
	}

	pub(crate) fn stop_time_measurement(&mut self) {
		if let Some(start_time) = self.start_time {
			self.runtime = Some(start_time.elapsed());
		}
	}
}

#[derive(Debug, Clone)]
pub struct VmStats {
	/// Number of Vm exits per CPU
	pub vm_exits: HashMap<ExitKind, HashMap<usize, usize>>,
	/// total runtime per cpu (`(cpu_id, runtime)`)
	pub cpu_runtimes: Vec<(usize, Duration)>,
}
impl VmStats {
	pub fn new(cpu_stats: &[CpuStats]) -> Self {
		let mut stats = Self {
			vm_exits: HashMap::new(),
			cpu_runtimes: Vec::new(),
		};
		for cpu in cpu_stats.iter() {
			for (exit, count) in cpu.vm_exits.iter() {
				stats
					.vm_exits
					.entry(*exit)
					.or_default()
					.insert(cpu.id, *count);
			}
			if let Some(runtime) = cpu.runtime {
				stats.cpu_runtimes.push((cpu.id, runtime));
			}
		}
		stats.cpu_runtimes.sort_by_key(|(id, _)| *id);

		stats
	}
}
impl Display for VmStats {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let cpu_ids = self.vm_exits.values().flat_map(|counts| counts.keys());
		let cpu_id_start = cpu_ids.clone().min().copied().unwrap_or(0);
		let cpu_id_end = cpu_ids.max().copied().unwrap_or(0);

		write!(f, "VM exits:                       total  ")?;
		for i in cpu_id_start..=cpu_id_end {
			write!(f, " {:>6.} ", format!("cpu{i}"))?;
		}
		writeln!(f)?;

		let mut exits: Vec<_> = self.vm_exits.iter().collect();
		exits.sort_by_key(|(exit, _)| **exit);
		for (exit, counts) in exits {
			let total: usize = counts.values().sum();
			write!(f, "  {:<28} {total:>6.}  ", format!("{exit:?}:"))?;
			for i in cpu_id_start..=cpu_id_end {
				if let Some(cnt) = counts.get(&i) {
					write!(f, " {cnt:>6.} ")?;
				} else {
					write!(f, "        ")?;
				}
			}
			writeln!(f)?;
		}
		writeln!(f, "CPU runtimes:")?;
		for (id, rt) in self.cpu_runtimes.iter() {
			writeln!(f, "  cpu {id}: {rt:?}")?;
		}
		Ok(())
	}
}
