//! Best-fit ordering and fleet utilization.

use std::cmp::Ordering;

use crate::host::Host;

/// Preference among hosts that can take a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitOrder {
    /// Least remaining memory, then least remaining CPU, then oldest.
    /// Packs work onto busy hosts so idle ones can be reclaimed.
    #[default]
    Tightest,
    /// The exact reverse of `Tightest`: emptiest host first.
    Emptiest,
}

impl FitOrder {
    pub fn compare(self, a: &Host, b: &Host) -> Ordering {
        let tight = a
            .remaining_memory
            .cmp(&b.remaining_memory)
            .then(a.remaining_cpu.cmp(&b.remaining_cpu))
            .then(a.launch_time.cmp(&b.launch_time));
        match self {
            FitOrder::Tightest => tight,
            FitOrder::Emptiest => tight.reverse(),
        }
    }
}

/// The preferred host able to run `cpu`/`memory`, or `None` if nothing fits.
pub fn best_fit<'a>(
    hosts: impl IntoIterator<Item = &'a Host>,
    cpu: u32,
    memory: u32,
    order: FitOrder,
) -> Option<&'a Host> {
    hosts
        .into_iter()
        .filter(|h| h.can_run(cpu, memory))
        .min_by(|a, b| order.compare(a, b))
}

/// Share of registered capacity in use, taking the busier of CPU and
/// memory. Always within `0.0..=1.0`; an empty list counts as full.
pub fn utilization<'a>(hosts: impl IntoIterator<Item = &'a Host>) -> f64 {
    let (mut reg_cpu, mut reg_mem, mut rem_cpu, mut rem_mem) = (0u64, 0u64, 0u64, 0u64);
    for h in hosts {
        reg_cpu += u64::from(h.registered_cpu);
        reg_mem += u64::from(h.registered_memory);
        rem_cpu += u64::from(h.remaining_cpu.min(h.registered_cpu));
        rem_mem += u64::from(h.remaining_memory.min(h.registered_memory));
    }
    let used_share = |registered: u64, remaining: u64| {
        if registered == 0 {
            1.0
        } else {
            (registered - remaining) as f64 / registered as f64
        }
    };
    if reg_cpu == 0 && reg_mem == 0 {
        return 1.0;
    }
    used_share(reg_cpu, rem_cpu)
        .max(used_share(reg_mem, rem_mem))
        .clamp(0.0, 1.0)
}
