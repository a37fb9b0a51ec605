use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Reports which CPU, and so which software queue, the caller runs on.
pub trait CpuLocator: Send + Sync {
    fn current_cpu(&self) -> usize;
}

static NEXT_THREAD_CPU: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_CPU: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Gives every thread a stable pseudo CPU number on first use.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadCpuLocator;

impl CpuLocator for ThreadCpuLocator {
    fn current_cpu(&self) -> usize {
        THREAD_CPU.with(|cpu| match cpu.get() {
            Some(id) => id,
            None => {
                let id = NEXT_THREAD_CPU.fetch_add(1, Ordering::Relaxed);
                cpu.set(Some(id));
                id
            }
        })
    }
}

/// A locator that reports whatever CPU it was last moved to.
#[derive(Debug, Default)]
pub struct PinnedCpuLocator {
    cpu: AtomicUsize,
}

impl PinnedCpuLocator {
    pub fn new(cpu: usize) -> Self {
        Self {
            cpu: AtomicUsize::new(cpu),
        }
    }

    pub fn migrate(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::SeqCst);
    }
}

impl CpuLocator for PinnedCpuLocator {
    fn current_cpu(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }
}

/// Static CPU to hardware queue assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuMap {
    hw_of_cpu: Vec<usize>,
    /// Position of each CPU among the CPUs of its hardware queue.
    position: Vec<usize>,
    cpus_of_hw: Vec<Vec<usize>>,
}

impl CpuMap {
    pub fn new(nr_cpus: usize, nr_hw_queues: usize) -> Self {
        let mut cpus_of_hw = vec![Vec::new(); nr_hw_queues];
        let mut hw_of_cpu = Vec::with_capacity(nr_cpus);
        let mut position = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus {
            let hw = cpu % nr_hw_queues;
            hw_of_cpu.push(hw);
            position.push(cpus_of_hw[hw].len());
            cpus_of_hw[hw].push(cpu);
        }
        Self {
            hw_of_cpu,
            position,
            cpus_of_hw,
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.hw_of_cpu.len()
    }

    pub fn hw_queue(&self, cpu: usize) -> usize {
        self.hw_of_cpu[cpu]
    }

    pub fn position(&self, cpu: usize) -> usize {
        self.position[cpu]
    }

    pub fn cpus_of(&self, hw: usize) -> &[usize] {
        &self.cpus_of_hw[hw]
    }
}
