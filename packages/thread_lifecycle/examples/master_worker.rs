//! A minimal master/worker launcher built on `thread_lifecycle`:
//!
//! * The master prepares shared data and starts a fixed number of workers.
//! * Each worker sets up its workspace and per-thread data, then meets the master at the
//!   begin-of-run barrier.
//! * Workers process events using pooled per-event objects.
//! * Everyone meets again at the end-of-run barrier, where the master collects results.
//! * Per-thread data is destroyed automatically when each worker exits.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use thread_lifecycle::{
    Barrier, ExitRegistry, Role, Workspace, WorkspacePool, assign_role, available_cores, role,
    with_thread_allocator, with_type_lock,
};

const EVENTS_PER_WORKER: u32 = 1000;

/// One particle step, allocated per event and released when the event ends.
struct Step {
    energy_kev: u64,
    depth: u32,
}

/// Per-worker scratch state.
#[derive(Default)]
struct Scratch {
    current: Cell<bool>,
    steps_taken: Cell<u64>,
}

impl Workspace for Scratch {
    fn activate(&self) {
        self.current.set(true);
    }

    fn deactivate(&self) {
        self.current.set(false);
    }

    fn teardown(&self) {
        println!("{}: took {} steps", role(), self.steps_taken.get());
    }
}

static SCRATCH: WorkspacePool<Scratch> = WorkspacePool::new(Scratch::default);

/// Marks the console as a shared resource so worker output lines do not interleave.
struct Console;

/// Per-thread data that lives until the worker exits.
struct WorkerSummary {
    label: String,
}

impl Drop for WorkerSummary {
    fn drop(&mut self) {
        with_type_lock::<Console, _>(|| println!("{} is exiting", self.label));
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    assign_role(Role::Master);

    let worker_count = available_cores().get().min(4);

    let begin_of_run = Barrier::new(worker_count);
    let end_of_run = Barrier::new(worker_count);
    let total_energy_kev = AtomicU64::new(0);

    thread::scope(|s| {
        for index in 0..worker_count {
            let begin_of_run = &begin_of_run;
            let end_of_run = &end_of_run;
            let total_energy_kev = &total_energy_kev;

            s.spawn(move || {
                assign_role(Role::Worker(index));

                let scratch = SCRATCH.find_or_create();
                ExitRegistry::register_value(WorkerSummary {
                    label: format!("worker {index}"),
                });

                begin_of_run.arrive();

                let mut energy_kev = 0;

                for event in 0..EVENTS_PER_WORKER {
                    let step = with_thread_allocator::<Step, _>(|allocator| {
                        allocator.emplace(Step {
                            energy_kev: 500,
                            depth: event % 16,
                        })
                    });

                    let step = with_thread_allocator::<Step, _>(|allocator| {
                        // SAFETY: Allocated above from this thread's allocator, released once.
                        unsafe { allocator.take(step) }
                    });

                    energy_kev += step.energy_kev * u64::from(step.depth);
                    scratch.steps_taken.set(scratch.steps_taken.get() + 1);
                }

                total_energy_kev.fetch_add(energy_kev, Ordering::Relaxed);

                end_of_run.arrive();

                SCRATCH.destroy_all();
            });
        }

        begin_of_run.await_workers();
        println!("{}: all {worker_count} workers started", role());

        end_of_run.wait_full();
        println!(
            "{}: total deposited energy {} keV",
            role(),
            total_energy_kev.load(Ordering::Relaxed)
        );
        end_of_run.release();
    });
}
