#![allow(dead_code)]

use kairos::{SystemConfigurationBuilder, scheduler::Scheduler, thread::Current};
use std::sync::Arc;

/// Brings up a kernel with `cpus` processors on the calling test thread,
/// which becomes its boot thread.
pub fn boot(cpus: usize) -> Arc<Scheduler> {
    boot_with(SystemConfigurationBuilder::new().cpus(cpus))
}

pub fn boot_with(builder: SystemConfigurationBuilder) -> Arc<Scheduler> {
    let config = builder
        .log_level(log::LevelFilter::Warn)
        .build()
        .expect("valid configuration");
    Scheduler::initialise(config).expect("scheduler comes up")
}

/// Yields the processor until `cond` holds.
pub fn wait_until(cond: impl Fn() -> bool) {
    while !cond() {
        Current::yield_now();
        std::hint::spin_loop();
    }
}
