//! Kernel-wide logging setup.
//!
//! There is no console driver wired up on bare metal here, so installing a
//! logger would have nowhere to send its output; `set_max_level(Off)` keeps
//! the `log` macros compiling to no-ops instead of silently going nowhere.
//! Host builds route through `env_logger` so tests can see what the cache
//! is doing.
#[cfg(not(test))]
pub fn init() {
    log::set_max_level(log::LevelFilter::Off);
}

#[cfg(test)]
pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}
