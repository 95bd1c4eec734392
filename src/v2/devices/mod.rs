pub mod bpf;
pub mod controller;
pub mod emulator;
pub mod program;

#[cfg(test)]
#[allow(clippy::too_many_arguments)]
#[cfg_attr(coverage, feature(no_coverage))]
pub mod mocks;

pub use controller::Devices;
