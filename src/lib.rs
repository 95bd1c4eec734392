//! Translates a declarative resource specification into writes against the
//! Linux cgroup filesystem (v1, v2, and hybrid), and persists container
//! status documents on disk with crash-safe semantics.
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

#[cfg(test)]
#[macro_use]
extern crate mockall;

mod test;

pub mod common;
pub mod error;
pub mod stats;
pub mod status;
pub mod test_manager;
#[cfg(feature = "v1")]
pub mod v1;
#[cfg(feature = "v2")]
pub mod v2;
