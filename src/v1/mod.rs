mod blkio;
mod controller;
pub mod controller_type;
mod cpu;
mod cpuacct;
mod cpuset;
mod devices;
mod freezer;
mod hugetlb;
pub mod manager;
mod memory;
mod network_classifier;
mod network_priority;
mod perf_event;
mod pids;
pub mod util;
