//! Load and CPU usage measurement
//!
//! - [`LoadObserver`] - sliding-window average of active workers
//! - [`CpuUsageAccount`] / [`FractionalCpuUsage`] - cumulative and per-quantum CPU usage
//! - [`ProcessCpuSampler`] - feeds an account from the process's resource usage

mod cpu;
mod load;
mod sampler;

pub use cpu::{CpuUsage, CpuUsageAccount, CpuUsageError, FractionalCpuUsage};
pub use load::{LoadError, LoadObserver};
pub use sampler::ProcessCpuSampler;
