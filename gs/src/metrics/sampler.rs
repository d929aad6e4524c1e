//! Process CPU sampling into a [`CpuUsageAccount`]

use std::time::Instant;

use nix::sys::resource::{UsageWho, getrusage};
use nix::sys::time::TimeVal;
use tracing::debug;

use super::cpu::{CpuUsage, CpuUsageAccount, CpuUsageError, FractionalCpuUsage};

fn timeval_nanos(tv: TimeVal) -> u64 {
    let secs = u64::try_from(tv.tv_sec()).unwrap_or(0);
    let micros = u64::try_from(tv.tv_usec()).unwrap_or(0);
    secs.saturating_mul(1_000_000_000).saturating_add(micros.saturating_mul(1_000))
}

/// Reads this process's user/system time and reports usage per quantum
#[derive(Debug)]
pub struct ProcessCpuSampler {
    account: CpuUsageAccount,
    last: CpuUsage,
    last_at: Instant,
}

impl ProcessCpuSampler {
    pub fn new() -> Result<Self, CpuUsageError> {
        let sampler = Self {
            account: CpuUsageAccount::new(),
            last: CpuUsage::default(),
            last_at: Instant::now(),
        };
        sampler.read()?;
        let last = sampler.account.snapshot();
        Ok(Self { last, ..sampler })
    }

    fn read(&self) -> Result<(), CpuUsageError> {
        let usage = getrusage(UsageWho::RUSAGE_SELF)?;
        let user = timeval_nanos(usage.user_time());
        let system = timeval_nanos(usage.system_time());
        self.account.set_user(user)?;
        self.account.set_combined(user.saturating_add(system))?;
        self.account.assert_consistent()
    }

    /// Cumulative usage seen so far
    pub fn account(&self) -> &CpuUsageAccount {
        &self.account
    }

    /// Usage since the previous sample, normalized over the elapsed quantum
    pub fn sample(&mut self) -> Result<FractionalCpuUsage, CpuUsageError> {
        self.read()?;
        let now = self.account.snapshot();
        let at = Instant::now();
        let quantum = at.duration_since(self.last_at);
        let delta = now.since(&self.last);
        self.last = now;
        self.last_at = at;

        debug!(?quantum, ?delta, "ProcessCpuSampler::sample: called");
        FractionalCpuUsage::new(delta, quantum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeval_nanos() {
        assert_eq!(timeval_nanos(TimeVal::new(2, 500)), 2_000_500_000);
    }

    #[test]
    fn test_sample_is_monotonic() {
        let mut sampler = ProcessCpuSampler::new().unwrap();
        let before = sampler.account().snapshot();

        let mut spin = 0u64;
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(20) {
            spin = spin.wrapping_add(1);
        }
        assert!(spin > 0);

        // Sampling jitter can push a short quantum over the limit; only the
        // counters themselves are guaranteed here
        let _ = sampler.sample();
        let after = sampler.account().snapshot();
        assert!(after.combined >= before.combined);
        assert!(after.user >= before.user);
        sampler.account().assert_consistent().unwrap();
    }
}
