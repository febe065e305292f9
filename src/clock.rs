// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde_json::json;

use std::time::{Duration, Instant};

/// Time stamp counter with a measured tick length.
#[derive(Debug, Clone, Copy)]
pub struct TscClock {
    ns_per_tick: f64,
}

impl std::default::Default for TscClock {
    fn default() -> Self {
        let t0 = Instant::now();
        let tsc0 = Self::read_tsc();
        std::thread::sleep(Duration::from_millis(10));
        let t1 = Instant::now();
        let tsc1 = Self::read_tsc();
        let dt_ns = (t1 - t0).as_nanos() as u64;
        let d_tsc = tsc1.wrapping_sub(tsc0).max(1);

        Self {
            ns_per_tick: dt_ns as f64 / d_tsc as f64,
        }
    }
}

impl TscClock {
    pub fn ns_per_tick(&self) -> f64 {
        self.ns_per_tick
    }

    pub fn ticks_to_duration(&self, ticks: f64) -> Duration {
        Duration::from_nanos((ticks * self.ns_per_tick) as u64)
    }

    #[inline(always)]
    #[cfg(target_arch = "x86")]
    pub fn read_tsc() -> u64 {
        unsafe { core::arch::x86::_rdtsc() }
    }

    #[inline(always)]
    #[cfg(target_arch = "x86_64")]
    pub fn read_tsc() -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    #[inline(always)]
    #[cfg(target_arch = "aarch64")]
    pub fn read_tsc() -> u64 {
        let value: u64;
        unsafe {
            core::arch::asm!("mrs {}, CNTPCT_EL0", out(reg) value);
        }
        value
    }
}

/// Running statistics of a timed code section, in TSC ticks.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CycleMeter {
    samples: u64,
    total: u64,
    min: u64,
    max: u64,
}

impl CycleMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, ticks: u64) {
        if self.samples == 0 {
            self.min = ticks;
            self.max = ticks;
        } else {
            self.min = self.min.min(ticks);
            self.max = self.max.max(ticks);
        }
        self.samples += 1;
        self.total = self.total.saturating_add(ticks);
    }

    #[inline]
    pub fn measure<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let start = TscClock::read_tsc();
        let r = f();
        self.record(TscClock::read_tsc().wrapping_sub(start));
        r
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn mean(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.total as f64 / self.samples as f64)
    }

    pub fn summary_record(&self, clock: &TscClock) -> serde_json::Value {
        let mean = self.mean().unwrap_or(0.0);
        json!({
            "samples": self.samples,
            "mean_ticks": mean,
            "min_ticks": self.min,
            "max_ticks": self.max,
            "mean_ns": clock.ticks_to_duration(mean).as_nanos() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsc_calibration() {
        let clock = TscClock::default();
        assert!(clock.ns_per_tick() > 0.0);

        let ticks = (1_000_000.0 / clock.ns_per_tick()) as u64;
        let t0 = TscClock::read_tsc();
        std::thread::sleep(Duration::from_millis(1));
        assert!(TscClock::read_tsc().wrapping_sub(t0) >= ticks / 2);
    }

    #[test]
    fn meter_statistics() {
        let mut meter = CycleMeter::new();
        assert_eq!(meter.mean(), None);

        for t in [30, 10, 20] {
            meter.record(t);
        }
        assert_eq!(meter.samples(), 3);
        assert_eq!(meter.mean(), Some(20.0));

        let record = meter.summary_record(&TscClock { ns_per_tick: 0.5 });
        assert_eq!(record["min_ticks"], 10);
        assert_eq!(record["max_ticks"], 30);
        assert_eq!(record["mean_ns"], 10);

        let v = meter.measure(|| 7);
        assert_eq!(v, 7);
        assert_eq!(meter.samples(), 4);
    }
}
