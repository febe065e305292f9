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

use crate::error::Result;

use log::{debug, warn};

/// Maximum number of distinct NIC counter names (buckets).
pub const NUM_NIC_AGGREGATE_CNTS_MAX: usize = 256;

/// Maximum number of raw NIC counters tracked.
pub const NUM_NIC_COUNTERS_MAX: usize = 4096;

/// A device exposing a flat array of named counters.
pub trait NicDevice: Send {
    /// Takes a new snapshot of all counters and returns how many there are.
    fn query(&mut self) -> Result<usize>;

    /// Name of raw counter `index` in the last snapshot.
    fn counter_name(&self, index: usize) -> Option<&str>;

    /// Value of raw counter `index` in the last snapshot.
    fn counter_value(&self, index: usize) -> u64;
}

/// Removes digits and colons, so per-queue and per-lane variants of a
/// counter end up under the same name.
pub fn filter_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_ascii_digit() && *c != ':')
        .collect()
}

/// Throttled NIC counter reader with name deduplication.
///
/// Buckets only decide which names are exposed; values are always read per
/// raw counter.
pub struct NicAggregator {
    device: Option<Box<dyn NicDevice>>,
    decimation: u64,
    rounds: u64,
    num_counters: usize,
    bucket_names: Vec<String>,
    mapping: Vec<Option<usize>>,
    aggregated: bool,
}

impl std::fmt::Debug for NicAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NicAggregator")
            .field("initialized", &self.device.is_some())
            .field("decimation", &self.decimation)
            .field("rounds", &self.rounds)
            .field("num_counters", &self.num_counters)
            .field("buckets", &self.bucket_names.len())
            .finish()
    }
}

impl NicAggregator {
    /// `decimation` is rounded up to a power of two.
    pub fn new(device: Option<Box<dyn NicDevice>>, decimation: u64) -> Self {
        Self {
            device,
            decimation: decimation.max(1).next_power_of_two(),
            rounds: 0,
            num_counters: 0,
            bucket_names: Vec::new(),
            mapping: Vec::new(),
            aggregated: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.device.is_some()
    }

    fn query_device(&mut self) -> usize {
        let Some(device) = self.device.as_mut() else {
            return 0;
        };
        match device.query() {
            Ok(n) => self.num_counters = n.min(NUM_NIC_COUNTERS_MAX),
            Err(e) => warn!("NIC counter query failed: {}", e),
        }
        self.num_counters
    }

    /// Re-queries the device once every `decimation` calls; the calls in
    /// between keep the previous snapshot. Returns the number of raw counters.
    pub fn update(&mut self) -> usize {
        if self.device.is_none() {
            return 0;
        }
        if self.rounds & (self.decimation - 1) == 0 {
            self.query_device();
        }
        self.rounds = self.rounds.wrapping_add(1);
        self.num_counters
    }

    /// Buckets every raw counter by its filtered name. Runs once; later calls
    /// return the bucket count from the first run.
    pub fn aggregate(&mut self) -> usize {
        if self.aggregated || self.device.is_none() {
            return self.bucket_names.len();
        }
        let n = self.query_device();
        let Some(device) = self.device.as_ref() else {
            return 0;
        };

        self.mapping.clear();
        for index in 0..n {
            let bucket = device.counter_name(index).and_then(|name| {
                let filtered = filter_name(name);
                match self.bucket_names.iter().position(|b| *b == filtered) {
                    Some(b) => Some(b),
                    None if self.bucket_names.len() < NUM_NIC_AGGREGATE_CNTS_MAX => {
                        debug!("New NIC counter bucket: {}", filtered);
                        self.bucket_names.push(filtered);
                        Some(self.bucket_names.len() - 1)
                    }
                    None => None,
                }
            });
            self.mapping.push(bucket);
        }
        self.aggregated = true;
        debug!(
            "Aggregated {} NIC counters into {} buckets",
            n,
            self.bucket_names.len()
        );
        self.bucket_names.len()
    }

    /// Raw value of counter `raw_index` from the last snapshot.
    pub fn value(&self, raw_index: usize) -> u64 {
        match self.device.as_ref() {
            Some(device) if raw_index < self.num_counters => device.counter_value(raw_index),
            _ => 0,
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.bucket_names.len()
    }

    pub fn bucket_name(&self, bucket: usize) -> Option<&str> {
        self.bucket_names.get(bucket).map(String::as_str)
    }

    pub fn bucket_of(&self, raw_index: usize) -> Option<usize> {
        self.mapping.get(raw_index).copied().flatten()
    }

    /// First raw counter filed under `bucket`; its value is the one reported
    /// for the bucket's name.
    pub fn first_in_bucket(&self, bucket: usize) -> Option<usize> {
        self.mapping.iter().position(|b| *b == Some(bucket))
    }

    pub fn num_counters(&self) -> usize {
        self.num_counters
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Default)]
    pub struct FakeNic {
        pub names: Vec<String>,
        pub live: Arc<Mutex<Vec<u64>>>,
        pub snapshot: Vec<u64>,
        pub queries: Arc<Mutex<usize>>,
    }

    impl FakeNic {
        pub fn new(names: &[&str]) -> Self {
            Self {
                names: names.iter().map(|s| s.to_string()).collect(),
                live: Arc::new(Mutex::new(vec![0; names.len()])),
                ..Default::default()
            }
        }
    }

    impl NicDevice for FakeNic {
        fn query(&mut self) -> Result<usize> {
            *self.queries.lock().unwrap() += 1;
            self.snapshot = self.live.lock().unwrap().clone();
            Ok(self.names.len())
        }

        fn counter_name(&self, index: usize) -> Option<&str> {
            self.names.get(index).map(String::as_str)
        }

        fn counter_value(&self, index: usize) -> u64 {
            self.snapshot.get(index).copied().unwrap_or(0)
        }
    }
}
