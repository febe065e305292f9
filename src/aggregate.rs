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

use log::{debug, warn};

/// Capacity of the aggregate-sum counter array.
pub const UCX_AGGREGATE_SUM_NUM_COUNTERS_MAX: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateName {
    pub class_name: String,
    pub counter_name: String,
}

impl AggregateName {
    pub fn new(class_name: &str, counter_name: &str) -> Self {
        Self {
            class_name: class_name.to_owned(),
            counter_name: counter_name.to_owned(),
        }
    }

    /// Property name exposed to the profiler for this counter.
    pub fn property_name(&self, metric_name: &str) -> String {
        format!("{}_{}_{}", metric_name, self.class_name, self.counter_name)
    }
}

/// Producer of pre-reduced counters; index `i` of the values matches
/// index `i` of the names.
pub trait AggregateSource: Send {
    /// Writes the current reduced values into `counters` and returns how many
    /// were produced.
    fn aggregate(&mut self, counters: &mut [u64]) -> usize;

    fn counter_names(&mut self) -> Vec<AggregateName>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    Fresh,
    /// The source produced nothing on the last index-0 refresh.
    Degraded,
}

/// Bounded array of aggregate-sum counters.
///
/// Reading index 0 refreshes the whole array; other indices return whatever
/// the last index-0 read left there. Callers poll index 0 first in every
/// sampling round.
pub struct AggregateReducer {
    source: Box<dyn AggregateSource>,
    counters: [u64; UCX_AGGREGATE_SUM_NUM_COUNTERS_MAX],
    size: usize,
    names: Vec<AggregateName>,
    names_size: usize,
}

impl std::fmt::Debug for AggregateReducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateReducer")
            .field("size", &self.size)
            .field("names_size", &self.names_size)
            .finish()
    }
}

impl AggregateReducer {
    pub fn new(source: Box<dyn AggregateSource>) -> Self {
        Self {
            source,
            counters: [0; UCX_AGGREGATE_SUM_NUM_COUNTERS_MAX],
            size: 0,
            names: Vec::new(),
            names_size: 0,
        }
    }

    pub fn get_value(&mut self, index: usize) -> (u64, RefreshStatus) {
        if index == 0 {
            let produced = self.source.aggregate(&mut self.counters);
            self.size = produced.min(UCX_AGGREGATE_SUM_NUM_COUNTERS_MAX);
            if self.size == 0 {
                warn!("Aggregate-sum source produced no counters");
                return (0, RefreshStatus::Degraded);
            }
        }
        (
            self.counters.get(index).copied().unwrap_or(0),
            RefreshStatus::Fresh,
        )
    }

    /// Fetches the names of the aggregate counters. Returns false when the
    /// source has none yet.
    pub fn get_names(&mut self) -> bool {
        self.names = self.source.counter_names();
        self.names.truncate(UCX_AGGREGATE_SUM_NUM_COUNTERS_MAX);
        self.names_size = self.names.len();
        debug!("Aggregate-sum source reports {} counter names", self.names_size);
        self.names_size > 0
    }

    pub fn names(&self) -> &[AggregateName] {
        &self.names
    }

    /// Sets the number of named counters without asking the source, for
    /// names restored from the cache.
    pub fn assign_names_size(&mut self, size: usize) {
        self.names_size = size.min(UCX_AGGREGATE_SUM_NUM_COUNTERS_MAX);
    }

    pub fn names_size(&self) -> usize {
        self.names_size
    }

    /// Number of counters produced by the last index-0 refresh.
    pub fn refreshed_len(&self) -> usize {
        self.size
    }

    pub fn values(&self) -> &[u64] {
        &self.counters[..self.size]
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use std::sync::{Arc, Mutex};

    /// Source whose values and names are shared with the test body.
    #[derive(Debug, Clone, Default)]
    pub struct SharedSource {
        pub values: Arc<Mutex<Vec<u64>>>,
        pub names: Arc<Mutex<Vec<AggregateName>>>,
        pub aggregate_calls: Arc<Mutex<usize>>,
    }

    impl AggregateSource for SharedSource {
        fn aggregate(&mut self, counters: &mut [u64]) -> usize {
            *self.aggregate_calls.lock().unwrap() += 1;
            let values = self.values.lock().unwrap();
            let n = values.len().min(counters.len());
            counters[..n].copy_from_slice(&values[..n]);
            n
        }

        fn counter_names(&mut self) -> Vec<AggregateName> {
            self.names.lock().unwrap().clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::SharedSource;
    use super::*;

    #[test]
    fn index_zero_refreshes_everything() {
        let source = SharedSource::default();
        *source.values.lock().unwrap() = vec![10, 20, 30];
        let mut reducer = AggregateReducer::new(Box::new(source.clone()));

        assert_eq!(reducer.get_value(0), (10, RefreshStatus::Fresh));
        assert_eq!(reducer.refreshed_len(), 3);
        assert_eq!(reducer.get_value(2), (30, RefreshStatus::Fresh));

        // k > 0 without a new index-0 read stays stale
        *source.values.lock().unwrap() = vec![11, 21, 31];
        assert_eq!(reducer.get_value(1), (20, RefreshStatus::Fresh));
        assert_eq!(*source.aggregate_calls.lock().unwrap(), 1);

        assert_eq!(reducer.get_value(0).0, 11);
        assert_eq!(reducer.get_value(1).0, 21);
        assert_eq!(reducer.values(), &[11, 21, 31]);
    }

    #[test]
    fn stale_read_before_any_refresh_is_zero() {
        let mut reducer = AggregateReducer::new(Box::new(SharedSource::default()));
        assert_eq!(reducer.get_value(5), (0, RefreshStatus::Fresh));
        assert_eq!(
            reducer.get_value(UCX_AGGREGATE_SUM_NUM_COUNTERS_MAX + 3),
            (0, RefreshStatus::Fresh)
        );
    }

    #[test]
    fn empty_source_is_degraded() {
        let mut reducer = AggregateReducer::new(Box::new(SharedSource::default()));
        assert_eq!(reducer.get_value(0), (0, RefreshStatus::Degraded));
        assert_eq!(reducer.refreshed_len(), 0);
    }

    #[test]
    fn names_are_fetched_independently() {
        let source = SharedSource::default();
        let mut reducer = AggregateReducer::new(Box::new(source.clone()));
        assert!(!reducer.get_names());

        *source.names.lock().unwrap() = vec![
            AggregateName::new("uct_ep", "bytes_short"),
            AggregateName::new("ucp_worker", "rndv"),
        ];
        assert!(reducer.get_names());
        assert_eq!(reducer.names_size(), 2);
        assert_eq!(
            reducer.names()[1].property_name("UCX@1"),
            "UCX@1_ucp_worker_rndv"
        );
        assert_eq!(*source.aggregate_calls.lock().unwrap(), 0);
    }

    #[test]
    fn assigned_size_is_bounded() {
        let mut reducer = AggregateReducer::new(Box::new(SharedSource::default()));
        reducer.assign_names_size(1000);
        assert_eq!(reducer.names_size(), UCX_AGGREGATE_SUM_NUM_COUNTERS_MAX);
    }
}
