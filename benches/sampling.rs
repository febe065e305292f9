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

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use scorep_plugin_ucx::aggregate::{AggregateName, AggregateReducer, AggregateSource};
use scorep_plugin_ucx::clock::{CycleMeter, TscClock};
use scorep_plugin_ucx::registry::CounterRegistry;

struct Counting {
    tick: u64,
    width: usize,
}

impl AggregateSource for Counting {
    fn aggregate(&mut self, counters: &mut [u64]) -> usize {
        self.tick += 1;
        let n = self.width.min(counters.len());
        for (i, c) in counters[..n].iter_mut().enumerate() {
            *c = self.tick + i as u64;
        }
        n
    }

    fn counter_names(&mut self) -> Vec<AggregateName> {
        (0..self.width)
            .map(|i| AggregateName::new("uct_ep", &format!("counter_{}", i)))
            .collect()
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("read tsc", |b| {
        b.iter(|| {
            let _ = TscClock::read_tsc();
        })
    });

    let mut meter = CycleMeter::new();
    c.bench_function("cycle meter", |b| b.iter(|| meter.measure(|| black_box(1u64))));

    let mut reducer = AggregateReducer::new(Box::new(Counting { tick: 0, width: 32 }));
    c.bench_function("aggregate refresh", |b| {
        b.iter(|| reducer.get_value(black_box(0)))
    });
    c.bench_function("aggregate cached read", |b| {
        b.iter(|| reducer.get_value(black_box(17)))
    });

    let mut registry = CounterRegistry::from_names((0..512).map(|i| format!("cnt-{}", i)));
    let mut value = 0u64;
    c.bench_function("registry sample", |b| {
        b.iter(|| {
            value += 1;
            registry.set_value(black_box(42), value);
            registry.sample(42)
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
