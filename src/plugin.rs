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

use crate::aggregate::{AggregateReducer, AggregateSource, RefreshStatus};
use crate::clock::{CycleMeter, TscClock};
use crate::collective::{self, Collective};
use crate::config::{CollectionMode, Config, IdPolicy};
use crate::error::{Error, Result};
use crate::metric_spec::{placeholder_name, MetricSpec};
use crate::name_cache::NameCache;
use crate::nic::{NicAggregator, NicDevice};
use crate::registry::{CounterRegistry, Sample, UNKNOWN_VALUE};
use crate::scanner::{ScanMode, ScanReport, TreeScanner};

use log::{debug, info, trace, warn};
use serde_json::json;

use std::io::Write as _;

/// Pending discovery is retried on every sampling call whose count has
/// these bits clear.
pub const PENDING_RETRY_MASK: u64 = 0xFF;

/// Host function told about a late name change:
/// `(current_name, new_name, metric_name, count)`.
pub type NameUpdateFn = Box<dyn FnMut(&str, &str, &str, usize) + Send>;

/// Turns the address carried by a rename registration tag into a callable.
pub type NameUpdateBinder = Box<dyn Fn(u64) -> Option<NameUpdateFn> + Send>;

/// Statistics transport feeding a [`TreeScanner`].
pub trait StatsTransport: Send {
    fn start_server(&mut self) -> Result<()>;

    /// Requests a fresh dump and scans it into `registry`.
    fn scan(
        &mut self,
        scanner: &mut TreeScanner,
        registry: &mut CounterRegistry,
        mode: ScanMode,
    ) -> Result<ScanReport>;
}

/// Where UCX counter names and values come from.
pub trait CounterSource: Send {
    /// Prepares collection; only the root rank runs the statistics server.
    fn start(&mut self, is_root: bool) -> Result<()>;

    /// First discovery, run on every rank at the same time. Fills `registry`
    /// and returns its size.
    fn discover(
        &mut self,
        metric_name: &str,
        registry: &mut CounterRegistry,
        collective: &dyn Collective,
    ) -> Result<usize>;

    /// Local retry of a discovery that found nothing.
    fn rediscover(&mut self, metric_name: &str, registry: &mut CounterRegistry) -> Result<usize>;

    /// `count` names were restored from the cache into slots `0..count`.
    fn restore(&mut self, metric_name: &str, count: usize);

    /// Current value of slot `index`. Index 0 refreshes every slot.
    fn refresh(&mut self, index: u32, registry: &mut CounterRegistry) -> Result<u64>;
}

/// Tree counter names start with `<metric>_`.
fn property_prefix(metric_name: &str) -> String {
    format!("{}_", metric_name)
}

/// Counters found by walking the full statistics tree.
pub struct TreeCounters {
    transport: Box<dyn StatsTransport>,
    scanner: TreeScanner,
    is_root: bool,
    adopt_pending: bool,
}

impl TreeCounters {
    pub fn new(transport: Box<dyn StatsTransport>) -> Self {
        Self {
            transport,
            scanner: TreeScanner::new(),
            is_root: true,
            adopt_pending: false,
        }
    }
}

impl CounterSource for TreeCounters {
    fn start(&mut self, is_root: bool) -> Result<()> {
        self.is_root = is_root;
        if is_root {
            self.transport.start_server()?;
        }
        Ok(())
    }

    fn discover(
        &mut self,
        metric_name: &str,
        registry: &mut CounterRegistry,
        collective: &dyn Collective,
    ) -> Result<usize> {
        self.scanner.set_prefix(property_prefix(metric_name));
        let scanned = if self.is_root {
            self.transport
                .scan(&mut self.scanner, registry, ScanMode::Discover)
                .map(|report| {
                    debug!(
                        "Visited {} stats nodes, {} counters",
                        report.nodes_visited, report.new_counters
                    );
                })
        } else {
            Ok(())
        };
        // every rank has to reach the rendezvous, even when the scan failed
        let names = collective::share_names(collective, registry)?;
        if !self.is_root && registry.is_empty() {
            for name in names {
                registry.push(name, 0);
            }
        }
        scanned.map(|()| registry.len())
    }

    fn rediscover(&mut self, metric_name: &str, registry: &mut CounterRegistry) -> Result<usize> {
        self.scanner.set_prefix(property_prefix(metric_name));
        if self.is_root {
            self.transport
                .scan(&mut self.scanner, registry, ScanMode::Discover)?;
        }
        Ok(registry.len())
    }

    fn restore(&mut self, metric_name: &str, count: usize) {
        self.scanner.set_prefix(property_prefix(metric_name));
        self.scanner.adopt(count);
        self.adopt_pending = true;
    }

    fn refresh(&mut self, index: u32, registry: &mut CounterRegistry) -> Result<u64> {
        if self.is_root && index == 0 {
            let mode = if std::mem::take(&mut self.adopt_pending) {
                ScanMode::Discover
            } else {
                ScanMode::Refresh
            };
            self.transport.scan(&mut self.scanner, registry, mode)?;
        }
        Ok(registry.get(index).map_or(0, |e| e.value))
    }
}

/// Counters reduced inside UCX by the aggregate-sum API.
pub struct AggregateCounters {
    reducer: AggregateReducer,
    transport: Option<Box<dyn StatsTransport>>,
}

impl AggregateCounters {
    /// `transport` is only used to run the statistics server on the root.
    pub fn new(
        source: Box<dyn AggregateSource>,
        transport: Option<Box<dyn StatsTransport>>,
    ) -> Self {
        Self {
            reducer: AggregateReducer::new(source),
            transport,
        }
    }
}

impl CounterSource for AggregateCounters {
    fn start(&mut self, is_root: bool) -> Result<()> {
        match self.transport.as_mut() {
            Some(transport) if is_root => transport.start_server(),
            _ => Ok(()),
        }
    }

    fn discover(
        &mut self,
        metric_name: &str,
        registry: &mut CounterRegistry,
        _collective: &dyn Collective,
    ) -> Result<usize> {
        self.rediscover(metric_name, registry)
    }

    fn rediscover(&mut self, metric_name: &str, registry: &mut CounterRegistry) -> Result<usize> {
        self.reducer.get_value(0);
        if self.reducer.get_names() && registry.is_empty() {
            for name in self.reducer.names() {
                registry.push(name.property_name(metric_name), 0);
            }
        }
        Ok(registry.len())
    }

    fn restore(&mut self, _metric_name: &str, count: usize) {
        self.reducer.assign_names_size(count);
    }

    fn refresh(&mut self, index: u32, _registry: &mut CounterRegistry) -> Result<u64> {
        let (value, status) = self.reducer.get_value(index as usize);
        if status == RefreshStatus::Degraded {
            trace!("aggregate refresh degraded");
        }
        // slots without a name carry no counter
        if index as usize >= self.reducer.names_size() {
            return Ok(0);
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Discovering,
    Serving,
}

/// One metric exposed to the host. Values are absolute points, unsigned,
/// printed in decimal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub description: String,
    pub unit: String,
}

impl PropertyDescriptor {
    fn new(name: String) -> Self {
        Self {
            name,
            description: String::new(),
            unit: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed,
    AlreadyRenamed,
    NoCallback,
    UnknownSlot,
}

/// External collaborators of the facade.
pub struct Backends {
    pub ucx: Option<Box<dyn CounterSource>>,
    pub nic: Option<Box<dyn NicDevice>>,
    pub collective: Box<dyn Collective>,
    pub bind_name_update: NameUpdateBinder,
}

/// Registry facade driven by the host's plugin hooks.
///
/// Calls must be serialized by the caller.
pub struct Plugin {
    config: Config,
    state: State,
    metric_name: String,
    registry: CounterRegistry,
    ucx: Option<Box<dyn CounterSource>>,
    ucx_started: bool,
    ucx_properties: usize,
    nic: NicAggregator,
    nic_previous: Vec<u64>,
    collective: Box<dyn Collective>,
    cache: NameCache,
    cache_written: bool,
    bind_name_update: NameUpdateBinder,
    name_update: Option<NameUpdateFn>,
    announced: Vec<String>,
    /// Property position of every added counter, in `add_metric` order.
    positions: Vec<usize>,
    calls: u64,
    meter: Option<CycleMeter>,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("state", &self.state)
            .field("metric_name", &self.metric_name)
            .field("counters", &self.registry.len())
            .field("ucx_properties", &self.ucx_properties)
            .field("nic", &self.nic)
            .field("rank", &self.collective.rank())
            .finish()
    }
}

impl Plugin {
    pub fn new(config: Config, backends: Backends) -> Self {
        Self {
            cache: NameCache::new(&config.names_file),
            nic: NicAggregator::new(backends.nic, config.nic_update_decimation),
            meter: config.microbenchmark.then(CycleMeter::new),
            config,
            state: State::Uninitialized,
            metric_name: String::new(),
            registry: CounterRegistry::new(),
            ucx: backends.ucx,
            ucx_started: false,
            ucx_properties: 0,
            nic_previous: Vec::new(),
            collective: backends.collective,
            cache_written: false,
            bind_name_update: backends.bind_name_update,
            name_update: None,
            announced: Vec::new(),
            positions: Vec::new(),
            calls: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn registry(&self) -> &CounterRegistry {
        &self.registry
    }

    /// Number of leading ids routed to UCX counters.
    pub fn ucx_property_count(&self) -> usize {
        self.ucx_properties
    }

    pub fn discover_properties(&mut self, metric: &str) -> Result<Vec<PropertyDescriptor>> {
        let spec = MetricSpec::parse(metric)?;
        if spec.is_name_update_registration() {
            self.capture_name_update(metric, &spec);
            return Ok(Vec::new());
        }
        if !spec.is_ucx() {
            debug!("Ignoring metric {}", metric);
            return Ok(Vec::new());
        }

        self.metric_name = metric.to_owned();
        if self.state == State::Uninitialized {
            self.state = State::Discovering;
        }

        let mut properties = Vec::new();
        if self.ucx.is_some() {
            if self.state != State::Serving {
                self.discover_ucx();
            }
            self.ucx_properties = match self.state {
                State::Serving => {
                    let n = self.registry.len();
                    match (self.config.collection_mode, spec.count) {
                        (CollectionMode::Tree, Some(c)) if c != 1 => n.min(c as usize),
                        _ => n,
                    }
                }
                _ => {
                    info!(
                        "No UCX counters discovered yet, registering {} placeholders",
                        self.config.placeholder_counters
                    );
                    self.config.placeholder_counters
                }
            };
            for slot in 0..self.ucx_properties as u32 {
                let name = match (self.state, self.registry.get(slot)) {
                    (State::Serving, Some(entry)) => entry.name.clone(),
                    _ => placeholder_name(metric, slot),
                };
                properties.push(PropertyDescriptor::new(name));
            }
        }

        if self.nic.is_initialized() {
            let buckets = self.nic.aggregate();
            for bucket in 0..buckets {
                if let Some(name) = self.nic.bucket_name(bucket) {
                    properties.push(PropertyDescriptor::new(format!(
                        "{}_nic_cnt_{}",
                        metric, name
                    )));
                }
            }
        }

        info!(
            "rank {}: {} properties for {} ({} UCX)",
            self.collective.rank(),
            properties.len(),
            metric,
            self.ucx_properties
        );
        self.announced = properties.iter().map(|p| p.name.clone()).collect();
        Ok(properties)
    }

    fn capture_name_update(&mut self, metric: &str, spec: &MetricSpec) {
        match spec
            .address
            .filter(|a| *a != 0)
            .and_then(|a| (self.bind_name_update)(a))
        {
            Some(callback) => {
                debug!("{} = {:#x}", spec.event, spec.address.unwrap_or(0));
                self.name_update = Some(callback);
            }
            None => warn!("{} does not carry a usable function address", metric),
        }
    }

    fn discover_ucx(&mut self) {
        let is_root = self.collective.is_root();
        let Some(source) = self.ucx.as_mut() else {
            return;
        };
        if !self.ucx_started {
            if let Err(e) = source.start(is_root) {
                warn!("Could not start UCX statistics collection: {}", e);
            }
            self.ucx_started = true;
        }

        match self.cache.load() {
            Ok(Some(names)) if !names.is_empty() => {
                info!(
                    "Using {} counter names cached in {:?}",
                    names.len(),
                    self.cache.path()
                );
                source.restore(&self.metric_name, names.len());
                self.registry = CounterRegistry::from_names(names);
                self.cache_written = true;
                self.state = State::Serving;
                return;
            }
            Ok(_) => {}
            Err(e) => warn!("Could not read {:?}: {}", self.cache.path(), e),
        }

        match source.discover(&self.metric_name, &mut self.registry, &*self.collective) {
            Ok(0) => warn!("UCX counter discovery found nothing yet"),
            Ok(n) => {
                debug!("Discovered {} UCX counters", n);
                self.state = State::Serving;
                self.write_cache();
            }
            Err(e) => warn!("UCX counter discovery failed: {}", e),
        }
    }

    fn write_cache(&mut self) {
        if self.cache_written || !self.collective.is_root() {
            return;
        }
        match self.cache.append(self.registry.names()) {
            Ok(n) => debug!("Cached {} counter names", n),
            Err(e) => warn!("Could not write {:?}: {}", self.cache.path(), e),
        }
        self.cache_written = true;
    }

    fn retry_discovery(&mut self) {
        let Some(source) = self.ucx.as_mut() else {
            return;
        };
        match source.rediscover(&self.metric_name, &mut self.registry) {
            Ok(0) => trace!("UCX counters still missing"),
            Ok(n) => {
                info!("{} UCX counters appeared, renaming placeholders", n);
                self.state = State::Serving;
                self.write_cache();
                self.rename_pending();
            }
            Err(e) => debug!("UCX counter discovery retry failed: {}", e),
        }
    }

    /// Hands out the id of a newly added counter.
    ///
    /// The id encodes the `add_metric` call order according to the id
    /// policy; the order is mapped back to the property announced under
    /// `metric`, or to the same position when the name was never announced.
    pub fn add_metric(&mut self, metric: &str) -> Result<i32> {
        let spec = MetricSpec::parse(metric)?;
        if !spec.is_ucx() {
            return Err(Error::Unavailable("non-UCX metric"));
        }
        let order = self.positions.len() as i64;
        let id = match self.config.id_policy {
            IdPolicy::Increasing => order,
            IdPolicy::Decreasing => self.config.placeholder_counters as i64 - 1 - order,
        };
        let id = i32::try_from(id)
            .ok()
            .filter(|id| *id >= 0)
            .ok_or(Error::Unavailable("counter id"))?;
        let position = self
            .announced
            .iter()
            .position(|name| name == metric)
            .unwrap_or(order as usize);
        self.positions.push(position);
        trace!("{} -> id {} (property {})", metric, id, position);
        Ok(id)
    }

    /// Property position read through `id`.
    fn position_of(&self, id: u32) -> Option<usize> {
        let order = match self.config.id_policy {
            IdPolicy::Increasing => id as usize,
            IdPolicy::Decreasing => self
                .config
                .placeholder_counters
                .checked_sub(id as usize + 1)?,
        };
        Some(self.positions.get(order).copied().unwrap_or(order))
    }

    pub fn current_value(&mut self, id: u32) -> Sample {
        let start = self.meter.is_some().then(TscClock::read_tsc);
        let sample = self.sample(id);
        if let (Some(meter), Some(start)) = (self.meter.as_mut(), start) {
            meter.record(TscClock::read_tsc().wrapping_sub(start));
        }
        sample
    }

    fn sample(&mut self, id: u32) -> Sample {
        self.calls = self.calls.wrapping_add(1);
        if self.state == State::Discovering && self.calls & PENDING_RETRY_MASK == 0 {
            self.retry_discovery();
        }

        let Some(index) = self.position_of(id) else {
            return Sample::default();
        };
        if index < self.ucx_properties {
            let Some(source) = self.ucx.as_mut() else {
                return Sample::default();
            };
            let slot = index as u32;
            let value = source
                .refresh(slot, &mut self.registry)
                .unwrap_or_else(|e| {
                    debug!("Refreshing UCX counter {} failed: {}", slot, e);
                    0
                });
            if self.registry.set_value(slot, value) {
                self.registry.sample(slot)
            } else {
                Sample {
                    value,
                    previous_value: UNKNOWN_VALUE,
                    changed: true,
                }
            }
        } else {
            let bucket = index - self.ucx_properties;
            if bucket >= self.nic.num_buckets() {
                return Sample::default();
            }
            if bucket == 0 {
                self.nic.update();
            }
            let value = self
                .nic
                .first_in_bucket(bucket)
                .map_or(0, |raw| self.nic.value(raw));
            if self.nic_previous.len() <= bucket {
                self.nic_previous.resize(bucket + 1, UNKNOWN_VALUE);
            }
            let previous_value = std::mem::replace(&mut self.nic_previous[bucket], value);
            Sample {
                value,
                previous_value,
                changed: value != previous_value,
            }
        }
    }

    /// Tells the host the real name of the counter registered under the
    /// placeholder of `slot`.
    pub fn rename(&mut self, slot: u32, new_name: &str) -> RenameOutcome {
        let count = self.registry.len();
        let Some(callback) = self.name_update.as_mut() else {
            warn!(
                "Cannot rename counter {}: no metric name update function was provided \
                 by the measurement system",
                slot
            );
            return RenameOutcome::NoCallback;
        };
        let Some(entry) = self.registry.get_mut(slot) else {
            return RenameOutcome::UnknownSlot;
        };
        if entry.already_renamed {
            return RenameOutcome::AlreadyRenamed;
        }
        let old = placeholder_name(&self.metric_name, slot);
        debug!("Renaming {} to {}", old, new_name);
        callback(&old, new_name, &self.metric_name, count);
        if entry.name != new_name {
            entry.name = new_name.to_owned();
        }
        entry.already_renamed = true;
        RenameOutcome::Renamed
    }

    /// Renames every registered placeholder that has a real counter now.
    pub fn rename_pending(&mut self) -> usize {
        if self.name_update.is_none() {
            warn!("Metric name update function missing, placeholders keep their names");
            return 0;
        }
        let limit = self.ucx_properties.min(self.registry.len()) as u32;
        let mut renamed = 0;
        for slot in 0..limit {
            let Some(name) = self.registry.get(slot).map(|e| e.name.clone()) else {
                continue;
            };
            if self.rename(slot, &name) == RenameOutcome::Renamed {
                renamed += 1;
            }
        }
        renamed
    }

    /// Reports statistics and releases the collectors.
    pub fn finalize(self) -> Result<()> {
        let clock = self.meter.map(|_| TscClock::default());
        if let (Some(meter), Some(clock)) = (self.meter.as_ref(), clock.as_ref()) {
            if let Some(mean) = meter.mean() {
                info!(
                    "Performance: mean_get_count_ticks={:.1} ({:?}), cnt_get_num_times={}",
                    mean,
                    clock.ticks_to_duration(mean),
                    meter.samples()
                );
            }
        }
        if let Some(template) = self.config.summary_file.as_ref() {
            let path = template.replace("%p", &format!("{}", std::process::id()));
            self.write_summary(&path, clock.as_ref())?;
            debug!("Wrote summary to {}", path);
        }
        Ok(())
    }

    fn write_summary(&self, path: &str, clock: Option<&TscClock>) -> std::io::Result<()> {
        let mut buf: Vec<u8> = Vec::new();
        let counters = json!({
            "name": "ucx_counters",
            "metric": self.metric_name,
            "rank": self.collective.rank(),
            "state": format!("{:?}", self.state),
            "properties": self.ucx_properties,
            "entries": self.registry.iter().map(|e| e.summary_record()).collect::<Vec<_>>(),
        });
        writeln!(buf, "{}", serde_json::to_string_pretty(&counters)?)?;

        if self.nic.is_initialized() {
            let nic = json!({
                "name": "nic_counters",
                "raw_counters": self.nic.num_counters(),
                "buckets": (0..self.nic.num_buckets())
                    .filter_map(|b| self.nic.bucket_name(b))
                    .collect::<Vec<_>>(),
            });
            writeln!(buf, "{}", serde_json::to_string_pretty(&nic)?)?;
        }

        if let (Some(meter), Some(clock)) = (self.meter.as_ref(), clock) {
            let mut perf = meter.summary_record(clock);
            perf["name"] = json!("microbenchmark");
            writeln!(buf, "{}", serde_json::to_string_pretty(&perf)?)?;
        }

        std::fs::write(path, buf)
    }
}
