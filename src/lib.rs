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

pub mod aggregate;
pub mod clock;
pub mod collective;
pub mod config;
pub mod error;
#[cfg(target_os = "linux")]
pub mod ethtool;
pub mod metric_spec;
pub mod name_cache;
pub mod nic;
pub mod plugin;
pub mod registry;
pub mod scanner;
pub mod scorep_shim;
pub mod ucs;

use config::{CollectionMode, Config};
use nic::NicDevice;
use plugin::{
    AggregateCounters, Backends, CounterSource, NameUpdateFn, Plugin, PropertyDescriptor,
    TreeCounters,
};
use scorep_shim::{SCOREP_Metric_Plugin_Info, SCOREP_Metric_Plugin_MetricProperties};
use ucs::{StatsServer, UcsAggregate, UcsLibrary};

use log::{debug, error, info, warn};

use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex, PoisonError};

/// Sampling interval used when Score-P only traces.
const TRACING_DELTA_T: u64 = 8 * 80000;

static PLUGIN: Mutex<Option<Plugin>> = Mutex::new(None);

fn with_plugin<R>(default: R, f: impl FnOnce(&mut Plugin) -> R) -> R {
    let mut lg = PLUGIN.lock().unwrap_or_else(PoisonError::into_inner);
    match lg.as_mut() {
        Some(plugin) => f(plugin),
        None => {
            warn!("Plugin called before initialization");
            default
        }
    }
}

fn ucx_source(config: &Config) -> error::Result<Box<dyn CounterSource>> {
    let lib = Arc::new(UcsLibrary::from_path(&config.ucs_lib)?);
    let server = Box::new(StatsServer::new(
        lib.clone(),
        config.stats_port,
        config.discovery_timeout(),
    ));
    let mode = match config.collection_mode {
        CollectionMode::Aggregate if !lib.has_aggregate() => {
            warn!("UCX aggregate-sum API missing, walking the statistics tree instead");
            CollectionMode::Tree
        }
        mode => mode,
    };
    Ok(match mode {
        CollectionMode::Tree => Box::new(TreeCounters::new(server)),
        CollectionMode::Aggregate => Box::new(AggregateCounters::new(
            Box::new(UcsAggregate::new(lib)?),
            Some(server),
        )),
    })
}

#[cfg(target_os = "linux")]
fn nic_device(config: &Config) -> Option<Box<dyn NicDevice>> {
    if !config.nic_counters_collection_enable {
        return None;
    }
    let Some(name) = config.nic_device_name.as_deref() else {
        warn!("NIC counters enabled without a device name");
        return None;
    };
    match ethtool::EthtoolDevice::open(name) {
        Ok(device) => Some(Box::new(device)),
        Err(e) => {
            warn!("NIC {} unavailable: {}", name, e);
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn nic_device(config: &Config) -> Option<Box<dyn NicDevice>> {
    if config.nic_counters_collection_enable {
        warn!("NIC counters are only supported on Linux");
    }
    None
}

fn bind_name_update(address: u64) -> Option<NameUpdateFn> {
    let address = usize::try_from(address).ok().filter(|a| *a != 0)?;
    // SAFETY: the registration tag carries the address of the host's rename
    // function, which has this signature
    let func = unsafe {
        std::mem::transmute::<usize, scorep_shim::SCOREP_metric_name_update_t>(address)
    };
    Some(Box::new(move |current, new, metric, count| {
        let (Ok(current), Ok(new), Ok(metric)) = (
            CString::new(current),
            CString::new(new),
            CString::new(metric),
        ) else {
            warn!("Counter names with interior NUL bytes cannot be renamed");
            return;
        };
        // SAFETY: all arguments are valid C strings for the duration of the call
        unsafe { func(current.as_ptr(), new.as_ptr(), metric.as_ptr(), count) }
    }))
}

fn backends(config: &Config) -> Backends {
    let ucx = if config.ucx_counters_collection_enable {
        ucx_source(config)
            .map_err(|e| warn!("UCX counters unavailable: {}", e))
            .ok()
    } else {
        None
    };
    Backends {
        ucx,
        nic: nic_device(config),
        collective: collective::world(),
        bind_name_update: Box::new(bind_name_update),
    }
}

/// # Safety
///
/// `p` must be null or point to a NUL-terminated string.
unsafe fn string_arg(p: *const libc::c_char) -> Option<String> {
    if p.is_null() {
        return None;
    }
    Some(CStr::from_ptr(p).to_string_lossy().into_owned())
}

fn strdup(s: &str) -> *mut libc::c_char {
    let s = CString::new(s.replace('\0', "")).unwrap_or_default();
    // SAFETY: `s` is a valid C string; the copy is freed by the host
    unsafe { libc::strdup(s.as_ptr()) }
}

/// Array of properties terminated by an entry with a NULL name. The host
/// releases it, and every string in it, with `free`.
fn property_array(properties: &[PropertyDescriptor]) -> *mut SCOREP_Metric_Plugin_MetricProperties {
    let n = properties.len() + 1;
    // SAFETY: calloc'd memory is zeroed, which leaves the terminator in place
    unsafe {
        let array = libc::calloc(n, std::mem::size_of::<SCOREP_Metric_Plugin_MetricProperties>())
            .cast::<SCOREP_Metric_Plugin_MetricProperties>();
        if array.is_null() {
            error!("Could not allocate {} metric properties", n);
            return array;
        }
        for (i, p) in properties.iter().enumerate() {
            array.add(i).write(SCOREP_Metric_Plugin_MetricProperties {
                name: strdup(&p.name),
                description: strdup(&p.description),
                mode: scorep_shim::SCOREP_METRIC_MODE_ABSOLUTE_POINT,
                value_type: scorep_shim::SCOREP_METRIC_VALUE_UINT64,
                base: scorep_shim::SCOREP_METRIC_BASE_DECIMAL,
                exponent: 0,
                unit: strdup(&p.unit),
            });
        }
        array
    }
}

#[allow(clippy::missing_safety_doc)]
unsafe extern "C" fn plugin_initialize() -> i32 {
    let _ = env_logger::try_init();
    let config = config::CONFIG.clone();
    info!(
        "ucx_counters_collect_enable={}, nic_counters_collect_enable={}, mode={:?}",
        config.ucx_counters_collection_enable,
        config.nic_counters_collection_enable,
        config.collection_mode
    );
    let plugin = Plugin::new(config.clone(), backends(&config));
    debug!("{:?}", plugin);
    *PLUGIN.lock().unwrap_or_else(PoisonError::into_inner) = Some(plugin);
    0
}

#[allow(clippy::missing_safety_doc)]
unsafe extern "C" fn plugin_finalize() {
    let plugin = PLUGIN.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(plugin) = plugin {
        if let Err(e) = plugin.finalize() {
            error!("Finalizing the UCX plugin failed: {}", e);
        }
    }
}

#[allow(clippy::missing_safety_doc)]
unsafe extern "C" fn plugin_get_event_info(
    token: *mut libc::c_char,
) -> *mut SCOREP_Metric_Plugin_MetricProperties {
    let properties = match string_arg(token) {
        Some(metric) => with_plugin(Vec::new(), |p| {
            p.discover_properties(&metric).unwrap_or_else(|e| {
                error!("{}", e);
                Vec::new()
            })
        }),
        None => Vec::new(),
    };
    property_array(&properties)
}

#[allow(clippy::missing_safety_doc)]
unsafe extern "C" fn plugin_add_counter(event_name: *mut libc::c_char) -> i32 {
    let Some(metric) = string_arg(event_name) else {
        return -1;
    };
    with_plugin(-1, |p| {
        p.add_metric(&metric).unwrap_or_else(|e| {
            warn!("Cannot add {}: {}", metric, e);
            -1
        })
    })
}

#[allow(clippy::missing_safety_doc)]
unsafe extern "C" fn plugin_get_current_value(id: i32) -> u64 {
    match u32::try_from(id) {
        Ok(id) => with_plugin(0, |p| p.current_value(id).value),
        Err(_) => 0,
    }
}

#[allow(clippy::missing_safety_doc)]
unsafe extern "C" fn plugin_get_optional_value(id: i32, value: *mut u64) -> bool {
    if value.is_null() {
        return false;
    }
    *value = plugin_get_current_value(id);
    true
}

/// Entry point looked up by Score-P for `SCOREP_METRIC_PLUGINS=scorep_plugin_ucx`.
#[no_mangle]
pub extern "C" fn SCOREP_MetricPlugin_scorep_plugin_ucx_get_info() -> SCOREP_Metric_Plugin_Info {
    SCOREP_Metric_Plugin_Info {
        plugin_version: scorep_shim::SCOREP_METRIC_PLUGIN_VERSION,
        run_per: scorep_shim::SCOREP_METRIC_PER_THREAD,
        sync: scorep_shim::SCOREP_METRIC_SYNC,
        delta_t: if config::CONFIG.enable_profiling {
            0
        } else {
            TRACING_DELTA_T
        },
        initialize: Some(plugin_initialize),
        finalize: Some(plugin_finalize),
        get_event_info: Some(plugin_get_event_info),
        add_counter: Some(plugin_add_counter),
        get_current_value: Some(plugin_get_current_value),
        get_optional_value: Some(plugin_get_optional_value),
        set_clock_function: None,
        get_all_values: None,
        synchronize: None,
        reserved: [0; scorep_shim::SCOREP_METRIC_PLUGIN_INFO_RESERVED],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_describes_a_sync_per_thread_plugin() {
        let info = SCOREP_MetricPlugin_scorep_plugin_ucx_get_info();
        assert_eq!(info.plugin_version, 1);
        assert_eq!(info.run_per, scorep_shim::SCOREP_METRIC_PER_THREAD);
        assert_eq!(info.sync, scorep_shim::SCOREP_METRIC_SYNC);
        assert!(info.get_event_info.is_some());
        assert!(info.get_all_values.is_none());
        assert!(info.reserved.iter().all(|r| *r == 0));
    }

    #[test]
    fn property_array_is_null_terminated() {
        let properties = vec![
            PropertyDescriptor {
                name: "UCX@1_uct_ep_bytes_short".into(),
                description: String::new(),
                unit: String::new(),
            },
            PropertyDescriptor {
                name: "UCX@1_nic_cnt_rx_bytes".into(),
                description: "bytes".into(),
                unit: String::new(),
            },
        ];
        let array = property_array(&properties);
        assert!(!array.is_null());
        unsafe {
            for (i, p) in properties.iter().enumerate() {
                let entry = &*array.add(i);
                assert_eq!(CStr::from_ptr(entry.name).to_str().unwrap(), p.name);
                assert_eq!(
                    CStr::from_ptr(entry.description).to_str().unwrap(),
                    p.description
                );
                assert_eq!(entry.mode, scorep_shim::SCOREP_METRIC_MODE_ABSOLUTE_POINT);
                assert_eq!(entry.value_type, scorep_shim::SCOREP_METRIC_VALUE_UINT64);
                assert_eq!(entry.base, scorep_shim::SCOREP_METRIC_BASE_DECIMAL);
                libc::free(entry.name.cast());
                libc::free(entry.description.cast());
                libc::free(entry.unit.cast());
            }
            assert!((*array.add(properties.len())).name.is_null());
            libc::free(array.cast());
        }
    }

    #[test]
    fn rename_address_zero_is_rejected() {
        assert!(bind_name_update(0).is_none());
    }

    #[test]
    fn bound_rename_calls_through() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static CALLS: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C" fn update(
            current: *const libc::c_char,
            new: *const libc::c_char,
            metric: *const libc::c_char,
            count: libc::size_t,
        ) {
            assert_eq!(CStr::from_ptr(current).to_str().unwrap(), "old");
            assert_eq!(CStr::from_ptr(new).to_str().unwrap(), "new");
            assert_eq!(CStr::from_ptr(metric).to_str().unwrap(), "UCX@1");
            CALLS.fetch_add(count, Ordering::Relaxed);
        }

        let f: scorep_shim::SCOREP_metric_name_update_t = update;
        let mut callback = bind_name_update(f as usize as u64).unwrap();
        callback("old", "new", "UCX@1", 3);
        callback("o\0ld", "new", "UCX@1", 3);
        assert_eq!(CALLS.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn calls_before_initialize_are_inert() {
        unsafe {
            assert_eq!(plugin_get_current_value(0), 0);
            assert_eq!(plugin_get_current_value(-1), 0);
            assert!(!plugin_get_optional_value(0, std::ptr::null_mut()));
            assert_eq!(plugin_add_counter(std::ptr::null_mut()), -1);
        }
    }
}
