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

// Score-P metric plugin interface, version 1 (`SCOREP_MetricPlugins.h`).

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]

use static_assertions::const_assert_eq;

pub const SCOREP_METRIC_PLUGIN_VERSION: u32 = 1;
pub const SCOREP_METRIC_PLUGIN_INFO_RESERVED: usize = 92;

pub type SCOREP_MetricMode = libc::c_uint;
pub const SCOREP_METRIC_MODE_ACCUMULATED_START: SCOREP_MetricMode = 0;
pub const SCOREP_METRIC_MODE_ACCUMULATED_POINT: SCOREP_MetricMode = 1;
pub const SCOREP_METRIC_MODE_ACCUMULATED_LAST: SCOREP_MetricMode = 2;
pub const SCOREP_METRIC_MODE_ACCUMULATED_NEXT: SCOREP_MetricMode = 3;
pub const SCOREP_METRIC_MODE_ABSOLUTE_POINT: SCOREP_MetricMode = 4;
pub const SCOREP_METRIC_MODE_ABSOLUTE_LAST: SCOREP_MetricMode = 5;
pub const SCOREP_METRIC_MODE_ABSOLUTE_NEXT: SCOREP_MetricMode = 6;

pub type SCOREP_MetricValueType = libc::c_uint;
pub const SCOREP_METRIC_VALUE_INT64: SCOREP_MetricValueType = 0;
pub const SCOREP_METRIC_VALUE_UINT64: SCOREP_MetricValueType = 1;
pub const SCOREP_METRIC_VALUE_DOUBLE: SCOREP_MetricValueType = 2;

pub type SCOREP_MetricBase = libc::c_uint;
pub const SCOREP_METRIC_BASE_BINARY: SCOREP_MetricBase = 0;
pub const SCOREP_METRIC_BASE_DECIMAL: SCOREP_MetricBase = 1;

pub type SCOREP_MetricPer = libc::c_uint;
pub const SCOREP_METRIC_PER_THREAD: SCOREP_MetricPer = 0;
pub const SCOREP_METRIC_PER_PROCESS: SCOREP_MetricPer = 1;
pub const SCOREP_METRIC_PER_HOST: SCOREP_MetricPer = 2;
pub const SCOREP_METRIC_ONCE: SCOREP_MetricPer = 3;

pub type SCOREP_MetricSynchronicity = libc::c_uint;
pub const SCOREP_METRIC_STRICTLY_SYNC: SCOREP_MetricSynchronicity = 0;
pub const SCOREP_METRIC_SYNC: SCOREP_MetricSynchronicity = 1;
pub const SCOREP_METRIC_ASYNC_EVENT: SCOREP_MetricSynchronicity = 2;
pub const SCOREP_METRIC_ASYNC: SCOREP_MetricSynchronicity = 3;

pub type SCOREP_MetricSynchronizationMode = libc::c_uint;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SCOREP_MetricTimeValuePair {
    pub timestamp: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SCOREP_Metric_Plugin_MetricProperties {
    pub name: *mut libc::c_char,
    pub description: *mut libc::c_char,
    pub mode: SCOREP_MetricMode,
    pub value_type: SCOREP_MetricValueType,
    pub base: SCOREP_MetricBase,
    pub exponent: i64,
    pub unit: *mut libc::c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SCOREP_Metric_Plugin_Info {
    pub plugin_version: u32,
    pub run_per: SCOREP_MetricPer,
    pub sync: SCOREP_MetricSynchronicity,
    pub delta_t: u64,
    pub initialize: Option<unsafe extern "C" fn() -> i32>,
    pub finalize: Option<unsafe extern "C" fn()>,
    pub get_event_info: Option<
        unsafe extern "C" fn(
            token: *mut libc::c_char,
        ) -> *mut SCOREP_Metric_Plugin_MetricProperties,
    >,
    pub add_counter: Option<unsafe extern "C" fn(event_name: *mut libc::c_char) -> i32>,
    pub get_current_value: Option<unsafe extern "C" fn(id: i32) -> u64>,
    pub get_optional_value: Option<unsafe extern "C" fn(id: i32, value: *mut u64) -> bool>,
    pub set_clock_function: Option<unsafe extern "C" fn(clock: Option<extern "C" fn() -> u64>)>,
    pub get_all_values: Option<
        unsafe extern "C" fn(id: i32, time_value_list: *mut *mut SCOREP_MetricTimeValuePair) -> u64,
    >,
    pub synchronize: Option<unsafe extern "C" fn(is_responsible: bool, mode: SCOREP_MetricSynchronizationMode)>,
    pub reserved: [u64; SCOREP_METRIC_PLUGIN_INFO_RESERVED],
}

#[cfg(target_pointer_width = "64")]
const_assert_eq!(std::mem::size_of::<SCOREP_Metric_Plugin_MetricProperties>(), 48);
#[cfg(target_pointer_width = "64")]
const_assert_eq!(std::mem::size_of::<SCOREP_Metric_Plugin_Info>(), 832);

/// Rename function of a patched Score-P, handed over through the
/// `SCOREP_metric_name_update` tags.
pub type SCOREP_metric_name_update_t = unsafe extern "C" fn(
    current_name: *const libc::c_char,
    new_name: *const libc::c_char,
    metric_name: *const libc::c_char,
    num_metrics_set: libc::size_t,
);
