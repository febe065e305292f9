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

use log::error;
use serde_json::json;

/// Longest counter name kept, in bytes.
pub const MAX_COUNTER_NAME_LEN: usize = 511;

/// `previous_value` of an entry that was never sampled.
pub const UNKNOWN_VALUE: u64 = u64::MAX;

/// One discovered counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEntry {
    pub slot_id: u32,
    pub name: String,
    pub value: u64,
    pub previous_value: u64,
    pub already_renamed: bool,
}

impl CounterEntry {
    fn new(slot_id: u32, mut name: String, value: u64) -> Self {
        truncate_name(&mut name);
        Self {
            slot_id,
            name,
            value,
            previous_value: UNKNOWN_VALUE,
            already_renamed: false,
        }
    }

    pub fn summary_record(&self) -> serde_json::Value {
        json!({
            "slot": self.slot_id,
            "name": self.name,
            "value": self.value,
            "previous_value": if self.previous_value == UNKNOWN_VALUE {
                serde_json::Value::Null
            } else {
                json!(self.previous_value)
            },
            "renamed": self.already_renamed,
        })
    }
}

fn truncate_name(name: &mut String) {
    if name.len() > MAX_COUNTER_NAME_LEN {
        let mut end = MAX_COUNTER_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
}

/// Value handed to the profiler for one retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sample {
    pub value: u64,
    pub previous_value: u64,
    pub changed: bool,
}

/// Insertion-ordered table of counters, indexed by slot id.
///
/// Slots are handed out on append and never reused; entries are only ever
/// updated in place.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    entries: Vec<CounterEntry>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for name in names {
            registry.push(name.into(), 0);
        }
        registry
    }

    /// Appends a new entry and returns its slot.
    pub fn push(&mut self, name: String, value: u64) -> u32 {
        let slot = self.entries.len() as u32;
        self.entries.push(CounterEntry::new(slot, name, value));
        slot
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, slot: u32) -> Option<&CounterEntry> {
        self.entries.get(slot as usize)
    }

    pub fn get_mut(&mut self, slot: u32) -> Option<&mut CounterEntry> {
        self.entries.get_mut(slot as usize)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CounterEntry> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Overwrites the raw value of `slot`; unknown slots are ignored.
    pub fn set_value(&mut self, slot: u32, value: u64) -> bool {
        match self.get_mut(slot) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    /// Reads `slot` for the profiler and rotates its previous value.
    ///
    /// Unknown slots read as zero.
    pub fn sample(&mut self, slot: u32) -> Sample {
        match self.get_mut(slot) {
            Some(entry) => {
                let s = Sample {
                    value: entry.value,
                    previous_value: entry.previous_value,
                    changed: entry.value != entry.previous_value,
                };
                entry.previous_value = entry.value;
                s
            }
            None => Sample::default(),
        }
    }

    /// NUL-terminated concatenation of all names, in slot order.
    ///
    /// This is what the root rank broadcasts. Running out of memory here
    /// aborts the process: a truncated buffer would desynchronize every
    /// receiving rank.
    pub fn serialize_names(&self) -> Vec<u8> {
        let total: usize = self.entries.iter().map(|e| e.name.len() + 1).sum();
        let mut buf = Vec::new();
        if let Err(e) = buf.try_reserve_exact(total) {
            error!(
                "Could not allocate {} bytes for serialized counter names: {}",
                total, e
            );
            std::process::abort();
        }
        for entry in self.entries.iter() {
            buf.extend_from_slice(entry.name.as_bytes());
            buf.push(0);
        }
        buf
    }

    /// Inverse of [`CounterRegistry::serialize_names`]; at most `count` names.
    pub fn deserialize_names(buf: &[u8], count: usize) -> Vec<String> {
        if buf.is_empty() {
            return Vec::new();
        }
        let body = buf.strip_suffix(b"\0").unwrap_or(buf);
        body.split(|b| *b == 0)
            .take(count)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }
}
