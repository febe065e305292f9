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

use crate::ucs::UCS_STATS_DEFAULT_UDP_PORT;

use log::error;

use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::from_env);

macro_rules! field_from_env {
    ($s: expr, $field: ident) => {
        let env_name = plugin_config!(stringify!($field).to_uppercase());
        $s.$field = parse_env(&env_name);
    };
    ($s: expr, $field: ident, $d: expr) => {
        let env_name = plugin_config!(stringify!($field).to_uppercase());
        $s.$field = parse_env(&env_name).unwrap_or($d);
    };
    ($s: expr, $env_name: literal, $field: ident, $d: expr) => {
        $s.$field = parse_env($env_name).unwrap_or($d);
    };
}

macro_rules! plugin_config {
    ($s: expr) => {
        format!("SCOREP_UCX_PLUGIN_{}", $s)
    };
}

/// Where UCX counter values come from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CollectionMode {
    /// Pre-reduced aggregate-sum counters computed by UCX.
    #[default]
    Aggregate,
    /// Full walk of the statistics tree received by the stats server.
    Tree,
}

/// Direction in which `add_counter` hands out ids.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IdPolicy {
    /// 0, 1, 2, ...
    #[default]
    Increasing,
    /// `placeholder_counters - 1` down to 0.
    Decreasing,
}

#[derive(Debug, Default, Clone)]
pub struct Config {
    // Basic enable / disable
    pub ucx_counters_collection_enable: bool,
    pub nic_counters_collection_enable: bool,
    pub nic_device_name: Option<String>,

    // Counter discovery
    pub collection_mode: CollectionMode,
    pub id_policy: IdPolicy,
    pub placeholder_counters: usize,
    pub names_file: String,
    pub ucs_lib: String,
    pub stats_port: u16,
    /// Zero waits forever.
    pub discovery_timeout: Duration,

    // Sampling
    pub nic_update_decimation: u64,
    pub microbenchmark: bool,
    pub enable_profiling: bool,

    // Export
    pub summary_file: Option<String>,
}

impl Config {
    fn from_env() -> Self {
        let mut s = Config::default();
        field_from_env!(s, ucx_counters_collection_enable, true);
        field_from_env!(s, nic_counters_collection_enable, false);
        field_from_env!(s, nic_device_name);

        field_from_env!(s, collection_mode, CollectionMode::default());
        field_from_env!(s, id_policy, IdPolicy::default());
        field_from_env!(s, placeholder_counters, 50);
        field_from_env!(s, names_file, String::from("scorep_ucx_metric_names.txt"));
        field_from_env!(s, ucs_lib, String::from("libucs.so"));
        field_from_env!(s, stats_port, UCS_STATS_DEFAULT_UDP_PORT);
        field_from_env!(s, discovery_timeout, Duration::from_secs(10));

        field_from_env!(s, nic_update_decimation, 16);
        field_from_env!(s, microbenchmark, false);
        field_from_env!(s, "SCOREP_ENABLE_PROFILING", enable_profiling, true);

        field_from_env!(s, summary_file);

        s
    }

    pub fn discovery_timeout(&self) -> Option<Duration> {
        (!self.discovery_timeout.is_zero()).then_some(self.discovery_timeout)
    }
}

trait FromConfigStr: Sized {
    type Err;
    fn parse(s: &str) -> Result<Self, Self::Err>;
}

// macro that implements FromConfigStr trait with FromStr
macro_rules! default_config_parser {
    ($t: tt) => {
        impl FromConfigStr for $t {
            type Err = <$t as FromStr>::Err;
            fn parse(s: &str) -> Result<Self, Self::Err> {
                <$t as FromStr>::from_str(s)
            }
        }
    };
}

default_config_parser!(String);
default_config_parser!(usize);
default_config_parser!(u64);
default_config_parser!(u16);

impl FromConfigStr for bool {
    type Err = String;
    fn parse(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        const TRUE: &[&str] = &["true", "y", "yes", "1"];
        const FALSE: &[&str] = &["false", "n", "no", "0"];
        if TRUE.iter().any(|i| *i == s) {
            return Ok(true);
        }
        if FALSE.iter().any(|i| *i == s) {
            return Ok(false);
        }
        // toggles are integers: 0 is off, anything else is on
        if let Ok(v) = s.parse::<i64>() {
            return Ok(v != 0);
        }
        Err(format!("Could not parse {} to bool", s))
    }
}

impl FromConfigStr for CollectionMode {
    type Err = String;
    fn parse(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aggregate" | "aggregate_sum" => Ok(Self::Aggregate),
            "tree" | "legacy" => Ok(Self::Tree),
            _ => Err(format!("Unknown collection mode {}", s)),
        }
    }
}

impl FromConfigStr for IdPolicy {
    type Err = String;
    fn parse(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "increasing" => Ok(Self::Increasing),
            "decreasing" => Ok(Self::Decreasing),
            _ => Err(format!("Unknown id policy {}", s)),
        }
    }
}

mod duration_parser {
    use nom::{
        character::complete::{alpha1, digit1},
        combinator::map_res,
        multi::fold_many1,
        sequence::pair,
        IResult, Parser as _,
    };

    use std::time::Duration;

    fn parse_u64(input: &str) -> IResult<&str, u64> {
        map_res(digit1, |s: &str| s.parse::<u64>()).parse(input)
    }

    fn parse_duration_component(input: &str) -> IResult<&str, Duration> {
        let (input, (value, unit)) = pair(parse_u64, alpha1).parse(input)?;

        // Match the unit and create the corresponding Duration.
        match unit {
            "d" => Ok((input, Duration::from_secs(value * 24 * 60 * 60))),
            "h" => Ok((input, Duration::from_secs(value * 60 * 60))),
            "m" => Ok((input, Duration::from_secs(value * 60))),
            "s" => Ok((input, Duration::from_secs(value))),
            "ms" => Ok((input, Duration::from_millis(value))),
            "us" => Ok((input, Duration::from_micros(value))),
            "ns" => Ok((input, Duration::from_nanos(value))),
            _ => Err(nom::Err::Failure(nom::error::Error::new(
                unit,
                nom::error::ErrorKind::Tag,
            ))),
        }
    }

    pub fn parse(input: &str) -> IResult<&str, Duration> {
        let (remaining, maybe_dur) = fold_many1(
            parse_duration_component,
            || Ok(Duration::default()),
            |acc: Result<_, nom::Err<_>>, item| {
                acc?.checked_add(item).ok_or_else(|| {
                    nom::Err::Failure(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::TooLarge,
                    ))
                })
            },
        )
        .parse(input)?;
        Ok((remaining, maybe_dur?))
    }
}

impl FromConfigStr for std::time::Duration {
    type Err = String;
    fn parse(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        if let Ok((remaining, dur)) = duration_parser::parse(&s) {
            if remaining.is_empty() {
                return Ok(dur);
            }
        }
        Err(format!("Could not parse {} to duration", s))
    }
}

fn parse_env<T>(name: &str) -> Option<T>
where
    T: FromConfigStr,
    <T as FromConfigStr>::Err: std::fmt::Debug,
{
    std::env::var(name).ok().and_then(|s| {
        T::parse(&s)
            .map_err(|e| {
                error!("Error parsing config {}, got error {:?}", name, e);
                e
            })
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool() {
        const TRUE_LITERALS: &[&str] = &["y", "Y", "yes", "YES", "true", "True", "1"];
        for t in TRUE_LITERALS {
            assert_eq!(bool::parse(t), Ok(true));
        }

        const FALSE_LITERALS: &[&str] = &["n", "N", "no", "NO", "false", "False", "0"];
        for f in FALSE_LITERALS {
            assert_eq!(bool::parse(f), Ok(false));
        }

        const ERR_LITERALS: &[&str] = &["not", "correct", "random"];
        for e in ERR_LITERALS {
            assert!(bool::parse(e).is_err());
        }

        assert_eq!(bool::parse("2"), Ok(true));
        assert_eq!(bool::parse("-1"), Ok(true));
        assert_eq!(bool::parse("00"), Ok(false));
    }

    #[test]
    fn parse_modes() {
        assert_eq!(CollectionMode::parse("Tree"), Ok(CollectionMode::Tree));
        assert_eq!(
            CollectionMode::parse("aggregate"),
            Ok(CollectionMode::Aggregate)
        );
        assert!(CollectionMode::parse("both").is_err());
        assert_eq!(IdPolicy::parse("DECREASING"), Ok(IdPolicy::Decreasing));
        assert!(IdPolicy::parse("random").is_err());
    }

    #[test]
    fn zero_timeout_waits_forever() {
        let mut config = Config {
            discovery_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.discovery_timeout(), None);
        config.discovery_timeout = Duration::from_millis(1500);
        assert_eq!(
            config.discovery_timeout(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn parse_duration() {
        use std::time::Duration;

        assert_eq!(Duration::parse("1h60s"), Ok(Duration::from_secs(3600 + 60)));
        assert_eq!(Duration::parse("22us"), Ok(Duration::from_micros(22)));
        assert_eq!(Duration::parse("10m"), Ok(Duration::from_secs(600)));
    }
}
