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

use crate::error::{Error, Result};

/// Event name of the metric this plugin serves.
pub const UCX_EVENT: &str = "UCX";

/// Events through which a patched Score-P hands over its metric rename
/// function. The parameter carries the function address in hex.
pub const STRICTLY_SYNCHRONOUS_NAME_UPDATE_EVENT: &str =
    "SCOREP_Strictly_Synchronous_metric_name_update";
pub const NAME_UPDATE_EVENT: &str = "SCOREP_metric_name_update";

const PLACEHOLDER_TEMPLATE: &str = "temporary_counter_name_______________________________________";

/// A parsed `<event>@<parameter>` metric specification.
///
/// The parameter is read twice: as a decimal counter-count override and as a
/// hexadecimal value (used as a function address by the rename tags). Either
/// reading is `None` when the parameter has no leading digit of that radix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSpec {
    pub event: String,
    pub count: Option<u64>,
    pub address: Option<u64>,
}

mod grammar {
    use nom::{
        bytes::complete::{tag_no_case, take_till1},
        character::complete::{char, digit1, hex_digit1},
        combinator::{all_consuming, map_res, opt},
        sequence::{preceded, separated_pair},
        IResult, Parser as _,
    };

    pub fn spec(input: &str) -> IResult<&str, (&str, &str)> {
        all_consuming(separated_pair(
            take_till1(|c| c == '@'),
            char('@'),
            take_till1(|c| c == '@'),
        ))
        .parse(input)
    }

    /// Leading decimal digits, the way `stoull` reads them.
    pub fn decimal(input: &str) -> IResult<&str, u64> {
        map_res(digit1, |s: &str| s.parse::<u64>()).parse(input)
    }

    /// Leading hex digits with an optional `0x` prefix, the way `strtoull(.., 16)`
    /// reads them.
    pub fn hex(input: &str) -> IResult<&str, u64> {
        map_res(preceded(opt(tag_no_case("0x")), hex_digit1), |s: &str| {
            u64::from_str_radix(s, 16)
        })
        .parse(input)
    }
}

impl MetricSpec {
    pub fn parse(metric: &str) -> Result<Self> {
        let (_, (event, parameter)) =
            grammar::spec(metric).map_err(|_| Error::MalformedSpec(metric.to_owned()))?;
        let parameter = parameter.trim();
        Ok(Self {
            event: event.to_owned(),
            count: grammar::decimal(parameter).ok().map(|(_, v)| v),
            address: grammar::hex(parameter).ok().map(|(_, v)| v),
        })
    }

    pub fn is_ucx(&self) -> bool {
        self.event == UCX_EVENT
    }

    pub fn is_name_update_registration(&self) -> bool {
        self.event == STRICTLY_SYNCHRONOUS_NAME_UPDATE_EVENT || self.event == NAME_UPDATE_EVENT
    }
}

/// Name under which `slot` was registered before its real name was known.
///
/// Only depends on the slot and the watched metric name, so the rename
/// protocol can rebuild it without keeping the placeholder list around.
pub fn placeholder_name(metric_name: &str, slot: u32) -> String {
    format!("{}_{}{}", metric_name, PLACEHOLDER_TEMPLATE, slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_well_formed() {
        let spec = MetricSpec::parse("UCX@10").unwrap();
        assert_eq!(spec.event, "UCX");
        assert_eq!(spec.count, Some(10));
        assert_eq!(spec.address, Some(0x10));
        assert!(spec.is_ucx());
        assert!(!spec.is_name_update_registration());
    }

    #[test]
    fn parse_rejects_wrong_arity() {
        for bad in ["UCX", "UCX@1@2", "@1", "UCX@", ""] {
            assert!(
                matches!(MetricSpec::parse(bad), Err(Error::MalformedSpec(_))),
                "{:?} should not parse",
                bad
            );
        }
    }

    #[test]
    fn parse_rename_registration_address() {
        let spec = MetricSpec::parse("SCOREP_metric_name_update@0x7f12ab00").unwrap();
        assert!(spec.is_name_update_registration());
        assert_eq!(spec.address, Some(0x7f12ab00));
        assert_eq!(spec.count, Some(0));

        let spec =
            MetricSpec::parse("SCOREP_Strictly_Synchronous_metric_name_update@deadbeef").unwrap();
        assert!(spec.is_name_update_registration());
        assert_eq!(spec.address, Some(0xdeadbeef));
        assert_eq!(spec.count, None);
    }

    #[test]
    fn placeholder_is_reproducible() {
        assert_eq!(
            placeholder_name("UCX@1", 7),
            "UCX@1_temporary_counter_name_______________________________________7"
        );
        assert_eq!(placeholder_name("UCX@1", 7), placeholder_name("UCX@1", 7));
        assert_ne!(placeholder_name("UCX@1", 7), placeholder_name("UCX@1", 8));
    }
}
