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

use std::time::Duration;

use thiserror::Error;

/// Errors raised inside the plugin. None of them reach Score-P directly; the
/// ABI layer logs them and reports a "did nothing" value instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The metric specification is not exactly `<event>@<parameter>`.
    #[error("malformed metric specification: {0:?}")]
    MalformedSpec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Loading or resolving a symbol of the UCX statistics library failed.
    #[error("library error: {0}")]
    Library(#[from] libloading::Error),

    /// The statistics server did not receive any packet in time.
    #[error("no statistics received within {0:?}")]
    DiscoveryTimeout(Duration),

    /// A collaborator (stats server, NIC device, rename callback) is not set up.
    #[error("{0} is not available")]
    Unavailable(&'static str),

    #[error("collective operation failed: {0}")]
    Collective(String),
}

pub type Result<T> = std::result::Result<T, Error>;
