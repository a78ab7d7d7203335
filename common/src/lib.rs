// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Types and utilities shared across the link control plane workspace.

pub mod logging;
pub mod ports;

/// Return the current wall-clock time in milliseconds since the UNIX epoch.
pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Return the current wall-clock time in nanoseconds since the UNIX epoch.
pub fn timestamp_ns() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .expect("in-range until the year 2262")
}
