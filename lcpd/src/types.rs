// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the link control plane daemon.

use std::convert;

use common::ports::LogicalPort;
use hal::HalError;

pub type LcpdResult<T> = Result<T, LcpdError>;

#[derive(Debug, thiserror::Error)]
pub enum LcpdError {
    #[error("hardware error: {0}")]
    Hal(HalError),
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("resource already exists: {0}")]
    Exists(String),
    #[error("resource is missing: {0}")]
    Missing(String),
    #[error("invalid argument: {0}")]
    Invalid(String),
    #[error("attribute unsupported here: {0}")]
    Unsupported(String),
    #[error("resource exhausted: {0}")]
    Exhausted(String),
    #[error("identifier ranges overlap: {0}")]
    RangeOverlap(String),
    #[error(
        "no divider combination reaches {0} Hz within the valid VCO band"
    )]
    ClockUnachievable(u64),
    #[error("boot step '{step}' failed: {err}")]
    Boot {
        step: &'static str,
        err: Box<LcpdError>,
    },
    #[error("switch instance marked failed; hardware access disabled")]
    Failed,
    #[error("state machine error: {0}")]
    Fsm(String),
    #[error("logical port {0} does not exist")]
    NoSuchPort(LogicalPort),
    #[error("Error: {0}")]
    Other(String),
}

impl convert::From<HalError> for LcpdError {
    fn from(err: HalError) -> Self {
        LcpdError::Hal(err)
    }
}

impl convert::From<std::io::Error> for LcpdError {
    fn from(err: std::io::Error) -> Self {
        LcpdError::Io(err)
    }
}

impl convert::From<String> for LcpdError {
    fn from(err: String) -> Self {
        LcpdError::Other(err)
    }
}

impl convert::From<&str> for LcpdError {
    fn from(err: &str) -> Self {
        LcpdError::Other(err.to_string())
    }
}

impl convert::From<anyhow::Error> for LcpdError {
    fn from(err: anyhow::Error) -> Self {
        LcpdError::Other(err.to_string())
    }
}
