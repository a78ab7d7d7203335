// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Shared fixtures for the in-crate test suites.

use std::sync::Arc;

use chip::sim::SimPlatform;
use chip::sim::SimRegisterIo;
use chip::Kestrel;

use crate::switch::Switch;

pub fn test_log() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

/// A switch instance over the register-level simulator, plus a handle to
/// the simulator for register poking and fault injection.
pub fn sim_switch(platform: SimPlatform) -> (Arc<SimRegisterIo>, Switch) {
    let family = Arc::new(Kestrel::new());
    let io = Arc::new(SimRegisterIo::new(family.as_ref()));
    let switch = Switch::new(
        &test_log(),
        family,
        io.clone(),
        Box::new(platform),
    )
    .expect("switch construction");
    (io, switch)
}
