// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The hardware abstraction layer: the narrow interfaces through which the
//! control plane touches a switch ASIC.
//!
//! Register-bus access and the platform's port-mapping callback are the only
//! two things the control plane consumes from below.  Everything here is
//! defined in terms of 32-bit hardware words at word addresses; callers are
//! expected to hold the per-switch lock across any sequence of accesses
//! that must be observed atomically.

use thiserror::Error;

mod lanes;
pub use lanes::*;

use common::ports::LogicalPort;
use common::ports::PhysicalPort;

/// A specialized Result type for hardware-layer operations
pub type HalResult<T> = Result<T, HalError>;

/// Error type conveying additional information about hardware-layer failures
#[derive(Error, Debug)]
pub enum HalError {
    /// The register bus rejected or failed an access.  Fatal during boot.
    #[error("register access failed at {addr:#010x}: {detail}")]
    RegisterIo { addr: u32, detail: String },
    /// A configuration write did not read back as written.  Treated as a
    /// hard failure, never retried.
    #[error(
        "read-back mismatch at {addr:#010x}: wrote {wrote:#010x}, \
         read {read:#010x}"
    )]
    ReadbackMismatch { addr: u32, wrote: u32, read: u32 },
    /// The identification word no longer reads as expected; the device is
    /// gone or wedged.
    #[error(
        "device identification mismatch: expected {expected:#010x}, \
         found {found:#010x}"
    )]
    NotAlive { expected: u32, found: u32 },
    /// An argument passed to the hardware layer is invalid or inappropriate.
    /// Indicates misbehavior from the caller.
    #[error("invalid argument: {}", .0)]
    InvalidArg(String),
    /// This operation is unsupported by the chip family being managed
    #[error("operation unsupported by this chip family")]
    Unsupported,
    /// The hardware layer detected some internal inconsistency
    #[error("internal error: {}", .0)]
    Internal(String),
}

/// Atomic access to the register bus.
///
/// Implementations provide word-granularity reads and writes and a delay
/// primitive.  None of these methods take locks of their own; serialization
/// against other bus users is the caller's responsibility.
pub trait RegisterIo {
    /// Read the 32-bit word at `addr`.
    fn read32(&self, addr: u32) -> HalResult<u32>;

    /// Write the 32-bit word at `addr`.
    fn write32(&self, addr: u32, val: u32) -> HalResult<()>;

    /// Update only the bits of `addr` selected by `mask`, preserving the
    /// rest, as a single read-modify-write on the caller's context.
    fn masked_write32(&self, addr: u32, mask: u32, val: u32) -> HalResult<()> {
        let cur = self.read32(addr)?;
        self.write32(addr, (cur & !mask) | (val & mask))
    }

    /// Write `val` to `addr` and read it back; a mismatch is a hard
    /// failure, not retried.
    fn write32_verified(&self, addr: u32, val: u32) -> HalResult<()> {
        self.write32(addr, val)?;
        let read = self.read32(addr)?;
        if read != val {
            return Err(HalError::ReadbackMismatch {
                addr,
                wrote: val,
                read,
            });
        }
        Ok(())
    }

    /// Stall the calling context for at least `us` microseconds.
    fn delay_us(&self, us: u64);
}

/// The platform layer's view of the board: which physical ports are wired
/// up, and the logical port number each should be known by.
pub trait Platform {
    /// Map a physical port number to its logical port number.  Returning
    /// `None` declares the port absent on this board; callers skip it
    /// rather than treating it as an error.
    fn map_physical_port(&self, phys: PhysicalPort) -> Option<LogicalPort>;

    /// A human-readable name for the board, used in log messages.
    fn board_name(&self) -> &str;
}
