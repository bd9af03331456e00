// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod crypto;
mod parameters;
mod test_roster;

pub use crypto::*;
pub use parameters::*;
pub use test_roster::*;

/// Index of a fixed wall-clock interval for which availability is accounted.
/// Epoch 0 starts at the network genesis instant.
pub type Epoch = u64;

/// How much of an epoch a node was observed online, in protocol units.
/// The full range of a `u8` is used: 0 means never seen, the protocol
/// maximum means observed online for the whole epoch.
pub type AvailabilityValue = u8;
