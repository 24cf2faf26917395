// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! apiary: live migration of microVM backing state between hosts.
//!
//! A running microVM is backed by a set of named block devices (kernel
//! image, root disk, memory image, CPU/device state, config, ...).  Each
//! device is the top of a layered storage stack rooted in an immutable
//! base file, and the [`migrate`] module moves such a stack to a remote
//! peer while the guest keeps dirtying it, suspending the guest only for
//! the final dirty set.
//!
//! The hypervisor itself is out of process; this crate drives it through
//! the small RPC surface in [`vmm`] and reaches the in-guest agent
//! through [`agent`].

pub mod agent;
pub mod block;
pub mod device;
pub mod expose;
pub mod migrate;
pub mod vmm;
