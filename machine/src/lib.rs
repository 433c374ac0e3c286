// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to the single-node cluster machine controller.

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

// Module for the simulated backend.
pub mod sim;

// Collaborator interfaces and their host implementations.
pub mod backend;
pub mod bundle;
pub mod cluster;
pub mod config;
pub mod dns;
pub mod driver;
mod error;
pub mod exec;
pub mod network;
pub mod ssh;
pub mod store;
pub mod systemd;

// Lifecycle entry points.
mod machine;

pub use error::{CommandError, Error};
pub use machine::{
    ConsoleResult, DeleteResult, IpResult, Machine, PowerOffResult,
    StartResult, StatusResult, StopResult,
};

#[macro_use]
extern crate slog;
