// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primitives shared by the snc crates: bounded retries, HTTP proxy policy
//! and logging configuration.

pub mod backoff;
pub mod logging;
pub mod proxy;
