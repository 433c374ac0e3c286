// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Machine controller integration tests
//!
//! See the driver in the parent directory for how and why this is structured
//! the way it is.

mod lifecycle;
mod start;
