// Copyright (c) 2018-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

/// Channel-based scheduler
#[cfg(feature = "channel-api")]
pub mod channel;
/// Scheduler configuration
pub mod config;
/// Scheduler context
pub mod context;
/// Internal implementation
pub(crate) mod internal;
/// Public types
pub mod util;


#[cfg(feature = "channel-api")]
pub use channel::*;
pub use config::*;
pub use context::*;
pub(crate) use internal::*;
pub use util::*;
