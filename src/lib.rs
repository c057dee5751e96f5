// Copyright (c) 2017-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! picsched is the picture-level scheduler of a hierarchical video encoder.
//!
//! It reorders display-order pictures into mini-GOPs, tracks the lifetime of
//! reconstructed reference pictures, and runs the rate control loop that
//! gives every picture its quantizer. The pixel work is left to a
//! [`PictureEncoder`] supplied by the user.
//!
//! The synchronous entry point is [`Context`], created from a [`Config`].
//! With the `channel-api` feature the same machinery runs as a bounded
//! multi-worker pipeline, see [`Config::new_channel`].
//!
//! [`PictureEncoder`]: api::PictureEncoder
//! [`Context`]: api::Context
//! [`Config`]: api::Config
//! [`Config::new_channel`]: api::Config::new_channel

// Safety lints
#![deny(bare_trait_objects)]
#![deny(clippy::as_ptr_cast_mut)]
#![deny(clippy::large_stack_arrays)]
// Performance lints
#![warn(clippy::inefficient_to_string)]
#![warn(clippy::invalid_upcast_comparisons)]
#![warn(clippy::iter_with_drain)]
#![warn(clippy::linkedlist)]
#![warn(clippy::mutex_integer)]
#![warn(clippy::naive_bytecount)]
#![warn(clippy::needless_bitwise_bool)]
#![warn(clippy::needless_collect)]
#![warn(clippy::or_fun_call)]
#![warn(clippy::stable_sort_primitive)]
#![warn(clippy::suboptimal_flops)]
#![warn(clippy::trivially_copy_pass_by_ref)]
#![warn(clippy::unnecessary_join)]
#![warn(clippy::zero_sized_map_values)]
// Correctness lints
#![deny(clippy::copy_iterator)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::float_cmp)]
#![warn(clippy::imprecise_flops)]
#![deny(clippy::manual_instant_elapsed)]
#![deny(clippy::mem_forget)]
#![deny(clippy::path_buf_push_overwrite)]
#![deny(clippy::same_functions_in_if_condition)]
#![deny(clippy::unchecked_duration_subtraction)]
// Clarity/formatting lints
#![warn(clippy::checked_conversions)]
#![warn(clippy::derive_partial_eq_without_eq)]
#![warn(clippy::explicit_deref_methods)]
#![warn(clippy::filter_map_next)]
#![warn(clippy::flat_map_option)]
#![warn(clippy::implicit_clone)]
#![warn(clippy::iter_not_returning_iterator)]
#![warn(clippy::manual_let_else)]
#![warn(clippy::map_flatten)]
#![warn(clippy::match_bool)]
#![warn(clippy::mut_mut)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_continue)]
#![warn(clippy::range_minus_one)]
#![warn(clippy::range_plus_one)]
#![warn(clippy::ref_option_ref)]
#![warn(clippy::unused_self)]
#![warn(clippy::verbose_bit_mask)]

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

mod serialize {
  cfg_if::cfg_if! {
    if #[cfg(feature="serialize")] {
      pub use serde::*;
    } else {
      pub use noop_proc_macro::{Deserialize, Serialize};
    }
  }
}

pub(crate) mod decision;
pub(crate) mod pool;
pub(crate) mod rate;
pub(crate) mod reference;
pub(crate) mod stats;

mod api;

pub use crate::api::*;

pub use v_frame::frame::Frame;
pub use v_frame::pixel::{ChromaSampling, Pixel};

/// Commonly used types and traits.
pub mod prelude {
  pub use crate::api::*;
  pub use crate::decision::PictureDescriptor;
  pub use crate::pool::{PictureBuffer, PictureBufferPool, PoolStats};
  pub use crate::rate::{IntervalKey, QpFile, RateControlCoordinator};
  pub use crate::reference::{
    ReferenceLists, ReferencePicture, ReferenceScheduler, ReferenceStats,
  };
  pub use crate::stats::{EncodeStats, PictureTotals};

  pub use v_frame::frame::Frame;
  pub use v_frame::pixel::{CastFromPrimitive, ChromaSampling, Pixel};
  pub use v_frame::plane::Plane;
}

/// Scheduling building blocks, exposed for tools and tests that drive the
/// components directly.
pub mod core {
  pub use crate::decision::{PictureDecisionEngine, PictureInput};
  pub use crate::pool::{PictureBuffer, PictureBufferPool};
  pub use crate::rate::{RateControlCoordinator, RateControlInterval};
  pub use crate::reference::{RefId, ReferenceScheduler};
}
