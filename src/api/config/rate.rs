// Copyright (c) 2020-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use arg_enum_proc_macro::ArgEnum;
use num_derive::*;
use thiserror::Error;

use crate::serialize::{Deserialize, Serialize};

/// Rate control errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  /// A QP file line is neither a quantizer, `-1` nor a comment
  #[error("invalid QP file entry on line {line}: {text:?}")]
  InvalidEntry {
    /// One-based line number.
    line: usize,
    /// The offending text.
    text: String,
  },
  /// A QP file quantizer is out of range
  #[error("QP {qp} on line {line} is out of range (expected <= {max})")]
  OutOfRange {
    /// One-based line number.
    line: usize,
    /// The parsed value.
    qp: i64,
    /// The highest valid quantizer.
    max: u8,
  },
}

/// How quantizers are chosen.
#[derive(
  ArgEnum,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  FromPrimitive,
  Serialize,
  Deserialize,
)]
#[repr(C)]
pub enum RateControlMode {
  /// Constant quantizer.
  #[arg_enum(alias = "cqp")]
  ConstantQp,
  /// Variable bit rate.
  #[arg_enum(alias = "vbr")]
  Vbr,
  /// Constant bit rate.
  #[arg_enum(alias = "cbr")]
  Cbr,
}

impl Default for RateControlMode {
  fn default() -> Self {
    RateControlMode::ConstantQp
  }
}

/// Highest quantizer the scheduler hands out.
pub const MAX_QP: u8 = 63;

/// Rate control configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct RateControlConfig {
  /// Quantizer selection mode.
  pub rate_control_mode: RateControlMode,
  /// Quantizer in constant-QP mode, starting quantizer otherwise.
  pub qp: u8,
  /// Target bit rate in bits per second.
  pub target_bit_rate: u64,
  /// Lowest quantizer rate control may pick.
  pub min_qp_allowed: u8,
  /// Highest quantizer rate control may pick.
  pub max_qp_allowed: u8,
  /// Channel rate feeding the VBV, defaults to the target bit rate.
  pub vbv_max_rate: Option<u64>,
  /// VBV size in bits, defaults to one second at the target bit rate.
  pub vbv_buf_size: Option<u64>,
  /// Take per-picture quantizers from the picture parameters.
  pub use_qp_file: bool,
}

impl Default for RateControlConfig {
  fn default() -> Self {
    RateControlConfig {
      rate_control_mode: RateControlMode::ConstantQp,
      qp: 32,
      target_bit_rate: 0,
      min_qp_allowed: 1,
      max_qp_allowed: MAX_QP,
      vbv_max_rate: None,
      vbv_buf_size: None,
      use_qp_file: false,
    }
  }
}

impl RateControlConfig {
  /// Create a default rate control configuration
  ///
  /// By default the encoder runs in constant quantizer mode.
  pub fn new() -> Self {
    Default::default()
  }

  /// Constant quantizer mode
  pub const fn with_qp(mut self, qp: u8) -> Self {
    self.rate_control_mode = RateControlMode::ConstantQp;
    self.qp = qp;
    self
  }

  /// Bit rate driven mode
  ///
  /// The starting quantizer is kept.
  pub const fn with_bitrate(
    mut self, mode: RateControlMode, target_bit_rate: u64,
  ) -> Self {
    self.rate_control_mode = mode;
    self.target_bit_rate = target_bit_rate;
    self
  }

  /// Bound the quantizers rate control may pick
  pub const fn with_qp_range(mut self, min: u8, max: u8) -> Self {
    self.min_qp_allowed = min;
    self.max_qp_allowed = max;
    self
  }

  /// Set the VBV channel rate and size
  pub const fn with_vbv(mut self, max_rate: u64, buf_size: u64) -> Self {
    self.vbv_max_rate = Some(max_rate);
    self.vbv_buf_size = Some(buf_size);
    self
  }

  /// Honor the quantizers supplied with each picture
  pub const fn with_qp_file(mut self, enable: bool) -> Self {
    self.use_qp_file = enable;
    self
  }

  /// Channel rate of the VBV model.
  pub fn vbv_rate(&self) -> u64 {
    self.vbv_max_rate.unwrap_or(self.target_bit_rate)
  }

  /// Size of the VBV model.
  pub fn vbv_size(&self) -> u64 {
    self.vbv_buf_size.unwrap_or_else(|| self.vbv_rate())
  }
}
