// Copyright (c) 2020-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use thiserror::Error;

use crate::api::{Context, ContextInner};
use v_frame::pixel::Pixel;

mod encoder;
pub use encoder::*;

mod rate;
pub use rate::Error as RateControlError;
pub use rate::{RateControlConfig, RateControlMode, MAX_QP};

/// Enumeration of possible invalid configuration errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum InvalidConfig {
  /// The width is invalid.
  #[error("invalid width {0} (expected >= 16, <= 65535)")]
  InvalidWidth(usize),
  /// The height is invalid.
  #[error("invalid height {0} (expected >= 16, <= 65535)")]
  InvalidHeight(usize),
  /// The bit depth is not supported.
  #[error("invalid bit depth {0} (expected 8, 10 or 12)")]
  InvalidBitDepth(usize),
  /// The pixel type cannot hold the configured bit depth.
  #[error("pixel type of {bits} bits cannot hold bit depth {bit_depth}")]
  PixelTypeMismatch {
    /// Size of the pixel type in bits.
    bits: usize,
    /// The configured bit depth.
    bit_depth: usize,
  },
  /// Framerate numerator is invalid.
  #[error("invalid framerate numerator {actual} (expected > 0, <= {max})")]
  InvalidFrameRateNum {
    /// The actual value.
    actual: u64,
    /// The maximal supported value.
    max: u64,
  },
  /// Framerate denominator is invalid.
  #[error("invalid framerate denominator {actual} (expected > 0, <= {max})")]
  InvalidFrameRateDen {
    /// The actual value.
    actual: u64,
    /// The maximal supported value.
    max: u64,
  },
  /// The temporal hierarchy is too deep.
  #[error("invalid hierarchical levels {actual} (expected <= {max})")]
  InvalidHierarchicalLevels {
    /// The actual value.
    actual: u8,
    /// The maximal supported value.
    max: u8,
  },
  /// Intra period is invalid.
  #[error("invalid intra period {0} (expected -2, -1 or >= 0)")]
  InvalidIntraPeriod(i64),
  /// Reference count is invalid.
  #[error("invalid reference count {actual} (expected >= 1, <= {max})")]
  InvalidReferenceCount {
    /// The actual value.
    actual: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// The quantizer bounds are inverted or out of range.
  #[error("invalid QP range [{min}, {max}] (expected min <= max <= 63)")]
  InvalidQpRange {
    /// Lowest allowed quantizer.
    min: u8,
    /// Highest allowed quantizer.
    max: u8,
  },
  /// The quantizer is out of range.
  #[error("invalid QP {actual} (expected <= {max})")]
  InvalidQp {
    /// The actual value.
    actual: u8,
    /// The maximal supported value.
    max: u8,
  },

  /// The rate control needs a target bitrate in order to produce results
  #[error("The rate control requires a target bitrate")]
  TargetBitrateNeeded,

  /// The VBV buffer cannot hold a single picture.
  #[error("invalid VBV buffer size {0} (expected > 0)")]
  InvalidVbvBufferSize(u64),

  /// The thread pool of a channel could not be started.
  #[error("cannot start a thread pool of {0} threads")]
  ThreadPoolUnavailable(usize),
}

/// Contains the scheduler configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Config {
  /// Settings which impact the scheduling decisions.
  pub(crate) enc: EncoderConfig,
  /// Rate control configuration
  pub(crate) rate_control: RateControlConfig,
  /// The number of downstream workers of a channel.
  pub(crate) threads: usize,
}

impl Config {
  /// Create a default configuration
  ///
  /// same as `Default::default()`
  pub fn new() -> Self {
    Config::default()
  }

  /// Set the encoder configuration
  ///
  /// `EncoderConfig` contains the settings impacting the prediction
  /// structure of the produced stream.
  pub const fn with_encoder_config(mut self, enc: EncoderConfig) -> Self {
    self.enc = enc;
    self
  }

  /// Set the number of downstream workers of each channel
  ///
  /// If it is left unset, the channel uses as many workers as Rayon
  /// would use threads.
  pub const fn with_threads(mut self, threads: usize) -> Self {
    self.threads = threads;
    self
  }

  /// Set the rate control configuration
  ///
  /// The default configuration is constant quantizer
  pub const fn with_rate_control(
    mut self, rate_control: RateControlConfig,
  ) -> Self {
    self.rate_control = rate_control;
    self
  }

  /// The encoder configuration.
  pub const fn encoder_config(&self) -> &EncoderConfig {
    &self.enc
  }

  /// The rate control configuration.
  pub const fn rate_control(&self) -> &RateControlConfig {
    &self.rate_control
  }

  pub(crate) fn workers(&self) -> usize {
    if self.threads == 0 {
      rayon::current_num_threads()
    } else {
      self.threads
    }
  }
}

impl Config {
  pub(crate) fn new_inner<T: Pixel>(
    &self,
  ) -> Result<ContextInner<T>, InvalidConfig> {
    let bits = 8 * std::mem::size_of::<T>();
    if bits < self.enc.bit_depth {
      return Err(InvalidConfig::PixelTypeMismatch {
        bits,
        bit_depth: self.enc.bit_depth,
      });
    }

    self.validate()?;

    Ok(ContextInner::new(&self.enc, &self.rate_control))
  }

  /// Creates a [`Context`] with this configuration.
  ///
  /// # Errors
  ///
  /// Returns `InvalidConfig` if the config is invalid.
  ///
  /// # Examples
  ///
  /// ```
  /// use picsched::prelude::*;
  ///
  /// # fn main() -> Result<(), InvalidConfig> {
  /// let cfg = Config::default();
  /// let ctx: Context<u8> = cfg.new_context()?;
  /// # Ok(())
  /// # }
  /// ```
  ///
  /// [`Context`]: struct.Context.html
  pub fn new_context<T: Pixel>(&self) -> Result<Context<T>, InvalidConfig> {
    let inner = self.new_inner()?;

    Ok(Context { is_flushing: false, inner, config: *self })
  }

  /// Validates the configuration.
  ///
  /// # Errors
  ///
  /// - Returns `InvalidConfig` if any setting is out of range.
  pub fn validate(&self) -> Result<(), InvalidConfig> {
    use InvalidConfig::*;

    let config = &self.enc;

    if config.width < 16 || config.width > u16::MAX as usize {
      return Err(InvalidWidth(config.width));
    }
    if config.height < 16 || config.height > u16::MAX as usize {
      return Err(InvalidHeight(config.height));
    }
    if ![8, 10, 12].contains(&config.bit_depth) {
      return Err(InvalidBitDepth(config.bit_depth));
    }

    if config.time_base.num == 0 || config.time_base.num > u32::MAX as u64 {
      return Err(InvalidFrameRateNum {
        actual: config.time_base.num,
        max: u32::MAX as u64,
      });
    }
    if config.time_base.den == 0 || config.time_base.den > u32::MAX as u64 {
      return Err(InvalidFrameRateDen {
        actual: config.time_base.den,
        max: u32::MAX as u64,
      });
    }

    if config.hierarchical_levels > MAX_HIERARCHICAL_LEVELS {
      return Err(InvalidHierarchicalLevels {
        actual: config.hierarchical_levels,
        max: MAX_HIERARCHICAL_LEVELS,
      });
    }
    if config.intra_period < -2 || config.intra_period > MAX_INTRA_PERIOD {
      return Err(InvalidIntraPeriod(config.intra_period));
    }
    if config.reference_count == 0 || config.reference_count > MAX_REFERENCES
    {
      return Err(InvalidReferenceCount {
        actual: config.reference_count,
        max: MAX_REFERENCES,
      });
    }

    let rc = &self.rate_control;

    if rc.min_qp_allowed > rc.max_qp_allowed || rc.max_qp_allowed > MAX_QP {
      return Err(InvalidQpRange {
        min: rc.min_qp_allowed,
        max: rc.max_qp_allowed,
      });
    }
    if rc.qp > MAX_QP {
      return Err(InvalidQp { actual: rc.qp, max: MAX_QP });
    }
    if rc.rate_control_mode != RateControlMode::ConstantQp {
      if rc.target_bit_rate == 0 {
        return Err(TargetBitrateNeeded);
      }
      if rc.vbv_size() == 0 {
        return Err(InvalidVbvBufferSize(rc.vbv_size()));
      }
    }

    Ok(())
  }
}
