// Copyright (c) 2018-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use picsched::prelude::*;

/// Per-picture parameters of the simulated input stream.
#[derive(Debug, Clone, Default)]
pub struct Source {
  limit: u64,
  scene_cuts: Vec<u64>,
  qp_file: Option<QpFile>,
}

impl Source {
  pub fn new(
    limit: u64, scene_cuts: Vec<u64>, qp_file: Option<QpFile>,
  ) -> Self {
    Source { limit, scene_cuts, qp_file }
  }

  pub const fn limit(&self) -> u64 {
    self.limit
  }

  pub fn params(&self, poc: u64) -> PictureParameters {
    PictureParameters {
      pts: Some(poc),
      qp: self.qp_file.as_ref().and_then(|qps| qps.qp(poc)),
      scene_cut: self.scene_cuts.contains(&poc),
      opaque: None,
    }
  }
}

/// Stand-in for the encode stages.
///
/// The byte count follows the usual rule of thumb of halving every 6
/// quantizer steps, scaled by how expensive each kind of picture is.
#[derive(Debug, Clone)]
pub struct SimulatedEncoder {
  // Bytes of an average P picture at quantizer 32.
  base_bytes: f64,
  fail_at: Option<u64>,
}

impl SimulatedEncoder {
  pub fn new(enc: &EncoderConfig, fail_at: Option<u64>) -> Self {
    let pixels = (enc.width * enc.height) as f64;
    SimulatedEncoder { base_bytes: pixels / 40., fail_at }
  }

  fn byte_count(&self, d: &PictureDescriptor, qp: u8) -> usize {
    let cost = match d.picture_type {
      PictureType::IDR | PictureType::I => 5.,
      PictureType::P => 1.,
      PictureType::B => 0.8,
      PictureType::NON_REF => 0.5,
    };
    let scale = 2f64.powf((32. - qp as f64) / 6.);
    (self.base_bytes * cost * scale).round().max(1.) as usize
  }
}

fn copy_planes<T: Pixel>(dst: &mut Frame<T>, src: &Frame<T>) {
  for (dst, src) in dst.planes.iter_mut().zip(src.planes.iter()) {
    let width = src.cfg.width;
    let (dst_stride, src_stride) = (dst.cfg.stride, src.cfg.stride);
    for (dst_row, src_row) in dst
      .data_origin_mut()
      .chunks_mut(dst_stride)
      .zip(src.data_origin().chunks(src_stride))
      .take(src.cfg.height)
    {
      dst_row[..width].copy_from_slice(&src_row[..width]);
    }
  }
}

impl<T: Pixel> PictureEncoder<T> for SimulatedEncoder {
  fn encode(
    &mut self, job: &EncodeJob<T>,
  ) -> Result<PictureFeedback, EncodeError> {
    let d = &job.descriptor;
    if self.fail_at == Some(d.poc) {
      let msg = format!("simulated failure on picture {}", d.poc);
      return Err(EncodeError(msg));
    }
    if let Some(rec) = &job.reconstruction {
      copy_planes(&mut rec.write(), &job.source);
    }
    Ok(job.feedback(self.byte_count(d, job.qp), job.qp))
  }
}
