// Copyright (c) 2017-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use super::Muxer;
use picsched::prelude::*;

use std::io;
use std::io::Write;

/// One tab separated line per coded picture, in coding order.
pub struct TraceMuxer {
  output: io::BufWriter<Box<dyn Write + Send>>,
}

impl TraceMuxer {
  pub fn new(output: Box<dyn Write + Send>) -> Self {
    TraceMuxer { output: io::BufWriter::new(output) }
  }
}

fn join(pocs: &[u64]) -> String {
  if pocs.is_empty() {
    return "-".to_owned();
  }
  pocs.iter().map(u64::to_string).collect::<Vec<_>>().join(",")
}

fn short_name(picture_type: PictureType) -> &'static str {
  match picture_type {
    PictureType::IDR => "IDR",
    PictureType::I => "I",
    PictureType::P => "P",
    PictureType::B => "B",
    PictureType::NON_REF => "b",
  }
}

impl Muxer for TraceMuxer {
  fn write_header(&mut self) -> io::Result<()> {
    writeln!(
      self.output,
      "# channel:id\tpoc\tpts\ttype\tlayer\tqp\tbytes\tlist0\tlist1"
    )
  }

  fn write_picture(
    &mut self, channel: usize, picture: &CodedPicture,
  ) -> io::Result<()> {
    writeln!(
      self.output,
      "{}:{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
      channel,
      picture.id,
      picture.poc,
      picture.pts,
      short_name(picture.picture_type),
      picture.temporal_layer,
      picture.qp,
      picture.byte_count,
      join(&picture.list0),
      join(&picture.list1)
    )
  }

  fn flush(&mut self) -> io::Result<()> {
    self.output.flush()
  }
}
