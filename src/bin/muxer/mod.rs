// Copyright (c) 2017-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

mod trace;
pub use self::trace::TraceMuxer;

use crate::error::*;
use picsched::CodedPicture;

use std::fs::File;
use std::io;
use std::path::Path;

pub trait Muxer: Send {
  fn write_header(&mut self) -> io::Result<()>;

  fn write_picture(
    &mut self, channel: usize, picture: &CodedPicture,
  ) -> io::Result<()>;

  fn flush(&mut self) -> io::Result<()>;
}

pub fn open_output(path: &Path) -> Result<Box<dyn Muxer>, CliError> {
  if path.as_os_str() == "-" {
    return Ok(Box::new(TraceMuxer::new(Box::new(io::stdout()))));
  }
  let file =
    File::create(path).map_err(|e| e.context("Cannot open output file"))?;
  Ok(Box::new(TraceMuxer::new(Box::new(file))))
}
