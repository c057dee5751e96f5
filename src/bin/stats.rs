// Copyright (c) 2018-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use picsched::prelude::*;
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct ProgressInfo {
  // Frame rate of the video
  frame_rate: f64,
  // The length of the whole stream, in pictures
  total_pictures: u64,
  // The time the run was started
  time_started: Instant,
  pictures_coded: u64,
  // Stream size so far in bytes
  coded_size: u64,
}

impl ProgressInfo {
  pub fn new(frame_rate: f64, total_pictures: u64) -> Self {
    Self {
      frame_rate,
      total_pictures,
      time_started: Instant::now(),
      pictures_coded: 0,
      coded_size: 0,
    }
  }

  pub fn add_picture(&mut self, picture: &CodedPicture) {
    self.pictures_coded += 1;
    self.coded_size += picture.byte_count as u64;
  }

  pub fn scheduling_fps(&self) -> f64 {
    let duration = Instant::now().duration_since(self.time_started);
    self.pictures_coded as f64 / duration.as_secs_f64().max(1e-6)
  }

  // Returns the bitrate of the pictures so far, in bits/second
  pub fn bitrate(&self) -> u64 {
    if self.pictures_coded == 0 {
      return 0;
    }
    let seconds = self.pictures_coded as f64 / self.frame_rate;
    (self.coded_size as f64 * 8. / seconds) as u64
  }

  // Estimates the final size in bytes
  pub fn estimated_size(&self) -> u64 {
    if self.pictures_coded == 0 {
      return 0;
    }
    self.coded_size * self.total_pictures / self.pictures_coded
  }
}

impl fmt::Display for ProgressInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "scheduled {}/{} pictures, {:.3} fps, {:.2} Kb/s, est. size: {:.2} MB",
      self.pictures_coded,
      self.total_pictures,
      self.scheduling_fps(),
      self.bitrate() as f64 / 1000f64,
      self.estimated_size() as f64 / (1024 * 1024) as f64,
    )
  }
}

pub fn print_summary(channel: usize, stats: &EncodeStats, frame_rate: f64) {
  let total = stats.total();
  info!(
    "channel {}: {} pictures, {:.2} Kb/s, avg qp {:.2}",
    channel,
    total.count,
    stats.bitrate(frame_rate) as f64 / 1000f64,
    total.avg_qp()
  );
  info!("----------");
  for picture_type in PictureType::ALL {
    let totals = stats.get(picture_type);
    if totals.count > 0 {
      print_totals(&format!("{}:", picture_type), totals);
    }
  }
  for (layer, totals) in stats.by_layer.iter() {
    print_totals(&format!("Layer {}:", layer), totals);
  }
  info!("----------");
  let rf = &stats.reference;
  info!(
    "references: {} admitted, {} released, {} forced, peak {}",
    rf.admitted, rf.released, rf.forced, rf.peak
  );
  if rf.amended + rf.truncated > 0 {
    info!(
      "dependents retracted: {} amended, {} at end of stream",
      rf.amended, rf.truncated
    );
  }
  info!(
    "buffers: {} acquired, {} returned, peak {}",
    stats.pool.acquired, stats.pool.returned, stats.pool.peak
  );
  if stats.stale_intervals > 0 {
    warn!("{} rate control intervals closed early", stats.stale_intervals);
  }
}

fn print_totals(label: &str, totals: &PictureTotals) {
  info!(
    "{:23} {:>6}    avg size: {:>7.0} B    avg qp: {:>5.2}",
    label,
    totals.count,
    totals.avg_size(),
    totals.avg_qp()
  );
}
