// Copyright (c) 2017-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

// Safety lints
#![deny(bare_trait_objects)]
#![deny(clippy::as_ptr_cast_mut)]
#![deny(clippy::large_stack_arrays)]
// Performance lints
#![warn(clippy::inefficient_to_string)]
#![warn(clippy::invalid_upcast_comparisons)]
#![warn(clippy::needless_collect)]
#![warn(clippy::or_fun_call)]
#![warn(clippy::stable_sort_primitive)]
#![warn(clippy::suboptimal_flops)]
#![warn(clippy::trivially_copy_pass_by_ref)]
// Correctness lints
#![deny(clippy::copy_iterator)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::float_cmp)]
#![warn(clippy::imprecise_flops)]
#![deny(clippy::manual_instant_elapsed)]
#![deny(clippy::mem_forget)]
#![deny(clippy::path_buf_push_overwrite)]
// Clarity/formatting lints
#![warn(clippy::checked_conversions)]
#![warn(clippy::derive_partial_eq_without_eq)]
#![warn(clippy::explicit_deref_methods)]
#![warn(clippy::implicit_clone)]
#![warn(clippy::manual_let_else)]
#![warn(clippy::map_flatten)]
#![warn(clippy::match_bool)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::unused_self)]
// Documentation lints
#![warn(clippy::doc_markdown)]
#![warn(clippy::missing_errors_doc)]

#[macro_use]
extern crate log;

mod common;
mod error;
mod muxer;
mod simulate;
mod stats;

use crate::common::*;
use crate::error::*;
use crate::muxer::Muxer;
use crate::simulate::*;
use crate::stats::*;
use picsched::prelude::*;

use std::process::exit;

/// What one stream left behind.
struct ChannelReport {
  coded: Vec<CodedPicture>,
  outcome: Result<EncodeStats, EncoderStatus>,
}

fn write_pictures(
  output: &mut Option<Box<dyn Muxer>>, channel: usize,
  coded: &[CodedPicture],
) -> Result<(), CliError> {
  if let Some(output) = output.as_mut() {
    for picture in coded {
      output
        .write_picture(channel, picture)
        .map_err(|e| e.context("Cannot write the output file"))?;
    }
  }
  Ok(())
}

fn show_progress(
  verbose: Verboseness, progress: &mut ProgressInfo, coded: &[CodedPicture],
) {
  if verbose == Verboseness::Quiet {
    return;
  }
  for picture in coded {
    progress.add_picture(picture);
    if verbose == Verboseness::Verbose {
      info!("{} - {}", picture, progress);
    } else {
      // One-line progress indicator that overrides itself
      eprint!("\r{}                    ", progress);
    }
  }
}

/// Drives a single stream through the synchronous context.
fn run_context<T: Pixel>(
  cfg: Config, source: &Source, encoder: &mut SimulatedEncoder,
  output: &mut Option<Box<dyn Muxer>>, verbose: Verboseness,
) -> Result<EncodeStats, CliError> {
  let mut ctx: Context<T> =
    cfg.new_context().map_err(|e| e.context("Invalid scheduler settings"))?;
  let frame_rate = cfg.encoder_config().frame_rate();
  let mut progress = ProgressInfo::new(frame_rate, source.limit());

  for poc in 0..=source.limit() {
    if poc == source.limit() {
      ctx.flush();
    } else {
      let picture = ctx.new_picture();
      ctx
        .send_picture((picture, source.params(poc)))
        .map_err(|e| e.context("Failed to send a picture"))?;
    }
    let coded = ctx
      .encode_with(encoder)
      .map_err(|e| e.context("Failed to schedule the stream"))?;
    write_pictures(output, 0, &coded)?;
    show_progress(verbose, &mut progress, &coded);
  }

  Ok(ctx.stats())
}

/// Runs every channel on its own pipeline and collects what they coded.
fn run_channels<T: Pixel>(
  cfg: Config, channels: usize, source: &Source, encoder: &SimulatedEncoder,
) -> Result<Vec<ChannelReport>, CliError> {
  let mut endpoints = Vec::with_capacity(channels);
  for _ in 0..channels {
    endpoints.push(
      cfg
        .new_channel::<T, _>(encoder.clone())
        .map_err(|e| e.context("Invalid scheduler settings"))?,
    );
  }

  crossbeam::thread::scope(|s| {
    let handles: Vec<_> = endpoints
      .into_iter()
      .enumerate()
      .map(|(channel, (mut send, receive))| {
        s.spawn(move |_| {
          for poc in 0..source.limit() {
            let picture = send.new_picture();
            if send.send((picture, source.params(poc))).is_err() {
              debug!("channel {} stopped accepting pictures", channel);
              break;
            }
          }
          drop(send);
          let coded: Vec<CodedPicture> = receive.iter().collect();
          ChannelReport { coded, outcome: receive.finish() }
        })
      })
      .collect();
    handles.into_iter().map(|h| h.join()).collect::<Result<Vec<_>, _>>()
  })
  .and_then(|reports| reports)
  .map_err(|_| CliError::new("A channel thread panicked"))
}

fn do_schedule<T: Pixel>(cli: ParsedCliOptions) -> Result<(), CliError> {
  let ParsedCliOptions {
    mut output,
    config,
    limit,
    scene_cuts,
    qp_file,
    channels,
    verbose,
    fail_at,
    ..
  } = cli;
  let source = Source::new(limit, scene_cuts, qp_file);
  let mut encoder = SimulatedEncoder::new(config.encoder_config(), fail_at);
  let frame_rate = config.encoder_config().frame_rate();

  if let Some(output) = output.as_mut() {
    output
      .write_header()
      .map_err(|e| e.context("Cannot write the output file"))?;
  }

  if channels == 0 {
    let stats =
      run_context::<T>(config, &source, &mut encoder, &mut output, verbose)?;
    if let Some(output) = output.as_mut() {
      output.flush().map_err(|e| e.context("Cannot flush the output"))?;
    }
    if verbose != Verboseness::Quiet {
      if verbose == Verboseness::Normal {
        // Clear out the temporary progress indicator
        eprintln!();
      }
      print_summary(0, &stats, frame_rate);
    }
    return Ok(());
  }

  let reports = run_channels::<T>(config, channels, &source, &encoder)?;
  let mut failed = 0;
  for (channel, report) in reports.iter().enumerate() {
    write_pictures(&mut output, channel, &report.coded)?;
    match &report.outcome {
      Ok(stats) => {
        if verbose != Verboseness::Quiet {
          print_summary(channel, stats, frame_rate);
        }
      }
      Err(status) => {
        failed += 1;
        error!(
          "channel {} halted after {} pictures: {}",
          channel,
          report.coded.len(),
          status
        );
      }
    }
  }
  if let Some(output) = output.as_mut() {
    output.flush().map_err(|e| e.context("Cannot flush the output"))?;
  }

  if failed > 0 {
    return Err(CliError::new(&format!(
      "{} of {} channels failed",
      failed, channels
    )));
  }
  Ok(())
}

fn main() {
  init_logger();

  run().unwrap_or_else(|e| {
    error::print_error(&e);
    exit(1);
  });
}

fn init_logger() {
  use std::str::FromStr;
  fn level_colored(l: log::Level) -> console::StyledObject<&'static str> {
    use console::style;
    use log::Level;
    match l {
      Level::Trace => style("??").dim(),
      Level::Debug => style("? ").dim(),
      Level::Info => style("> ").green(),
      Level::Warn => style("! ").yellow(),
      Level::Error => style("!!").red(),
    }
  }

  let level = std::env::var("PICSCHED_LOG")
    .ok()
    .and_then(|l| log::LevelFilter::from_str(&l).ok())
    .unwrap_or(log::LevelFilter::Info);

  let dispatch = fern::Dispatch::new()
    .format(move |out, message, record| {
      out.finish(format_args!(
        "{level} {message}",
        level = level_colored(record.level()),
        message = message,
      ));
    })
    // keep the dependencies quiet
    .level(log::LevelFilter::Warn)
    .level_for("picsched", level)
    .chain(std::io::stderr())
    .apply();
  if let Err(e) = dispatch {
    eprintln!("Cannot install the logger: {}", e);
  }
}

fn run() -> Result<(), CliError> {
  let cli = parse_cli()?;

  if let Some(path) = cli.save_config.as_ref() {
    save_config(&cli.config, path)?;
  }

  let enc = cli.config.encoder_config();
  if cli.verbose != Verboseness::Quiet {
    info!(
      "Scheduling {} pictures of {}x{} @ {:.3} fps, {}-bit",
      cli.limit,
      enc.width,
      enc.height,
      enc.frame_rate(),
      enc.bit_depth
    );
    info!("Structure: {}", enc);
    let rc = cli.config.rate_control();
    info!(
      "Rate control: {:?}, qp {} in [{}, {}], {} kbps",
      rc.rate_control_mode,
      rc.qp,
      rc.min_qp_allowed,
      rc.max_qp_allowed,
      rc.target_bit_rate / 1000
    );
  }

  if enc.bit_depth == 8 {
    do_schedule::<u8>(cli)
  } else {
    do_schedule::<u16>(cli)
  }
}
