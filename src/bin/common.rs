// Copyright (c) 2017-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::error::*;
use crate::muxer::*;
use picsched::prelude::*;

use clap::{CommandFactory, Parser as Clap};
use clap_complete::{generate, Shell};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Clap)]
#[clap(
  name = "picsched",
  version = env!("CARGO_PKG_VERSION"),
  about = "Picture-level scheduler for hierarchical video encoders",
  long_about = None
)]
pub struct CliOptions {
  /// Write the coded pictures, one line each, to this file (- for stdout)
  #[clap(long, short, value_parser, help_heading = "OUTPUT")]
  pub output: Option<PathBuf>,
  /// Number of pictures to schedule
  #[clap(
    long,
    short,
    value_parser,
    default_value_t = 100,
    help_heading = "INPUT"
  )]
  pub limit: u64,
  /// Picture width
  #[clap(long, value_parser, default_value_t = 640, help_heading = "INPUT")]
  pub width: usize,
  /// Picture height
  #[clap(long, value_parser, default_value_t = 480, help_heading = "INPUT")]
  pub height: usize,
  /// Frame rate, as num/den or a plain number
  #[clap(long, value_parser, default_value = "30", help_heading = "INPUT")]
  pub frame_rate: String,
  /// Pictures starting a new scene, comma separated
  #[clap(
    long,
    value_parser,
    value_delimiter = ',',
    help_heading = "INPUT"
  )]
  pub scene_cuts: Vec<u64>,

  /// Speed level (0 is best quality, 10 is fastest)
  /// Speeds 10 and 0 are extremes and are generally not recommended
  #[clap(
    long,
    short,
    value_parser = clap::value_parser!(u8).range(0..=10),
    default_value_t = 6,
    help_heading = "STRUCTURE"
  )]
  pub speed: u8,
  /// Depth of the temporal hierarchy [default: from the speed]
  #[clap(
    long,
    value_parser = clap::value_parser!(u8).range(0..=5),
    help_heading = "STRUCTURE"
  )]
  pub levels: Option<u8>,
  /// Prediction structure
  #[clap(
    long,
    value_parser = parse_pred_structure,
    default_value = "RandomAccess",
    help_heading = "STRUCTURE"
  )]
  pub pred_structure: PredStructure,
  /// Pictures between intra refreshes, -1 for the first picture only and
  /// -2 for about one second
  #[clap(
    long,
    short = 'i',
    value_parser,
    allow_hyphen_values = true,
    default_value_t = -2,
    help_heading = "STRUCTURE"
  )]
  pub intra_period: i64,
  /// Use open intra refreshes instead of IDR pictures
  #[clap(long, help_heading = "STRUCTURE")]
  pub open_gop: bool,
  /// Maximum number of references per list [default: from the speed]
  #[clap(
    long,
    value_parser = clap::value_parser!(u8).range(1..=4),
    help_heading = "STRUCTURE"
  )]
  pub reference_count: Option<u8>,

  /// Quantizer selection mode
  #[clap(
    long,
    value_parser = parse_rate_control_mode,
    default_value = "ConstantQp",
    help_heading = "RATE CONTROL"
  )]
  pub rc_mode: RateControlMode,
  /// Quantizer (0-63), the starting point in bit rate modes
  #[clap(
    long,
    value_parser = clap::value_parser!(u8).range(0..=63),
    default_value_t = 32,
    help_heading = "RATE CONTROL"
  )]
  pub quantizer: u8,
  /// Minimum quantizer (0-63) to use in bit rate modes
  #[clap(
    long,
    value_parser = clap::value_parser!(u8).range(0..=63),
    default_value_t = 1,
    help_heading = "RATE CONTROL"
  )]
  pub min_quantizer: u8,
  /// Maximum quantizer (0-63) to use in bit rate modes
  #[clap(
    long,
    value_parser = clap::value_parser!(u8).range(0..=63),
    default_value_t = 63,
    help_heading = "RATE CONTROL"
  )]
  pub max_quantizer: u8,
  /// Bit rate (kbps)
  #[clap(long, short, value_parser, help_heading = "RATE CONTROL")]
  pub bitrate: Option<u64>,
  /// VBV buffer size (kbit) [default: one second at the bit rate]
  #[clap(long, value_parser, help_heading = "RATE CONTROL")]
  pub vbv_size: Option<u64>,
  /// Per-picture quantizers, one line each in display order
  #[clap(long, value_parser, help_heading = "RATE CONTROL")]
  pub qp_file: Option<PathBuf>,

  /// Number of independent channels to run, 0 drives a single stream
  /// synchronously
  #[clap(long, value_parser, default_value_t = 0, help_heading = "THREADING")]
  pub channels: usize,
  /// Downstream workers per channel [default: one per core]
  #[clap(long, value_parser, default_value_t = 0, help_heading = "THREADING")]
  pub threads: usize,

  /// Load the structure and rate control settings from a TOML file
  #[clap(long, short, value_parser, help_heading = "CONFIGURATION")]
  pub config: Option<PathBuf>,
  /// Save the settings in use to a TOML file
  #[clap(long, value_parser, help_heading = "CONFIGURATION")]
  pub save_config: Option<PathBuf>,

  /// Verbose logging; outputs info for every picture
  #[clap(long, short, help_heading = "DEBUGGING")]
  pub verbose: bool,
  /// Do not output any status message
  #[clap(long, short, conflicts_with = "verbose", help_heading = "DEBUGGING")]
  pub quiet: bool,
  /// Make the simulated encoder fail on this picture
  #[clap(long, value_parser, hide = true, help_heading = "DEBUGGING")]
  pub fail_at: Option<u64>,
  /// Generate a completion script for the given shell
  #[clap(long, value_parser, help_heading = "DEBUGGING")]
  pub generate_completion: Option<Shell>,
}

fn parse_pred_structure(s: &str) -> Result<PredStructure, String> {
  s.parse().map_err(|_| {
    format!("expected one of {}", PredStructure::variants().join(", "))
  })
}

fn parse_rate_control_mode(s: &str) -> Result<RateControlMode, String> {
  s.parse().map_err(|_| {
    format!("expected one of {}", RateControlMode::variants().join(", "))
  })
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Verboseness {
  Quiet,
  Normal,
  Verbose,
}

pub struct ParsedCliOptions {
  pub output: Option<Box<dyn Muxer>>,
  pub config: Config,
  pub limit: u64,
  pub scene_cuts: Vec<u64>,
  pub qp_file: Option<QpFile>,
  pub channels: usize,
  pub verbose: Verboseness,
  pub fail_at: Option<u64>,
  pub save_config: Option<PathBuf>,
}

/// Settings stored by `--save-config` and read back by `--config`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ConfigFile {
  pub encoder: EncoderConfig,
  pub rate_control: RateControlConfig,
}

pub fn parse_cli() -> Result<ParsedCliOptions, CliError> {
  let matches = CliOptions::parse();

  if let Some(shell) = matches.generate_completion {
    let mut app = CliOptions::command();
    let app_name = app.get_name().to_string();
    generate(shell, &mut app, app_name, &mut io::stdout());
    std::process::exit(0);
  }

  let verbose = if matches.quiet {
    Verboseness::Quiet
  } else if matches.verbose {
    Verboseness::Verbose
  } else {
    Verboseness::Normal
  };

  let output = match matches.output.as_ref() {
    Some(path) => Some(open_output(path)?),
    None => None,
  };

  let qp_file = match matches.qp_file.as_ref() {
    Some(path) => {
      let text = std::fs::read_to_string(path)
        .map_err(|e| e.context("Cannot read the QP file"))?;
      Some(QpFile::parse(&text).map_err(|e| e.context("Invalid QP file"))?)
    }
    None => None,
  };

  let config = parse_config(&matches, qp_file.is_some())?;

  Ok(ParsedCliOptions {
    output,
    config,
    limit: matches.limit,
    scene_cuts: matches.scene_cuts,
    qp_file,
    channels: matches.channels,
    verbose,
    fail_at: matches.fail_at,
    save_config: matches.save_config,
  })
}

fn parse_frame_rate(s: &str) -> Result<Rational, CliError> {
  let (num, den) = match s.split_once('/') {
    Some((num, den)) => (num, den),
    None => (s, "1"),
  };
  let num: u64 = num.trim().parse::<u64>().map_err(|e| e.context("frame-rate"))?;
  let den: u64 = den.trim().parse::<u64>().map_err(|e| e.context("frame-rate"))?;
  if num == 0 || den == 0 {
    return Err(CliError::new("The frame rate must be positive"));
  }
  Ok(Rational::new(den, num))
}

fn parse_config(
  matches: &CliOptions, use_qp_file: bool,
) -> Result<Config, CliError> {
  if let Some(path) = matches.config.as_ref() {
    let text = std::fs::read_to_string(path)
      .map_err(|e| e.context("Cannot open the configuration file"))?;
    let file: ConfigFile = toml::from_str(&text)
      .map_err(|e| e.context("Cannot parse the configuration file"))?;
    let mut rc = file.rate_control;
    rc.use_qp_file |= use_qp_file;
    return Ok(
      Config::new()
        .with_encoder_config(file.encoder)
        .with_rate_control(rc)
        .with_threads(matches.threads),
    );
  }

  let mut enc = EncoderConfig::with_speed_preset(matches.speed as usize);
  enc.width = matches.width;
  enc.height = matches.height;
  enc.time_base = parse_frame_rate(&matches.frame_rate)?;
  enc.pred_structure = matches.pred_structure;
  enc.intra_period = matches.intra_period;
  if matches.open_gop {
    enc.intra_refresh = IntraRefresh::Open;
  }
  if let Some(levels) = matches.levels {
    enc.hierarchical_levels = levels;
  }
  if let Some(count) = matches.reference_count {
    enc.reference_count = count as usize;
  }

  let mut rc = RateControlConfig::new()
    .with_qp(matches.quantizer)
    .with_qp_range(matches.min_quantizer, matches.max_quantizer)
    .with_qp_file(use_qp_file);
  if matches.rc_mode != RateControlMode::ConstantQp {
    let bitrate = matches.bitrate.ok_or_else(|| {
      CliError::new("A bit rate is needed outside of constant-QP mode")
    })?;
    rc = rc.with_bitrate(matches.rc_mode, bitrate * 1000);
    if let Some(size) = matches.vbv_size {
      rc = rc.with_vbv(bitrate * 1000, size * 1000);
    }
  }

  Ok(
    Config::new()
      .with_encoder_config(enc)
      .with_rate_control(rc)
      .with_threads(matches.threads),
  )
}

/// Writes the settings in use to `path`.
pub fn save_config(config: &Config, path: &Path) -> Result<(), CliError> {
  let file = ConfigFile {
    encoder: *config.encoder_config(),
    rate_control: *config.rate_control(),
  };
  let text = toml::to_string(&file)
    .map_err(|e| e.context("Cannot serialize the configuration"))?;
  let mut out = File::create(path)
    .map_err(|e| e.context("Cannot create configuration file"))?;
  out
    .write_all(text.as_bytes())
    .map_err(|e| e.context("Cannot write the configuration file"))
}
