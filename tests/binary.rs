// Copyright (c) 2019-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

#[cfg(feature = "binaries")]
mod binary {
  use assert_cmd::Command;
  use rand::distributions::Alphanumeric;
  use rand::{thread_rng, Rng};
  use std::env::temp_dir;
  use std::fs;
  use std::path::PathBuf;

  fn get_tempfile_path(extension: &str) -> PathBuf {
    let mut path = temp_dir();
    let filename =
      thread_rng().sample_iter(&Alphanumeric).take(12).map(char::from);
    path.push(format!("{}.{}", filename.collect::<String>(), extension));
    path
  }

  #[cfg(not(windows))]
  fn get_picsched_command() -> Command {
    let mut cmd = Command::cargo_bin("picsched").unwrap();
    cmd.env_clear();
    cmd
  }

  #[cfg(windows)]
  // `env_clear` doesn't work on Windows: https://github.com/rust-lang/rust/issues/31259
  fn get_picsched_command() -> Command {
    Command::cargo_bin("picsched").unwrap()
  }

  fn get_common_cmd(outfile: &PathBuf) -> Command {
    let mut cmd = get_picsched_command();
    cmd.arg("--width").arg("64").arg("--height").arg("64");
    cmd.arg("-o").arg(outfile);
    cmd
  }

  /// Coded pictures of the trace, as (channel, poc, type).
  fn read_trace(path: &PathBuf) -> Vec<(usize, u64, String)> {
    fs::read_to_string(path)
      .unwrap()
      .lines()
      .filter(|line| !line.starts_with('#'))
      .map(|line| {
        let fields: Vec<&str> = line.split('\t').collect();
        let channel = fields[0].split(':').next().unwrap();
        (
          channel.parse().unwrap(),
          fields[1].parse().unwrap(),
          fields[3].to_owned(),
        )
      })
      .collect()
  }

  #[test]
  fn constant_qp() {
    let outfile = get_tempfile_path("txt");
    let mut cmd = get_common_cmd(&outfile);
    cmd.arg("--limit").arg("40").assert().success();

    assert_eq!(read_trace(&outfile).len(), 40);
  }

  #[test]
  fn coding_order() {
    let outfile = get_tempfile_path("txt");
    let mut cmd = get_common_cmd(&outfile);
    cmd
      .args(["--limit", "9", "--levels", "2", "--intra-period", "-1"])
      .assert()
      .success();

    let pocs: Vec<u64> =
      read_trace(&outfile).into_iter().map(|(_, poc, _)| poc).collect();
    assert_eq!(pocs, vec![0, 3, 1, 2, 7, 5, 4, 6, 8]);
  }

  #[test]
  fn scene_cuts_are_idr() {
    let outfile = get_tempfile_path("txt");
    let mut cmd = get_common_cmd(&outfile);
    cmd
      .args(["--limit", "30", "--intra-period", "-1", "--scene-cuts", "7,20"])
      .assert()
      .success();

    let mut idr: Vec<u64> = read_trace(&outfile)
      .into_iter()
      .filter(|(_, _, kind)| kind == "IDR")
      .map(|(_, poc, _)| poc)
      .collect();
    idr.sort_unstable();
    assert_eq!(idr, vec![0, 7, 20]);
  }

  #[test]
  fn bitrate_based() {
    let outfile = get_tempfile_path("txt");
    let mut cmd = get_common_cmd(&outfile);
    cmd
      .args(["--limit", "60", "--rc-mode", "cbr", "--bitrate", "300"])
      .assert()
      .success();
  }

  #[test]
  fn bitrate_mode_needs_a_bitrate() {
    let outfile = get_tempfile_path("txt");
    let mut cmd = get_common_cmd(&outfile);
    cmd.args(["--limit", "10", "--rc-mode", "vbr"]).assert().failure();
  }

  #[test]
  fn qp_file() {
    let outfile = get_tempfile_path("txt");
    let qpfile = get_tempfile_path("qp");
    fs::write(&qpfile, "# forced\n20\n-1\n45\n").unwrap();

    let mut cmd = get_common_cmd(&outfile);
    cmd
      .args(["--limit", "5", "--levels", "0", "--pred-structure", "ldp"])
      .arg("--qp-file")
      .arg(&qpfile)
      .assert()
      .success();

    let trace = fs::read_to_string(&outfile).unwrap();
    let qps: Vec<&str> = trace
      .lines()
      .filter(|line| !line.starts_with('#'))
      .map(|line| line.split('\t').nth(5).unwrap())
      .collect();
    assert_eq!(qps, vec!["20", "32", "45", "32", "32"]);
  }

  #[test]
  fn channels() {
    let outfile = get_tempfile_path("txt");
    let mut cmd = get_common_cmd(&outfile);
    cmd
      .args(["--limit", "50", "--channels", "3", "--threads", "2"])
      .assert()
      .success();

    let trace = read_trace(&outfile);
    for channel in 0..3 {
      assert_eq!(trace.iter().filter(|(c, _, _)| *c == channel).count(), 50);
    }
  }

  #[test]
  fn failing_channel_halts() {
    let outfile = get_tempfile_path("txt");
    let mut cmd = get_common_cmd(&outfile);
    cmd
      .args(["--limit", "50", "--channels", "2", "--fail-at", "12"])
      .assert()
      .failure()
      .code(1);
  }

  #[test]
  fn config_roundtrip() {
    let outfile = get_tempfile_path("txt");
    let config = get_tempfile_path("toml");

    let mut cmd1 = get_common_cmd(&outfile);
    cmd1
      .args(["--limit", "20", "--levels", "1", "--pred-structure", "ldb"])
      .arg("--save-config")
      .arg(&config)
      .assert()
      .success();
    let first = fs::read_to_string(&outfile).unwrap();

    let mut cmd2 = get_common_cmd(&outfile);
    cmd2.args(["--limit", "20"]).arg("--config").arg(&config);
    cmd2.assert().success();

    assert_eq!(fs::read_to_string(&outfile).unwrap(), first);
  }

  #[test]
  fn completion() {
    let mut cmd = get_picsched_command();
    cmd.args(["--generate-completion", "bash"]).assert().success();
  }
}
