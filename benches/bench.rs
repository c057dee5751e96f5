// Copyright (c) 2017-2025, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use criterion::*;
use picsched::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;

use std::sync::Arc;

const PICTURES: u64 = 256;

/// Reports a fixed size without touching the samples.
#[derive(Clone)]
struct NullEncoder;

impl PictureEncoder<u8> for NullEncoder {
  fn encode(
    &mut self, job: &EncodeJob<u8>,
  ) -> Result<PictureFeedback, EncodeError> {
    Ok(job.feedback(1000, job.qp))
  }
}

fn setup_config(levels: u8, rc: RateControlConfig) -> Config {
  let mut enc = EncoderConfig::with_speed_preset(6);
  enc.width = 64;
  enc.height = 64;
  enc.hierarchical_levels = levels;
  enc.intra_period = 63;
  Config::new().with_encoder_config(enc).with_rate_control(rc)
}

fn scene_cuts(ra: &mut ChaChaRng) -> Vec<bool> {
  (0..PICTURES).map(|_| ra.gen_ratio(1, 40)).collect()
}

fn schedule_stream(cfg: &Config, cuts: &[bool]) -> usize {
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let picture = Arc::new(ctx.new_picture());
  let mut encoder = NullEncoder;
  let mut coded = 0;
  for &scene_cut in cuts {
    let params = PictureParameters { scene_cut, ..Default::default() };
    ctx.send_picture((picture.clone(), params)).unwrap();
    coded += ctx.encode_with(&mut encoder).unwrap().len();
  }
  ctx.flush();
  coded += ctx.encode_with(&mut encoder).unwrap().len();
  coded
}

fn bench_schedule(c: &mut Criterion) {
  let mut ra = ChaChaRng::from_seed([0; 32]);
  let cuts = scene_cuts(&mut ra);
  let mut group = c.benchmark_group("schedule");
  group.throughput(Throughput::Elements(PICTURES));
  for levels in [0u8, 2, 3, 5] {
    let cfg = setup_config(levels, RateControlConfig::new());
    group.bench_with_input(
      BenchmarkId::new("cqp", levels),
      &cfg,
      |b, cfg| b.iter(|| schedule_stream(cfg, &cuts)),
    );
    let cfg = setup_config(
      levels,
      RateControlConfig::new().with_bitrate(RateControlMode::Cbr, 500_000),
    );
    group.bench_with_input(
      BenchmarkId::new("cbr", levels),
      &cfg,
      |b, cfg| b.iter(|| schedule_stream(cfg, &cuts)),
    );
  }
  group.finish();
}

fn bench_channel(c: &mut Criterion) {
  let cfg = setup_config(3, RateControlConfig::new()).with_threads(2);
  c.bench_function("channel", |b| {
    b.iter(|| {
      let (mut send, receive) = cfg.new_channel::<u8, _>(NullEncoder).unwrap();
      let picture = Arc::new(send.new_picture());
      let producer = std::thread::spawn(move || {
        for _ in 0..PICTURES {
          send.send(picture.clone()).unwrap();
        }
      });
      let coded = receive.iter().count();
      producer.join().unwrap();
      receive.finish().unwrap();
      coded
    })
  });
}

criterion_group!(scheduling, bench_schedule, bench_channel);
criterion_main!(scheduling);
