// 该文件是 Qingyan （清眼） 项目的一部分。
// src/bin/simple_oneshot.rs - 单帧检测
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use url::Url;

use qingyan::{
  FromUrl,
  convert::ConvertPath,
  detector::Detector,
  engine::{ReplayEngine, Runtime},
  model::{DEFAULT_IOU_THRESHOLD, DecoderConfig, ModelDescriptor, TieBreak},
  normalize::{DEFAULT_BLACK_THRESHOLD, NormalizeConfig},
  pipeline::{DEFAULT_CONFIDENCE_THRESHOLD, WorkerConfig},
  task::{OneShotTask, Task},
};
use tracing::info;

/// 清眼单帧检测参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型描述，例如 model:///models/yolo.dlc?catalog=YOLO-NAS
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 引擎输出录制文件 (JSON)
  #[arg(long, value_name = "RECORDING")]
  pub recording: PathBuf,
  /// 运行时: C (CPU), G (GPU), D (DSP)
  #[arg(long, default_value_t = 'C')]
  pub runtime: char,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 置信度阈值
  #[arg(long, default_value_t = DEFAULT_CONFIDENCE_THRESHOLD)]
  pub threshold: f32,
  /// NMS IoU 阈值
  #[arg(long, default_value_t = DEFAULT_IOU_THRESHOLD)]
  pub iou: f32,
  /// 过暗帧判定阈值（平均蓝色通道）
  #[arg(long, default_value_t = DEFAULT_BLACK_THRESHOLD)]
  pub black_threshold: u32,
  /// 同分时取最后一个类别
  #[arg(long)]
  pub last_index: bool,
  /// 经 JPEG 编解码转换，参数为质量
  #[arg(long, value_name = "QUALITY")]
  pub jpeg_quality: Option<u8>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let descriptor = ModelDescriptor::from_url(&args.model)?;
  let runtime = Runtime::from_code(args.runtime);
  let input = qingyan::input::InputWrapper::from_url(&args.input)?;
  let output = qingyan::output::OutputWrapper::from_url(&args.output)?;

  let engine = ReplayEngine::from_path(&args.recording)?;
  let mut detector = Detector::with_config(
    engine,
    NormalizeConfig {
      black_threshold: args.black_threshold,
      ..Default::default()
    },
    DecoderConfig {
      iou_threshold: args.iou,
      tie_break: if args.last_index {
        TieBreak::LastIndex
      } else {
        TieBreak::FirstIndex
      },
    },
  );
  detector.load_model(runtime, &descriptor)?;

  let config = WorkerConfig {
    threshold: args.threshold,
    convert: match args.jpeg_quality {
      Some(quality) => ConvertPath::JpegRoundTrip { quality },
      None => ConvertPath::Direct,
    },
    keep_preview: false,
  };
  OneShotTask::default()
    .with_config(config)
    .run_task(input, detector, output)?;

  Ok(())
}
