// 该文件是 Qingyan （清眼） 项目的一部分。
// src/model/decoder.rs - 检测输出解码与非极大值抑制
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

use std::cmp::Ordering;
use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::{Tensor, TensorMap};
use crate::model::{ConfigError, DetectionResult, ModelDescriptor};

const BOX_CORNERS: usize = 4;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.2;

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("张量 {name} 形状无效: {reason}")]
  Shape { name: String, reason: String },
  #[error("张量 {name} 数据长度 {actual} 与形状声明 {declared} 不符")]
  Length {
    name: String,
    declared: usize,
    actual: usize,
  },
}

/// 多个类别得分相同时的取舍
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
  /// 从左到右扫描，保留第一个最大值
  #[default]
  FirstIndex,
  LastIndex,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderConfig {
  pub iou_threshold: f32,
  pub tie_break: TieBreak,
}

impl Default for DecoderConfig {
  fn default() -> Self {
    Self {
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      tie_break: TieBreak::FirstIndex,
    }
  }
}

/// 检测解码器
#[derive(Debug, Clone, Default)]
pub struct DetectionDecoder {
  config: DecoderConfig,
}

/// 检查张量的数据长度，返回 (行数, 每行元素数)
fn rows(name: &str, tensor: &Tensor, row_len: Option<usize>) -> Result<(usize, usize), DecodeError> {
  let declared = tensor.declared_len().ok_or_else(|| DecodeError::Shape {
    name: name.to_string(),
    reason: format!("形状 {:?} 元素个数溢出", tensor.shape),
  })?;
  if tensor.data.len() != declared {
    return Err(DecodeError::Length {
      name: name.to_string(),
      declared,
      actual: tensor.data.len(),
    });
  }
  let last = *tensor.shape.last().ok_or_else(|| DecodeError::Shape {
    name: name.to_string(),
    reason: "形状为空".to_string(),
  })?;
  if let Some(expected) = row_len
    && last != expected
  {
    return Err(DecodeError::Shape {
      name: name.to_string(),
      reason: format!("最后一维应为 {}, 实际为 {}", expected, last),
    });
  }
  if last == 0 {
    return Err(DecodeError::Shape {
      name: name.to_string(),
      reason: "最后一维为 0".to_string(),
    });
  }
  Ok((declared / last, last))
}

impl DetectionDecoder {
  pub fn new(config: DecoderConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &DecoderConfig {
    &self.config
  }

  /// 从引擎输出中按描述的层名取出框与类别张量并解码
  ///
  /// 缺少任一输出张量时返回空结果并记录警告。
  pub fn decode_outputs(
    &self,
    outputs: &TensorMap,
    threshold: f32,
    source_size: (u32, u32),
    input_size: (u32, u32),
    descriptor: &ModelDescriptor,
  ) -> Result<Vec<DetectionResult>, DecodeError> {
    let group = descriptor.layer_group()?;
    let (Some(boxes), Some(classes)) = (outputs.get(group.boxes), outputs.get(group.classes))
    else {
      warn!(
        "缺少输出张量: {} / {}, 可用输出: {:?}",
        group.boxes,
        group.classes,
        outputs.keys().collect::<Vec<_>>()
      );
      return Ok(Vec::new());
    };
    self.decode(boxes, classes, threshold, source_size, input_size, descriptor)
  }

  /// 解码框与类别得分，按置信度过滤后做按类别的非极大值抑制
  pub fn decode(
    &self,
    boxes: &Tensor,
    classes: &Tensor,
    threshold: f32,
    source_size: (u32, u32),
    input_size: (u32, u32),
    descriptor: &ModelDescriptor,
  ) -> Result<Vec<DetectionResult>, DecodeError> {
    let labels = descriptor.label_table()?;
    let (num_detections, _) = rows("boxes", boxes, Some(BOX_CORNERS))?;
    let (class_rows, num_classes) = rows("classes", classes, None)?;
    if class_rows != num_detections {
      return Err(DecodeError::Shape {
        name: "classes".to_string(),
        reason: format!("行数 {} 与框数量 {} 不符", class_rows, num_detections),
      });
    }
    if input_size.0 == 0 || input_size.1 == 0 {
      return Err(DecodeError::Shape {
        name: "input".to_string(),
        reason: format!("模型输入尺寸无效: {}x{}", input_size.0, input_size.1),
      });
    }

    let scale_x = source_size.0 as f32 / input_size.0 as f32;
    let scale_y = source_size.1 as f32 / input_size.1 as f32;

    let mut candidates = Vec::new();
    for (raw, scores) in boxes
      .data
      .chunks_exact(BOX_CORNERS)
      .zip(classes.data.chunks_exact(num_classes))
    {
      let (class_id, score) = self.best_class(scores);
      if score < threshold {
        continue;
      }
      let Ok(raw) = <&[f32; BOX_CORNERS]>::try_from(raw) else {
        continue;
      };
      let bounding_box = descriptor.rect_format.decode(raw).scale(scale_x, scale_y);
      candidates.push(DetectionResult {
        class_id,
        label: labels.label(class_id).to_string(),
        confidence: score,
        bounding_box,
      });
    }

    debug!("阈值 {} 过滤后候选数: {}", threshold, candidates.len());
    let kept = non_max_suppression(candidates, self.config.iou_threshold);
    debug!("非极大值抑制后保留: {}", kept.len());
    Ok(kept)
  }

  fn best_class(&self, scores: &[f32]) -> (usize, f32) {
    let mut best = (0usize, f32::NEG_INFINITY);
    for (idx, &score) in scores.iter().enumerate() {
      let better = match self.config.tie_break {
        TieBreak::FirstIndex => score > best.1,
        TieBreak::LastIndex => score >= best.1,
      };
      if better {
        best = (idx, score);
      }
    }
    best
  }
}

/// 按类别分组的贪心非极大值抑制
///
/// 每组内按置信度降序保留，丢弃与已保留框交并比超过阈值的框；不同类别互不抑制。
pub fn non_max_suppression(
  detections: Vec<DetectionResult>,
  iou_threshold: f32,
) -> Vec<DetectionResult> {
  let mut groups: BTreeMap<String, Vec<DetectionResult>> = BTreeMap::new();
  for det in detections {
    groups.entry(det.label.clone()).or_default().push(det);
  }

  let mut kept = Vec::new();
  for (_, mut pending) in groups {
    pending.sort_by(|a, b| {
      b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
    });
    while !pending.is_empty() {
      let best = pending.remove(0);
      pending.retain(|det| best.bounding_box.iou(&det.bounding_box) <= iou_threshold);
      kept.push(best);
    }
  }
  kept
}
