// 该文件是 Qingyan （清眼） 项目的一部分。
// src/model/catalog.rs - 模型目录、输出层分组与类别表
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

use crate::model::{ConfigError, ModelDescriptor, RectFormat, UNKNOWN_LABEL};

/// 一组输入/输出层名
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerGroup {
  pub input: &'static str,
  pub boxes: &'static str,
  pub classes: &'static str,
}

impl LayerGroup {
  pub fn output_layers(&self) -> [&'static str; 2] {
    [self.boxes, self.classes]
  }
}

/// 类别序号到名称的映射
#[derive(Debug, PartialEq, Eq)]
pub struct LabelTable {
  pub name: &'static str,
  pub labels: &'static [&'static str],
}

impl LabelTable {
  /// 越界序号返回 `"Unknown"`
  pub fn label(&self, class_id: usize) -> &'static str {
    self.labels.get(class_id).copied().unwrap_or(UNKNOWN_LABEL)
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }
}

/// COCO 数据集类别名称
pub const COCO_LABELS: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// 手势类别名称
pub const GESTURE_LABELS: [&str; 19] = [
  "call",
  "dislike",
  "fist",
  "four",
  "like",
  "mute",
  "ok",
  "one",
  "palm",
  "peace",
  "peace_inverted",
  "rock",
  "stop",
  "stop_inverted",
  "three",
  "three2",
  "two_up",
  "two_up_inverted",
  "no_gesture",
];

static LAYER_GROUPS: [LayerGroup; 2] = [
  LayerGroup {
    input: "images",
    boxes: "boxes",
    classes: "scores",
  },
  LayerGroup {
    input: "input",
    boxes: "bboxes",
    classes: "gestures",
  },
];

static LABEL_TABLES: [LabelTable; 2] = [
  LabelTable {
    name: "coco",
    labels: &COCO_LABELS,
  },
  LabelTable {
    name: "gesture",
    labels: &GESTURE_LABELS,
  },
];

pub fn layer_group(group: usize) -> Result<&'static LayerGroup, ConfigError> {
  LAYER_GROUPS
    .get(group)
    .ok_or(ConfigError::MissingLayerGroup(group))
}

pub fn label_table(group: usize) -> Result<&'static LabelTable, ConfigError> {
  LABEL_TABLES
    .get(group)
    .ok_or(ConfigError::MissingLayerGroup(group))
}

struct CatalogEntry {
  display_name: &'static str,
  asset_path: &'static str,
  rect_format: RectFormat,
  output_group: usize,
}

impl CatalogEntry {
  fn to_descriptor(&self) -> ModelDescriptor {
    ModelDescriptor {
      display_name: self.display_name.to_string(),
      storage_path: PathBuf::from(self.asset_path),
      rect_format: self.rect_format,
      output_group: self.output_group,
    }
  }
}

static CATALOG: [CatalogEntry; 4] = [
  CatalogEntry {
    display_name: "YOLO-NAS",
    asset_path: "models/yolo_nas_s_quantized.dlc",
    rect_format: RectFormat::Corner,
    output_group: 0,
  },
  CatalogEntry {
    display_name: "YOLOv8",
    asset_path: "models/yolov8n_quantized.dlc",
    rect_format: RectFormat::Center,
    output_group: 0,
  },
  CatalogEntry {
    display_name: "SSD-MobileNetV2",
    asset_path: "models/ssd_mobilenet_v2_quantized.dlc",
    rect_format: RectFormat::Corner,
    output_group: 0,
  },
  CatalogEntry {
    display_name: "HandGesture",
    asset_path: "models/hand_gesture_quantized.dlc",
    rect_format: RectFormat::Center,
    output_group: 1,
  },
];

/// 所有内置模型
pub fn entries() -> Vec<ModelDescriptor> {
  CATALOG.iter().map(CatalogEntry::to_descriptor).collect()
}

/// 按显示名称查找内置模型
pub fn find(display_name: &str) -> Option<ModelDescriptor> {
  CATALOG
    .iter()
    .find(|entry| entry.display_name == display_name)
    .map(CatalogEntry::to_descriptor)
}
