use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Models the engine knows how to load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    MiniCpm,
    DeepSeek,
    Phi4,
    MiniCpmV1b,
    Qwen,
    PaliGemma,
    PaliGemmaV1_1,
    Qwen25Vl7b,
    Qwen25Vl3b,
    Qwen25Vl7bDa04,
    Qwen25Omni7bDa04,
    InternVl3_8b,
    ResNet50,
    RepVgg,
    YoloV8s,
}

/// First id of the convolutional (batch tensor) models
const FIRST_CNN_MODEL: i32 = 1000;

const CATALOGUE: [(ModelKind, i32, &str); 15] = [
    (ModelKind::MiniCpm, 1, "minicpm"),
    (ModelKind::DeepSeek, 2, "deepseek"),
    (ModelKind::Phi4, 3, "phi4"),
    (ModelKind::MiniCpmV1b, 4, "minicpmv1b"),
    (ModelKind::Qwen, 5, "qwen"),
    (ModelKind::PaliGemma, 6, "paligemma"),
    (ModelKind::PaliGemmaV1_1, 7, "paligemma-v1.1"),
    (ModelKind::Qwen25Vl7b, 8, "qwen2.5-vl-7b"),
    (ModelKind::Qwen25Vl3b, 9, "qwen2.5-vl-3b"),
    (ModelKind::Qwen25Vl7bDa04, 10, "qwen2.5-vl-7b-da04"),
    (ModelKind::Qwen25Omni7bDa04, 11, "qwen2.5-omni-7b-da04"),
    (ModelKind::InternVl3_8b, 12, "internvl3-8b"),
    (ModelKind::ResNet50, FIRST_CNN_MODEL, "resnet50"),
    (ModelKind::RepVgg, FIRST_CNN_MODEL + 1, "repvgg"),
    (ModelKind::YoloV8s, FIRST_CNN_MODEL + 2, "yolov8s"),
];

impl ModelKind {
    pub fn id(self) -> i32 {
        CATALOGUE
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map(|(_, id, _)| *id)
            .unwrap_or_default()
    }

    pub fn from_id(id: i32) -> Result<Self> {
        CATALOGUE
            .iter()
            .find(|(_, model_id, _)| *model_id == id)
            .map(|(kind, _, _)| *kind)
            .ok_or_else(|| SessionError::InvalidModel(format!("unknown model id {}", id)))
    }

    pub fn name(self) -> &'static str {
        CATALOGUE
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("unknown")
    }

    /// Convolutional models take batched tensors instead of chat requests
    pub fn is_vision_cnn(self) -> bool {
        self.id() >= FIRST_CNN_MODEL
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.to_ascii_lowercase();
        if let Ok(id) = wanted.parse::<i32>() {
            return Self::from_id(id);
        }
        CATALOGUE
            .iter()
            .find(|(_, _, name)| *name == wanted)
            .map(|(kind, _, _)| *kind)
            .ok_or_else(|| SessionError::InvalidModel(format!("unknown model '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ids() {
        assert_eq!(ModelKind::Qwen.id(), 5);
        assert_eq!(ModelKind::YoloV8s.id(), 1002);
        assert_eq!(ModelKind::from_id(1001).unwrap(), ModelKind::RepVgg);
        assert!(matches!(ModelKind::from_id(42), Err(SessionError::InvalidModel(_))));
    }

    #[test]
    fn test_model_classes() {
        assert!(ModelKind::ResNet50.is_vision_cnn());
        assert!(!ModelKind::InternVl3_8b.is_vision_cnn());
    }

    #[test]
    fn test_model_parsing() {
        assert_eq!("QWEN".parse::<ModelKind>().unwrap(), ModelKind::Qwen);
        assert_eq!("1002".parse::<ModelKind>().unwrap(), ModelKind::YoloV8s);
        assert!("gpt".parse::<ModelKind>().is_err());
    }
}
