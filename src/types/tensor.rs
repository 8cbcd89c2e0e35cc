//! Batched tensor inference values

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Float16,
    Float32,
    Uint8,
    Int8,
    Int32,
    Int64,
}

impl ElementType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            ElementType::Uint8 | ElementType::Int8 => 1,
            ElementType::Float16 => 2,
            ElementType::Float32 | ElementType::Int32 => 4,
            ElementType::Int64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ElementType::Float16 => "float16",
            ElementType::Float32 => "float32",
            ElementType::Uint8 => "uint8_t",
            ElementType::Int8 => "int8_t",
            ElementType::Int32 => "int32_t",
            ElementType::Int64 => "int64_t",
        }
    }
}

impl std::str::FromStr for ElementType {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "float16" | "fp16" => Ok(ElementType::Float16),
            "float32" | "fp32" => Ok(ElementType::Float32),
            "uint8_t" | "uint8" => Ok(ElementType::Uint8),
            "int8_t" | "int8" => Ok(ElementType::Int8),
            "int32_t" | "int32" => Ok(ElementType::Int32),
            "int64_t" | "int64" => Ok(ElementType::Int64),
            other => Err(SessionError::invalid_argument(
                "data_type",
                format!("unsupported element type '{}'", other),
            )),
        }
    }
}

/// Raw tensor bytes with their shape and element type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub data: Vec<u8>,
    pub shape: Vec<i64>,
    pub element_type: ElementType,
}

impl NamedTensor {
    pub fn new(
        name: impl Into<String>,
        data: Vec<u8>,
        shape: Vec<i64>,
        element_type: ElementType,
    ) -> Self {
        Self {
            name: name.into(),
            data,
            shape,
            element_type,
        }
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &dim| {
            usize::try_from(dim).ok().and_then(|d| acc.checked_mul(d))
        })
    }

    /// Check that the byte length matches shape and element type
    pub fn validate(&self) -> Result<()> {
        let count = self.element_count().ok_or_else(|| {
            SessionError::invalid_argument(
                "shape",
                format!("tensor '{}' has an invalid shape {:?}", self.name, self.shape),
            )
        })?;
        let expected = count * self.element_type.size_in_bytes();
        if expected != self.data.len() {
            return Err(SessionError::invalid_argument(
                "data",
                format!(
                    "tensor '{}' holds {} bytes, shape {:?} of {} needs {}",
                    self.name,
                    self.data.len(),
                    self.shape,
                    self.element_type.as_str(),
                    expected
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInferenceRequest {
    /// Case identifier echoed back by the engine
    pub case_name: String,
    pub tensors: Vec<NamedTensor>,
}

impl BatchInferenceRequest {
    pub fn new(case_name: impl Into<String>) -> Self {
        Self {
            case_name: case_name.into(),
            tensors: Vec::new(),
        }
    }

    pub fn with_tensor(mut self, tensor: NamedTensor) -> Self {
        self.tensors.push(tensor);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tensors.is_empty() {
            return Err(SessionError::invalid_argument(
                "tensors",
                "batch inference request carries no tensors",
            ));
        }
        self.tensors.iter().try_for_each(NamedTensor::validate)
    }
}

/// Output tensors, named after the request's inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInferenceResult {
    pub case_name: String,
    pub tensors: Vec<NamedTensor>,
}

impl BatchInferenceResult {
    pub fn tensor(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }
}
