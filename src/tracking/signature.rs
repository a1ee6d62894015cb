//! Model signatures in the MLflow schema format.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::data::ReviewFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Long,
    Double,
    String,
}

impl ColumnType {
    /// Narrowest type that holds every value. Empty cells are missing values,
    /// which only a floating point column can represent.
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut inferred = Self::Long;
        let mut any = false;
        for value in values {
            let value = value.trim();
            if value.is_empty() {
                inferred = inferred.max_with(Self::Double);
                continue;
            }
            any = true;
            let kind = if value.parse::<i64>().is_ok() {
                Self::Long
            } else if value.parse::<f64>().is_ok() {
                Self::Double
            } else {
                Self::String
            };
            inferred = inferred.max_with(kind);
        }
        if any { inferred } else { Self::String }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Long => 0,
            Self::Double => 1,
            Self::String => 2,
        }
    }

    fn max_with(self, other: Self) -> Self {
        if other.rank() > self.rank() { other } else { self }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: String,
    pub shape: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSignature {
    pub inputs: Vec<ColumnSpec>,
    pub outputs: TensorSpec,
}

impl ModelSignature {
    /// Column schema of the whole frame, label column included, and a
    /// `float32` tensor of `[-1, num_outputs]` predictions.
    pub fn infer(frame: &ReviewFrame, num_outputs: usize) -> Self {
        let inputs = frame
            .headers
            .iter()
            .enumerate()
            .map(|(index, name)| ColumnSpec {
                column_type: ColumnType::infer(frame.column(index)),
                name: name.clone(),
            })
            .collect();

        Self {
            inputs,
            outputs: TensorSpec {
                dtype: "float32".to_string(),
                shape: vec![-1, num_outputs as i64],
            },
        }
    }

    /// The `signature` entry of an `MLmodel` file. MLflow stores both schemas
    /// as JSON strings.
    pub fn to_mlmodel(&self) -> serde_json::Result<Value> {
        let outputs = vec![json!({ "type": "tensor", "tensor-spec": self.outputs })];
        Ok(json!({
            "inputs": serde_json::to_string(&self.inputs)?,
            "outputs": serde_json::to_string(&outputs)?,
        }))
    }
}
