//! Canonical embeddings types, OpenAI-shaped.

use serde::{Deserialize, Serialize};

/// Input is a single string or an ordered batch. Output vectors are
/// returned in input order regardless of provider batch limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

impl EmbeddingInput {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            EmbeddingInput::Single(s) => vec![s],
            EmbeddingInput::Batch(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            EmbeddingInput::Single(_) => 1,
            EmbeddingInput::Batch(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            EmbeddingInput::Single(s) => s.is_empty(),
            EmbeddingInput::Batch(v) => v.is_empty(),
        }
    }

    pub fn total_chars(&self) -> usize {
        match self {
            EmbeddingInput::Single(s) => s.chars().count(),
            EmbeddingInput::Batch(v) => v.iter().map(|s| s.chars().count()).sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: EmbeddingInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingObject {
    pub object: String,
    pub index: u32,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub object: String,
    pub data: Vec<EmbeddingObject>,
    pub model: String,
    pub usage: crate::chat::Usage,
}

impl EmbeddingsResponse {
    pub fn new(model: impl Into<String>, vectors: Vec<Vec<f32>>, usage: crate::chat::Usage) -> Self {
        Self {
            object: "list".to_string(),
            data: vectors
                .into_iter()
                .enumerate()
                .map(|(i, embedding)| EmbeddingObject {
                    object: "embedding".to_string(),
                    index: i as u32,
                    embedding,
                })
                .collect(),
            model: model.into(),
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_accepts_string_or_batch() {
        let single: EmbeddingsRequest =
            serde_json::from_value(serde_json::json!({"model": "m", "input": "hello"})).unwrap();
        assert_eq!(single.input.len(), 1);

        let batch: EmbeddingsRequest =
            serde_json::from_value(serde_json::json!({"model": "m", "input": ["a", "b"]})).unwrap();
        assert_eq!(batch.input.len(), 2);
    }

    #[test]
    fn response_preserves_input_order() {
        let resp = EmbeddingsResponse::new(
            "m",
            vec![vec![0.1], vec![0.2], vec![0.3]],
            crate::chat::Usage::new(3, 0),
        );
        let indices: Vec<u32> = resp.data.iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
