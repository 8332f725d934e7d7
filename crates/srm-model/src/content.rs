//! Delta content: the addition and reduction fragments a delta carries.

use crate::error::{ModelError, ModelResult};
use crate::format::ModelFormat;
use crate::graph::Graph;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use srm_types::DeltaType;

/// Decodes a submitted fragment: standard base64 of UTF-8 text, or the
/// text itself when it is not base64.
pub fn decode_content(raw: &str) -> ModelResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ModelError::Encoding("empty delta content".to_string()));
    }
    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if let Ok(bytes) = STANDARD.decode(compact.as_bytes()) {
        if let Ok(text) = String::from_utf8(bytes) {
            return Ok(text.trim().to_string());
        }
    }
    Ok(trimmed.to_string())
}

/// The fragments of one delta, as stored in the delta record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduction: Option<String>,
}

impl DeltaContent {
    /// Builds content from raw submitted fragments, decoding each one.
    pub fn decode(addition: Option<&str>, reduction: Option<&str>) -> ModelResult<Self> {
        let addition = addition.map(decode_content).transpose()?;
        let reduction = reduction.map(decode_content).transpose()?;
        if addition.is_none() && reduction.is_none() {
            return Err(ModelError::Encoding(
                "delta carries neither addition nor reduction".to_string(),
            ));
        }
        Ok(Self {
            addition,
            reduction,
        })
    }

    pub fn from_json(text: &str) -> ModelResult<Self> {
        serde_json::from_str(text).map_err(|e| ModelError::Encoding(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Two optional strings always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn delta_type(&self) -> DeltaType {
        match (&self.addition, &self.reduction) {
            (Some(_), Some(_)) => DeltaType::Modify,
            (None, Some(_)) => DeltaType::Reduction,
            _ => DeltaType::Addition,
        }
    }

    /// Parses both fragments.
    pub fn graphs(&self) -> ModelResult<(Option<Graph>, Option<Graph>)> {
        let parse = |text: &String| ModelFormat::detect(text).parse(text);
        let addition = self.addition.as_ref().map(parse).transpose()?;
        let reduction = self.reduction.as_ref().map(parse).transpose()?;
        Ok((addition, reduction))
    }
}

/// Applies a delta to a graph: the reduction is removed first, then the
/// addition merged. The graph is untouched when a fragment fails to parse.
pub fn apply_delta(graph: &mut Graph, content: &DeltaContent) -> ModelResult<()> {
    let (addition, reduction) = content.graphs()?;
    if let Some(reduction) = reduction {
        graph.subtract(&reduction);
    }
    if let Some(addition) = addition {
        graph.extend(&addition);
    }
    Ok(())
}
