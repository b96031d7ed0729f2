use serde::{Deserialize, Serialize};

use crate::model::{SearchHit, SearchRequest};

pub const HEALTH_PATH: &str = "/health";
pub const SEARCH_PATH: &str = "/search";
pub const RECENT_PATH: &str = "/recent";
pub const SIMILAR_PATH: &str = "/similar";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchBody {
    pub query: String,
    pub limit: u32,
    pub threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecentBody {
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimilarBody {
    pub path: String,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultDto {
    pub path: String,
    pub similarity: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
}

/// Either a ranked result list or a backend-reported failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResultsEnvelope {
    Results {
        results: Vec<ResultDto>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<serde_json::Value>,
    },
    Error {
        error: String,
    },
}

impl From<&SearchRequest> for SearchBody {
    fn from(value: &SearchRequest) -> Self {
        Self {
            query: value.query().to_string(),
            limit: value.limit(),
            threshold: value.threshold(),
        }
    }
}

impl From<ResultDto> for SearchHit {
    fn from(value: ResultDto) -> Self {
        Self {
            path: value.path.into(),
            score: value.similarity,
            ocr_text: value.ocr_text.filter(|text| !text.trim().is_empty()),
        }
    }
}

impl ResultsEnvelope {
    pub fn into_hits(self) -> Result<Vec<SearchHit>, String> {
        match self {
            Self::Results { results, .. } => Ok(results.into_iter().map(SearchHit::from).collect()),
            Self::Error { error } => Err(error),
        }
    }
}
