use std::path::PathBuf;

/// A single ranked hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub path: PathBuf,
    pub score: f32,
    pub ocr_text: Option<String>,
}

impl SearchHit {
    pub fn new(path: impl Into<PathBuf>, score: f32) -> Self {
        Self {
            path: path.into(),
            score,
            ocr_text: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub limit: u32,
    pub threshold: f32,
}

/// One issued query. Never mutated once built; a newer generation supersedes it.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    query: String,
    limit: u32,
    threshold: f32,
    generation: u64,
}

impl SearchRequest {
    pub fn new(query: &str, params: SearchParams, generation: u64) -> Self {
        Self {
            query: query.trim().to_string(),
            limit: params.limit,
            threshold: params.threshold,
            generation,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    Search,
    Recent,
    Cleared,
    Similar,
}

/// Hits in backend rank order, tagged with the generation that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResults {
    pub generation: u64,
    pub source: ResultSource,
    pub hits: Vec<SearchHit>,
}

impl SearchResults {
    pub fn cleared(generation: u64) -> Self {
        Self {
            generation,
            source: ResultSource::Cleared,
            hits: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.hits.iter().map(|hit| &hit.path)
    }
}
