/// A stored knowledge document, keyed by its row id.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub run_id: String,
    pub content: String,
}

/// One nearest-neighbour match from the vector index, joined with its text.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KnowledgeHit {
    pub id: i64,
    pub content: String,
    pub distance: f64,
}
