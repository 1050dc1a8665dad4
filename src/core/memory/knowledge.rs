use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use super::MemorySystem;
use super::types::{DocumentRecord, KnowledgeHit};

/// sqlite-vec accepts vectors as JSON arrays.
pub(crate) fn vector_param(embedding: &[f32]) -> Result<String> {
    Ok(serde_json::to_string(embedding)?)
}

/// Replace the vector stored for `record_id`. vec0 has no upsert, so this is a
/// delete followed by an insert and is safe to repeat.
pub(crate) fn write_vector(db: &Connection, record_id: i64, embedding: &[f32]) -> Result<()> {
    let vector = vector_param(embedding)?;
    db.execute("DELETE FROM vss_documents WHERE rowid = ?1", params![record_id])?;
    db.execute(
        "INSERT INTO vss_documents (rowid, embedding) VALUES (?1, ?2)",
        params![record_id, vector],
    )?;
    Ok(())
}

impl MemorySystem {
    pub async fn get_document(&self, id: i64) -> Result<Option<DocumentRecord>> {
        let db = self.db.lock().await;
        let doc = db
            .query_row(
                "SELECT id, run_id, content FROM documents WHERE id = ?1",
                params![id],
                |row| {
                    Ok(DocumentRecord {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        content: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(doc)
    }

    pub async fn document_for_run(&self, run_id: &str) -> Result<Option<DocumentRecord>> {
        let db = self.db.lock().await;
        let doc = db
            .query_row(
                "SELECT id, run_id, content FROM documents WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(DocumentRecord {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        content: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(doc)
    }

    pub async fn count_documents(&self) -> Result<i64> {
        let db = self.db.lock().await;
        Ok(db.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?)
    }

    pub async fn count_vectors(&self) -> Result<i64> {
        let db = self.db.lock().await;
        Ok(db.query_row("SELECT COUNT(*) FROM vss_documents", [], |row| row.get(0))?)
    }

    pub async fn has_vector(&self, record_id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let found: Option<i64> = db
            .query_row(
                "SELECT rowid FROM vss_documents WHERE rowid = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The `k` nearest record ids to `query`, closest first.
    pub async fn nearest_records(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f64)>> {
        let vector = vector_param(query)?;
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT rowid, distance FROM vss_documents
             WHERE embedding MATCH ?1 AND k = ?2
             ORDER BY distance",
        )?;
        let rows = stmt.query_map(params![vector, k as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Nearest documents with their stored text. Ids whose document row is
    /// gone are skipped.
    pub async fn search_knowledge(&self, query: &[f32], k: usize) -> Result<Vec<KnowledgeHit>> {
        let mut hits = Vec::new();
        for (id, distance) in self.nearest_records(query, k).await? {
            if let Some(doc) = self.get_document(id).await? {
                hits.push(KnowledgeHit {
                    id,
                    content: doc.content,
                    distance,
                });
            }
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::test_memory_system;

    async fn insert_doc(memory: &MemorySystem, run_id: &str, text: &str, v: &[f32]) -> i64 {
        let db = memory.get_db();
        let db = db.lock().await;
        db.execute(
            "INSERT INTO documents (run_id, content) VALUES (?1, ?2)",
            params![run_id, text],
        )
        .unwrap();
        let id = db.last_insert_rowid();
        write_vector(&db, id, v).unwrap();
        id
    }

    #[tokio::test]
    async fn nearest_documents_come_back_closest_first() {
        let (memory, _dir) = test_memory_system(3).await;
        let cats = insert_doc(&memory, "r1", "cats purr", &[1.0, 0.0, 0.0]).await;
        let _dogs = insert_doc(&memory, "r2", "dogs bark", &[0.0, 1.0, 0.0]).await;
        let _fish = insert_doc(&memory, "r3", "fish swim", &[0.0, 0.0, 1.0]).await;

        let hits = memory.search_knowledge(&[0.9, 0.1, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, cats);
        assert_eq!(hits[0].content, "cats purr");
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn rewriting_a_vector_keeps_one_row() {
        let (memory, _dir) = test_memory_system(3).await;
        let id = insert_doc(&memory, "r1", "text", &[1.0, 0.0, 0.0]).await;
        {
            let db = memory.get_db();
            let db = db.lock().await;
            write_vector(&db, id, &[0.0, 1.0, 0.0]).unwrap();
        }
        assert_eq!(memory.count_vectors().await.unwrap(), 1);
        let hits = memory.nearest_records(&[0.0, 1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].0, id);
        assert!(hits[0].1 < 1e-6);
    }

    #[tokio::test]
    async fn document_lookup_by_run() {
        let (memory, _dir) = test_memory_system(3).await;
        let id = insert_doc(&memory, "run-a", "alpha", &[1.0, 0.0, 0.0]).await;
        let doc = memory.document_for_run("run-a").await.unwrap().unwrap();
        assert_eq!(doc.id, id);
        assert!(memory.document_for_run("run-b").await.unwrap().is_none());
        assert!(memory.has_vector(id).await.unwrap());
    }
}
