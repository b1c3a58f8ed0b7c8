//! Training triplet export.
//!
//! Triplets are written as line-delimited JSON records referencing query and
//! passage ids, with two side tables (`queries.jsonl`, `passages.jsonl`) so a
//! passage repeated across many triplets is stored once.

use crate::error::Result;
use crate::mining::{LabeledQuery, MinedNegatives};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// One (query, positive, negatives) record, by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripletRecord {
    pub query_id: u32,
    pub positive_id: u32,
    pub negative_ids: Vec<u32>,
}

/// An id-table entry.
#[derive(Debug, Clone, Serialize)]
struct TableEntry<'a> {
    id: u32,
    text: &'a str,
}

/// Accumulates triplets with interned query/passage text.
#[derive(Debug, Default)]
pub struct TripletExporter {
    queries: Vec<String>,
    query_ids: HashMap<String, u32>,
    passages: Vec<String>,
    passage_ids: HashMap<String, u32>,
    triplets: Vec<TripletRecord>,
}

impl TripletExporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(text: &str, table: &mut Vec<String>, ids: &mut HashMap<String, u32>) -> u32 {
        if let Some(&id) = ids.get(text) {
            return id;
        }
        let id = table.len() as u32;
        table.push(text.to_string());
        ids.insert(text.to_string(), id);
        id
    }

    /// Record one triplet. Repeated texts reuse their existing ids.
    pub fn add_triplet(&mut self, query: &str, positive: &str, negatives: &[&str]) {
        let query_id = Self::intern(query, &mut self.queries, &mut self.query_ids);
        let positive_id = Self::intern(positive, &mut self.passages, &mut self.passage_ids);
        let negative_ids = negatives
            .iter()
            .map(|n| Self::intern(n, &mut self.passages, &mut self.passage_ids))
            .collect();
        self.triplets.push(TripletRecord {
            query_id,
            positive_id,
            negative_ids,
        });
    }

    /// Record the miner's output for a query batch against its corpus.
    ///
    /// Emits one triplet per (query, positive) pair, each carrying the full
    /// mined negative list in rank order.
    pub fn add_mined(
        &mut self,
        queries: &[LabeledQuery],
        mined: &[MinedNegatives],
        corpus: &[String],
    ) {
        for (query, negatives) in queries.iter().zip(mined) {
            let texts: Vec<&str> = negatives
                .negatives
                .iter()
                .map(|&id| corpus[id as usize].as_str())
                .collect();
            for &pos_id in &query.positive_ids {
                self.add_triplet(&query.query, &corpus[pos_id as usize], &texts);
            }
            for pos_text in &query.positive_texts {
                self.add_triplet(&query.query, pos_text, &texts);
            }
        }
    }

    pub fn num_triplets(&self) -> usize {
        self.triplets.len()
    }

    pub fn triplets(&self) -> &[TripletRecord] {
        &self.triplets
    }

    /// Write `triplets.jsonl`, `queries.jsonl`, and `passages.jsonl` to `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;

        let mut w = BufWriter::new(fs::File::create(dir.join("triplets.jsonl"))?);
        for t in &self.triplets {
            serde_json::to_writer(&mut w, t)?;
            w.write_all(b"\n")?;
        }
        w.flush()?;

        write_table(&dir.join("queries.jsonl"), &self.queries)?;
        write_table(&dir.join("passages.jsonl"), &self.passages)?;
        Ok(())
    }
}

fn write_table(path: &Path, table: &[String]) -> Result<()> {
    let mut w = BufWriter::new(fs::File::create(path)?);
    for (id, text) in table.iter().enumerate() {
        serde_json::to_writer(&mut w, &TableEntry { id: id as u32, text })?;
        w.write_all(b"\n")?;
    }
    w.flush()?;
    Ok(())
}
