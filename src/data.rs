//! Decode requests, batch collation and JSON Lines I/O.
//!
//! Every query is prefixed with a shared padding context and cut to its last `seq_len`
//! tokens; rows in a batch are then left-padded to a common width so the context window
//! handed to the scorer is rectangular.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One item to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeRequest {
    pub id: u64,
    pub query: Vec<u32>,
}

/// Finalised output for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodeResult {
    pub id: u64,
    /// Generated tokens, ending with the end marker when one was produced.
    pub tokens: Vec<u32>,
    /// Length-normalised score; serialised as `null` when not finite.
    pub score: f32,
}

/// A collated batch: equal-width rows, one per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub ids: Vec<u64>,
    pub rows: Vec<Vec<u32>>,
    /// Unpadded length of each row.
    pub query_lens: Vec<usize>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Common row width (0 for an empty batch).
    #[must_use]
    pub fn width(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }
}

/// Builds batches from requests.
#[derive(Debug, Clone)]
pub struct Collator {
    context: Vec<u32>,
    seq_len: usize,
    pad_token_id: u32,
}

impl Collator {
    #[must_use]
    pub fn new(context: Vec<u32>, seq_len: usize, pad_token_id: u32) -> Self {
        Self {
            context,
            seq_len,
            pad_token_id,
        }
    }

    /// `context ++ query`, truncated from the front to `seq_len`.
    ///
    /// A row that would be empty holds a single pad token so the scorer has a position to
    /// predict from.
    #[must_use]
    pub fn prepare_row(&self, query: &[u32]) -> Vec<u32> {
        let total = self.context.len() + query.len();
        let skip = total.saturating_sub(self.seq_len);
        let row: Vec<u32> = self
            .context
            .iter()
            .chain(query)
            .skip(skip)
            .copied()
            .collect();
        if row.is_empty() {
            vec![self.pad_token_id]
        } else {
            row
        }
    }

    /// Collate requests into one batch, left-padding rows to the longest one.
    #[must_use]
    pub fn collate(&self, requests: &[DecodeRequest]) -> Batch {
        let mut rows: Vec<Vec<u32>> = requests
            .iter()
            .map(|req| {
                if req.query.len() > self.seq_len {
                    warn!(
                        id = req.id,
                        len = req.query.len(),
                        seq_len = self.seq_len,
                        "query longer than the context window; truncating from the front"
                    );
                }
                self.prepare_row(&req.query)
            })
            .collect();
        let query_lens: Vec<usize> = rows.iter().map(Vec::len).collect();
        let width = query_lens.iter().copied().max().unwrap_or(0);

        for row in &mut rows {
            let pad = width - row.len();
            if pad > 0 {
                row.splice(0..0, std::iter::repeat_n(self.pad_token_id, pad));
            }
        }

        Batch {
            ids: requests.iter().map(|r| r.id).collect(),
            rows,
            query_lens,
        }
    }

    /// Split requests into consecutive batches of at most `batch_size`, in input order.
    pub fn batches<'a>(
        &'a self,
        requests: &'a [DecodeRequest],
        batch_size: usize,
    ) -> impl Iterator<Item = Batch> + 'a {
        requests
            .chunks(batch_size.max(1))
            .map(move |chunk| self.collate(chunk))
    }
}

/// Read requests from a JSON Lines file, one `{"id": .., "query": [..]}` per line.
///
/// # Errors
/// Returns an error if the file cannot be read or a line is not a valid request.
pub fn read_requests(path: &Path) -> Result<Vec<DecodeRequest>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("open requests {}", path.display()))?;
    let mut requests = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let req: DecodeRequest = serde_json::from_str(&line)
            .with_context(|| format!("parse {}:{}", path.display(), lineno + 1))?;
        requests.push(req);
    }
    Ok(requests)
}

/// Read the shared padding context: a JSON array of token ids.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed.
pub fn read_context(path: &Path) -> Result<Vec<u32>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read context {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Write results as JSON Lines.
///
/// # Errors
/// Returns an error if serialisation or the write fails.
pub fn write_results(mut writer: impl Write, results: &[DecodeResult]) -> Result<()> {
    for result in results {
        serde_json::to_writer(&mut writer, result).context("serialise result")?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
