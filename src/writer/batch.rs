use std::mem;
use parking_lot::Mutex;
use tracing::{debug, warn};
use crate::core::error::Result;
use crate::writer::index_writer::IndexWriter;
use crate::writer::parser::IndexRequest;

/// Batch writer for bulk operations. The pending lock also serializes
/// every index mutation.
pub struct BatchWriter {
    pub writer: IndexWriter,
    pending: Mutex<Vec<IndexRequest>>,
    pub batch_size: usize,
}

impl BatchWriter {
    pub fn new(writer: IndexWriter, batch_size: usize) -> Self {
        BatchWriter {
            writer,
            pending: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size: batch_size.max(1),
        }
    }

    /// Queue a request; apply the queue when asked to or when it grows past the batch size.
    pub fn add(&self, request: IndexRequest, flush: bool) -> Result<()> {
        let mut pending = self.pending.lock();
        pending.push(request);
        if flush || pending.len() > self.batch_size {
            self.apply(&mut pending)?;
        }
        Ok(())
    }

    /// Apply whatever is queued. Returns the number of requests applied.
    pub fn flush(&self) -> Result<usize> {
        let mut pending = self.pending.lock();
        self.apply(&mut pending)
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Apply parsed requests in `batch_size` chunks after anything queued.
    pub fn add_all(&self, requests: Vec<IndexRequest>) -> Result<usize> {
        let mut pending = self.pending.lock();
        let mut applied = self.apply(&mut pending)?;
        for chunk in requests.chunks(self.batch_size) {
            self.writer.apply(chunk)?;
            applied += chunk.len();
            debug!(applied, "import batch applied");
        }
        Ok(applied)
    }

    fn apply(&self, pending: &mut Vec<IndexRequest>) -> Result<usize> {
        if pending.is_empty() {
            return Ok(0);
        }
        let batch = mem::take(pending);
        match self.writer.apply(&batch) {
            Ok(()) => Ok(batch.len()),
            Err(err) => {
                warn!(error = %err, requests = batch.len(), "index batch failed");
                Err(err)
            }
        }
    }
}
