use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use crate::analysis::tokenizer::{StandardTokenizer, Tokenizer};
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{DocId, DocumentRecord};
use crate::index::document::DocumentTable;
use crate::index::forward::ForwardIndex;
use crate::index::inverted::InvertedIndex;
use crate::index::phrase::PhraseTable;
use crate::index::tree::TreeStats;
use crate::query::parser::QueryParser;
use crate::schema::Schema;
use crate::search::executor::Searcher;
use crate::search::results::{CommandResponse, SearchResponse};
use crate::storage::file_lock::FileLock;
use crate::storage::header::EngineHeader;
use crate::storage::layout::StorageLayout;
use crate::storage::page_cache::CacheStats;
use crate::storage::page_store::PageStore;
use crate::writer::batch::BatchWriter;
use crate::writer::index_writer::{IndexWriter, Tables};
use crate::writer::parser::{RequestParser, parse_lines};

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub documents: TreeStats,
    pub phrases: TreeStats,
    pub forward: TreeStats,
    pub inverted: TreeStats,
    pub cache: Option<CacheStats>,
    pub pending: usize,
}

/// One index directory: the page store, the four tables and the request pipeline.
pub struct Engine {
    config: Config,
    store: Arc<PageStore>,
    schema: Arc<Schema>,
    tables: Tables,
    request_parser: RequestParser,
    query_parser: QueryParser,
    batch: BatchWriter,
    searcher: Searcher,
    parse_lock: Mutex<()>,
    header: Mutex<EngineHeader>,
    closed: AtomicBool,
    _lock: FileLock,
}

impl Engine {
    /// Open `config.storage_path`, creating a new index for `schema` if the
    /// directory holds none.
    pub fn open(config: Config, schema: Schema) -> Result<Self> {
        Self::open_with_tokenizer(config, schema, Arc::new(StandardTokenizer::default()))
    }

    /// Open an existing index with the schema it was created with.
    pub fn reopen(config: Config) -> Result<Self> {
        let layout = StorageLayout::new(&config.storage_path, config.page_size)?;
        let schema = Schema::load(&layout)?
            .ok_or_else(|| Error::state(format!("{} holds no index", layout.base_dir().display())))?;
        Self::open(config, schema)
    }

    pub fn open_with_tokenizer(config: Config, schema: Schema, tokenizer: Arc<dyn Tokenizer>) -> Result<Self> {
        config.validate()?;
        schema.validate()?;
        let layout = StorageLayout::new(&config.storage_path, config.page_size)?;
        let lock = FileLock::acquire(&layout)?;

        let existing = EngineHeader::load(&layout)?;
        if let Some(header) = &existing {
            if header.page_size != config.page_size {
                return Err(Error::schema(format!(
                    "index was created with page size {}, config asks for {}",
                    header.page_size, config.page_size
                )));
            }
            if let Some(stored) = Schema::load(&layout)? {
                if stored != schema {
                    return Err(Error::schema("schema differs from the one the index was created with".to_string()));
                }
            }
        }

        let store = Arc::new(PageStore::new(layout.clone(), &config));
        let (tables, mut header) = match existing {
            Some(header) => {
                let tables = open_tables(&store, &config, &header)?;
                info!(path = %layout.base_dir().display(), generation = header.generation, "index opened");
                (tables, header)
            }
            None => {
                schema.save(&layout)?;
                let tables = create_tables(&store, &config)?;
                info!(path = %layout.base_dir().display(), "index created");
                (tables, EngineHeader::new(config.page_size, config.block_size))
            }
        };
        header.block_size = config.block_size;
        if let Some(cache) = store.cache() {
            cache.set_generation(header.generation);
        }

        let schema = Arc::new(schema);
        let searcher = Searcher::new(
            Arc::clone(&tables.inverted),
            Arc::clone(tables.documents.heap()),
            Arc::clone(&schema),
            &config,
        );
        let engine = Engine {
            request_parser: RequestParser::new(Arc::clone(&schema), Arc::clone(&tokenizer)),
            query_parser: QueryParser::new(Arc::clone(&schema), tokenizer),
            batch: BatchWriter::new(IndexWriter::new(tables.clone(), config.block_size), config.batch_size),
            searcher,
            parse_lock: Mutex::new(()),
            header: Mutex::new(header),
            closed: AtomicBool::new(false),
            _lock: lock,
            config,
            store,
            schema,
            tables,
        };
        engine.persist()?;
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Dispatch one JSON request line and return the JSON reply.
    pub fn handle_request(&self, line: &str) -> String {
        if let Some(cache) = self.store.cache() {
            cache.next_generation();
        }
        let request: Value = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => return reply(&CommandResponse::failure(Error::from(err).context)),
        };

        match request.get("command").and_then(Value::as_str) {
            Some("index") => {
                let data = request.get("data").unwrap_or(&Value::Null);
                let flush = request.get("flush").and_then(Value::as_bool).unwrap_or(true);
                match self.index(data, flush) {
                    Ok(()) => reply(&CommandResponse::success("Success indexing document")),
                    Err(err) => {
                        warn!(error = %err, "index request failed");
                        reply(&CommandResponse::failure(err.context))
                    }
                }
            }
            Some("search") => match self.search(&request) {
                Ok(response) => reply(&response),
                Err(err) => {
                    warn!(error = %err, "search request failed");
                    reply(&SearchResponse::failure(err.context))
                }
            },
            other => {
                let command = other.map(str::to_string).unwrap_or_else(|| {
                    request.get("command").map(Value::to_string).unwrap_or_default()
                });
                reply(&CommandResponse::failure(format!("Invalid command: {}", command)))
            }
        }
    }

    /// Parse one document and queue it; `flush` applies the queue right away.
    pub fn index(&self, data: &Value, flush: bool) -> Result<()> {
        let request = {
            let _parsing = self.parse_lock.lock();
            self.request_parser.parse(data)?
        };
        self.batch.add(request, flush)
    }

    /// Apply queued documents. Returns how many were applied.
    pub fn flush(&self) -> Result<usize> {
        self.batch.flush()
    }

    pub fn search(&self, request: &Value) -> Result<SearchResponse> {
        let request = self.query_parser.parse(request, &self.config)?;
        self.searcher.search(&request)
    }

    pub fn find(&self, id: u64) -> Result<Option<DocumentRecord>> {
        self.tables.documents.find(DocId(id))
    }

    /// Index a JSON-lines file. Lines that fail to parse are logged and skipped.
    pub fn import_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let lines = reader.lines().collect::<std::io::Result<Vec<String>>>()?;

        let mut requests = Vec::with_capacity(lines.len());
        for (line, parsed) in parse_lines(&self.request_parser, &lines).into_iter().enumerate() {
            match parsed {
                Ok(request) => requests.push(request),
                Err(err) => warn!(file = %path.display(), line, error = %err, "import line skipped"),
            }
        }
        let applied = self.batch.add_all(requests)?;
        info!(file = %path.display(), applied, "import finished");
        Ok(applied)
    }

    /// Apply queued documents, write dirty pages and the header.
    pub fn sync(&self) -> Result<()> {
        self.batch.flush()?;
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let written = self.store.flush()?;
        let mut header = self.header.lock();
        if let Some(cache) = self.store.cache() {
            header.generation = cache.generation();
        }
        let (documents, document_heap) = self.tables.documents.state();
        let (phrases, phrase_heap) = self.tables.phrases.state();
        header.documents = documents;
        header.document_heap = document_heap;
        header.phrases = phrases;
        header.phrase_heap = phrase_heap;
        header.forward = self.tables.forward.state();
        header.inverted = self.tables.inverted.state();
        header.save(self.store.layout())?;
        debug!(written, "index synced");
        Ok(())
    }

    /// Apply pending work and write everything behind the cache barrier.
    pub fn close(self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.batch.flush()?;
        let barrier = self.store.cache().map(|cache| cache.lock_all());
        let result = self.persist();
        if let Some(cache) = self.store.cache() {
            cache.unlock_all();
        }
        info!(path = %self.config.storage_path.display(), barrier = ?barrier, "index closed");
        result
    }

    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            documents: self.tables.documents.stats()?,
            phrases: self.tables.phrases.stats()?,
            forward: self.tables.forward.stats()?,
            inverted: self.tables.inverted.stats()?,
            cache: self.store.cache().map(|cache| cache.stats()),
            pending: self.batch.pending(),
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.sync() {
            error!(error = %err, "failed to sync index on drop");
        }
    }
}

fn create_tables(store: &Arc<PageStore>, config: &Config) -> Result<Tables> {
    let documents = Arc::new(DocumentTable::create(Arc::clone(store), config.document_sector_limit)?);
    let phrases = Arc::new(PhraseTable::create(Arc::clone(store), config.phrase_sector_limit)?);
    let forward = Arc::new(ForwardIndex::create(Arc::clone(store))?);
    let inverted = Arc::new(InvertedIndex::create(
        Arc::clone(store),
        Arc::clone(phrases.heap()),
        Arc::clone(documents.heap()),
    )?);
    Ok(Tables { documents, phrases, forward, inverted })
}

fn open_tables(store: &Arc<PageStore>, config: &Config, header: &EngineHeader) -> Result<Tables> {
    let documents = Arc::new(DocumentTable::open(
        Arc::clone(store),
        config.document_sector_limit,
        &header.documents,
        header.document_heap,
    )?);
    let phrases = Arc::new(PhraseTable::open(
        Arc::clone(store),
        config.phrase_sector_limit,
        &header.phrases,
        header.phrase_heap,
    )?);
    let forward = Arc::new(ForwardIndex::open(Arc::clone(store), &header.forward)?);
    let inverted = Arc::new(InvertedIndex::open(
        Arc::clone(store),
        Arc::clone(phrases.heap()),
        Arc::clone(documents.heap()),
        &header.inverted,
    )?);
    Ok(Tables { documents, phrases, forward, inverted })
}

fn reply<T: Serialize>(response: &T) -> String {
    serde_json::to_string(response)
        .unwrap_or_else(|err| format!(r#"{{"error":true,"message":"{}"}}"#, err))
}
