pub mod core;
pub mod storage;
pub mod mmap;
pub mod index;
pub mod analysis;
pub mod schema;
pub mod writer;
pub mod query;
pub mod search;

pub use crate::core::config::Config;
pub use crate::core::engine::Engine;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::schema::Schema;

/*
┌──────────────────────────────── TYPHOON STRUCT ARCHITECTURE ─────────────────────────────────┐
│                                                                                              │
│  struct Engine                                                                               │
│  ├─ store: Arc<PageStore>          page files + optional PageCache (block_size slots)        │
│  ├─ tables: Tables                                                                           │
│  │   ├─ documents: DocumentTable   DocId -> Address, records in DocumentHeap                 │
│  │   ├─ phrases:   PhraseTable     PhraseValue -> Address, values in PhraseHeap              │
│  │   ├─ forward:   ForwardIndex    document Address -> phrase Addresses                      │
│  │   └─ inverted:  InvertedIndex   phrase -> (document, position) postings                   │
│  ├─ request_parser: RequestParser  JSON attributes -> IndexRequest                           │
│  ├─ batch: BatchWriter             pending IndexRequests -> IndexWriter (five phases)        │
│  ├─ query_parser: QueryParser      JSON conditions/order -> SearchRequest                    │
│  └─ searcher: Searcher             Node tree (Leaf/And/Or) pull merge -> SearchResponse      │
│                                                                                              │
│  Every table is an OrderedPagedTree<L: TreeLayout>:                                          │
│      info pages (InfoEntry { count, pageno, level, max }) -> data pages                      │
│      forward/inverted units are u32 words framed by PackedIndexCodec                         │
│                                                                                              │
│  Files under storage_path:                                                                   │
│      {kind}.dat.{fileno:08x}.{sector:04x}   shm.dat (EngineHeader)                           │
│      info.dat (Schema)                      indexer.lock (FileLock)                          │
└──────────────────────────────────────────────────────────────────────────────────────────────┘
*/
