pub mod config;
pub mod crawler;
pub mod digest;
pub mod dispatcher;
pub mod docstore;
pub mod fetcher;
pub mod notify;
pub mod parser;
pub mod store;
pub mod summarizer;
pub mod types;

pub use config::AppConfig;
pub use crawler::{CrawlOutcome, Crawler};
pub use digest::DigestGenerator;
pub use dispatcher::{DispatchStats, Dispatcher};
pub use docstore::{DocumentStore, FsDocumentStore};
pub use fetcher::Fetcher;
pub use notify::{NotificationMessage, NotifierRegistry, Notify};
pub use parser::FeedParser;
pub use store::HistoryStore;
pub use summarizer::{HttpSummarizer, Summarize};
pub use types::*;
