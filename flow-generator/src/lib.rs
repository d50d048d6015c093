pub mod allocator;
pub mod app;
pub mod bypass;
pub mod config;
pub mod dedup;
pub mod discovery;
pub mod eviction;
pub mod fetcher;
pub mod llm_adapter;
pub mod media;
pub mod notifier;
pub mod orchestrator;
pub mod parser;
pub mod publish;
pub mod scraper;
pub mod session;
pub mod sources;
pub mod store;
pub mod telegram;
pub mod traits;
pub mod transformer;
pub mod types;
pub mod utils;

pub use app::Engine;
pub use config::GeneratorConfig;
pub use dedup::{DedupGate, InsertOutcome};
pub use eviction::FlowVolumeEvictor;
pub use fetcher::Fetcher;
pub use media::MediaStore;
pub use orchestrator::{GenerationOrchestrator, RunOptions, RunReport, RunState};
pub use parser::FeedParser;
pub use publish::PublishCoordinator;
pub use store::{MemoryStore, PgStore};
pub use transformer::ContentTransformer;
pub use types::*;
