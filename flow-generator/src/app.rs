use crate::bypass::BypassFetcher;
use crate::config::GeneratorConfig;
use crate::dedup::DedupGate;
use crate::discovery::FeedDiscovery;
use crate::eviction::FlowVolumeEvictor;
use crate::fetcher::Fetcher;
use crate::llm_adapter::{LlmClient, OpenAiClient};
use crate::media::MediaStore;
use crate::notifier::LogNotifier;
use crate::orchestrator::{GenerationDeps, GenerationOrchestrator};
use crate::publish::PublishCoordinator;
use crate::scraper::ArticleScraper;
use crate::session::{GatewayConnector, SessionHandle};
use crate::sources::{ChannelSourceReader, WebSourceReader};
use crate::telegram::{BotApi, TelegramNotifier, TelegramPublisher};
use crate::traits::{ChannelPublisher, FlowRepository, Notifier, PostRepository, QuotaLedger};
use crate::transformer::ContentTransformer;
use crate::types::{GeneratorError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

/// Fully wired engine over one store.
pub struct Engine {
    pub orchestrator: GenerationOrchestrator,
    pub web_reader: Arc<WebSourceReader>,
    publisher: Option<PublishCoordinator>,
    session: Arc<SessionHandle>,
}

impl Engine {
    pub fn build<S>(config: GeneratorConfig, store: Arc<S>) -> Result<Self>
    where
        S: FlowRepository + PostRepository + QuotaLedger + 'static,
    {
        let flows: Arc<dyn FlowRepository> = store.clone();
        let posts: Arc<dyn PostRepository> = store.clone();
        let quota: Arc<dyn QuotaLedger> = store;

        let bot = match config.telegram.bot_token {
            Some(_) => Some(Arc::new(BotApi::new(&config.telegram)?)),
            None => None,
        };
        let notifier: Arc<dyn Notifier> = match &bot {
            Some(api) => Arc::new(TelegramNotifier::new(api.clone(), &config.telegram)),
            None => {
                info!("No bot token configured, notifications go to the log");
                Arc::new(LogNotifier)
            }
        };

        let fetcher = Arc::new(Fetcher::new(config.fetch.clone())?);
        let bypass = Arc::new(BypassFetcher::new(config.bypass.clone())?);
        let discovery = FeedDiscovery::new(fetcher.clone(), notifier.clone(), config.discovery.clone());
        let scraper = ArticleScraper::new(fetcher.clone(), bypass, config.scraper.clone());
        let web_reader = Arc::new(WebSourceReader::new(
            fetcher,
            discovery,
            scraper,
            flows.clone(),
            posts.clone(),
            config.scraper.clone(),
        ));

        let media = Arc::new(MediaStore::new(config.media.clone())?);
        let session = Arc::new(SessionHandle::new(Arc::new(GatewayConnector::new(
            config.session.clone(),
        ))));
        let downloads = Arc::new(Semaphore::new(config.session.download_concurrency.max(1)));
        let channel_reader = Arc::new(
            ChannelSourceReader::new(session.clone(), posts.clone(), downloads, media.temp_dir().to_path_buf())
                .with_window(config.session.history_multiplier, config.session.album_window),
        );

        let llm: Arc<dyn LlmClient> = Arc::new(
            OpenAiClient::new(config.llm.clone()).map_err(|e| GeneratorError::Config(e.to_string()))?,
        );
        let transformer = Arc::new(ContentTransformer::new(llm, notifier.clone(), config.transform.clone()));

        let orchestrator = GenerationOrchestrator::new(
            GenerationDeps {
                flows: flows.clone(),
                quota,
                notifier,
                channel_reader,
                web_reader: web_reader.clone(),
                transformer,
                media: media.clone(),
                dedup: DedupGate::new(posts.clone()),
                evictor: FlowVolumeEvictor::new(posts.clone(), media.clone()),
            },
            config.run.clone(),
        );

        let publisher = bot.map(|api| {
            let channel: Arc<dyn ChannelPublisher> = Arc::new(TelegramPublisher::new(api));
            PublishCoordinator::new(posts, flows, channel, media, config.publish.clone())
        });

        Ok(Self {
            orchestrator,
            web_reader,
            publisher,
            session,
        })
    }

    pub fn publisher(&self) -> Result<&PublishCoordinator> {
        self.publisher
            .as_ref()
            .ok_or_else(|| GeneratorError::Config("publishing needs TELEGRAM_BOT_TOKEN".to_string()))
    }

    /// Closes the messaging session if a run opened it.
    pub async fn shutdown(&self) {
        self.session.close().await;
    }
}
