use chainrag::api::{self, AppStateInner};
use chainrag::auth::AuthConfig;
use chainrag::config::Config;
use chainrag::jobs::Worker;
use chainrag::store::memory::MemoryStore;
use chainrag::store::Store;
use chainrag::{chat, embedding, rerank};

use axum::Router;
use clap::Parser;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tower_http::cors::CorsLayer;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "chainrag")]
#[command(about = "ChainRAG: retrieval-augmented Q&A over developer docs and on-chain contract references")]
struct Args {
    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory (used by the in-memory store's optional snapshot dump)
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Disable the background crawl/index job worker
    #[arg(long, default_value = "false")]
    disable_worker: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env(args.port, args.data_dir);
    info!(port = config.port, "starting chainrag");

    let store: Arc<dyn Store> = build_store(&config).await;

    let embeddings: Arc<dyn embedding::EmbeddingBackend> = match embedding::build_embedding_backend(&config.embedding) {
        Ok(backend) => Arc::from(backend),
        Err(e) => {
            warn!(error = %e, "failed to build configured embedding backend, falling back to a fake one");
            Arc::new(embedding::FakeEmbeddings::new(config.embedding.dim))
        }
    };

    let chat: Option<Arc<dyn chat::ChatProvider>> = Some(Arc::from(chat::build_chat_provider(&config.chat)));
    let reranker: Option<Arc<dyn rerank::Reranker>> = rerank::build_reranker(&config.rerank, config.rerank.base_url.clone()).map(Arc::from);

    let default_kb = store
        .get_or_create_kb("default", "docs")
        .await
        .expect("failed to provision the default knowledge base")
        .id;

    let mut model_map = HashMap::new();
    model_map.insert(config.chat.model.clone(), config.chat.model.clone());

    let worker = Arc::new(Worker::new(store.clone(), embeddings.clone(), &config));
    let auth = AuthConfig::new();
    let port = config.port;

    let state = Arc::new(AppStateInner {
        store: store.clone(),
        embeddings: embeddings.clone(),
        chat,
        reranker,
        worker: worker.clone(),
        chat_semaphore: Arc::new(Semaphore::new(config.max_concurrent_chat_requests.max(1))),
        default_kb,
        model_map,
        config,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if !args.disable_worker {
        let worker = worker.clone();
        tokio::spawn(worker.run(shutdown_rx));
    }

    let app = Router::new().merge(api::routes(state, auth)).layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind listen address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .expect("server error");
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

async fn build_store(config: &Config) -> Arc<dyn Store> {
    #[cfg(feature = "postgres")]
    {
        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            match chainrag::store::postgres::PostgresStore::connect(&database_url, config.embedding.dim).await {
                Ok(store) => return Arc::new(store),
                Err(e) => warn!(error = %e, "failed to connect to postgres, falling back to the in-memory store"),
            }
        }
    }
    let _ = config;
    Arc::new(MemoryStore::new())
}
