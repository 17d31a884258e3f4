use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use bangumid::api::{self, AppState};
use bangumid::auth::AuthService;
use bangumid::config::{component, ConfigRepo, EnvConfig};
use bangumid::db::{
    self, FontRepository, MagnetTaskRepository, RssRecordRepository, ScrapeTaskRepository,
    SubscriptionRepository, TorrentRepository, TransferRecordRepository,
};
use bangumid::downloader::{DownloadManager, DownloaderAdapter};
use bangumid::magnet::MagnetManager;
use bangumid::meta::TmdbClient;
use bangumid::notify::NotifyAdapter;
use bangumid::scraper::Scraper;
use bangumid::subscriber::Subscriber;
use bangumid::subtitle::{AssSubsetter, FontCatalog};
use bangumid::transfer::TransferEngine;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let env = EnvConfig::from_env();

    bangumid::logging::init(std::path::Path::new(&env.log_file_path), env.dev)
        .context("init logging")?;
    tracing::info!("starting bangumid");

    let pool = db::connect_with_retry(&env.db_path, Duration::from_secs(30)).await?;
    db::migrate(&pool).await.context("migrate database")?;
    tracing::info!(path = %env.db_path, "database ready");

    let config_repo = Arc::new(ConfigRepo::open(&env.config_file_path)?);
    let auth = AuthService::new(config_repo.clone()).context("init auth")?;

    let tmdb = Arc::new(TmdbClient::new(
        config_repo.component_config(component::TMDB)?,
    ));
    config_repo.register_reloadable(component::TMDB, tmdb.clone());

    let notifier = Arc::new(NotifyAdapter::new(
        config_repo.component_config(component::NOTICE)?,
    ));
    config_repo.register_reloadable(component::NOTICE, notifier.clone());

    let downloader = Arc::new(DownloaderAdapter::new(
        config_repo.component_config(component::DOWNLOADER)?,
    ));
    config_repo.register_reloadable(component::DOWNLOADER, downloader.clone());

    let torrents = TorrentRepository::new(pool.clone());
    let manager = DownloadManager::new(
        downloader.clone(),
        torrents.clone(),
        notifier.clone(),
        config_repo.component_config(component::DOWNLOAD_MANAGER)?,
    );
    config_repo.register_reloadable(component::DOWNLOAD_MANAGER, manager.clone());
    manager.start();

    let subscriber = Subscriber::new(
        tmdb.clone(),
        SubscriptionRepository::new(pool.clone()),
        RssRecordRepository::new(pool.clone()),
        manager.clone(),
        notifier.clone(),
        config_repo.component_config(component::SUBSCRIBER)?,
    );
    config_repo.register_reloadable(component::SUBSCRIBER, subscriber.clone());
    subscriber.start();

    let magnet = MagnetManager::new(
        manager.clone(),
        torrents.clone(),
        tmdb.clone(),
        MagnetTaskRepository::new(pool.clone()),
    );

    let catalog = FontCatalog::new(&env.font_dir, FontRepository::new(pool.clone()));
    if let Err(err) = catalog.warm().await {
        tracing::warn!(error = %err, "font catalog warm-up failed");
    }
    let subsetter = AssSubsetter::new(
        catalog,
        config_repo.component_config(component::SUBTITLE)?,
    );
    config_repo.register_reloadable(component::SUBTITLE, subsetter.clone());

    let scraper = Scraper::new(
        ScrapeTaskRepository::new(pool.clone()),
        tmdb.clone(),
        config_repo.component_config(component::SCRAPER)?,
    );
    config_repo.register_reloadable(component::SCRAPER, scraper.clone());
    scraper.start();

    let transfer = TransferEngine::new(
        torrents.clone(),
        TransferRecordRepository::new(pool.clone()),
        subscriber.clone(),
        magnet.clone(),
        scraper.clone(),
        notifier.clone(),
        subsetter.clone(),
        config_repo.component_config(component::TRANSFER)?,
    );
    config_repo.register_reloadable(component::TRANSFER, transfer.clone());
    transfer.start();

    let state = AppState {
        env,
        config_repo,
        auth,
        subscriber: subscriber.clone(),
        manager: manager.clone(),
        torrents,
        magnet,
        transfer: transfer.clone(),
        meta: tmdb,
        subsetter,
    };
    let app = api::router(state);

    let addr: SocketAddr = "[::]:6937".parse().expect("parse listen address");
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;
    let serve = axum::serve(listener, app).into_future();

    tokio::select! {
        result = serve => result.context("serve http")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            subscriber.close();
            manager.close();
            transfer.close();
            scraper.close();
        }
    }
    Ok(())
}
