// tickerflow-server: exchange feed ingestion, aggregation and fan-out
use axum::{routing::get, Router};
use dotenvy::dotenv;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use tickerflow_common::{Config, MetricsCollector, Trade};
use tickerflow_server::{
    aggregator::{run_aggregator, CandleAggregator},
    auth::TokenMinter,
    bot_bridge::BotBridge,
    exchange_rest::ExchangeRestClient,
    handlers::{candles, health, metrics as metrics_handler, orderbook, time},
    hub::{start_pubsub_bridge, BroadcastHub, HubEvent, CLOSE_GOING_AWAY},
    orderbook::BookEngine,
    redis_conn::RedisHandle,
    registry::SubscriptionRegistry,
    state::{AppState, Lifecycle, ProcessState},
    store::CandleStore,
    updater::ContinuousUpdater,
    upstream::{UpstreamClient, UpstreamCommand, UpstreamEvent, UpstreamHealth},
    ws,
};

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tickerflow_server=info,tower_http=warn".to_string()),
        )
        .init();

    // Config or credential problems are fatal at startup, never mid-run.
    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting tickerflow-server v{}", env!("CARGO_PKG_VERSION"));

    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus metrics recorder");
    let metrics = Arc::new(MetricsCollector::new());
    let lifecycle = Arc::new(Lifecycle::new());

    // Explicit construction and wiring; the components only meet here.
    let redis = RedisHandle::connect(&config.redis.url).await;

    let minter = match (
        config.upstream.key_name.clone(),
        config.upstream.key_pem.clone(),
    ) {
        (Some(name), Some(pem)) => match TokenMinter::new(Some(name), Some(pem)) {
            Ok(minter) => Some(Arc::new(minter)),
            Err(e) => {
                error!("Credential error: {}", e);
                std::process::exit(1);
            }
        },
        _ => {
            warn!("No exchange credentials configured; running on public channels only");
            None
        }
    };

    let registry = Arc::new(SubscriptionRegistry::new());
    let hub = Arc::new(BroadcastHub::new(
        registry.clone(),
        metrics.clone(),
        config.server.candle_throttle_ms,
    ));
    let store = Arc::new(CandleStore::new(
        redis.clone(),
        metrics.clone(),
        config.features.redis_storage_enabled,
    ));
    let book = Arc::new(BookEngine::new(
        redis.clone(),
        config.orderbook.clone(),
        metrics.clone(),
    ));
    let rest = Arc::new(ExchangeRestClient::new(
        config.upstream.rest_url.clone(),
        minter.clone(),
        config.updater.min_request_interval_ms,
    ));
    let bot = match config.server.bot_ws_url.clone() {
        Some(url) => BotBridge::start(url),
        None => BotBridge::disabled(),
    };
    let upstream_health = Arc::new(UpstreamHealth::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (upstream_event_tx, upstream_event_rx) = mpsc::channel::<UpstreamEvent>(4096);
    let (upstream_cmd_tx, upstream_cmd_rx) = mpsc::channel::<UpstreamCommand>(128);
    let (hub_tx, hub_rx) = mpsc::channel::<HubEvent>(4096);

    // One aggregation task per configured product.
    let mut trade_txs: HashMap<String, mpsc::Sender<Trade>> = HashMap::new();
    let mut aggregator_handles = Vec::new();
    for product in &config.upstream.products {
        let (trade_tx, trade_rx) = mpsc::channel::<Trade>(1024);
        trade_txs.insert(product.clone(), trade_tx);
        aggregator_handles.push(tokio::spawn(run_aggregator(
            CandleAggregator::new(product.clone()),
            trade_rx,
            hub_tx.clone(),
            store.clone(),
            metrics.clone(),
        )));
    }

    // Event router: upstream frames to the aggregators, book engine and hub.
    let router_handle = tokio::spawn(route_upstream_events(
        upstream_event_rx,
        trade_txs,
        book.clone(),
        hub_tx.clone(),
        shutdown_rx.clone(),
    ));

    // Upstream socket supervisor.
    let upstream = UpstreamClient::new(
        config.upstream.clone(),
        minter.clone(),
        upstream_event_tx,
        upstream_health.clone(),
        metrics.clone(),
    );
    let upstream_handle = tokio::spawn(upstream.run(upstream_cmd_rx));

    // The book and heartbeat channels cover every configured product from
    // the start; trades and tickers follow client demand.
    for product in &config.upstream.products {
        let _ = upstream_cmd_tx
            .send(UpstreamCommand::SubscribeBook(product.clone()))
            .await;
        let _ = upstream_cmd_tx
            .send(UpstreamCommand::SubscribeHeartbeats(product.clone()))
            .await;
    }

    let hub_handle = hub.start(hub_rx, shutdown_rx.clone());
    let pubsub_handle = start_pubsub_bridge(
        config.redis.url.clone(),
        hub_tx.clone(),
        shutdown_rx.clone(),
    );
    let prune_handle = book.start_pruning();
    let sweep_handle = registry.start_expiry_sweep();
    let renewal_handle = minter
        .as_ref()
        .map(|m| m.start_auto_renewal(|token| debug!("Token renewed until {}", token.expires_at)));

    let updater = Arc::new(ContinuousUpdater::new(
        store.clone(),
        rest.clone(),
        hub_tx.clone(),
        config.updater.clone(),
        metrics.clone(),
    ));
    let updater_handles = updater.spawn_all(&config.upstream.products, shutdown_rx.clone());

    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        hub: hub.clone(),
        book,
        store,
        rest,
        redis,
        upstream_tx: upstream_cmd_tx.clone(),
        upstream_health,
        bot,
        metrics,
        prometheus,
        lifecycle: lifecycle.clone(),
    };

    let app = Router::new()
        .route("/ws", get(ws::websocket_handler))
        .route("/api/orderbook/:product", get(orderbook::get_orderbook))
        .route(
            "/api/orderbook/:product/range",
            get(orderbook::get_orderbook_range),
        )
        .route(
            "/api/orderbook/:product/top",
            get(orderbook::get_orderbook_top),
        )
        .route("/api/candles/:pair/:granularity", get(candles::get_candles))
        .route("/api/time", get(time::get_time))
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics_handler::prometheus_metrics))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = match format!("{}:{}", config.server.host, config.server.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid bind address: {}", e);
            std::process::exit(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("Listening on {}", addr);
    lifecycle.set(ProcessState::Running);

    // Drain coordinator: flips the shutdown watch on SIGINT/SIGTERM and
    // arms the watchdog.
    let drain_lifecycle = lifecycle.clone();
    let drain_hub = hub.clone();
    let drain_upstream_tx = upstream_cmd_tx.clone();
    let drain_shutdown_tx = shutdown_tx.clone();
    let drain_watchdog_secs = config.server.shutdown_watchdog_secs;
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received; draining");
        drain_lifecycle.set(ProcessState::Draining);

        // Leaves first: updaters, hub sources and the pub/sub bridge all
        // watch this channel.
        let _ = drain_shutdown_tx.send(true);
        drain_hub.close_all(CLOSE_GOING_AWAY);
        let _ = drain_upstream_tx.send(UpstreamCommand::Shutdown).await;

        // Watchdog: force exit if draining stalls.
        tokio::time::sleep(Duration::from_secs(drain_watchdog_secs)).await;
        error!("Drain watchdog fired after {}s; forcing exit", drain_watchdog_secs);
        std::process::exit(1);
    });

    let mut serve_shutdown = shutdown_rx.clone();
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await;

    if let Err(e) = serve_result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    // Join the pipeline tasks; the watchdog forces exit if this stalls.
    if let Some(handle) = renewal_handle {
        handle.abort();
    }
    prune_handle.abort();
    sweep_handle.abort();
    for handle in updater_handles {
        let _ = handle.await;
    }
    let _ = router_handle.await;
    for handle in aggregator_handles {
        let _ = handle.await;
    }
    let _ = hub_handle.await;
    let _ = pubsub_handle.await;
    let _ = upstream_handle.await;

    lifecycle.set(ProcessState::Stopped);
    info!("Shutdown complete");
}

/// Route decoded upstream events to the per-product aggregators, the book
/// engine and the broadcast hub.
async fn route_upstream_events(
    mut event_rx: mpsc::Receiver<UpstreamEvent>,
    trade_txs: HashMap<String, mpsc::Sender<Trade>>,
    book: Arc<BookEngine>,
    hub_tx: mpsc::Sender<HubEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = event_rx.recv() => event,
            _ = shutdown.changed() => {
                debug!("Event router stopping");
                return;
            }
        };
        let Some(event) = event else {
            debug!("Upstream event channel closed");
            return;
        };

        match event {
            UpstreamEvent::Trade(trade) => match trade_txs.get(&trade.product) {
                Some(tx) => {
                    if tx.send(trade).await.is_err() {
                        warn!("Aggregator channel closed");
                    }
                }
                None => debug!("Trade for unconfigured product {}", trade.product),
            },
            UpstreamEvent::Ticker(ticker) => {
                let _ = hub_tx.send(HubEvent::Ticker(ticker)).await;
            }
            UpstreamEvent::Book(book_event) => {
                // Single writer: every Redis book mutation happens here, in
                // upstream arrival order.
                let result = match &book_event {
                    tickerflow_common::BookEvent::Snapshot { product, bids, asks } => {
                        book.apply_snapshot(product, bids, asks).await
                    }
                    tickerflow_common::BookEvent::Update { product, changes } => {
                        book.apply_delta(product, changes).await
                    }
                };
                if let Err(e) = result {
                    warn!("Book write failed: {}", e);
                }
                let _ = hub_tx.send(HubEvent::Book(book_event)).await;
            }
            UpstreamEvent::SubscriptionsAck => {
                debug!("Upstream acknowledged subscriptions");
            }
            UpstreamEvent::GaveUp => {
                error!("Upstream connection gave up; live data halted until next subscribe");
            }
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
