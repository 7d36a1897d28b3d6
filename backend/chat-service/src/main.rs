use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use anyhow::Context;
use chat_service::config::Config;
use chat_service::handlers::{self, AppState};
use chat_service::logging;
use chat_service::metrics;
use chat_service::outbox::jobs::{
    client_message_blocked::ClientMessageBlockedJob, client_message_sent::ClientMessageSentJob,
    close_chat::CloseChatJob, manager_assigned_to_problem::ManagerAssignedToProblemJob,
    send_client_message::SendClientMessageJob, send_manager_message::SendManagerMessageJob,
};
use chat_service::outbox::OutboxService;
use chat_service::services::afc_verdicts::AfcVerdictProcessor;
use chat_service::services::client_chat::ClientChatService;
use chat_service::services::event_stream::EventStream;
use chat_service::services::manager_chat::ManagerChatService;
use chat_service::services::manager_load::ManagerLoadService;
use chat_service::services::manager_pool::ManagerPool;
use chat_service::services::manager_scheduler::ManagerScheduler;
use chat_service::services::msg_producer::MessageProducer;
use chat_service::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = Config::from_env().context("load configuration")?;
    tracing::info!(env = %config.app.env, "starting chat service");

    let store = Store::connect(&config.database)
        .await
        .context("connect to database")?;
    store.run_migrations().await.context("run migrations")?;

    let event_stream = EventStream::new();
    let manager_pool = Arc::new(ManagerPool::new());
    let manager_load = Arc::new(ManagerLoadService::new(
        store.clone(),
        config.manager_load.max_problems_at_time,
    ));
    let producer =
        Arc::new(MessageProducer::new(&config.producer).context("create message producer")?);

    let outbox = Arc::new(OutboxService::new(store.clone(), &config.outbox));
    outbox
        .register_job(Arc::new(SendClientMessageJob::new(
            store.clone(),
            Arc::clone(&producer),
            event_stream.clone(),
        )))
        .and_then(|_| {
            outbox.register_job(Arc::new(SendManagerMessageJob::new(
                store.clone(),
                Arc::clone(&producer),
                event_stream.clone(),
            )))
        })
        .and_then(|_| {
            outbox.register_job(Arc::new(ClientMessageSentJob::new(
                store.clone(),
                event_stream.clone(),
            )))
        })
        .and_then(|_| {
            outbox.register_job(Arc::new(ClientMessageBlockedJob::new(
                store.clone(),
                event_stream.clone(),
            )))
        })
        .and_then(|_| {
            outbox.register_job(Arc::new(ManagerAssignedToProblemJob::new(
                store.clone(),
                Arc::clone(&manager_load),
                event_stream.clone(),
            )))
        })
        .and_then(|_| {
            outbox.register_job(Arc::new(CloseChatJob::new(
                store.clone(),
                event_stream.clone(),
            )))
        })
        .context("register outbox jobs")?;

    let afc = Arc::new(
        AfcVerdictProcessor::new(config.afc.clone(), store.clone(), Arc::clone(&outbox))
            .context("create afc verdict processor")?,
    );
    let scheduler = ManagerScheduler::new(
        store.clone(),
        Arc::clone(&manager_pool),
        Arc::clone(&outbox),
        config.scheduler.idle_duration(),
    );

    let shutdown = CancellationToken::new();

    let outbox_task = tokio::spawn(Arc::clone(&outbox).run(shutdown.clone()));
    let afc_task = {
        let afc = Arc::clone(&afc);
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = afc.run(cancel).await {
                tracing::error!(error = %e, "afc verdict processor failed");
            }
        })
    };
    let scheduler_task = {
        let cancel = shutdown.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    let app_state = web::Data::new(AppState {
        client_chat: ClientChatService::new(store.clone(), Arc::clone(&outbox)),
        manager_chat: ManagerChatService::new(
            store.clone(),
            Arc::clone(&outbox),
            Arc::clone(&manager_pool),
            Arc::clone(&manager_load),
        ),
        event_stream: event_stream.clone(),
        ws_ping_period: config.websocket.ping_period(),
        shutdown: shutdown.clone(),
    });

    let allow_origins = config.app.allow_origins.clone();
    let addr = ("0.0.0.0", config.app.port);
    tracing::info!(port = config.app.port, "starting http server");

    let server = HttpServer::new(move || {
        let cors = if allow_origins.is_empty() {
            Cors::permissive()
        } else {
            allow_origins
                .iter()
                .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
                .allow_any_method()
                .allow_any_header()
        };

        App::new()
            .app_data(app_state.clone())
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .route("/health", web::get().to(|| async { HttpResponse::Ok().body("OK") }))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .configure(handlers::client::register_routes)
            .configure(handlers::manager::register_routes)
            .configure(handlers::websocket::register_routes)
    })
    .disable_signals()
    .shutdown_timeout(3)
    .bind(addr)
    .with_context(|| format!("bind {addr:?}"))?
    .run();

    let server_handle = server.handle();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.cancel();
                server_handle.stop(true).await;
            }
        });
    }

    server.await.context("http server")?;

    // The signal handler already cancelled on ctrl-c; cancel again in case
    // the server stopped for another reason.
    shutdown.cancel();
    event_stream.close();
    manager_pool.close();

    let drain = async {
        let _ = outbox_task.await;
        let _ = afc_task.await;
        let _ = scheduler_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(60), drain).await.is_err() {
        tracing::warn!("background tasks did not drain in time");
    }

    tracing::info!("chat service stopped");

    Ok(())
}
