use std::process;
use std::sync::Arc;

use serde_json::json;

use tidemq::config::AppConfig;
use tidemq::context::BrokerContext;
use tidemq::logging::{LogLevel, Logger, LoggerConfig};
use tidemq::manager::QueueManager;
use tidemq::server::BrokerServer;
use tidemq::shutdown::ShutdownHooks;
use tidemq::storage::StorageFacade;
use tidemq::sweeper::ExpirationSweeper;
use tidemq::utils::runtime::ensure_posix_or_exit;
use tidemq::utils::startup_banner::print_startup_banner;
use tidemq::utils::timing::measure_execution;
use tidemq::wire::codec::WireCodec;

fn main() {
    ensure_posix_or_exit();

    let app_config = load_config_or_exit();
    print_startup_banner(&app_config);

    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });
    let logger = Arc::new(Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    }));

    let storage = StorageFacade::initialize(&app_config, &logger).unwrap_or_else(|error| {
        eprintln!("storage initialization error: {error}");
        process::exit(2);
    });
    let storage = Arc::new(storage);
    let backup_dir = storage.backup_path().to_path_buf();

    let manager = QueueManager::new(&app_config, Arc::clone(&storage), Arc::clone(&logger))
        .unwrap_or_else(|error| {
            eprintln!("queue manager configuration error: {error}");
            process::exit(2);
        });
    let manager = Arc::new(manager);
    let restored = measure_execution("queues.restore", Some("main::startup"), &logger, || {
        manager.restore_all(&backup_dir)
    })
    .unwrap_or_else(|error| {
        eprintln!("queue restore error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::startup"),
        "Queue manager ready",
        Some(json!({
            "manager": manager.name(),
            "restored_messages": restored,
            "backup_path": backup_dir.display().to_string()
        })),
    );

    let wire_codec = WireCodec::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("wire codec configuration error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::wire"),
        "Wire codec initialized",
        Some(json!({
            "max_envelope_size_bytes": wire_codec.max_envelope_size_bytes()
        })),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let mut sweeper =
        ExpirationSweeper::from_app_config(Arc::clone(&manager), Arc::clone(&logger), &app_config)
            .unwrap_or_else(|error| {
                eprintln!("sweeper configuration error: {error}");
                process::exit(2);
            });
    if let Err(error) = sweeper.start() {
        eprintln!("sweeper startup error: {error}");
        process::exit(2);
    }
    logger.log(
        LogLevel::Info,
        Some("main::sweeper"),
        "Expiration sweeper started",
        Some(sweeper.initial_metadata_payload()),
    );

    let app_config = Arc::new(app_config);
    let context = BrokerContext::new(
        Arc::clone(&app_config),
        Arc::clone(&logger),
        Arc::clone(&manager),
        shutdown_hooks.signal(),
        wire_codec,
    );
    let server = BrokerServer::bind(context).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} queue manager {} accepting connections",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            manager.name()
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "local_queues": manager.local_queue_names(),
            "remote_routes": app_config.remote.routes.len()
        })),
    );

    if let Err(error) = server.run() {
        logger.error(Some("main::server"), &format!("accept loop failed: {error}"));
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    server.shutdown_all_connections();
    drop(server);
    if let Err(error) = sweeper.stop() {
        logger.warn(Some("main::shutdown"), &error.to_string());
    }

    let report = measure_execution("queues.backup", Some("main::shutdown"), &logger, || {
        manager.backup_all(&backup_dir)
    });
    if let Err(error) = storage.flush() {
        eprintln!("storage flush error during shutdown: {error}");
        process::exit(2);
    }
    if report.failed > 0 {
        logger.warn(
            Some("main::shutdown"),
            &format!("{} queue(s) could not be backed up", report.failed),
        );
    }

    logger.info(
        Some("main::shutdown"),
        "TCP server stopped and shutdown completed",
    );
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}
