//  MAIN.rs
//    by Lut99
//
//  Created:
//    18 Mar 2024, 11:50:17
//  Last edited:
//    31 Jul 2024, 17:58:26
//  Auto updated?
//    Yes
//
//  Description:
//!   Entrypoint to the `servitor-mst` service.
//

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use log::{error, info, warn, LevelFilter};
use servitor_mst::dispatcher::Dispatcher;
use servitor_mst::grpc::{MasterHandler, PredictHandler};
use servitor_mst::heartbeat::Watcher;
use servitor_mst::registry::WorkerRegistry;
use servitor_mst::rest;
use servitor_mst::spec::{HeartbeatConfig, DEFAULT_CREDIT_ROUND, DEFAULT_MAX_ENQUEUED_REQUESTS};
use specifications::serving::PredictServiceServer;
use specifications::working::MasterServiceServer;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tonic::transport::Server;


/***** ARGUMENTS *****/
/// Defines the arguments that may be given to the service.
#[derive(Parser)]
#[clap(name = "Servitor master service", version = env!("CARGO_PKG_VERSION"), author, about = "The serving master: accepts predict requests over gRPC and HTTP and multiplexes them across the registered model workers.")]
struct Opts {
    /// Print debug info
    #[clap(long, action, help = "If given, prints additional logging information.", env = "DEBUG")]
    debug: bool,

    /// Where the client-facing gRPC frontend binds.
    #[clap(short, long, default_value = "127.0.0.1:5500", help = "The address on which clients may send predict calls.", env = "PREDICT_ADDRESS")]
    predict_address: SocketAddr,
    /// Where the worker-facing gRPC frontend binds.
    #[clap(short, long, default_value = "127.0.0.1:6100", help = "The address on which workers register and report.", env = "MASTER_ADDRESS")]
    master_address:  SocketAddr,
    /// Where the HTTP/JSON frontend binds.
    #[clap(short, long, default_value = "127.0.0.1:1500", help = "The address on which the REST frontend accepts predict calls.", env = "REST_ADDRESS")]
    rest_address:    SocketAddr,

    /// The admission cap.
    #[clap(
        long,
        default_value_t = DEFAULT_MAX_ENQUEUED_REQUESTS,
        help = "The soft cap on requests pending in the master at once; anything above it is refused outright.",
        env = "MAX_ENQUEUED_REQUESTS"
    )]
    max_enqueued_requests: u32,
    /// The per-worker credit.
    #[clap(
        long,
        default_value_t = DEFAULT_CREDIT_ROUND,
        help = "How many predict calls the master may have in flight to one worker at once.",
        env = "CREDIT_ROUND"
    )]
    credit_round: i64,

    /// Whether to probe workers for liveness.
    #[clap(long, action, help = "If given, periodically pings every worker and drops the ones that stop answering.", env = "HEARTBEAT")]
    heartbeat: bool,
    /// The total heart-beat patience, in milliseconds.
    #[clap(long, default_value = "10000", help = "The total time (ms) a worker may stay silent before it is given up on.", env = "HEARTBEAT_TIMEOUT_MS")]
    heartbeat_timeout_ms: u64,
    /// How many probes fit in the patience window.
    #[clap(long, default_value = "10", help = "The number of consecutive missed pongs after which a worker is given up on.", env = "HEARTBEAT_PING_TIMES")]
    heartbeat_ping_times: u32,
    /// The per-ping deadline, in microseconds.
    #[clap(long, default_value = "100", help = "The deadline (us) carried by every individual ping.", env = "HEARTBEAT_DEADLINE_US")]
    heartbeat_deadline_us: u64,
}





/***** HELPER FUNCTIONS *****/
/// Waits until the service receives a SIGTERM, to be Docker-friendly.
async fn wait_for_sigterm() {
    let mut handler: Signal = match signal(SignalKind::terminate()) {
        Ok(handler) => handler,
        Err(err) => {
            error!("Failed to register SIGTERM signal handler: {err}");
            warn!("Service will NOT shutdown gracefully on SIGTERM");
            loop {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
            }
        },
    };
    handler.recv().await;
    info!("Received SIGTERM, shutting down gracefully...");
}





/***** ENTRY POINT *****/
#[tokio::main]
async fn main() {
    dotenv().ok();
    let opts = Opts::parse();

    // Configure logger.
    let mut logger = env_logger::builder();
    logger.format_module_path(false);
    if opts.debug {
        logger.filter_level(LevelFilter::Debug).init();
    } else {
        logger.filter_level(LevelFilter::Info).init();
    }
    info!("Initializing servitor-mst v{}...", env!("CARGO_PKG_VERSION"));

    // Build the dispatcher core
    let registry = WorkerRegistry::new(opts.credit_round);
    let dispatcher = Dispatcher::new(registry.clone(), opts.max_enqueued_requests);
    let watcher: Option<Arc<Watcher>> = if opts.heartbeat {
        let config: HeartbeatConfig = HeartbeatConfig {
            max_time_out:   Duration::from_millis(opts.heartbeat_timeout_ms),
            max_ping_times: opts.heartbeat_ping_times.max(1),
            ping_deadline:  Duration::from_micros(opts.heartbeat_deadline_us),
        };
        let watcher: Arc<Watcher> = Watcher::new(registry.clone(), config);
        watcher.clone().spawn();
        Some(watcher)
    } else {
        None
    };

    // The REST frontend binds first, so address clashes surface before anything serves
    info!("REST frontend ready to serve on '{}'", opts.rest_address);
    let rest_server = match warp::serve(rest::routes(dispatcher.clone())).try_bind_with_graceful_shutdown(opts.rest_address, wait_for_sigterm())
    {
        Ok((addr, server)) => {
            info!("Now serving REST @ '{addr}'");
            server
        },
        Err(err) => {
            error!("Failed to serve REST frontend at '{}': {}", opts.rest_address, err);
            std::process::exit(1);
        },
    };

    // Then the two gRPC frontends
    info!("gRPC predict frontend ready to serve on '{}'", opts.predict_address);
    let predict_server = Server::builder()
        .add_service(PredictServiceServer::new(PredictHandler::new(dispatcher.clone())))
        .serve_with_shutdown(opts.predict_address, wait_for_sigterm());
    info!("gRPC master frontend ready to serve on '{}'", opts.master_address);
    let master_server = Server::builder()
        .add_service(MasterServiceServer::new(MasterHandler::new(dispatcher.clone(), watcher)))
        .serve_with_shutdown(opts.master_address, wait_for_sigterm());

    let (predict_res, master_res, _) = tokio::join!(predict_server, master_server, rest_server);
    if let Err(err) = predict_res {
        error!("Failed to serve gRPC predict frontend: {err}");
        std::process::exit(1);
    }
    if let Err(err) = master_res {
        error!("Failed to serve gRPC master frontend: {err}");
        std::process::exit(1);
    }

    // Complete whatever is still pending with the stopped-servable error before going down
    registry.shutdown().await;
    info!("Bye.");
}
