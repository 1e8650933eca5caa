//! gRPC server exposing only the health service.
//!
//! Run with:
//! ```bash
//! cargo run -p service-kit-grpc --example health_server
//! ```
//!
//! Check it with grpcurl (reflection is on in this example):
//! ```bash
//! grpcurl -plaintext localhost:50051 list
//! grpcurl -plaintext localhost:50051 grpc.health.v1.Health/Check
//! grpcurl -plaintext -d '{"service": "demo.Worker"}' localhost:50051 grpc.health.v1.Health/Watch
//! ```

use std::time::Duration;

use service_kit_grpc::{
    init_logging_from_env, run_until, shutdown_signal, HealthStatus, Server, ServerConfig,
};

const WORKER: &str = "demo.Worker";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env();

    let tracer_provider = service_kit::init_tracer_provider("health-server")?;

    let config: ServerConfig = ServerConfig::builder().with_dotenv().build()?;
    let config = config
        .with_address("127.0.0.1:50051")
        .with_reflection(true)
        .with_tracer_provider(tracer_provider)
        .with_graceful_shutdown_handler(|| async {
            tracing::info!("releasing worker resources");
            Ok(())
        });

    let server = Server::builder(config)
        .pre_start(|| {
            tracing::info!("warming caches before accepting calls");
            Ok(())
        })
        .payload_predicate(|call| call.method != "Watch")
        .build()?;

    // The worker reports healthy once it has finished starting up.
    let health = server.health().clone();
    health.set_serving_status(WORKER, HealthStatus::NotServing);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        health.set_serving_status(WORKER, HealthStatus::Serving);
    });

    run_until(&server, shutdown_signal()).await?;
    Ok(())
}
