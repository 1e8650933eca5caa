//! gRPC client polling the health service.
//!
//! Start the server first:
//! ```bash
//! cargo run -p service-kit-grpc --example health_server
//! ```
//!
//! Then run this client:
//! ```bash
//! cargo run -p service-kit-grpc --example health_client
//! ```

use std::time::Duration;

use service_kit_grpc::{init_logging_from_env, Client, ClientConfig, MetadataInterceptor};
use tonic::metadata::MetadataValue;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::HealthCheckRequest;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env();

    let config = ClientConfig::builder()
        .with_dotenv()
        .address("127.0.0.1:50051")
        .timeout(Duration::from_secs(5))
        .build()?;

    let client = Client::builder(config)
        .interceptor(MetadataInterceptor::new("client_name", |mut req| {
            req.metadata_mut()
                .insert("x-client-name", MetadataValue::from_static("health-client"));
            Ok(req)
        }))
        .connect()
        .await?;

    let mut health = HealthClient::new(client);

    for service in ["", "demo.Worker"] {
        let response = health
            .check(HealthCheckRequest {
                service: service.to_string(),
            })
            .await?
            .into_inner();

        let status = ServingStatus::try_from(response.status)
            .map(|s| s.as_str_name())
            .unwrap_or("INVALID");
        println!("{service:?}: {status}");
    }

    Ok(())
}
