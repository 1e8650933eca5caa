mod common;

use std::time::Duration;

use common::{connect, eventually, local_config, spawn, unary, Slow, SLOW_WAIT};
use service_kit_grpc::{
    get_header, Client, Code, HealthStatus, MetadataInterceptor, Server, ServerConfig,
    ServerError,
};
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::HealthCheckRequest;

#[tokio::test]
async fn serve_fails_when_address_is_taken() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = taken.local_addr().unwrap().to_string();

    let server = Server::new(ServerConfig::default().with_address(address)).unwrap();
    let err = server.serve().await.unwrap_err();

    assert!(matches!(err, ServerError::Bind(_)), "{err}");
}

#[tokio::test]
async fn health_reports_process_serving() {
    let server = Server::new(local_config()).unwrap();
    server
        .health()
        .set_serving_status("test.Slow", HealthStatus::NotServing);
    let (server, addr, handle) = spawn(server).await;

    let mut health = HealthClient::new(connect(addr).await);
    let check = |service: &str| HealthCheckRequest {
        service: service.to_string(),
    };

    let process = health.check(check("")).await.unwrap().into_inner();
    assert_eq!(process.status, ServingStatus::Serving as i32);

    let slow = health.check(check("test.Slow")).await.unwrap().into_inner();
    assert_eq!(slow.status, ServingStatus::NotServing as i32);

    let unknown = health.check(check("never.Registered")).await.unwrap().into_inner();
    assert_eq!(unknown.status, ServingStatus::Unknown as i32);

    server.graceful_stop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn health_watch_streams_updates() {
    let (server, addr, handle) = spawn(Server::new(local_config()).unwrap()).await;

    let mut health = HealthClient::new(connect(addr).await);
    let mut updates = health
        .watch(HealthCheckRequest {
            service: "test.Slow".to_string(),
        })
        .await
        .unwrap()
        .into_inner();

    let first = updates.message().await.unwrap().unwrap();
    assert_eq!(first.status, ServingStatus::Unknown as i32);

    server
        .health()
        .set_serving_status("test.Slow", HealthStatus::Serving);
    let second = updates.message().await.unwrap().unwrap();
    assert_eq!(second.status, ServingStatus::Serving as i32);

    drop(updates);
    drop(health);
    server.stop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn graceful_stop_lets_in_flight_calls_finish() {
    let slow = Slow::new(Duration::from_millis(300));
    let mut server = Server::new(local_config()).unwrap();
    server.add_service(slow.clone());
    let (server, addr, handle) = spawn(server).await;

    let client = connect(addr).await;
    let calls: Vec<_> = (0..10)
        .map(|_| tokio::spawn(unary(client.clone(), SLOW_WAIT)))
        .collect();
    eventually(|| slow.started() == 10).await;

    let stopping = tokio::spawn({
        let server = server.clone();
        let slow = slow.clone();
        async move {
            server.graceful_stop().await;
            slow.finished()
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let late = tokio::time::timeout(Duration::from_secs(5), unary(client.clone(), SLOW_WAIT))
        .await
        .expect("late call settles");
    assert!(late.is_err(), "call accepted after stop began");

    assert_eq!(stopping.await.unwrap(), 10);
    assert_eq!(slow.started(), 10);

    for call in calls {
        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status, 1);
    }
    handle.await.unwrap().unwrap();

    let refused = Client::connect(common::client_config(addr), None).await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn stop_closes_in_flight_calls() {
    let slow = Slow::new(Duration::from_secs(30));
    let mut server = Server::new(local_config()).unwrap();
    server.add_service(slow.clone());
    let (server, addr, handle) = spawn(server).await;

    let call = tokio::spawn(unary(connect(addr).await, SLOW_WAIT));
    eventually(|| slow.started() == 1).await;

    tokio::time::timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("stop returns without waiting for calls");

    assert!(call.await.unwrap().is_err());
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn interceptor_rejection_reaches_the_client() {
    let require_tenant = MetadataInterceptor::new("tenant", |req| {
        get_header(req.metadata(), "x-tenant-id")?;
        Ok(req)
    });

    let mut server = Server::builder(local_config())
        .interceptor(require_tenant)
        .build()
        .unwrap();
    server.add_service(Slow::new(Duration::ZERO));
    let (server, addr, handle) = spawn(server).await;

    let status = unary(connect(addr).await, SLOW_WAIT).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("x-tenant-id"), "{}", status.message());

    server.graceful_stop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let (server, addr, handle) = spawn(Server::new(local_config()).unwrap()).await;

    let status = unary(connect(addr).await, "/test.Missing/Call")
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    server.graceful_stop().await;
    handle.await.unwrap().unwrap();
}

#[derive(Clone)]
struct Panicking;

impl tonic::server::NamedService for Panicking {
    const NAME: &'static str = "test.Panicking";
}

impl tower::Service<http::Request<tonic::body::BoxBody>> for Panicking {
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: http::Request<tonic::body::BoxBody>) -> Self::Future {
        Box::pin(futures::future::lazy(|_| -> Result<Self::Response, Self::Error> {
            panic!("handler exploded")
        }))
    }
}

#[tokio::test]
async fn handler_panic_becomes_internal_and_server_keeps_serving() {
    let mut server = Server::new(local_config()).unwrap();
    server.add_service(Panicking);
    server.add_service(Slow::new(Duration::ZERO));
    let (server, addr, handle) = spawn(server).await;
    let client = connect(addr).await;

    let status = unary(client.clone(), "/test.Panicking/Boom")
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("handler exploded"));

    let response = unary(client, SLOW_WAIT).await.unwrap();
    assert_eq!(response.status, 1);

    server.graceful_stop().await;
    handle.await.unwrap().unwrap();
}
