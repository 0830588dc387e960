use ingest_server::models::ApiResponse;
use ingest_server::routes::health::{HealthResponse, health_check};
use ingest_server::test_support::TestRocketBuilder;
use rocket::http::Status;
use rocket::routes;

#[test]
fn health_endpoint_returns_ok() {
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![health_check])
        .blocking_client();

    let response = client.get("/api/v1/health").dispatch();
    assert_eq!(response.status(), Status::Ok);

    let payload: ApiResponse<HealthResponse> = response.into_json().expect("valid JSON payload");
    assert_eq!(payload.data.status, "ok");
}

#[test]
fn health_reports_service_identity() {
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![health_check])
        .blocking_client();

    let payload: ApiResponse<HealthResponse> = client
        .get("/api/v1/health")
        .dispatch()
        .into_json()
        .expect("valid JSON payload");
    assert_eq!(payload.data.service, "ingest-server");
    assert!(!payload.data.version.is_empty());
}
