//! Shared helpers for integration tests

#![allow(dead_code)]

use restload_ingest::config::{HttpConfig, PipelineConfig};
use restload_ingest::Record;
use serde_json::Value;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// HTTP settings pointed at a mock server, with short timeouts and delays
pub fn http_config(server: &MockServer) -> HttpConfig {
    HttpConfig {
        base_url: server.uri(),
        timeout_ms: 2_000,
        max_attempts: 3,
        retry_delay_ms: 10,
        ..HttpConfig::default()
    }
}

/// Pipeline settings for tests: mock server, memory destination
pub fn pipeline_config(server: &MockServer) -> PipelineConfig {
    let mut config = PipelineConfig {
        pipeline_name: "test_pipeline".to_string(),
        dataset_name: "test_data".to_string(),
        http: http_config(server),
        ..PipelineConfig::default()
    };
    config.workers.extract = 4;
    config
}

/// 200 response with a JSON body and an optional next link
pub fn page_response(body: Value, next: Option<&str>) -> ResponseTemplate {
    let response = ResponseTemplate::new(200).set_body_json(body);
    match next {
        Some(next) => response.insert_header("Link", format!(r#"<{next}>; rel="next""#).as_str()),
        None => response,
    }
}

/// Mount `/api/v1/<resource>?page=<n>` for each of `pages`, linking each
/// page to the next one
pub async fn mount_pages(server: &MockServer, resource: &str, pages: &[Value]) {
    for (i, body) in pages.iter().enumerate() {
        let number = i + 1;
        let next = (number < pages.len()).then(|| format!("/api/v1/{resource}?page={}", number + 1));

        Mock::given(method("GET"))
            .and(path(format!("/api/v1/{resource}")))
            .and(query_param("page", number.to_string()))
            .respond_with(page_response(body.clone(), next.as_deref()))
            .mount(server)
            .await;
    }
}

pub fn ids(records: &[Record]) -> Vec<i64> {
    records
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_i64))
        .collect()
}
