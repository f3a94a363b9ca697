//! Pagination and retry behaviour against a mock API

mod common;

use common::{http_config, ids, mount_pages, page_response};
use futures::StreamExt;
use restload_ingest::error::HttpError;
use restload_ingest::fetcher::ResourceFetcher;
use restload_ingest::{FetchError, Page, Paginator, Resource};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn start_url(server: &MockServer, resource: &str) -> Url {
    Url::parse(&format!("{}/api/v1/{resource}?page=1", server.uri())).unwrap()
}

async fn collect(paginator: &Paginator, url: Url) -> Vec<Result<Page, FetchError>> {
    paginator.pages(url).collect().await
}

#[tokio::test]
async fn test_yields_every_page_in_order() {
    let server = MockServer::start().await;
    mount_pages(
        &server,
        "widgets",
        &[
            json!([{"id": 1}, {"id": 2}]),
            json!([{"id": 3}]),
            json!([{"id": 4}, {"id": 5}]),
        ],
    )
    .await;

    let paginator = Paginator::new(&http_config(&server), CancellationToken::new()).unwrap();
    let pages = collect(&paginator, start_url(&server, "widgets")).await;

    assert_eq!(pages.len(), 3);
    let pages: Vec<Page> = pages.into_iter().map(Result::unwrap).collect();
    assert_eq!(pages.iter().map(|p| p.number).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(ids(&pages[2].records), vec![4, 5]);
    assert!(pages[2].next_cursor.is_none());
    assert_eq!(
        pages[0].next_cursor.as_ref().map(Url::as_str),
        Some(format!("{}/api/v1/widgets?page=2", server.uri()).as_str())
    );
}

#[tokio::test]
async fn test_fetcher_flattens_records_across_pages() {
    let server = MockServer::start().await;
    mount_pages(
        &server,
        "widgets",
        &[json!([{"id": 1}, {"id": 2}]), json!({"data": [{"id": 3}]})],
    )
    .await;

    let config = http_config(&server);
    let fetcher = ResourceFetcher::new(Paginator::new(&config, CancellationToken::new()).unwrap());
    let resource = Resource::new("widgets", "id");
    let url = fetcher.start_url(&resource).unwrap();

    let records: Vec<_> = fetcher
        .records(&resource, url)
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(ids(&records), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_fetcher_keeps_keyed_object_whole() {
    let server = MockServer::start().await;
    mount_pages(
        &server,
        "orders",
        &[json!({"id": 7, "items": [{"sku": "JAF-001"}, {"sku": "JAF-002"}]})],
    )
    .await;

    let config = http_config(&server);
    let fetcher = ResourceFetcher::new(Paginator::new(&config, CancellationToken::new()).unwrap());
    let resource = Resource::new("orders", "id");
    let url = fetcher.start_url(&resource).unwrap();

    let records: Vec<_> = fetcher
        .records(&resource, url)
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(ids(&records), vec![7]);
    assert_eq!(records[0]["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/widgets"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;
    mount_pages(&server, "widgets", &[json!([{"id": 1}, {"id": 2}])]).await;

    let paginator = Paginator::new(&http_config(&server), CancellationToken::new()).unwrap();
    let pages = collect(&paginator, start_url(&server, "widgets")).await;

    assert_eq!(pages.len(), 1);
    assert_eq!(ids(&pages[0].as_ref().unwrap().records), vec![1, 2]);
}

#[tokio::test]
async fn test_exhaustion_makes_exactly_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/widgets"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let paginator = Paginator::new(&http_config(&server), CancellationToken::new()).unwrap();
    let pages = collect(&paginator, start_url(&server, "widgets")).await;

    assert_eq!(pages.len(), 1);
    match &pages[0] {
        Err(FetchError::Exhausted {
            attempts,
            last_cause,
            ..
        }) => {
            assert_eq!(*attempts, 3);
            assert_eq!(*last_cause, HttpError::Status { status: 500 });
        },
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_client_errors_fail_fast() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/widgets"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let paginator = Paginator::new(&http_config(&server), CancellationToken::new()).unwrap();
    let pages = collect(&paginator, start_url(&server, "widgets")).await;

    assert!(matches!(
        pages[..],
        [Err(FetchError::Rejected {
            cause: HttpError::Status { status: 404 },
            ..
        })]
    ));
}

#[tokio::test]
async fn test_client_errors_retried_when_enabled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/widgets"))
        .respond_with(ResponseTemplate::new(404))
        .expect(3)
        .mount(&server)
        .await;

    let mut config = http_config(&server);
    config.retry_client_errors = true;
    let paginator = Paginator::new(&config, CancellationToken::new()).unwrap();
    let pages = collect(&paginator, start_url(&server, "widgets")).await;

    assert!(matches!(pages[..], [Err(FetchError::Exhausted { attempts: 3, .. })]));
}

#[tokio::test]
async fn test_timeouts_count_as_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/widgets"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .expect(2)
        .mount(&server)
        .await;

    let mut config = http_config(&server);
    config.timeout_ms = 100;
    config.max_attempts = 2;
    let paginator = Paginator::new(&config, CancellationToken::new()).unwrap();
    let pages = collect(&paginator, start_url(&server, "widgets")).await;

    assert!(matches!(
        pages[..],
        [Err(FetchError::Exhausted {
            last_cause: HttpError::Timeout(100),
            ..
        })]
    ));
}

#[tokio::test]
async fn test_empty_first_page_ends_sequence() {
    let server = MockServer::start().await;
    mount_pages(&server, "widgets", &[json!([])]).await;

    let paginator = Paginator::new(&http_config(&server), CancellationToken::new()).unwrap();
    let pages = collect(&paginator, start_url(&server, "widgets")).await;

    assert_eq!(pages.len(), 1);
    let page = pages[0].as_ref().unwrap();
    assert!(page.records.is_empty());
    assert!(page.next_cursor.is_none());
}

#[tokio::test]
async fn test_malformed_next_link_ends_sequence() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/widgets"))
        .and(query_param("page", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"id": 1}]))
                .insert_header("Link", r#"/api/v1/widgets?page=2; rel="next""#),
        )
        .mount(&server)
        .await;

    let paginator = Paginator::new(&http_config(&server), CancellationToken::new()).unwrap();
    let pages = collect(&paginator, start_url(&server, "widgets")).await;

    assert_eq!(pages.len(), 1);
    assert!(pages[0].as_ref().unwrap().next_cursor.is_none());
}

#[tokio::test]
async fn test_link_cycle_stops() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/widgets"))
        .respond_with(page_response(json!([{"id": 1}]), Some("/api/v1/widgets?page=1")))
        .expect(1)
        .mount(&server)
        .await;

    let paginator = Paginator::new(&http_config(&server), CancellationToken::new()).unwrap();
    let pages = collect(&paginator, start_url(&server, "widgets")).await;
    assert_eq!(pages.len(), 1);
}

#[tokio::test]
async fn test_undecodable_body_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/widgets"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let paginator = Paginator::new(&http_config(&server), CancellationToken::new()).unwrap();
    let pages = collect(&paginator, start_url(&server, "widgets")).await;
    assert!(matches!(pages[..], [Err(FetchError::Decode { .. })]));
}

#[tokio::test]
async fn test_cancel_interrupts_retry_delay() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/widgets"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut config = http_config(&server);
    config.retry_delay_ms = 60_000;
    let cancel = CancellationToken::new();
    let paginator = Paginator::new(&config, cancel.clone()).unwrap();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let pages = collect(&paginator, start_url(&server, "widgets")).await;
    canceller.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(pages[..], [Err(FetchError::Cancelled { .. })]));
}
