mod common;

use common::{ManualClock, config, hash_of, make_block};
use explorer_indexer::config::SyncConfig;
use explorer_indexer::core::{FetchOutcome, Fetcher, HttpPeer, JsonBlockDecoder, Peer};
use explorer_indexer::types::BlockHash;
use explorer_indexer::IndexerError;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn peer(server: &MockServer) -> HttpPeer {
    HttpPeer::new(&server.uri(), "testnet", Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_get_block_returns_payload() {
    let server = MockServer::start().await;
    let block = make_block(0, 0, BlockHash::ZERO);

    Mock::given(method("GET"))
        .and(path("/testnet/block/0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&block))
        .mount(&server)
        .await;

    let raw = peer(&server).get_block(0).await.unwrap().unwrap();
    let decoded: explorer_indexer::types::Block = serde_json::from_slice(&raw).unwrap();
    assert_eq!(decoded, block);
}

#[tokio::test]
async fn test_missing_block_is_absent() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/testnet/block/7"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert_eq!(peer(&server).get_block(7).await.unwrap(), None);
}

#[tokio::test]
async fn test_server_error_is_peer_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/testnet/block/3"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = peer(&server).get_block(3).await.unwrap_err();
    assert!(matches!(err, IndexerError::PeerError(_)), "{err}");
}

#[tokio::test]
async fn test_tip_height_parsing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/testnet/block/height/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_string("4242\n"))
        .mount(&server)
        .await;

    assert_eq!(peer(&server).get_tip_height().await.unwrap(), 4242);
}

#[tokio::test]
async fn test_garbage_tip_height_is_peer_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/testnet/block/height/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    assert!(matches!(
        peer(&server).get_tip_height().await.unwrap_err(),
        IndexerError::PeerError(_)
    ));
}

#[tokio::test]
async fn test_fetcher_recovers_after_transient_failures() {
    let server = MockServer::start().await;
    let block = make_block(0, 1, hash_of(0, 0));

    Mock::given(method("GET"))
        .and(path("/testnet/block/1"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/testnet/block/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&block))
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(
        Arc::new(peer(&server)),
        Arc::new(JsonBlockDecoder::new()),
        Arc::new(ManualClock::new()),
        &config(SyncConfig::default()),
    );

    assert_eq!(fetcher.fetch(1).await.unwrap(), FetchOutcome::Block(block));
}

#[tokio::test]
async fn test_fetcher_reports_undecodable_payload() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/testnet/block/2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"height\":"))
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(
        Arc::new(peer(&server)),
        Arc::new(JsonBlockDecoder::new()),
        Arc::new(ManualClock::new()),
        &config(SyncConfig::default()),
    );

    assert!(matches!(
        fetcher.fetch(2).await.unwrap_err(),
        IndexerError::DecodingError(_)
    ));
}
