mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common::*;
use vast_ad_engine::fetch::{AdTagFetcher, HttpFetcher};
use vast_ad_engine::player::PlayerEvent;
use vast_ad_engine::{AdsLoader, AdsRequest, ContentPosition, EngineConfig, VastError, VideoProgressUpdate};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn fetches_ad_tags_over_http() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vast"))
        .respond_with(ResponseTemplate::new(200).set_body_string(POD))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(Duration::from_secs(2), "vast-ad-engine-test")?;
    let body = fetcher.fetch(&format!("{}/vast", server.uri())).await?;
    assert!(body.contains(r#"<Ad id="first""#));
    Ok(())
}

#[tokio::test]
async fn non_success_status_is_an_error() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(Duration::from_secs(2), "vast-ad-engine-test")?;
    let err = fetcher
        .fetch(&format!("{}/vast", server.uri()))
        .await
        .err()
        .context("expected an error")?;
    assert!(matches!(err, VastError::HttpStatus(503)));
    Ok(())
}

#[tokio::test]
async fn requested_vmap_plays_and_fires_tracking() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let vmap = VMAP_PRE_POST.replace("{SERVER}", &server.uri());
    Mock::given(method("GET"))
        .and(path("/vmap"))
        .respond_with(ResponseTemplate::new(200).set_body_string(vmap))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let player = Arc::new(RecordingPlayer::default());
    let loader = AdsLoader::new(EngineConfig::default())?;
    let mut manager = loader
        .request_ads(AdsRequest::AdTagUrl(format!("{}/vmap", server.uri())), player.clone())
        .await?;
    assert_eq!(manager.breaks().len(), 2);

    manager.on_content_progress(ContentPosition::Millis(0), None);
    let media = current_media(&manager).context("no ad on screen")?;
    manager.handle_player_event(PlayerEvent::Progress(media, VideoProgressUpdate::from_millis(1_000, 10_000)));

    let expected = ["/impression/pre", "/start/pre", "/break/pre"];
    let mut seen = Vec::new();
    for _ in 0..100 {
        let requests = server.received_requests().await.unwrap_or_default();
        seen = requests.iter().map(|r| r.url.path().to_string()).collect();
        if expected.iter().all(|p| seen.iter().any(|s| s == p)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for expected in expected {
        assert!(seen.iter().any(|s| s == expected), "{expected} not fired, saw {seen:?}");
    }
    assert!(!seen.iter().any(|s| s == "/complete/pre"));

    manager.destroy();
    Ok(())
}
