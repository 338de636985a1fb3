//! End-to-end tests for the analysis pipeline against mock origins

use super::*;
use crate::pipeline::fetch::archive::tests::{deflate, zip_entry};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use wiremock::{
    Match, Mock, MockServer, Request, ResponseTemplate,
    matchers::{header, header_exists, method, path},
};

/// Matches requests that carry no `Range` header
struct NoRange;

impl Match for NoRange {
    fn matches(&self, request: &Request) -> bool {
        !request.headers.contains_key("range")
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// EBML magic followed by a recognisable filler pattern
fn matroska_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0x1a, 0x45, 0xdf, 0xa3];
    data.extend_from_slice(b"\x42\x82\x88matroska");
    data.extend((0..len.saturating_sub(data.len())).map(|i| (i % 251) as u8));
    data
}

fn test_config() -> AnalyzerConfigBuilder {
    AnalyzerConfigBuilder::new().allow_private_targets(true)
}

fn analyzer(config: AnalyzerConfig) -> Analyzer {
    Analyzer::new(config, Arc::new(SniffEngineFactory)).unwrap()
}

fn json_result(response: &AnalyzeResponse) -> Value {
    match response {
        AnalyzeResponse::Success(success) => serde_json::from_str(&success.results["json"]).unwrap(),
        AnalyzeResponse::Failure(failure) => panic!("Expected success, got {:?}", failure.error),
    }
}

mod fetch_tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_not_found_skips_fetch() {
        init_tracing();
        let mock_server = MockServer::start().await;

        Mock::given(method("HEAD"))
            .and(path("/missing.mkv"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/missing.mkv"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let url = format!("{}/missing.mkv", mock_server.uri());
        let response = analyzer(test_config().build()).analyze(&url, &[OutputFormat::Json]).await;

        match &response {
            AnalyzeResponse::Failure(failure) => {
                assert_eq!(failure.error.code, ErrorCode::UpstreamFetchFailed);
                assert_eq!(failure.error.message, "Media file not found. Check the URL.");
                assert!(!failure.error.retryable);
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(response.http_status(), 502);
        assert_eq!(response.record().failed_stage, Some(Stage::Probing));
        assert!(response.record().analysis.is_none());
    }

    #[tokio::test]
    async fn test_large_file_fetches_bounded_range() {
        init_tracing();
        let mock_server = MockServer::start().await;
        let chunk = matroska_bytes(10_485_760);

        Mock::given(method("HEAD"))
            .and(path("/large.mkv"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", "524288000"))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/large.mkv"))
            .and(header("range", "bytes=0-10485759"))
            .respond_with(
                ResponseTemplate::new(206)
                    .append_header("content-range", "bytes 0-10485759/524288000")
                    .set_body_bytes(chunk),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/large.mkv", mock_server.uri());
        let response = analyzer(test_config().build())
            .analyze(&url, &[OutputFormat::Json, OutputFormat::Text])
            .await;

        let fetch = &response.record().fetch;
        assert_eq!(fetch.bytes_collected, 10_485_760);
        assert_eq!(fetch.response_status, Some(206));
        assert_eq!(fetch.first_byte_read_strategy, Some(FirstByteStrategy::Range));
        assert_eq!(fetch.first_byte_read_retries, 0);
        assert!(fetch.prefix_hash.is_some());

        let general = &json_result(&response)["media"]["track"][0];
        assert_eq!(general["Format"], "Matroska");
        assert_eq!(general["CompleteName"], "large.mkv");
        assert_eq!(response.record().stage, Stage::Done);
    }

    #[tokio::test]
    async fn test_html_probe_is_not_media() {
        init_tracing();
        let mock_server = MockServer::start().await;

        Mock::given(method("HEAD"))
            .and(path("/watch"))
            .respond_with(ResponseTemplate::new(200).append_header("content-type", "text/html; charset=utf-8"))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let url = format!("{}/watch", mock_server.uri());
        let response = analyzer(test_config().build()).analyze(&url, &[]).await;

        match &response {
            AnalyzeResponse::Failure(failure) => {
                assert_eq!(failure.error.code, ErrorCode::UpstreamFetchFailed);
                assert!(failure.error.message.contains("webpage"));
                assert!(!failure.error.retryable);
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_html_body_on_fetch_is_not_media() {
        init_tracing();
        let mock_server = MockServer::start().await;

        Mock::given(method("HEAD"))
            .and(path("/file.mp4"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", "4096"))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/file.mp4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html><body>quota exceeded</body></html>", "text/html"),
            )
            .mount(&mock_server)
            .await;

        let url = format!("{}/file.mp4", mock_server.uri());
        let response = analyzer(test_config().build()).analyze(&url, &[OutputFormat::Json]).await;

        assert_eq!(response.error_code(), Some(ErrorCode::UpstreamFetchFailed));
        assert_eq!(response.record().failed_stage, Some(Stage::Fetching));
    }

    #[tokio::test]
    async fn test_ignored_range_is_cut_at_chunk_size() {
        init_tracing();
        let mock_server = MockServer::start().await;
        let body = matroska_bytes(64 * 1024);

        Mock::given(method("HEAD"))
            .and(path("/norange.mkv"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", body.len().to_string()))
            .mount(&mock_server)
            .await;

        // Origin ignores Range and sends the whole file
        Mock::given(method("GET"))
            .and(path("/norange.mkv"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&mock_server)
            .await;

        let config = test_config().chunk_size(16 * 1024).build();
        let url = format!("{}/norange.mkv", mock_server.uri());
        let response = analyzer(config).analyze(&url, &[OutputFormat::Json]).await;

        assert!(response.is_success());
        let fetch = &response.record().fetch;
        assert_eq!(fetch.bytes_collected, 16 * 1024);
        assert!(fetch.truncated);
        assert_eq!(fetch.response_status, Some(200));
    }

    #[tokio::test]
    async fn test_head_rejected_falls_back_to_ranged_probe() {
        init_tracing();
        let mock_server = MockServer::start().await;
        let body = matroska_bytes(2048);

        Mock::given(method("HEAD"))
            .and(path("/nohead.mkv"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/nohead.mkv"))
            .and(header("range", "bytes=0-0"))
            .respond_with(
                ResponseTemplate::new(206)
                    .append_header("content-range", "bytes 0-0/2048")
                    .set_body_bytes(body[..1].to_vec()),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/nohead.mkv"))
            .and(header("range", "bytes=0-2047"))
            .respond_with(
                ResponseTemplate::new(206)
                    .append_header("content-range", "bytes 0-2047/2048")
                    .set_body_bytes(body),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/nohead.mkv", mock_server.uri());
        let response = analyzer(test_config().build()).analyze(&url, &[OutputFormat::Json]).await;

        assert!(response.is_success());
        let fetch = &response.record().fetch;
        assert_eq!(fetch.probe_method, Some(crate::pipeline::core::ProbeMethod::RangedGet));
        assert_eq!(fetch.declared_size, Some(2048));
        assert_eq!(fetch.bytes_collected, 2048);
        assert!(!fetch.truncated);
    }

    #[tokio::test]
    async fn test_content_disposition_names_the_file() {
        init_tracing();
        let mock_server = MockServer::start().await;
        let body = matroska_bytes(1024);

        Mock::given(method("HEAD"))
            .and(path("/download"))
            .respond_with(
                ResponseTemplate::new(200)
                    .append_header("content-length", body.len().to_string())
                    .append_header(
                        "content-disposition",
                        "attachment; filename=\"fallback.mkv\"; filename*=UTF-8''My%20Clip.mkv",
                    ),
            )
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/download"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body))
            .mount(&mock_server)
            .await;

        let url = format!("{}/download", mock_server.uri());
        let response = analyzer(test_config().build())
            .analyze(&url, &[OutputFormat::Json, OutputFormat::Text])
            .await;

        assert_eq!(response.record().fetch.resolved_filename.as_deref(), Some("My Clip.mkv"));
        assert_eq!(json_result(&response)["media"]["track"][0]["CompleteName"], "My Clip.mkv");

        match &response {
            AnalyzeResponse::Success(success) => assert!(success.results["text"].contains("My Clip.mkv")),
            other => panic!("Expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_redirect_to_private_address_is_refused() {
        init_tracing();
        let public = MockServer::start().await;
        let internal = MockServer::start().await;

        Mock::given(path("/secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"INTERNAL-SECRET-DATA".to_vec()))
            .expect(0)
            .mount(&internal)
            .await;

        Mock::given(path("/clip.mkv"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", format!("{}/secret", internal.uri())))
            .mount(&public)
            .await;

        // Guard enabled; the first hop is handed to the fetcher directly
        let config = AnalyzerConfigBuilder::new().build();
        assert!(!config.allow_private_targets);
        let http = crate::pipeline::core::HttpClient::from_config(&config).unwrap();
        let target = crate::pipeline::core::FetchTarget {
            url: url::Url::parse(&format!("{}/clip.mkv", public.uri())).unwrap(),
            is_share_link: false,
        };
        let mut diagnostics = Diagnostics::new("redirect-guard");

        let result = crate::pipeline::fetch::Fetcher::new(&http, &config)
            .fetch(&target, &mut diagnostics)
            .await;

        match result {
            Err(AnalyzeError::InvalidTarget { url, .. }) => assert!(url.starts_with(&internal.uri())),
            other => panic!("Expected InvalidTarget, got {:?}", other),
        }
        assert_eq!(diagnostics.fetch.bytes_collected, 0);
    }

    #[tokio::test]
    async fn test_redirect_to_allowed_target_is_followed() {
        init_tracing();
        let mock_server = MockServer::start().await;
        let media = matroska_bytes(4096);

        Mock::given(path("/old/clip.mkv"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", format!("{}/clip.mkv", mock_server.uri())),
            )
            .mount(&mock_server)
            .await;

        Mock::given(method("HEAD"))
            .and(path("/clip.mkv"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", media.len().to_string()))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/clip.mkv"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(media.clone()))
            .mount(&mock_server)
            .await;

        let url = format!("{}/old/clip.mkv", mock_server.uri());
        let response = analyzer(test_config().build()).analyze(&url, &[OutputFormat::Json]).await;

        assert!(response.is_success(), "{:?}", response.error_code());
        assert_eq!(response.record().fetch.bytes_collected, media.len());
    }

    #[tokio::test]
    async fn test_byte_fetch_forbidden() {
        init_tracing();
        let mock_server = MockServer::start().await;

        Mock::given(method("HEAD"))
            .and(path("/locked.mkv"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", "4096"))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/locked.mkv"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/locked.mkv", mock_server.uri());
        let response = analyzer(test_config().build()).analyze(&url, &[OutputFormat::Json]).await;

        match &response {
            AnalyzeResponse::Failure(failure) => {
                assert_eq!(failure.error.code, ErrorCode::UpstreamFetchFailed);
                assert_eq!(
                    failure.error.message,
                    "Access denied while fetching media bytes. The link may have expired or blocked server-side fetches."
                );
                assert!(!failure.error.retryable);
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(response.http_status(), 502);
        assert_eq!(response.record().failed_stage, Some(Stage::Fetching));
    }

    #[tokio::test]
    async fn test_byte_fetch_server_error() {
        init_tracing();
        let mock_server = MockServer::start().await;

        Mock::given(method("HEAD"))
            .and(path("/flaky.mkv"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", "4096"))
            .mount(&mock_server)
            .await;

        // Status failures are not stalls, so the first-byte ladder does not retry
        Mock::given(method("GET"))
            .and(path("/flaky.mkv"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/flaky.mkv", mock_server.uri());
        let response = analyzer(test_config().build()).analyze(&url, &[OutputFormat::Json]).await;

        match &response {
            AnalyzeResponse::Failure(failure) => {
                assert_eq!(failure.error.code, ErrorCode::UpstreamFetchFailed);
                assert_eq!(failure.error.message, "Unable to retrieve media bytes (HTTP 503).");
                assert!(failure.error.retryable);
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(response.record().failed_stage, Some(Stage::Fetching));
    }
}

mod archive_tests {
    use super::*;

    #[tokio::test]
    async fn test_deflate_zip_is_unwrapped() {
        init_tracing();
        let mock_server = MockServer::start().await;
        let media = matroska_bytes(200 * 1024);
        let zip = zip_entry("clip.mkv", 8, &deflate(&media));

        Mock::given(method("HEAD"))
            .and(path("/bundle.zip"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", zip.len().to_string()))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/bundle.zip"))
            .and(header_exists("range"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(zip.clone()))
            .mount(&mock_server)
            .await;

        let url = format!("{}/bundle.zip", mock_server.uri());
        let response = analyzer(test_config().build()).analyze(&url, &[OutputFormat::Json]).await;

        let general = &json_result(&response)["media"]["track"][0];
        assert_eq!(general["Format"], "Matroska");
        assert_eq!(general["CompleteName"], "clip.mkv");
        assert_eq!(general["Archive_Name"], "bundle.zip");

        let fetch = &response.record().fetch;
        assert!(fetch.decompressed);
        assert_eq!(fetch.inner_filename.as_deref(), Some("clip.mkv"));
        assert_eq!(fetch.bytes_collected, media.len());
        assert_eq!(fetch.raw_bytes_read, zip.len() as u64);

        match &response {
            AnalyzeResponse::Success(success) => assert_eq!(success.file_size, Some(media.len() as u64)),
            other => panic!("Expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_deflate_prefix_is_accepted() {
        init_tracing();
        let mock_server = MockServer::start().await;

        // Pseudo-random bytes so the compressed payload is larger than the range
        let mut state = 0x2545_f491_u32;
        let mut media = matroska_bytes(16);
        media.extend((0..256 * 1024).map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        }));
        let zip = zip_entry("clip.mkv", 8, &deflate(&media));

        Mock::given(method("HEAD"))
            .and(path("/big.zip"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", zip.len().to_string()))
            .mount(&mock_server)
            .await;

        // The connection ends after 20 KiB, mid-way through the payload
        Mock::given(method("GET"))
            .and(path("/big.zip"))
            .and(header("range", "bytes=0-32767"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(zip[..20 * 1024].to_vec()))
            .mount(&mock_server)
            .await;

        let config = test_config().chunk_size(32 * 1024).build();
        let url = format!("{}/big.zip", mock_server.uri());
        let response = analyzer(config).analyze(&url, &[OutputFormat::Json]).await;

        assert!(response.is_success(), "{:?}", response.error_code());
        let fetch = &response.record().fetch;
        assert!(fetch.decompressed);
        assert!(fetch.bytes_collected > 0);
        assert!(fetch.stream_close_error.is_some());
    }

    #[tokio::test]
    async fn test_stored_zip_passes_through() {
        init_tracing();
        let mock_server = MockServer::start().await;
        let zip = zip_entry("clip.mkv", 0, &matroska_bytes(4096));

        Mock::given(method("HEAD"))
            .and(path("/stored.zip"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", zip.len().to_string()))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/stored.zip"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(zip.clone()))
            .mount(&mock_server)
            .await;

        let url = format!("{}/stored.zip", mock_server.uri());
        let response = analyzer(test_config().build()).analyze(&url, &[OutputFormat::Json]).await;

        assert!(response.is_success());
        let fetch = &response.record().fetch;
        assert!(!fetch.decompressed);
        assert_eq!(fetch.bytes_collected, zip.len());
    }

    #[tokio::test]
    async fn test_undecodable_deflate_entry_fails_fetch() {
        init_tracing();
        let mock_server = MockServer::start().await;
        let zip = zip_entry("clip.mkv", 8, &[0xff; 64]);

        Mock::given(method("HEAD"))
            .and(path("/broken.zip"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", zip.len().to_string()))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/broken.zip"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(zip))
            .mount(&mock_server)
            .await;

        let url = format!("{}/broken.zip", mock_server.uri());
        let response = analyzer(test_config().build()).analyze(&url, &[OutputFormat::Json]).await;

        assert_eq!(response.error_code(), Some(ErrorCode::UpstreamFetchFailed));
        assert_eq!(response.http_status(), 502);

        let record = response.record();
        assert_eq!(record.failed_stage, Some(Stage::Decompressing));
        assert!(record.fetch.decompressed);
        assert_eq!(record.fetch.bytes_collected, 0);
        assert!(record.fetch.stream_close_error.is_some());
        assert!(record.analysis.is_none());
    }
}

mod timeout_tests {
    use super::*;

    fn impatient() -> AnalyzerConfig {
        test_config()
            .first_byte_timeout(Duration::from_millis(100))
            .no_range_fallback_timeout(Duration::from_millis(2_000))
            .max_first_byte_retries(1)
            .build()
    }

    #[tokio::test]
    async fn test_stalled_ranges_fall_back_to_plain_get() {
        init_tracing();
        let mock_server = MockServer::start().await;
        let body = matroska_bytes(4096);

        Mock::given(method("HEAD"))
            .and(path("/slow.mkv"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", body.len().to_string()))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/slow.mkv"))
            .and(header_exists("range"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(body.clone())
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/slow.mkv"))
            .and(NoRange)
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/slow.mkv", mock_server.uri());
        let response = analyzer(impatient()).analyze(&url, &[OutputFormat::Json]).await;

        assert!(response.is_success(), "{:?}", response.error_code());
        let fetch = &response.record().fetch;
        assert_eq!(fetch.first_byte_read_retries, 1);
        assert_eq!(fetch.first_byte_read_strategy, Some(FirstByteStrategy::NoRangeFallback));
        assert_eq!(fetch.first_byte_read_timeout_ms, 100);
        assert_eq!(fetch.response_status, Some(200));
    }

    #[tokio::test]
    async fn test_every_strategy_stalls() {
        init_tracing();
        let mock_server = MockServer::start().await;

        Mock::given(method("HEAD"))
            .and(path("/stuck.mkv"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", "4096"))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/stuck.mkv"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 4096])
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&mock_server)
            .await;

        let config = test_config()
            .first_byte_timeout(Duration::from_millis(100))
            .no_range_fallback_timeout(Duration::from_millis(150))
            .build();
        let url = format!("{}/stuck.mkv", mock_server.uri());
        let response = analyzer(config).analyze(&url, &[OutputFormat::Json]).await;

        match &response {
            AnalyzeResponse::Failure(failure) => {
                assert_eq!(failure.error.code, ErrorCode::UpstreamFetchFailed);
                assert!(failure.error.retryable);
                assert!(failure.error.message.contains("3 strategies attempted"), "{}", failure.error.message);
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(response.record().failed_stage, Some(Stage::Fetching));
    }
}

mod gate_tests {
    use super::*;

    async fn media_server() -> (MockServer, String) {
        let mock_server = MockServer::start().await;
        let body = matroska_bytes(1024);

        Mock::given(method("HEAD"))
            .and(path("/ok.mkv"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", body.len().to_string()))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/ok.mkv"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body))
            .mount(&mock_server)
            .await;

        let url = format!("{}/ok.mkv", mock_server.uri());
        (mock_server, url)
    }

    #[tokio::test]
    async fn test_api_key_is_required_when_configured() {
        init_tracing();
        let (_server, url) = media_server().await;
        let analyzer = analyzer(test_config().api_key("secret").build());

        let missing = analyzer.analyze_for_client("client", None, &url, &[]).await;
        assert_eq!(missing.error_code(), Some(ErrorCode::AuthRequired));
        assert_eq!(missing.http_status(), 401);

        let wrong = analyzer.analyze_for_client("client", Some("guess"), &url, &[]).await;
        assert_eq!(wrong.error_code(), Some(ErrorCode::AuthInvalid));
        assert_eq!(wrong.http_status(), 403);

        let ok = analyzer.analyze_for_client("client", Some("secret"), &url, &[]).await;
        assert!(ok.is_success(), "{:?}", ok.error_code());
    }

    #[tokio::test]
    async fn test_rate_limit_per_client() {
        init_tracing();
        let (_server, url) = media_server().await;
        let analyzer = analyzer(test_config().rate_limit_per_minute(1).build());

        let first = analyzer.analyze_for_client("10.0.0.1", None, &url, &[OutputFormat::Json]).await;
        assert!(first.is_success());

        let second = analyzer.analyze_for_client("10.0.0.1", None, &url, &[OutputFormat::Json]).await;
        assert_eq!(second.error_code(), Some(ErrorCode::RateLimited));
        assert_eq!(second.http_status(), 429);

        let json: Value = serde_json::from_str(&second.to_json().unwrap()).unwrap();
        assert_eq!(json["error"]["retryable"], true);
        assert!(json["error"]["retryAfterSecs"].as_u64().unwrap() >= 1);

        let other = analyzer.analyze_for_client("10.0.0.2", None, &url, &[OutputFormat::Json]).await;
        assert!(other.is_success());
    }

    #[tokio::test]
    async fn test_invalid_targets_never_hit_the_network() {
        init_tracing();
        let analyzer = analyzer(AnalyzerConfigBuilder::new().build());

        for url in ["", "ftp://example.com/a.mkv", "http://127.0.0.1/a.mkv", "http://user:pw@example.com/a"] {
            let response = analyzer.analyze(url, &[OutputFormat::Json]).await;
            assert_eq!(response.error_code(), Some(ErrorCode::ValidationFailed), "{}", url);
            assert_eq!(response.http_status(), 422);
            assert_eq!(response.record().failed_stage, Some(Stage::Resolving));
        }
    }
}

mod budget_tests {
    use super::*;
    use std::time::Instant;

    /// Stalls before reading while generating text output
    struct StallingEngine {
        format: OutputFormat,
    }

    impl AnalysisEngine for StallingEngine {
        fn configure(&mut self, format: OutputFormat, _full: bool) -> Result<()> {
            self.format = format;
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            Ok(())
        }

        fn analyze(&mut self, reader: &dyn ChunkReader) -> Result<EngineOutput> {
            if self.format == OutputFormat::Text {
                let until = Instant::now() + Duration::from_millis(80);
                while Instant::now() < until {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            reader.read_chunk(0, 8)?;
            Ok(EngineOutput::Structured(json!({"media": {"track": [{"@type": "General"}]}})))
        }

        fn render_text(&mut self) -> Result<String> {
            Ok("General\n".to_string())
        }

        fn dispose(&mut self) {}
    }

    #[tokio::test]
    async fn test_budget_exhaustion_fails_request() {
        init_tracing();
        let mock_server = MockServer::start().await;
        let body = matroska_bytes(1024);

        Mock::given(method("HEAD"))
            .and(path("/heavy.mkv"))
            .respond_with(ResponseTemplate::new(200).append_header("content-length", body.len().to_string()))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/heavy.mkv"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body))
            .mount(&mock_server)
            .await;

        let mut config = test_config().build();
        // Below the builder's floor so the test stays fast
        config.cpu_budget = Duration::from_millis(40);

        let factory: Arc<dyn EngineFactory> = Arc::new(|_: &EngineOptions| -> Result<Box<dyn AnalysisEngine>> {
            Ok(Box::new(StallingEngine { format: OutputFormat::Json }))
        });
        let analyzer = Analyzer::new(config, factory).unwrap();

        let url = format!("{}/heavy.mkv", mock_server.uri());
        let response = analyzer.analyze(&url, &[OutputFormat::Json, OutputFormat::Text]).await;

        match &response {
            AnalyzeResponse::Failure(failure) => {
                assert_eq!(failure.error.code, ErrorCode::CpuBudgetExceeded);
                assert!(failure.error.retryable);
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(response.http_status(), 503);
        assert_eq!(response.record().failed_stage, Some(Stage::Analyzing));

        let analysis = response.record().analysis.as_ref().unwrap();
        assert!(analysis.format_generation_times.contains_key("json"));
        assert_eq!(analysis.cpu_budget_ms, 40);
    }
}
