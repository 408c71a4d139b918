//! End-to-end tests driving `Router` against `wiremock` stand-ins for
//! Ollama-style backend workers, exercising the scenarios named in
//! `SPEC_FULL.md` §8.

use inference_router::config::Config;
use inference_router::router::Router;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_healthy_worker(mock_server: &MockServer, answer: &str) {
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [{"name": "llama3"}]
        })))
        .mount(mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": answer,
            "eval_count": 12,
            "eval_duration": 100_000_000u64,
        })))
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn concurrent_requests_across_two_workers_all_resolve() {
    let mock_a = MockServer::start().await;
    let mock_b = MockServer::start().await;
    mount_healthy_worker(&mock_a, "from-a").await;
    mount_healthy_worker(&mock_b, "from-b").await;

    let mut config = Config::for_testing();
    config.ollama_hosts = vec![mock_a.uri(), mock_b.uri()];
    let router = Router::bootstrap(config).await.unwrap();

    let prompts = [
        "Is the sky blue?",
        "What is 4 + 5?",
        "Define entropy",
        "Explain why the sky is blue",
        "Tell me a story about a dragon",
    ];

    let mut handles = Vec::new();
    for prompt in prompts {
        let router = router.clone();
        handles.push(tokio::spawn(async move { router.generate(prompt, None, None).await }));
    }

    for handle in handles {
        let answer = handle.await.unwrap();
        assert!(answer == "from-a" || answer == "from-b", "unexpected answer: {}", answer);
    }

    router.shutdown();
}

#[tokio::test]
async fn failing_worker_resolves_sentinel_and_goes_offline() {
    let mock_server = MockServer::start().await;
    // Benchmark probe succeeds so the worker starts online...
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": "ready",
            "eval_count": 10,
            "eval_duration": 200_000_000u64,
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&mock_server)
        .await;
    // ...then every subsequent generate/chat call fails.
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let mut config = Config::for_testing();
    config.ollama_hosts = vec![mock_server.uri()];
    let router = Router::bootstrap(config).await.unwrap();

    let answer = router.generate("Why is the sky blue?", None, None).await;
    assert_eq!(answer, inference_router::sentinel::STILL_LEARNING);

    // Give the dispatcher a moment to finish marking the worker offline.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let health = router.queue_health();
    assert!(health.iter().all(|w| !w.online));

    router.shutdown();
}

#[tokio::test]
async fn available_models_reflects_worker_tags() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [{"name": "llama3"}, {"name": "phi3"}]
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": "ready",
            "eval_count": 10,
            "eval_duration": 100_000_000u64,
        })))
        .mount(&mock_server)
        .await;

    let mut config = Config::for_testing();
    config.ollama_hosts = vec![mock_server.uri()];
    let router = Router::bootstrap(config).await.unwrap();

    assert_eq!(
        router.available_models(),
        vec!["llama3".to_string(), "phi3".to_string()]
    );

    router.shutdown();
}
