use std::sync::Arc;
use std::time::Duration;

use refine_harness::evaluators::{
    CohereReranker, EmbeddingReranker, EmbeddingSimilarity, Evaluator, Reranker,
};
use refine_harness::gateway::cohere::{CohereAdapter, RerankProvider};
use refine_harness::gateway::embeddings::{EmbedProvider, OpenAiEmbeddingsAdapter};
use refine_harness::gateway::openrouter::OpenRouterAdapter;
use refine_harness::gateway::{
    Attribution, EmbedModel, EmbedRequest, GatewayConfig, NoopUsageSink, ProviderError,
    ProviderGateway, RerankApiRequest, RerankModel,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway_for(server: &MockServer) -> ProviderGateway<NoopUsageSink> {
    let openrouter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    ProviderGateway::with_config(
        openrouter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
            attempt_timeout: None,
        },
    )
    .with_cohere(CohereAdapter::with_config("co-test", server.uri(), Duration::from_secs(5)).unwrap())
    .with_embeddings(
        OpenAiEmbeddingsAdapter::with_config("oa-test", server.uri(), Duration::from_secs(5))
            .unwrap(),
    )
}

#[tokio::test]
async fn cohere_adapter_sends_all_documents_and_parses_results() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rerank"))
        .and(header("authorization", "Bearer co-test"))
        .and(body_partial_json(json!({
            "model": "rerank-english-v3.0",
            "query": "Write an ad",
            "top_n": 2,
            "return_documents": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "index": 1, "relevance_score": 0.91 },
                { "index": 0, "relevance_score": 0.77 }
            ],
            "meta": { "billed_units": { "search_units": 1 } }
        })))
        .mount(&server)
        .await;

    let adapter = CohereAdapter::with_config("co-test", server.uri(), Duration::from_secs(5)).unwrap();
    let req = RerankApiRequest::new(
        RerankModel::cohere("rerank-english-v3.0"),
        "Write an ad",
        vec!["plain ad".to_string(), "punchy ad".to_string()],
        Attribution::new("test"),
    );

    let resp = adapter.rerank(&req).await.unwrap();
    assert_eq!(resp.results.len(), 2);
    assert_eq!(resp.results[0].index, 1);
    assert!((resp.results[0].relevance_score - 0.91).abs() < 1e-12);
    assert_eq!(resp.search_units, 1);
}

#[tokio::test]
async fn cohere_reranker_sorts_and_validates_through_gateway() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rerank"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "index": 0, "relevance_score": 0.2 },
                { "index": 2, "relevance_score": 0.8 },
                { "index": 1, "relevance_score": 0.5 }
            ]
        })))
        .mount(&server)
        .await;

    let gateway = Arc::new(gateway_for(&server));
    let reranker = CohereReranker::new(gateway, "rerank-english-v3.0", None);
    let docs = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let ranked = reranker.rerank("q", &docs).await.unwrap();
    let order: Vec<_> = ranked.iter().map(|d| d.index).collect();
    assert_eq!(order, vec![2, 1, 0]);
}

#[tokio::test]
async fn cohere_reranker_rejects_partial_rankings() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rerank"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [ { "index": 0, "relevance_score": 0.9 } ]
        })))
        .mount(&server)
        .await;

    let gateway = Arc::new(gateway_for(&server));
    let reranker = CohereReranker::new(gateway, "rerank-english-v3.0", None);
    let docs = vec!["a".to_string(), "b".to_string()];
    let err = reranker.rerank("q", &docs).await.unwrap_err();
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn cohere_unauthorized_is_fatal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rerank"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "message": "invalid api token"
        })))
        .mount(&server)
        .await;

    let gateway = Arc::new(gateway_for(&server));
    let reranker = CohereReranker::new(gateway, "rerank-english-v3.0", None);
    let docs = vec!["a".to_string()];
    let err = reranker.rerank("q", &docs).await.unwrap_err();
    assert!(err.is_fatal(), "{err:?}");
}

#[tokio::test]
async fn embeddings_adapter_restores_input_order() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(header("authorization", "Bearer oa-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ],
            "usage": { "total_tokens": 7 }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenAiEmbeddingsAdapter::with_config("oa-test", server.uri(), Duration::from_secs(5))
            .unwrap();
    let req = EmbedRequest::new(
        EmbedModel::openai("text-embedding-3-small"),
        vec!["first".to_string(), "second".to_string()],
        Attribution::new("test"),
    );
    let resp = adapter.embed(&req).await.unwrap();
    assert_eq!(resp.embeddings, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    assert_eq!(resp.tokens, 7);
}

#[tokio::test]
async fn embedding_similarity_scores_cosine_and_fails_soft_on_5xx() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(body_partial_json(json!({ "input": ["same", "same"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "index": 0, "embedding": [0.6, 0.8] },
                { "index": 1, "embedding": [0.6, 0.8] }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(body_partial_json(json!({ "input": ["broken", "same"] })))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let gateway = Arc::new(gateway_for(&server));
    let similarity = EmbeddingSimilarity::new(gateway, "text-embedding-3-small", None);

    let judged = similarity.score("same", "same").await.unwrap();
    assert!((judged.value - 1.0).abs() < 1e-6);
    assert!(!judged.failed);

    let judged = similarity.score("broken", "same").await.unwrap();
    assert!(judged.failed);
    assert_eq!(judged.value, 0.0);
}

#[tokio::test]
async fn embedding_reranker_ranks_by_cosine_to_query() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "index": 0, "embedding": [1.0, 0.0] },
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 2, "embedding": [1.0, 0.1] },
                { "index": 3, "embedding": [-1.0, 0.0] }
            ]
        })))
        .mount(&server)
        .await;

    let gateway = Arc::new(gateway_for(&server));
    let reranker = EmbeddingReranker::new(gateway, "text-embedding-3-small", None);
    let docs = vec!["near".to_string(), "orthogonal".to_string(), "opposite".to_string()];
    let ranked = reranker.rerank("query", &docs).await.unwrap();
    let order: Vec<_> = ranked.iter().map(|d| d.index).collect();
    assert_eq!(order, vec![1, 0, 2]);
    assert_eq!(ranked[2].relevance, 0.0);
}

#[tokio::test]
async fn missing_adapter_is_a_config_error() {
    let server = MockServer::start().await;
    let openrouter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let gateway = ProviderGateway::with_config(
        openrouter,
        Arc::new(NoopUsageSink),
        GatewayConfig::default(),
    );
    assert!(!gateway.has_rerank());

    let req = RerankApiRequest::new(
        RerankModel::cohere("rerank-english-v3.0"),
        "q",
        vec!["a".to_string()],
        Attribution::new("test"),
    );
    let err = gateway.rerank(req).await.unwrap_err();
    assert!(matches!(err, ProviderError::Config(_)));
    assert!(err.is_fatal());
}
