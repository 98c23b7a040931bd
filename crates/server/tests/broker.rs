//! End-to-end broker tests over a real listener.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use reqwest::StatusCode;

use advtrain_proto::batch::decode_batch;
use advtrain_proto::wire::{self, DataloaderPayload};
use advtrain_proto::{FactorySpec, Parameters, VersionTriple};
use advtrain_server::data::Registries;
use advtrain_server::state::ServerState;
use advtrain_server::{reaper, routes};

struct TestServer {
    base: String,
    http: reqwest::Client,
}

async fn spawn_server() -> TestServer {
    let state = ServerState::new(Registries::default());
    tokio::spawn(reaper::run(state.clone(), Duration::from_millis(50)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, routes::router(state)).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        http: reqwest::Client::new(),
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post(&self, path: &str, body: Vec<u8>) {
        let status = self.post_status(path, body).await;
        assert_eq!(status, StatusCode::OK, "POST {path}");
    }

    async fn post_status(&self, path: &str, body: Vec<u8>) -> StatusCode {
        self.http
            .post(self.url(path))
            .body(body)
            .send()
            .await
            .unwrap()
            .status()
    }

    async fn get(&self, path: &str) -> Vec<u8> {
        let res = self.http.get(self.url(path)).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK, "GET {path}");
        res.bytes().await.unwrap().to_vec()
    }

    async fn get_clean(&self) -> (u64, Vec<u8>) {
        let body = self.get(wire::EP_CLEAN_BATCH).await;
        let (id, payload) = wire::split_id_prefix(&body).unwrap();
        (id, payload.to_vec())
    }

    async fn post_adv(&self, id: u64, payload: &[u8]) {
        self.post(wire::EP_ADV_BATCH, wire::join_id_prefix(id, payload)).await;
    }

    async fn ids(&self) -> VersionTriple {
        VersionTriple::decode(&self.get(wire::EP_IDS).await).unwrap()
    }

    /// Full setup: inline dataset with one-byte-per-batch labels, batched
    /// dataloader, opaque attack/model/weights, parameters.
    async fn setup(&self, samples: &[(&str, &str)], max_patience: u64, queue_limit: u64) {
        let sample_specs: Vec<serde_json::Value> = samples
            .iter()
            .map(|(input, label)| {
                serde_json::json!({ "input": B64.encode(input), "label": B64.encode(label) })
            })
            .collect();
        let dataset = FactorySpec::new("inline").kwarg("samples", sample_specs);
        self.post(wire::EP_DATASET, dataset.to_bytes().unwrap()).await;

        let payload = DataloaderPayload {
            spec: FactorySpec::new("batched").kwarg("batch_size", 1),
            params: Parameters { max_patience, queue_limit },
        };
        self.post(wire::EP_DATALOADER, payload.encode().unwrap()).await;

        self.post(wire::EP_ATTACK, b"attack-spec".to_vec()).await;
        self.post(wire::EP_MODEL, wire::join_arch_flag(false, b"model-spec")).await;
        self.post(wire::EP_MODEL_STATE, b"weights-0".to_vec()).await;
        self.post(
            wire::EP_PARAMETERS,
            Parameters { max_patience, queue_limit }.encode().to_vec(),
        )
        .await;
    }
}

fn batch_input(payload: &[u8]) -> Vec<u8> {
    let samples = decode_batch(payload).unwrap();
    assert_eq!(samples.len(), 1);
    samples[0].input.clone()
}

#[tokio::test]
async fn happy_path_delivers_adversarial_batches_in_order() {
    let server = spawn_server().await;
    server.setup(&[("B0", "y0"), ("B1", "y1"), ("B2", "y2")], 10, 3).await;

    assert_eq!(server.get(wire::EP_NUM_BATCHES).await, 3u64.to_be_bytes());

    for expected in 0..3u64 {
        let (id, payload) = server.get_clean().await;
        assert_eq!(id, expected);
        assert_eq!(batch_input(&payload), format!("B{expected}").into_bytes());
        server.post_adv(id, format!("A{expected}").as_bytes()).await;
    }

    for expected in 0..3u64 {
        let res = server
            .http
            .get(server.url(wire::EP_ADV_BATCH))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let extra = res
            .headers()
            .get(wire::EXTRA_DATA_HEADER)
            .expect("telemetry header")
            .to_str()
            .unwrap()
            .to_string();
        let extra: serde_json::Value = serde_json::from_str(&extra).unwrap();
        assert_eq!(extra["batch_id"], expected);

        let body = res.bytes().await.unwrap();
        assert_eq!(body.as_ref(), format!("A{expected}").as_bytes());
    }
}

#[tokio::test]
async fn stale_submission_is_discarded_and_reissued() {
    let server = spawn_server().await;
    server.setup(&[("B0", "y0"), ("B1", "y1"), ("B2", "y2")], 1, 3).await;

    let (id, clean) = server.get_clean().await;

    // Four weight pushes exceed a patience of one.
    for round in 1..=4 {
        server
            .post(wire::EP_MODEL_STATE, format!("weights-{round}").into_bytes())
            .await;
    }
    server.post_adv(id, b"ADV-LATE").await;

    // The id is reissued ahead of everything else, bytes still clean.
    let (again, payload) = server.get_clean().await;
    assert_eq!(again, id);
    assert_eq!(payload, clean);
}

#[tokio::test]
async fn architecture_swap_replays_clean_shadow_copies() {
    let server = spawn_server().await;
    server
        .setup(&[("B0", "y0"), ("B1", "y1"), ("B2", "y2"), ("B3", "y3")], 10, 4)
        .await;

    let mut clean = std::collections::HashMap::new();
    for _ in 0..4 {
        let (id, payload) = server.get_clean().await;
        clean.insert(id, payload);
    }
    server.post_adv(2, b"ADV-2").await;
    server.post_adv(3, b"ADV-3").await;

    server
        .post(wire::EP_MODEL, wire::join_arch_flag(true, b"model-v2"))
        .await;

    // All four ids come back in order with their original clean bytes, even
    // the two whose adversarial results had already reached done.
    for expected in 0..4u64 {
        let (id, payload) = server.get_clean().await;
        assert_eq!(id, expected);
        assert_eq!(&payload, &clean[&id]);
    }
}

#[tokio::test]
async fn full_done_queue_applies_backpressure() {
    let server = spawn_server().await;
    server
        .setup(&[("B0", "y0"), ("B1", "y1"), ("B2", "y2"), ("B3", "y3")], 10, 2)
        .await;

    let (a, _) = server.get_clean().await;
    let (b, _) = server.get_clean().await;
    server.post_adv(a, b"ADV-0").await;
    server.post_adv(b, b"ADV-1").await;

    // Done is full: the third submission is rejected and its id recycled.
    let (c, _) = server.get_clean().await;
    server.post_adv(c, b"ADV-2").await;
    let (again, _) = server.get_clean().await;
    assert_eq!(again, c);

    // Draining one result makes room for the retry.
    let first = server.get(wire::EP_ADV_BATCH).await;
    assert_eq!(first, b"ADV-0");
    server.post_adv(again, b"ADV-2").await;

    assert_eq!(server.get(wire::EP_ADV_BATCH).await, b"ADV-1");
    assert_eq!(server.get(wire::EP_ADV_BATCH).await, b"ADV-2");
}

#[tokio::test]
async fn reaper_reclaims_batches_from_dead_workers() {
    let server = spawn_server().await;
    server.setup(&[("B0", "y0"), ("B1", "y1"), ("B2", "y2")], 1, 3).await;

    // A worker claims the smallest id and dies.
    let (id, _) = server.get_clean().await;
    assert_eq!(id, 0);

    for round in 1..=3 {
        server
            .post(wire::EP_MODEL_STATE, format!("weights-{round}").into_bytes())
            .await;
    }
    tokio::time::sleep(Duration::from_millis(250)).await;

    // The reaper has returned id 0 to the head of the free queue.
    let (reissued, _) = server.get_clean().await;
    assert_eq!(reissued, 0);
}

#[tokio::test]
async fn reset_restores_fresh_broker_behavior() {
    let server = spawn_server().await;
    server.setup(&[("B0", "y0"), ("B1", "y1")], 10, 2).await;

    let (id, _) = server.get_clean().await;
    server.post_adv(id, b"ADV").await;
    assert_ne!(server.ids().await, VersionTriple::default());

    server.post(wire::EP_RESET, Vec::new()).await;
    assert_eq!(server.ids().await, VersionTriple::default());

    server.setup(&[("C0", "y0"), ("C1", "y1")], 10, 2).await;
    assert_eq!(server.get(wire::EP_NUM_BATCHES).await, 2u64.to_be_bytes());
    let (id, payload) = server.get_clean().await;
    assert_eq!(id, 0);
    assert_eq!(batch_input(&payload), b"C0");
}

#[tokio::test]
async fn unknown_id_submission_is_an_idempotent_no_op() {
    let server = spawn_server().await;
    server.setup(&[("B0", "y0"), ("B1", "y1")], 10, 2).await;

    let before = server.ids().await;
    server.post_adv(999, b"ADV-999").await;
    server.post_adv(999, b"ADV-999").await;
    assert_eq!(server.ids().await, before);

    // The queue is untouched: the next claim is still id 0.
    let (id, _) = server.get_clean().await;
    assert_eq!(id, 0);
}

#[tokio::test]
async fn reads_block_until_prerequisites_are_posted() {
    let server = spawn_server().await;

    // No dataloader yet: num_batches must hang rather than error.
    let pending = tokio::time::timeout(
        Duration::from_millis(300),
        server.http.get(server.url(wire::EP_NUM_BATCHES)).send(),
    )
    .await;
    assert!(pending.is_err(), "num_batches answered before setup");

    server.setup(&[("B0", "y0")], 10, 1).await;
    assert_eq!(server.get(wire::EP_NUM_BATCHES).await, 1u64.to_be_bytes());
    assert_eq!(server.get(wire::EP_ATTACK).await, b"attack-spec");
    assert_eq!(server.get(wire::EP_MODEL).await, b"model-spec");
    assert_eq!(server.get(wire::EP_MODEL_STATE).await, b"weights-0");
}

#[tokio::test]
async fn malformed_bodies_are_rejected() {
    let server = spawn_server().await;

    let status = server.post_status(wire::EP_ADV_BATCH, vec![1, 2, 3]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let status = server.post_status(wire::EP_PARAMETERS, vec![0; 4]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unknown = FactorySpec::new("cifar10");
    let status = server.post_status(wire::EP_DATASET, unknown.to_bytes().unwrap()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}
