//! End-to-end session behavior against the scripted mock engine.

mod common;

use std::path::Path;

use common::MockBackend;
use ember_core::grammar::{self, SchemaOptions};
use ember_core::{
    AbortHandle, FinishReason, GenerateEvent, GenerateRequest, SamplingParams, Session,
    SessionError, SessionParams, SessionState,
};

fn open_session(backend: &MockBackend) -> Session {
    let _ = tracing_subscriber::fmt::try_init();
    let params = SessionParams::new("model.gguf");
    Session::open(backend, &params).expect("mock session opens")
}

fn open_multimodal(backend: &MockBackend) -> Session {
    let mut params = SessionParams::new("model.gguf");
    params.media_projector = Some("projector.gguf".into());
    Session::open(backend, &params).expect("mock session opens")
}

fn greedy_request(prompt: &str, max_tokens: u32) -> GenerateRequest {
    let mut request = GenerateRequest::new(prompt);
    request.max_tokens = max_tokens;
    request.sampling = Some(SamplingParams::greedy());
    request
}

#[test]
fn open_fails_cleanly_on_missing_model() {
    let backend = MockBackend::default();
    let params = SessionParams::new("missing.gguf");
    assert!(matches!(
        Session::open(&backend, &params),
        Err(SessionError::LoadFailed { .. })
    ));
}

#[test]
fn greedy_generation_is_reproducible_across_sessions() {
    let backend = MockBackend::default();
    let request = greedy_request("2+2=", 5);

    let first = open_session(&backend).generate(&request).unwrap();
    let second = open_session(&backend).generate(&request).unwrap();

    assert_eq!(first.text, second.text);
    assert_eq!(first.finish_reason, second.finish_reason);
    assert_eq!(first.completion_tokens, second.completion_tokens);
    assert_eq!(first.prompt_tokens, 4);
    assert!(first.completion_tokens <= 5);
}

/// A grammar that can never terminate: end-of-generation stays
/// inadmissible, so the loop only ever stops through cancellation or
/// `max_tokens`. Keeps the cancellation tests independent of where the
/// mock distribution happens to place its end token.
fn endless_digits() -> std::sync::Arc<ember_core::CompiledGrammar> {
    grammar::parse("root ::= [0-9] root\n", "root").unwrap()
}

#[test]
fn abort_after_k_tokens_yields_exactly_k() {
    let backend = MockBackend::default();
    let mut session = open_session(&backend);
    session.install_grammar(endless_digits()).unwrap();

    let abort = AbortHandle::new();
    let mut request = greedy_request("count: ", 64);
    request.abort = Some(abort.clone());

    let mut emitted = 0u32;
    let result = session
        .generate_with(&request, |_piece| {
            emitted += 1;
            if emitted == 3 {
                // Flag is polled at the next iteration boundary.
                abort.abort();
            }
            true
        })
        .unwrap();

    assert_eq!(emitted, 3);
    assert_eq!(result.finish_reason, FinishReason::Aborted);
    assert_eq!(result.text.chars().count(), 3);
    assert_eq!(session.state(), SessionState::Aborted);

    // Teardown still succeeds from Aborted.
    let report = session.close().unwrap();
    assert!(report.is_clean());
}

#[test]
fn callback_refusal_cancels_without_extra_tokens() {
    let backend = MockBackend::default();
    let mut session = open_session(&backend);
    session.install_grammar(endless_digits()).unwrap();

    let mut delivered = 0u32;
    let result = session
        .generate_with(&greedy_request("abc", 64), |_| {
            delivered += 1;
            delivered < 2
        })
        .unwrap();

    assert_eq!(result.finish_reason, FinishReason::Aborted);
    // The refused piece was never delivered.
    assert_eq!(delivered, 2);
    assert_eq!(session.state(), SessionState::Aborted);
}

#[test]
fn streaming_events_match_the_collected_result() {
    let backend = MockBackend::default();
    let mut session = open_session(&backend);

    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let result = session
        .generate_stream(&greedy_request("hello ", 16), tx)
        .unwrap();

    let mut streamed = String::new();
    let mut saw_done = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            GenerateEvent::Token(piece) => streamed.push_str(&piece),
            GenerateEvent::Done {
                finish_reason,
                completion_tokens,
                ..
            } => {
                saw_done = true;
                assert_eq!(finish_reason, result.finish_reason);
                assert_eq!(completion_tokens, result.completion_tokens);
            }
            GenerateEvent::Error(e) => panic!("unexpected error event: {e}"),
        }
    }
    assert!(saw_done);
    assert_eq!(streamed, result.text);
}

#[test]
fn dropped_receiver_aborts_the_stream() {
    let backend = MockBackend::default();
    let mut session = open_session(&backend);
    session.install_grammar(endless_digits()).unwrap();

    let (tx, rx) = tokio::sync::mpsc::channel(4);
    drop(rx);
    let result = session
        .generate_stream(&greedy_request("hi", 32), tx)
        .unwrap();
    assert_eq!(result.finish_reason, FinishReason::Aborted);
    assert_eq!(session.state(), SessionState::Aborted);
}

#[test]
fn adapter_lifecycle_restores_baseline_output() {
    let backend = MockBackend::default();
    let request = greedy_request("The answer is", 8);

    // Baseline: no adapter was ever loaded.
    let baseline = open_session(&backend).generate(&request).unwrap();

    // An attached adapter changes the distribution.
    let mut with_adapter = open_session(&backend);
    let handle = with_adapter.load_adapter(Path::new("style.lora")).unwrap();
    with_adapter.set_adapter_scale(handle, 0.5).unwrap();
    let adapted = with_adapter.generate(&request).unwrap();
    assert_ne!(adapted.text, baseline.text);

    // Load, apply, remove: observably identical to never having loaded.
    let mut round_trip = open_session(&backend);
    let handle = round_trip.load_adapter(Path::new("style.lora")).unwrap();
    round_trip.set_adapter_scale(handle, 0.5).unwrap();
    round_trip.remove_adapter(handle).unwrap();
    let restored = round_trip.generate(&request).unwrap();
    assert_eq!(restored.text, baseline.text);
}

#[test]
fn adapter_bookkeeping_and_errors() {
    let backend = MockBackend::default();
    let mut session = open_session(&backend);

    assert!(matches!(
        session.load_adapter(Path::new("missing.lora")),
        Err(SessionError::LoadFailed { .. })
    ));

    let a = session.load_adapter(Path::new("a.lora")).unwrap();
    let b = session.load_adapter(Path::new("b.lora")).unwrap();
    session.set_adapter_scale(a, 1.5).unwrap();

    assert!(matches!(
        session.set_adapter_scale(a, 2.5),
        Err(SessionError::InvalidParam(_))
    ));

    let infos = session.adapters();
    assert_eq!(infos.len(), 2);
    assert!(infos[0].active);
    assert_eq!(infos[0].scale, 1.5);
    assert!(!infos[1].active);

    // Remove and reload: application order stays load order.
    session.remove_adapter(a).unwrap();
    assert!(matches!(
        session.remove_adapter(a),
        Err(SessionError::NotFound)
    ));
    let c = session.load_adapter(Path::new("c.lora")).unwrap();
    let order: Vec<_> = session
        .adapters()
        .iter()
        .map(|i| i.path.display().to_string())
        .collect();
    assert_eq!(order, vec!["b.lora", "c.lora"]);

    session.remove_adapter(b).unwrap();
    session.remove_adapter(c).unwrap();
    assert!(session.adapters().is_empty());
}

#[test]
fn decode_failure_preserves_partial_output() {
    // Prompt decode is call 1; the failure hits the second generated
    // token's decode.
    let backend = MockBackend {
        fail_decode_after: Some(2),
    };
    let mut session = open_session(&backend);

    // The grammar keeps end-of-generation inadmissible until a "!", so
    // the first two sampled tokens are always ordinary digits.
    let g = grammar::parse("root ::= [0-9]+ \"!\"\n", "root").unwrap();
    session.install_grammar(g).unwrap();

    let err = session.generate(&greedy_request("n=", 32)).unwrap_err();
    match err {
        SessionError::DecodeFailed { partial, .. } => {
            assert_eq!(partial.chars().count(), 2);
        }
        other => panic!("expected DecodeFailed, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Failed);

    // A failed request still leaves the session closable.
    assert!(session.close().unwrap().is_clean());
}

#[test]
fn parameter_errors_fail_fast_without_touching_the_engine() {
    let backend = MockBackend::default();
    let mut session = open_session(&backend);

    let mut request = greedy_request("x", 8);
    request.sampling = Some(SamplingParams {
        temperature: -3.0,
        ..SamplingParams::default()
    });
    assert!(matches!(
        session.generate(&request),
        Err(SessionError::InvalidParam(_))
    ));
    assert_eq!(session.state(), SessionState::Idle);

    // Empty prompt with no media is rejected before any decode.
    assert!(matches!(
        session.generate(&greedy_request("", 8)),
        Err(SessionError::InvalidParam(_))
    ));
}

#[test]
fn grammar_constrained_generation_stays_grammar_valid() {
    let backend = MockBackend::default();
    let mut session = open_session(&backend);

    let schema = r#"{
        "type": "object",
        "properties": {
            "name": {"type": "string"},
            "age": {"type": "integer"}
        },
        "required": ["name", "age"]
    }"#;
    let g = grammar::from_json_schema(schema, &SchemaOptions::default()).unwrap();
    session.install_grammar(g.clone()).unwrap();

    let result = session.generate(&greedy_request("emit json:", 512)).unwrap();

    // Every emitted prefix is grammar-valid.
    let mut matcher = g.matcher();
    matcher
        .advance_text(&result.text)
        .expect("generated text must stay within the grammar");

    // A natural stop means the grammar ran to completion: the output is
    // well-formed JSON with exactly the forced keys.
    if result.finish_reason == FinishReason::Stop {
        assert!(matcher.can_terminate());
        let value: serde_json::Value = serde_json::from_str(result.text.trim()).unwrap();
        assert!(value.get("name").is_some_and(|v| v.is_string()));
        assert!(value.get("age").is_some_and(|v| v.is_i64() || v.is_u64()));
    }
}

#[test]
fn grammar_reuse_is_sequential_not_concurrent() {
    let backend = MockBackend::default();
    let g = grammar::parse("root ::= [0-9]+\n", "root").unwrap();

    let mut first = open_session(&backend);
    first.install_grammar(g.clone()).unwrap();
    first.generate(&greedy_request("a", 4)).unwrap();

    // The activation is released between requests, so a second session
    // can use the same compiled grammar afterwards.
    let mut second = open_session(&backend);
    second.install_grammar(g).unwrap();
    second.generate(&greedy_request("a", 4)).unwrap();
}

#[test]
fn closed_session_rejects_everything() {
    let backend = MockBackend::default();
    let mut session = open_session(&backend);
    let handle = session.load_adapter(Path::new("a.lora")).unwrap();
    session.set_adapter_scale(handle, 1.0).unwrap();

    let report = session.close().unwrap();
    assert!(report.is_clean());
    assert_eq!(session.state(), SessionState::Closed);

    assert!(matches!(
        session.generate(&greedy_request("x", 4)),
        Err(SessionError::AlreadyClosed)
    ));
    assert!(matches!(
        session.load_adapter(Path::new("b.lora")),
        Err(SessionError::AlreadyClosed)
    ));
    assert!(matches!(session.close(), Err(SessionError::AlreadyClosed)));
}

#[test]
fn snapshot_round_trip_resumes_identically() {
    let backend = MockBackend::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.snap");

    let mut original = open_session(&backend);
    original.generate(&greedy_request("seed text ", 6)).unwrap();
    original.save_state(&path).unwrap();

    let mut resumed = open_session(&backend);
    resumed.load_state(&path).unwrap();

    let follow_up = greedy_request("next", 6);
    let a = original.generate(&follow_up).unwrap();
    let b = resumed.generate(&follow_up).unwrap();
    assert_eq!(a.text, b.text);
}

#[test]
fn snapshot_rejects_corrupt_files() {
    let backend = MockBackend::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.snap");
    std::fs::write(&path, b"definitely not a snapshot").unwrap();

    let mut session = open_session(&backend);
    assert!(matches!(
        session.load_state(&path),
        Err(SessionError::LoadFailed { .. })
    ));
}

#[test]
fn media_without_encoder_is_multimodal_not_supported() {
    let backend = MockBackend::default();
    let mut session = open_session(&backend);

    let mut request = greedy_request("look at this:", 8);
    request
        .media
        .push(ember_core::MediaInput::image_raw(8, 8, vec![0u8; 8 * 8 * 3]));

    assert!(matches!(
        session.generate(&request),
        Err(SessionError::MultimodalNotSupported)
    ));
    // No engine state was touched; the session stays usable.
    assert_eq!(session.state(), SessionState::Idle);
    session.generate(&greedy_request("plain text", 4)).unwrap();
}

#[test]
fn media_embeddings_reserve_prompt_slots() {
    let backend = MockBackend::default();
    let mut session = open_multimodal(&backend);

    let mut request = greedy_request("hi", 4);
    request
        .media
        .push(ember_core::MediaInput::image_raw(8, 8, vec![9u8; 8 * 8 * 3]));

    let result = session.generate(&request).unwrap();
    // 4 encoder-reported slots + 2 text tokens.
    assert_eq!(result.prompt_tokens, 6);
}
