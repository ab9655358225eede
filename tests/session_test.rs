use bytes::Bytes;
use cudagent::*;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

enum Script {
    Chunks(Vec<&'static str>),
    Live(mpsc::Receiver<cudagent::Result<Bytes>>),
    RejectOpen(u16, &'static str),
    BreakAfter(Vec<&'static str>, &'static str),
}

struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Script>) -> (Self, Arc<Mutex<Vec<ChatRequest>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                scripts: Mutex::new(scripts.into()),
                requests: requests.clone(),
            },
            requests,
        )
    }
}

fn ok_chunks(chunks: Vec<&'static str>) -> Vec<cudagent::Result<Bytes>> {
    chunks
        .into_iter()
        .map(|c| Ok(Bytes::from_static(c.as_bytes())))
        .collect()
}

impl Transport for ScriptedTransport {
    async fn open(&self, request: ChatRequest) -> cudagent::Result<ChunkStream> {
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Chunks(chunks)) => {
                Ok(Box::pin(futures_util::stream::iter(ok_chunks(chunks))))
            }
            Some(Script::Live(rx)) => Ok(Box::pin(ReceiverStream::new(rx))),
            Some(Script::RejectOpen(status, body)) => {
                Err(CoachError::Upstream(status, body.to_string()).into())
            }
            Some(Script::BreakAfter(chunks, reason)) => {
                let mut items = ok_chunks(chunks);
                items.push(Err(CoachError::StreamInterrupted(reason.to_string()).into()));
                Ok(Box::pin(futures_util::stream::iter(items)))
            }
            None => Err(CoachError::Transport("no script left".to_string()).into()),
        }
    }
}

fn session_with(scripts: Vec<Script>) -> (Session<ScriptedTransport>, Arc<Mutex<Vec<ChatRequest>>>) {
    let (transport, requests) = ScriptedTransport::new(scripts);
    (Session::new(transport, GenerationParams::default()), requests)
}

async fn run_one(chunks: Vec<&'static str>) -> TurnReport {
    let (session, _) = session_with(vec![Script::Chunks(chunks)]);
    match session.dispatch("optimise my kernel").await {
        Ok(Some(report)) => report,
        other => panic!("Expected a turn report, got {:?}", other.map(|_| ())),
    }
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F)
where
    F: FnMut(&SessionEvent) -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {}", e),
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for session event");
}

async fn wait_status(rx: &mut watch::Receiver<TurnState>, target: TurnState) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        rx.wait_for(|state| *state == target).await.is_ok()
    })
    .await;
    assert!(matches!(reached, Ok(true)), "status never reached {}", target);
}

#[tokio::test]
async fn test_scenario_a_one_leading_space_stripped_per_payload() {
    let report = run_one(vec!["data: Hello\n\n", "data:  world\n\n"]).await;
    assert_eq!(report.content, "Hello world");
    assert_eq!(report.state, TurnState::Completed);
}

#[tokio::test]
async fn test_scenario_b_done_only_appends_nothing() {
    let report = run_one(vec!["data: [DONE]\n\n"]).await;
    assert_eq!(report.content, "");
    assert_eq!(report.state, TurnState::Completed);
}

#[tokio::test]
async fn test_scenario_c_error_payload_is_annotated() {
    let report = run_one(vec!["data: {\"error\":\"rate limited\"}\n\n"]).await;
    assert_eq!(report.content, "\n[error] rate limited");
    assert_eq!(report.metrics.errors, 1);
}

#[tokio::test]
async fn test_scenario_d_status_ping_changes_nothing() {
    let report = run_one(vec!["data: {\"status\":\"ping\"}\n\n"]).await;
    assert_eq!(report.content, "");
    assert_eq!(report.metrics.pings, 1);
}

#[tokio::test]
async fn test_scenario_e_malformed_json_kept_as_text() {
    let report = run_one(vec!["data: {not valid json\n\n"]).await;
    assert_eq!(report.content, "{not valid json");
}

#[tokio::test]
async fn test_scenario_f_rejected_open_annotates_once_and_errors() {
    let (session, _) = session_with(vec![Script::RejectOpen(503, "")]);
    let report = match session.dispatch("hello").await {
        Ok(Some(r)) => r,
        _ => panic!("Expected report"),
    };
    assert_eq!(report.state, TurnState::Errored);
    assert!(report.content.starts_with("\n[error] "));
    assert_eq!(report.content.matches("[error]").count(), 1);
    assert!(report.error.is_some());
    assert!(!session.is_in_flight());
    assert_eq!(session.status(), TurnState::Errored);
}

#[tokio::test]
async fn test_error_event_does_not_end_the_turn() {
    let report = run_one(vec![
        "data: first\n\n",
        "data: {\"error\":\"rate limited\"}\n\n",
        "data: second\n\n",
        "data: [DONE]\n\n",
    ])
    .await;
    assert_eq!(report.content, "first\n[error] rate limitedsecond");
    assert_eq!(report.state, TurnState::Completed);
}

#[tokio::test]
async fn test_frames_after_done_are_never_applied() {
    let report = run_one(vec!["data: a\n\ndata: [DONE]\n\ndata: b\n\n"]).await;
    assert_eq!(report.content, "a");
    assert!(!report.content.contains("[DONE]"));
}

#[tokio::test]
async fn test_unterminated_tail_is_dropped_and_counted() {
    let report = run_one(vec!["data: kept\n\ndata: lost"]).await;
    assert_eq!(report.content, "kept");
    assert_eq!(report.state, TurnState::Completed);
    assert_eq!(report.metrics.dropped_tail_bytes, "data: lost".len());
}

#[tokio::test]
async fn test_mid_stream_failure_keeps_content_and_session_recovers() {
    let (session, _) = session_with(vec![
        Script::BreakAfter(vec!["data: partial\n\n"], "connection reset"),
        Script::Chunks(vec!["data: recovered\n\n", "data: [DONE]\n\n"]),
    ]);

    let first = match session.dispatch("one").await {
        Ok(Some(r)) => r,
        _ => panic!("Expected report"),
    };
    assert_eq!(first.state, TurnState::Errored);
    assert_eq!(
        first.content,
        "partial\n[error] Stream interrupted: connection reset"
    );
    assert!(!session.is_in_flight());

    let second = match session.dispatch("two").await {
        Ok(Some(r)) => r,
        _ => panic!("Expected report"),
    };
    assert_eq!(second.state, TurnState::Completed);
    assert_eq!(second.content, "recovered");

    let transcript = session.transcript();
    let roles: Vec<Role> = transcript.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
    assert_eq!(transcript[1].content, first.content);
}

#[tokio::test]
async fn test_request_carries_history_without_placeholder() {
    let (transport, requests) = ScriptedTransport::new(vec![
        Script::Chunks(vec!["data: use tiling\n\n"]),
        Script::Chunks(vec!["data: ok\n\n"]),
    ]);
    let params = GenerationParams {
        system_prompt: Some("You tune CUDA kernels.".to_string()),
        model: Some("gpt-4o-mini".to_string()),
        ..GenerationParams::default()
    };
    let session = Session::new(transport, params);

    assert!(session.dispatch("matmul is slow").await.is_ok());
    assert!(session.dispatch("and softmax?").await.is_ok());

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 2);

    let first: Vec<(Role, &str)> = requests[0]
        .messages
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        first,
        vec![
            (Role::System, "You tune CUDA kernels."),
            (Role::User, "matmul is slow"),
        ]
    );

    let second: Vec<(Role, &str)> = requests[1]
        .messages
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        second,
        vec![
            (Role::System, "You tune CUDA kernels."),
            (Role::User, "matmul is slow"),
            (Role::Assistant, "use tiling"),
            (Role::User, "and softmax?"),
        ]
    );
    assert!((requests[1].temperature - 0.2).abs() < f32::EPSILON);
    assert_eq!(requests[1].model.as_deref(), Some("gpt-4o-mini"));
}

#[tokio::test]
async fn test_blank_dispatch_is_a_no_op() {
    let (session, requests) = session_with(vec![]);
    match session.dispatch("   \n\t").await {
        Ok(None) => {}
        other => panic!("Expected no-op, got {:?}", other.map(|r| r.map(|r| r.state))),
    }
    assert!(session.transcript().is_empty());
    assert_eq!(session.status(), TurnState::Idle);
    assert!(requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_events_mirror_transcript_in_order() {
    let (session, _) = session_with(vec![Script::Chunks(vec![
        "data: a\n\n",
        "data: b\n\n",
        "data: [DONE]\n\n",
    ])]);
    let mut rx = session.subscribe();
    let report = match session.dispatch("go").await {
        Ok(Some(r)) => r,
        _ => panic!("Expected report"),
    };

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    let expected = vec![
        SessionEvent::MessageAppended {
            id: report.user_id.clone(),
            role: Role::User,
        },
        SessionEvent::MessageAppended {
            id: report.assistant_id.clone(),
            role: Role::Assistant,
        },
        SessionEvent::TurnStateChanged {
            turn_id: report.turn_id.clone(),
            state: TurnState::Dispatched,
        },
        SessionEvent::TurnStateChanged {
            turn_id: report.turn_id.clone(),
            state: TurnState::Streaming,
        },
        SessionEvent::ContentAppended {
            id: report.assistant_id.clone(),
            delta: "a".to_string(),
        },
        SessionEvent::ContentAppended {
            id: report.assistant_id.clone(),
            delta: "b".to_string(),
        },
        SessionEvent::TurnStateChanged {
            turn_id: report.turn_id.clone(),
            state: TurnState::Completed,
        },
    ];
    assert_eq!(events, expected);
}

#[tokio::test]
async fn test_in_flight_guard_and_cancellation_truncation() {
    let (tx, rx) = mpsc::channel(8);
    let (session, requests) = session_with(vec![Script::Live(rx)]);
    let mut events = session.subscribe();

    let runner = session.clone();
    let handle = tokio::spawn(async move { runner.dispatch("profile this kernel").await });

    tx.send(Ok(Bytes::from_static(b"data: a\n\n"))).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ContentAppended { delta, .. } if delta == "a")
    })
    .await;

    assert!(session.is_in_flight());
    let before = session.transcript();
    match session.dispatch("second").await {
        Err(e) => assert!(matches!(e.inner, CoachError::InvalidState(_))),
        Ok(_) => panic!("Expected InvalidState while a turn is in flight"),
    }
    assert_eq!(session.transcript(), before);
    assert_eq!(requests.lock().unwrap().len(), 1);

    assert!(session.cancel());
    let _ = tx.send(Ok(Bytes::from_static(b"data: b\n\n"))).await;

    let report = match handle.await.unwrap() {
        Ok(Some(r)) => r,
        _ => panic!("Expected report"),
    };
    assert_eq!(report.state, TurnState::Cancelled);
    assert_eq!(report.content, "a");
    assert!(!session.is_in_flight());
    assert!(!session.cancel());

    let _ = tx.send(Ok(Bytes::from_static(b"data: c\n\n"))).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let transcript = session.transcript();
    assert_eq!(transcript.last().map(|m| m.content.as_str()), Some("a"));
}

#[tokio::test]
async fn test_cancel_before_first_chunk() {
    let (_tx, rx) = mpsc::channel::<cudagent::Result<Bytes>>(1);
    let (session, _) = session_with(vec![Script::Live(rx)]);
    let mut events = session.subscribe();

    let runner = session.clone();
    let handle = tokio::spawn(async move { runner.dispatch("hello").await });

    wait_for(&mut events, |e| {
        matches!(
            e,
            SessionEvent::TurnStateChanged {
                state: TurnState::Dispatched,
                ..
            }
        )
    })
    .await;
    assert!(session.cancel());

    let report = match handle.await.unwrap() {
        Ok(Some(r)) => r,
        _ => panic!("Expected report"),
    };
    assert_eq!(report.state, TurnState::Cancelled);
    assert_eq!(report.content, "");
    assert_eq!(report.metrics.chunks, 0);
}

#[tokio::test]
async fn test_dropped_dispatch_releases_the_session() {
    let (_tx, rx) = mpsc::channel::<cudagent::Result<Bytes>>(1);
    let (session, _) = session_with(vec![
        Script::Live(rx),
        Script::Chunks(vec!["data: fine\n\n"]),
    ]);

    let abandoned = tokio::time::timeout(Duration::from_millis(50), session.dispatch("stuck")).await;
    assert!(abandoned.is_err());
    assert!(!session.is_in_flight());
    assert_eq!(session.status(), TurnState::Cancelled);

    let report = match session.dispatch("again").await {
        Ok(Some(r)) => r,
        _ => panic!("Expected report"),
    };
    assert_eq!(report.content, "fine");
}

#[tokio::test]
async fn test_watch_status_follows_a_completed_turn() {
    let (tx, rx) = mpsc::channel(8);
    let (session, _) = session_with(vec![Script::Live(rx)]);
    let mut status = session.watch_status();
    assert_eq!(*status.borrow(), TurnState::Idle);

    let runner = session.clone();
    let handle = tokio::spawn(async move { runner.dispatch("vectorise the loads").await });

    wait_status(&mut status, TurnState::Dispatched).await;
    tx.send(Ok(Bytes::from_static(b"data: use float4\n\n"))).await.unwrap();
    wait_status(&mut status, TurnState::Streaming).await;
    tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n"))).await.unwrap();
    wait_status(&mut status, TurnState::Completed).await;

    let report = match handle.await.unwrap() {
        Ok(Some(r)) => r,
        _ => panic!("Expected report"),
    };
    assert_eq!(report.content, "use float4");
    assert_eq!(session.status(), TurnState::Completed);
}

#[tokio::test]
async fn test_watch_status_reports_cancellation() {
    let (tx, rx) = mpsc::channel(8);
    let (session, _) = session_with(vec![Script::Live(rx)]);
    let mut status = session.watch_status();

    let runner = session.clone();
    let handle = tokio::spawn(async move { runner.dispatch("unroll it").await });

    tx.send(Ok(Bytes::from_static(b"data: partial\n\n"))).await.unwrap();
    wait_status(&mut status, TurnState::Streaming).await;
    assert!(session.cancel());
    wait_status(&mut status, TurnState::Cancelled).await;

    let report = match handle.await.unwrap() {
        Ok(Some(r)) => r,
        _ => panic!("Expected report"),
    };
    assert_eq!(report.state, TurnState::Cancelled);
    assert!(!session.is_in_flight());
}

#[tokio::test]
async fn test_updates_stream_mirrors_transcript() {
    let (session, _) = session_with(vec![Script::Chunks(vec![
        "data: tile \n\n",
        "data: {\"error\":\"slow node\"}\n\n",
        "data: it\n\n",
        "data: [DONE]\n\n",
    ])]);
    let updates = session.updates();

    let report = match session.dispatch("how do I tile this?").await {
        Ok(Some(r)) => r,
        _ => panic!("Expected report"),
    };

    // user, assistant, Dispatched, Streaming, three appends, Completed
    let collected = tokio::time::timeout(Duration::from_secs(5), updates.take(8).collect::<Vec<_>>())
        .await
        .unwrap();
    let events: Vec<SessionEvent> = collected
        .into_iter()
        .map(|e| match e {
            Ok(event) => event,
            Err(e) => panic!("updates lagged: {}", e),
        })
        .collect();

    let transcript = session.transcript();
    let appended: Vec<MessageId> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::MessageAppended { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect();
    let transcript_ids: Vec<MessageId> = transcript.iter().map(|m| m.id.clone()).collect();
    assert_eq!(appended, transcript_ids);

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ContentAppended { id, delta } if *id == report.assistant_id => {
                Some(delta.as_str())
            }
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "tile \n[error] slow nodeit");
    assert_eq!(streamed, transcript[1].content);

    assert_eq!(
        events.last(),
        Some(&SessionEvent::TurnStateChanged {
            turn_id: report.turn_id.clone(),
            state: TurnState::Completed,
        })
    );
}
