//! Event manager behavior: priority, propagation, failure modes, reports,
//! payload folds, wildcard visibility, and cycle detection.

use std::sync::{Arc, Mutex};

use keel_core::prelude::*;
use keel_core::{hidden_from_global_hooks_tag, Error, EventError};

type Trace = Arc<Mutex<Vec<String>>>;

fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(trace: &Trace) -> Vec<String> {
    trace.lock().unwrap().clone()
}

fn recording_hook(id: &str, event: &Event<u32>, order: i32, trace: &Trace) -> Hook {
    let marker = id.rsplit('.').next().unwrap().to_string();
    let trace = trace.clone();
    Hook::on(id, event)
        .order(order)
        .run(move |_ev, _deps| {
            let trace = trace.clone();
            let marker = marker.clone();
            async move {
                trace.lock().unwrap().push(marker);
                Ok(())
            }
        })
}

async fn boot(defs: Vec<Definition>) -> Runtime {
    let root = Resource::<(), ()>::builder("t.root").register(defs).build();
    run(root).await.unwrap()
}

#[tokio::test]
async fn hooks_run_in_priority_order_and_stop_propagation() {
    let event = Event::<u32>::builder("t.events.ping").build();
    let trace = trace();

    let h1 = recording_hook("t.hooks.h1", &event, 0, &trace);
    let h3 = recording_hook("t.hooks.h3", &event, 20, &trace);
    let stop_trace = trace.clone();
    let h2 = Hook::on("t.hooks.h2", &event)
        .order(10)
        .run(move |ev, _deps| {
            let trace = stop_trace.clone();
            async move {
                trace.lock().unwrap().push("h2".into());
                ev.stop_propagation();
                Ok(())
            }
        });

    let runtime = boot(vec![
        Definition::from(&event),
        Definition::from(&h1),
        Definition::from(&h2),
        Definition::from(&h3),
    ])
    .await;

    let report = runtime
        .emit_with(&event, 7, EmitOptions::default())
        .await
        .unwrap();

    assert_eq!(report.total_listeners, 3);
    assert_eq!(report.failed_listeners, 0);
    assert_eq!(report.outcome, EmitOutcome::Stopped);
    assert_eq!(entries(&trace), vec!["h1", "h2"]);
    runtime.dispose().await;
}

#[tokio::test]
async fn aggregate_mode_collects_every_error() {
    let event = Event::<u32>::builder("t.events.ping").build();

    let h1 = Hook::on("t.hooks.h1", &event)
        .run(|_ev, _deps| async move { Err(Error::msg("a")) });
    let h2 = Hook::on("t.hooks.h2", &event)
        .run(|_ev, _deps| async move { Err(Error::msg("b")) });

    let runtime = boot(vec![
        Definition::from(&event),
        Definition::from(&h1),
        Definition::from(&h2),
    ])
    .await;

    let report = runtime
        .emit_with(
            &event,
            7,
            EmitOptions {
                failure_mode: FailureMode::Aggregate,
                throw_on_error: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(report.total_listeners, 2);
    assert_eq!(report.failed_listeners, 2);
    let messages: Vec<String> = report.errors.iter().map(|e| e.to_string()).collect();
    assert_eq!(messages, vec!["a", "b"]);
    runtime.dispose().await;
}

#[tokio::test]
async fn aggregate_mode_with_throw_wraps_failures() {
    let event = Event::<u32>::builder("t.events.ping").build();
    let h1 = Hook::on("t.hooks.h1", &event)
        .run(|_ev, _deps| async move { Err(Error::msg("a")) });
    let h2 = Hook::on("t.hooks.h2", &event)
        .run(|_ev, _deps| async move { Err(Error::msg("b")) });

    let runtime = boot(vec![
        Definition::from(&event),
        Definition::from(&h1),
        Definition::from(&h2),
    ])
    .await;

    let err = runtime
        .emit_with(
            &event,
            7,
            EmitOptions {
                failure_mode: FailureMode::Aggregate,
                throw_on_error: true,
            },
        )
        .await
        .unwrap_err();

    match err {
        Error::Event(EventError::HookFailures { event, errors }) => {
            assert_eq!(event, "t.events.ping");
            assert_eq!(errors.len(), 2);
        }
        other => panic!("expected aggregated hook failures, got {other}"),
    }
    runtime.dispose().await;
}

#[tokio::test]
async fn fail_fast_propagates_the_hook_error_and_skips_the_rest() {
    let event = Event::<u32>::builder("t.events.ping").build();
    let trace = trace();

    let h1 = Hook::on("t.hooks.h1", &event)
        .order(0)
        .run(|_ev, _deps| async move { Err(Error::msg("first failure")) });
    let h2 = recording_hook("t.hooks.h2", &event, 10, &trace);

    let runtime = boot(vec![
        Definition::from(&event),
        Definition::from(&h1),
        Definition::from(&h2),
    ])
    .await;

    let err = runtime.emit(&event, 7).await.unwrap_err();
    assert_eq!(err.to_string(), "first failure");
    assert!(entries(&trace).is_empty(), "later hooks never ran");
    runtime.dispose().await;
}

#[tokio::test]
async fn emitting_without_subscribers_reports_zero_listeners() {
    let event = Event::<u32>::builder("t.events.lonely").build();
    let runtime = boot(vec![Definition::from(&event)]).await;

    let report = runtime
        .emit_with(&event, 1, EmitOptions::default())
        .await
        .unwrap();
    assert_eq!(report.total_listeners, 0);
    assert_eq!(report.failed_listeners, 0);
    assert_eq!(report.outcome, EmitOutcome::Delivered);
    runtime.dispose().await;
}

#[tokio::test]
async fn parallel_events_deliver_in_order_batches() {
    let event = Event::<u32>::builder("t.events.fanout").parallel().build();
    let trace = trace();

    // two hooks at order 0, one at order 10; an order-0 hook stops
    // propagation, so the order-10 batch never runs
    let h1 = recording_hook("t.hooks.h1", &event, 0, &trace);
    let stop_trace = trace.clone();
    let h2 = Hook::on("t.hooks.h2", &event)
        .order(0)
        .run(move |ev, _deps| {
            let trace = stop_trace.clone();
            async move {
                trace.lock().unwrap().push("h2".into());
                ev.stop_propagation();
                Ok(())
            }
        });
    let h3 = recording_hook("t.hooks.h3", &event, 10, &trace);

    let runtime = boot(vec![
        Definition::from(&event),
        Definition::from(&h1),
        Definition::from(&h2),
        Definition::from(&h3),
    ])
    .await;

    let report = runtime
        .emit_with(&event, 7, EmitOptions::default())
        .await
        .unwrap();

    assert_eq!(report.outcome, EmitOutcome::Stopped);
    let recorded = entries(&trace);
    assert_eq!(recorded.len(), 2, "both order-0 hooks ran, order-10 did not");
    assert!(recorded.contains(&"h1".to_string()));
    assert!(recorded.contains(&"h2".to_string()));
    runtime.dispose().await;
}

#[tokio::test]
async fn responder_hooks_fold_last_proposal() {
    let event = Event::<u32>::builder("t.events.adjust").build();

    let h1 = Hook::on("t.hooks.h1", &event)
        .order(0)
        .respond(|ev, _deps| {
            let n = *ev.payload();
            async move { Ok(Some(n + 1)) }
        });
    // proposes nothing; the previous proposal survives
    let h2 = Hook::on("t.hooks.h2", &event)
        .order(10)
        .respond(|_ev, _deps| async move { Ok(None) });
    let h3 = Hook::on("t.hooks.h3", &event)
        .order(20)
        .respond(|ev, _deps| {
            let n = *ev.payload();
            async move { Ok(Some(n * 10)) }
        });

    let runtime = boot(vec![
        Definition::from(&event),
        Definition::from(&h1),
        Definition::from(&h2),
        Definition::from(&h3),
    ])
    .await;

    let folded = runtime.emit_for_response(&event, 5).await.unwrap();
    assert_eq!(folded, Some(50), "last non-empty proposal wins");
    runtime.dispose().await;
}

#[tokio::test]
async fn payload_fold_on_parallel_event_is_rejected() {
    let event = Event::<u32>::builder("t.events.fanout").parallel().build();
    let runtime = boot(vec![Definition::from(&event)]).await;

    let err = runtime.emit_for_response(&event, 1).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Event(EventError::PayloadFoldOnParallel { .. })
    ));
    runtime.dispose().await;
}

#[tokio::test]
async fn wildcard_hooks_skip_hidden_events() {
    let visible = Event::<u32>::builder("t.events.visible").build();
    let hidden = Event::<u32>::builder("t.events.hidden")
        .tags([hidden_from_global_hooks_tag().applied()])
        .build();

    let trace = trace();
    let wild_trace = trace.clone();
    let wild = Hook::on_any("t.hooks.wild").run(move |envelope, _deps| {
        let trace = wild_trace.clone();
        let event_id = envelope.event_id().to_string();
        async move {
            trace.lock().unwrap().push(event_id);
            Ok(())
        }
    });

    let direct_trace = trace.clone();
    let direct = Hook::on("t.hooks.direct", &hidden).run(move |_ev, _deps| {
        let trace = direct_trace.clone();
        async move {
            trace.lock().unwrap().push("direct:hidden".into());
            Ok(())
        }
    });

    let runtime = boot(vec![
        Definition::from(&visible),
        Definition::from(&hidden),
        Definition::from(&wild),
        Definition::from(&direct),
    ])
    .await;

    runtime.emit(&visible, 1).await.unwrap();
    runtime.emit(&hidden, 2).await.unwrap();

    let recorded = entries(&trace);
    assert!(recorded.contains(&"t.events.visible".to_string()));
    assert!(recorded.contains(&"direct:hidden".to_string()));
    assert!(
        !recorded.contains(&"t.events.hidden".to_string()),
        "wildcard must not see hidden events"
    );
    runtime.dispose().await;
}

#[tokio::test]
async fn payload_schema_rejects_bad_payloads() {
    let event = Event::<u32>::builder("t.events.bounded")
        .payload_schema(Schema::from_fn(|n: &u32| {
            if *n < 100 {
                Ok(())
            } else {
                Err("too large".into())
            }
        }))
        .build();

    let runtime = boot(vec![Definition::from(&event)]).await;

    assert!(runtime.emit(&event, 5).await.is_ok());
    let err = runtime.emit(&event, 500).await.unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
    runtime.dispose().await;
}

#[tokio::test]
async fn runtime_emission_cycles_are_detected() {
    let e1 = Event::<u32>::builder("t.events.first").build();
    let e2 = Event::<u32>::builder("t.events.second").build();

    let e2_handle = e2.clone();
    let h1 = Hook::on("t.hooks.forward", &e1)
        .dependencies([DepRef::from(&e2)])
        .run(move |_ev, deps| {
            let e2 = e2_handle.clone();
            async move { deps.emitter(&e2)?.emit(0).await }
        });

    let e1_handle = e1.clone();
    let h2 = Hook::on("t.hooks.back", &e2)
        .dependencies([DepRef::from(&e1)])
        .run(move |_ev, deps| {
            let e1 = e1_handle.clone();
            async move { deps.emitter(&e1)?.emit(0).await }
        });

    let runtime = boot(vec![
        Definition::from(&e1),
        Definition::from(&e2),
        Definition::from(&h1),
        Definition::from(&h2),
    ])
    .await;

    let err = runtime.emit(&e1, 0).await.unwrap_err();
    match err {
        Error::Event(EventError::Cycle { chain }) => {
            assert_eq!(chain.first().map(String::as_str), Some("t.events.first"));
            assert_eq!(chain.last().map(String::as_str), Some("t.events.first"));
        }
        other => panic!("expected an emission cycle, got {other}"),
    }
    runtime.dispose().await;
}

#[tokio::test]
async fn cycle_detection_can_be_disabled() {
    let e1 = Event::<u32>::builder("t.events.first").build();

    // a self-emitting hook with a depth guard, so the test terminates
    let e1_handle = e1.clone();
    let depth = Arc::new(Mutex::new(0u32));
    let h1 = Hook::on("t.hooks.reemit", &e1)
        .dependencies([DepRef::from(&e1)])
        .run(move |_ev, deps| {
            let e1 = e1_handle.clone();
            let depth = depth.clone();
            async move {
                let current = {
                    let mut depth = depth.lock().unwrap();
                    *depth += 1;
                    *depth
                };
                if current < 3 {
                    deps.emitter(&e1)?.emit(0).await?;
                }
                Ok(())
            }
        });

    let root = Resource::<(), ()>::builder("t.root")
        .register([Definition::from(&e1), Definition::from(&h1)])
        .build();
    let runtime = run_with(
        root,
        RunOptions {
            event_cycle_detection: keel_core::EventCycleDetection(false),
            ..RunOptions::default()
        },
    )
    .await
    .unwrap();

    runtime.emit(&e1, 0).await.unwrap();
    runtime.dispose().await;
}
