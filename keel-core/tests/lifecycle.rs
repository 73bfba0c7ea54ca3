//! Lifecycle ordering: topological init, reverse dispose, unwinding on
//! failure, idempotency, and dry runs.

use std::sync::{Arc, Mutex};

use keel_core::prelude::*;
use keel_core::{Error, LifecycleError};

type Trace = Arc<Mutex<Vec<String>>>;

fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(trace: &Trace) -> Vec<String> {
    trace.lock().unwrap().clone()
}

/// A counter resource that records its init and dispose into the trace.
fn counting_resource(id: &str, value: i32, trace: &Trace) -> Resource<(), i32> {
    let name = id.rsplit('.').next().unwrap().to_string();
    let init_trace = trace.clone();
    let init_name = name.clone();
    let dispose_trace = trace.clone();
    Resource::<(), i32>::builder(id)
        .init(move |_cfg, _deps, _ctx| {
            let trace = init_trace.clone();
            let name = init_name.clone();
            async move {
                trace.lock().unwrap().push(format!("init:{name}"));
                Ok(value)
            }
        })
        .dispose(move |_value, _cfg, _deps, _ctx| {
            let trace = dispose_trace.clone();
            let name = name.clone();
            async move {
                trace.lock().unwrap().push(format!("dispose:{name}"));
                Ok(())
            }
        })
        .build()
}

#[tokio::test]
async fn two_resource_dag_boots_and_disposes_in_order() {
    let trace = trace();
    let a = counting_resource("t.resources.a", 1, &trace);

    let a_handle = a.clone();
    let b_trace = trace.clone();
    let b_dispose_trace = trace.clone();
    let b = Resource::<(), i32>::builder("t.resources.b")
        .dependencies([DepRef::from(&a)])
        .init(move |_cfg, deps, _ctx| {
            let a = a_handle.clone();
            let trace = b_trace.clone();
            async move {
                trace.lock().unwrap().push("init:b".into());
                Ok(deps.resource(&a)? + 1)
            }
        })
        .dispose(move |_value, _cfg, _deps, _ctx| {
            let trace = b_dispose_trace.clone();
            async move {
                trace.lock().unwrap().push("dispose:b".into());
                Ok(())
            }
        })
        .build();

    let root = Resource::<(), ()>::builder("t.root")
        .register([Definition::from(&a), Definition::from(&b)])
        .build();

    let runtime = run(root).await.unwrap();
    assert_eq!(runtime.resource_value(&b).unwrap(), 2);
    assert_eq!(runtime.resource_value(&a).unwrap(), 1);

    runtime.dispose().await;
    assert_eq!(
        entries(&trace),
        vec!["init:a", "init:b", "dispose:b", "dispose:a"]
    );
}

#[tokio::test]
async fn init_failure_disposes_exactly_the_completed_resources() {
    let trace = trace();
    let a = counting_resource("t.resources.a", 1, &trace);

    let b = counting_resource("t.resources.b", 2, &trace);
    // c depends on both and fails; a and b complete first.
    let c = Resource::<(), i32>::builder("t.resources.c")
        .dependencies([DepRef::from(&a), DepRef::from(&b)])
        .init(|_cfg, _deps, _ctx| async move { Err(Error::msg("c is broken")) })
        .build();

    let root = Resource::<(), ()>::builder("t.root")
        .register([
            Definition::from(&a),
            Definition::from(&b),
            Definition::from(&c),
        ])
        .build();

    let err = run(root).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Lifecycle(LifecycleError::InitFailed { ref id, .. }) if id == "t.resources.c"
    ));

    let recorded = entries(&trace);
    let disposes: Vec<&String> = recorded
        .iter()
        .filter(|e| e.starts_with("dispose:"))
        .collect();
    assert_eq!(disposes.len(), 2, "exactly the two completed resources");
    // dispose order is the reverse of init completion order
    let inits: Vec<String> = recorded
        .iter()
        .filter(|e| e.starts_with("init:"))
        .map(|e| e.trim_start_matches("init:").to_string())
        .collect();
    let disposed: Vec<String> = disposes
        .iter()
        .map(|e| e.trim_start_matches("dispose:").to_string())
        .collect();
    let mut reversed = inits.clone();
    reversed.reverse();
    assert_eq!(disposed, reversed);
}

#[tokio::test]
async fn dispose_is_idempotent() {
    let trace = trace();
    let a = counting_resource("t.resources.a", 1, &trace);

    let root = Resource::<(), ()>::builder("t.root")
        .register([Definition::from(&a)])
        .build();

    let runtime = run(root).await.unwrap();
    runtime.dispose().await;
    runtime.dispose().await;
    runtime.dispose().await;

    let disposes = entries(&trace)
        .iter()
        .filter(|e| e.starts_with("dispose:"))
        .count();
    assert_eq!(disposes, 1);
}

#[tokio::test]
async fn disposed_runtime_rejects_task_calls() {
    let echo = Task::<u32, u32>::builder("t.tasks.echo")
        .run(|n, _deps, _ctx| async move { Ok(n) })
        .build();
    let root = Resource::<(), ()>::builder("t.root")
        .register([Definition::from(&echo)])
        .build();

    let runtime = run(root).await.unwrap();
    runtime.dispose().await;

    let err = runtime.run_task(&echo, 1).await.unwrap_err();
    assert!(matches!(err, Error::Lifecycle(LifecycleError::Disposed)));
}

#[tokio::test]
async fn dry_run_builds_without_initializing() {
    let trace = trace();
    let a = counting_resource("t.resources.a", 1, &trace);

    let root = Resource::<(), ()>::builder("t.root")
        .register([Definition::from(&a)])
        .build();

    let options = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };
    let runtime = run_with(root, options).await.unwrap();

    assert!(entries(&trace).is_empty(), "no init ran");
    let err = runtime.resource_value(&a).unwrap_err();
    assert!(matches!(
        err,
        Error::Lifecycle(LifecycleError::NotInitialized { ref id }) if id == "t.resources.a"
    ));
    runtime.dispose().await;
}

#[tokio::test]
async fn independent_siblings_all_initialize() {
    let trace = trace();
    let a = counting_resource("t.resources.a", 1, &trace);
    let b = counting_resource("t.resources.b", 2, &trace);
    let c = counting_resource("t.resources.c", 3, &trace);

    let root = Resource::<(), ()>::builder("t.root")
        .register([
            Definition::from(&a),
            Definition::from(&b),
            Definition::from(&c),
        ])
        .build();

    let runtime = run(root).await.unwrap();
    assert_eq!(runtime.resource_value(&a).unwrap(), 1);
    assert_eq!(runtime.resource_value(&b).unwrap(), 2);
    assert_eq!(runtime.resource_value(&c).unwrap(), 3);
    runtime.dispose().await;

    // all three disposed, in the reverse of whatever completion order was
    // observed
    assert_eq!(
        entries(&trace)
            .iter()
            .filter(|e| e.starts_with("dispose:"))
            .count(),
        3
    );
}

#[tokio::test]
async fn resource_cycle_is_rejected_before_boot() {
    // Two resources that name each other; neither init should ever run.
    // The placeholder handle only exists to spell the forward reference.
    let b_placeholder = Resource::<(), i32>::builder("t.resources.b")
        .init(|_c, _d, _x| async move { Ok(0) })
        .build();
    let a = Resource::<(), i32>::builder("t.resources.a")
        .dependencies([DepRef::from(&b_placeholder)])
        .init(|_c, _d, _x| async move {
            panic!("cycle member must not initialize");
        })
        .build();

    let b = Resource::<(), i32>::builder("t.resources.b")
        .dependencies([DepRef::from(&a)])
        .init(|_c, _d, _x| async move {
            panic!("cycle member must not initialize");
        })
        .build();

    let root = Resource::<(), ()>::builder("t.root")
        .register([Definition::from(&a), Definition::from(&b)])
        .build();

    let err = run(root).await.unwrap_err();
    let report = match err {
        Error::Validation(report) => report,
        other => panic!("expected a validation report, got {other}"),
    };
    assert!(report
        .issues
        .iter()
        .any(|issue| issue.to_string().contains("Circular resource dependency")));
}

#[tokio::test]
async fn resource_config_round_trips() {
    #[derive(Clone, Default, PartialEq, Debug)]
    struct PoolCfg {
        size: usize,
    }

    let pool = Resource::<PoolCfg, usize>::builder("t.resources.pool")
        .init(|cfg, _deps, _ctx| async move { Ok(cfg.size * 2) })
        .build();

    let root = Resource::<(), ()>::builder("t.root")
        .register([Definition::from(&pool.with(PoolCfg { size: 4 }))])
        .build();

    let runtime = run(root).await.unwrap();
    assert_eq!(runtime.resource_value(&pool).unwrap(), 8);
    assert_eq!(runtime.resource_config(&pool).unwrap(), PoolCfg { size: 4 });
    runtime.dispose().await;
}

#[tokio::test]
async fn private_context_reaches_init_and_dispose() {
    struct Scratch {
        note: Mutex<String>,
    }

    let seen = trace();
    let seen_dispose = seen.clone();

    let r = Resource::<(), ()>::builder("t.resources.scratchpad")
        .context(|| Scratch {
            note: Mutex::new(String::new()),
        })
        .init(|_cfg, _deps, ctx| async move {
            let scratch = ctx.private::<Scratch>().expect("factory ran");
            *scratch.note.lock().unwrap() = "from init".to_string();
            Ok(())
        })
        .dispose(move |_value, _cfg, _deps, ctx| {
            let seen = seen_dispose.clone();
            async move {
                let scratch = ctx.private::<Scratch>().expect("same instance");
                seen.lock().unwrap().push(scratch.note.lock().unwrap().clone());
                Ok(())
            }
        })
        .build();

    let root = Resource::<(), ()>::builder("t.root")
        .register([Definition::from(&r)])
        .build();

    let runtime = run(root).await.unwrap();
    runtime.dispose().await;
    assert_eq!(entries(&seen), vec!["from init"]);
}
