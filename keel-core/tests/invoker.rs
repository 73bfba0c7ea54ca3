//! Task invocation: middleware onions, journals, interceptors, schemas,
//! phantom routing, and the post-boot lock.

use std::sync::{Arc, Mutex};

use keel_core::prelude::*;
use keel_core::{tunnel_tag, Error, JournalError, LifecycleError, RegistryError, SchemaBoundary};

type Trace = Arc<Mutex<Vec<String>>>;

fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(trace: &Trace) -> Vec<String> {
    trace.lock().unwrap().clone()
}

async fn boot(defs: Vec<Definition>) -> Runtime {
    let root = Resource::<(), ()>::builder("t.root").register(defs).build();
    run(root).await.unwrap()
}

const CHAIN_KEY: JournalKey<String> = JournalKey::new("t.journal.chain");

#[tokio::test]
async fn middleware_cooperate_through_the_journal() {
    let outer = TaskMiddleware::<()>::builder("t.mw.outer").run(|ctx, next| async move {
        ctx.journal.set(&CHAIN_KEY, "outer".to_string())?;
        next.invoke(ctx.input.clone()).await
    });
    let inner = TaskMiddleware::<()>::builder("t.mw.inner").run(|ctx, next| async move {
        let so_far = ctx.journal.get(&CHAIN_KEY).unwrap_or_default();
        ctx.journal.set_override(&CHAIN_KEY, format!("{so_far}|inner"));
        next.invoke(ctx.input.clone()).await
    });

    let task = Task::<(), String>::builder("t.tasks.read-chain")
        .middleware([MwUse::from(&outer), MwUse::from(&inner)])
        .run(|_input, _deps, ctx| async move {
            Ok(ctx.journal.get(&CHAIN_KEY).unwrap_or_default())
        })
        .build();

    let runtime = boot(vec![
        Definition::from(&outer),
        Definition::from(&inner),
        Definition::from(&task),
    ])
    .await;

    assert_eq!(runtime.run_task(&task, ()).await.unwrap(), "outer|inner");
    runtime.dispose().await;
}

#[tokio::test]
async fn declaration_order_is_onion_order() {
    let trace = trace();

    let mk = |id: &str, marker: &str, trace: &Trace| {
        let marker = marker.to_string();
        let trace = trace.clone();
        TaskMiddleware::<()>::builder(id).run(move |ctx, next| {
            let marker = marker.clone();
            let trace = trace.clone();
            async move {
                trace.lock().unwrap().push(format!("{marker}:before"));
                let out = next.invoke(ctx.input.clone()).await;
                trace.lock().unwrap().push(format!("{marker}:after"));
                out
            }
        })
    };

    let first = mk("t.mw.first", "first", &trace);
    let second = mk("t.mw.second", "second", &trace);

    let body_trace = trace.clone();
    let task = Task::<(), ()>::builder("t.tasks.noop")
        .middleware([MwUse::from(&first), MwUse::from(&second)])
        .run(move |_input, _deps, _ctx| {
            let trace = body_trace.clone();
            async move {
                trace.lock().unwrap().push("body".into());
                Ok(())
            }
        })
        .build();

    let runtime = boot(vec![
        Definition::from(&first),
        Definition::from(&second),
        Definition::from(&task),
    ])
    .await;

    runtime.run_task(&task, ()).await.unwrap();
    assert_eq!(
        entries(&trace),
        vec![
            "first:before",
            "second:before",
            "body",
            "second:after",
            "first:after"
        ]
    );
    runtime.dispose().await;
}

#[tokio::test]
async fn middleware_can_short_circuit() {
    let cache = TaskMiddleware::<()>::builder("t.mw.cached").run(|_ctx, _next| async move {
        Ok(Arc::new("cached answer".to_string()) as AnyValue)
    });

    let task = Task::<(), String>::builder("t.tasks.expensive")
        .middleware([MwUse::from(&cache)])
        .run(|_input, _deps, _ctx| async move {
            panic!("short-circuited body must not run");
        })
        .build();

    let runtime = boot(vec![Definition::from(&cache), Definition::from(&task)]).await;
    assert_eq!(runtime.run_task(&task, ()).await.unwrap(), "cached answer");
    runtime.dispose().await;
}

#[tokio::test]
async fn everywhere_middleware_applies_globally_with_self_exclusion() {
    let trace = trace();

    let plain = Task::<(), ()>::builder("t.tasks.plain")
        .run(|_i, _d, _c| async move { Ok(()) })
        .build();
    let wrapped_by_global = Task::<(), ()>::builder("t.tasks.other")
        .run(|_i, _d, _c| async move { Ok(()) })
        .build();

    // the global middleware depends on `plain`, so it must not wrap it
    let seen = trace.clone();
    let global = TaskMiddleware::<()>::builder("t.mw.global")
        .dependencies([DepRef::from(&plain)])
        .everywhere()
        .run(move |ctx, next| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(ctx.task.id.clone());
                next.invoke(ctx.input.clone()).await
            }
        });

    let runtime = boot(vec![
        Definition::from(&plain),
        Definition::from(&wrapped_by_global),
        Definition::from(&global),
    ])
    .await;

    runtime.run_task(&plain, ()).await.unwrap();
    runtime.run_task(&wrapped_by_global, ()).await.unwrap();

    assert_eq!(entries(&trace), vec!["t.tasks.other"]);
    runtime.dispose().await;
}

#[tokio::test]
async fn per_task_interceptors_wrap_the_body_inside_the_chain() {
    let double = Task::<u32, u32>::builder("t.tasks.double")
        .run(|n, _deps, _ctx| async move { Ok(n * 2) })
        .build();

    let double_handle = double.clone();
    let wiring = Resource::<(), ()>::builder("t.resources.wiring")
        .init(move |_cfg, _deps, ctx| {
            let double = double_handle.clone();
            async move {
                // first registered is outermost
                ctx.intercept_task(&double, |next, input: u32| async move {
                    let out = next.invoke(input + 1).await?;
                    Ok(out + 1000)
                })?;
                ctx.intercept_task(&double, |next, input: u32| async move {
                    next.invoke(input * 10).await
                })?;
                Ok(())
            }
        })
        .build();

    let runtime = boot(vec![Definition::from(&double), Definition::from(&wiring)]).await;

    // input 3 -> outer (+1 = 4) -> inner (*10 = 40) -> body (*2 = 80)
    // -> outer (+1000 = 1080)
    assert_eq!(runtime.run_task(&double, 3).await.unwrap(), 1080);
    runtime.dispose().await;
}

#[tokio::test]
async fn short_circuiting_middleware_skips_interceptors() {
    let hits = trace();

    let wall = TaskMiddleware::<()>::builder("t.mw.wall").run(|_ctx, _next| async move {
        Ok(Arc::new("walled".to_string()) as AnyValue)
    });

    let task = Task::<(), String>::builder("t.tasks.guarded")
        .middleware([MwUse::from(&wall)])
        .run(|_i, _d, _c| async move { Ok("body".to_string()) })
        .build();

    let task_for_wiring = task.clone();
    let hits_in_interceptor = hits.clone();
    let wiring = Resource::<(), ()>::builder("t.resources.wiring")
        .init(move |_cfg, _deps, ctx| {
            let task = task_for_wiring.clone();
            let hits = hits_in_interceptor.clone();
            async move {
                ctx.intercept_task(&task, move |next, input: ()| {
                    let hits = hits.clone();
                    async move {
                        hits.lock().unwrap().push("interceptor".into());
                        next.invoke(input).await
                    }
                })?;
                Ok(())
            }
        })
        .build();

    let runtime = boot(vec![
        Definition::from(&task),
        Definition::from(&wall),
        Definition::from(&wiring),
    ])
    .await;

    assert_eq!(runtime.run_task(&task, ()).await.unwrap(), "walled");
    assert!(entries(&hits).is_empty(), "interceptors never ran");
    runtime.dispose().await;
}

#[tokio::test]
async fn input_and_result_schemas_guard_the_boundaries() {
    let task = Task::<u32, u32>::builder("t.tasks.bounded")
        .input_schema(Schema::from_fn(|n: &u32| {
            if *n > 0 {
                Ok(())
            } else {
                Err("must be positive".into())
            }
        }))
        .result_schema(Schema::from_fn(|n: &u32| {
            if *n < 100 {
                Ok(())
            } else {
                Err("result out of range".into())
            }
        }))
        .run(|n, _deps, _ctx| async move { Ok(n * 50) })
        .build();

    let runtime = boot(vec![Definition::from(&task)]).await;

    assert_eq!(runtime.run_task(&task, 1).await.unwrap(), 50);

    let err = runtime.run_task(&task, 0).await.unwrap_err();
    match err {
        Error::Schema(violation) => assert_eq!(violation.boundary, SchemaBoundary::Input),
        other => panic!("expected an input schema violation, got {other}"),
    }

    let err = runtime.run_task(&task, 3).await.unwrap_err();
    match err {
        Error::Schema(violation) => assert_eq!(violation.boundary, SchemaBoundary::Result),
        other => panic!("expected a result schema violation, got {other}"),
    }
    runtime.dispose().await;
}

#[tokio::test]
async fn unrouted_phantom_task_resolves_to_none() {
    let ghost = Task::<u32, Option<String>>::builder("t.tasks.ghost").phantom();
    let runtime = boot(vec![Definition::from(&ghost)]).await;

    assert_eq!(runtime.run_task(&ghost, 1).await.unwrap(), None);
    runtime.dispose().await;
}

#[tokio::test]
async fn owned_phantom_task_routes_through_its_tunnel() {
    let ghost = Task::<u32, Option<String>>::builder("t.tasks.ghost").phantom();

    let tunnel = Resource::<(), TunnelValue>::builder("t.resources.tunnel")
        .tags([tunnel_tag().with(TunnelCfg {
            tasks: vec!["t.tasks.ghost".into()],
            ..TunnelCfg::default()
        })])
        .init(|_cfg, _deps, _ctx| async move {
            Ok(TunnelValue::new(|task_id, _input| async move {
                Ok(Arc::new(Some(format!("routed:{task_id}"))) as AnyValue)
            }))
        })
        .build();

    let runtime = boot(vec![Definition::from(&ghost), Definition::from(&tunnel)]).await;

    assert_eq!(
        runtime.run_task(&ghost, 9).await.unwrap(),
        Some("routed:t.tasks.ghost".to_string())
    );
    runtime.dispose().await;
}

#[tokio::test]
async fn unknown_task_id_is_rejected() {
    let runtime = boot(Vec::new()).await;
    let err = runtime
        .run_task_erased("t.tasks.missing", Arc::new(()) as AnyValue)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Registry(RegistryError::UnknownId { ref id }) if id == "t.tasks.missing"
    ));
    runtime.dispose().await;
}

#[tokio::test]
async fn interceptor_registration_is_rejected_after_lock() {
    let noop = Task::<(), ()>::builder("t.tasks.noop")
        .run(|_i, _d, _c| async move { Ok(()) })
        .build();

    let stash: Arc<Mutex<Option<InitContext>>> = Arc::new(Mutex::new(None));
    let stash_in_init = stash.clone();
    let wiring = Resource::<(), ()>::builder("t.resources.wiring")
        .init(move |_cfg, _deps, ctx| {
            let stash = stash_in_init.clone();
            async move {
                stash.lock().unwrap().replace(ctx.clone());
                Ok(())
            }
        })
        .build();

    let runtime = boot(vec![Definition::from(&noop), Definition::from(&wiring)]).await;

    let ctx = stash.lock().unwrap().take().unwrap();
    let err = ctx
        .intercept_task(&noop, |next, input: ()| async move { next.invoke(input).await })
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Registry(RegistryError::Locked { .. })
    ));
    runtime.dispose().await;
}

#[tokio::test]
async fn forwarded_journals_are_shared_across_calls() {
    const STAMP: JournalKey<String> = JournalKey::new("t.journal.stamp");

    let writer = Task::<(), ()>::builder("t.tasks.writer")
        .run(|_i, _d, ctx| async move {
            ctx.journal.set(&STAMP, "from writer".to_string())?;
            Ok(())
        })
        .build();

    let runtime = boot(vec![Definition::from(&writer)]).await;

    let journal = Journal::new();
    runtime
        .run_task_with_journal(&writer, (), journal.clone())
        .await
        .unwrap();
    assert_eq!(journal.get(&STAMP).as_deref(), Some("from writer"));

    // a second write through the same forwarded journal fails fast
    let err = runtime
        .run_task_with_journal(&writer, (), journal)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Journal(JournalError::KeyInUse { .. })));
    runtime.dispose().await;
}

#[tokio::test]
async fn tasks_can_call_tasks_through_dependencies() {
    let inner = Task::<u32, u32>::builder("t.tasks.inner")
        .run(|n, _d, _c| async move { Ok(n + 1) })
        .build();

    let inner_handle = inner.clone();
    let outer = Task::<u32, u32>::builder("t.tasks.outer")
        .dependencies([DepRef::from(&inner)])
        .run(move |n, deps, _ctx| {
            let inner = inner_handle.clone();
            async move { deps.task(&inner)?.call(n * 2).await }
        })
        .build();

    let runtime = boot(vec![Definition::from(&inner), Definition::from(&outer)]).await;
    assert_eq!(runtime.run_task(&outer, 10).await.unwrap(), 21);
    runtime.dispose().await;
}

#[tokio::test]
async fn undeclared_dependencies_are_refused_at_use() {
    let inner = Task::<u32, u32>::builder("t.tasks.inner")
        .run(|n, _d, _c| async move { Ok(n) })
        .build();

    let inner_handle = inner.clone();
    let sneaky = Task::<u32, u32>::builder("t.tasks.sneaky")
        .run(move |n, deps, _ctx| {
            let inner = inner_handle.clone();
            async move {
                // never declared `inner`
                deps.task(&inner)?.call(n).await
            }
        })
        .build();

    let runtime = boot(vec![Definition::from(&inner), Definition::from(&sneaky)]).await;
    let err = runtime.run_task(&sneaky, 1).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Registry(RegistryError::NotDeclared { .. })
    ));
    runtime.dispose().await;
}

#[tokio::test]
async fn async_context_require_guards_tasks() {
    let request = AsyncContext::<String>::new("t.ctx.request");

    let request_in_task = request.clone();
    let whoami = Task::<(), String>::builder("t.tasks.whoami")
        .dependencies([DepRef::from(&request)])
        .middleware([MwUse::from(&request.require())])
        .run(move |_i, _d, _c| {
            let request = request_in_task.clone();
            async move { Ok((*request.current()?).clone()) }
        })
        .build();

    let runtime = boot(vec![
        Definition::from(&request),
        Definition::from(&request.require()),
        Definition::from(&whoami),
    ])
    .await;

    let err = runtime.run_task(&whoami, ()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Lifecycle(LifecycleError::ContextMissing { .. })
    ));

    let name = request
        .provide("ada".to_string(), runtime.run_task(&whoami, ()))
        .await
        .unwrap();
    assert_eq!(name, "ada");
    runtime.dispose().await;
}

#[tokio::test]
async fn typed_errors_surface_to_the_caller() {
    #[derive(Clone)]
    struct Missing {
        id: u64,
    }

    let not_found = ErrorKind::<Missing>::builder("t.errors.not-found")
        .code(404)
        .format(|data| format!("nothing under {}", data.id))
        .build();

    let kind_handle = not_found.clone();
    let lookup = Task::<u64, String>::builder("t.tasks.lookup")
        .dependencies([DepRef::from(&not_found)])
        .run(move |id, _deps, _ctx| {
            let not_found = kind_handle.clone();
            async move { Err(not_found.raise(Missing { id })) }
        })
        .build();

    let runtime = boot(vec![Definition::from(&not_found), Definition::from(&lookup)]).await;

    let err = runtime.run_task(&lookup, 7).await.unwrap_err();
    assert!(not_found.is(&err));
    assert_eq!(err.as_app().unwrap().code, Some(404));
    assert_eq!(not_found.data_of(&err).unwrap().id, 7);
    runtime.dispose().await;
}
