#[cfg(test)]
mod tests {
    use crate::*;
    use futures::FutureExt;
    use futures::channel::oneshot;
    use repose_core::{Composition, Dispose, executor};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    type Api = OperationTable<String, (u32, u32), String, String>;
    type ApiOp = Operation<String, (u32, u32), String, String>;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn log_of() -> Rc<RefCell<Vec<String>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn poll_op() -> ApiOp {
        Operation::new(|_: &String, _: (u32, u32)| {
            async { Ok::<_, String>("polled".to_string()) }.boxed_local()
        })
    }

    fn api_with(poll: ApiOp) -> Api {
        OperationTable::builder("https://api.example".to_string())
            .operation("load", |_: &String, (_a, _b): (u32, u32)| {
                async {
                    executor::yield_now().await;
                    Ok::<_, String>("ok".to_string())
                }
                .boxed_local()
            })
            .operation("fail", |base: &String, (a, _): (u32, u32)| {
                let msg = format!("{base}/{a}: boom");
                async move {
                    executor::yield_now().await;
                    Err::<String, _>(msg)
                }
                .boxed_local()
            })
            .with_operation("poll", poll)
            .value("base_url", "https://api.example".to_string())
            .build()
    }

    fn api() -> Api {
        api_with(poll_op())
    }

    #[test]
    fn test_busy_counts_interleaved_calls() {
        let store = BusyStore::new(BusyConfig::default());
        store.increment();
        store.increment();
        store.decrement();
        assert_eq!(store.count(), 1);
        assert!(store.is_busy());

        store.decrement();
        // extra decrements never go below zero
        store.decrement();
        assert_eq!(store.count(), 0);
        assert!(!store.is_busy());
        assert!(!store.effective_busy());
    }

    #[test]
    fn test_busy_visibility_with_parent() {
        let parent = BusyStore::new(BusyConfig::default());
        let child = BusyStore::new(BusyConfig::default().with_parent(parent.link()));
        let local = BusyStore::new(
            BusyConfig::default()
                .with_parent(parent.link())
                .with_visibility(Visibility::AlwaysLocal),
        );

        child.increment();
        assert!(child.is_busy());
        assert!(!child.effective_busy());
        assert!(parent.effective_busy());

        local.increment();
        assert!(local.effective_busy());
        assert_eq!(parent.count(), 2);

        child.decrement();
        local.decrement();
        assert_eq!(parent.count(), 0);
    }

    #[test]
    fn test_busy_without_parent_reports_local_count() {
        let store = BusyStore::new(BusyConfig::default());
        store.increment();
        assert!(store.effective_busy());
        assert!(!store.has_parent());
    }

    #[test]
    fn test_parent_decrement_forwarded_at_zero() {
        let parent = BusyStore::new(BusyConfig::default());
        let child = BusyStore::new(BusyConfig::default().with_parent(parent.link()));

        parent.increment();
        child.decrement();
        assert_eq!(child.count(), 0);
        assert_eq!(parent.count(), 0);
    }

    #[test]
    fn test_remember_busy_invalidates_both_compositions() {
        init_logs();
        let page = Composition::new();
        let section = Composition::new();

        let page_busy = page.compose(|| remember_busy(BusyConfig::default()));
        let link = page_busy.store.link();
        let section_pass =
            || section.compose(|| remember_busy(BusyConfig::default().with_parent(link.clone())));

        let s = section_pass();
        s.store.increment();
        assert!(page.is_invalid());
        assert!(section.is_invalid());

        let p = page.compose(|| remember_busy(BusyConfig::default()));
        assert!(p.busy);
        assert_eq!(p.count, 1);

        let s = section_pass();
        assert_eq!(s.count, 1);
        assert!(!s.busy);
    }

    #[test]
    fn test_guard_rejects_while_busy() {
        init_logs();
        let store = BusyStore::new(BusyConfig::default());
        let save = store.guard("save", |n: u32| async move { Ok::<_, HooksError>(n * 2) });

        assert_eq!(executor::block_on(save(2)), Ok(4));

        store.increment();
        assert_eq!(
            executor::block_on(save(3)),
            Err(HooksError::Blocked {
                name: "save".to_string()
            })
        );

        store.decrement();
        assert_eq!(executor::block_on(save(4)), Ok(8));
    }

    #[test]
    fn test_guard_passes_when_busy_is_suppressed() {
        let parent = BusyStore::new(BusyConfig::default());
        let child = BusyStore::new(BusyConfig::default().with_parent(parent.link()));
        let save = child.guard("save", |n: u32| async move { Ok::<_, HooksError>(n) });

        child.increment();
        assert_eq!(executor::block_on(save(1)), Ok(1));
    }

    #[test]
    fn test_instrument_async_counts_until_settled() {
        let store = BusyStore::new(BusyConfig::default());
        let fetch = store.instrument_async(|n: u32| async move {
            executor::yield_now().await;
            n + 1
        });

        let fut = fetch(1);
        assert_eq!(store.count(), 1);
        assert_eq!(executor::block_on(fut), 2);
        assert_eq!(store.count(), 0);

        // a dropped call releases its count as well
        let fut = fetch(2);
        assert_eq!(store.count(), 1);
        drop(fut);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_operation_counts_across_passes() {
        init_logs();
        let table = api();
        let (exclusions, options) = (ExclusionSet::default(), InstrumentOptions::default());
        let comp = Composition::new();
        let pass = || {
            comp.compose(|| {
                remember_operations(&table, &exclusions, &options, BusyConfig::default())
            })
        };

        let ops = pass();
        assert_eq!(ops.counters.count("load"), 0);
        assert!(!ops.busy.busy);

        let load = match ops.api.operation("load") {
            Some(op) => op.call((1, 2)),
            None => panic!("load is an operation"),
        };
        assert_eq!(ops.counters.count("load"), 1);
        assert_eq!(ops.busy.store.count(), 1);
        assert!(comp.is_invalid());

        let ops = pass();
        assert!(ops.busy.busy);
        assert_eq!(ops.busy_map.get("load"), Some(&true));
        assert_eq!(ops.busy_map.get("fail"), Some(&false));

        assert_eq!(executor::block_on(load), Ok("ok".to_string()));
        let ops = pass();
        assert!(!ops.busy.busy);
        assert_eq!(ops.counters.count("load"), 0);
        assert_eq!(ops.busy_map.get("load"), Some(&false));
    }

    #[test]
    fn test_rejection_passes_through() {
        let table = api();
        let (exclusions, options) = (ExclusionSet::default(), InstrumentOptions::default());
        let comp = Composition::new();
        let ops = comp.compose(|| {
            remember_operations(&table, &exclusions, &options, BusyConfig::default())
        });

        let fail = ops.api.operation("fail").map(|op| op.call((7, 0)));
        assert_eq!(ops.busy.store.count(), 1);
        assert_eq!(
            fail.map(executor::block_on),
            Some(Err("https://api.example/7: boom".to_string()))
        );
        assert_eq!(ops.busy.store.count(), 0);
        assert_eq!(ops.counters.count("fail"), 0);
    }

    #[test]
    fn test_options_transform_settled_calls() {
        let table = api();
        let exclusions = ExclusionSet::default();
        let options = InstrumentOptions::default()
            .on_fulfilled(|v: String| async move { Ok::<_, String>(v.to_uppercase()) }.boxed_local())
            .on_rejected(|e: String| {
                async move { Ok::<String, String>(format!("recovered from {e}")) }.boxed_local()
            });
        let comp = Composition::new();
        let ops = comp.compose(|| {
            remember_operations(&table, &exclusions, &options, BusyConfig::default())
        });

        let load = ops.api.operation("load").map(|op| op.call((1, 1)));
        let fail = ops.api.operation("fail").map(|op| op.call((2, 0)));
        assert_eq!(load.map(executor::block_on), Some(Ok("OK".to_string())));
        assert_eq!(
            fail.map(executor::block_on),
            Some(Ok("recovered from https://api.example/2: boom".to_string()))
        );
        assert_eq!(ops.busy.store.count(), 0);
    }

    #[test]
    fn test_excluded_operation_skips_shared_store() {
        let poll = poll_op();
        let table = api_with(poll.clone());
        let exclusions = ExclusionSet::new([poll.clone()]);
        let options = InstrumentOptions::default();
        let comp = Composition::new();
        let ops = comp.compose(|| {
            remember_operations(&table, &exclusions, &options, BusyConfig::default())
        });

        let Some(wrapped) = ops.api.operation("poll") else {
            panic!("poll is an operation");
        };
        assert!(wrapped.is_excluded());
        assert!(wrapped.original().ptr_eq(&poll));

        let fut = wrapped.call((0, 0));
        assert_eq!(ops.counters.count("poll"), 1);
        assert_eq!(ops.busy.store.count(), 0);
        assert_eq!(executor::block_on(fut), Ok("polled".to_string()));
        assert_eq!(ops.counters.count("poll"), 0);
    }

    #[test]
    fn test_exclusion_is_by_identity() {
        let table = api();
        // same behaviour, different operation
        let exclusions = ExclusionSet::new([poll_op()]);
        let options = InstrumentOptions::default();
        let comp = Composition::new();
        let ops = comp.compose(|| {
            remember_operations(&table, &exclusions, &options, BusyConfig::default())
        });

        let Some(wrapped) = ops.api.operation("poll") else {
            panic!("poll is an operation");
        };
        assert!(!wrapped.is_excluded());
        let fut = wrapped.call((0, 0));
        assert_eq!(ops.busy.store.count(), 1);
        drop(fut);
        assert_eq!(ops.busy.store.count(), 0);
    }

    #[test]
    fn test_values_are_passed_through() {
        let table = api();
        let (exclusions, options) = (ExclusionSet::default(), InstrumentOptions::default());
        let comp = Composition::new();
        let ops = comp.compose(|| {
            remember_operations(&table, &exclusions, &options, BusyConfig::default())
        });

        let (Some(original), Some(passed)) = (table.value("base_url"), ops.api.value("base_url"))
        else {
            panic!("base_url is a value");
        };
        assert!(Rc::ptr_eq(original, passed));
        assert_eq!(
            passed.downcast_ref::<String>().map(String::as_str),
            Some("https://api.example")
        );
        assert!(ops.api.operation("base_url").is_none());
        assert!(ops.counters.busy_map().get("base_url").is_none());
        assert_eq!(
            ops.api.names().collect::<Vec<_>>(),
            vec!["base_url", "fail", "load", "poll"]
        );
    }

    #[test]
    fn test_wrappers_memoised_on_table_identity() {
        let first_table = api();
        let second_table = api();
        let (exclusions, options) = (ExclusionSet::default(), InstrumentOptions::default());
        let comp = Composition::new();
        let pass = |table: &Api| {
            comp.compose(|| {
                remember_operations(table, &exclusions, &options, BusyConfig::default())
            })
        };

        let a = pass(&first_table);
        let b = pass(&first_table);
        assert!(a.api.ptr_eq(&b.api));
        match (a.api.operation("load"), b.api.operation("load")) {
            (Some(x), Some(y)) => assert!(x.ptr_eq(y)),
            _ => panic!("load is an operation"),
        }

        let c = pass(&second_table);
        assert!(!b.api.ptr_eq(&c.api));
        assert_eq!(c.counters.count("load"), 0);
    }

    #[test]
    fn test_concurrent_calls_interleave_counts() {
        type Reply = oneshot::Receiver<Result<u32, String>>;
        let table: OperationTable<(), Reply, u32, String> = OperationTable::builder(())
            .operation("load", |_: &(), reply: Reply| {
                async move {
                    reply
                        .await
                        .unwrap_or_else(|_| Err("sender dropped".to_string()))
                }
                .boxed_local()
            })
            .build();
        let (exclusions, options) = (ExclusionSet::default(), InstrumentOptions::default());
        let comp = Composition::new();
        let ops = comp.compose(|| {
            remember_operations(&table, &exclusions, &options, BusyConfig::default())
        });
        let Some(load) = ops.api.operation("load") else {
            panic!("load is an operation");
        };

        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        let a = load.call(rx_a);
        let b = load.call(rx_b);
        assert_eq!(ops.counters.count("load"), 2);
        assert_eq!(ops.busy.store.count(), 2);

        assert!(tx_b.send(Err("x".to_string())).is_ok());
        assert_eq!(executor::block_on(b), Err("x".to_string()));
        assert_eq!(ops.counters.count("load"), 1);
        assert_eq!(ops.busy.store.count(), 1);

        assert!(tx_a.send(Ok(1)).is_ok());
        assert_eq!(executor::block_on(a), Ok(1));
        assert_eq!(ops.counters.count("load"), 0);
        assert_eq!(ops.busy.store.count(), 0);
    }

    #[test]
    fn test_options_can_flip_settlement() {
        let table = api();
        let exclusions = ExclusionSet::default();
        let counters: Rc<RefCell<Option<OperationCounters>>> = Rc::new(RefCell::new(None));
        let count_at_settle = Rc::new(Cell::new(None));

        let (c, seen) = (counters.clone(), count_at_settle.clone());
        let options = InstrumentOptions::default()
            .on_fulfilled(move |v: String| {
                seen.set(c.borrow().as_ref().map(|c| c.count("load")));
                async move { Err::<String, _>(format!("rejected {v}")) }.boxed_local()
            })
            .on_rejected(|e: String| {
                async move { Err::<String, _>(format!("still {e}")) }.boxed_local()
            });
        let comp = Composition::new();
        let ops = comp.compose(|| {
            remember_operations(&table, &exclusions, &options, BusyConfig::default())
        });
        *counters.borrow_mut() = Some(ops.counters.clone());

        let load = ops.api.operation("load").map(|op| op.call((1, 1)));
        assert_eq!(
            load.map(executor::block_on),
            Some(Err("rejected ok".to_string()))
        );
        // counts are released before post-processing starts
        assert_eq!(count_at_settle.get(), Some(0));

        let fail = ops.api.operation("fail").map(|op| op.call((3, 0)));
        assert_eq!(
            fail.map(executor::block_on),
            Some(Err("still https://api.example/3: boom".to_string()))
        );
        assert_eq!(ops.busy.store.count(), 0);
    }

    #[test]
    fn test_wrappers_rebuilt_on_exclusions_or_callbacks() {
        type Exclusions = ExclusionSet<String, (u32, u32), String, String>;
        type Options = InstrumentOptions<String, String>;
        let table = api();
        let comp = Composition::new();
        let pass = |exclusions: &Exclusions, options: &Options| {
            comp.compose(|| remember_operations(&table, exclusions, options, BusyConfig::default()))
        };

        let exclusions = Exclusions::default();
        let a = pass(&exclusions, &Options::default());
        // a fresh but empty options value has the same callbacks
        let b = pass(&exclusions, &Options::default());
        assert!(a.api.ptr_eq(&b.api));

        let other_exclusions = Exclusions::default();
        let c = pass(&other_exclusions, &Options::default());
        assert!(!b.api.ptr_eq(&c.api));

        let upper = Options::default()
            .on_fulfilled(|v: String| async move { Ok::<_, String>(v.to_uppercase()) }.boxed_local());
        let d = pass(&other_exclusions, &upper);
        assert!(!c.api.ptr_eq(&d.api));
        let e = pass(&other_exclusions, &upper.clone());
        assert!(d.api.ptr_eq(&e.api));

        let recover = upper
            .clone()
            .on_rejected(|_: String| async { Ok::<_, String>(String::new()) }.boxed_local());
        let f = pass(&other_exclusions, &recover);
        assert!(!e.api.ptr_eq(&f.api));
    }

    #[test]
    fn test_stable_callbacks_forward_to_latest() {
        let comp = Composition::new();
        let pass = |n: i32| {
            comp.compose(move || {
                remember_stable_callbacks(CallbackMap::new().with("value", move |()| n))
            })
        };

        let first = pass(1);
        assert_eq!(first.call("value", ()), Some(1));
        let second = pass(2);
        assert!(first.ptr_eq(&second));
        assert_eq!(first.call("value", ()), Some(2));

        let mut listeners: Vec<Callback<(), i32>> = Vec::new();
        if let Some(f) = first.get("value") {
            listeners.push(f.clone());
        }
        if let Some(f) = second.get("value") {
            listeners.retain(|l| !l.ptr_eq(f));
        }
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_stable_callbacks_key_set_fixed_at_first_pass() {
        let comp = Composition::new();
        let first = comp.compose(|| {
            remember_stable_callbacks(CallbackMap::new().with("a", |()| "a1"))
        });
        let second = comp.compose(|| {
            remember_stable_callbacks(CallbackMap::new().with("b", |()| "b2"))
        });

        // a dropped name keeps forwarding to its last callback
        assert_eq!(second.call("a", ()), Some("a1"));
        assert_eq!(second.call("b", ()), None);
        assert_eq!(first.names().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_normalize_keeps_sync_cleanups() {
        let sink = Rc::new(RecordingSink::default());
        let d = Dispose::new(|| ());
        assert!(normalize(d.clone(), "test", sink.clone()).ptr_eq(&d));
        assert!(normalize((), "test", sink.clone()).has_run());
        assert!(normalize(None::<Dispose>, "test", sink.clone()).has_run());
        assert!(sink.reports().is_empty());
    }

    #[test]
    fn test_async_cleanup_reported_later() {
        init_logs();
        let sink = Rc::new(RecordingSink::default());
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();

        let pending = Cleanup::pending(async move { Dispose::new(move || r.set(true)) });
        let out = normalize(pending, "on_init", sink.clone());
        assert!(out.has_run());
        assert!(sink.reports().is_empty());

        executor::run_until_stalled();
        assert_eq!(
            sink.reports(),
            vec![HooksError::AsyncCleanup { owner: "on_init" }]
        );
        assert!(!ran.get());
    }

    #[test]
    fn test_async_unit_is_not_reported() {
        let sink = Rc::new(RecordingSink::default());
        let out = normalize(Cleanup::pending(async {}), "watch", sink.clone());
        executor::run_until_stalled();
        assert!(out.has_run());
        assert!(sink.reports().is_empty());
    }

    #[test]
    fn test_diagnostics_follow_composition_local() {
        let sink = Rc::new(RecordingSink::default());
        let comp = Composition::new();
        comp.compose(|| {
            with_diagnostics(sink.clone(), || {
                on_init(|_| Cleanup::pending(async { Dispose::noop() }));
            })
        });

        executor::run_until_stalled();
        assert_eq!(
            sink.reports(),
            vec![HooksError::AsyncCleanup { owner: "on_init" }]
        );
    }

    #[test]
    fn test_on_init_runs_once() {
        let log = log_of();
        let comp = Composition::new();
        for _ in 0..3 {
            let log = log.clone();
            comp.compose(move || {
                on_init(move |_| {
                    log.borrow_mut().push("init".into());
                    Cleanup::from_fn(move || log.borrow_mut().push("cleanup".into()))
                });
            });
        }
        assert_eq!(*log.borrow(), vec!["init"]);

        comp.dispose();
        assert_eq!(*log.borrow(), vec!["init", "cleanup"]);
    }

    #[test]
    fn test_on_init_with_sees_latest_callbacks() {
        let seen: Rc<RefCell<Option<StableBinding<(), i32>>>> = Rc::new(RefCell::new(None));
        let comp = Composition::new();
        for n in 1..=2 {
            let seen = seen.clone();
            comp.compose(move || {
                on_init_with(CallbackMap::new().with("value", move |()| n), move |this| {
                    *seen.borrow_mut() = Some(this.clone());
                });
            });
        }

        let binding = seen.borrow().clone();
        assert_eq!(binding.and_then(|b| b.call("value", ())), Some(2));
    }

    #[test]
    fn test_on_init_when_ready_flag() {
        let log = log_of();
        let comp = Composition::new();
        let pass = |ready: bool| {
            let log = log.clone();
            comp.compose(move || {
                on_init_when_ready(ready, move |_| {
                    log.borrow_mut().push("init".into());
                    Cleanup::from_fn(move || log.borrow_mut().push("cleanup".into()))
                });
            });
        };

        pass(false);
        pass(false);
        assert!(log.borrow().is_empty());

        pass(true);
        assert_eq!(*log.borrow(), vec!["init"]);

        // readiness going away does not tear down
        pass(false);
        pass(true);
        assert_eq!(*log.borrow(), vec!["init"]);

        comp.dispose();
        assert_eq!(*log.borrow(), vec!["init", "cleanup"]);
    }

    #[test]
    fn test_on_init_when_ready_predicate() {
        let log = log_of();
        let flag = Rc::new(Cell::new(false));
        let comp = Composition::new();
        let pass = || {
            let log = log.clone();
            let flag = flag.clone();
            comp.compose(move || {
                on_init_when_ready(Readiness::when(move || flag.get()), move |_| {
                    log.borrow_mut().push("init".into());
                });
            });
        };

        pass();
        assert!(log.borrow().is_empty());
        flag.set(true);
        pass();
        assert_eq!(*log.borrow(), vec!["init"]);
    }

    #[test]
    fn test_on_init_when_ready_never_ready_has_no_cleanup() {
        let log = log_of();
        let comp = Composition::new();
        {
            let log = log.clone();
            comp.compose(move || {
                on_init_when_ready(false, move |_| {
                    Cleanup::from_fn(move || log.borrow_mut().push("cleanup".into()))
                });
            });
        }
        comp.dispose();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_watch_reruns_on_dep_change() {
        let log = log_of();
        let comp = Composition::new();
        let pass = |dep: i32| {
            let log = log.clone();
            comp.compose(move || {
                watch(vec![dep], move |_, prev: &[Option<i32>]| {
                    log.borrow_mut().push(format!("run {dep} prev {prev:?}"));
                    Cleanup::from_fn(move || log.borrow_mut().push(format!("clean {dep}")))
                });
            });
        };

        pass(1);
        pass(1);
        assert_eq!(*log.borrow(), vec!["run 1 prev [None]"]);

        pass(2);
        assert_eq!(
            *log.borrow(),
            vec!["run 1 prev [None]", "clean 1", "run 2 prev [Some(1)]"]
        );

        comp.dispose();
        assert_eq!(log.borrow().last().map(String::as_str), Some("clean 2"));
    }
}
