use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use threadwire_protocol::{Buffer, Payload, TransferDescriptor, Value};
use threadwire_threading::{
    CallError, PoolError, PoolEvent, SpawnError, Thread, ThreadError, ThreadOptions, ThreadPool,
    ThreadState,
};
use threadwire_worker::{Api, Args, ThreadWorker};

fn demo_api() -> Api {
    Api::new()
        .function("helloWorld", |_| Ok::<_, String>("Hello World!"))
        .function("boom", |_| Err::<(), _>("boom"))
        .function("echo", |args: Args| {
            let buffer: Buffer = args.arg(0).map_err(|e| e.to_string())?;
            Ok::<_, String>(TransferDescriptor::buffer(buffer))
        })
        .method("sleep", |args: Args| async move {
            let millis: i64 = args.arg(0).map_err(|e| e.to_string())?;
            tokio::time::sleep(Duration::from_millis(millis as u64)).await;
            Ok::<_, String>(millis)
        })
}

async fn spawn_demo(index: usize) -> Result<Thread, SpawnError> {
    let channel = ThreadWorker::expose(format!("demo-{index}"), demo_api())?;
    Thread::spawn(channel, ThreadOptions::default()).await
}

#[tokio::test]
async fn test_pool_hello_world() {
    threadwire_log::init_test!();

    let pool = ThreadPool::builder(spawn_demo).size(1).spawn().await.unwrap();

    let result = pool
        .queue(|thread| thread.methods().get("helloWorld").unwrap().call(Vec::new()))
        .await;
    assert_eq!(result, Ok(Value::from("Hello World!")));

    pool.terminate(false).await.unwrap();
    assert_eq!(pool.threads()[0].state(), ThreadState::Terminated);
}

#[tokio::test]
async fn test_failed_call_only_rejects_its_task() {
    let thread = spawn_demo(0).await.unwrap();

    let pending = thread.call("sleep", vec![Payload::from(50)]);
    let error = thread.call("boom", Vec::new()).await.unwrap_err();

    assert_eq!(error.to_string(), "boom");
    assert_eq!(thread.state(), ThreadState::Ready);
    assert_eq!(pending.await, Ok(Value::Int(50)));

    thread.terminate(false).await.unwrap();
}

#[tokio::test]
async fn test_transfer_round_trip() {
    let thread = spawn_demo(0).await.unwrap();

    let buffer = Buffer::from(vec![0, 1, 2, 3]);
    let descriptor = TransferDescriptor::buffer(buffer.clone());
    let result = thread.call("echo", vec![descriptor.into()]).await.unwrap();

    assert!(buffer.is_detached());
    assert_eq!(buffer.len(), 0);

    let received = result.as_buffer().unwrap();
    assert_eq!(received.to_vec(), vec![0, 1, 2, 3]);

    thread.terminate(false).await.unwrap();
}

#[tokio::test]
async fn test_copied_buffer_stays_usable() {
    let thread = spawn_demo(0).await.unwrap();

    let buffer = Buffer::from(vec![4, 5]);
    let result = thread
        .call("echo", vec![Value::Buffer(buffer.clone()).into()])
        .await
        .unwrap();

    assert!(!buffer.is_detached());
    assert_eq!(result.as_buffer().unwrap(), &buffer);

    thread.terminate(false).await.unwrap();
}

#[tokio::test]
async fn test_queue_picks_least_loaded() {
    let pool = ThreadPool::builder(spawn_demo).size(2).spawn().await.unwrap();

    let first = pool.queue(|thread| thread.call("sleep", vec![Payload::from(200)]));
    let second = pool.queue(|thread| thread.call("sleep", vec![Payload::from(200)]));

    assert_eq!(pool.threads()[0].num_queued_tasks(), 1);
    assert_eq!(pool.threads()[1].num_queued_tasks(), 1);
    assert_eq!(pool.num_queued_tasks(), 2);

    pool.resolved().await.unwrap();
    assert!(first.is_settled());
    assert!(second.is_settled());

    pool.terminate(false).await.unwrap();
}

#[tokio::test]
async fn test_pool_spawn_rolls_back() {
    threadwire_log::init_test!();

    let spawned = Arc::new(Mutex::new(Vec::new()));
    let cleaned_up = Arc::new(Mutex::new(Vec::new()));

    let error = ThreadPool::builder(spawn_demo)
        .size(3)
        .initialise({
            let spawned = Arc::clone(&spawned);
            move |index, thread| {
                spawned.lock().push(thread);
                async move {
                    match index {
                        1 => Err("init hook failed"),
                        _ => Ok(()),
                    }
                }
            }
        })
        .on_terminate({
            let cleaned_up = Arc::clone(&cleaned_up);
            move |index, _thread| {
                cleaned_up.lock().push(index);
                async { Ok::<_, String>(()) }
            }
        })
        .spawn()
        .await
        .unwrap_err();

    insta::assert_snapshot!(error, @"failed to spawn ThreadPool: thread #1: init hook failed");

    let spawned = spawned.lock();
    assert_eq!(spawned.len(), 3);
    for thread in spawned.iter() {
        assert_eq!(thread.state(), ThreadState::Terminated);
    }

    let mut cleaned_up = cleaned_up.lock().clone();
    cleaned_up.sort();
    assert_eq!(cleaned_up, vec![0, 2]);
}

#[tokio::test]
async fn test_spawn_reports_entry_failure() {
    let channel = ThreadWorker::spawn("broken", |_scope| async { Err::<(), _>("no database") })
        .unwrap();

    let error = Thread::spawn(channel, ThreadOptions::default())
        .await
        .unwrap_err();

    insta::assert_snapshot!(error, @"worker failed to initialize: no database");
}

#[tokio::test]
async fn test_pool_aggregates_uncaught_errors() {
    let pool = ThreadPool::builder(|index| async move {
        let channel = ThreadWorker::spawn(format!("reporter-{index}"), |scope| async move {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let api = Api::new().function("trigger", move |_| {
                tx.send(()).ok();
                Ok::<_, String>(())
            });

            let reporter = async {
                while rx.recv().await.is_some() {
                    scope.report_error("background job failed");
                }
            };

            tokio::select! {
                result = scope.expose(api) => result,
                () = reporter => Ok(()),
            }
        })?;
        Thread::spawn(channel, ThreadOptions::default()).await
    })
    .size(2)
    .spawn()
    .await
    .unwrap();

    let mut errors = pool.errors();
    pool.threads()[1].call("trigger", Vec::new()).await.unwrap();

    assert_eq!(
        errors.recv().await.unwrap(),
        PoolEvent {
            index: 1,
            error: ThreadError::Uncaught("background job failed".to_owned()),
        }
    );
    assert_eq!(pool.threads()[1].state(), ThreadState::Ready);

    pool.terminate(false).await.unwrap();
}

#[tokio::test]
async fn test_terminate_twice_collects_failures() {
    let pool = ThreadPool::builder(spawn_demo).size(2).spawn().await.unwrap();

    pool.terminate(false).await.unwrap();
    let error = pool.terminate(false).await.unwrap_err();

    assert!(matches!(error, PoolError::Terminate { ref failures, .. } if failures.len() == 2));
    insta::assert_snapshot!(
        error,
        @"failed to terminate ThreadPool: thread #0: thread is already terminated; thread #1: thread is already terminated"
    );
}

#[tokio::test]
async fn test_worker_spawns_nested_workers() {
    let api = Api::new().method("delegate", |_| async {
        let inner = spawn_demo(0).await.map_err(|e| e.to_string())?;
        let greeting = inner
            .call("helloWorld", Vec::new())
            .await
            .map_err(|e| e.to_string())?;
        inner.terminate(false).await.map_err(|e| e.to_string())?;
        Ok::<_, String>(greeting)
    });

    let channel = ThreadWorker::expose("outer", api).unwrap();
    let outer = Thread::spawn(channel, ThreadOptions::default()).await.unwrap();

    let result = outer.call("delegate", Vec::new()).await;
    assert_eq!(result, Ok(Value::from("Hello World!")));

    outer.terminate(false).await.unwrap();
}

#[tokio::test]
async fn test_unknown_method_on_pool() {
    let pool = ThreadPool::builder(spawn_demo).size(1).spawn().await.unwrap();

    let result = pool.queue(|thread| thread.call("missing", Vec::new())).await;
    assert_eq!(result, Err(CallError::UnknownMethod("missing".to_owned())));

    pool.terminate(false).await.unwrap();
}
