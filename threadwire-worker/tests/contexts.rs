use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use threadwire_channel::ControllerChannel;
use threadwire_protocol::{ControllerMessage, TaskUid, Value, WorkerMessage};
use threadwire_worker::{Api, SharedWorker, ThreadWorker};

async fn recv(channel: &mut ControllerChannel) -> WorkerMessage {
    channel.receiver.recv().await.unwrap().unwrap()
}

fn run(channel: &ControllerChannel, method: &str) -> TaskUid {
    let uid = TaskUid::new();
    let message = ControllerMessage::Run {
        uid,
        method: method.to_owned(),
        args: Vec::new(),
    };
    channel.sender.send(message, Vec::new()).unwrap();
    uid
}

fn terminate(channel: &ControllerChannel, force_terminate_shared: bool) {
    let message = ControllerMessage::Terminate {
        force_terminate_shared,
    };
    channel.sender.send(message, Vec::new()).unwrap();
}

fn counter_api() -> Api {
    let count = Arc::new(AtomicUsize::new(0));
    Api::new().function("increment", move |_| {
        let value = count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok::<_, String>(value as i64)
    })
}

#[tokio::test]
async fn test_thread_worker_serves_calls() {
    threadwire_log::init_test!();

    let api = Api::new().function("helloWorld", |_| Ok::<_, String>("Hello World!"));
    let mut channel = ThreadWorker::expose("hello", api).unwrap();
    assert!(matches!(recv(&mut channel).await, WorkerMessage::Init { .. }));

    let uid = run(&channel, "helloWorld");
    assert_eq!(
        recv(&mut channel).await,
        WorkerMessage::TaskResult {
            uid,
            result: Value::from("Hello World!")
        }
    );

    terminate(&channel, false);
    assert!(channel.receiver.recv().await.is_none());
}

#[tokio::test]
async fn test_thread_worker_reports_entry_error() {
    let mut channel =
        ThreadWorker::spawn("broken", |_scope| async { Err::<(), _>("no database") }).unwrap();

    assert_eq!(
        recv(&mut channel).await,
        WorkerMessage::UncaughtError {
            error_message: "no database".to_owned()
        }
    );
    assert!(channel.receiver.recv().await.is_none());
}

#[tokio::test]
async fn test_thread_worker_reports_entry_panic() {
    let mut channel = ThreadWorker::spawn("panicking", |_scope| async {
        if true {
            panic!("startup failed");
        }
        Ok::<(), String>(())
    })
    .unwrap();

    assert_eq!(
        recv(&mut channel).await,
        WorkerMessage::UncaughtError {
            error_message: "startup failed".to_owned()
        }
    );
}

#[tokio::test]
async fn test_shared_worker_shares_state() {
    threadwire_log::init_test!();

    let worker = SharedWorker::spawn("counter", counter_api()).unwrap();
    let mut first = worker.connect().unwrap();
    let mut second = worker.connect().unwrap();
    recv(&mut first).await;
    recv(&mut second).await;

    let uid = run(&first, "increment");
    assert_eq!(
        recv(&mut first).await,
        WorkerMessage::TaskResult {
            uid,
            result: Value::Int(1)
        }
    );

    let uid = run(&second, "increment");
    assert_eq!(
        recv(&mut second).await,
        WorkerMessage::TaskResult {
            uid,
            result: Value::Int(2)
        }
    );
}

#[tokio::test]
async fn test_shared_worker_terminate_disconnects_client() {
    let worker = SharedWorker::spawn("counter", counter_api()).unwrap();
    let mut first = worker.connect().unwrap();
    let mut second = worker.connect().unwrap();
    recv(&mut first).await;
    recv(&mut second).await;

    terminate(&first, false);
    assert!(first.receiver.recv().await.is_none());

    let uid = run(&second, "increment");
    assert!(matches!(
        recv(&mut second).await,
        WorkerMessage::TaskResult { uid: reply, .. } if reply == uid
    ));
    assert!(worker.is_running());
}

#[tokio::test]
async fn test_shared_worker_force_terminate() {
    let worker = SharedWorker::spawn("counter", counter_api()).unwrap();
    let mut first = worker.connect().unwrap();
    let mut second = worker.connect().unwrap();
    recv(&mut first).await;
    recv(&mut second).await;

    terminate(&first, true);
    assert!(first.receiver.recv().await.is_none());
    assert!(second.receiver.recv().await.is_none());

    assert!(!worker.is_running());
    assert!(worker.connect().is_err());
}
