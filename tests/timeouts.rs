mod common;

use busrpc::{
    names::{ERROR_DISCONNECTED, ERROR_TIMEOUT},
    CallOptions, Config, Connection, Error, MemoryBus, Message, MethodCall,
};
use common::*;
use std::time::Duration;
use tokio::{sync::mpsc, time::Instant};

fn pair(client_config: Config) -> (Connection, Connection) {
    init_tracing();
    let bus = MemoryBus::new();
    let server = Connection::new(bus.connect());
    server.publish(ECHO_PATH, echo_object()).unwrap();
    server.spawn();
    (server, Connection::with_config(bus.connect(), client_config))
}

fn no_default_timeout() -> Config {
    Config::default().with_default_timeout(None)
}

#[tokio::test(start_paused = true)]
async fn synchronous_call_times_out() {
    let (server, client) = pair(no_default_timeout());
    let call = MethodCall::new(&unique_name(&server), ECHO_PATH, ECHO_IFACE, "Silent")
        .timeout(Duration::from_millis(100));

    let started = Instant::now();
    let result = client.call_method(call).await;
    assert!(matches!(result, Err(Error::Timeout)), "{result:?}");
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn callback_fires_once_on_timeout() {
    let (server, client) = pair(no_default_timeout());
    client.spawn();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let started = Instant::now();
    let call = MethodCall::new(&unique_name(&server), ECHO_PATH, ECHO_IFACE, "Slow")
        .timeout(Duration::from_millis(100))
        .callback(move |reply: Message| {
            let _ = tx.send((Instant::now(), reply.error_name().map(str::to_owned)));
        });
    assert!(client.call_method(call).await.unwrap().is_none());

    let (fired, error_name) = rx.recv().await.unwrap();
    assert_eq!(error_name.as_deref(), Some(ERROR_TIMEOUT));
    assert!(fired - started >= Duration::from_millis(100));
    assert!(fired - started < Duration::from_millis(500));

    // the late reply finds nobody waiting for it
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn default_timeout_applies() {
    let config = Config::default().with_default_timeout(Some(Duration::from_millis(50)));
    let (server, client) = pair(config);

    let started = Instant::now();
    let call = MethodCall::new(&unique_name(&server), ECHO_PATH, ECHO_IFACE, "Silent");
    assert!(matches!(client.call_method(call).await, Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(50));

    // replies in time are unaffected
    let call = MethodCall::new(&unique_name(&server), ECHO_PATH, ECHO_IFACE, "Echo").args("s", vec!["quick".into()]);
    let reply = client.call_method(call).await.unwrap().unwrap();
    assert_eq!(reply.first_str(), Some("quick"));
}

#[tokio::test(start_paused = true)]
async fn proxy_timeouts() {
    let (server, client) = pair(no_default_timeout());
    let proxy = client.proxy(&unique_name(&server), ECHO_PATH, &[]).await.unwrap();

    let options = CallOptions::default().timeout(Duration::from_millis(200));
    let result = proxy.call_with("Slow", Vec::new(), options).await;
    assert!(matches!(result, Err(Error::Timeout)), "{result:?}");

    let options = CallOptions::default().timeout(Duration::from_secs(2));
    let late = proxy.call_with("Slow", Vec::new(), options).await.unwrap();
    assert_eq!(late.into_single(), Some("late".into()));
}

#[tokio::test]
async fn closing_fails_pending_calls() {
    let (server, client) = pair(no_default_timeout());
    let driver = client.spawn();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let call = MethodCall::new(&unique_name(&server), ECHO_PATH, ECHO_IFACE, "Silent")
        .callback(move |reply: Message| {
            let _ = tx.send(reply.error_name().map(str::to_owned));
        });
    client.call_method(call).await.unwrap();
    client.close();

    assert_eq!(within(rx.recv()).await.unwrap().as_deref(), Some(ERROR_DISCONNECTED));
    within(driver).await.unwrap().unwrap();
    assert!(matches!(
        client.call_method(MethodCall::new(&unique_name(&server), ECHO_PATH, ECHO_IFACE, "Silent")).await,
        Err(Error::Transport(_))
    ));
}
