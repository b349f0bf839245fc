#![allow(dead_code)]

use busrpc::{
    names::ERROR_FAILED, Connection, Method, MethodError, Object, Outcome, Signal, Value,
};
use std::{future::Future, time::Duration};
use tracing_subscriber::EnvFilter;

pub const ECHO_PATH: &str = "/com/example/Echo";
pub const ECHO_IFACE: &str = "com.example.Echo";
pub const SIGNALS_IFACE: &str = "com.example.Signals";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fail the test instead of hanging when something never arrives.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

pub fn unique_name(connection: &Connection) -> String {
    connection.unique_name().expect("connection has no name")
}

fn explode() -> Outcome {
    panic!("handler went wrong")
}

/// The object most tests talk to.
pub fn echo_object() -> Object {
    Object::builder()
        .method(
            Method::new(ECHO_IFACE, "Echo", |_, mut args| async move { Outcome::value(args.remove(0)) })
                .args_in("s")
                .args_out("s"),
        )
        .method(Method::typed(ECHO_IFACE, "Add", |_, (a, b): (i32, i32)| async move {
            Ok::<_, MethodError>((a + b,))
        }))
        .method(
            Method::new(ECHO_IFACE, "Pair", |_, _| async {
                Outcome::tuple(vec!["left".into(), 2i32.into()])
            })
            .args_in("")
            .args_out("si"),
        )
        .method(
            Method::new(ECHO_IFACE, "Nothing", |_, _| async { Outcome::value(1i32) })
                .args_in("")
                .args_out(""),
        )
        .method(
            Method::new(ECHO_IFACE, "RaiseError", |_, args| async move {
                let name = args.first().and_then(Value::as_str).unwrap_or(ERROR_FAILED).to_owned();
                Outcome::error(name)
            })
            .args_in("s"),
        )
        .method(
            Method::new(ECHO_IFACE, "EarlyReply", |ctx, _| async move {
                match ctx.reply("s", vec!["early".into()]) {
                    Ok(outcome) => outcome,
                    Err(e) => Outcome::Fault(Box::new(e)),
                }
            })
            .args_in("")
            .args_out("s"),
        )
        .method(
            Method::new(ECHO_IFACE, "Panic", |_, _| async { explode() })
                .args_in("")
                .args_out("s"),
        )
        .method(
            Method::new(ECHO_IFACE, "Slow", |_, _| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Outcome::value("late")
            })
            .args_in("")
            .args_out("s"),
        )
        .method(
            Method::new(ECHO_IFACE, "Silent", |_, _| async { Outcome::Suppressed })
                .args_in("")
                .args_out("s"),
        )
        .method(Method::new("com.example.A", "Who", |_, _| async { Outcome::value("A") }).args_out("s"))
        .method(Method::new("com.example.B", "Who", |_, _| async { Outcome::value("B") }).args_out("s"))
        .signal(Signal::new(SIGNALS_IFACE, "Tick").args("s"))
        .build()
        .expect("valid object")
}
