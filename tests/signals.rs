mod common;

use busrpc::{
    signals::{self, SignalRouter},
    Connection, Filtered, MatchRule, MemoryBus, Message, Method, Object, Outcome, Value,
};
use common::*;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::mpsc;

const TICK_PATH: &str = "/com/example/Ticker";

fn tick(sender: &str, path: &str, member: &str) -> Message {
    let mut message = Message::signal(path, SIGNALS_IFACE, member).unwrap();
    message.set_sender(sender).unwrap();
    message
}

#[test]
fn router_matches_exactly() {
    let mut router = SignalRouter::new();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = || {
        let count = count.clone();
        Arc::new(move |_: &Message| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };

    let rule = MatchRule::signal(":1.7", TICK_PATH, SIGNALS_IFACE, "Tick").unwrap();
    let first = router.subscribe(rule.clone(), counter());
    router.subscribe(rule.clone(), counter());
    assert_eq!(router.len(), 2);

    let handlers = router.matching(&tick(":1.7", TICK_PATH, "Tick"));
    signals::deliver(&handlers, &tick(":1.7", TICK_PATH, "Tick"));
    assert_eq!(count.load(Ordering::SeqCst), 2);

    for other in [
        tick(":1.8", TICK_PATH, "Tick"),
        tick(":1.7", "/elsewhere", "Tick"),
        tick(":1.7", TICK_PATH, "Tock"),
    ] {
        assert!(router.matching(&other).is_empty(), "{other}");
    }

    assert_eq!(router.unsubscribe(first), Some(rule));
    assert_eq!(router.unsubscribe(first), None);
    assert_eq!(router.matching(&tick(":1.7", TICK_PATH, "Tick")).len(), 1);
}

#[test]
fn panicking_handlers_do_not_stop_delivery() {
    let count = Arc::new(AtomicUsize::new(0));
    let after = count.clone();
    let handlers: Vec<signals::SignalHandler> = vec![
        Arc::new(|_: &Message| panic!("handler failed")),
        Arc::new(move |_: &Message| {
            after.fetch_add(1, Ordering::SeqCst);
        }),
    ];
    signals::deliver(&handlers, &tick(":1.7", TICK_PATH, "Tick"));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn match_rule_strings() {
    let rule = MatchRule::signal("com.example.Ticker", TICK_PATH, SIGNALS_IFACE, "Tick").unwrap();
    let text = rule.to_string();
    assert_eq!(
        text,
        "type='signal',sender='com.example.Ticker',path='/com/example/Ticker',interface='com.example.Signals',member='Tick'"
    );
    assert_eq!(text.parse::<MatchRule>().unwrap(), rule);

    assert!("type='method_call'".parse::<MatchRule>().is_err());
    assert!("type='signal',path='not a path'".parse::<MatchRule>().is_err());
    assert!("type='signal',colour='blue'".parse::<MatchRule>().is_err());
    assert!(MatchRule::signal("com.example.Ticker", TICK_PATH, SIGNALS_IFACE, "Not-A-Member").is_err());
}

#[tokio::test]
async fn handlers_fire_independently() {
    init_tracing();
    let bus = MemoryBus::new();
    let server = Connection::new(bus.connect());
    server.spawn();
    let client = Connection::new(bus.connect());
    client.spawn();
    let server_name = unique_name(&server);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscribe = |tag: &'static str| {
        let tx = tx.clone();
        client
            .connect_to_signal(&server_name, TICK_PATH, SIGNALS_IFACE, "Tick", move |message| {
                let _ = tx.send((tag, message.first_str().unwrap_or_default().to_owned()));
            })
            .unwrap()
    };
    let a = subscribe("a");
    subscribe("b");

    let emit = |path: &str, member: &str, arg: &str| {
        server
            .emit_signal(path, SIGNALS_IFACE, member, "s", vec![arg.into()], None)
            .unwrap();
    };
    emit(TICK_PATH, "Tick", "1");
    emit(TICK_PATH, "Tock", "x");
    emit("/elsewhere", "Tick", "y");
    emit(TICK_PATH, "Tick", "2");

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(within(rx.recv()).await.unwrap());
    }
    let expected = [("a", "1"), ("b", "1"), ("a", "2"), ("b", "2")].map(|(t, v)| (t, v.to_owned()));
    assert_eq!(seen, expected);

    assert!(client.disconnect_signal(a).unwrap());
    assert!(!client.disconnect_signal(a).unwrap());
    emit(TICK_PATH, "Tick", "3");
    assert_eq!(within(rx.recv()).await.unwrap(), ("b", "3".to_owned()));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn handlers_can_emit_declared_signals() {
    init_tracing();
    let bus = MemoryBus::new();
    let server = Connection::new(bus.connect());
    let ticker = Object::builder()
        .method(
            Method::new(SIGNALS_IFACE, "Fire", |ctx, args| async move {
                match ctx.emit("Tick", args) {
                    Ok(_) => Outcome::empty(),
                    Err(e) => Outcome::Fault(Box::new(e)),
                }
            })
            .args_in("s")
            .args_out(""),
        )
        .signal(busrpc::Signal::new(SIGNALS_IFACE, "Tick").args("s"))
        .build()
        .unwrap();
    server.publish(TICK_PATH, ticker).unwrap();
    server.spawn();

    let client = Connection::new(bus.connect());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .connect_to_signal(&unique_name(&server), TICK_PATH, SIGNALS_IFACE, "Tick", move |message| {
            let _ = tx.send(message.args().to_vec());
        })
        .unwrap();
    // filters see the signal too
    let filtered = Arc::new(AtomicUsize::new(0));
    let seen_by_filter = filtered.clone();
    client.add_filter(move |_, message| {
        if message.member() == Some("Tick") {
            seen_by_filter.fetch_add(1, Ordering::SeqCst);
        }
        Filtered::Pass
    });

    let proxy = client.proxy(&unique_name(&server), TICK_PATH, &[]).await.unwrap();
    proxy.call("Fire", vec!["bang".into()]).await.unwrap();
    client.spawn();

    assert_eq!(within(rx.recv()).await.unwrap(), [Value::from("bang")]);
    assert_eq!(filtered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn proxies_connect_to_signals() {
    init_tracing();
    let bus = MemoryBus::new();
    let server = Connection::new(bus.connect());
    server.publish(ECHO_PATH, echo_object()).unwrap();
    server.spawn();
    let client = Connection::new(bus.connect());

    let proxy = client.proxy(&unique_name(&server), ECHO_PATH, &[]).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    proxy
        .connect("Tick", move |args| {
            let _ = tx.send(args);
        })
        .unwrap();
    assert!(proxy.connect("Tock", |_| {}).is_err());
    client.spawn();

    server
        .emit_signal(ECHO_PATH, SIGNALS_IFACE, "Tick", "s", vec!["from proxy".into()], None)
        .unwrap();
    assert_eq!(within(rx.recv()).await.unwrap(), [Value::from("from proxy")]);
}
