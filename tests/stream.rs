mod common;

use busrpc::{Address, Connection, Error, MemoryBus, Value};
use common::*;
use tokio::{net::TcpListener, sync::mpsc, task};

async fn serve(bus: &MemoryBus) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let bus = bus.clone();
    task::spawn(async move { bus.serve_listener(listener).await });
    format!("tcp:host=127.0.0.1,port={port}")
}

#[tokio::main(flavor = "current_thread")]
#[test]
async fn calls_over_tcp() {
    init_tracing();
    let bus = MemoryBus::new();
    let address = serve(&bus).await;

    let server = Connection::new(bus.connect());
    server.publish(ECHO_PATH, echo_object()).unwrap();
    server.spawn();

    let client = Connection::shared(&address).await.unwrap();
    let again = Connection::shared(&address).await.unwrap();
    assert!(client.ptr_eq(&again));
    let private = Connection::open(&address).await.unwrap();
    assert!(!client.ptr_eq(&private));

    let name = unique_name(&client);
    assert!(name.starts_with(":1."), "{name}");
    assert!(bus.names().contains(&name));

    let proxy = client.proxy(&unique_name(&server), ECHO_PATH, &[]).await.unwrap();
    for word in ["one", "two", "three"] {
        let echoed = proxy.call("Echo", vec![word.into()]).await.unwrap();
        assert_eq!(echoed.into_single(), Some(word.into()));
    }
    let pair = proxy.call("Pair", Vec::new()).await.unwrap();
    assert_eq!(pair.into_values(), [Value::from("left"), Value::Int32(2)]);

    let names = private.list_names().await.unwrap();
    assert!(names.contains(&name));
    assert!(names.contains(&unique_name(&server)));
}

#[tokio::main(flavor = "current_thread")]
#[test]
async fn signals_over_tcp() {
    init_tracing();
    let bus = MemoryBus::new();
    let address = serve(&bus).await;
    let server = Connection::new(bus.connect());
    server.spawn();

    let client = Connection::open(&address).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .connect_to_signal(&unique_name(&server), ECHO_PATH, SIGNALS_IFACE, "Tick", move |message| {
            let _ = tx.send(message.first_str().map(str::to_owned));
        })
        .unwrap();
    client.spawn();
    // the bus reads each peer in order, so once this is answered the rule is in
    client.list_names().await.unwrap();

    server
        .emit_signal(ECHO_PATH, SIGNALS_IFACE, "Tick", "s", vec!["over the wire".into()], None)
        .unwrap();
    assert_eq!(within(rx.recv()).await.unwrap().as_deref(), Some("over the wire"));
}

#[test]
fn addresses() {
    let address: Address = "tcp:host=127.0.0.1,port=4000".parse().unwrap();
    assert_eq!(
        address,
        Address::Tcp {
            host: "127.0.0.1".into(),
            port: 4000
        }
    );
    assert_eq!(address.to_string(), "tcp:host=127.0.0.1,port=4000");

    let address: Address = "tcp:port=5".parse().unwrap();
    assert_eq!(address.to_string(), "tcp:host=localhost,port=5");

    for bad in ["tcp:host=x", "tcp:port=big", "carrier-pigeon:", "nonsense"] {
        assert!(matches!(bad.parse::<Address>(), Err(Error::InvalidAddress(_))), "{bad}");
    }
}

#[tokio::test]
async fn unreachable_bus() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let result = Connection::open(&format!("tcp:host=127.0.0.1,port={port}")).await;
    assert!(matches!(result, Err(Error::Transport(_))));
}
