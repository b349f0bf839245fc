use busrpc::{Connection, MemoryBus, Method, Object, Outcome, Signal};
use tokio::sync::mpsc;

const PATH: &str = "/com/example/Clock";
const IFACE: &str = "com.example.Clock";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let bus = MemoryBus::new();
    let server = Connection::new(bus.connect());
    let clock = Object::builder()
        .method(
            Method::new(IFACE, "Tick", |ctx, args| async move {
                match ctx.emit("Ticked", args) {
                    Ok(_) => Outcome::empty(),
                    Err(e) => Outcome::Fault(Box::new(e)),
                }
            })
            .args_in("u")
            .args_out(""),
        )
        .signal(Signal::new(IFACE, "Ticked").args("u"))
        .build()
        .unwrap();
    server.publish(PATH, clock).unwrap();
    server.spawn();

    let client = Connection::new(bus.connect());
    let proxy = client
        .proxy(&server.unique_name().unwrap(), PATH, &[])
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    proxy
        .connect("Ticked", move |args| {
            let _ = tx.send(args);
        })
        .unwrap();
    client.spawn();

    for n in 1..=3u32 {
        proxy.call("Tick", vec![n.into()]).await.unwrap();
        println!("ticked: {:?}", rx.recv().await.unwrap());
    }
}
