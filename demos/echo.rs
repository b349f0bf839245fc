use busrpc::{Connection, MemoryBus, Method, MethodError, Object, Outcome};
use std::time::Duration;
use tokio::task;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let bus = MemoryBus::new();
    let tcp = bus.clone();
    task::spawn(async move { tcp.serve_tcp("127.0.0.1:8888").await });
    tokio::time::sleep(Duration::from_secs_f32(0.01)).await;

    let server = Connection::new(bus.connect());
    let hello = Object::builder()
        .method(Method::typed("com.example.Hello", "Hello", |_, (name,): (String,)| async move {
            Ok::<_, MethodError>((format!("Hello, {name}!"),))
        }))
        .method(
            Method::new("com.example.Hello", "Shout", |_, args| async move {
                match args.first().and_then(|arg| arg.as_str()) {
                    Some(text) => Outcome::value(text.to_uppercase()),
                    None => Outcome::error("com.example.Hello.Error.Silence"),
                }
            })
            .args_out("s"),
        )
        .build()
        .unwrap();
    server.publish("/com/example/Hello", hello).unwrap();
    server.request_name("com.example.Hello").await.unwrap();
    server.spawn();

    let client = Connection::open("tcp:host=127.0.0.1,port=8888").await.unwrap();
    let proxy = client
        .proxy("com.example.Hello", "/com/example/Hello", &[])
        .await
        .unwrap();
    let retval = proxy.call("Hello", vec!["world".into()]).await.unwrap();
    println!("{retval:?}");
    let retval = proxy.call("Shout", vec!["quiet please".into()]).await.unwrap();
    println!("{retval:?}");
    let err = proxy.call("Shout", Vec::new()).await.unwrap_err();
    println!("{err}");
}
