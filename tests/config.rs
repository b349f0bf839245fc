use busrpc::{
    config::{DEFAULT_TIMEOUT_MS, ENV_DEFAULT_TIMEOUT_MS, ENV_DISPATCH},
    names::{ERROR_DISCONNECTED, ERROR_TIMEOUT},
    pending::PendingCalls,
    Config, DispatchMode, Message,
};
use std::{
    env,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;

#[test]
fn environment_overrides() {
    assert_eq!(Config::default().default_timeout(), Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)));

    env::set_var(ENV_DEFAULT_TIMEOUT_MS, "1500");
    env::set_var(ENV_DISPATCH, "Spawn");
    let config = Config::from_env();
    assert_eq!(config.default_timeout(), Some(Duration::from_millis(1500)));
    assert_eq!(config.dispatch, DispatchMode::Spawn);

    env::set_var(ENV_DEFAULT_TIMEOUT_MS, "none");
    env::set_var(ENV_DISPATCH, "sideways");
    let config = Config::from_env();
    assert_eq!(config.default_timeout(), None);
    assert_eq!(config.dispatch, DispatchMode::Inline);

    env::set_var(ENV_DEFAULT_TIMEOUT_MS, "soon");
    assert_eq!(Config::from_env().default_timeout_ms, Some(DEFAULT_TIMEOUT_MS));

    env::remove_var(ENV_DEFAULT_TIMEOUT_MS);
    env::remove_var(ENV_DISPATCH);
    assert_eq!(Config::from_env(), Config::default());
}

#[test]
fn pending_calls_resolve_once() {
    let replies = Arc::new(Mutex::new(Vec::new()));
    let record = |tag: u32| {
        let replies = replies.clone();
        Box::new(move |message: Message| {
            replies.lock().unwrap().push((tag, message.error_name().map(str::to_owned)));
        })
    };

    let now = Instant::now();
    let mut pending = PendingCalls::new();
    pending.insert(1, Some(now + Duration::from_millis(10)), record(1));
    pending.insert(2, Some(now + Duration::from_millis(20)), record(2));
    pending.insert(3, None, record(3));
    assert_eq!(pending.next_deadline(), Some(now + Duration::from_millis(10)));

    let expired = pending.expire(now + Duration::from_millis(15), Some(":1.1"));
    assert_eq!(expired.len(), 1);
    for (callback, message) in expired {
        assert_eq!(message.reply_serial(), Some(1));
        assert_eq!(message.destination(), Some(":1.1"));
        callback(message);
    }
    assert!(!pending.contains(1));
    assert!(pending.resolve(1).is_none());

    let callback = pending.resolve(2).unwrap();
    callback(Message::new(busrpc::MessageKind::Return));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending.next_deadline(), None);

    for (callback, message) in pending.drain(None) {
        callback(message);
    }
    assert!(pending.is_empty());

    assert_eq!(
        *replies.lock().unwrap(),
        [
            (1, Some(ERROR_TIMEOUT.to_owned())),
            (2, None),
            (3, Some(ERROR_DISCONNECTED.to_owned()))
        ]
    );
}
