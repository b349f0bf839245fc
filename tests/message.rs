use busrpc::{
    names::{ERROR_FAILED, ERROR_INVALID_ARGS},
    types, ArgError, Error, Message, MessageKind, Output, Type, Value,
};
use rand::Rng;
use serde::Serialize;

fn call() -> Message {
    Message::method_call("com.example.Service", "/com/example/Object", "com.example.Iface", "Method").unwrap()
}

#[test]
fn bytes_are_range_checked() {
    let mut message = call();
    message.set_args("y", vec![255u32.into()]).unwrap();
    assert_eq!(message.args(), [Value::Byte(255)]);
    assert_eq!(message.signature(), "y");

    let err = message.set_args("y", vec![256u32.into()]).unwrap_err();
    assert!(err.is_value_error(), "{err}");
    let err = message.set_args("y", vec!["foo".into()]).unwrap_err();
    assert!(err.is_type_error(), "{err}");

    // failed calls leave the previous arguments in place
    assert_eq!(message.args(), [Value::Byte(255)]);
    assert_eq!(message.signature(), "y");
}

#[test]
fn integer_widths() {
    let mut rng = rand::thread_rng();
    let formats: [(&str, i128, i128); 7] = [
        ("n", i16::MIN.into(), i16::MAX.into()),
        ("q", 0, u16::MAX.into()),
        ("i", i32::MIN.into(), i32::MAX.into()),
        ("u", 0, u32::MAX.into()),
        ("x", i64::MIN.into(), i64::MAX.into()),
        ("t", 0, u64::MAX.into()),
        ("y", 0, u8::MAX.into()),
    ];
    for (sig, min, max) in formats {
        let ty = Type::parse(sig).unwrap();
        for _ in 0..100 {
            let n: i64 = rng.gen();
            let value = Value::Int64(n);
            let fits = (min..=max).contains(&i128::from(n));
            match types::coerce(&ty, value) {
                Ok(coerced) => {
                    assert!(fits, "{n} accepted for {sig}");
                    assert_eq!(coerced.as_integer(), Some(i128::from(n)));
                }
                Err(e) => {
                    assert!(!fits, "{n} rejected for {sig}: {e}");
                    assert!(e.is_value_error());
                }
            }
        }
        assert!(types::coerce(&ty, Value::UInt64(max as u64)).is_ok());
        if let Ok(over) = u64::try_from(max + 1) {
            assert!(types::coerce(&ty, Value::UInt64(over)).unwrap_err().is_value_error());
        }
    }
}

#[test]
fn booleans_use_truthiness() {
    let mut message = call();
    let values = vec![
        0i32.into(),
        7i32.into(),
        "".into(),
        "x".into(),
        Value::Array(Vec::new()),
        true.into(),
    ];
    message.set_args("bbbbbb", values).unwrap();
    let bools: Vec<_> = message.args().to_vec();
    assert_eq!(
        bools,
        [false, true, false, true, false, true].map(Value::Boolean)
    );
}

#[test]
fn doubles() {
    let mut message = call();
    message
        .set_args("ddd", vec![f64::INFINITY.into(), 3i32.into(), f64::NAN.into()])
        .unwrap();
    match message.args() {
        [Value::Double(inf), Value::Double(three), Value::Double(nan)] => {
            assert!(inf.is_infinite());
            assert_eq!(*three, 3.0);
            assert!(nan.is_nan());
        }
        other => panic!("unexpected arguments {other:?}"),
    }
    assert!(message.set_args("d", vec!["1.0".into()]).unwrap_err().is_type_error());
}

#[test]
fn strings_paths_and_signatures() {
    let mut message = call();
    message
        .set_args("sog", vec!["text".into(), "/a/b".into(), "a{sv}".into()])
        .unwrap();
    assert_eq!(
        message.args(),
        [
            Value::String("text".into()),
            Value::ObjectPath("/a/b".into()),
            Value::Signature("a{sv}".into())
        ]
    );
    assert!(message.set_args("o", vec!["not/a/path".into()]).unwrap_err().is_value_error());
    assert!(message.set_args("g", vec!["(i".into()]).unwrap_err().is_value_error());
    assert!(message.set_args("s", vec![1i32.into()]).unwrap_err().is_type_error());
}

#[test]
fn containers() {
    let mut message = call();
    let dict = Value::Dict(vec![("one".into(), Value::variant("i", 1i32)), ("two".into(), Value::variant("s", "2"))]);
    let pair = Value::Array(vec!["name".into(), 5u8.into()]);
    let list = Value::Array(vec![1u8.into(), 2u8.into()]);
    message.set_args("a{sv}(si)ai", vec![dict, pair, list]).unwrap();
    assert_eq!(message.signature(), "a{sv}(si)ai");
    assert_eq!(message.args()[1], Value::Struct(vec!["name".into(), 5i32.into()]));
    assert_eq!(message.args()[2], Value::Array(vec![1i32.into(), 2i32.into()]));

    assert!(message.set_args("(si)", vec![Value::Array(vec!["x".into()])]).unwrap_err().is_type_error());
    assert!(message.set_args("v", vec![Value::variant("ii", 1i32)]).unwrap_err().is_value_error());
    assert!(message.set_args("ii", vec![1i32.into()]).unwrap_err().is_type_error());
    assert!(matches!(message.set_args("(i", Vec::new()), Err(ArgError::Value(_))));
}

#[test]
fn replies_answer_calls() {
    let mut message = call();
    message.set_serial(7).unwrap();
    message.set_sender(":1.3").unwrap();

    let reply = message.reply().unwrap();
    assert_eq!(reply.kind(), MessageKind::Return);
    assert_eq!(reply.reply_serial(), Some(7));
    assert_eq!(reply.destination(), Some(":1.3"));

    let error = message.error_reply(ERROR_INVALID_ARGS).unwrap();
    assert!(error.is_error());
    assert_eq!(error.error_name(), Some(ERROR_INVALID_ARGS));
    assert_eq!(error.reply_serial(), Some(7));

    assert!(matches!(message.error_reply("bogus"), Err(Error::InvalidName { .. })));
    assert!(matches!(reply.reply(), Err(Error::NotACall(MessageKind::Return))));
    assert!(matches!(message.set_serial(0), Err(Error::InvalidSerial)));
}

#[test]
fn header_fields_are_validated() {
    assert!(Message::method_call("com.example.Service", "bad path", "com.example.Iface", "M").is_err());
    assert!(Message::signal("/a", "NoDots", "Changed").is_err());

    let mut message = Message::new(MessageKind::Error);
    message.set_error_name(ERROR_FAILED).unwrap();
    assert!(message.set_member("Has.Dot").is_err());
    assert_eq!(message.member(), None);
}

#[test]
fn messages_survive_bincode() {
    let mut message = call();
    message.set_serial(3).unwrap();
    message
        .set_args("sa{sv}", vec!["hi".into(), Value::Dict(vec![("k".into(), Value::variant("u", 9u32))])])
        .unwrap();
    let bytes = bincode::serialize(&message).unwrap();
    let decoded: Message = bincode::deserialize(&bytes).unwrap();
    assert_eq!(decoded, message);
}

/// The field layout `Message` has on the wire.
#[derive(Serialize)]
struct Frame {
    kind: MessageKind,
    no_reply: bool,
    no_auto_start: bool,
    serial: Option<u32>,
    reply_serial: Option<u32>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    signature: String,
    args: Vec<Value>,
}

impl Frame {
    fn call(signature: &str, args: Vec<Value>) -> Self {
        Frame {
            kind: MessageKind::Call,
            no_reply: false,
            no_auto_start: false,
            serial: Some(1),
            reply_serial: None,
            path: Some("/com/example/Object".into()),
            interface: Some("com.example.Iface".into()),
            member: Some("Method".into()),
            error_name: None,
            destination: Some("com.example.Service".into()),
            sender: Some(":1.7".into()),
            signature: signature.into(),
            args,
        }
    }

    fn decode(&self) -> bincode::Result<Message> {
        bincode::deserialize(&bincode::serialize(self).unwrap())
    }
}

#[test]
fn malformed_frames_fail_to_decode() {
    let decoded = Frame::call("s", vec!["ok".into()]).decode().unwrap();
    assert_eq!(decoded.signature(), "s");
    assert_eq!(decoded.sender(), Some(":1.7"));

    let mismatched = Frame::call("s", vec![Value::Int32(7), Value::Int32(8)]);
    assert!(mismatched.decode().is_err());

    let wrong_type = Frame::call("s", vec![Value::Int32(7)]);
    assert!(wrong_type.decode().is_err());

    let mut zero_serial = Frame::call("", Vec::new());
    zero_serial.serial = Some(0);
    assert!(zero_serial.decode().is_err());

    let mut bad_path = Frame::call("", Vec::new());
    bad_path.path = Some("not a path".into());
    assert!(bad_path.decode().is_err());

    assert!(Frame::call("(i", Vec::new()).decode().is_err());
}

#[test]
fn output_shapes() {
    assert_eq!(Output::from_args(Vec::new()), Output::Empty);
    assert_eq!(Output::from_args(vec![1i32.into()]), Output::Single(Value::Int32(1)));
    let (a, b): (String, u32) = Output::from_args(vec!["a".into(), 2u32.into()]).decode().unwrap();
    assert_eq!((a.as_str(), b), ("a", 2));
    assert!(Output::from_args(vec![1i32.into()]).decode::<(String,)>().is_err());
}
