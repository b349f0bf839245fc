use busrpc::{
    names,
    signature::{self, SignatureError, MAX_DEPTH},
    Type,
};

#[test]
fn split_top_level_types() {
    assert_eq!(signature::split("aiu").unwrap(), ["ai", "u"]);
    assert_eq!(signature::split("a(ii)s").unwrap(), ["a(ii)", "s"]);
    assert_eq!(signature::split("a{sv}(s(ib))v").unwrap(), ["a{sv}", "(s(ib))", "v"]);
    assert_eq!(signature::split("aai").unwrap(), ["aai"]);
    assert!(signature::split("").unwrap().is_empty());

    for sig in ["a{sa(ii)}x", "ybnqiuxtdsogh", "aa{sv}"] {
        assert_eq!(signature::split(sig).unwrap().concat(), sig);
    }
}

#[test]
fn invalid_signatures() {
    assert_eq!(signature::validate("(ii"), Err(SignatureError::Unbalanced('(')));
    assert_eq!(signature::validate("ii)"), Err(SignatureError::Unbalanced(')')));
    assert_eq!(signature::validate("a"), Err(SignatureError::MissingElementType));
    assert_eq!(signature::validate("z"), Err(SignatureError::UnknownType('z')));
    assert_eq!(signature::validate("()"), Err(SignatureError::EmptyStruct));
    assert_eq!(signature::validate("{sv}"), Err(SignatureError::InvalidDictEntry));
    assert_eq!(signature::validate("a{vs}"), Err(SignatureError::InvalidDictEntry));
    assert_eq!(signature::validate("a{sss}"), Err(SignatureError::InvalidDictEntry));

    assert!(signature::is_valid(""));
    assert!(signature::is_valid("a{s(iav)}"));
}

#[test]
fn nesting_limits() {
    let arrays = |n| format!("{}i", "a".repeat(n));
    assert!(signature::is_valid(&arrays(MAX_DEPTH)));
    assert_eq!(signature::validate(&arrays(MAX_DEPTH + 1)), Err(SignatureError::TooDeep));

    let structs = |n| format!("{}i{}", "(".repeat(n), ")".repeat(n));
    assert!(signature::is_valid(&structs(MAX_DEPTH)));
    assert_eq!(signature::validate(&structs(MAX_DEPTH + 1)), Err(SignatureError::TooDeep));

    assert_eq!(signature::validate(&"i".repeat(256)), Err(SignatureError::TooLong));
}

#[test]
fn long_array_prefixes() {
    let many = "a".repeat(1_000_000);
    assert_eq!(signature::split(&many), Err(SignatureError::MissingElementType));
    let typed = format!("{many}i");
    assert_eq!(signature::split(&typed).unwrap(), [typed.as_str()]);
    assert_eq!(signature::validate(&typed), Err(SignatureError::TooLong));
}

#[test]
fn single_types() {
    assert_eq!(Type::parse("a{sv}").unwrap(), Type::Dict(Box::new(Type::String), Box::new(Type::Variant)));
    assert_eq!(
        Type::parse("(iao)").unwrap(),
        Type::Struct(vec![Type::Int32, Type::Array(Box::new(Type::ObjectPath))])
    );
    assert!(matches!(Type::parse("ii"), Err(SignatureError::NotSingleType(_))));
    assert_eq!(Type::parse_all("ua{yd}").unwrap().len(), 2);
    assert_eq!(Type::parse("a(ss)").unwrap().to_string(), "a(ss)");
}

#[test]
fn name_rules() {
    assert!(names::is_valid_bus_name("com.example.Service"));
    assert!(names::is_valid_bus_name(":1.42"));
    assert!(!names::is_valid_bus_name("com"));
    assert!(!names::is_valid_bus_name("com..example"));
    assert!(!names::is_valid_bus_name("com.1example"));

    assert!(names::is_valid_path("/"));
    assert!(names::is_valid_path("/com/example/Object_1"));
    assert!(!names::is_valid_path("/com/"));
    assert!(!names::is_valid_path("com/example"));
    assert!(!names::is_valid_path("/com//example"));
    assert!(!names::is_valid_path("/com/ex-ample"));

    assert!(names::is_valid_interface("org.freedesktop.DBus.Introspectable"));
    assert!(!names::is_valid_interface("Introspectable"));
    assert!(names::is_valid_member("Get_Value2"));
    assert!(!names::is_valid_member("2Get"));
    assert!(!names::is_valid_member("Get.Value"));
    assert!(names::is_valid_error_name(names::ERROR_TIMEOUT));
    assert!(!names::is_valid_error_name("not a valid name"));
}
