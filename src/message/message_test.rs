use super::*;

#[test]
fn test_message_pack_round_trip() -> Result<()> {
    let msg = Message::new(
        "/registered",
        vec![
            Arg::Str("/test.1".to_owned()),
            Arg::Str("@IP".to_owned()),
            Arg::Str("192.168.0.2".to_owned()),
            Arg::Str("@port".to_owned()),
            Arg::Int(9000),
            Arg::Float(0.5),
            Arg::Double(1.25),
            Arg::Long(1 << 40),
            Arg::Char('f'),
            Arg::Time(crate::clock::Timetag::new(7, 9)),
            Arg::Sym("sym".to_owned()),
        ],
    );
    let packed = msg.pack()?;
    assert_eq!(packed.len() % 4, 0);
    let decoded = Message::unpack(&packed)?;
    assert_eq!(decoded, msg);
    Ok(())
}

#[test]
fn test_message_unpack_rejects_garbage() {
    assert!(Message::unpack(&[]).is_err());
    assert!(Message::unpack(b"no-slash\0\0\0\0,\0\0\0").is_err());
    // truncated argument payload
    let msg = Message::new("/who", vec![Arg::Int(1)]);
    let packed = msg.pack().unwrap();
    assert_eq!(
        Message::unpack(&packed[..packed.len() - 2]),
        Err(Error::ErrTruncatedMessage)
    );
}

#[test]
fn test_arg_coercion() {
    assert_eq!(Arg::Float(64.7).as_i32(), Some(64));
    assert_eq!(Arg::Int(64).as_f32(), Some(64.0));
    assert_eq!(Arg::Sym("x".to_owned()).as_str(), Some("x"));
    assert_eq!(Arg::Str("linear".to_owned()).as_char(), Some('l'));
    assert_eq!(Arg::Int(1).as_str(), None);
}

#[test]
fn test_param_set_parse() {
    let args = vec![
        Arg::Str("@type".to_owned()),
        Arg::Char('f'),
        Arg::Str("@range".to_owned()),
        Arg::Int(0),
        Arg::Int(127),
        Arg::Float(0.0),
        Arg::Float(1.0),
        Arg::Str("@flavour".to_owned()),
        Arg::Str("vanilla".to_owned()),
    ];
    let params = ParamSet::parse(&args);
    assert_eq!(params.if_char(Param::Type), Some('f'));
    assert_eq!(params.range(), Some([0.0, 127.0, 0.0, 1.0]));
    assert_eq!(
        params.extra().get("@flavour"),
        Some(&vec![Arg::Str("vanilla".to_owned())])
    );
    assert!(!params.contains(Param::Min));
}

#[test]
fn test_param_set_round_trip() {
    let mut params = ParamSet::new();
    params
        .insert(Param::Port, vec![Arg::Int(9000)])
        .insert(Param::Ip, vec![Arg::Str("10.0.0.1".to_owned())])
        .insert(
            Param::Range,
            vec![Arg::Float(0.0), Arg::Float(1.0), Arg::Float(2.0), Arg::Float(3.0)],
        )
        .insert_extra("@colour", vec![Arg::Str("blue".to_owned())]);

    let mut args = Vec::new();
    params.append_to(&mut args);
    let reparsed = ParamSet::parse(&args);
    assert_eq!(reparsed, params);
}

#[test]
fn test_split_args() {
    let args = vec![
        Arg::Str("/a.1/out".to_owned()),
        Arg::Str("/b.1/in".to_owned()),
        Arg::Str("@id".to_owned()),
        Arg::Long(42),
    ];
    let (fixed, params) = split_args(&args);
    assert_eq!(fixed.len(), 2);
    assert_eq!(params.if_i64(Param::Id), Some(42));
}

#[test]
fn test_parse_signal_path() {
    let (dev, sig) = parse_signal_path("/synth.1/frequency").unwrap();
    assert_eq!(dev, "/synth.1");
    assert_eq!(sig, "frequency");

    assert!(parse_signal_path("no-slash").is_err());
    assert!(parse_signal_path("/device-only").is_err());
    assert!(parse_signal_path("/dev.1/").is_err());
}
