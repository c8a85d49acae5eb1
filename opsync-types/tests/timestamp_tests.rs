use opsync_types::Timestamp;
use proptest::prelude::*;

#[test]
fn now_is_after_2020() {
    let ts = Timestamp::now();
    assert!(ts.as_millis() > 1_577_836_800_000);
}

#[test]
fn from_millis_roundtrip() {
    let ts = Timestamp::from_millis(42);
    assert_eq!(ts.as_millis(), 42);
    assert_eq!(Timestamp::from(42u64), ts);
}

#[test]
fn display_is_rfc3339() {
    let ts = Timestamp::from_millis(0);
    assert_eq!(ts.to_string(), "1970-01-01T00:00:00+00:00");
}

#[test]
fn serializes_as_number() {
    let json = serde_json::to_string(&Timestamp::from_millis(1234)).unwrap();
    assert_eq!(json, "1234");
}

proptest! {
    #[test]
    fn ordering_matches_millis(a in any::<u64>(), b in any::<u64>()) {
        prop_assert_eq!(Timestamp::from_millis(a).cmp(&Timestamp::from_millis(b)), a.cmp(&b));
    }
}
