use super::*;

#[test]
fn test_timetag_round_trip() {
    let t = 1234567.5;
    let tt = Timetag::from_secs_f64(t);
    assert_eq!(tt.sec, 1234567);
    assert_eq!(tt.frac, 0x8000_0000);
    assert!((tt.as_secs_f64() - t).abs() < 1e-6);
}

#[test]
fn test_timetag_ordering() {
    let a = Timetag::new(10, 0);
    let b = Timetag::new(10, 1);
    let c = Timetag::new(11, 0);
    assert!(a < b);
    assert!(b < c);
    assert_eq!(a, Timetag::new(10, 0));
}

#[test]
fn test_clock_advances() {
    let mut clock = Clock::new();
    let t1 = clock.now;
    assert!(!t1.is_zero());
    let t2 = clock.tick();
    assert!(clock.now >= t1);
    assert!(t2 >= t1.as_secs_f64() - 1e-6);
}
