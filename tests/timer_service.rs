use padlink::poll::wait_backend::WaitBackend;
use padlink::poll::{Backend, Flow, Multiplexer};
use padlink::timer::{AnomalyPolicy, TimerId, TimerService};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

type Fired = Rc<RefCell<HashMap<TimerId, Vec<Instant>>>>;

fn start_recording<B: Backend>(timers: &mut TimerService<B>, fired: &Fired, period: Duration) -> TimerId {
    let log = Rc::clone(fired);
    timers
        .start(
            period,
            move |id, _jitter| {
                log.borrow_mut().entry(id).or_default().push(Instant::now());
                Flow::Continue
            },
            |_| {},
        )
        .unwrap()
}

fn run_for<B: Backend>(timers: &mut TimerService<B>, duration: Duration) {
    let until = Instant::now() + duration;
    while Instant::now() < until {
        timers.poll_timeout(Some(Duration::from_millis(20))).unwrap();
    }
}

fn check_two_timers<B: Backend>(mut timers: TimerService<B>) {
    let fired: Fired = Rc::new(RefCell::new(HashMap::new()));
    let fast = start_recording(&mut timers, &fired, Duration::from_millis(2));
    let slow = start_recording(&mut timers, &fired, Duration::from_millis(6));
    let fast_first = timers.next_deadline(fast).unwrap();
    let started = Instant::now();

    run_for(&mut timers, Duration::from_millis(600));
    let elapsed = started.elapsed();

    let fired = fired.borrow();
    let fast_count = fired.get(&fast).map_or(0, Vec::len) as u64;
    let slow_count = fired.get(&slow).map_or(0, Vec::len) as u64;

    // No callback loss can make time run faster than the fires imply
    assert!(elapsed + Duration::from_millis(2) >= Duration::from_millis(2) * fast_count as u32);
    assert!(elapsed + Duration::from_millis(6) >= Duration::from_millis(6) * slow_count as u32);
    // Loose bounds, shared CI machines oversleep
    assert!(fast_count >= 100, "fast timer fired {} times", fast_count);
    assert!(slow_count >= 40, "slow timer fired {} times", slow_count);
    assert!(fast_count > slow_count);

    // Deadlines stay on the grid laid down at start
    let fast_next = timers.next_deadline(fast).unwrap();
    let offset = fast_next.duration_since(fast_first);
    assert_eq!(offset.as_nanos() % Duration::from_millis(2).as_nanos(), 0);

    let stats = timers.stats(fast).unwrap();
    assert_eq!(stats.count, fast_count);
}

#[test]
fn two_timers_on_the_default_backend() {
    check_two_timers(TimerService::new(AnomalyPolicy::Lenient).unwrap());
}

#[test]
fn two_timers_on_the_wait_backend() {
    let mux = Multiplexer::with_backend(WaitBackend::new().unwrap(), 8);
    check_two_timers(TimerService::with_multiplexer(mux, AnomalyPolicy::Lenient));
}

#[test]
fn deadlines_advance_by_whole_periods_under_slow_callbacks() {
    let period = Duration::from_millis(3);
    let mut timers = TimerService::new(AnomalyPolicy::Lenient).unwrap();
    let deadlines = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&deadlines);
    let id = timers
        .start(
            period,
            move |_, _| {
                // Slower than the period every other tick
                if log.borrow().len() % 2 == 0 {
                    std::thread::sleep(Duration::from_millis(7));
                }
                log.borrow_mut().push(Instant::now());
                Flow::Continue
            },
            |_| {},
        )
        .unwrap();

    let mut previous = timers.next_deadline(id).unwrap();
    for _ in 0..20 {
        timers.poll_timeout(Some(Duration::from_millis(50))).unwrap();
        let next = timers.next_deadline(id).unwrap();
        assert!(next >= previous);
        assert_eq!(next.duration_since(previous).as_nanos() % period.as_nanos(), 0);
        previous = next;
    }

    assert!(timers.stats(id).unwrap().coalesced > 0);
}

#[test]
#[ignore = "runs for ten seconds"]
fn one_and_three_millisecond_timers_for_ten_seconds() {
    let mut timers = TimerService::new(AnomalyPolicy::Lenient).unwrap();
    let fired: Fired = Rc::new(RefCell::new(HashMap::new()));
    let fast = start_recording(&mut timers, &fired, Duration::from_micros(1000));
    let slow = start_recording(&mut timers, &fired, Duration::from_micros(3000));

    run_for(&mut timers, Duration::from_secs(10));

    let fired = fired.borrow();
    let fast_count = fired.get(&fast).map_or(0, Vec::len) as f64;
    let slow_count = fired.get(&slow).map_or(0, Vec::len) as f64;
    assert!((fast_count - 10_000.0).abs() <= 1_000.0, "1ms timer fired {} times", fast_count);
    assert!((slow_count - 3_333.0).abs() <= 333.3, "3ms timer fired {} times", slow_count);
}
