use fluxion_channel::Channel;
use fluxion_future::Future;
use proptest::prelude::*;

/// Sending values unbounded, then receiving them all, must hand them back
/// in the exact order they were sent -- a bounded capacity only changes
/// when a send's ack future resolves, never the delivery order.
fn check_fifo_order(values: Vec<i32>, capacity: Option<usize>) {
    let ch = Channel::new(capacity);
    for v in &values {
        ch.send(Future::new_resolved(*v));
    }
    let mut received = Vec::with_capacity(values.len());
    for _ in &values {
        let delivery = ch.receive();
        received.push(*delivery.peek().expect("delivery settled").unwrap());
    }
    assert_eq!(received, values);
}

proptest! {
    #[test]
    fn fifo_order_holds_unbounded(values in prop::collection::vec(any::<i32>(), 0..32)) {
        check_fifo_order(values, None);
    }

    #[test]
    fn fifo_order_holds_under_backpressure(
        values in prop::collection::vec(any::<i32>(), 0..32),
        capacity in 1usize..8,
    ) {
        check_fifo_order(values, Some(capacity));
    }
}
