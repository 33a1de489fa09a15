use std::sync::{Arc, Mutex};

use fluxion_future::{chain, pending, Error as FutureError, Future, Promise};

use crate::fifo::Fifo;

struct Item<T> {
    payload: Future<T>,
    ack: Promise<usize>,
}

struct State<T> {
    capacity: Option<usize>,
    can_send: bool,
    can_receive: bool,
    queue: Fifo<Future<T>>,
    sendq: Fifo<Item<T>>,
    recvq: Fifo<Promise<T>>,
}

impl<T> State<T> {
    fn has_room(&self) -> bool {
        self.capacity.map_or(true, |c| self.queue.len() < c)
    }
}

/// Deferred work to perform once the channel lock is released: resolving
/// acks, chaining payloads into deliveries, rejecting abandoned operations.
/// Nothing here runs while `State`'s mutex is held, since firing a future's
/// observers may re-enter this same channel.
enum Action<T> {
    ResolveAck(Promise<usize>, usize),
    RejectAck(Promise<usize>, FutureError),
    Chain(Future<T>, Promise<T>),
    RejectDelivery(Promise<T>, FutureError),
}

fn apply<T: Send + Sync + 'static>(actions: Vec<Action<T>>) {
    for action in actions {
        match action {
            Action::ResolveAck(promise, len) => {
                let _ = promise.resolve(len);
            }
            Action::RejectAck(promise, err) => {
                let _ = promise.reject(err);
            }
            Action::Chain(payload, target) => chain(&payload, target),
            Action::RejectDelivery(promise, err) => {
                let _ = promise.reject(err);
            }
        }
    }
}

/// If both a queued payload and a pending receiver exist, pairs the head
/// of each: the receiver's delivery future is chained from the payload.
/// Promotes one `sendq` item into `queue` if the pairing freed capacity.
fn pair_up<T: Send + Sync + 'static>(state: &mut State<T>, actions: &mut Vec<Action<T>>) {
    if state.queue.is_empty() || state.recvq.is_empty() {
        return;
    }
    let payload = state.queue.pop_front().expect("checked non-empty above");
    let recv_promise = state.recvq.pop_front().expect("checked non-empty above");
    actions.push(Action::Chain(payload, recv_promise));

    if !state.sendq.is_empty() && state.has_room() {
        let promoted = state.sendq.pop_front().expect("checked non-empty above");
        state.queue.push_back(promoted.payload);
        let new_len = state.queue.len();
        actions.push(Action::ResolveAck(promoted.ack, new_len));
    }
}

/// A bounded (or unbounded) FIFO channel whose `send`/`receive` operations
/// are themselves futures: `send` resolves once its payload is admitted to
/// the channel (the backpressure signal, distinct from delivery), and
/// `receive` resolves with whatever outcome the matched payload eventually
/// has.
pub struct Channel<T> {
    state: Mutex<State<T>>,
}

impl<T: Send + Sync + 'static> Channel<T> {
    /// `capacity = None` means unbounded.
    pub fn new(capacity: Option<usize>) -> Arc<Self> {
        Arc::new(Channel {
            state: Mutex::new(State {
                capacity,
                can_send: true,
                can_receive: true,
                queue: Fifo::new(),
                sendq: Fifo::new(),
                recvq: Fifo::new(),
            }),
        })
    }

    /// Current admitted-queue length, for diagnostics/tests.
    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Sends `payload` (itself a future — the sender need not have a value
    /// ready yet). Returns an ack future that resolves with the queue
    /// length once `payload` is admitted, or rejects `channel_closed` if
    /// the channel cannot accept it.
    pub fn send(&self, payload: Future<T>) -> Future<usize> {
        let (ack_future, ack_promise) = pending();
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if !(state.can_send && state.can_receive) {
                drop(state);
                let _ = ack_promise.reject(FutureError::ChannelClosed);
                return ack_future;
            }
            if state.sendq.is_empty() && state.has_room() {
                state.queue.push_back(payload);
                let new_len = state.queue.len();
                actions.push(Action::ResolveAck(ack_promise, new_len));
                pair_up(&mut state, &mut actions);
            } else {
                state.sendq.push_back(Item {
                    payload,
                    ack: ack_promise,
                });
            }
        }
        apply(actions);
        ack_future
    }

    /// Requests the next delivery. Resolves with the outcome of whichever
    /// payload future is paired to this receiver, in admission order.
    /// Rejects `channel_closed` immediately if the receive side is closed,
    /// or if the send side is closed and there aren't enough outstanding
    /// items/senders left to ever fulfill this receiver.
    pub fn receive(&self) -> Future<T> {
        let (delivery_future, delivery_promise) = pending();
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if !state.can_receive {
                drop(state);
                let _ = delivery_promise.reject(FutureError::ChannelClosed);
                return delivery_future;
            }
            let fulfillable = state.queue.len() + state.sendq.len();
            if !state.can_send && fulfillable <= state.recvq.len() {
                drop(state);
                let _ = delivery_promise.reject(FutureError::ChannelClosed);
                return delivery_future;
            }
            state.recvq.push_back(delivery_promise);
            pair_up(&mut state, &mut actions);
        }
        apply(actions);
        delivery_future
    }

    /// Closes the send side. Idempotent. Rejects the *trailing* (most
    /// recently enqueued) pending receivers beyond the count still
    /// fulfillable by what's already queued or in flight — earliest
    /// receivers keep priority.
    pub fn close_send(&self) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if !state.can_send {
                return;
            }
            tracing::trace!("channel send side closed");
            state.can_send = false;
            let fulfillable = state.queue.len() + state.sendq.len();
            while state.recvq.len() > fulfillable {
                if let Some(promise) = state.recvq.pop_back() {
                    actions.push(Action::RejectDelivery(promise, FutureError::ChannelClosed));
                } else {
                    break;
                }
            }
        }
        apply(actions);
    }

    /// Closes the receive side. Idempotent. Terminates everything in
    /// flight: every pending receiver and every queued sender rejects
    /// `channel_closed`; every admitted item's payload future is dropped.
    pub fn close_receive(&self) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if !state.can_receive {
                return;
            }
            tracing::trace!("channel receive side closed");
            state.can_receive = false;
            for promise in state.recvq.drain_all() {
                actions.push(Action::RejectDelivery(promise, FutureError::ChannelClosed));
            }
            for item in state.sendq.drain_all() {
                actions.push(Action::RejectAck(item.ack, FutureError::ChannelClosed));
            }
            state.queue.drain_all(); // payload futures simply dropped
        }
        apply(actions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(value: i32) -> Future<i32> {
        Future::new_resolved(value)
    }

    #[test]
    fn send_then_receive_delivers_value() {
        let ch = Channel::new(Some(2));
        let ack = ch.send(resolved(7));
        assert_eq!(*ack.peek().unwrap().unwrap(), 1);
        let delivery = ch.receive();
        assert_eq!(*delivery.peek().unwrap().unwrap(), 7);
    }

    #[test]
    fn backpressure_third_send_waits_until_a_receive() {
        let ch = Channel::new(Some(2));
        let ack1 = ch.send(resolved(1));
        let ack2 = ch.send(resolved(2));
        let ack3 = ch.send(resolved(3));
        assert!(ack1.is_resolved());
        assert!(ack2.is_resolved());
        assert!(ack3.is_pending());

        let d1 = ch.receive();
        assert_eq!(*d1.peek().unwrap().unwrap(), 1);
        assert_eq!(*ack3.peek().unwrap().unwrap(), 2);
    }

    #[test]
    fn close_send_drains_then_rejects() {
        let ch = Channel::new(None);
        for i in 0..5 {
            ch.send(resolved(i));
        }
        ch.close_send();
        for i in 0..5 {
            let d = ch.receive();
            assert_eq!(*d.peek().unwrap().unwrap(), i);
        }
        let rejected = ch.receive();
        assert!(matches!(rejected.peek().unwrap(), Err(FutureError::ChannelClosed)));
    }

    #[test]
    fn close_receive_rejects_pending_sender() {
        let ch = Channel::new(Some(1));
        let ack1 = ch.send(resolved(1));
        assert!(ack1.is_resolved());
        let ack2 = ch.send(resolved(2));
        assert!(ack2.is_pending());

        ch.close_receive();
        assert!(matches!(ack2.peek().unwrap(), Err(FutureError::ChannelClosed)));

        let ack3 = ch.send(resolved(3));
        assert!(matches!(ack3.peek().unwrap(), Err(FutureError::ChannelClosed)));
    }

    #[test]
    fn close_send_rejects_trailing_receivers_newest_first() {
        let ch = Channel::new(Some(1));
        // One receiver is serviceable (nothing queued yet, but send side
        // still open), two more will never be.
        let r1 = ch.receive();
        let r2 = ch.receive();
        let r3 = ch.receive();
        assert!(r1.is_pending() && r2.is_pending() && r3.is_pending());

        ch.close_send();
        // Nothing was ever queued, so fulfillable == 0: all pending
        // receivers beyond that are rejected, newest first, which here is
        // all three -- but r1 was first in and should still be rejected
        // since fulfillable is 0 regardless of position when nothing is
        // queued or in flight.
        assert!(r3.is_rejected());
        assert!(r2.is_rejected());
        assert!(r1.is_rejected());
    }

    #[test]
    fn already_rejected_payload_is_observed_on_receive_not_short_circuited() {
        let ch = Channel::new(Some(1));
        let rejected_payload = Future::<i32>::new_rejected(FutureError::Cancelled("boom".into()));
        let ack = ch.send(rejected_payload);
        assert!(ack.is_resolved(), "admission succeeds even though the payload is already rejected");
        let delivery = ch.receive();
        assert!(matches!(delivery.peek().unwrap(), Err(FutureError::Cancelled(_))));
    }
}
