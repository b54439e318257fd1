mod common;

use common::{run_local, settle, shared_bus, spawn_with};
use corobus_core::{last_error, Bus, BusError, ErrorCode};
use pretty_assertions::assert_eq;

#[test_log::test]
fn try_broadcast_needs_an_open_channel() {
    let bus: Bus = Bus::new();
    assert_eq!(bus.try_broadcast(1), Err(BusError::NoChannel));
    assert_eq!(last_error(), ErrorCode::NoChannel);

    let handle = bus.open(1);
    bus.close(handle);
    assert_eq!(bus.try_broadcast(1), Err(BusError::NoChannel));
}

#[test_log::test]
fn try_broadcast_is_all_or_nothing() {
    let bus: Bus = Bus::new();
    let roomy = bus.open(2);
    let tight = bus.open(1);
    bus.try_send(tight, 0).unwrap();

    assert_eq!(bus.try_broadcast(5), Err(BusError::WouldBlock));
    assert_eq!(bus.len(roomy), Some(0));
    assert_eq!(bus.len(tight), Some(1));

    assert_eq!(bus.try_recv(tight), Ok(0));
    assert_eq!(bus.try_broadcast(5), Ok(()));
    assert_eq!(bus.try_recv(roomy), Ok(5));
    assert_eq!(bus.try_recv(tight), Ok(5));
}

#[test_log::test]
fn try_broadcast_skips_free_slots() {
    let bus: Bus = Bus::new();
    let first = bus.open(1);
    let middle = bus.open(1);
    let last = bus.open(1);
    bus.close(middle);

    assert_eq!(bus.try_broadcast(8), Ok(()));
    assert_eq!(bus.try_recv(first), Ok(8));
    assert_eq!(bus.try_recv(last), Ok(8));
    assert_eq!(bus.stats().values_sent, 2);
}

#[test_log::test]
fn try_broadcast_never_uses_rendezvous_channels() {
    let bus: Bus = Bus::new();
    bus.open(4);
    bus.open(0);
    assert_eq!(bus.try_broadcast(1), Err(BusError::WouldBlock));
}

#[test_log::test(tokio::test)]
async fn broadcast_waits_for_the_full_channel() {
    run_local(async {
        let bus = shared_bus();
        let full = bus.open(1);
        let roomy = bus.open(4);
        bus.try_send(full, 0).unwrap();

        let broadcaster = spawn_with(&bus, |bus| async move { bus.broadcast(9).await });
        settle().await;
        assert!(!broadcaster.is_finished());
        assert_eq!(bus.waiting_senders(full), Some(1));
        assert_eq!(bus.len(roomy), Some(0));

        assert_eq!(bus.try_recv(full), Ok(0));
        settle().await;
        assert_eq!(broadcaster.await.unwrap(), Ok(()));
        assert_eq!(bus.try_recv(full), Ok(9));
        assert_eq!(bus.try_recv(roomy), Ok(9));
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn broadcast_moves_on_when_the_blocking_channel_closes() {
    run_local(async {
        let bus = shared_bus();
        let full = bus.open(1);
        let roomy = bus.open(1);
        bus.try_send(full, 0).unwrap();

        let broadcaster = spawn_with(&bus, |bus| async move { bus.broadcast(3).await });
        settle().await;
        bus.close(full);
        settle().await;

        assert_eq!(broadcaster.await.unwrap(), Ok(()));
        assert_eq!(bus.try_recv(roomy), Ok(3));
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn broadcast_fails_once_every_channel_is_gone() {
    run_local(async {
        let bus = shared_bus();
        let full = bus.open(1);
        bus.try_send(full, 0).unwrap();

        let broadcaster = spawn_with(&bus, |bus| async move { bus.broadcast(3).await });
        settle().await;
        bus.close(full);
        settle().await;
        assert_eq!(broadcaster.await.unwrap(), Err(BusError::NoChannel));
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn broadcast_hands_off_to_rendezvous_receivers() {
    run_local(async {
        let bus = shared_bus();
        let rendezvous = bus.open(0);
        let buffered = bus.open(1);

        let broadcaster = spawn_with(&bus, |bus| async move { bus.broadcast(4).await });
        settle().await;
        assert!(!broadcaster.is_finished());
        assert_eq!(bus.waiting_senders(rendezvous), Some(1));

        // The arriving receiver wakes the broadcaster, which then completes.
        let receiver = spawn_with(&bus, |bus| async move { bus.recv(rendezvous).await });
        settle().await;

        assert_eq!(broadcaster.await.unwrap(), Ok(()));
        assert_eq!(receiver.await.unwrap(), Ok(4));
        assert_eq!(bus.try_recv(buffered), Ok(4));
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn broadcaster_stalling_elsewhere_passes_the_freed_slot_on() {
    run_local(async {
        let bus = shared_bus();
        let a = bus.open(1);
        let c = bus.open(1);
        bus.try_send(a, 0).unwrap();

        let broadcaster = spawn_with(&bus, |bus| async move { bus.broadcast(9).await });
        settle().await;
        let sender = spawn_with(&bus, |bus| async move { bus.send(a, 5).await });
        settle().await;
        assert_eq!(bus.waiting_senders(a), Some(2));

        // The broadcaster is woken for the slot freed on `a` but now has to
        // wait for `c`, so the sender behind it takes the slot.
        bus.try_send(c, 1).unwrap();
        assert_eq!(bus.try_recv(a), Ok(0));
        settle().await;

        assert!(sender.is_finished());
        assert_eq!(sender.await.unwrap(), Ok(()));
        assert_eq!(bus.len(a), Some(1));
        assert_eq!(bus.waiting_senders(a), Some(0));
        assert_eq!(bus.waiting_senders(c), Some(1));

        assert_eq!(bus.try_recv(c), Ok(1));
        settle().await;
        assert!(!broadcaster.is_finished());
        assert_eq!(bus.try_recv(a), Ok(5));
        settle().await;

        assert_eq!(broadcaster.await.unwrap(), Ok(()));
        assert_eq!(bus.try_recv(a), Ok(9));
        assert_eq!(bus.try_recv(c), Ok(9));
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn rendezvous_hint_reaches_the_next_broadcaster() {
    run_local(async {
        let bus = shared_bus();
        let rendezvous = bus.open(0);
        let full = bus.open(1);
        bus.try_send(full, 0).unwrap();

        let first = spawn_with(&bus, |bus| async move { bus.broadcast(1).await });
        settle().await;
        let second = spawn_with(&bus, |bus| async move { bus.broadcast(2).await });
        settle().await;
        assert_eq!(bus.waiting_senders(rendezvous), Some(2));

        // The receiver's hint wakes `first`, which then waits on `full` and
        // hands the hint to `second`, which does the same.
        let receiver = spawn_with(&bus, |bus| async move { bus.recv(rendezvous).await });
        settle().await;
        assert_eq!(bus.waiting_senders(rendezvous), Some(0));
        assert_eq!(bus.waiting_senders(full), Some(2));
        assert_eq!(bus.waiting_receivers(rendezvous), Some(1));

        assert_eq!(bus.try_recv(full), Ok(0));
        settle().await;
        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(receiver.await.unwrap(), Ok(1));
        assert!(!second.is_finished());
        assert_eq!(bus.waiting_senders(full), Some(1));
    })
    .await;
}
