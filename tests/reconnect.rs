//! Scenario tests for reconnects: resetting the session to the same pod,
//! switching pods, and the one-shot auto-reconnect at startup.

mod common;

use common::{
    drain_events, drain_tasks, harness, harness_with_radio, pod_id, wait_auto_reconnect, POD_NAME,
};

use acoustic_pod::domain::profiles::{default_devices, DeviceRecord};
use acoustic_pod::domain::store::ProfileStoreExt;
use acoustic_pod::{ConnectionState, DeviceId, RadioState};

#[tokio::test(start_paused = true)]
async fn reconnecting_to_the_same_pod_resets_the_session() {
    let mut h = harness();

    let first = h.service.connect_device(&pod_id()).await.expect("connected");
    drain_events(&mut h.events);

    let second = h.service.connect_device(&pod_id()).await.expect("reconnected");
    drain_tasks().await;

    // A fresh handle, a fresh subscription, and nothing left of the old.
    assert_ne!(first.generation(), second.generation());
    assert_eq!(h.transport.monitors_created(), 2);
    assert_eq!(h.transport.live_monitor_count(), 1);
    assert!(h.transport.cancelled_connections().contains(&pod_id()));
    assert!(h.transport.is_connected(&pod_id()));

    assert_eq!(
        h.service.connection_state(),
        ConnectionState::Connected(second)
    );
    assert_eq!(h.service.bond_lost_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn connecting_to_another_pod_drops_the_current_one() {
    let h = harness();
    let other = DeviceId::from("C0:FF:EE:00:00:01");
    h.transport.add_pod(&other, POD_NAME);

    h.service.connect_device(&pod_id()).await.expect("connected");
    h.service.connect_device(&other).await.expect("switched");
    drain_tasks().await;

    assert!(!h.transport.is_connected(&pod_id()));
    assert!(h.transport.is_connected(&other));
    assert_eq!(h.transport.live_monitor_count(), 1);
    assert_eq!(h.service.last_connected_device(), Some(other));
}

#[tokio::test(start_paused = true)]
async fn auto_reconnect_connects_when_the_radio_is_already_on() {
    let mut h = harness();
    h.store
        .save_devices(&[DeviceRecord::paired(1, pod_id(), "Studio Pod", &[])])
        .unwrap();

    assert!(!h.service.has_attempted_auto_reconnect());
    h.service.start();

    assert!(wait_auto_reconnect(&mut h.events).await);
    assert!(h.service.has_attempted_auto_reconnect());
    assert!(h.service.connection_state().is_connected());
    assert_eq!(h.service.last_connected_device(), Some(pod_id()));
}

#[tokio::test(start_paused = true)]
async fn auto_reconnect_waits_for_the_radio_to_power_on() {
    let mut h = harness_with_radio(RadioState::PoweredOff);
    h.store
        .save_devices(&[DeviceRecord::paired(1, pod_id(), "Studio Pod", &[])])
        .unwrap();

    h.service.start();
    drain_tasks().await;

    // Nothing happens while the radio is off.
    assert!(!h.service.has_attempted_auto_reconnect());
    assert_eq!(h.transport.connect_attempts(), 0);

    h.transport.set_radio(RadioState::PoweredOn);
    assert!(wait_auto_reconnect(&mut h.events).await);
    assert!(h.service.connection_state().is_connected());
}

#[tokio::test(start_paused = true)]
async fn auto_reconnect_without_a_stored_pod_still_finishes() {
    let mut h = harness();

    h.service.start();

    assert!(!wait_auto_reconnect(&mut h.events).await);
    assert!(h.service.has_attempted_auto_reconnect());
    assert_eq!(h.transport.connect_attempts(), 0);
    assert_eq!(h.service.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn auto_reconnect_skips_records_without_a_platform_id() {
    let mut h = harness();

    // Legacy records carry no platform id; the paired one does.
    let mut records = default_devices();
    assert!(records.iter().all(|record| record.device_id.is_none()));
    records.push(DeviceRecord::paired(7, pod_id(), "Studio Pod", &[]));
    h.store.save_devices(&records).unwrap();

    h.service.start();

    assert!(wait_auto_reconnect(&mut h.events).await);
    assert_eq!(h.service.last_connected_device(), Some(pod_id()));
}

#[tokio::test(start_paused = true)]
async fn failed_auto_reconnect_still_flips_the_attempted_flag() {
    let mut h = harness();
    h.store
        .save_devices(&[DeviceRecord::paired(1, pod_id(), "Studio Pod", &[])])
        .unwrap();
    h.transport.fail_next_connect("pod went out of range");

    h.service.start();

    assert!(!wait_auto_reconnect(&mut h.events).await);
    assert!(h.service.has_attempted_auto_reconnect());
    assert_eq!(h.transport.connect_attempts(), 1);
    assert_eq!(h.service.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn start_is_one_shot() {
    let mut h = harness();
    h.store
        .save_devices(&[DeviceRecord::paired(1, pod_id(), "Studio Pod", &[])])
        .unwrap();

    h.service.start();
    h.service.start();

    assert!(wait_auto_reconnect(&mut h.events).await);
    drain_tasks().await;

    assert_eq!(h.transport.connect_attempts(), 1);
    let repeats = drain_events(&mut h.events)
        .into_iter()
        .filter(|event| matches!(event, acoustic_pod::PodEvent::AutoReconnectFinished { .. }))
        .count();
    assert_eq!(repeats, 0);
}
