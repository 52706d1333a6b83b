mod common;

use std::time::Duration;

use common::rig;
use meshchat::client::{Notice, UiCommand};
use meshchat::supervisor::ConnectionState;
use meshchat::transport::sim::SimDevice;

fn scheduled_delays(notices: &[Notice]) -> Vec<u64> {
    notices
        .iter()
        .filter_map(|n| match n {
            Notice::ReconnectScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn consecutive_failures_back_off_to_the_cap() {
    let dev = SimDevice::new();
    dev.fail_next_connects(6);
    let mut r = rig(dev);
    let started = tokio::time::Instant::now();
    r.connect().await;
    r.step_until("connected", |c| {
        c.connection_state() == ConnectionState::Connected
    })
    .await;

    assert_eq!(
        scheduled_delays(&r.notices()),
        vec![2000, 4000, 8000, 16000, 30000, 30000]
    );
    assert_eq!(started.elapsed(), Duration::from_millis(90_000));
    assert_eq!(r.dev.connect_targets().len(), 7);
    assert_eq!(r.client.supervisor().attempt(), 0);
    assert!(r.client.snapshot().retry_in_secs.is_none());
}

#[tokio::test(start_paused = true)]
async fn surprise_drop_reconnects_after_base_delay() {
    let dev = SimDevice::new();
    dev.fail_next_connects(3);
    let mut r = rig(dev);
    r.connect().await;
    r.step_until("connected", |c| {
        c.connection_state() == ConnectionState::Connected
    })
    .await;
    r.settle().await;
    r.seen.clear();

    r.dev.drop_link();
    r.step_until("link lost", |c| {
        c.connection_state() == ConnectionState::Disconnected
    })
    .await;
    assert!(r.notices().contains(&Notice::ConnectionLost));
    assert_eq!(scheduled_delays(&r.notices()), vec![2000]);

    let lost_at = tokio::time::Instant::now();
    r.step_until("reconnected", |c| {
        c.connection_state() == ConnectionState::Connected
    })
    .await;
    assert_eq!(lost_at.elapsed(), Duration::from_millis(2000));
}

#[tokio::test(start_paused = true)]
async fn countdown_is_published_while_waiting() {
    let dev = SimDevice::new();
    dev.fail_next_connects(3);
    let mut r = rig(dev);
    r.connect().await;
    r.connect().await;
    // Second failure: 4s wait
    assert_eq!(r.client.snapshot().retry_in_secs, Some(4));
    r.run_for(Duration::from_millis(1500)).await;
    assert_eq!(r.client.snapshot().retry_in_secs, Some(3));
    assert_eq!(r.client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn manual_connect_to_other_target_cancels_retry() {
    let dev = SimDevice::new();
    dev.fail_next_connects(1);
    let mut r = rig(dev);
    r.connect().await;
    assert!(r.client.supervisor().retry_pending());

    r.command(UiCommand::ConnectTo("radio-2".into())).await;
    assert_eq!(r.client.connection_state(), ConnectionState::Connected);
    assert!(!r.client.supervisor().retry_pending());

    r.run_for(Duration::from_secs(120)).await;
    assert_eq!(r.dev.connect_targets(), vec!["sim", "radio-2"]);
    assert_eq!(r.client.snapshot().target, "radio-2");
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_stays_down() {
    let mut r = rig(SimDevice::new());
    r.connect().await;
    r.settle().await;

    r.command(UiCommand::Disconnect).await;
    assert_eq!(r.client.connection_state(), ConnectionState::Disconnected);
    assert!(!r.dev.is_link_open());

    r.run_for(Duration::from_secs(300)).await;
    assert_eq!(r.dev.connect_targets().len(), 1);
    assert_eq!(r.client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn reconnect_refreshes_device_snapshot() {
    let dev = SimDevice::new();
    let mut r = rig(dev.clone());
    r.connect().await;
    r.settle().await;
    assert!(r.client.snapshot().contacts.is_empty());

    dev.set_contacts(vec![common::contact(
        "newcomer",
        [9, 9, 9, 9, 9, 9],
        meshchat::models::ContactRole::Chat,
    )]);
    dev.fail_channels(true);
    r.command(UiCommand::Reconnect).await;

    let snap = r.client.snapshot();
    assert_eq!(snap.contacts.len(), 1);
    assert_eq!(snap.channels.len(), 1);
    assert_eq!(snap.channels[0].name, "Public");
    assert!(r.notices().contains(&Notice::ChannelsUnavailable));
    assert_eq!(dev.closes(), 1);
}
