mod common;

use common::{contact, rig};
use meshchat::client::{Notice, UiCommand};
use meshchat::models::{ContactRole, ConversationSelector, DeliveryStatus};
use meshchat::transport::sim::{SentFrame, SimDevice};
use meshchat::validation::InputError;

const ALICE: [u8; 6] = [0xa1, 0x1c, 0xe0, 0x00, 0x00, 0x01];

fn device() -> SimDevice {
    let dev = SimDevice::new();
    dev.set_contacts(vec![
        contact("alice", ALICE, ContactRole::Chat),
        contact("hilltop", [0x7e, 0x7e, 0, 0, 0, 1], ContactRole::Repeater),
    ]);
    dev
}

fn dm(text: &str) -> UiCommand {
    UiCommand::SendMessage {
        conversation: ConversationSelector::Direct("alice".into()),
        text: text.into(),
    }
}

#[tokio::test(start_paused = true)]
async fn channel_send_goes_sending_then_sent_and_stays() {
    let mut r = rig(device());
    r.connect().await;
    r.settle().await;

    r.command(UiCommand::SendMessage {
        conversation: ConversationSelector::Channel(0),
        text: "hi".into(),
    })
    .await;
    let id = r.last_outgoing_id();
    let stored = r.client.store().get(&id).unwrap().clone();
    assert!(stored.outgoing);
    assert_eq!(stored.sender_display_name.as_deref(), Some("sim-node"));

    r.run_for(std::time::Duration::from_secs(120)).await;
    assert_eq!(
        r.status_trail(&id),
        vec![DeliveryStatus::Sending, DeliveryStatus::Sent]
    );
    assert_eq!(r.client.store().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn acked_dm_is_delivered_without_retries() {
    let mut r = rig(device());
    r.connect().await;
    r.settle().await;

    r.command(dm("ping")).await;
    let id = r.last_outgoing_id();
    let SentFrame::Direct { ack, public_key, .. } = r.dev.sent()[0].clone() else {
        panic!("expected a direct frame");
    };
    assert!(public_key.starts_with(&ALICE));

    assert!(r.dev.confirm(ack, 1800));
    r.step_until("delivered", |c| {
        c.store().messages().iter().any(|m| m.delivery_status == Some(DeliveryStatus::Delivered))
    })
    .await;

    r.run_for(std::time::Duration::from_secs(60)).await;
    assert_eq!(
        r.status_trail(&id),
        vec![
            DeliveryStatus::Sending,
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered
        ]
    );
    assert_eq!(r.dev.sent().len(), 1);
    assert_eq!(r.client.tracker().pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn unacked_dm_fails_after_three_attempts() {
    let mut r = rig(device());
    r.connect().await;
    r.settle().await;

    r.command(dm("anyone?")).await;
    let id = r.last_outgoing_id();
    let watched = id.clone();
    r.step_until("failed", move |c| {
        c.store().get(&watched).and_then(|m| m.delivery_status) == Some(DeliveryStatus::Failed)
    })
    .await;

    assert_eq!(r.dev.sent().len(), 3);
    assert!(r
        .notices()
        .contains(&Notice::SendFailed { message_id: id.clone() }));

    // A late ack for any of the abandoned codes changes nothing.
    let SentFrame::Direct { ack, .. } = r.dev.sent()[2].clone() else {
        panic!("expected a direct frame");
    };
    r.dev.confirm(ack, 5000);
    r.run_for(std::time::Duration::from_secs(5)).await;
    assert_eq!(r.status(&id), Some(DeliveryStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn ack_on_second_attempt_stops_retrying() {
    let mut r = rig(device());
    r.connect().await;
    r.settle().await;

    r.command(dm("second time lucky")).await;
    let dev = r.dev.clone();
    r.step_until("resent", move |_| dev.sent().len() == 2).await;
    let SentFrame::Direct { ack, .. } = r.dev.sent()[1].clone() else {
        panic!("expected a direct frame");
    };
    r.dev.confirm(ack, 2500);
    r.run_for(std::time::Duration::from_secs(60)).await;

    let id = r.last_outgoing_id();
    assert_eq!(r.status(&id), Some(DeliveryStatus::Delivered));
    assert_eq!(r.dev.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn oversized_text_never_reaches_the_radio() {
    let mut r = rig(device());
    r.connect().await;
    r.settle().await;

    r.command(UiCommand::SendMessage {
        conversation: ConversationSelector::Channel(0),
        text: "x".repeat(201),
    })
    .await;
    assert!(r.dev.sent().is_empty());
    assert!(r.client.store().is_empty());
    assert!(r.notices().contains(&Notice::Rejected(InputError::TooLong {
        bytes: 201,
        max: 200
    })));
}

#[tokio::test(start_paused = true)]
async fn input_rejections_are_notices() {
    let mut r = rig(device());

    r.command(dm("offline")).await;
    r.connect().await;
    r.settle().await;
    r.command(UiCommand::SendMessage {
        conversation: ConversationSelector::Direct("mallory".into()),
        text: "hi".into(),
    })
    .await;
    r.command(UiCommand::SendMessage {
        conversation: ConversationSelector::Direct("hilltop".into()),
        text: "hi".into(),
    })
    .await;
    r.command(UiCommand::SendMessage {
        conversation: ConversationSelector::Channel(0),
        text: "  ".into(),
    })
    .await;

    let rejected: Vec<InputError> = r
        .notices()
        .into_iter()
        .filter_map(|n| match n {
            Notice::Rejected(e) => Some(e),
            _ => None,
        })
        .collect();
    assert_eq!(
        rejected,
        vec![
            InputError::NotConnected,
            InputError::UnknownPeer("mallory".into()),
            InputError::NotChatCapable("hilltop".into()),
            InputError::Empty,
        ]
    );
    assert!(r.dev.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn identical_outgoing_message_is_suppressed() {
    let mut r = rig(device());
    r.connect().await;
    r.settle().await;

    let send = || UiCommand::SendMessage {
        conversation: ConversationSelector::Channel(0),
        text: "same words".into(),
    };
    r.command(send()).await;
    r.command(send()).await;
    assert_eq!(r.dev.sent().len(), 1);
    assert_eq!(r.client.store().len(), 1);
    assert!(r.notices().contains(&Notice::Rejected(InputError::Duplicate)));
}

#[tokio::test(start_paused = true)]
async fn transport_errors_on_channel_send_retry_then_fail() {
    let mut r = rig(device());
    r.connect().await;
    r.settle().await;

    r.dev.fail_next_sends(2);
    r.command(UiCommand::SendMessage {
        conversation: ConversationSelector::Channel(0),
        text: "third try".into(),
    })
    .await;
    let id = r.last_outgoing_id();
    assert_eq!(r.status(&id), Some(DeliveryStatus::Sent));

    r.dev.fail_next_sends(3);
    r.command(UiCommand::SendMessage {
        conversation: ConversationSelector::Channel(0),
        text: "never".into(),
    })
    .await;
    let id = r.last_outgoing_id();
    assert_eq!(r.status(&id), Some(DeliveryStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn pending_dm_fails_when_link_drops_and_stays_down() {
    let mut r = rig(device());
    r.connect().await;
    r.settle().await;

    r.command(dm("still there?")).await;
    let id = r.last_outgoing_id();
    assert_eq!(r.dev.sent().len(), 1);

    r.dev.fail_next_connects(10);
    assert!(r.dev.drop_link());
    let watched = id.clone();
    r.step_until("failed after drop", move |c| {
        c.store().get(&watched).and_then(|m| m.delivery_status) == Some(DeliveryStatus::Failed)
    })
    .await;

    assert_eq!(
        r.status_trail(&id),
        vec![
            DeliveryStatus::Sending,
            DeliveryStatus::Sent,
            DeliveryStatus::Failed
        ]
    );
    assert_eq!(r.dev.sent().len(), 1);
    assert!(r.notices().contains(&Notice::ConnectionLost));
    assert!(r
        .notices()
        .contains(&Notice::SendFailed { message_id: id.clone() }));
}
