//! Integration tests for nickname changes.
//!
//! A nickname change rebinds the publisher and every cursor to a new client
//! id, or restores the previous binding when any step fails.
//!
//! Verification command: `cargo test --test identity_rotation`

use polychat::broker::loopback::LoopbackBroker;
use polychat::command::Command;
use polychat::identity::{self, ClientId};
use polychat::session::{
    Reply, RollbackStatus, RotationOutcome, Session, SessionError, SessionParams,
};
use polychat_proto::OffsetPolicy;

const HOST: &str = "localhost";
const PORT: u16 = 9092;

async fn connect_with(broker: &LoopbackBroker, channels: &[&str]) -> Session<LoopbackBroker> {
    let session = Session::connect(
        broker.clone(),
        SessionParams {
            host: HOST.to_string(),
            port: PORT,
            nickname: "alice".to_string(),
            offset_policy: OffsetPolicy::Latest,
        },
    )
    .await
    .unwrap();
    for channel in channels {
        session.join(channel).await.unwrap();
    }
    session
}

fn renamed_id(nickname: &str) -> ClientId {
    identity::generate(HOST, PORT, nickname, None)
}

fn all_bound_to(bindings: &[(String, Option<ClientId>)], id: &ClientId) -> bool {
    bindings.iter().all(|(_, bound)| bound.as_ref() == Some(id))
}

#[tokio::test]
async fn committed_rename_rebinds_publisher_and_cursors() {
    let broker = LoopbackBroker::new();
    let session = connect_with(&broker, &["a", "b"]).await;
    let new_id = renamed_id("bob");

    let reply = session.execute(Command::Nick("bob".to_string())).await.unwrap();
    assert!(matches!(reply, Reply::Renamed { ref nickname } if nickname == "bob"));

    assert_eq!(session.nickname().await, "bob");
    assert_eq!(session.client_id().await, new_id);
    assert!(all_bound_to(&session.channel_bindings().await, &new_id));
    assert_eq!(
        broker.open_cursors(),
        vec![("a".to_string(), new_id.clone()), ("b".to_string(), new_id.clone())]
    );
    assert_eq!(broker.open_publishers(), vec![new_id.clone()]);

    session.send_to("a", "hi").await.unwrap();
    let last = broker.published().pop().unwrap();
    assert_eq!(last.payload, b"(bob) hi");
    assert_eq!(last.client_id, Some(new_id));
}

#[tokio::test]
async fn rejected_new_id_rolls_back_to_old_binding() {
    let broker = LoopbackBroker::new();
    let session = connect_with(&broker, &["a", "b"]).await;
    let old_id = session.client_id().await;
    broker.reject_client(&renamed_id("bob"));

    let outcome = session.rotate_identity("bob").await;
    assert!(matches!(
        outcome,
        RotationOutcome::RolledBack {
            cause: SessionError::PublisherUnavailable(_)
        }
    ));

    assert_eq!(session.nickname().await, "alice");
    assert_eq!(session.client_id().await, old_id);
    assert!(all_bound_to(&session.channel_bindings().await, &old_id));
    assert_eq!(broker.open_publishers(), vec![old_id]);
}

#[tokio::test]
async fn rebuild_failure_rolls_back_every_channel() {
    let broker = LoopbackBroker::new();
    let session = connect_with(&broker, &["a", "b", "c"]).await;
    let old_id = session.client_id().await;
    broker.reject_cursors(&renamed_id("bob"));

    let outcome = session.rotate_identity("bob").await;
    let RotationOutcome::RolledBack { cause } = outcome else {
        panic!("expected rollback, got {outcome:?}");
    };
    assert!(matches!(
        cause,
        SessionError::ChannelUnreachable { ref channel, .. } if channel == "a"
    ));

    let bindings = session.channel_bindings().await;
    assert_eq!(bindings.len(), 3);
    assert!(all_bound_to(&bindings, &old_id));
    assert_eq!(broker.open_cursors().len(), 3);
    assert_eq!(broker.open_publishers(), vec![old_id]);
}

#[tokio::test]
async fn nick_command_reports_restored_rollback() {
    let broker = LoopbackBroker::new();
    let session = connect_with(&broker, &["a"]).await;
    broker.reject_cursors(&renamed_id("bob"));

    let err = session
        .execute(Command::Nick("bob".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::IdentityRotationFailed {
            rollback: RollbackStatus::Restored,
            ..
        }
    ));
    assert!(err.to_string().contains("previous identity restored"));
}

#[tokio::test]
async fn failed_rollback_is_inconsistent_and_recoverable() {
    let broker = LoopbackBroker::new();
    let session = connect_with(&broker, &["a", "b"]).await;
    let old_id = session.client_id().await;
    broker.make_unreachable("b");

    let outcome = session.rotate_identity("bob").await;
    let RotationOutcome::Inconsistent {
        cause,
        rollback_error,
    } = outcome
    else {
        panic!("expected inconsistent, got {outcome:?}");
    };
    assert!(matches!(
        cause,
        SessionError::ChannelUnreachable { ref channel, .. } if channel == "b"
    ));
    assert!(matches!(
        rollback_error,
        SessionError::ChannelUnreachable { ref channel, .. } if channel == "b"
    ));

    // The old identity stays in effect; "b" is kept but detached.
    assert_eq!(session.nickname().await, "alice");
    let bindings = session.channel_bindings().await;
    assert_eq!(
        bindings,
        vec![("a".to_string(), Some(old_id.clone())), ("b".to_string(), None)]
    );

    // A later successful rename reattaches every channel.
    broker.make_reachable("b");
    let outcome = session.rotate_identity("carol").await;
    assert!(matches!(outcome, RotationOutcome::Committed { .. }));
    assert!(all_bound_to(&session.channel_bindings().await, &renamed_id("carol")));
}

#[tokio::test]
async fn renaming_back_yields_the_unsalted_id_not_the_original() {
    let broker = LoopbackBroker::new();
    let session = connect_with(&broker, &[]).await;
    let salted = session.client_id().await;

    session.rotate_identity("bob").await;
    session.rotate_identity("alice").await;

    let unsalted = session.client_id().await;
    assert_eq!(unsalted, renamed_id("alice"));
    assert_ne!(unsalted, salted);
}
