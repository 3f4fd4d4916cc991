use super::*;
use crate::auth::TokenIssuer;
use shared::domain::UserId;
use storage::Storage;

async fn setup() -> (ApiContext, RoomId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let room = storage
        .get_or_create_general_room(&UserId::new("alice"), &UserId::new("bob"))
        .await
        .expect("room");
    let ctx = ApiContext {
        storage,
        tokens: TokenIssuer::new("s", 60),
    };
    (ctx, room.id)
}

fn join(topic: &str, token: Option<String>, filter: Option<ChangeFilter>) -> RealtimeClientFrame {
    RealtimeClientFrame::Join {
        topic: topic.to_string(),
        join_ref: 7,
        access_token: token,
        filter,
        private: true,
    }
}

fn token(ctx: &ApiContext, user: &str) -> String {
    ctx.tokens.mint(&UserId::new(user)).expect("token")
}

fn reply_status(reply: Option<RealtimeServerFrame>) -> (JoinStatus, Option<String>) {
    match reply {
        Some(RealtimeServerFrame::JoinReply {
            join_ref, status, reason, ..
        }) => {
            assert_eq!(join_ref, 7);
            (status, reason)
        }
        other => panic!("expected a join reply, got {other:?}"),
    }
}

#[tokio::test]
async fn participant_joins_room_topic() {
    let (ctx, room) = setup().await;
    let mut connection = Connection::default();
    let reply = connection
        .handle(
            &ctx,
            join(
                "room:x:messages",
                Some(token(&ctx, "alice")),
                Some(ChangeFilter::messages_in(room.clone())),
            ),
        )
        .await;

    assert_eq!(reply_status(reply).0, JoinStatus::Ok);
    assert_eq!(connection.topics_for(&room).collect::<Vec<_>>(), ["room:x:messages"]);
}

#[tokio::test]
async fn outsider_and_anonymous_joins_are_refused() {
    let (ctx, room) = setup().await;
    let mut connection = Connection::default();

    let (status, reason) = reply_status(
        connection
            .handle(
                &ctx,
                join("t", None, Some(ChangeFilter::messages_in(room.clone()))),
            )
            .await,
    );
    assert_eq!(status, JoinStatus::Error);
    assert_eq!(reason.as_deref(), Some("missing access token"));

    let (status, reason) = reply_status(
        connection
            .handle(
                &ctx,
                join(
                    "t",
                    Some(token(&ctx, "mallory")),
                    Some(ChangeFilter::messages_in(room.clone())),
                ),
            )
            .await,
    );
    assert_eq!(status, JoinStatus::Error);
    assert_eq!(reason.as_deref(), Some("user is not a participant"));
    assert_eq!(connection.topics_for(&room).count(), 0);
}

#[tokio::test]
async fn join_without_filter_is_refused() {
    let (ctx, _) = setup().await;
    let mut connection = Connection::default();
    let (status, reason) = reply_status(
        connection
            .handle(&ctx, join("t", Some(token(&ctx, "alice")), None))
            .await,
    );
    assert_eq!(status, JoinStatus::Error);
    assert!(reason.expect("reason").contains("filter"));
}

#[tokio::test]
async fn health_check_topic_always_joins() {
    let (ctx, _) = setup().await;
    let mut connection = Connection::default();
    let (status, _) = reply_status(
        connection
            .handle(&ctx, join(HEALTH_CHECK_TOPIC, None, None))
            .await,
    );
    assert_eq!(status, JoinStatus::Ok);
    assert!(connection.topics.is_empty());
}

#[tokio::test]
async fn token_frame_authorizes_later_joins_and_leave_drops_topic() {
    let (ctx, room) = setup().await;
    let mut connection = Connection::default();
    let ack = connection
        .handle(
            &ctx,
            RealtimeClientFrame::AccessToken {
                access_token: token(&ctx, "bob"),
            },
        )
        .await;
    assert!(ack.is_none());

    let (status, _) = reply_status(
        connection
            .handle(&ctx, join("t", None, Some(ChangeFilter::messages_in(room.clone()))))
            .await,
    );
    assert_eq!(status, JoinStatus::Ok);

    connection
        .handle(&ctx, RealtimeClientFrame::Leave { topic: "t".into() })
        .await;
    assert_eq!(connection.topics_for(&room).count(), 0);
}

#[tokio::test]
async fn heartbeat_is_acknowledged() {
    let (ctx, _) = setup().await;
    let reply = Connection::default()
        .handle(&ctx, RealtimeClientFrame::Heartbeat)
        .await;
    assert!(matches!(reply, Some(RealtimeServerFrame::HeartbeatAck)));
}
