use super::*;
use tokio::sync::Mutex;

#[derive(Default)]
struct RecordingSink {
    deleted: Mutex<Vec<ThreadId>>,
}

#[async_trait]
impl ThreadEventSink for RecordingSink {
    async fn thread_deleted(&self, thread_id: ThreadId) {
        self.deleted.lock().await.push(thread_id);
    }
}

async fn setup() -> (DirectoryContext, Arc<RecordingSink>, UserId, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let renter = storage.upsert_user("rita").await.expect("renter");
    let owner = storage.upsert_user("omar").await.expect("owner");
    let sink = Arc::new(RecordingSink::default());
    let ctx = DirectoryContext::new(storage, sink.clone());
    (ctx, sink, renter, owner)
}

#[tokio::test]
async fn racing_participants_open_the_same_thread() {
    let (ctx, _, renter, owner) = setup().await;
    let (from_renter, from_owner) = tokio::join!(
        find_or_create_thread(&ctx, Some(ListingId(5)), renter, owner),
        find_or_create_thread(&ctx, Some(ListingId(5)), renter, owner),
    );
    assert_eq!(
        from_renter.expect("renter call"),
        from_owner.expect("owner call")
    );

    let threads = list_threads_for_user(&ctx, renter, None)
        .await
        .expect("threads");
    assert_eq!(threads.len(), 1);
}

#[tokio::test]
async fn same_renter_and_owner_is_rejected() {
    let (ctx, _, renter, _) = setup().await;
    let err = find_or_create_thread(&ctx, None, renter, renter)
        .await
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn summaries_carry_preview_other_name_and_unread_count() {
    let (ctx, _, renter, owner) = setup().await;
    let thread_id = find_or_create_thread(&ctx, Some(ListingId(1)), renter, owner)
        .await
        .expect("thread");
    ctx.storage
        .append_message(thread_id, Some(owner), "Still available")
        .await
        .expect("message");

    let summaries = list_threads_for_user(&ctx, renter, Some(ParticipantRole::Renter))
        .await
        .expect("summaries");
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.thread_id, thread_id);
    assert_eq!(summary.other_participant_name.as_deref(), Some("omar"));
    assert_eq!(summary.last_message.as_deref(), Some("Still available"));
    assert_eq!(summary.last_sender_id, Some(owner));
    assert_eq!(summary.unread_count, 1);
    assert_eq!(summary.role, ParticipantRole::Renter);

    let counts = unread_counts(&ctx, renter).await.expect("counts");
    assert_eq!(counts.total, 1);
    assert_eq!(counts.threads.get(&thread_id), Some(&1));

    let owner_counts = unread_counts(&ctx, owner).await.expect("counts");
    assert_eq!(owner_counts.total, 0);
    assert_eq!(owner_counts.threads.get(&thread_id), Some(&0));
}

#[tokio::test]
async fn non_participant_gets_the_same_error_as_missing_thread() {
    let (ctx, _, renter, owner) = setup().await;
    let stranger = ctx.storage.upsert_user("sam").await.expect("stranger");
    let thread_id = find_or_create_thread(&ctx, None, renter, owner)
        .await
        .expect("thread");

    let forbidden = mark_thread_read(&ctx, thread_id, stranger)
        .await
        .expect_err("stranger");
    let missing = mark_thread_read(&ctx, ThreadId::random(), renter)
        .await
        .expect_err("missing");
    assert_eq!(forbidden, missing);
    assert_eq!(forbidden.code, ErrorCode::NotFound);
    assert_eq!(forbidden.message, THREAD_NOT_FOUND);

    let err = delete_thread(&ctx, thread_id, stranger)
        .await
        .expect_err("stranger delete");
    assert_eq!(err.code, ErrorCode::NotFound);
    assert!(thread_history(&ctx, thread_id, renter).await.is_ok());
}

#[tokio::test]
async fn mark_read_clears_unread_for_the_reader_only() {
    let (ctx, _, renter, owner) = setup().await;
    let thread_id = find_or_create_thread(&ctx, None, renter, owner)
        .await
        .expect("thread");
    ctx.storage
        .append_message(thread_id, Some(renter), "hello")
        .await
        .expect("message");
    ctx.storage
        .append_message(thread_id, Some(owner), "hi")
        .await
        .expect("message");

    let updated = mark_thread_read(&ctx, thread_id, owner)
        .await
        .expect("mark read");
    assert_eq!(updated, 1);

    assert_eq!(unread_counts(&ctx, owner).await.expect("counts").total, 0);
    assert_eq!(unread_counts(&ctx, renter).await.expect("counts").total, 1);
}

#[tokio::test]
async fn delete_notifies_sink_and_history_disappears() {
    let (ctx, sink, renter, owner) = setup().await;
    let thread_id = find_or_create_thread(&ctx, None, renter, owner)
        .await
        .expect("thread");
    ctx.storage
        .append_message(thread_id, Some(renter), "cancel please")
        .await
        .expect("message");

    delete_thread(&ctx, thread_id, owner).await.expect("delete");
    assert_eq!(*sink.deleted.lock().await, vec![thread_id]);

    let err = thread_history(&ctx, thread_id, renter)
        .await
        .expect_err("history after delete");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn support_submissions_reuse_one_thread_per_email() {
    let (ctx, _, _, _) = setup().await;
    let contact = SupportContact {
        email: "a@b.com".into(),
        name: Some("Ana".into()),
        phone: None,
    };
    let first = submit_support_message(&ctx, contact.clone(), "where is my deposit?")
        .await
        .expect("first");
    let second = submit_support_message(&ctx, contact, "any news?")
        .await
        .expect("second");
    assert_eq!(first.thread_id, second.thread_id);
    assert!(second.message_id > first.message_id);

    let history = ctx
        .storage
        .list_messages(first.thread_id)
        .await
        .expect("history");
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|m| m.sender_id.is_none()));
}

#[tokio::test]
async fn support_submission_validates_contact_and_body() {
    let (ctx, _, _, _) = setup().await;
    let bad_email = SupportContact {
        email: "nobody".into(),
        name: None,
        phone: None,
    };
    let err = submit_support_message(&ctx, bad_email, "hello")
        .await
        .expect_err("email");
    assert_eq!(err.code, ErrorCode::Validation);

    let contact = SupportContact {
        email: "a@b.com".into(),
        name: None,
        phone: None,
    };
    let err = submit_support_message(&ctx, contact, "  ")
        .await
        .expect_err("body");
    assert_eq!(err.code, ErrorCode::Validation);
}
