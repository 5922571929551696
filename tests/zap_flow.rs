mod common;

use common::{receipt, TestContext};
use rs_zap_pos::zap::zap_correlator::ZapOutcome;
use rs_zap_pos::{
    verify_event_sig, Filter, Relay, ZapCorrelator, ZapError, ZapState, KIND_ZAP_RECEIPT,
};
use secp256k1::rand::rngs::OsRng;
use secp256k1::{KeyPair, Secp256k1};
use std::time::Duration;

#[tokio::test]
async fn test_one_relay_rejects_and_receipt_still_matches() {
    let ctx = TestContext::new();
    ctx.relays[1].set_accept(false);

    let mut pending = ctx.correlator.start(&ctx.order(1000)).await.unwrap();
    let publish = pending.publish_outcome();
    assert_eq!(publish.accepted, vec!["wss://relay.one".to_string()]);
    assert_eq!(publish.failed.len(), 1);
    assert_eq!(publish.failed[0].0, "wss://relay.two");
    assert!(publish.error().is_none());
    assert_eq!(pending.state(), ZapState::AwaitingReceipt);

    let request = pending.request().clone();
    assert!(verify_event_sig(&request));
    assert_eq!(request.tag_value("amount"), Some("1000"));
    assert_eq!(ctx.relays[0].published(), vec![request.clone()]);
    assert!(ctx.relays[1].published().is_empty());

    let paid = ctx.receipt_for(&request.id);
    ctx.relays[1].deliver(&paid);
    assert_eq!(pending.outcome().await, ZapState::Matched { receipt: paid });
    assert_eq!(ctx.relays[0].subscription_count(), 0);
    assert_eq!(ctx.relays[1].subscription_count(), 0);
}

#[tokio::test]
async fn test_no_relay_accepts_is_informational() {
    let ctx = TestContext::new();
    ctx.relays[0].set_accept(false);
    ctx.relays[1].set_online(false);

    let pending = ctx.correlator.start(&ctx.order(1000)).await.unwrap();
    match pending.publish_outcome().error() {
        Some(ZapError::PublishFailed(failures)) => assert_eq!(failures.len(), 2),
        other => panic!("expected PublishFailed, got {other:?}"),
    }
    assert_eq!(pending.state(), ZapState::AwaitingReceipt);
    pending.cancel().await;
}

#[tokio::test]
async fn test_duplicate_delivery_yields_one_event() {
    let ctx = TestContext::new();
    let request = ctx
        .correlator
        .generate_request(1000, &ctx.recipient_pubkey(), "user@domain.com", None)
        .unwrap();
    let mut subscription = ctx
        .correlator
        .subscribe_for_receipt(&request.id, &ctx.recipient_pubkey())
        .await;

    let paid = ctx.receipt_for(&request.id);
    ctx.relays[0].deliver(&paid);
    ctx.relays[1].deliver(&paid);

    assert_eq!(subscription.next().await, Some(paid));
    assert!(tokio::time::timeout(Duration::from_millis(50), subscription.next())
        .await
        .is_err());
    subscription.close().await;
}

#[tokio::test]
async fn test_concurrent_orders_stay_isolated() {
    let ctx = TestContext::new();
    let mut first = ctx.correlator.start(&ctx.order(1000)).await.unwrap();
    let mut second = ctx.correlator.start(&ctx.order(2000)).await.unwrap();
    assert_ne!(first.request_id(), second.request_id());

    let paid = ctx.receipt_for(second.request_id());
    ctx.relays[0].deliver_raw(&paid);
    ctx.relays[1].deliver_raw(&paid);

    assert_eq!(second.outcome().await, ZapState::Matched { receipt: paid });
    assert_eq!(first.state(), ZapState::AwaitingReceipt);

    let paid_first = ctx.receipt_for(first.request_id());
    ctx.relays[0].deliver(&paid_first);
    assert_eq!(
        first.outcome().await,
        ZapState::Matched {
            receipt: paid_first
        }
    );
}

#[tokio::test]
async fn test_receipt_stored_before_subscription_is_replayed() {
    let ctx = TestContext::new();
    let recipient = ctx.recipient_pubkey();
    let request = ctx
        .correlator
        .generate_request(1000, &recipient, "user@domain.com", None)
        .unwrap();

    let paid = ctx.receipt_for(&request.id);
    ctx.relays[1].publish(&paid).await.unwrap();

    let subscription = ctx.correlator.subscribe_for_receipt(&request.id, &recipient).await;
    let outcome = ZapCorrelator::await_receipt(
        subscription,
        &request.id,
        &recipient,
        Some(Duration::from_secs(1)),
    )
    .await;
    assert_eq!(outcome, ZapOutcome::Matched(paid));
}

#[tokio::test]
async fn test_forged_and_foreign_receipts_are_ignored() {
    let ctx = TestContext::new();
    let mut pending = ctx.correlator.start(&ctx.order(1000)).await.unwrap();
    let request_id = pending.request_id().to_string();

    let stranger = KeyPair::new(&Secp256k1::new(), &mut OsRng);
    ctx.relays[0].deliver_raw(&receipt(&stranger, &request_id));

    let paid = ctx.receipt_for(&request_id);
    let mut forged = paid.clone();
    forged.tags.push(vec!["amount".to_string(), "1".to_string()]);
    ctx.relays[0].deliver_raw(&forged);
    assert_eq!(pending.state(), ZapState::AwaitingReceipt);

    ctx.relays[1].deliver(&paid);
    assert_eq!(pending.outcome().await, ZapState::Matched { receipt: paid });
}

#[tokio::test]
async fn test_fetch_published_event() {
    let ctx = TestContext::new();
    let pending = ctx.correlator.start(&ctx.order(1000)).await.unwrap();
    let request = pending.request().clone();
    pending.cancel().await;

    let fetched = ctx
        .relay_set
        .fetch_event(&request.id, Duration::from_secs(1))
        .await;
    assert_eq!(fetched, Some(request));

    let missing = ctx
        .relay_set
        .fetch_event(&"00".repeat(32), Duration::from_millis(50))
        .await;
    assert_eq!(missing, None);
}

#[tokio::test]
async fn test_subscription_stream_filters_locally() {
    use futures_util::StreamExt;

    let ctx = TestContext::new();
    let author = ctx.recipient_pubkey();
    let subscription = ctx
        .relay_set
        .subscribe(Filter::new().kind(KIND_ZAP_RECEIPT).author(&author))
        .await;
    let handle = subscription.handle();

    let stranger = KeyPair::new(&Secp256k1::new(), &mut OsRng);
    let expected = ctx.receipt_for(&"ab".repeat(32));
    ctx.relays[0].deliver_raw(&receipt(&stranger, &"ab".repeat(32)));
    ctx.relays[0].deliver_raw(&expected);

    let mut stream = Box::pin(subscription.into_stream());
    assert_eq!(stream.next().await, Some(expected));
    handle.close().await;
    assert_eq!(stream.next().await, None);
}
