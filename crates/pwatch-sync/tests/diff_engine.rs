mod common;

use chrono::Duration;
use common::{card, product_url, Harness};
use pwatch_core::{ChangeType, DeliveryStatus, NotificationDelivery, UserRole};
use pwatch_sync::{Clock, DiffError};
use uuid::Uuid;

fn change_types(state: &pwatch_storage::MemoryState) -> Vec<ChangeType> {
    let mut types: Vec<ChangeType> = state.change_items.iter().map(|i| i.change_type).collect();
    types.sort();
    types
}

#[tokio::test]
async fn first_run_reports_every_product_as_new() {
    let h = Harness::new().await;
    h.list("lauamangud", &[card("azul", "29,99", true), card("catan", "39,90", false)]);
    let run = h.scrape("lauamangud").await;

    let diff = h.pipeline.run_diff(run.scrape_run_id).await.unwrap();

    assert_eq!(diff.total_changes, 2);
    assert!(!diff.reused_existing_report);
    let state = h.state().await;
    assert_eq!(state.reports.len(), 1);
    assert_eq!(change_types(&state), vec![ChangeType::NewProduct; 2]);
    let item = &state.change_items[0];
    assert_eq!(item.old_price, None);
    assert!(item.new_price.is_some());
    assert!(item.new_stock_status.is_some());
}

#[tokio::test]
async fn price_moves_produce_directional_events() {
    let h = Harness::new().await;
    h.list(
        "lauamangud",
        &[card("azul", "12,99", true), card("catan", "14,99", true), card("dixit", "20,00", true)],
    );
    h.scrape("lauamangud").await;

    h.list(
        "lauamangud",
        &[card("azul", "14,99", true), card("catan", "12,99", true), card("dixit", "20,00", true)],
    );
    let second = h.scrape("lauamangud").await;
    let diff = h.pipeline.run_diff(second.scrape_run_id).await.unwrap();

    assert_eq!(diff.total_changes, 2);
    let state = h.state().await;
    let product_id = |slug: &str| {
        state
            .products
            .iter()
            .find(|p| p.external_url == product_url(slug))
            .unwrap()
            .id
    };
    let report_id = diff.change_report_id.unwrap();
    let items: Vec<_> = state
        .change_items
        .iter()
        .filter(|i| i.change_report_id == report_id)
        .collect();

    let up = items.iter().find(|i| i.product_id == product_id("azul")).unwrap();
    assert_eq!(up.change_type, ChangeType::PriceIncrease);
    assert_eq!(up.old_price.unwrap().to_string(), "12.99");
    assert_eq!(up.new_price.unwrap().to_string(), "14.99");

    let down = items.iter().find(|i| i.product_id == product_id("catan")).unwrap();
    assert_eq!(down.change_type, ChangeType::PriceDecrease);

    assert!(items.iter().all(|i| i.product_id != product_id("dixit")));
}

#[tokio::test]
async fn stock_transitions_produce_sold_out_and_back_in_stock() {
    let h = Harness::new().await;
    h.list("lauamangud", &[card("azul", "10,00", true), card("catan", "10,00", false)]);
    h.scrape("lauamangud").await;

    h.list("lauamangud", &[card("azul", "10,00", false), card("catan", "10,00", true)]);
    let second = h.scrape("lauamangud").await;
    let diff = h.pipeline.run_diff(second.scrape_run_id).await.unwrap();

    assert_eq!(diff.sold_out_count, 1);
    assert_eq!(diff.back_in_stock_count, 1);
    let state = h.state().await;
    let run = state.runs.iter().find(|r| r.id == second.scrape_run_id).unwrap();
    assert_eq!(run.sold_out, 1);
    assert_eq!(run.back_in_stock, 1);
    let sold_out = state
        .change_items
        .iter()
        .find(|i| i.change_type == ChangeType::SoldOut)
        .unwrap();
    assert_eq!(sold_out.old_stock_status, Some(true));
    assert_eq!(sold_out.new_stock_status, Some(false));
}

#[tokio::test]
async fn diffing_twice_reuses_the_report_and_sends_once() {
    let h = Harness::new().await;
    h.subscriber(UserRole::Paid, "paid@example.com", "lauamangud").await;
    h.list("lauamangud", &[card("azul", "29,99", true)]);
    let run = h.scrape("lauamangud").await;

    let first = h.pipeline.run_diff(run.scrape_run_id).await.unwrap();
    let second = h.pipeline.run_diff(run.scrape_run_id).await.unwrap();

    assert!(!first.reused_existing_report);
    assert!(second.reused_existing_report);
    assert_eq!(first.change_report_id, second.change_report_id);
    assert_eq!(first.total_changes, second.total_changes);
    assert_eq!(first.sold_out_count, second.sold_out_count);
    assert_eq!(first.back_in_stock_count, second.back_in_stock_count);
    assert_eq!(first.delivery_count, 1);
    assert_eq!(second.delivery_count, 1);

    let state = h.state().await;
    assert_eq!(state.reports.len(), 1);
    assert_eq!(state.deliveries.len(), 1);
    assert_eq!(h.transport.sent().len(), 1);
}

#[tokio::test]
async fn product_first_seen_elsewhere_is_not_new_in_another_category() {
    let h = Harness::new().await;
    h.list("lauamangud", &[card("azul", "29,99", true)]);
    h.list("lopumuuk", &[card("azul", "29,99", true), card("catan", "9,99", true)]);

    h.scrape("lauamangud").await;
    let clearance = h.scrape("lopumuuk").await;
    let diff = h.pipeline.run_diff(clearance.scrape_run_id).await.unwrap();

    assert_eq!(diff.total_changes, 1);
    let state = h.state().await;
    let catan = state
        .products
        .iter()
        .find(|p| p.external_url == product_url("catan"))
        .unwrap();
    assert_eq!(state.change_items.len(), 1);
    assert_eq!(state.change_items[0].product_id, catan.id);
    assert_eq!(state.change_items[0].change_type, ChangeType::NewProduct);
}

#[tokio::test]
async fn diff_requires_a_completed_run() {
    let h = Harness::new().await;
    let missing = Uuid::new_v4();
    let err = h.pipeline.run_diff(missing).await.unwrap_err();
    assert!(matches!(err, DiffError::RunNotFound(id) if id == missing));

    h.list("lauamangud", &[]);
    let _ = h.pipeline.scrape_category("lauamangud").await;
    let failed_run = h.state().await.runs[0].id;
    let err = h.pipeline.run_diff(failed_run).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("Diff engine requires a completed scrape run: {failed_run}")
    );
}

#[tokio::test]
async fn immediate_dispatch_serves_paid_and_admin_only() {
    let h = Harness::new().await;
    let (paid, _) = h.subscriber(UserRole::Paid, "paid@example.com", "lauamangud").await;
    let (admin, _) = h.subscriber(UserRole::Admin, "admin@example.com", "lauamangud").await;
    let (free, _) = h.subscriber(UserRole::Free, "free@example.com", "lauamangud").await;
    h.list("lauamangud", &[card("azul", "29,99", true)]);
    let run = h.scrape("lauamangud").await;

    let diff = h.pipeline.run_diff(run.scrape_run_id).await.unwrap();

    assert_eq!(diff.delivery_count, 3);
    let state = h.state().await;
    let status_of = |user_id: Uuid| {
        state
            .deliveries
            .iter()
            .find(|d| d.user_id == user_id)
            .unwrap()
            .status
    };
    assert_eq!(status_of(paid.id), DeliveryStatus::Sent);
    assert_eq!(status_of(admin.id), DeliveryStatus::Sent);
    assert_eq!(status_of(free.id), DeliveryStatus::Pending);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m.to != "free@example.com"));
    assert_eq!(sent[0].subject, "1 changes in Lauamängud");
}

#[tokio::test]
async fn failed_immediate_send_is_recorded_and_not_retried() {
    let h = Harness::new().await;
    let (paid, _) = h.subscriber(UserRole::Paid, "paid@example.com", "lauamangud").await;
    h.transport.fail_for("paid@example.com");
    h.list("lauamangud", &[card("azul", "29,99", true)]);
    let run = h.scrape("lauamangud").await;

    let diff = h.pipeline.run_diff(run.scrape_run_id).await.unwrap();
    let report_id = diff.change_report_id.unwrap();

    let state = h.state().await;
    let delivery = state.deliveries.iter().find(|d| d.user_id == paid.id).unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(
        delivery.error_message.as_deref(),
        Some("mailbox unavailable: paid@example.com")
    );
    assert_eq!(delivery.sent_at, None);

    h.transport.recover("paid@example.com");
    let again = h.pipeline.send_immediate(report_id).await.unwrap();
    assert_eq!(again.processed_count, 0);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn inactive_recipient_is_skipped_with_reason() {
    let h = Harness::new().await;
    h.subscriber(UserRole::Paid, "paid@example.com", "lauamangud").await;
    h.list("lauamangud", &[card("azul", "29,99", true)]);
    let run = h.scrape("lauamangud").await;
    let report_id = h
        .pipeline
        .run_diff(run.scrape_run_id)
        .await
        .unwrap()
        .change_report_id
        .unwrap();

    let (late, late_channel) = h.subscriber(UserRole::Paid, "late@example.com", "lauamangud").await;
    let delivery_id = Uuid::new_v4();
    h.store
        .insert_delivery_row(NotificationDelivery {
            id: delivery_id,
            change_report_id: report_id,
            user_id: late.id,
            notification_channel_id: late_channel.id,
            status: DeliveryStatus::Pending,
            sent_at: None,
            error_message: None,
            created_at: h.clock.now(),
        })
        .await;
    h.store.set_channel_active(late_channel.id, false).await;
    h.clock.advance(Duration::minutes(5));

    let result = h.pipeline.send_immediate(report_id).await.unwrap();

    assert_eq!(result.processed_count, 1);
    assert_eq!(result.skipped_count, 1);
    assert_eq!(result.sent_count, 0);
    let state = h.state().await;
    let skipped = state.deliveries.iter().find(|d| d.id == delivery_id).unwrap();
    assert_eq!(skipped.status, DeliveryStatus::Skipped);
    assert_eq!(skipped.error_message.as_deref(), Some("User or channel inactive"));
    assert_eq!(h.transport.sent().len(), 1);
}
