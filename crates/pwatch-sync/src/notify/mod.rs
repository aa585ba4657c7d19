//! Delivery dispatch. Deliveries only ever move out of PENDING; the
//! immediate path serves paid and admin users per report, the digest path
//! batches free users' deliveries behind a cooldown.

pub mod render;
pub mod transport;

use chrono::{DateTime, Duration, Utc};
use pwatch_core::{ChannelType, DeliveryOutcome, DeliveryPayload, NotificationChannel, User, UserRole};
use pwatch_storage::{within_limits, StoreResult, StoreTx};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::SyncPipeline;
use render::{render_alert, render_digest};
use transport::EmailMessage;

/// Minimum time between two digests to the same user.
pub const DIGEST_COOLDOWN_HOURS: i64 = 6;

pub const INACTIVE_RECIPIENT: &str = "User or channel inactive";
pub const UNSUPPORTED_CHANNEL: &str = "Unsupported channel type";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmediateDispatchResult {
    pub change_report_id: Uuid,
    pub processed_count: usize,
    pub sent_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestDispatchResult {
    pub recipient_count: usize,
    pub sent_count: usize,
    pub skipped_count: usize,
    pub pending_count: usize,
}

fn skip_reason(user: &User, channel: &NotificationChannel) -> Option<&'static str> {
    if !user.is_active || !channel.is_active {
        Some(INACTIVE_RECIPIENT)
    } else if channel.channel_type != ChannelType::Email {
        Some(UNSUPPORTED_CHANNEL)
    } else {
        None
    }
}

/// Pending deliveries per user, in order of each user's first delivery.
fn group_by_user(payloads: Vec<DeliveryPayload>) -> Vec<Vec<DeliveryPayload>> {
    let mut groups: Vec<Vec<DeliveryPayload>> = Vec::new();
    for payload in payloads {
        match groups.iter_mut().find(|g| g[0].user.id == payload.user.id) {
            Some(group) => group.push(payload),
            None => groups.push(vec![payload]),
        }
    }
    groups
}

async fn mark_digest_sent(
    tx: &mut dyn StoreTx,
    user_id: Uuid,
    delivery_ids: &[Uuid],
    now: DateTime<Utc>,
) -> StoreResult<u64> {
    let updated = tx.mark_deliveries_sent(delivery_ids, now).await?;
    tx.set_digest_watermark(user_id, now).await?;
    Ok(updated)
}

impl SyncPipeline {
    async fn record_outcome(&self, delivery_id: Uuid, outcome: DeliveryOutcome) -> StoreResult<()> {
        let applied = self
            .store
            .record_delivery_outcome(delivery_id, &outcome)
            .await?;
        if !applied {
            warn!(%delivery_id, status = %outcome.status(), "delivery already left pending; outcome ignored");
        }
        Ok(())
    }

    /// Sends one report's pending paid and admin deliveries.
    ///
    /// Send failures are recorded as FAILED and not retried.
    pub async fn send_immediate(&self, change_report_id: Uuid) -> StoreResult<ImmediateDispatchResult> {
        let span = info_span!("immediate_dispatch", report_id = %change_report_id);
        self.dispatch_immediate(change_report_id).instrument(span).await
    }

    async fn dispatch_immediate(&self, change_report_id: Uuid) -> StoreResult<ImmediateDispatchResult> {
        let payloads = self.store.pending_immediate_payloads(change_report_id).await?;
        let mut result = ImmediateDispatchResult {
            change_report_id,
            processed_count: payloads.len(),
            sent_count: 0,
            failed_count: 0,
            skipped_count: 0,
        };

        for payload in &payloads {
            if !payload.user.role.receives_immediate() {
                continue;
            }

            if let Some(reason) = skip_reason(&payload.user, &payload.channel) {
                warn!(delivery_id = %payload.delivery_id, reason, "delivery skipped");
                self.record_outcome(
                    payload.delivery_id,
                    DeliveryOutcome::Skipped {
                        reason: reason.to_string(),
                    },
                )
                .await?;
                result.skipped_count += 1;
                continue;
            }

            let sent = match render_alert(payload) {
                Ok(email) => {
                    let message = EmailMessage {
                        to: payload.channel.destination.clone(),
                        subject: email.subject,
                        html: email.html,
                        text: email.text,
                    };
                    self.transport.send(&message).await.map_err(|e| e.to_string())
                }
                Err(err) => Err(format!("rendering alert failed: {err}")),
            };

            match sent {
                Ok(()) => {
                    self.record_outcome(
                        payload.delivery_id,
                        DeliveryOutcome::Sent {
                            at: self.clock.now(),
                        },
                    )
                    .await?;
                    result.sent_count += 1;
                }
                Err(error) => {
                    warn!(delivery_id = %payload.delivery_id, %error, "immediate send failed");
                    self.record_outcome(payload.delivery_id, DeliveryOutcome::Failed { error })
                        .await?;
                    result.failed_count += 1;
                }
            }
        }

        info!(
            processed = result.processed_count,
            sent = result.sent_count,
            failed = result.failed_count,
            skipped = result.skipped_count,
            "immediate dispatch finished"
        );
        Ok(result)
    }

    /// Sends one digest per eligible free user.
    ///
    /// A successful send marks the included deliveries SENT and moves the
    /// user's watermark in one unit of work. A failed send leaves them
    /// PENDING for the next invocation.
    pub async fn send_digests(&self) -> StoreResult<DigestDispatchResult> {
        let now = self.clock.now();
        let cutoff = now - Duration::hours(DIGEST_COOLDOWN_HOURS);
        let payloads = self.store.pending_digest_payloads(cutoff).await?;
        let groups = group_by_user(payloads);

        let mut result = DigestDispatchResult {
            recipient_count: groups.len(),
            ..DigestDispatchResult::default()
        };

        for deliveries in &groups {
            let user = &deliveries[0].user;
            let channel = &deliveries[0].channel;
            if user.role != UserRole::Free {
                continue;
            }

            if let Some(reason) = skip_reason(user, channel) {
                for delivery in deliveries {
                    self.record_outcome(
                        delivery.delivery_id,
                        DeliveryOutcome::Skipped {
                            reason: reason.to_string(),
                        },
                    )
                    .await?;
                    result.skipped_count += 1;
                }
                warn!(user_id = %user.id, reason, count = deliveries.len(), "digest skipped");
                continue;
            }

            let sent = match render_digest(deliveries) {
                Ok(email) => {
                    let message = EmailMessage {
                        to: channel.destination.clone(),
                        subject: email.subject,
                        html: email.html,
                        text: email.text,
                    };
                    self.transport.send(&message).await.map_err(|e| e.to_string())
                }
                Err(err) => Err(format!("rendering digest failed: {err}")),
            };

            if let Err(error) = sent {
                warn!(user_id = %user.id, %error, "digest send failed; deliveries stay pending");
                result.pending_count += deliveries.len();
                continue;
            }

            let ids: Vec<Uuid> = deliveries.iter().map(|d| d.delivery_id).collect();
            let limits = self.config.tx_limits;
            let mut tx = self.store.begin(limits).await?;
            within_limits(limits, mark_digest_sent(tx.as_mut(), user.id, &ids, now)).await?;
            tx.commit().await?;
            result.sent_count += deliveries.len();
        }

        info!(
            recipients = result.recipient_count,
            sent = result.sent_count,
            skipped = result.skipped_count,
            pending = result.pending_count,
            "digest dispatch finished"
        );
        Ok(result)
    }
}
