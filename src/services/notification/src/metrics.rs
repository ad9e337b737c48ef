//! Delivery counters for the notification service
//!
//! One prometheus registry per dispatcher value so independent instances
//! (and tests) never share counts. Counter names follow the
//! `<channel>.<outcome>` scheme, exported as `notification_<channel>_<outcome>_total`.

use crate::error::{NotificationError, Result};
use prometheus::{IntCounter, Opts, Registry};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Counters for every channel and for the campaign runner
#[derive(Clone)]
pub struct DispatchMetrics {
    registry: Arc<Registry>,
    pub push_sent: IntCounter,
    pub push_failed: IntCounter,
    pub push_endpoint_pruned: IntCounter,
    pub sms_sent: IntCounter,
    pub sms_failed: IntCounter,
    pub email_sent: IntCounter,
    pub email_failed: IntCounter,
    pub campaign_succeeded: IntCounter,
    pub campaign_failed: IntCounter,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub push_sent: u64,
    pub push_failed: u64,
    pub push_endpoint_pruned: u64,
    pub sms_sent: u64,
    pub sms_failed: u64,
    pub email_sent: u64,
    pub email_failed: u64,
    pub campaign_succeeded: u64,
    pub campaign_failed: u64,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace("notification"))
        .map_err(|e| {
            NotificationError::internal(format!("Failed to create {} counter: {}", name, e))
        })?;
    registry.register(Box::new(counter.clone())).map_err(|e| {
        NotificationError::internal(format!("Failed to register {} counter: {}", name, e))
    })?;
    Ok(counter)
}

impl DispatchMetrics {
    pub fn new() -> Result<Self> {
        info!("Initializing notification metrics");

        let registry = Registry::new();
        Ok(Self {
            push_sent: counter(&registry, "push_sent_total", "Push payloads accepted by the provider")?,
            push_failed: counter(&registry, "push_failed_total", "Push deliveries that failed for one device")?,
            push_endpoint_pruned: counter(
                &registry,
                "push_endpoint_pruned_total",
                "Device rows removed after the provider disabled their endpoint",
            )?,
            sms_sent: counter(&registry, "sms_sent_total", "SMS messages accepted by the provider")?,
            sms_failed: counter(&registry, "sms_failed_total", "SMS submissions that failed")?,
            email_sent: counter(&registry, "email_sent_total", "Email recipients accepted by the provider")?,
            email_failed: counter(&registry, "email_failed_total", "Email recipients whose send failed")?,
            campaign_succeeded: counter(
                &registry,
                "campaign_succeeded_total",
                "Campaign runs that completed",
            )?,
            campaign_failed: counter(&registry, "campaign_failed_total", "Campaign runs that failed")?,
            registry: Arc::new(registry),
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            push_sent: self.push_sent.get(),
            push_failed: self.push_failed.get(),
            push_endpoint_pruned: self.push_endpoint_pruned.get(),
            sms_sent: self.sms_sent.get(),
            sms_failed: self.sms_failed.get(),
            email_sent: self.email_sent.get(),
            email_failed: self.email_failed.get(),
            campaign_succeeded: self.campaign_succeeded.get(),
            campaign_failed: self.campaign_failed.get(),
        }
    }

    /// Get Prometheus registry for metrics endpoint
    pub fn get_registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics(&self) -> Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| NotificationError::internal(format!("Failed to encode metrics: {}", e)))
    }
}
