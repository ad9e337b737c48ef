//! SMS delivery to an account's cell phone

use crate::channels::ChannelInfo;
use crate::directory::Directory;
use crate::error::Result;
use crate::metrics::DispatchMetrics;
use crate::providers::SmsProvider;
use std::sync::Arc;
use std::time::Duration;
use telehealth_shared::{AccountId, PhoneNumber, PhoneType, Role};
use tracing::{debug, info, warn};

/// First cell number on file, if any
pub fn first_cell(numbers: &[PhoneNumber]) -> Option<&PhoneNumber> {
    numbers
        .iter()
        .find(|number| number.phone_type == PhoneType::Cell)
}

pub struct SmsSender {
    directory: Arc<dyn Directory>,
    provider: Arc<dyn SmsProvider>,
    from_number: String,
    enabled: bool,
    timeout: Duration,
    metrics: DispatchMetrics,
    provider_name: String,
}

impl SmsSender {
    pub fn new(
        directory: Arc<dyn Directory>,
        provider: Arc<dyn SmsProvider>,
        from_number: &str,
        timeout: Duration,
        metrics: DispatchMetrics,
    ) -> Self {
        info!("Initializing SMS channel");
        Self {
            directory,
            provider,
            from_number: from_number.to_string(),
            enabled: true,
            timeout,
            metrics,
            provider_name: "sms".to_string(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_provider_name(mut self, name: &str) -> Self {
        self.provider_name = name.to_string();
        self
    }

    pub fn channel_info(&self) -> ChannelInfo {
        ChannelInfo {
            name: "sms".to_string(),
            provider: self.provider_name.clone(),
            enabled: self.enabled,
            timeout_seconds: self.timeout.as_secs(),
        }
    }

    /// Send `body` to the account's first cell number. Returns whether the
    /// provider accepted it; no cell number is a silent no-op.
    ///
    /// The submit is awaited so the caller only reports a `Send` event for
    /// an accepted message. Callers already run on a bus task spawned by
    /// `publish_async`, so the publisher never waits on the provider.
    pub async fn send(&self, account: AccountId, role: Role, body: &str) -> Result<bool> {
        if !self.enabled {
            debug!(account_id = %account, "SMS disabled, skipping");
            return Ok(false);
        }

        let numbers = self.directory.phone_numbers(account).await?;
        let Some(cell) = first_cell(&numbers) else {
            debug!(account_id = %account, role = %role, "No cell phone on file");
            return Ok(false);
        };

        let result = match tokio::time::timeout(
            self.timeout,
            self.provider.send(&self.from_number, &cell.phone, body),
        )
        .await
        {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        match result {
            Ok(()) => {
                self.metrics.sms_sent.inc();
                Ok(true)
            }
            Err(e) => {
                self.metrics.sms_failed.inc();
                warn!(account_id = %account, error = %e, "SMS send failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AccountRecord, MemoryDirectory};
    use crate::providers::RecordingSmsProvider;

    fn setup() -> (Arc<MemoryDirectory>, Arc<RecordingSmsProvider>, SmsSender, DispatchMetrics) {
        let directory = Arc::new(MemoryDirectory::new());
        let provider = Arc::new(RecordingSmsProvider::new());
        let metrics = DispatchMetrics::new().unwrap();
        let sender = SmsSender::new(
            directory.clone(),
            provider.clone(),
            "+15555550100",
            Duration::from_secs(1),
            metrics.clone(),
        );
        (directory, provider, sender, metrics)
    }

    #[tokio::test]
    async fn test_sends_to_first_cell() {
        let (directory, provider, sender, metrics) = setup();
        directory.add_account(
            AccountRecord::patient(1, 10, "p@example.test")
                .with_phone(PhoneNumber {
                    phone: "+15555550001".to_string(),
                    phone_type: PhoneType::Home,
                    verified: true,
                })
                .with_phone(PhoneNumber::cell("+15555550002")),
        );

        assert!(sender
            .send(AccountId(1), Role::Patient, "You have a new message.")
            .await
            .unwrap());

        let sent = provider.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "+15555550002");
        assert_eq!(sent[0].from, "+15555550100");
        assert_eq!(metrics.snapshot().sms_sent, 1);
    }

    #[tokio::test]
    async fn test_no_cell_is_noop() {
        let (directory, provider, sender, metrics) = setup();
        directory.add_account(AccountRecord::patient(1, 10, "p@example.test"));

        assert!(!sender.send(AccountId(1), Role::Patient, "hi").await.unwrap());
        assert!(provider.sent().is_empty());
        assert_eq!(metrics.snapshot().sms_failed, 0);
    }

    #[tokio::test]
    async fn test_provider_failure_is_counted() {
        let (directory, provider, sender, metrics) = setup();
        directory.add_account(
            AccountRecord::patient(1, 10, "p@example.test").with_phone(PhoneNumber::cell("+15555550002")),
        );
        provider.fail_number("+15555550002");

        assert!(sender.send(AccountId(1), Role::Patient, "hi").await.is_err());
        assert_eq!(metrics.snapshot().sms_failed, 1);
    }
}
