//! Channel selection per account

use crate::directory::Directory;
use crate::error::Result;
use std::cmp::Reverse;
use std::sync::Arc;
use telehealth_shared::{AccountId, Channel};

/// Sort rank; a higher rank wins.
fn rank(channel: Channel) -> u8 {
    match channel {
        Channel::Push => 2,
        Channel::Sms => 1,
        Channel::Email => 0,
    }
}

/// Highest-priority channel among `preferences` under Push, then SMS, then
/// Email. No preferences means Email.
pub fn resolve(preferences: &[Channel]) -> Channel {
    let mut sorted = preferences.to_vec();
    sorted.sort_by_key(|channel| Reverse(rank(*channel)));
    sorted.first().copied().unwrap_or(Channel::Email)
}

pub struct PreferenceResolver {
    directory: Arc<dyn Directory>,
}

impl PreferenceResolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    pub async fn channel_for(&self, account: AccountId) -> Result<Channel> {
        let preferences = self.directory.communication_preferences(account).await?;
        Ok(resolve(&preferences))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDirectory;

    #[test]
    fn test_priority_order() {
        assert_eq!(resolve(&[]), Channel::Email);
        assert_eq!(resolve(&[Channel::Email]), Channel::Email);
        assert_eq!(resolve(&[Channel::Email, Channel::Sms]), Channel::Sms);
        assert_eq!(
            resolve(&[Channel::Sms, Channel::Push, Channel::Email]),
            Channel::Push
        );
        assert_eq!(resolve(&[Channel::Sms, Channel::Sms]), Channel::Sms);
    }

    #[tokio::test]
    async fn test_account_without_preferences_gets_email() {
        let directory = Arc::new(MemoryDirectory::new());
        let resolver = PreferenceResolver::new(directory.clone());
        assert_eq!(resolver.channel_for(AccountId(9)).await.unwrap(), Channel::Email);

        directory
            .set_communication_preference(AccountId(9), Channel::Sms)
            .await
            .unwrap();
        assert_eq!(resolver.channel_for(AccountId(9)).await.unwrap(), Channel::Sms);
    }
}
