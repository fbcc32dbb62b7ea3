use std::sync::RwLock;

use async_trait::async_trait;

/// Source of the bearer token used for delivery. `None` means delivery has
/// to wait, not that anything failed.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn current_access_token(&self) -> Option<String>;
}

/// Token held in memory, replaced by whoever owns the login flow.
#[derive(Default)]
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.trim().is_empty())),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        let mut guard = self.token.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(token).filter(|t| !t.trim().is_empty());
    }

    pub fn clear(&self) {
        let mut guard = self.token.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = None;
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn current_access_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
