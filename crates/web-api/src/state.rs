use std::sync::Arc;

use application::{
    ChatPlatform, CredentialCheck, MembershipRepository, OutboundSender, ResourceStore,
};

#[derive(Clone)]
pub struct AppState {
    pub sender: Arc<OutboundSender>,
    pub platform: Arc<dyn ChatPlatform>,
    pub memberships: Arc<dyn MembershipRepository>,
    pub resources: Arc<dyn ResourceStore>,
    /// `None` 时所有接口免认证
    pub credentials: Option<Arc<dyn CredentialCheck>>,
    pub max_upload_size: usize,
}

impl AppState {
    pub fn new(
        sender: Arc<OutboundSender>,
        platform: Arc<dyn ChatPlatform>,
        memberships: Arc<dyn MembershipRepository>,
        resources: Arc<dyn ResourceStore>,
    ) -> Self {
        Self {
            sender,
            platform,
            memberships,
            resources,
            credentials: None,
            max_upload_size: 20 * 1024 * 1024,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialCheck>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_max_upload_size(mut self, max_upload_size: usize) -> Self {
        self.max_upload_size = max_upload_size;
        self
    }
}
