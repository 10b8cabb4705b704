use std::sync::Arc;
use std::time::Duration;

use application::credential::MockCredentialCheck;
use application::kv::memory::MemoryKvStore;
use application::platform::memory::MemoryPlatform;
use application::repository::memory::MemoryMembershipRepository;
use application::resource::memory::MemoryResourceStore;
use application::{
    IdentityDirectory, KvIdentityResolver, OutboundSender, PlatformGroup, ResourceError,
    ResourceFetcher, SendRateLimiter, SenderDependencies,
};
use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use domain::RawIdentity;
use web_api::{router, AppState};

pub struct NoFetch;

#[async_trait]
impl ResourceFetcher for NoFetch {
    async fn fetch(&self, url: &str) -> Result<Bytes, ResourceError> {
        Err(ResourceError::Fetch(format!("{url}: offline")))
    }
}

pub struct Fixture {
    pub app: Router,
    pub platform: Arc<MemoryPlatform>,
    pub memberships: Arc<MemoryMembershipRepository>,
    /// `@@team` 群的稳定 ID
    pub gid: String,
}

pub struct Options {
    pub auth: bool,
    pub max_upload_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            auth: false,
            max_upload_size: 1024 * 1024,
        }
    }
}

pub async fn fixture(options: Options) -> Fixture {
    let directory = Arc::new(KvIdentityResolver::new(
        Arc::new(MemoryKvStore::new()),
        Duration::from_secs(60),
    ));
    let platform = Arc::new(MemoryPlatform::new());
    let group = RawIdentity::group("@@team", "team");
    platform.set_groups(vec![PlatformGroup::new(group.clone(), Vec::new())]);
    let gid = directory.resolve(&group).await.unwrap().to_string();

    let resources = Arc::new(MemoryResourceStore::new());
    let memberships = Arc::new(MemoryMembershipRepository::new());
    let sender = Arc::new(OutboundSender::new(SenderDependencies {
        platform: platform.clone(),
        directory,
        resources: resources.clone(),
        fetcher: Arc::new(NoFetch),
        limiter: Arc::new(SendRateLimiter::new(100.0, 10)),
    }));

    let mut state = AppState::new(sender, platform.clone(), memberships.clone(), resources)
        .with_max_upload_size(options.max_upload_size);
    if options.auth {
        let mut credentials = MockCredentialCheck::new();
        credentials
            .expect_check_user()
            .returning(|username, password| username == "bot" && password == "pw");
        state = state.with_credentials(Arc::new(credentials));
    }

    Fixture {
        app: router(state),
        platform,
        memberships,
        gid,
    }
}

/// `bot:pw`
pub const BASIC_AUTH: &str = "Basic Ym90OnB3";
