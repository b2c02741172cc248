//! The representative projections.
//!
//! Each projection is a [`Handler`](crate::dispatch::Handler) reducing records of some kinds
//! into reactive stores.  All entity mutation goes through the reconciler, so projections
//! are idempotent and independent of the order records arrive in.
//!
//! Deleted records are never removed from the stores, the getters of lists, channels and
//! alerts leave out whatever the [`Deletions`] projection masks.

use std::sync::Arc;

use murmur_base::{Kind, PublicKey};

use crate::{
    cache::{BoundedCache, Proximity},
    dispatch::Dispatcher,
    publish::RecentRecords,
    storage::Storage,
    watchable::Notifier,
};

pub mod alerts;
pub mod channels;
pub mod deletions;
pub mod follows;
pub mod labels;
pub mod lists;
pub mod profiles;
pub mod settings;
pub mod topics;

pub use self::{
    alerts::Alerts,
    channels::{Channel, Channels},
    deletions::{DeletionTarget, Deletions},
    follows::{FollowList, SocialGraph},
    labels::{Label, LabelTarget, Labels},
    lists::{ListEntity, Lists},
    profiles::{Profile, ProfileUpdate, Profiles},
    settings::{Setting, Settings},
    topics::{Topic, Topics},
};

/// Everything the projections share.
#[derive(Debug, Clone)]
pub(crate) struct ProjectionContext {
    pub(crate) me: Option<PublicKey>,
    pub(crate) notifier: Notifier,
    pub(crate) cache_capacity: usize,
    pub(crate) storage: Option<Arc<dyn Storage>>,
    pub(crate) recent: RecentRecords,
    pub(crate) alerts_capacity: usize,
}

/// All projections of an engine.
#[derive(Debug, Clone)]
pub struct Projections {
    /// Profiles by author.
    pub profiles: Profiles,
    /// Follow lists and the local identity's social graph.
    pub graph: SocialGraph,
    /// Deletion markers.
    pub deletions: Deletions,
    /// Replaceable and addressable lists.
    pub lists: Lists,
    /// Per-author application settings.
    pub settings: Settings,
    /// Public chat channels.
    pub channels: Channels,
    /// Hashtags.
    pub topics: Topics,
    /// Labels on records and authors.
    pub labels: Labels,
    /// Records mentioning the local identity.
    pub alerts: Alerts,
}

impl Projections {
    pub(crate) fn new(ctx: &ProjectionContext) -> Self {
        let graph = SocialGraph::new(ctx.me, ctx.notifier.clone());
        let proximity: Arc<dyn Proximity> = Arc::new(graph.clone());
        let profiles = Profiles::new(
            BoundedCache::new(ctx.cache_capacity, proximity.clone(), ctx.notifier.clone()),
            ctx.storage.clone(),
        );
        let deletions = Deletions::new(ctx.notifier.clone(), ctx.recent.clone());
        let lists = Lists::new(
            BoundedCache::new(ctx.cache_capacity, proximity, ctx.notifier.clone()),
            deletions.clone(),
        );
        Self {
            profiles,
            graph,
            lists,
            settings: Settings::new(ctx.notifier.clone()),
            channels: Channels::new(ctx.notifier.clone(), deletions.clone()),
            topics: Topics::new(ctx.notifier.clone()),
            labels: Labels::new(ctx.notifier.clone()),
            alerts: Alerts::new(
                ctx.me,
                ctx.alerts_capacity,
                ctx.notifier.clone(),
                deletions.clone(),
            ),
            deletions,
        }
    }

    /// Registers all projections with the dispatcher.
    pub(crate) fn register(&self, dispatcher: &Dispatcher) {
        dispatcher.add_handler(Kind::METADATA, self.profiles.clone());
        dispatcher.add_handler(Kind::CONTACTS, self.graph.clone());
        dispatcher.add_handler(Kind::DELETION, self.deletions.clone());
        dispatcher.add_handler(Kind::APP_DATA, self.settings.clone());
        dispatcher.add_handler(Kind::CHANNEL_CREATE, self.channels.clone());
        dispatcher.add_handler(Kind::CHANNEL_METADATA, self.channels.clone());
        dispatcher.add_handler(Kind::LABEL, self.labels.clone());
        // Lists span whole kind ranges, topics and alerts apply to any kind.
        dispatcher.add_global_handler(self.lists.clone());
        dispatcher.add_global_handler(self.topics.clone());
        dispatcher.add_global_handler(self.alerts.clone());
    }
}

/// Parses a hex public key from a tag value.
fn parse_pubkey(value: &str) -> Option<PublicKey> {
    value.parse().ok()
}
