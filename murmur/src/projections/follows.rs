//! Follow lists and the social graph around the local identity.

use std::{collections::BTreeSet, sync::Arc};

use murmur_base::{Event, PublicKey, Timestamp};
use murmur_relay::BoxFuture;
use tracing::trace;

use super::parse_pubkey;
use crate::{
    cache::Proximity,
    dispatch::Handler,
    reconcile::{Lww, Reconcile},
    store::{Dependency, Derived, Store, derived},
    watchable::Notifier,
};

/// An author's follow list.
///
/// The list is replaced as a whole by newer contact records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowList {
    /// The followed authors.
    pub follows: Lww<BTreeSet<PublicKey>>,
}

impl Reconcile for FollowList {
    type Update = BTreeSet<PublicKey>;

    fn apply(&mut self, timestamp: Timestamp, update: BTreeSet<PublicKey>) -> bool {
        self.follows.apply(timestamp, update)
    }

    fn updated_at(&self) -> Timestamp {
        self.follows.updated_at()
    }
}

impl FollowList {
    /// Whether `pubkey` is followed.
    pub fn contains(&self, pubkey: &PublicKey) -> bool {
        self.follows.get().is_some_and(|f| f.contains(pubkey))
    }

    /// The number of followed authors.
    pub fn len(&self) -> usize {
        self.follows.get().map(BTreeSet::len).unwrap_or(0)
    }

    /// Whether no author is followed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The local identity's neighbourhood in the follow graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Neighbourhood {
    /// Whether the local identity's follow list was received.
    pub loaded: bool,
    /// Authors the local identity follows.
    pub first_degree: BTreeSet<PublicKey>,
    /// Authors followed by first degree contacts, excluding first degree ones.
    pub second_degree: BTreeSet<PublicKey>,
}

impl Neighbourhood {
    /// Whether `pubkey` is a first or second degree contact.
    pub fn contains(&self, pubkey: &PublicKey) -> bool {
        self.first_degree.contains(pubkey) || self.second_degree.contains(pubkey)
    }
}

/// Reduces contact records into [`FollowList`]s and provides the [`Proximity`] of
/// authors to the local identity.
#[derive(Debug, Clone)]
pub struct SocialGraph {
    me: Option<PublicKey>,
    follows: Store<PublicKey, FollowList>,
    neighbourhood: Derived<Arc<Neighbourhood>>,
}

impl SocialGraph {
    pub(crate) fn new(me: Option<PublicKey>, notifier: Notifier) -> Self {
        let follows: Store<PublicKey, FollowList> = Store::new(notifier);
        let deps: Vec<Arc<dyn Dependency>> = vec![Arc::new(follows.clone())];
        let store = follows.clone();
        let neighbourhood = derived(deps, move || Arc::new(compute(me, &store)));
        Self {
            me,
            follows,
            neighbourhood,
        }
    }

    /// The local identity, if known.
    pub fn me(&self) -> Option<PublicKey> {
        self.me
    }

    /// The follow lists by author.
    pub fn follows(&self) -> &Store<PublicKey, FollowList> {
        &self.follows
    }

    /// The current neighbourhood, recomputed only when a follow list changed.
    pub fn neighbourhood(&self) -> Arc<Neighbourhood> {
        self.neighbourhood.get()
    }

    /// The derived neighbourhood, to await changes.
    pub fn watch_neighbourhood(&self) -> &Derived<Arc<Neighbourhood>> {
        &self.neighbourhood
    }

    /// Applies a contact record, returns whether the follow list changed.
    pub fn apply(&self, event: &Event) -> bool {
        let follows: BTreeSet<PublicKey> = event.tag_values("p").filter_map(parse_pubkey).collect();
        trace!(author = %event.pubkey.fmt_short(), follows = follows.len(), "follow list");
        let created_at = event.created_at;
        self.follows.key(event.pubkey).update(FollowList::default, |list| {
            list.apply(created_at, follows);
        })
    }
}

fn compute(me: Option<PublicKey>, follows: &Store<PublicKey, FollowList>) -> Neighbourhood {
    let Some(me) = me else {
        return Neighbourhood::default();
    };
    let Some(own) = follows.get(&me) else {
        return Neighbourhood::default();
    };
    let first_degree: BTreeSet<PublicKey> = own.follows.get().cloned().unwrap_or_default();
    let second_degree = first_degree
        .iter()
        .filter_map(|contact| follows.get(contact))
        .flat_map(|list| list.follows.get().cloned().unwrap_or_default())
        .filter(|pubkey| *pubkey != me && !first_degree.contains(pubkey))
        .collect();
    Neighbourhood {
        loaded: true,
        first_degree,
        second_degree,
    }
}

impl Proximity for SocialGraph {
    fn is_loaded(&self) -> bool {
        self.neighbourhood().loaded
    }

    fn is_self(&self, pubkey: &PublicKey) -> bool {
        self.me.as_ref() == Some(pubkey)
    }

    fn is_close_contact(&self, pubkey: &PublicKey) -> bool {
        self.neighbourhood().contains(pubkey)
    }

    fn snapshot(&self) -> Arc<dyn Proximity> {
        Arc::new(NeighbourhoodView {
            me: self.me,
            neighbourhood: self.neighbourhood(),
        })
    }
}

/// A fixed neighbourhood, answering without touching the follow store.
#[derive(Debug, Clone)]
struct NeighbourhoodView {
    me: Option<PublicKey>,
    neighbourhood: Arc<Neighbourhood>,
}

impl Proximity for NeighbourhoodView {
    fn is_loaded(&self) -> bool {
        self.neighbourhood.loaded
    }

    fn is_self(&self, pubkey: &PublicKey) -> bool {
        self.me.as_ref() == Some(pubkey)
    }

    fn is_close_contact(&self, pubkey: &PublicKey) -> bool {
        self.neighbourhood.contains(pubkey)
    }

    fn snapshot(&self) -> Arc<dyn Proximity> {
        Arc::new(self.clone())
    }
}

impl Handler for SocialGraph {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()> {
        self.apply(&event);
        Box::pin(async {})
    }
}
