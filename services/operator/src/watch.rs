//! Watches feeding the work queue.
//!
//! `kube::runtime::watcher` reports objects as they are applied, deleted,
//! or relisted. [`EventTranslator`] keeps the last seen copy of each object
//! so those reports become created/updated/deleted events carrying the old
//! and new objects the routers need.

use std::collections::BTreeMap;
use std::fmt::Debug;

use futures_util::StreamExt;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::queue::WorkQueue;
use crate::routing::{ResourceEvent, Trigger};

type ObjectKey = (String, String);

fn object_key<K: Resource>(object: &K) -> ObjectKey {
    (object.namespace().unwrap_or_default(), object.name_any())
}

/// Turns watcher events into [`ResourceEvent`]s.
pub struct EventTranslator<K> {
    known: BTreeMap<ObjectKey, K>,
    relist: Option<BTreeMap<ObjectKey, K>>,
}

impl<K> Default for EventTranslator<K> {
    fn default() -> Self {
        Self {
            known: BTreeMap::new(),
            relist: None,
        }
    }
}

impl<K: Resource + Clone> EventTranslator<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: Event<K>) -> Vec<ResourceEvent<K>> {
        match event {
            Event::Apply(object) => vec![self.apply(object)],
            Event::Delete(object) => {
                self.known.remove(&object_key(&object));
                vec![ResourceEvent::Deleted(object)]
            }
            Event::Init => {
                self.relist = Some(BTreeMap::new());
                Vec::new()
            }
            Event::InitApply(object) => {
                self.relist
                    .get_or_insert_with(BTreeMap::new)
                    .insert(object_key(&object), object);
                Vec::new()
            }
            Event::InitDone => self.finish_relist(),
        }
    }

    fn apply(&mut self, object: K) -> ResourceEvent<K> {
        match self.known.insert(object_key(&object), object.clone()) {
            Some(old) => ResourceEvent::Updated { old, new: object },
            None => ResourceEvent::Created(object),
        }
    }

    /// Diff the relisted objects against what was known before.
    fn finish_relist(&mut self) -> Vec<ResourceEvent<K>> {
        let listed = self.relist.take().unwrap_or_default();
        let mut previous = std::mem::take(&mut self.known);
        let mut events = Vec::new();

        for (key, object) in listed {
            match previous.remove(&key) {
                Some(old) if old.resource_version() == object.resource_version() => {}
                Some(old) => events.push(ResourceEvent::Updated {
                    old,
                    new: object.clone(),
                }),
                None => events.push(ResourceEvent::Created(object.clone())),
            }
            self.known.insert(key, object);
        }

        events.extend(previous.into_values().map(ResourceEvent::Deleted));
        events
    }
}

/// Watch `api`, route every event through `trigger`, and enqueue the
/// resulting keys until shutdown.
pub async fn run_watch<K>(
    kind: &'static str,
    api: Api<K>,
    config: watcher::Config,
    trigger: Trigger<K>,
    queue: WorkQueue,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    info!(kind, "Starting watch");

    let stream = watcher(api, config).default_backoff();
    futures_util::pin_mut!(stream);
    let mut translator = EventTranslator::new();

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    for change in translator.translate(event) {
                        for key in trigger.keys(&change) {
                            debug!(kind, group = %key, "Enqueueing group");
                            queue.add(key).await;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(kind, error = %e, "Watch error, retrying with backoff");
                }
                None => {
                    warn!(kind, "Watch stream ended");
                    break;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(kind, "Watch shutting down");
                    break;
                }
            }
        }
    }
}
