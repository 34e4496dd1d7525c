//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use rvr_utils::Database;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::instance::{Offering, RouterId, RouterInstance};
use crate::network::NetworkRecord;

/// Durable RouterRecord store.
///
/// Network, router and offering records are written through to non-volatile
/// storage on every mutation and reloaded on controller startup. Persistence
/// is best-effort: a write failure is logged and the in-memory record stays
/// authoritative.
#[derive(Clone)]
pub struct Store {
    db: Option<Database>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db", &self.db.as_ref().map(|_| "PickleDb"))
            .finish()
    }
}

/// Everything found in non-volatile storage at startup.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub offerings: Vec<Offering>,
    pub networks: Vec<NetworkRecord>,
    pub routers: Vec<RouterInstance>,
}

// ===== impl Store =====

impl Store {
    const NETWORK_PREFIX: &'static str = "network:";
    const ROUTER_PREFIX: &'static str = "router:";
    const OFFERING_PREFIX: &'static str = "offering:";

    pub fn new(db: Option<Database>) -> Store {
        Store { db }
    }

    pub(crate) fn save_network(&self, record: &NetworkRecord) {
        self.set(format!("{}{}", Self::NETWORK_PREFIX, record.id), record);
    }

    pub(crate) fn save_router(&self, router: &RouterInstance) {
        self.set(format!("{}{}", Self::ROUTER_PREFIX, router.id), router);
    }

    pub(crate) fn remove_router(&self, router_id: RouterId) {
        self.rem(format!("{}{}", Self::ROUTER_PREFIX, router_id));
    }

    pub(crate) fn save_offering(&self, offering: &Offering) {
        self.set(
            format!("{}{}", Self::OFFERING_PREFIX, offering.id),
            offering,
        );
    }

    /// Loads all persisted records. Entries that fail to deserialize are
    /// skipped with a warning; losing one record is preferable to refusing
    /// to start.
    pub fn load(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::default();

        let Some(db) = &self.db else {
            return snapshot;
        };

        let db = db.lock().unwrap();
        for key in db.get_all() {
            if key.strip_prefix(Self::OFFERING_PREFIX).is_some() {
                match db.get::<Offering>(&key) {
                    Some(offering) => snapshot.offerings.push(offering),
                    None => warn!(%key, "failed to load record"),
                }
            } else if key.strip_prefix(Self::NETWORK_PREFIX).is_some() {
                match db.get::<NetworkRecord>(&key) {
                    Some(record) => snapshot.networks.push(record),
                    None => warn!(%key, "failed to load record"),
                }
            } else if key.strip_prefix(Self::ROUTER_PREFIX).is_some() {
                match db.get::<RouterInstance>(&key) {
                    Some(router) => snapshot.routers.push(router),
                    None => warn!(%key, "failed to load record"),
                }
            }
        }

        snapshot
    }

    fn set<T>(&self, key: String, value: &T)
    where
        T: Serialize + DeserializeOwned,
    {
        if let Some(db) = &self.db
            && let Err(error) = db.lock().unwrap().set(&key, value)
        {
            warn!(%key, %error, "failed to persist record");
        }
    }

    fn rem(&self, key: String) {
        if let Some(db) = &self.db
            && let Err(error) = db.lock().unwrap().rem(&key)
        {
            warn!(%key, %error, "failed to remove record");
        }
    }
}
