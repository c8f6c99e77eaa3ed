//! Advertisement loading.
//!
//! Reads advertisement nodes from the local block namespace, falling back to
//! a fetch through the subscriber, then decodes and (optionally) verifies the
//! provider signature. Decoded advertisements are cached by CID; the cache is
//! strictly an optimization and holds only signature-verified records.

use crate::modules::ingest::datastore::IngestDatastore;
use crate::modules::ingest::error::IngestError;
use crate::modules::ingest::schema::Advertisement;
use crate::modules::ingest::subscriber::{Subscriber, SubscriberError};
use cid::Cid;
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct AdLoader {
    ds: IngestDatastore,
    sub: Arc<dyn Subscriber>,
    cache: Mutex<HashMap<Cid, Advertisement>>,
}

impl AdLoader {
    pub fn new(ds: IngestDatastore, sub: Arc<dyn Subscriber>) -> Self {
        Self {
            ds,
            sub,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load the advertisement stored under `cid`, fetching it from
    /// `publisher` when not held locally.
    ///
    /// With `verify`, the provider signature is checked and a failure is
    /// returned as [`IngestError::BadSignature`]; the advertisement is never
    /// cached in that case.
    pub async fn load(
        &self,
        publisher: PeerId,
        cid: Cid,
        verify: bool,
    ) -> Result<Advertisement, IngestError> {
        if let Some(ad) = self
            .cache
            .lock()
            .expect("ad cache lock poisoned")
            .get(&cid)
            .cloned()
        {
            return Ok(ad);
        }

        let bytes = match self.ds.get_block(&cid)? {
            Some(bytes) => bytes,
            None => {
                debug!(ad = %cid, publisher = %publisher, "Advertisement not held locally, fetching");
                let bytes = self
                    .sub
                    .fetch_block(publisher, cid)
                    .await
                    .map_err(|e| match e {
                        SubscriberError::NotFound(c) => IngestError::Missing(c),
                        other => IngestError::Subscriber(other.to_string()),
                    })?;
                self.ds.put_block(&cid, &bytes)?;
                bytes
            }
        };

        let ad = Advertisement::decode(&cid, &bytes)?;
        if verify {
            ad.verify_signature(&cid)?;
            self.cache
                .lock()
                .expect("ad cache lock poisoned")
                .insert(cid, ad.clone());
        }
        Ok(ad)
    }

    /// Drop a finalized advertisement from the cache.
    pub fn evict(&self, cid: &Cid) {
        self.cache
            .lock()
            .expect("ad cache lock poisoned")
            .remove(cid);
    }
}
