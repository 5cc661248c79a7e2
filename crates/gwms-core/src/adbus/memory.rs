use std::cell::RefCell;
use std::rc::Rc;

use crate::Map;
use crate::adbus::{AdBus, AdBusFuture, Constraint};
use crate::classad::{
    ATTR_AUTHENTICATED_IDENTITY, ATTR_DAEMON_START, ATTR_NAME, ATTR_SEQUENCE, AdType, ClassAd,
};

#[derive(Default)]
struct BusState {
    ads: Map<(AdType, String), ClassAd>,
    offline: bool,
    publish_calls: usize,
}

/// In-process advertisement fabric.
///
/// Handles created by [`MemoryAdBus::connect`] share the stored ads but authenticate as a
/// different identity.
#[derive(Clone)]
pub struct MemoryAdBus {
    state: Rc<RefCell<BusState>>,
    identity: String,
}

impl MemoryAdBus {
    pub fn new(identity: &str) -> Self {
        MemoryAdBus {
            state: Default::default(),
            identity: identity.to_string(),
        }
    }

    pub fn connect(&self, identity: &str) -> Self {
        MemoryAdBus {
            state: self.state.clone(),
            identity: identity.to_string(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// While offline, every call fails.
    pub fn set_offline(&self, offline: bool) {
        self.state.borrow_mut().offline = offline;
    }

    pub fn publish_calls(&self) -> usize {
        self.state.borrow().publish_calls
    }

    pub fn ads(&self, ad_type: AdType) -> Vec<ClassAd> {
        let state = self.state.borrow();
        let mut ads: Vec<ClassAd> = state
            .ads
            .iter()
            .filter(|((t, _), _)| *t == ad_type)
            .map(|(_, ad)| ad.clone())
            .collect();
        ads.sort_by(|a, b| a.name().cmp(&b.name()));
        ads
    }

    pub fn get(&self, ad_type: AdType, name: &str) -> Option<ClassAd> {
        self.state
            .borrow()
            .ads
            .get(&(ad_type, name.to_string()))
            .cloned()
    }

    fn store(&self, ads: Vec<ClassAd>) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.offline {
            anyhow::bail!("Collector is not reachable");
        }
        state.publish_calls += 1;
        for mut ad in ads {
            let ad_type = ad
                .ad_type()
                .ok_or_else(|| anyhow::anyhow!("Published ad has no known type"))?;
            let name = ad
                .get_str(ATTR_NAME)
                .ok_or_else(|| anyhow::anyhow!("Published ad has no Name"))?
                .to_string();
            ad.insert(ATTR_AUTHENTICATED_IDENTITY, self.identity.as_str());

            let key = (ad_type, name);
            if let Some(current) = state.ads.get(&key) {
                if ad.contains(ATTR_SEQUENCE) && ordering_key(&ad) <= ordering_key(current) {
                    log::debug!("Discarding out-of-order update of {ad_type} {}", key.1);
                    continue;
                }
            }
            state.ads.insert(key, ad);
        }
        Ok(())
    }
}

fn ordering_key(ad: &ClassAd) -> (i64, i64) {
    (
        ad.get_int(ATTR_DAEMON_START).unwrap_or(0),
        ad.get_int(ATTR_SEQUENCE).unwrap_or(0),
    )
}

impl AdBus for MemoryAdBus {
    fn publish(&self, ads: Vec<ClassAd>) -> AdBusFuture<()> {
        let result = self.store(ads);
        Box::pin(async move { result })
    }

    fn invalidate(&self, ad_type: AdType, constraint: Constraint) -> AdBusFuture<()> {
        let mut state = self.state.borrow_mut();
        let result = if state.offline {
            Err(anyhow::anyhow!("Collector is not reachable"))
        } else {
            state
                .ads
                .retain(|(t, _), ad| *t != ad_type || !constraint.matches(ad));
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn query(&self, ad_type: AdType, constraint: Constraint) -> AdBusFuture<Vec<ClassAd>> {
        let result = if self.state.borrow().offline {
            Err(anyhow::anyhow!("Collector is not reachable"))
        } else {
            Ok(self
                .ads(ad_type)
                .into_iter()
                .filter(|ad| constraint.matches(ad))
                .collect())
        };
        Box::pin(async move { result })
    }
}
