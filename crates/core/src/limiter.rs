use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceClass {
    UserDrive,
    Library,
    Group,
}

impl fmt::Display for ServiceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UserDrive => "user_drive",
            Self::Library => "library",
            Self::Group => "group",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parallelism {
    /// Item metadata fetches in flight across every collection of a service.
    pub item: usize,
    /// Records buffered in a collection's output stream.
    pub collection_buffer: usize,
}

impl Default for Parallelism {
    fn default() -> Self {
        Self {
            item: 4,
            collection_buffer: 5,
        }
    }
}

/// Per-service worker pools shared by all collections in a run.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    pools: Arc<HashMap<ServiceClass, Pool>>,
}

#[derive(Debug)]
struct Pool {
    parallelism: Parallelism,
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    pub fn new(settings: impl IntoIterator<Item = (ServiceClass, Parallelism)>) -> Self {
        let mut pools: HashMap<ServiceClass, Pool> = [
            ServiceClass::UserDrive,
            ServiceClass::Library,
            ServiceClass::Group,
        ]
        .into_iter()
        .map(|class| (class, Pool::new(Parallelism::default())))
        .collect();
        for (class, parallelism) in settings {
            pools.insert(class, Pool::new(parallelism));
        }
        Self {
            pools: Arc::new(pools),
        }
    }

    pub fn parallelism(&self, class: ServiceClass) -> Parallelism {
        self.pools
            .get(&class)
            .map(|p| p.parallelism)
            .unwrap_or_default()
    }

    pub fn item_semaphore(&self, class: ServiceClass) -> Arc<Semaphore> {
        match self.pools.get(&class) {
            Some(pool) => pool.semaphore.clone(),
            None => Arc::new(Semaphore::new(Parallelism::default().item)),
        }
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new([])
    }
}

impl Pool {
    fn new(parallelism: Parallelism) -> Self {
        let parallelism = Parallelism {
            item: parallelism.item.max(1),
            collection_buffer: parallelism.collection_buffer.max(1),
        };
        Self {
            parallelism,
            semaphore: Arc::new(Semaphore::new(parallelism.item)),
        }
    }
}
