//! Typed cache on top of a [`KvStore`].
//!
//! Two things are remembered across restarts:
//!
//! - the last group an address connected to (`last-group:<address>`)
//! - echoes still awaiting confirmation in a group (`echoes:<group>`)
//!
//! Values are CBOR. A value that no longer decodes is treated as a miss.

use conclave_core::{Address, GroupId, MessageRecord};

use crate::error::{Result, StoreError};
use crate::traits::KvStore;

const LAST_GROUP_PREFIX: &str = "last-group:";
const ECHOES_PREFIX: &str = "echoes:";

/// Typed session cache.
pub struct SessionCache<S: KvStore> {
    kv: S,
}

impl<S: KvStore> SessionCache<S> {
    pub fn new(kv: S) -> Self {
        Self { kv }
    }

    /// The underlying store.
    pub fn kv(&self) -> &S {
        &self.kv
    }

    /// Last group this address connected to.
    pub async fn last_group(&self, address: &Address) -> Result<Option<GroupId>> {
        let key = format!("{LAST_GROUP_PREFIX}{address}");
        Ok(self.read::<GroupId>(&key).await?)
    }

    pub async fn remember_group(&self, address: &Address, group: &GroupId) -> Result<()> {
        let key = format!("{LAST_GROUP_PREFIX}{address}");
        self.write(&key, group).await
    }

    pub async fn forget_group(&self, address: &Address) -> Result<()> {
        self.kv.remove(&format!("{LAST_GROUP_PREFIX}{address}")).await
    }

    /// Echoes that were still pending when the last session ended.
    pub async fn pending_echoes(&self, group: &GroupId) -> Result<Vec<MessageRecord>> {
        let key = format!("{ECHOES_PREFIX}{group}");
        Ok(self.read::<Vec<MessageRecord>>(&key).await?.unwrap_or_default())
    }

    /// Replace the persisted echoes for a group. An empty list clears the key.
    pub async fn save_pending_echoes(
        &self,
        group: &GroupId,
        echoes: &[MessageRecord],
    ) -> Result<()> {
        let key = format!("{ECHOES_PREFIX}{group}");
        if echoes.is_empty() {
            return self.kv.remove(&key).await;
        }
        self.write(&key, &echoes.to_vec()).await
    }

    async fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(bytes) = self.kv.get(key).await? else {
            return Ok(None);
        };

        match ciborium::from_reader::<T, _>(bytes.as_slice()) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    async fn write<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.kv.set(key, &buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;
    use conclave_core::MessagePayload;

    #[tokio::test]
    async fn test_last_group_per_address() {
        let cache = SessionCache::new(MemoryKv::new());
        let alice = Address::new("0xA11CE");
        let bob = Address::new("0xb0b");
        let group = GroupId::parse("0xABC123").unwrap();

        assert_eq!(cache.last_group(&alice).await.unwrap(), None);

        cache.remember_group(&alice, &group).await.unwrap();
        assert_eq!(cache.last_group(&alice).await.unwrap(), Some(group));
        assert_eq!(cache.last_group(&bob).await.unwrap(), None);

        cache.forget_group(&alice).await.unwrap();
        assert_eq!(cache.last_group(&alice).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_echoes_roundtrip_and_clear() {
        let cache = SessionCache::new(MemoryKv::new());
        let group = GroupId::parse("abc123").unwrap();
        let echoes = vec![
            MessageRecord::echo("0xme", 1, MessagePayload::text("one")),
            MessageRecord::echo("0xme", 2, MessagePayload::Proposal { id: 3 }),
        ];

        cache.save_pending_echoes(&group, &echoes).await.unwrap();
        assert_eq!(cache.pending_echoes(&group).await.unwrap(), echoes);

        cache.save_pending_echoes(&group, &[]).await.unwrap();
        assert!(cache.pending_echoes(&group).await.unwrap().is_empty());
        assert!(cache.kv().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let kv = MemoryKv::new();
        kv.set("last-group:0xme", b"\xff\xff not cbor").await.unwrap();
        let cache = SessionCache::new(kv);

        assert_eq!(cache.last_group(&Address::new("0xme")).await.unwrap(), None);
    }
}
