//! Group budget ledger. All mutations on a group are linearized behind a
//! per-group async mutex; reservations hold budget for the duration of one
//! request and are swept if orphaned.

use conduit_core::store::GatewayStore;
use conduit_core::{GatewayError, GroupId, Result, VirtualKeyGroup};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Orphaned reservations are released after this long.
pub const STALE_RESERVATION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct Reservation {
    amount: Decimal,
    created: Instant,
}

#[derive(Default)]
struct GroupRuntime {
    reservations: HashMap<Uuid, Reservation>,
}

impl GroupRuntime {
    fn outstanding(&self) -> Decimal {
        self.reservations.values().map(|r| r.amount).sum()
    }
}

/// Pre-debit hold on a group's balance. Must be committed or released;
/// the sweeper reclaims anything left behind.
#[derive(Debug, Clone)]
pub struct ReservationHandle {
    pub id: Uuid,
    pub group_id: GroupId,
    pub amount: Decimal,
}

pub struct GroupLedger {
    store: Arc<dyn GatewayStore>,
    groups: DashMap<GroupId, Arc<Mutex<GroupRuntime>>>,
    stale_ttl: Duration,
}

impl GroupLedger {
    pub fn new(store: Arc<dyn GatewayStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            groups: DashMap::new(),
            stale_ttl: STALE_RESERVATION_TTL,
        })
    }

    fn runtime(&self, group_id: &GroupId) -> Arc<Mutex<GroupRuntime>> {
        self.groups
            .entry(group_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(GroupRuntime::default())))
            .clone()
    }

    async fn load_group(&self, group_id: &GroupId) -> Result<VirtualKeyGroup> {
        self.store
            .get_group(group_id)
            .await?
            .ok_or_else(|| GatewayError::Internal(format!("unknown group {group_id}")))
    }

    /// Atomically check `balance - outstanding >= estimate` and hold the
    /// estimate. Serialized per group: two concurrent reservations cannot
    /// both pass unless both fit.
    pub async fn reserve(
        &self,
        group_id: &GroupId,
        max_cost_estimate: Decimal,
    ) -> Result<ReservationHandle> {
        let runtime = self.runtime(group_id);
        let mut runtime = runtime.lock().await;

        let group = self.load_group(group_id).await?;
        let available = group.balance - runtime.outstanding();
        if available < max_cost_estimate {
            return Err(GatewayError::InsufficientBalance {
                group: group_id.to_string(),
            });
        }

        let id = Uuid::new_v4();
        runtime.reservations.insert(
            id,
            Reservation {
                amount: max_cost_estimate,
                created: Instant::now(),
            },
        );
        Ok(ReservationHandle {
            id,
            group_id: group_id.clone(),
            amount: max_cost_estimate,
        })
    }

    /// Commit a reservation: in one serialized transaction, drop the hold,
    /// subtract the actual cost from the balance, and add it to lifetime
    /// spend. Precision is preserved; nothing is rounded here.
    ///
    /// A provider can report more usage than estimated; the balance then
    /// goes negative and only the *next* reservation fails.
    pub async fn commit(&self, handle: ReservationHandle, actual_cost: Decimal) -> Result<()> {
        let runtime = self.runtime(&handle.group_id);
        let mut runtime = runtime.lock().await;
        runtime.reservations.remove(&handle.id);

        let mut group = self.load_group(&handle.group_id).await?;
        group.balance -= actual_cost;
        group.lifetime_spent += actual_cost;
        let balance = group.balance;
        self.store.put_group(group).await?;

        if balance < Decimal::ZERO {
            tracing::warn!(
                group = %handle.group_id,
                %balance,
                "group overspent its balance"
            );
        }
        Ok(())
    }

    /// Drop the hold without debiting.
    pub async fn release(&self, handle: ReservationHandle) -> Result<()> {
        let runtime = self.runtime(&handle.group_id);
        let mut runtime = runtime.lock().await;
        runtime.reservations.remove(&handle.id);
        Ok(())
    }

    /// Balance net of outstanding reservations, from a consistent snapshot.
    pub async fn available_balance(&self, group_id: &GroupId) -> Result<Decimal> {
        let runtime = self.runtime(group_id);
        let runtime = runtime.lock().await;
        let group = self.load_group(group_id).await?;
        Ok(group.balance - runtime.outstanding())
    }

    pub async fn outstanding(&self, group_id: &GroupId) -> Decimal {
        let runtime = self.runtime(group_id);
        let runtime = runtime.lock().await;
        runtime.outstanding()
    }

    /// Release reservations older than the stale TTL.
    pub async fn sweep_stale(&self) -> usize {
        let mut swept = 0;
        for entry in self.groups.iter() {
            let mut runtime = entry.value().lock().await;
            let before = runtime.reservations.len();
            runtime
                .reservations
                .retain(|_, r| r.created.elapsed() < self.stale_ttl);
            swept += before - runtime.reservations.len();
        }
        if swept > 0 {
            tracing::info!(count = swept, "released stale reservations");
        }
        swept
    }

    /// Background sweeper with a shared shutdown signal.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        ledger.sweep_stale().await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::MemoryStore;
    use rust_decimal_macros::dec;

    fn group(balance: Decimal) -> VirtualKeyGroup {
        VirtualKeyGroup {
            id: GroupId::from("g1".to_string()),
            name: "test".to_string(),
            balance,
            lifetime_credits_added: balance,
            lifetime_spent: Decimal::ZERO,
            external_group_id: None,
        }
    }

    fn gid() -> GroupId {
        GroupId::from("g1".to_string())
    }

    #[tokio::test]
    async fn reserve_commit_debits_exactly() {
        let store = MemoryStore::new();
        store.add_group(group(dec!(100.00)));
        let ledger = GroupLedger::new(Arc::clone(&store) as Arc<dyn GatewayStore>);

        let handle = ledger.reserve(&gid(), dec!(0.01)).await.unwrap();
        ledger.commit(handle, dec!(0.000004)).await.unwrap();

        let group = store.get_group(&gid()).await.unwrap().unwrap();
        assert_eq!(group.balance, dec!(99.999996));
        assert_eq!(group.lifetime_spent, dec!(0.000004));
        assert_eq!(
            group.balance,
            group.lifetime_credits_added - group.lifetime_spent
        );
    }

    #[tokio::test]
    async fn release_leaves_balance_untouched() {
        let store = MemoryStore::new();
        store.add_group(group(dec!(10)));
        let ledger = GroupLedger::new(Arc::clone(&store) as Arc<dyn GatewayStore>);

        let handle = ledger.reserve(&gid(), dec!(5)).await.unwrap();
        ledger.release(handle).await.unwrap();

        assert_eq!(ledger.outstanding(&gid()).await, Decimal::ZERO);
        let group = store.get_group(&gid()).await.unwrap().unwrap();
        assert_eq!(group.balance, dec!(10));
    }

    #[tokio::test]
    async fn reservation_blocks_concurrent_overdraw() {
        let store = MemoryStore::new();
        store.add_group(group(dec!(10)));
        let ledger = GroupLedger::new(Arc::clone(&store) as Arc<dyn GatewayStore>);

        let first = ledger.reserve(&gid(), dec!(8)).await.unwrap();
        let second = ledger.reserve(&gid(), dec!(8)).await;
        assert!(matches!(
            second.unwrap_err(),
            GatewayError::InsufficientBalance { .. }
        ));

        ledger.release(first).await.unwrap();
        assert!(ledger.reserve(&gid(), dec!(8)).await.is_ok());
    }

    #[tokio::test]
    async fn overspend_goes_negative_and_blocks_next() {
        let store = MemoryStore::new();
        store.add_group(group(dec!(0.01)));
        let ledger = GroupLedger::new(Arc::clone(&store) as Arc<dyn GatewayStore>);

        let handle = ledger.reserve(&gid(), dec!(0.005)).await.unwrap();
        // Provider reported more output than estimated.
        ledger.commit(handle, dec!(0.02)).await.unwrap();

        let group = store.get_group(&gid()).await.unwrap().unwrap();
        assert_eq!(group.balance, dec!(-0.01));

        assert!(matches!(
            ledger.reserve(&gid(), dec!(0.001)).await.unwrap_err(),
            GatewayError::InsufficientBalance { .. }
        ));
    }

    #[tokio::test]
    async fn available_balance_invariant() {
        let store = MemoryStore::new();
        store.add_group(group(dec!(100)));
        let ledger = GroupLedger::new(Arc::clone(&store) as Arc<dyn GatewayStore>);

        let _held = ledger.reserve(&gid(), dec!(30)).await.unwrap();
        let group = store.get_group(&gid()).await.unwrap().unwrap();
        let available = ledger.available_balance(&gid()).await.unwrap();
        assert_eq!(
            available,
            group.lifetime_credits_added - group.lifetime_spent - ledger.outstanding(&gid()).await
        );
        assert_eq!(available, dec!(70));
    }

    #[tokio::test]
    async fn sweeper_releases_stale_reservations() {
        let store = MemoryStore::new();
        store.add_group(group(dec!(10)));
        let ledger = Arc::new(GroupLedger {
            store: Arc::clone(&store) as Arc<dyn GatewayStore>,
            groups: DashMap::new(),
            stale_ttl: Duration::ZERO,
        });

        let _orphan = ledger.reserve(&gid(), dec!(5)).await.unwrap();
        assert_eq!(ledger.sweep_stale().await, 1);
        assert_eq!(ledger.outstanding(&gid()).await, Decimal::ZERO);
    }
}
