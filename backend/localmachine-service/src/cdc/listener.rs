use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error};

use super::{CdcBatch, CdcRecord};
use crate::error::ServiceResult;

/// Receiver of captured row changes for a fixed set of tables
#[async_trait]
pub trait CdcListener: Send + Sync {
    /// Label used in logs
    fn name(&self) -> &str;

    /// Table names (without schema) this listener wants to see
    fn accepted_tables(&self) -> Vec<String>;

    /// Handle the records of one batch that belong to accepted tables,
    /// commit order preserved
    async fn on(&self, records: Vec<CdcRecord>) -> ServiceResult<()>;
}

/// Routes captured batches to listeners by table name.
///
/// The table → listener map is built once from the listeners handed to
/// [`CdcDispatcher::new`] and never changes afterwards.
pub struct CdcDispatcher {
    listeners: Vec<Arc<dyn CdcListener>>,
    accepted: Vec<HashSet<String>>,
    routes: HashMap<String, Vec<usize>>,
}

impl CdcDispatcher {
    pub fn new(listeners: Vec<Arc<dyn CdcListener>>) -> Self {
        let mut routes: HashMap<String, Vec<usize>> = HashMap::new();
        let mut accepted = Vec::with_capacity(listeners.len());

        for (idx, listener) in listeners.iter().enumerate() {
            let tables: HashSet<String> = listener.accepted_tables().into_iter().collect();
            for table in &tables {
                routes.entry(table.clone()).or_default().push(idx);
            }
            debug!(
                listener = listener.name(),
                tables = ?tables,
                "Registered CDC listener"
            );
            accepted.push(tables);
        }

        Self {
            listeners,
            accepted,
            routes,
        }
    }

    /// Names of listeners registered for `table`
    pub fn listeners_for(&self, table: &str) -> Vec<&str> {
        self.routes
            .get(table)
            .map(|idxs| idxs.iter().map(|i| self.listeners[*i].name()).collect())
            .unwrap_or_default()
    }

    /// Every table some listener accepts
    pub fn watched_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.routes.keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Deliver a batch. Each interested listener gets only the records of
    /// its own tables, in commit order. Every interested listener is invoked
    /// even if an earlier one fails; the first failure is returned.
    ///
    /// Returns the number of listeners invoked.
    pub async fn dispatch(&self, batch: &CdcBatch) -> ServiceResult<usize> {
        let mut interested: Vec<usize> = batch
            .records
            .iter()
            .filter_map(|r| self.routes.get(&r.table.name))
            .flatten()
            .copied()
            .collect();
        interested.sort_unstable();
        interested.dedup();

        let mut first_error = None;
        for idx in &interested {
            let accepted = &self.accepted[*idx];
            let records: Vec<CdcRecord> = batch
                .records
                .iter()
                .filter(|r| accepted.contains(&r.table.name))
                .cloned()
                .collect();

            let listener = &self.listeners[*idx];
            if let Err(e) = listener.on(records).await {
                error!(listener = listener.name(), error = %e, "CDC listener failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(interested.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::TableId;
    use crate::error::ServiceError;
    use tokio::sync::Mutex;

    struct Recording {
        name: String,
        tables: Vec<String>,
        seen: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    impl Recording {
        fn new(name: &str, tables: &[&str], fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                tables: tables.iter().map(|t| t.to_string()).collect(),
                seen: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl CdcListener for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn accepted_tables(&self) -> Vec<String> {
            self.tables.clone()
        }

        async fn on(&self, records: Vec<CdcRecord>) -> ServiceResult<()> {
            self.seen
                .lock()
                .await
                .push(records.iter().map(|r| r.table.name.clone()).collect());
            if self.fail {
                return Err(ServiceError::Internal("listener failure".into()));
            }
            Ok(())
        }
    }

    fn record(table: &str, position: i64) -> CdcRecord {
        CdcRecord {
            table: TableId::public(table),
            columns: vec!["id".into()],
            values: vec![Some(position.to_string())],
            deleted: false,
            position,
        }
    }

    #[tokio::test]
    async fn test_routes_only_accepted_tables() {
        let stock = Recording::new("stock", &["stock_event", "stock_card"], false);
        let heartbeat = Recording::new("heartbeat", &["cdc_heart_beat"], false);
        let dispatcher = CdcDispatcher::new(vec![
            stock.clone() as Arc<dyn CdcListener>,
            heartbeat.clone(),
        ]);

        let batch = CdcBatch::new(vec![
            record("stock_card", 1),
            record("orders", 2),
            record("stock_event", 3),
        ]);
        let invoked = dispatcher.dispatch(&batch).await.unwrap();

        assert_eq!(invoked, 1);
        assert_eq!(
            *stock.seen.lock().await,
            vec![vec!["stock_card".to_string(), "stock_event".to_string()]]
        );
        assert!(heartbeat.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_starve_other_listeners() {
        let failing = Recording::new("failing", &["t"], true);
        let healthy = Recording::new("healthy", &["t"], false);
        let dispatcher = CdcDispatcher::new(vec![failing.clone() as Arc<dyn CdcListener>, healthy.clone()]);

        let result = dispatcher.dispatch(&CdcBatch::new(vec![record("t", 1)])).await;

        assert!(result.is_err());
        assert_eq!(healthy.seen.lock().await.len(), 1);
    }

    #[test]
    fn test_registry_lookup() {
        let a = Recording::new("a", &["x", "y"], false);
        let b = Recording::new("b", &["y"], false);
        let dispatcher = CdcDispatcher::new(vec![a as Arc<dyn CdcListener>, b]);

        assert_eq!(dispatcher.listeners_for("y"), vec!["a", "b"]);
        assert!(dispatcher.listeners_for("z").is_empty());
        assert_eq!(dispatcher.watched_tables(), vec!["x", "y"]);
    }
}
