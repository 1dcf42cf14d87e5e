//! Typed values held under a cache key

use tracing::warn;

use crate::error::Result;
use crate::model::{Collection, Entity, EntityId, HistoryEntry, PointsLedger, Scope};

/// Value of one cache key: an entity list, the ledger, or the history log
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Entities(Vec<Entity>),
    Ledger(PointsLedger),
    History(Vec<HistoryEntry>),
}

impl CacheValue {
    /// The value a collection holds before anything was written to it
    pub fn empty_for(collection: Collection, scope: &Scope) -> Self {
        match collection {
            Collection::Points => CacheValue::Ledger(PointsLedger::empty(scope.clone())),
            Collection::History => CacheValue::History(Vec::new()),
            _ => CacheValue::Entities(Vec::new()),
        }
    }

    pub fn entities(&self) -> Option<&[Entity]> {
        match self {
            CacheValue::Entities(items) => Some(items),
            _ => None,
        }
    }

    pub fn entities_mut(&mut self) -> Option<&mut Vec<Entity>> {
        match self {
            CacheValue::Entities(items) => Some(items),
            _ => None,
        }
    }

    pub fn ledger(&self) -> Option<&PointsLedger> {
        match self {
            CacheValue::Ledger(ledger) => Some(ledger),
            _ => None,
        }
    }

    pub fn history(&self) -> Option<&[HistoryEntry]> {
        match self {
            CacheValue::History(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn find_entity(&self, id: &EntityId) -> Option<&Entity> {
        self.entities()?.iter().find(|e| e.id() == id)
    }

    pub fn len(&self) -> usize {
        match self {
            CacheValue::Entities(items) => items.len(),
            CacheValue::Ledger(_) => 1,
            CacheValue::History(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows as they are persisted: an ordered sequence of plain records.
    /// The ledger is stored as a one-element sequence.
    pub fn to_records(&self) -> Result<Vec<serde_json::Value>> {
        match self {
            CacheValue::Entities(items) => items.iter().map(Entity::to_record).collect(),
            CacheValue::Ledger(ledger) => Ok(vec![serde_json::to_value(ledger)?]),
            CacheValue::History(entries) => entries
                .iter()
                .map(|e| serde_json::to_value(e).map_err(Into::into))
                .collect(),
        }
    }

    /// Decode persisted rows for `collection`.
    ///
    /// Each record is decoded on its own. Records that do not decode are
    /// skipped with a warning so one bad row never hides the rest.
    pub fn from_records(
        collection: Collection,
        scope: &Scope,
        records: Vec<serde_json::Value>,
    ) -> Self {
        match collection {
            Collection::Points => {
                let ledger = records
                    .into_iter()
                    .next()
                    .and_then(|record| match serde_json::from_value::<PointsLedger>(record) {
                        Ok(ledger) => Some(ledger),
                        Err(e) => {
                            warn!(%collection, %scope, error = %e, "Dropping undecodable ledger record");
                            None
                        }
                    })
                    .unwrap_or_else(|| PointsLedger::empty(scope.clone()));
                CacheValue::Ledger(ledger)
            }
            Collection::History => {
                let entries = records
                    .into_iter()
                    .filter_map(|record| match serde_json::from_value::<HistoryEntry>(record) {
                        Ok(entry) if !entry.id.is_empty() => Some(entry),
                        Ok(_) => {
                            warn!(%collection, %scope, "Dropping history record without id");
                            None
                        }
                        Err(e) => {
                            warn!(%collection, %scope, error = %e, "Dropping undecodable history record");
                            None
                        }
                    })
                    .collect();
                CacheValue::History(entries)
            }
            _ => {
                let items = records
                    .into_iter()
                    .filter_map(|record| match Entity::from_record(collection, record) {
                        Ok(entity) => Some(entity),
                        Err(e) => {
                            warn!(%collection, %scope, error = %e, "Dropping undecodable record");
                            None
                        }
                    })
                    .collect();
                CacheValue::Entities(items)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;

    #[test]
    fn test_bad_records_are_skipped() {
        let records = vec![
            serde_json::json!({ "id": "t1", "title": "Ok" }),
            serde_json::json!({ "title": "missing id" }),
            serde_json::json!("not an object"),
            serde_json::json!({ "id": "t2", "points": 5 }),
        ];
        let value = CacheValue::from_records(Collection::Tasks, &"u1".into(), records);
        let ids: Vec<_> = value
            .entities()
            .unwrap()
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[test]
    fn test_missing_ledger_decodes_empty() {
        let value = CacheValue::from_records(Collection::Points, &"u1".into(), vec![]);
        let ledger = value.ledger().unwrap();
        assert_eq!(ledger.points, 0);
        assert_eq!(ledger.owner_scope.as_str(), "u1");
    }

    #[test]
    fn test_records_preserve_order() {
        let value = CacheValue::Entities(vec![
            Entity::Task(Task {
                id: "b".into(),
                ..Default::default()
            }),
            Entity::Task(Task {
                id: "a".into(),
                ..Default::default()
            }),
        ]);
        let records = value.to_records().unwrap();
        let back = CacheValue::from_records(Collection::Tasks, &"u1".into(), records);
        assert_eq!(back, value);
    }
}
