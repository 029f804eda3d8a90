use std::collections::HashMap;
use uuid::Uuid;

use super::{CdcRecord, RowChangeEvent, TableChangeEvent, TableId};
use crate::error::{ServiceError, ServiceResult};
use crate::events::{BackupDatabaseEvent, LocalMovementEvent, MasterDataEvent};

/// Namespace of ids derived from captured transactions
const CAPTURE_NAMESPACE: Uuid = Uuid::from_u128(0x9d3c_41f2_6b0e_4c57_a8e1_5f27_c0d4_b613);

/// Converts raw captured records into table envelopes and typed events
pub struct CdcRecordMapper;

impl CdcRecordMapper {
    /// Stable id for what `listener` emits from one captured transaction of
    /// `facility_id`. The commit position identifies the transaction, so a
    /// batch delivered again maps to the same id.
    pub fn capture_id(facility_id: &str, listener: &str, records: &[CdcRecord]) -> Uuid {
        let position = records.iter().map(|r| r.position).max().unwrap_or_default();
        let name = format!("{}/{}/{}", facility_id, listener, position);
        Uuid::new_v5(&CAPTURE_NAMESPACE, name.as_bytes())
    }

    /// Group records into one envelope per table, in order of first
    /// appearance. Rows keep commit order. A table whose column layout
    /// changes mid-batch gets a new envelope with the next schema version.
    pub fn to_table_change_events(records: &[CdcRecord]) -> ServiceResult<Vec<TableChangeEvent>> {
        let mut envelopes: Vec<TableChangeEvent> = Vec::new();
        let mut open: HashMap<&TableId, usize> = HashMap::new();

        for record in records {
            if record.values.len() != record.columns.len() {
                return Err(ServiceError::MalformedRecord {
                    table: record.table.to_string(),
                    columns: record.columns.len(),
                    values: record.values.len(),
                });
            }

            let row = RowChangeEvent {
                values: record.values.clone(),
                deleted: record.deleted,
            };

            match open.get(&record.table).copied() {
                Some(idx) if envelopes[idx].columns == record.columns => {
                    envelopes[idx].row_changes.push(row);
                }
                current => {
                    let schema_version = current.map_or(1, |idx| envelopes[idx].schema_version + 1);
                    open.insert(&record.table, envelopes.len());
                    envelopes.push(TableChangeEvent {
                        schema_name: record.table.schema.clone(),
                        table_name: record.table.name.clone(),
                        schema_version,
                        columns: record.columns.clone(),
                        row_changes: vec![row],
                    });
                }
            }
        }

        Ok(envelopes)
    }

    pub fn to_local_movement_event(
        facility_id: &str,
        batch_id: Uuid,
        records: &[CdcRecord],
    ) -> ServiceResult<LocalMovementEvent> {
        Ok(LocalMovementEvent {
            batch_id,
            facility_id: facility_id.to_string(),
            table_changes: Self::to_table_change_events(records)?,
        })
    }

    pub fn to_backup_database_event(
        facility_id: &str,
        batch_id: Uuid,
        records: &[CdcRecord],
    ) -> ServiceResult<BackupDatabaseEvent> {
        Ok(BackupDatabaseEvent {
            batch_id,
            facility_id: facility_id.to_string(),
            table_changes: Self::to_table_change_events(records)?,
        })
    }

    pub fn to_master_data_event(
        facility_id: &str,
        batch_id: Uuid,
        records: &[CdcRecord],
        snapshot: bool,
    ) -> ServiceResult<MasterDataEvent> {
        Ok(MasterDataEvent {
            batch_id,
            facility_id: facility_id.to_string(),
            snapshot,
            table_changes: Self::to_table_change_events(records)?,
        })
    }
}
