//! [`Store`] over SQLite through sqlx.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use srm_common::ServiceState;
use srm_types::{ActiveDeltas, Delta, DeltaState, HostState, TimedState};
use std::fmt::Display;
use std::str::FromStr;

use crate::error::{DbError, DbResult};
use crate::pool::{bootstrap_schema, create_memory_pool, create_pool};
use crate::records::{
    ActiveDeltasRecord, DeltaConnection, DeltaTimeState, DeltaUpdate, HostRecord,
    HostStateRecord, InstanceStartEnd, ModelRecord, RefreshTokenRecord, ServiceAction,
    ServiceRecord, ServiceStateRecord, StateRecord, SwitchRecord, UserRecord,
};
use crate::store::Store;

const ACTIVE_DELTAS_ROW: i64 = 1;

pub type DeltaRowTuple = (
    String,
    i64,
    i64,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
);

pub type HostStateRowTuple = (String, String, String, i64, i64);

pub type ServiceStateRowTuple = (String, String, String, String, i64, Option<String>, i64, i64);

pub type TimeStateRowTuple = (i64, i64, String, String, String, String, String);

pub type RefreshTokenRowTuple = (String, String, String, String, i64, i64, i64);

fn parse_column<T>(value: &str, column: &str) -> DbResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| DbError::Internal(format!("bad {} value '{}': {}", column, value, e)))
}

fn delta_from_row(row: DeltaRowTuple) -> DbResult<Delta> {
    let (uid, insertdate, updatedate, state, deltat, content, modelid, modadd, error) = row;
    Ok(Delta {
        uid,
        insertdate,
        updatedate,
        state: parse_column(&state, "deltas.state")?,
        deltat: parse_column(&deltat, "deltas.deltat")?,
        content,
        modelid,
        modadd: parse_column(&modadd, "deltas.modadd")?,
        error,
    })
}

fn host_state_from_row(row: HostStateRowTuple) -> DbResult<HostStateRecord> {
    let (deltaid, hostname, state, insertdate, updatedate) = row;
    Ok(HostStateRecord {
        deltaid,
        hostname,
        state: parse_column::<HostState>(&state, "hoststates.state")?,
        insertdate,
        updatedate,
    })
}

fn time_state_from_row(row: TimeStateRowTuple) -> DbResult<DeltaTimeState> {
    let (id, insertdate, uuid, uuidtype, hostname, hostport, uuidstate) = row;
    Ok(DeltaTimeState {
        id,
        insertdate,
        uuid,
        uuidtype,
        hostname,
        hostport,
        uuidstate: parse_column::<TimedState>(&uuidstate, "deltatimestates.uuidstate")?,
    })
}

fn refresh_token_from_row(row: RefreshTokenRowTuple) -> DbResult<RefreshTokenRecord> {
    let (token_hash, session_id, subject, permissions, expires_at, revoked, insertdate) = row;
    Ok(RefreshTokenRecord {
        token_hash,
        session_id,
        subject,
        permissions: serde_json::from_str(&permissions)?,
        expires_at,
        revoked: revoked != 0,
        insertdate,
    })
}

const DELTA_COLUMNS: &str =
    "uid, insertdate, updatedate, state, deltat, content, modelid, modadd, error";

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens the database at `database_url` and creates missing tables.
    #[tracing::instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> DbResult<Self> {
        let pool = create_pool(database_url).await?;
        bootstrap_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Private in-memory database with the full schema.
    pub async fn in_memory() -> DbResult<Self> {
        let pool = create_memory_pool().await?;
        bootstrap_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    #[tracing::instrument(skip(self, model), fields(uid = %model.uid))]
    async fn insert_model(&self, model: &ModelRecord) -> DbResult<()> {
        sqlx::query("INSERT INTO models (uid, insertdate, fileloc) VALUES (?, ?, ?)")
            .bind(&model.uid)
            .bind(model.insertdate)
            .bind(&model.fileloc)
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::from_insert(e, &format!("model {}", model.uid)))?;
        Ok(())
    }

    async fn latest_model(&self) -> DbResult<Option<ModelRecord>> {
        let row: Option<(String, i64, String)> = sqlx::query_as(
            "SELECT uid, insertdate, fileloc FROM models ORDER BY insertdate DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(uid, insertdate, fileloc)| ModelRecord {
            uid,
            insertdate,
            fileloc,
        }))
    }

    async fn get_model(&self, uid: &str) -> DbResult<Option<ModelRecord>> {
        let row: Option<(String, i64, String)> =
            sqlx::query_as("SELECT uid, insertdate, fileloc FROM models WHERE uid = ?")
                .bind(uid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(uid, insertdate, fileloc)| ModelRecord {
            uid,
            insertdate,
            fileloc,
        }))
    }

    async fn list_models(&self) -> DbResult<Vec<ModelRecord>> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT uid, insertdate, fileloc FROM models ORDER BY insertdate DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(uid, insertdate, fileloc)| ModelRecord {
                uid,
                insertdate,
                fileloc,
            })
            .collect())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_models_before(&self, cutoff: i64) -> DbResult<Vec<ModelRecord>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(String, i64, String)> =
            sqlx::query_as("SELECT uid, insertdate, fileloc FROM models WHERE insertdate < ?")
                .bind(cutoff)
                .fetch_all(&mut *tx)
                .await?;
        sqlx::query("DELETE FROM models WHERE insertdate < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(rows
            .into_iter()
            .map(|(uid, insertdate, fileloc)| ModelRecord {
                uid,
                insertdate,
                fileloc,
            })
            .collect())
    }

    #[tracing::instrument(skip(self, delta), fields(uid = %delta.uid))]
    async fn insert_delta(&self, delta: &Delta) -> DbResult<()> {
        sqlx::query(&format!(
            "INSERT INTO deltas ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            DELTA_COLUMNS
        ))
        .bind(&delta.uid)
        .bind(delta.insertdate)
        .bind(delta.updatedate)
        .bind(delta.state.as_str())
        .bind(delta.deltat.as_str())
        .bind(&delta.content)
        .bind(&delta.modelid)
        .bind(delta.modadd.as_str())
        .bind(&delta.error)
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::from_insert(e, &format!("delta {}", delta.uid)))?;
        Ok(())
    }

    async fn get_delta(&self, uid: &str) -> DbResult<Option<Delta>> {
        let row: Option<DeltaRowTuple> = sqlx::query_as(&format!(
            "SELECT {} FROM deltas WHERE uid = ?",
            DELTA_COLUMNS
        ))
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        row.map(delta_from_row).transpose()
    }

    async fn list_deltas(&self) -> DbResult<Vec<Delta>> {
        let rows: Vec<DeltaRowTuple> = sqlx::query_as(&format!(
            "SELECT {} FROM deltas ORDER BY insertdate, id",
            DELTA_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(delta_from_row).collect()
    }

    async fn deltas_in_state(&self, state: DeltaState) -> DbResult<Vec<Delta>> {
        let rows: Vec<DeltaRowTuple> = sqlx::query_as(&format!(
            "SELECT {} FROM deltas WHERE state = ? ORDER BY insertdate, id",
            DELTA_COLUMNS
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(delta_from_row).collect()
    }

    #[tracing::instrument(skip(self, update))]
    async fn update_delta(&self, uid: &str, update: &DeltaUpdate) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE deltas SET
                state = COALESCE(?, state),
                modadd = COALESCE(?, modadd),
                error = COALESCE(?, error),
                updatedate = ?
             WHERE uid = ?",
        )
        .bind(update.state.map(|s| s.as_str()))
        .bind(update.modadd.map(|m| m.as_str()))
        .bind(&update.error)
        .bind(update.updatedate)
        .bind(uid)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(uid.to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_delta(&self, uid: &str) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        for table in ["delta_connections", "states", "hoststates", "hoststateshistory"] {
            sqlx::query(&format!("DELETE FROM {} WHERE deltaid = ?", table))
                .bind(uid)
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query("DELETE FROM deltas WHERE uid = ?")
            .bind(uid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn insert_delta_connection(&self, connection: &DeltaConnection) -> DbResult<()> {
        sqlx::query("INSERT INTO delta_connections (deltaid, connectionid, state) VALUES (?, ?, ?)")
            .bind(&connection.deltaid)
            .bind(&connection.connectionid)
            .bind(&connection.state)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                DbError::from_insert(
                    e,
                    &format!(
                        "connection {} of delta {}",
                        connection.connectionid, connection.deltaid
                    ),
                )
            })?;
        Ok(())
    }

    async fn delta_connections(&self, deltaid: &str) -> DbResult<Vec<DeltaConnection>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT deltaid, connectionid, state FROM delta_connections WHERE deltaid = ? ORDER BY id",
        )
        .bind(deltaid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(deltaid, connectionid, state)| DeltaConnection {
                deltaid,
                connectionid,
                state,
            })
            .collect())
    }

    async fn connections_for(&self, connectionid: &str) -> DbResult<Vec<DeltaConnection>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT deltaid, connectionid, state FROM delta_connections WHERE connectionid = ? ORDER BY id",
        )
        .bind(connectionid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(deltaid, connectionid, state)| DeltaConnection {
                deltaid,
                connectionid,
                state,
            })
            .collect())
    }

    async fn update_connection_state(
        &self,
        deltaid: &str,
        connectionid: &str,
        state: &str,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE delta_connections SET state = ? WHERE deltaid = ? AND connectionid = ?",
        )
        .bind(state)
        .bind(deltaid)
        .bind(connectionid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_state(&self, state: &StateRecord) -> DbResult<()> {
        sqlx::query("INSERT INTO states (deltaid, state, insertdate) VALUES (?, ?, ?)")
            .bind(&state.deltaid)
            .bind(state.state.as_str())
            .bind(state.insertdate)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delta_states(&self, deltaid: &str) -> DbResult<Vec<StateRecord>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT deltaid, state, insertdate FROM states WHERE deltaid = ? ORDER BY insertdate, id",
        )
        .bind(deltaid)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(deltaid, state, insertdate)| {
                Ok(StateRecord {
                    deltaid,
                    state: parse_column(&state, "states.state")?,
                    insertdate,
                })
            })
            .collect()
    }

    async fn upsert_host_state(&self, state: &HostStateRecord) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO hoststates (deltaid, state, insertdate, updatedate, hostname)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (deltaid, hostname) DO UPDATE SET
                state = excluded.state,
                updatedate = excluded.updatedate",
        )
        .bind(&state.deltaid)
        .bind(state.state.as_str())
        .bind(state.insertdate)
        .bind(state.updatedate)
        .bind(&state.hostname)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO hoststateshistory (deltaid, state, insertdate, hostname) VALUES (?, ?, ?, ?)",
        )
        .bind(&state.deltaid)
        .bind(state.state.as_str())
        .bind(state.updatedate)
        .bind(&state.hostname)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn host_states(&self, deltaid: &str) -> DbResult<Vec<HostStateRecord>> {
        let rows: Vec<HostStateRowTuple> = sqlx::query_as(
            "SELECT deltaid, hostname, state, insertdate, updatedate FROM hoststates
             WHERE deltaid = ? ORDER BY hostname",
        )
        .bind(deltaid)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(host_state_from_row).collect()
    }

    async fn host_state_history(&self, deltaid: &str) -> DbResult<Vec<HostStateRecord>> {
        let rows: Vec<HostStateRowTuple> = sqlx::query_as(
            "SELECT deltaid, hostname, state, insertdate, insertdate FROM hoststateshistory
             WHERE deltaid = ? ORDER BY insertdate, id",
        )
        .bind(deltaid)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(host_state_from_row).collect()
    }

    #[tracing::instrument(skip(self, host), fields(hostname = %host.hostname))]
    async fn upsert_host(&self, host: &HostRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO hosts (ip, hostname, insertdate, updatedate, hostinfo)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (hostname) DO UPDATE SET
                ip = excluded.ip,
                updatedate = excluded.updatedate,
                hostinfo = excluded.hostinfo",
        )
        .bind(&host.ip)
        .bind(&host.hostname)
        .bind(host.insertdate)
        .bind(host.updatedate)
        .bind(serde_json::to_string(&host.hostinfo)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_host(&self, hostname: &str) -> DbResult<Option<HostRecord>> {
        let row: Option<(String, String, i64, i64, String)> = sqlx::query_as(
            "SELECT ip, hostname, insertdate, updatedate, hostinfo FROM hosts WHERE hostname = ?",
        )
        .bind(hostname)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(ip, hostname, insertdate, updatedate, hostinfo)| {
            Ok(HostRecord {
                ip,
                hostname,
                insertdate,
                updatedate,
                hostinfo: serde_json::from_str(&hostinfo)?,
            })
        })
        .transpose()
    }

    async fn list_hosts(&self) -> DbResult<Vec<HostRecord>> {
        let rows: Vec<(String, String, i64, i64, String)> = sqlx::query_as(
            "SELECT ip, hostname, insertdate, updatedate, hostinfo FROM hosts ORDER BY hostname",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(ip, hostname, insertdate, updatedate, hostinfo)| {
                Ok(HostRecord {
                    ip,
                    hostname,
                    insertdate,
                    updatedate,
                    hostinfo: serde_json::from_str(&hostinfo)?,
                })
            })
            .collect()
    }

    #[tracing::instrument(skip(self, switch), fields(device = %switch.device))]
    async fn upsert_switch(&self, switch: &SwitchRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO switch (sitename, device, insertdate, updatedate, output, error)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (sitename, device) DO UPDATE SET
                updatedate = excluded.updatedate,
                output = excluded.output,
                error = excluded.error",
        )
        .bind(&switch.sitename)
        .bind(&switch.device)
        .bind(switch.insertdate)
        .bind(switch.updatedate)
        .bind(serde_json::to_string(&switch.output)?)
        .bind(&switch.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_switches(&self, sitename: &str) -> DbResult<Vec<SwitchRecord>> {
        let rows: Vec<(String, String, i64, i64, String, Option<String>)> = sqlx::query_as(
            "SELECT sitename, device, insertdate, updatedate, output, error FROM switch
             WHERE sitename = ? ORDER BY device",
        )
        .bind(sitename)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(sitename, device, insertdate, updatedate, output, error)| {
                Ok(SwitchRecord {
                    sitename,
                    device,
                    insertdate,
                    updatedate,
                    output: serde_json::from_str(&output)?,
                    error,
                })
            })
            .collect()
    }

    async fn upsert_service(&self, service: &ServiceRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO services (hostname, servicename, insertdate, updatedate, serviceinfo)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (hostname, servicename) DO UPDATE SET
                updatedate = excluded.updatedate,
                serviceinfo = excluded.serviceinfo",
        )
        .bind(&service.hostname)
        .bind(&service.servicename)
        .bind(service.insertdate)
        .bind(service.updatedate)
        .bind(serde_json::to_string(&service.serviceinfo)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_services(&self, hostname: Option<&str>) -> DbResult<Vec<ServiceRecord>> {
        let rows: Vec<(String, String, i64, i64, String)> = sqlx::query_as(
            "SELECT hostname, servicename, insertdate, updatedate, serviceinfo FROM services
             WHERE (? IS NULL OR hostname = ?) ORDER BY hostname, servicename",
        )
        .bind(hostname)
        .bind(hostname)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(hostname, servicename, insertdate, updatedate, serviceinfo)| {
                Ok(ServiceRecord {
                    hostname,
                    servicename,
                    insertdate,
                    updatedate,
                    serviceinfo: serde_json::from_str(&serviceinfo)?,
                })
            })
            .collect()
    }

    async fn upsert_service_state(&self, state: &ServiceStateRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO servicestates
                (hostname, servicename, servicestate, version, runtime, exc, insertdate, updatedate)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (hostname, servicename) DO UPDATE SET
                servicestate = excluded.servicestate,
                version = excluded.version,
                runtime = excluded.runtime,
                exc = excluded.exc,
                updatedate = excluded.updatedate",
        )
        .bind(&state.hostname)
        .bind(&state.servicename)
        .bind(state.servicestate.as_str())
        .bind(&state.version)
        .bind(state.runtime)
        .bind(&state.exc)
        .bind(state.insertdate)
        .bind(state.updatedate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_service_states(&self) -> DbResult<Vec<ServiceStateRecord>> {
        let rows: Vec<ServiceStateRowTuple> = sqlx::query_as(
            "SELECT hostname, servicename, servicestate, version, runtime, exc, insertdate, updatedate
             FROM servicestates ORDER BY hostname, servicename",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(
                |(hostname, servicename, servicestate, version, runtime, exc, insertdate, updatedate)| {
                    Ok(ServiceStateRecord {
                        hostname,
                        servicename,
                        servicestate: parse_column::<ServiceState>(
                            &servicestate,
                            "servicestates.servicestate",
                        )?,
                        version,
                        runtime,
                        exc,
                        insertdate,
                        updatedate,
                    })
                },
            )
            .collect()
    }

    async fn insert_service_action(&self, action: &ServiceAction) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO serviceaction (hostname, servicename, serviceaction, insertdate)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&action.hostname)
        .bind(&action.servicename)
        .bind(&action.serviceaction)
        .bind(action.insertdate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn service_actions(
        &self,
        hostname: Option<&str>,
        servicename: Option<&str>,
    ) -> DbResult<Vec<ServiceAction>> {
        let rows: Vec<(i64, String, String, String, i64)> = sqlx::query_as(
            "SELECT id, hostname, servicename, serviceaction, insertdate FROM serviceaction
             WHERE (? IS NULL OR hostname = ?) AND (? IS NULL OR servicename = ?)
             ORDER BY id",
        )
        .bind(hostname)
        .bind(hostname)
        .bind(servicename)
        .bind(servicename)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, hostname, servicename, serviceaction, insertdate)| ServiceAction {
                    id,
                    hostname,
                    servicename,
                    serviceaction,
                    insertdate,
                },
            )
            .collect())
    }

    async fn delete_service_actions(
        &self,
        hostname: &str,
        servicename: Option<&str>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM serviceaction WHERE hostname = ? AND (? IS NULL OR servicename = ?)",
        )
        .bind(hostname)
        .bind(servicename)
        .bind(servicename)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_active_deltas(&self) -> DbResult<ActiveDeltasRecord> {
        let row: Option<(i64, i64, String, i64)> = sqlx::query_as(
            "SELECT insertdate, updatedate, output, version FROM activeDeltas WHERE id = ?",
        )
        .bind(ACTIVE_DELTAS_ROW)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((insertdate, updatedate, output, version)) => Ok(ActiveDeltasRecord {
                insertdate,
                updatedate,
                version,
                output: serde_json::from_str(&output)?,
            }),
            None => Ok(ActiveDeltasRecord::default()),
        }
    }

    #[tracing::instrument(skip(self, doc))]
    async fn compare_and_set_active_deltas(
        &self,
        expected_version: i64,
        doc: &ActiveDeltas,
        now: i64,
    ) -> DbResult<i64> {
        let output = serde_json::to_string(doc)?;
        let result = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO activeDeltas (id, insertdate, updatedate, output, version)
                 VALUES (?, ?, ?, ?, 1)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(ACTIVE_DELTAS_ROW)
            .bind(now)
            .bind(now)
            .bind(&output)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE activeDeltas SET output = ?, updatedate = ?, version = version + 1
                 WHERE id = ? AND version = ?",
            )
            .bind(&output)
            .bind(now)
            .bind(ACTIVE_DELTAS_ROW)
            .bind(expected_version)
            .execute(&self.pool)
            .await?
        };
        if result.rows_affected() == 0 {
            return Err(DbError::Conflict(format!(
                "active deltas changed since version {}",
                expected_version
            )));
        }
        Ok(expected_version + 1)
    }

    async fn insert_delta_time_state(&self, state: &DeltaTimeState) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO deltatimestates (insertdate, uuid, uuidtype, hostname, hostport, uuidstate)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(state.insertdate)
        .bind(&state.uuid)
        .bind(&state.uuidtype)
        .bind(&state.hostname)
        .bind(&state.hostport)
        .bind(state.uuidstate.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_delta_time_states(&self) -> DbResult<Vec<DeltaTimeState>> {
        let rows: Vec<TimeStateRowTuple> = sqlx::query_as(
            "SELECT id, insertdate, uuid, uuidtype, hostname, hostport, uuidstate
             FROM deltatimestates ORDER BY insertdate, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(time_state_from_row).collect()
    }

    async fn delta_time_states(&self, uuid: &str) -> DbResult<Vec<DeltaTimeState>> {
        let rows: Vec<TimeStateRowTuple> = sqlx::query_as(
            "SELECT id, insertdate, uuid, uuidtype, hostname, hostport, uuidstate
             FROM deltatimestates WHERE uuid = ? ORDER BY insertdate, id",
        )
        .bind(uuid)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(time_state_from_row).collect()
    }

    async fn delete_delta_time_states(&self, uuid: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM deltatimestates WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_force_apply(&self, uuid: &str) -> DbResult<()> {
        sqlx::query("INSERT INTO forceapplyuuid (uuid) VALUES (?)")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn take_force_apply(&self) -> DbResult<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, uuid FROM forceapplyuuid ORDER BY id")
                .fetch_all(&mut *tx)
                .await?;
        if let Some((last, _)) = rows.last() {
            sqlx::query("DELETE FROM forceapplyuuid WHERE id <= ?")
                .bind(*last)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(rows.into_iter().map(|(_, uuid)| uuid).collect())
    }

    async fn insert_instance_override(&self, entry: &InstanceStartEnd) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO instancestartend (instanceid, insertdate, starttimestamp, endtimestamp)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.instanceid)
        .bind(entry.insertdate)
        .bind(entry.starttimestamp)
        .bind(entry.endtimestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn take_instance_overrides(&self) -> DbResult<Vec<InstanceStartEnd>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(i64, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT id, instanceid, insertdate, starttimestamp, endtimestamp
             FROM instancestartend ORDER BY insertdate, id",
        )
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM instancestartend")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, instanceid, insertdate, starttimestamp, endtimestamp)| InstanceStartEnd {
                    id,
                    instanceid,
                    insertdate,
                    starttimestamp,
                    endtimestamp,
                },
            )
            .collect())
    }

    async fn upsert_user(&self, user: &UserRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO users (username, permissions, disabled, insertdate) VALUES (?, ?, ?, ?)
             ON CONFLICT (username) DO UPDATE SET
                permissions = excluded.permissions,
                disabled = excluded.disabled",
        )
        .bind(&user.username)
        .bind(serde_json::to_string(&user.permissions)?)
        .bind(i64::from(user.disabled))
        .bind(user.insertdate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, username: &str) -> DbResult<Option<UserRecord>> {
        let row: Option<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT username, permissions, disabled, insertdate FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(username, permissions, disabled, insertdate)| {
            Ok(UserRecord {
                username,
                permissions: serde_json::from_str(&permissions)?,
                disabled: disabled != 0,
                insertdate,
            })
        })
        .transpose()
    }

    async fn insert_refresh_token(&self, token: &RefreshTokenRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO refresh_tokens
                (token_hash, session_id, subject, permissions, expires_at, revoked, insertdate)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&token.token_hash)
        .bind(&token.session_id)
        .bind(&token.subject)
        .bind(serde_json::to_string(&token.permissions)?)
        .bind(token.expires_at)
        .bind(i64::from(token.revoked))
        .bind(token.insertdate)
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::from_insert(e, "refresh token"))?;
        Ok(())
    }

    async fn get_refresh_token(&self, token_hash: &str) -> DbResult<Option<RefreshTokenRecord>> {
        let row: Option<RefreshTokenRowTuple> = sqlx::query_as(
            "SELECT token_hash, session_id, subject, permissions, expires_at, revoked, insertdate
             FROM refresh_tokens WHERE token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(refresh_token_from_row).transpose()
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = 1 WHERE token_hash = ? AND revoked = 0",
        )
        .bind(token_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired_refresh_tokens(&self, now: i64) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
