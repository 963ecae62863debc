//! Day-sharded timeseries storage.
//!
//! Numeric device data lands in per-day tables named `ts_YYYYMMDD`, created
//! lazily on the first write of a day and dropped wholesale when retention
//! expires them. Queries walk the day shards newest-first and page across
//! them as one descending stream.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::db::Database;
use crate::{Result, StorageError};

/// One stored data point.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TsPoint {
    pub device_uuid: String,
    pub data_key: String,
    pub value: f64,
    pub ts: i64,
}

/// A page of timeseries query results, newest first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesPage {
    pub data: Vec<TsPoint>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
}

fn table_for_date(date: NaiveDate) -> String {
    format!("ts_{:04}{:02}{:02}", date.year(), date.month(), date.day())
}

fn date_for_ms(ts_ms: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(ts_ms).map(|dt| dt.date_naive())
}

fn parse_table_date(name: &str) -> Option<NaiveDate> {
    let digits = name.strip_prefix("ts_")?;
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

fn day_bounds_ms(date: NaiveDate) -> (i64, i64) {
    let start = date.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
    let end = start + ChronoDuration::days(1);
    (start.timestamp_millis(), end.timestamp_millis())
}

impl Database {
    async fn ensure_ts_table(&self, table: &str) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 device_uuid TEXT NOT NULL, \
                 data_key TEXT NOT NULL, \
                 value REAL NOT NULL, \
                 ts INTEGER NOT NULL\
             ); \
             CREATE INDEX IF NOT EXISTS idx_{table}_uuid_ts ON {table}(device_uuid, ts);"
        );
        sqlx::raw_sql(&ddl).execute(self.pool()).await?;
        Ok(())
    }

    /// Append one data point, creating the day's table when needed.
    pub async fn insert_timeseries_point(
        &self,
        device_uuid: &str,
        data_key: &str,
        value: f64,
        ts_ms: i64,
    ) -> Result<()> {
        let date = date_for_ms(ts_ms)
            .ok_or_else(|| StorageError::Query(format!("timestamp out of range: {ts_ms}")))?;
        let table = table_for_date(date);
        self.ensure_ts_table(&table).await?;

        let sql =
            format!("INSERT INTO {table} (device_uuid, data_key, value, ts) VALUES (?, ?, ?, ?)");
        sqlx::query(&sql)
            .bind(device_uuid)
            .bind(data_key)
            .bind(value)
            .bind(ts_ms)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Existing day-shard tables, newest first.
    async fn list_ts_tables(&self) -> Result<Vec<(NaiveDate, String)>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'ts[_]%' ESCAPE '['",
        )
        .fetch_all(self.pool())
        .await?;

        let mut tables: Vec<(NaiveDate, String)> = rows
            .into_iter()
            .filter_map(|(name,)| parse_table_date(&name).map(|date| (date, name)))
            .collect();
        tables.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(tables)
    }

    /// Paged, descending-by-timestamp query across the day shards.
    pub async fn query_timeseries(
        &self,
        device_uuid: &str,
        data_key: Option<&str>,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        page: u32,
        page_size: u32,
    ) -> Result<TimeseriesPage> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 1000);

        let mut filter = String::from("WHERE device_uuid = ?");
        if data_key.is_some() {
            filter.push_str(" AND data_key = ?");
        }
        if start_ms.is_some() {
            filter.push_str(" AND ts >= ?");
        }
        if end_ms.is_some() {
            filter.push_str(" AND ts <= ?");
        }

        // Shards that can intersect the requested window, newest first.
        let tables: Vec<(NaiveDate, String)> = self
            .list_ts_tables()
            .await?
            .into_iter()
            .filter(|(date, _)| {
                let (day_start, day_end) = day_bounds_ms(*date);
                start_ms.map_or(true, |s| day_end > s) && end_ms.map_or(true, |e| day_start <= e)
            })
            .collect();

        let mut counts = Vec::with_capacity(tables.len());
        let mut total: i64 = 0;
        for (_, table) in &tables {
            let sql = format!("SELECT COUNT(*) FROM {table} {filter}");
            let mut query = sqlx::query_as::<_, (i64,)>(&sql).bind(device_uuid);
            if let Some(key) = data_key {
                query = query.bind(key);
            }
            if let Some(s) = start_ms {
                query = query.bind(s);
            }
            if let Some(e) = end_ms {
                query = query.bind(e);
            }
            let (count,) = query.fetch_one(self.pool()).await?;
            counts.push(count);
            total += count;
        }

        let mut remaining = page_size as i64;
        let mut skip = (page as i64 - 1) * page_size as i64;
        let mut data = Vec::new();
        for ((_, table), count) in tables.iter().zip(counts) {
            if remaining == 0 {
                break;
            }
            if skip >= count {
                skip -= count;
                continue;
            }
            let sql = format!(
                "SELECT device_uuid, data_key, value, ts FROM {table} {filter} \
                 ORDER BY ts DESC LIMIT ? OFFSET ?"
            );
            let mut query = sqlx::query_as::<_, TsPoint>(&sql).bind(device_uuid);
            if let Some(key) = data_key {
                query = query.bind(key);
            }
            if let Some(s) = start_ms {
                query = query.bind(s);
            }
            if let Some(e) = end_ms {
                query = query.bind(e);
            }
            let rows = query
                .bind(remaining)
                .bind(skip)
                .fetch_all(self.pool())
                .await?;
            skip = 0;
            remaining -= rows.len() as i64;
            data.extend(rows);
        }

        let total_pages = ((total as u64).div_ceil(page_size as u64)) as u32;
        Ok(TimeseriesPage {
            data,
            total,
            page,
            page_size,
            total_pages,
        })
    }

    /// Drop day shards older than the retention window. Returns how many
    /// tables were dropped.
    pub async fn cleanup_timeseries(&self, retention_days: u32) -> Result<u32> {
        let cutoff = Utc::now().date_naive() - ChronoDuration::days(retention_days as i64);
        let mut dropped = 0;
        for (date, table) in self.list_ts_tables().await? {
            if date < cutoff {
                let sql = format!("DROP TABLE IF EXISTS {table}");
                sqlx::raw_sql(&sql).execute(self.pool()).await?;
                info!(table, "dropped expired timeseries shard");
                dropped += 1;
            } else {
                debug!(table, "timeseries shard within retention");
            }
        }
        Ok(dropped)
    }
}
