use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::error::StoreError;
use crate::transform::{BoroughRow, CuisineRow, FactRow};

/// The relational store: two dimension tables and one fact table in a
/// single SQLite file. Clones share the underlying pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn query_error(command: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |error| StoreError::Query {
        command: command.to_owned(),
        error,
    }
}

impl Store {
    /// Open the storage file, creating it if missing. Foreign keys are
    /// enabled explicitly: SQLite leaves them off by default, and the
    /// restaurants table's referential integrity depends on them.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|error| StoreError::Connection {
                path: path.display().to_string(),
                error,
            })?;

        Ok(Self { pool })
    }

    /// An in-memory store with the same pragmas, for tests and ephemeral
    /// runs. Capped to one connection so every caller sees one database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|error| StoreError::Connection {
                path: ":memory:".to_owned(),
                error,
            })?;

        Ok(Self { pool })
    }

    /// Create the three tables if absent, in dependency order.
    pub async fn create_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_error("BEGIN"))?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS boroughs (
    borough_id TEXT PRIMARY KEY,
    borough TEXT NOT NULL,
    population INTEGER
)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(query_error("CREATE TABLE"))?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS cuisines (
    cuisine_id TEXT PRIMARY KEY,
    cuisine TEXT NOT NULL
)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(query_error("CREATE TABLE"))?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS restaurants (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    borough_id TEXT NOT NULL REFERENCES boroughs (borough_id),
    cuisine_id TEXT NOT NULL REFERENCES cuisines (cuisine_id),
    inspection_date DATE NOT NULL,
    lat REAL NOT NULL,
    lng REAL NOT NULL
)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(query_error("CREATE TABLE"))?;

        tx.commit().await.map_err(query_error("COMMIT"))
    }

    /// Replace the boroughs table wholesale. Delete-then-insert runs in
    /// one transaction, so a failure leaves the previous rows intact.
    pub async fn fresh_boroughs(&self, rows: &[BoroughRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_error("BEGIN"))?;

        sqlx::query("DELETE FROM boroughs")
            .execute(&mut *tx)
            .await
            .map_err(query_error("DELETE"))?;

        for row in rows {
            sqlx::query("INSERT INTO boroughs (borough_id, borough, population) VALUES ($1, $2, $3)")
                .bind(&row.borough_id)
                .bind(&row.borough)
                .bind(row.population)
                .execute(&mut *tx)
                .await
                .map_err(query_error("INSERT"))?;
        }

        tx.commit().await.map_err(query_error("COMMIT"))?;
        debug!(rows = rows.len(), "boroughs table rebuilt");
        Ok(())
    }

    /// Replace the cuisines table wholesale, atomically.
    pub async fn fresh_cuisines(&self, rows: &[CuisineRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_error("BEGIN"))?;

        sqlx::query("DELETE FROM cuisines")
            .execute(&mut *tx)
            .await
            .map_err(query_error("DELETE"))?;

        for row in rows {
            sqlx::query("INSERT INTO cuisines (cuisine_id, cuisine) VALUES ($1, $2)")
                .bind(&row.cuisine_id)
                .bind(&row.cuisine)
                .execute(&mut *tx)
                .await
                .map_err(query_error("INSERT"))?;
        }

        tx.commit().await.map_err(query_error("COMMIT"))?;
        debug!(rows = rows.len(), "cuisines table rebuilt");
        Ok(())
    }

    /// Replace the restaurants table wholesale, atomically. Dimension
    /// rows must already exist or the foreign keys reject the insert.
    pub async fn fresh_restaurants(&self, rows: &[FactRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_error("BEGIN"))?;

        sqlx::query("DELETE FROM restaurants")
            .execute(&mut *tx)
            .await
            .map_err(query_error("DELETE"))?;

        for row in rows {
            insert_restaurant(&mut tx, row, false).await?;
        }

        tx.commit().await.map_err(query_error("COMMIT"))?;
        debug!(rows = rows.len(), "restaurants table rebuilt");
        Ok(())
    }

    /// Delete fact rows whose inspection predates the cutoff. Returns the
    /// number of rows removed.
    pub async fn delete_expired(&self, cutoff: NaiveDate) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM restaurants WHERE inspection_date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;

        Ok(result.rows_affected())
    }

    /// Insert fact rows whose id is not already present; existing rows are
    /// left untouched. Returns the number of rows actually inserted.
    pub async fn upsert_new(&self, rows: &[FactRow]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_error("BEGIN"))?;

        let mut inserted = 0;
        for row in rows {
            inserted += insert_restaurant(&mut tx, row, true).await?;
        }

        tx.commit().await.map_err(query_error("COMMIT"))?;
        Ok(inserted)
    }

    /// Update borough populations by name. Names not present in the table
    /// are no-ops, not errors.
    pub async fn update_population(
        &self,
        populations: &HashMap<String, i64>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_error("BEGIN"))?;

        for (borough, population) in populations {
            sqlx::query("UPDATE boroughs SET population = $1 WHERE borough = $2")
                .bind(*population)
                .bind(borough)
                .execute(&mut *tx)
                .await
                .map_err(query_error("UPDATE"))?;
        }

        tx.commit().await.map_err(query_error("COMMIT"))
    }

    /// Full fact listing joined with both dimensions, for the map view.
    pub async fn map_rows(&self) -> Result<Vec<MapRow>, StoreError> {
        sqlx::query_as::<_, MapRow>(
            r#"
SELECT r.id, r.name, r.lat, r.lng, b.borough, c.cuisine, r.inspection_date
FROM restaurants r
JOIN boroughs b ON b.borough_id = r.borough_id
JOIN cuisines c ON c.cuisine_id = r.cuisine_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }

    /// Cuisine counts within one borough, most common first.
    pub async fn top_cuisines(&self, borough: &str) -> Result<Vec<CuisineCount>, StoreError> {
        sqlx::query_as::<_, CuisineCount>(
            r#"
SELECT c.cuisine, COUNT(r.id) AS count
FROM restaurants r
JOIN cuisines c ON c.cuisine_id = r.cuisine_id
JOIN boroughs b ON b.borough_id = r.borough_id
WHERE b.borough = $1
GROUP BY c.cuisine
ORDER BY count DESC
            "#,
        )
        .bind(borough)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }

    /// Citywide per-cuisine counts with their share of the total.
    pub async fn cuisine_distribution(&self) -> Result<Vec<CuisineShare>, StoreError> {
        sqlx::query_as::<_, CuisineShare>(
            r#"
SELECT c.cuisine,
       COUNT(r.id) AS count,
       COUNT(r.id) * 100.0 / (SELECT COUNT(*) FROM restaurants) AS percent
FROM restaurants r
JOIN cuisines c ON c.cuisine_id = r.cuisine_id
GROUP BY c.cuisine
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }

    /// Restaurant count and population per borough.
    pub async fn borough_summaries(&self) -> Result<Vec<BoroughSummary>, StoreError> {
        sqlx::query_as::<_, BoroughSummary>(
            r#"
SELECT b.borough, COUNT(r.id) AS restaurant_count, b.population
FROM restaurants r
JOIN boroughs b ON b.borough_id = r.borough_id
GROUP BY b.borough
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }
}

async fn insert_restaurant(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    row: &FactRow,
    skip_existing: bool,
) -> Result<u64, StoreError> {
    let sql = if skip_existing {
        "INSERT INTO restaurants (id, name, borough_id, cuisine_id, inspection_date, lat, lng) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (id) DO NOTHING"
    } else {
        "INSERT INTO restaurants (id, name, borough_id, cuisine_id, inspection_date, lat, lng) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)"
    };

    let result = sqlx::query(sql)
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.borough_id)
        .bind(&row.cuisine_id)
        .bind(row.inspection_date)
        .bind(row.lat)
        .bind(row.lng)
        .execute(&mut **tx)
        .await
        .map_err(query_error("INSERT"))?;

    Ok(result.rows_affected())
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MapRow {
    pub id: i64,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub borough: String,
    pub cuisine: String,
    pub inspection_date: NaiveDate,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct CuisineCount {
    pub cuisine: String,
    pub count: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct CuisineShare {
    pub cuisine: String,
    pub count: i64,
    pub percent: f64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct BoroughSummary {
    pub borough: String,
    pub restaurant_count: i64,
    pub population: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{borough_codes, borough_rows, cuisine_codes, cuisine_rows};

    fn fact(id: i64, name: &str, borough_id: &str, cuisine_id: &str, date: (i32, u32, u32)) -> FactRow {
        FactRow {
            id,
            name: name.to_owned(),
            borough_id: borough_id.to_owned(),
            cuisine_id: cuisine_id.to_owned(),
            inspection_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            lat: 40.7,
            lng: -73.9,
        }
    }

    async fn store_with_dimensions() -> Store {
        let store = Store::in_memory().await.unwrap();
        store.create_schema().await.unwrap();

        let populations = HashMap::new();
        store
            .fresh_boroughs(&borough_rows(&borough_codes(), &populations))
            .await
            .unwrap();
        store
            .fresh_cuisines(&cuisine_rows(&cuisine_codes()))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_fresh_restaurants_is_idempotent() {
        let store = store_with_dimensions().await;
        let rows = vec![
            fact(1, "Kabul Kitchen", "B4", "C1", (2024, 6, 17)),
            fact(2, "Thai Garden", "B2", "C52", (2024, 3, 9)),
        ];

        store.fresh_restaurants(&rows).await.unwrap();
        store.fresh_restaurants(&rows).await.unwrap();

        let listing = store.map_rows().await.unwrap();
        assert_eq!(listing.len(), 2);
    }

    #[tokio::test]
    async fn test_foreign_keys_are_enforced() {
        let store = store_with_dimensions().await;
        let rows = vec![fact(1, "Orphaned", "B9", "C1", (2024, 6, 17))];

        let result = store.fresh_restaurants(&rows).await;
        assert!(matches!(result, Err(StoreError::Query { .. })));

        // The failed transaction rolled back: nothing was written.
        assert!(store.map_rows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_expired_removes_only_rows_past_cutoff() {
        let store = store_with_dimensions().await;
        store
            .fresh_restaurants(&[
                fact(1, "Old Timer", "B1", "C1", (2021, 5, 1)),
                fact(2, "Fresh Plate", "B1", "C1", (2024, 5, 1)),
            ])
            .await
            .unwrap();

        let removed = store
            .delete_expired(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap())
            .await
            .unwrap();

        assert_eq!(removed, 1);
        let remaining = store.map_rows().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, 2);
    }

    #[tokio::test]
    async fn test_upsert_new_inserts_only_novel_ids() {
        let store = store_with_dimensions().await;
        store
            .fresh_restaurants(&[fact(1, "Kabul Kitchen", "B4", "C1", (2024, 1, 5))])
            .await
            .unwrap();

        let inserted = store
            .upsert_new(&[
                fact(1, "Renamed Kitchen", "B4", "C1", (2024, 6, 17)),
                fact(2, "Thai Garden", "B2", "C52", (2024, 3, 9)),
            ])
            .await
            .unwrap();

        assert_eq!(inserted, 1);

        let listing = store.map_rows().await.unwrap();
        assert_eq!(listing.len(), 2);
        let existing = listing.iter().find(|r| r.id == 1).unwrap();
        // The existing row kept its original attributes.
        assert_eq!(existing.name, "Kabul Kitchen");
        assert_eq!(
            existing.inspection_date,
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()
        );
    }

    #[tokio::test]
    async fn test_update_population_matches_by_name() {
        let store = store_with_dimensions().await;

        let populations: HashMap<String, i64> = [
            ("Queens".to_owned(), 2_278_029),
            ("Atlantis".to_owned(), 1),
        ]
        .into_iter()
        .collect();
        store.update_population(&populations).await.unwrap();

        store
            .fresh_restaurants(&[fact(1, "Kabul Kitchen", "B4", "C1", (2024, 6, 17))])
            .await
            .unwrap();

        let summaries = store.borough_summaries().await.unwrap();
        let queens = summaries.iter().find(|s| s.borough == "Queens").unwrap();
        assert_eq!(queens.population, Some(2_278_029));
        assert!(summaries.iter().all(|s| s.borough != "Atlantis"));
    }

    #[tokio::test]
    async fn test_aggregations_group_and_order() {
        let store = store_with_dimensions().await;
        store
            .fresh_restaurants(&[
                fact(1, "Kabul Kitchen", "B4", "C1", (2024, 6, 17)),
                fact(2, "Kandahar House", "B4", "C1", (2024, 2, 2)),
                fact(3, "Thai Garden", "B4", "C52", (2024, 3, 9)),
                fact(4, "Bronx Thai", "B2", "C52", (2024, 4, 1)),
            ])
            .await
            .unwrap();

        let top = store.top_cuisines("Queens").await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].cuisine, "Afghan");
        assert_eq!(top[0].count, 2);

        let distribution = store.cuisine_distribution().await.unwrap();
        let thai = distribution.iter().find(|d| d.cuisine == "Thai").unwrap();
        assert_eq!(thai.count, 2);
        assert!((thai.percent - 50.0).abs() < 1e-9);

        let summaries = store.borough_summaries().await.unwrap();
        let queens = summaries.iter().find(|s| s.borough == "Queens").unwrap();
        assert_eq!(queens.restaurant_count, 3);
    }
}
