//! The relational index of records.
//!
//! One SQLite database per data directory holds a row per record (its
//! header-file location, application name and creation time) plus a tag
//! vocabulary and the record/tag association. The schema is bootstrapped
//! on open; there is no migration machinery.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use data_types::{AppTree, QueryRow, RecordId, RecordListing};
use observability_deps::tracing::debug;
use snafu::{ResultExt, Snafu};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};

/// Errors talking to the catalog database.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("invalid database url {url:?}: {source}"))]
    BadUrl { url: String, source: sqlx::Error },

    #[snafu(display("database error: {source}"))]
    Sqlx { source: sqlx::Error },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file TEXT NOT NULL,
        app TEXT NOT NULL DEFAULT '',
        ctime TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        text TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS record_tags (
        record_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tags(id),
        PRIMARY KEY (record_id, tag_id)
    )",
    "CREATE INDEX IF NOT EXISTS records_ctime ON records(ctime)",
];

/// Filter and paging parameters of a listing query.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    /// Rows to skip.
    pub offset: i64,
    /// Page size.
    pub limit: i64,
    /// Application name, `*`-suffix matches a prefix.
    pub app: Option<String>,
    /// Required tags; `*` inside a tag is a wildcard.
    pub tags: Vec<String>,
    /// Only records created at or before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Only records created at or after this instant.
    pub after: Option<DateTime<Utc>>,
}

/// Handle to the catalog database.
#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open (and bootstrap) a catalog from a sqlx database URL, e.g.
    /// `sqlite:///path/to/data.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .context(BadUrlSnafu { url })?
            .create_if_missing(true);
        // one connection: SQLite serializes writers anyway, and a pool of
        // `:memory:` connections would each see a different database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context(SqlxSnafu)?;
        let catalog = Self { pool };
        catalog.setup().await?;
        Ok(catalog)
    }

    /// Open the catalog of a data directory (`<datapath>/data.db`).
    pub async fn open(datapath: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", datapath.join("data.db").display());
        Self::connect(&url).await
    }

    async fn setup(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .context(SqlxSnafu)?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await.context(SqlxSnafu)?;
        }
        Ok(())
    }

    /// Insert a record row, creating tags as needed.
    pub async fn create(
        &self,
        file: &str,
        app: &str,
        ctime: DateTime<Utc>,
        tags: &[String],
    ) -> Result<RecordId> {
        let mut tx = self.pool.begin().await.context(SqlxSnafu)?;
        let id: i64 =
            sqlx::query_scalar("INSERT INTO records (file, app, ctime) VALUES (?, ?, ?) RETURNING id")
                .bind(file)
                .bind(app)
                .bind(ctime)
                .fetch_one(&mut *tx)
                .await
                .context(SqlxSnafu)?;
        for tag in tags {
            sqlx::query("INSERT OR IGNORE INTO tags (text) VALUES (?)")
                .bind(tag)
                .execute(&mut *tx)
                .await
                .context(SqlxSnafu)?;
            sqlx::query(
                "INSERT OR IGNORE INTO record_tags (record_id, tag_id)
                 SELECT ?, id FROM tags WHERE text = ?",
            )
            .bind(id)
            .bind(tag)
            .execute(&mut *tx)
            .await
            .context(SqlxSnafu)?;
        }
        tx.commit().await.context(SqlxSnafu)?;
        debug!(id, app, "catalog row created");
        Ok(RecordId::new(id))
    }

    /// The header-file path of a record, relative to the object tree.
    pub async fn file_of(&self, id: RecordId) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT file FROM records WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .context(SqlxSnafu)
    }

    /// Drop a record row and its tag associations.
    pub async fn delete(&self, id: RecordId) -> Result<()> {
        let mut tx = self.pool.begin().await.context(SqlxSnafu)?;
        sqlx::query("DELETE FROM record_tags WHERE record_id = ?")
            .bind(id.get())
            .execute(&mut *tx)
            .await
            .context(SqlxSnafu)?;
        sqlx::query("DELETE FROM records WHERE id = ?")
            .bind(id.get())
            .execute(&mut *tx)
            .await
            .context(SqlxSnafu)?;
        tx.commit().await.context(SqlxSnafu)
    }

    /// Replace (or extend, with `append`) a record's tag set.
    pub async fn update_tags(&self, id: RecordId, tags: &[String], append: bool) -> Result<bool> {
        if self.file_of(id).await?.is_none() {
            return Ok(false);
        }
        let mut tx = self.pool.begin().await.context(SqlxSnafu)?;
        if !append {
            sqlx::query("DELETE FROM record_tags WHERE record_id = ?")
                .bind(id.get())
                .execute(&mut *tx)
                .await
                .context(SqlxSnafu)?;
        }
        for tag in tags {
            sqlx::query("INSERT OR IGNORE INTO tags (text) VALUES (?)")
                .bind(tag)
                .execute(&mut *tx)
                .await
                .context(SqlxSnafu)?;
            sqlx::query(
                "INSERT OR IGNORE INTO record_tags (record_id, tag_id)
                 SELECT ?, id FROM tags WHERE text = ?",
            )
            .bind(id.get())
            .bind(tag)
            .execute(&mut *tx)
            .await
            .context(SqlxSnafu)?;
        }
        tx.commit().await.context(SqlxSnafu)?;
        Ok(true)
    }

    fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, params: &'a QueryParams) {
        for tag in &params.tags {
            builder.push(
                " AND EXISTS (SELECT 1 FROM record_tags rt JOIN tags t ON t.id = rt.tag_id
                  WHERE rt.record_id = records.id AND t.text ",
            );
            if tag.contains('*') {
                builder.push("LIKE ").push_bind(tag.replace('*', "%"));
            } else {
                builder.push("= ").push_bind(tag.as_str());
            }
            builder.push(")");
        }
        if let Some(app) = &params.app {
            if let Some(prefix) = app.strip_suffix('*') {
                builder
                    .push(" AND records.app LIKE ")
                    .push_bind(format!("{prefix}%"));
            } else {
                builder.push(" AND records.app = ").push_bind(app.as_str());
            }
        }
        if let Some(before) = &params.before {
            builder.push(" AND records.ctime <= ").push_bind(*before);
        }
        if let Some(after) = &params.after {
            builder.push(" AND records.ctime >= ").push_bind(*after);
        }
    }

    /// Filtered, paginated listing; see [`RecordListing`].
    pub async fn query(&self, params: &QueryParams) -> Result<RecordListing> {
        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM records WHERE 1=1");
        Self::push_filters(&mut count, params);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .context(SqlxSnafu)?;

        // app tree over everything matching the non-app filters, so the
        // browser can widen its prefix again
        let mut apps_q = QueryBuilder::new("SELECT DISTINCT app FROM records WHERE 1=1");
        let app_free = QueryParams {
            app: None,
            ..params.clone()
        };
        Self::push_filters(&mut apps_q, &app_free);
        let names: Vec<String> = apps_q
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await
            .context(SqlxSnafu)?;
        let mut apps = AppTree::default();
        for name in &names {
            apps.insert(name);
        }

        let mut page = QueryBuilder::new("SELECT id, app, ctime FROM records WHERE 1=1");
        Self::push_filters(&mut page, params);
        page.push(" ORDER BY records.ctime DESC LIMIT ")
            .push_bind(params.limit.max(0))
            .push(" OFFSET ")
            .push_bind(params.offset.max(0));
        let raw = page
            .build()
            .fetch_all(&self.pool)
            .await
            .context(SqlxSnafu)?;

        let mut rows = Vec::with_capacity(raw.len());
        for row in raw {
            let id: i64 = row.get("id");
            let mut tags: Vec<String> = sqlx::query_scalar(
                "SELECT t.text FROM tags t JOIN record_tags rt ON t.id = rt.tag_id
                 WHERE rt.record_id = ?",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .context(SqlxSnafu)?;
            tags.sort();
            rows.push(QueryRow {
                id: RecordId::new(id),
                app: row.get("app"),
                tags,
                ctime: row.get("ctime"),
            });
        }

        Ok(RecordListing { total, apps, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn memory_catalog() -> Catalog {
        Catalog::connect("sqlite::memory:").await.unwrap()
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn tags(ts: &[&str]) -> Vec<String> {
        ts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn create_then_lookup_file() {
        let c = memory_catalog().await;
        let id = c
            .create("aa/bb/cc/dead", "demo.sweep", at(9), &tags(&["good"]))
            .await
            .unwrap();
        assert_eq!(c.file_of(id).await.unwrap().unwrap(), "aa/bb/cc/dead");
        assert_eq!(c.file_of(RecordId::new(999)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn query_filters_by_app_pattern_and_tags() {
        let c = memory_catalog().await;
        c.create("f1", "t1.rabi", at(9), &tags(&["cal"])).await.unwrap();
        c.create("f2", "t1.spec", at(10), &tags(&["cal", "good"]))
            .await
            .unwrap();
        c.create("f3", "t2.spec", at(11), &tags(&["bad"])).await.unwrap();

        let r = c
            .query(&QueryParams {
                limit: 10,
                app: Some("t1.*".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(r.total, 2);
        // newest first
        assert_eq!(r.rows[0].app, "t1.spec");
        assert_eq!(r.rows[1].app, "t1.rabi");

        let r = c
            .query(&QueryParams {
                limit: 10,
                tags: tags(&["cal", "good"]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(r.total, 1);
        assert_eq!(r.rows[0].tags, tags(&["cal", "good"]));
    }

    #[tokio::test]
    async fn query_folds_apps_into_a_tree() {
        let c = memory_catalog().await;
        c.create("f1", "t1.rabi", at(9), &[]).await.unwrap();
        c.create("f2", "t1.spec", at(10), &[]).await.unwrap();
        c.create("f3", "t2.spec", at(11), &[]).await.unwrap();

        let r = c
            .query(&QueryParams {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        let t1 = r.apps.0.get("t1").unwrap();
        assert!(t1.0.contains_key("rabi"));
        assert!(t1.0.contains_key("spec"));
        assert!(r.apps.0.contains_key("t2"));
    }

    #[tokio::test]
    async fn query_paginates_and_windows_time() {
        let c = memory_catalog().await;
        for h in 0..5 {
            c.create(&format!("f{h}"), "app", at(h + 6), &[]).await.unwrap();
        }

        let r = c
            .query(&QueryParams {
                offset: 1,
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(r.total, 5);
        assert_eq!(r.rows.len(), 2);
        assert_eq!(r.rows[0].ctime, at(9));

        let r = c
            .query(&QueryParams {
                limit: 10,
                after: Some(at(8)),
                before: Some(at(9)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(r.total, 2);
    }

    #[tokio::test]
    async fn delete_drops_row_and_associations() {
        let c = memory_catalog().await;
        let id = c.create("f", "app", at(9), &tags(&["x"])).await.unwrap();
        c.delete(id).await.unwrap();
        assert_eq!(c.file_of(id).await.unwrap(), None);
        let r = c
            .query(&QueryParams {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(r.total, 0);
    }

    #[tokio::test]
    async fn update_tags_replaces_or_appends() {
        let c = memory_catalog().await;
        let id = c.create("f", "app", at(9), &tags(&["a"])).await.unwrap();

        assert!(c.update_tags(id, &tags(&["b"]), false).await.unwrap());
        let r = c
            .query(&QueryParams {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(r.rows[0].tags, tags(&["b"]));

        assert!(c.update_tags(id, &tags(&["c"]), true).await.unwrap());
        let r = c
            .query(&QueryParams {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(r.rows[0].tags, tags(&["b", "c"]));

        assert!(!c.update_tags(RecordId::new(99), &[], false).await.unwrap());
    }
}
