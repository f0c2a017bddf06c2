use std::path::Path;

use anyhow::{anyhow, Context, Result};
use cluster_directory_core::{
    Cluster, ClusterMetadata, ClusterRecordId, ClusterRepository, DirectoryError, KubeVersion,
    KubeVersionCount, KubeVersionKey, NewCluster, NewOrganization, OrgId, Organization,
    OrganizationRepository, PageQuery, SearchQuery, StalenessQuery,
};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS organizations (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  creator_user_id TEXT NOT NULL,
  org_keys_json TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS clusters (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id TEXT NOT NULL,
  cluster_id TEXT NOT NULL CHECK (length(trim(cluster_id)) > 0),
  kube_major TEXT NOT NULL,
  kube_minor TEXT NOT NULL,
  kube_git_version TEXT,
  kube_git_commit TEXT,
  kube_git_tree_state TEXT,
  kube_build_date TEXT,
  kube_go_version TEXT,
  kube_compiler TEXT,
  kube_platform TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  UNIQUE(org_id, cluster_id),
  FOREIGN KEY (org_id) REFERENCES organizations(id)
);

CREATE INDEX IF NOT EXISTS idx_clusters_org_id ON clusters(org_id, id);
CREATE INDEX IF NOT EXISTS idx_clusters_org_updated_at ON clusters(org_id, updated_at);
CREATE INDEX IF NOT EXISTS idx_clusters_org_kube_version
    ON clusters(org_id, kube_major, kube_minor);
";

const MIGRATIONS: [(i64, &str); 1] = [(1, MIGRATION_001_SQL)];

const CLUSTER_COLUMNS: &str = "id, org_id, cluster_id, kube_major, kube_minor,
    kube_git_version, kube_git_commit, kube_git_tree_state, kube_build_date,
    kube_go_version, kube_compiler, kube_platform, created_at, updated_at";

const ORGANIZATION_COLUMNS: &str =
    "id, name, creator_user_id, org_keys_json, created_at, updated_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

struct ClusterRow {
    id: i64,
    org_id: String,
    cluster_id: String,
    kube_major: String,
    kube_minor: String,
    kube_git_version: Option<String>,
    kube_git_commit: Option<String>,
    kube_git_tree_state: Option<String>,
    kube_build_date: Option<String>,
    kube_go_version: Option<String>,
    kube_compiler: Option<String>,
    kube_platform: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl ClusterRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            org_id: row.get(1)?,
            cluster_id: row.get(2)?,
            kube_major: row.get(3)?,
            kube_minor: row.get(4)?,
            kube_git_version: row.get(5)?,
            kube_git_commit: row.get(6)?,
            kube_git_tree_state: row.get(7)?,
            kube_build_date: row.get(8)?,
            kube_go_version: row.get(9)?,
            kube_compiler: row.get(10)?,
            kube_platform: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_cluster(self) -> Result<Cluster> {
        Ok(Cluster {
            id: ClusterRecordId(self.id),
            org_id: OrgId(self.org_id),
            cluster_id: self.cluster_id,
            metadata: ClusterMetadata {
                kube_version: KubeVersion {
                    major: self.kube_major,
                    minor: self.kube_minor,
                    git_version: self.kube_git_version,
                    git_commit: self.kube_git_commit,
                    git_tree_state: self.kube_git_tree_state,
                    build_date: self.kube_build_date,
                    go_version: self.kube_go_version,
                    compiler: self.kube_compiler,
                    platform: self.kube_platform,
                },
            },
            created: from_unix_nanos(self.created_at)?,
            updated: from_unix_nanos(self.updated_at)?,
        })
    }
}

struct OrganizationRow {
    id: String,
    name: String,
    creator_user_id: String,
    org_keys_json: String,
    created_at: i64,
    updated_at: i64,
}

impl OrganizationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            creator_user_id: row.get(2)?,
            org_keys_json: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_organization(self) -> Result<Organization> {
        Ok(Organization {
            id: OrgId(self.id),
            name: self.name,
            creator_user_id: self.creator_user_id,
            org_keys: serde_json::from_str(&self.org_keys_json)
                .context("failed to deserialize org_keys")?,
            created: from_unix_nanos(self.created_at)?,
            updated: from_unix_nanos(self.updated_at)?,
        })
    }
}

impl SqliteStore {
    /// Open a SQLite-backed cluster store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;
        register_fold_case(&conn)?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails, or
    /// when the database is newer than this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let current = current_schema_version(&self.conn)?;
        if current > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {current}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (version, sql) in MIGRATIONS {
            if version <= current {
                continue;
            }

            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{version} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![version, now_rfc3339()?],
            )
            .with_context(|| format!("failed to record migration version {version}"))?;
            tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
            tracing::info!(version, "applied schema migration");
        }

        Ok(())
    }

    /// Persist one cluster record. This is the write path of the external
    /// registration process; the directory itself never calls it.
    ///
    /// # Errors
    /// Returns an error when validation fails, the owning organization does not
    /// exist, the `(org_id, cluster_id)` pair is taken, or the insert fails.
    pub fn insert_cluster(&self, input: &NewCluster) -> Result<Cluster> {
        input.validate().map_err(|err| anyhow!("cluster validation failed: {err}"))?;

        let now = OffsetDateTime::now_utc();
        let created = input.created.unwrap_or(now);
        let updated = input.updated.unwrap_or(created);
        let kube_version = &input.metadata.kube_version;

        self.conn
            .execute(
                "INSERT INTO clusters(
                    org_id, cluster_id, kube_major, kube_minor,
                    kube_git_version, kube_git_commit, kube_git_tree_state, kube_build_date,
                    kube_go_version, kube_compiler, kube_platform, created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4,
                    ?5, ?6, ?7, ?8,
                    ?9, ?10, ?11, ?12, ?13
                )",
                params![
                    input.org_id.as_str(),
                    input.cluster_id,
                    kube_version.major,
                    kube_version.minor,
                    kube_version.git_version,
                    kube_version.git_commit,
                    kube_version.git_tree_state,
                    kube_version.build_date,
                    kube_version.go_version,
                    kube_version.compiler,
                    kube_version.platform,
                    to_unix_nanos(created)?,
                    to_unix_nanos(updated)?,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert cluster {} for org {}",
                    input.cluster_id, input.org_id
                )
            })?;

        Ok(Cluster {
            id: ClusterRecordId(self.conn.last_insert_rowid()),
            org_id: input.org_id.clone(),
            cluster_id: input.cluster_id.clone(),
            metadata: input.metadata.clone(),
            created: truncate_to_storage(created)?,
            updated: truncate_to_storage(updated)?,
        })
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn query_clusters(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Cluster>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare cluster query")?;
        let rows = stmt.query_map(params, ClusterRow::from_row)?;

        let mut clusters = Vec::new();
        for row in rows {
            clusters.push(row.context("failed to read cluster row")?.into_cluster()?);
        }
        Ok(clusters)
    }

    fn find_cluster(&self, org_id: &OrgId, cluster_id: &str) -> Result<Option<Cluster>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE org_id = ?1 AND cluster_id = ?2"
                ),
                params![org_id.as_str(), cluster_id],
                ClusterRow::from_row,
            )
            .optional()
            .context("failed to look up cluster by cluster_id")?;
        row.map(ClusterRow::into_cluster).transpose()
    }

    fn page_clusters(&self, org_id: &OrgId, query: &PageQuery) -> Result<Vec<Cluster>> {
        // The cursor must name a record of this org; the existence check runs in the
        // same statement so one snapshot covers both.
        self.query_clusters(
            &format!(
                "SELECT {CLUSTER_COLUMNS} FROM clusters
                 WHERE org_id = ?1
                   AND (?2 IS NULL OR (
                     id < ?2
                     AND EXISTS (
                       SELECT 1 FROM clusters AS cursor
                       WHERE cursor.id = ?2 AND cursor.org_id = ?1
                     )
                   ))
                 ORDER BY id DESC
                 LIMIT ?3"
            ),
            params![
                org_id.as_str(),
                query.starting_after.map(|cursor| cursor.0),
                i64::from(query.limit)
            ],
        )
    }

    fn search(&self, org_id: &OrgId, query: &SearchQuery) -> Result<Vec<Cluster>> {
        self.query_clusters(
            &format!(
                "SELECT {CLUSTER_COLUMNS} FROM clusters
                 WHERE org_id = ?1
                   AND (?2 IS NULL
                     OR instr(fold_case(cluster_id), ?2) > 0
                     OR instr(fold_case(coalesce(kube_git_version, '')), ?2) > 0)
                 ORDER BY id DESC
                 LIMIT ?3"
            ),
            params![org_id.as_str(), query.filter.as_deref(), i64::from(query.limit)],
        )
    }

    fn stale_clusters(&self, org_id: &OrgId, query: &StalenessQuery) -> Result<Vec<Cluster>> {
        self.query_clusters(
            &format!(
                "SELECT {CLUSTER_COLUMNS} FROM clusters
                 WHERE org_id = ?1 AND updated_at < ?2
                 ORDER BY id DESC"
            ),
            params![org_id.as_str(), cutoff_nanos(query.updated_before)],
        )
    }

    fn version_counts(&self, org_id: &OrgId) -> Result<Vec<KubeVersionCount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT kube_major, kube_minor, COUNT(*)
                 FROM clusters
                 WHERE org_id = ?1
                 GROUP BY kube_major, kube_minor",
            )
            .context("failed to prepare kube version aggregation")?;
        let rows = stmt.query_map(params![org_id.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            let (major, minor, count) = row.context("failed to read kube version group")?;
            counts.push(KubeVersionCount {
                kube_version: KubeVersionKey { major, minor },
                count: u64::try_from(count).context("negative group count")?,
            });
        }
        Ok(counts)
    }

    fn find_organization(&self, column: &str, value: &str) -> Result<Option<Organization>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE {column} = ?1"),
                params![value],
                OrganizationRow::from_row,
            )
            .optional()
            .with_context(|| format!("failed to look up organization by {column}"))?;
        row.map(OrganizationRow::into_organization).transpose()
    }

    fn insert_organization_if_absent(&self, candidate: &Organization) -> Result<usize> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO organizations(
                    id, name, creator_user_id, org_keys_json, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    candidate.id.as_str(),
                    candidate.name,
                    candidate.creator_user_id,
                    serde_json::to_string(&candidate.org_keys)
                        .context("failed to serialize org_keys")?,
                    to_unix_nanos(candidate.created)?,
                    to_unix_nanos(candidate.updated)?,
                ],
            )
            .context("failed to insert organization")
    }
}

impl ClusterRepository for SqliteStore {
    fn cluster_by_cluster_id(
        &self,
        org_id: &OrgId,
        cluster_id: &str,
    ) -> Result<Option<Cluster>, DirectoryError> {
        self.find_cluster(org_id, cluster_id).map_err(unavailable)
    }

    fn list_clusters(
        &self,
        org_id: &OrgId,
        query: &PageQuery,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        self.page_clusters(org_id, query).map_err(unavailable)
    }

    fn search_clusters(
        &self,
        org_id: &OrgId,
        query: &SearchQuery,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        self.search(org_id, query).map_err(unavailable)
    }

    fn count_clusters_by_kube_version(
        &self,
        org_id: &OrgId,
    ) -> Result<Vec<KubeVersionCount>, DirectoryError> {
        self.version_counts(org_id).map_err(unavailable)
    }

    fn list_stale_clusters(
        &self,
        org_id: &OrgId,
        query: &StalenessQuery,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        self.stale_clusters(org_id, query).map_err(unavailable)
    }
}

impl OrganizationRepository for SqliteStore {
    fn create_local_org(&self, input: &NewOrganization) -> Result<Organization, DirectoryError> {
        input.validate()?;

        let candidate = input.clone().into_organization(OffsetDateTime::now_utc());
        let inserted = self.insert_organization_if_absent(&candidate).map_err(unavailable)?;
        if inserted == 1 {
            tracing::info!(
                org_id = %candidate.id,
                name = %candidate.name,
                "created local organization"
            );
        }

        // UNIQUE(name) arbitrates concurrent callers; whoever won, the row is read back.
        match self.find_organization("name", &input.name).map_err(unavailable)? {
            Some(org) => Ok(org),
            None => Err(DirectoryError::Validation(format!(
                "organization id {} is already in use by another organization",
                candidate.id
            ))),
        }
    }

    fn organization(&self, org_id: &OrgId) -> Result<Option<Organization>, DirectoryError> {
        self.find_organization("id", org_id.as_str()).map_err(unavailable)
    }
}

fn unavailable(err: anyhow::Error) -> DirectoryError {
    DirectoryError::Unavailable(format!("{err:#}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to query current schema version")
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format timestamp")
}

fn to_unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp {value} is outside the storable range"))
}

/// Cutoffs beyond the storable range saturate; every stored row is inside it.
fn cutoff_nanos(value: OffsetDateTime) -> i64 {
    let nanos = value.unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(if nanos < 0 { i64::MIN } else { i64::MAX })
}

/// `fold_case(text)` lowercases with full Unicode rules; `lower()` only folds ASCII.
fn register_fold_case(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "fold_case",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let value = ctx.get::<Option<String>>(0)?;
            Ok(value.map(|text| text.to_lowercase()))
        },
    )
    .context("failed to register fold_case sql function")
}

fn from_unix_nanos(value: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .with_context(|| format!("invalid stored timestamp: {value}"))
}

/// Timestamps are persisted in UTC; normalize so returned records match reads.
fn truncate_to_storage(value: OffsetDateTime) -> Result<OffsetDateTime> {
    from_unix_nanos(to_unix_nanos(value)?)
}
