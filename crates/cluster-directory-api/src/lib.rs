use std::path::{Path, PathBuf};

use anyhow::Result;
use cluster_directory_core::{
    Cluster, ClusterDirectory, DirectoryConfig, DirectoryError, KubeVersionCount, NewOrganization,
    OrgId, Organization, PageRequest, SearchRequest, StalenessRequest,
};
use cluster_directory_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Directory operations over one `SQLite` database file. Each call opens its own
/// connection, so one value can be shared freely across threads.
#[derive(Debug, Clone)]
pub struct ClusterDirectoryApi {
    db_path: PathBuf,
    config: DirectoryConfig,
}

impl ClusterDirectoryApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, config: DirectoryConfig::default() }
    }

    /// # Errors
    /// Returns [`DirectoryError::Validation`] when the configuration is inconsistent.
    pub fn with_config(db_path: PathBuf, config: DirectoryConfig) -> Result<Self, DirectoryError> {
        config.validate()?;
        Ok(Self { db_path, config })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_directory(&self) -> Result<ClusterDirectory<SqliteStore>, DirectoryError> {
        let mut store = self.open_store().map_err(unavailable)?;
        store.migrate().map_err(unavailable)?;
        Ok(ClusterDirectory::new(store, self.config))
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or a health check fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Find the organization named in `input`, creating it on first use.
    ///
    /// # Errors
    /// Returns [`DirectoryError::Validation`] for invalid input or a conflicting
    /// supplied id, and [`DirectoryError::Unavailable`] when the store fails.
    pub fn create_local_org(
        &self,
        input: &NewOrganization,
    ) -> Result<Organization, DirectoryError> {
        self.open_directory()?.create_local_org(input)
    }

    /// # Errors
    /// Returns [`DirectoryError::Unavailable`] when the store fails.
    pub fn organization(&self, org_id: &OrgId) -> Result<Option<Organization>, DirectoryError> {
        self.open_directory()?.organization(org_id)
    }

    /// # Errors
    /// Returns [`DirectoryError::Validation`] for blank identifiers and
    /// [`DirectoryError::Unavailable`] when the store fails.
    pub fn cluster_by_cluster_id(
        &self,
        org_id: &OrgId,
        cluster_id: &str,
    ) -> Result<Option<Cluster>, DirectoryError> {
        self.open_directory()?.cluster_by_cluster_id(org_id, cluster_id)
    }

    /// # Errors
    /// Returns [`DirectoryError::Validation`] for a blank org id and
    /// [`DirectoryError::Unavailable`] when the store fails.
    pub fn clusters_by_org_id(
        &self,
        org_id: &OrgId,
        request: &PageRequest,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        self.open_directory()?.clusters_by_org_id(org_id, request)
    }

    /// # Errors
    /// Returns [`DirectoryError::Validation`] for a blank org id and
    /// [`DirectoryError::Unavailable`] when the store fails.
    pub fn cluster_search(
        &self,
        org_id: &OrgId,
        request: &SearchRequest,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        self.open_directory()?.cluster_search(org_id, request)
    }

    /// # Errors
    /// Returns [`DirectoryError::Validation`] for a blank org id and
    /// [`DirectoryError::Unavailable`] when the store fails.
    pub fn cluster_count_by_kube_version(
        &self,
        org_id: &OrgId,
    ) -> Result<Vec<KubeVersionCount>, DirectoryError> {
        self.open_directory()?.cluster_count_by_kube_version(org_id)
    }

    /// # Errors
    /// Returns [`DirectoryError::Validation`] for a blank org id or invalid
    /// threshold, and [`DirectoryError::Unavailable`] when the store fails.
    pub fn cluster_zombies(
        &self,
        org_id: &OrgId,
        request: &StalenessRequest,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        self.cluster_zombies_at(org_id, request, OffsetDateTime::now_utc())
    }

    /// # Errors
    /// Same as [`Self::cluster_zombies`].
    pub fn cluster_zombies_at(
        &self,
        org_id: &OrgId,
        request: &StalenessRequest,
        now: OffsetDateTime,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        self.open_directory()?.cluster_zombies_at(org_id, request, now)
    }
}

fn unavailable(err: anyhow::Error) -> DirectoryError {
    tracing::warn!(error = %format!("{err:#}"), "cluster store unavailable");
    DirectoryError::Unavailable(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use cluster_directory_core::{ClusterMetadata, KubeVersion, NewCluster};
    use time::Duration;
    use ulid::Ulid;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("cluster-directory-api-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    fn kube_version(minor: &str) -> KubeVersion {
        KubeVersion {
            major: "1".to_string(),
            minor: minor.to_string(),
            git_version: Some("1.99".to_string()),
            git_commit: Some("abc".to_string()),
            git_tree_state: Some("def".to_string()),
            build_date: Some("a_date".to_string()),
            go_version: Some("1.88".to_string()),
            compiler: Some("some compiler".to_string()),
            platform: Some("linux/amd64".to_string()),
        }
    }

    fn seed_cluster(
        db_path: &Path,
        org_id: &OrgId,
        cluster_id: &str,
        minor: &str,
        at: OffsetDateTime,
    ) -> Result<Cluster> {
        let store = SqliteStore::open(db_path)?;
        store.insert_cluster(&NewCluster {
            org_id: org_id.clone(),
            cluster_id: cluster_id.to_string(),
            metadata: ClusterMetadata { kube_version: kube_version(minor) },
            created: Some(at),
            updated: Some(at),
        })
    }

    fn new_org(name: &str) -> NewOrganization {
        NewOrganization { name: name.to_string(), creator_user_id: "user01".to_string(), id: None }
    }

    // Test IDs: TAPI-001
    #[test]
    fn api_reproduces_reference_directory_scenario() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = ClusterDirectoryApi::new(db_path.clone());
        let now = OffsetDateTime::now_utc();

        let org01 = api.create_local_org(&new_org("org_01"))?;
        let org77 = api.create_local_org(&new_org("org_77"))?;
        seed_cluster(&db_path, &org01.id, "cluster_01", "16", now)?;
        seed_cluster(&db_path, &org01.id, "cluster_02", "16", now)?;
        let cluster_03 = seed_cluster(&db_path, &org01.id, "cluster_03", "17", now)?;
        seed_cluster(&db_path, &org01.id, "cluster_04", "17", now - Duration::days(2))?;
        seed_cluster(&db_path, &org77.id, "cluster_a", "17", now)?;

        let first = api.clusters_by_org_id(
            &org01.id,
            &PageRequest { limit: Some(2), starting_after: None },
        )?;
        let first_ids = first.iter().map(|c| c.cluster_id.as_str()).collect::<Vec<_>>();
        assert_eq!(first_ids, vec!["cluster_04", "cluster_03"]);

        let second = api.clusters_by_org_id(
            &org01.id,
            &PageRequest { limit: Some(2), starting_after: Some(cluster_03.id) },
        )?;
        let second_ids = second.iter().map(|c| c.cluster_id.as_str()).collect::<Vec<_>>();
        assert_eq!(second_ids, vec!["cluster_02", "cluster_01"]);

        let searched = api.cluster_search(
            &org01.id,
            &SearchRequest { filter: Some("cluster".to_string()), limit: Some(45) },
        )?;
        assert_eq!(searched.len(), 4);

        let first_match = api.cluster_search(
            &org01.id,
            &SearchRequest { filter: Some("cluster".to_string()), limit: Some(1) },
        )?;
        assert_eq!(first_match.len(), 1);
        assert_eq!(first_match[0].cluster_id, "cluster_04");

        let unfiltered = api.cluster_search(&org01.id, &SearchRequest::default())?;
        assert_eq!(unfiltered.len(), 4);

        let counts = api.cluster_count_by_kube_version(&org01.id)?;
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].kube_version, kube_version("16").key());
        assert_eq!(counts[1].kube_version, kube_version("17").key());

        let zombies = api.cluster_zombies(&org01.id, &StalenessRequest::default())?;
        assert_eq!(zombies.len(), 1);
        assert_eq!(zombies[0].cluster_id, "cluster_04");

        let found = api.cluster_by_cluster_id(&org77.id, "cluster_a")?;
        assert_eq!(found.map(|cluster| cluster.org_id), Some(org77.id.clone()));
        assert_eq!(api.cluster_by_cluster_id(&org77.id, "cluster_01")?, None);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn api_create_local_org_returns_existing_org_for_same_name() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = ClusterDirectoryApi::new(db_path.clone());

        let first = api.create_local_org(&new_org("org_01"))?;
        let second = api.create_local_org(&NewOrganization {
            name: "org_01".to_string(),
            creator_user_id: "someone-else".to_string(),
            id: Some(OrgId("ignored-id".to_string())),
        })?;

        assert_eq!(first, second);
        assert_eq!(second.creator_user_id, "user01");
        assert_eq!(api.organization(&first.id)?, Some(first));
        assert_eq!(api.organization(&OrgId("ignored-id".to_string()))?, None);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn api_migrate_supports_dry_run_then_apply() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = ClusterDirectoryApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.current_version, 0);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        let report = api.integrity_check()?;
        assert!(report.quick_check_ok);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn api_reports_unreachable_store_as_retryable() {
        let db_path = std::env::temp_dir()
            .join(format!("cluster-directory-missing-{}", Ulid::new()))
            .join("directory.sqlite3");
        let api = ClusterDirectoryApi::new(db_path);

        let result = api.clusters_by_org_id(&OrgId("org_01".to_string()), &PageRequest::default());
        assert!(matches!(&result, Err(err) if err.is_retryable()));
    }

    // Test IDs: TAPI-005
    #[test]
    fn api_with_config_applies_custom_limits() -> Result<()> {
        let db_path = unique_temp_db_path();
        assert!(ClusterDirectoryApi::with_config(
            db_path.clone(),
            DirectoryConfig { default_page_size: 0, ..DirectoryConfig::default() },
        )
        .is_err());

        let api = ClusterDirectoryApi::with_config(
            db_path.clone(),
            DirectoryConfig {
                default_page_size: 2,
                max_page_size: 3,
                ..DirectoryConfig::default()
            },
        )?;
        let org = api.create_local_org(&new_org("org_01"))?;
        let now = OffsetDateTime::now_utc();
        for index in 0..5 {
            seed_cluster(&db_path, &org.id, &format!("cluster_{index}"), "16", now)?;
        }

        assert_eq!(api.clusters_by_org_id(&org.id, &PageRequest::default())?.len(), 2);
        let capped = api.cluster_search(
            &org.id,
            &SearchRequest { filter: None, limit: Some(100) },
        )?;
        assert_eq!(capped.len(), 3);

        cleanup(&db_path);
        Ok(())
    }
}
