use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;
pub const DEFAULT_ZOMBIE_THRESHOLD: Duration = Duration::DAY;

const ORG_API_KEY_PREFIX: &str = "orgApiKey-";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DirectoryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl DirectoryError {
    /// Store failures may succeed on retry; rejected input never will.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OrgId(pub String);

impl OrgId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Parse a caller-supplied organization identifier.
    ///
    /// # Errors
    /// Returns [`DirectoryError::Validation`] when the identifier is empty or blank.
    pub fn parse(raw: &str) -> Result<Self, DirectoryError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DirectoryError::Validation("org_id MUST be provided".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OrgId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned cluster record identifier; doubles as the pagination cursor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClusterRecordId(pub i64);

impl Display for ClusterRecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KubeVersion {
    pub major: String,
    pub minor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_tree_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub go_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl KubeVersion {
    #[must_use]
    pub fn key(&self) -> KubeVersionKey {
        KubeVersionKey { major: self.major.clone(), minor: self.minor.clone() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ClusterMetadata {
    pub kube_version: KubeVersion,
}

/// Grouping key for version aggregation.
///
/// Ordering compares the leading digits of `minor` numerically, so `"9"` sorts
/// before `"16"` and `"17+"` groups next to `"17"`. Minors without leading digits
/// sort after every numeric minor.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct KubeVersionKey {
    pub major: String,
    pub minor: String,
}

impl KubeVersionKey {
    #[must_use]
    pub fn minor_number(&self) -> Option<u64> {
        leading_number(&self.minor)
    }

    #[must_use]
    pub fn major_number(&self) -> Option<u64> {
        leading_number(&self.major)
    }
}

impl Ord for KubeVersionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        numeric_rank(self.minor_number())
            .cmp(&numeric_rank(other.minor_number()))
            .then_with(|| {
                numeric_rank(self.major_number()).cmp(&numeric_rank(other.major_number()))
            })
            .then_with(|| self.minor.cmp(&other.minor))
            .then_with(|| self.major.cmp(&other.major))
    }
}

impl PartialOrd for KubeVersionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn leading_number(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    let end = trimmed.find(|ch: char| !ch.is_ascii_digit()).unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}

fn numeric_rank(value: Option<u64>) -> (bool, u64) {
    match value {
        Some(number) => (false, number),
        None => (true, 0),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct KubeVersionCount {
    pub kube_version: KubeVersionKey,
    pub count: u64,
}

/// Order aggregation rows by ascending numeric minor version.
pub fn sort_version_counts(rows: &mut [KubeVersionCount]) {
    rows.sort_by(|left, right| left.kube_version.cmp(&right.kube_version));
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Cluster {
    pub id: ClusterRecordId,
    pub org_id: OrgId,
    pub cluster_id: String,
    pub metadata: ClusterMetadata,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

/// Input for the store's insertion primitive. Timestamps default to insertion time.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewCluster {
    pub org_id: OrgId,
    pub cluster_id: String,
    pub metadata: ClusterMetadata,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated: Option<OffsetDateTime>,
}

impl NewCluster {
    /// # Errors
    /// Returns [`DirectoryError::Validation`] when the owning org, the cluster
    /// identifier, or the Kubernetes major/minor version is missing.
    pub fn validate(&self) -> Result<(), DirectoryError> {
        if self.org_id.as_str().trim().is_empty() {
            return Err(DirectoryError::Validation("org_id MUST be provided".to_string()));
        }
        if self.cluster_id.trim().is_empty() {
            return Err(DirectoryError::Validation("cluster_id MUST be provided".to_string()));
        }
        let kube_version = &self.metadata.kube_version;
        if kube_version.major.trim().is_empty() || kube_version.minor.trim().is_empty() {
            return Err(DirectoryError::Validation(
                "kube_version major and minor MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Organization {
    pub id: OrgId,
    pub name: String,
    pub creator_user_id: String,
    pub org_keys: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewOrganization {
    pub name: String,
    pub creator_user_id: String,
    #[serde(default)]
    pub id: Option<OrgId>,
}

impl NewOrganization {
    /// # Errors
    /// Returns [`DirectoryError::Validation`] when name or creator is blank, or
    /// when a supplied identifier is blank.
    pub fn validate(&self) -> Result<(), DirectoryError> {
        if self.name.trim().is_empty() {
            return Err(DirectoryError::Validation(
                "organization name MUST be provided".to_string(),
            ));
        }
        if self.creator_user_id.trim().is_empty() {
            return Err(DirectoryError::Validation("creator_user_id MUST be provided".to_string()));
        }
        if let Some(id) = &self.id {
            if id.as_str().trim().is_empty() {
                return Err(DirectoryError::Validation(
                    "organization id MUST NOT be blank when supplied".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Materialize the organization a first-time provisioning call would persist:
    /// the supplied id (or a generated one) and exactly one generated API key.
    #[must_use]
    pub fn into_organization(self, now: OffsetDateTime) -> Organization {
        Organization {
            id: self.id.unwrap_or_else(OrgId::generate),
            name: self.name,
            creator_user_id: self.creator_user_id,
            org_keys: vec![generate_org_api_key()],
            created: now,
            updated: now,
        }
    }
}

#[must_use]
pub fn generate_org_api_key() -> String {
    format!("{ORG_API_KEY_PREFIX}{}", Ulid::new())
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DirectoryConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub zombie_threshold: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
            zombie_threshold: DEFAULT_ZOMBIE_THRESHOLD,
        }
    }
}

impl DirectoryConfig {
    /// # Errors
    /// Returns [`DirectoryError::Validation`] for zero page sizes, a default page
    /// size above the maximum, or a non-positive staleness threshold.
    pub fn validate(&self) -> Result<(), DirectoryError> {
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(DirectoryError::Validation("page sizes MUST be >= 1".to_string()));
        }
        if self.default_page_size > self.max_page_size {
            return Err(DirectoryError::Validation(format!(
                "default page size {} exceeds max page size {}",
                self.default_page_size, self.max_page_size
            )));
        }
        if self.zombie_threshold <= Duration::ZERO {
            return Err(DirectoryError::Validation("zombie threshold MUST be positive".to_string()));
        }
        Ok(())
    }

    /// Resolve a requested page size: absent means the default, and every value is
    /// clamped into `1..=max_page_size`.
    #[must_use]
    pub fn clamp_limit(&self, requested: Option<u32>) -> u32 {
        requested.unwrap_or(self.default_page_size).clamp(1, self.max_page_size.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct PageRequest {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub starting_after: Option<ClusterRecordId>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PageQuery {
    pub limit: u32,
    pub starting_after: Option<ClusterRecordId>,
}

impl PageRequest {
    #[must_use]
    pub fn resolve(&self, config: &DirectoryConfig) -> PageQuery {
        PageQuery { limit: config.clamp_limit(self.limit), starting_after: self.starting_after }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct SearchRequest {
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// `filter` is trimmed and lowercased with Unicode rules; `None` matches every record.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SearchQuery {
    pub filter: Option<String>,
    pub limit: u32,
}

impl SearchRequest {
    #[must_use]
    pub fn resolve(&self, config: &DirectoryConfig) -> SearchQuery {
        let filter = self
            .filter
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_lowercase);
        SearchQuery { filter, limit: config.clamp_limit(self.limit) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct StalenessRequest {
    #[serde(default)]
    pub threshold_seconds: Option<i64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

/// Clusters whose `updated` is strictly before `updated_before` are stale.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StalenessQuery {
    pub updated_before: OffsetDateTime,
}

impl StalenessRequest {
    /// # Errors
    /// Returns [`DirectoryError::Validation`] for a non-positive threshold or a
    /// cutoff outside the representable time range.
    pub fn resolve(
        &self,
        config: &DirectoryConfig,
        now: OffsetDateTime,
    ) -> Result<StalenessQuery, DirectoryError> {
        let threshold =
            self.threshold_seconds.map_or(config.zombie_threshold, Duration::seconds);
        if threshold <= Duration::ZERO {
            return Err(DirectoryError::Validation(
                "staleness threshold MUST be positive".to_string(),
            ));
        }

        let as_of = self.as_of.unwrap_or(now);
        let updated_before = as_of.checked_sub(threshold).ok_or_else(|| {
            DirectoryError::Validation("staleness threshold is out of range".to_string())
        })?;
        Ok(StalenessQuery { updated_before })
    }
}

/// Read side of the cluster record store. Every method is scoped by `org_id`,
/// and implementations MUST bind it as a query predicate.
pub trait ClusterRepository {
    /// # Errors
    /// Returns [`DirectoryError::Unavailable`] when the store cannot be read.
    fn cluster_by_cluster_id(
        &self,
        org_id: &OrgId,
        cluster_id: &str,
    ) -> Result<Option<Cluster>, DirectoryError>;

    /// Records in descending identifier order, older than the cursor when one is
    /// given. A cursor outside the org yields an empty page.
    ///
    /// # Errors
    /// Returns [`DirectoryError::Unavailable`] when the store cannot be read.
    fn list_clusters(&self, org_id: &OrgId, query: &PageQuery)
        -> Result<Vec<Cluster>, DirectoryError>;

    /// # Errors
    /// Returns [`DirectoryError::Unavailable`] when the store cannot be read.
    fn search_clusters(
        &self,
        org_id: &OrgId,
        query: &SearchQuery,
    ) -> Result<Vec<Cluster>, DirectoryError>;

    /// One row per distinct `(major, minor)`; row order is not significant.
    ///
    /// # Errors
    /// Returns [`DirectoryError::Unavailable`] when the store cannot be read.
    fn count_clusters_by_kube_version(
        &self,
        org_id: &OrgId,
    ) -> Result<Vec<KubeVersionCount>, DirectoryError>;

    /// # Errors
    /// Returns [`DirectoryError::Unavailable`] when the store cannot be read.
    fn list_stale_clusters(
        &self,
        org_id: &OrgId,
        query: &StalenessQuery,
    ) -> Result<Vec<Cluster>, DirectoryError>;
}

pub trait OrganizationRepository {
    /// Find-or-create by name as one atomic step.
    ///
    /// # Errors
    /// Returns [`DirectoryError::Validation`] for invalid input or an id already
    /// owned by a differently named organization, and
    /// [`DirectoryError::Unavailable`] when the store fails.
    fn create_local_org(&self, input: &NewOrganization) -> Result<Organization, DirectoryError>;

    /// # Errors
    /// Returns [`DirectoryError::Unavailable`] when the store cannot be read.
    fn organization(&self, org_id: &OrgId) -> Result<Option<Organization>, DirectoryError>;
}

impl<R: ClusterRepository + ?Sized> ClusterRepository for &R {
    fn cluster_by_cluster_id(
        &self,
        org_id: &OrgId,
        cluster_id: &str,
    ) -> Result<Option<Cluster>, DirectoryError> {
        (**self).cluster_by_cluster_id(org_id, cluster_id)
    }

    fn list_clusters(
        &self,
        org_id: &OrgId,
        query: &PageQuery,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        (**self).list_clusters(org_id, query)
    }

    fn search_clusters(
        &self,
        org_id: &OrgId,
        query: &SearchQuery,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        (**self).search_clusters(org_id, query)
    }

    fn count_clusters_by_kube_version(
        &self,
        org_id: &OrgId,
    ) -> Result<Vec<KubeVersionCount>, DirectoryError> {
        (**self).count_clusters_by_kube_version(org_id)
    }

    fn list_stale_clusters(
        &self,
        org_id: &OrgId,
        query: &StalenessQuery,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        (**self).list_stale_clusters(org_id, query)
    }
}

impl<R: OrganizationRepository + ?Sized> OrganizationRepository for &R {
    fn create_local_org(&self, input: &NewOrganization) -> Result<Organization, DirectoryError> {
        (**self).create_local_org(input)
    }

    fn organization(&self, org_id: &OrgId) -> Result<Option<Organization>, DirectoryError> {
        (**self).organization(org_id)
    }
}

/// Single entry point for directory queries. Validates org scope and resolves
/// request parameters before delegating to the repository.
#[derive(Debug, Clone)]
pub struct ClusterDirectory<R> {
    repo: R,
    config: DirectoryConfig,
}

impl<R> ClusterDirectory<R> {
    #[must_use]
    pub fn new(repo: R, config: DirectoryConfig) -> Self {
        Self { repo, config }
    }

    #[must_use]
    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    #[must_use]
    pub fn repository(&self) -> &R {
        &self.repo
    }
}

fn require_org(org_id: &OrgId) -> Result<(), DirectoryError> {
    OrgId::parse(org_id.as_str()).map(|_| ())
}

impl<R: ClusterRepository> ClusterDirectory<R> {
    /// # Errors
    /// Returns [`DirectoryError::Validation`] for a blank org or cluster id, and
    /// [`DirectoryError::Unavailable`] when the store fails.
    #[tracing::instrument(
        name = "directory.cluster_by_cluster_id",
        skip_all,
        fields(org_id = %org_id, cluster_id = %cluster_id)
    )]
    pub fn cluster_by_cluster_id(
        &self,
        org_id: &OrgId,
        cluster_id: &str,
    ) -> Result<Option<Cluster>, DirectoryError> {
        require_org(org_id)?;
        if cluster_id.trim().is_empty() {
            return Err(DirectoryError::Validation("cluster_id MUST be provided".to_string()));
        }
        let cluster = self.repo.cluster_by_cluster_id(org_id, cluster_id)?;
        tracing::debug!(found = cluster.is_some(), "cluster lookup complete");
        Ok(cluster)
    }

    /// Newest-first page of the org's clusters.
    ///
    /// # Errors
    /// Returns [`DirectoryError::Validation`] for a blank org id, and
    /// [`DirectoryError::Unavailable`] when the store fails.
    #[tracing::instrument(
        name = "directory.clusters_by_org_id",
        skip_all,
        fields(org_id = %org_id)
    )]
    pub fn clusters_by_org_id(
        &self,
        org_id: &OrgId,
        request: &PageRequest,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        require_org(org_id)?;
        let query = request.resolve(&self.config);
        let clusters = self.repo.list_clusters(org_id, &query)?;
        tracing::debug!(
            limit = query.limit,
            starting_after = ?query.starting_after,
            returned = clusters.len(),
            "cluster page read"
        );
        Ok(clusters)
    }

    /// # Errors
    /// Returns [`DirectoryError::Validation`] for a blank org id, and
    /// [`DirectoryError::Unavailable`] when the store fails.
    #[tracing::instrument(name = "directory.cluster_search", skip_all, fields(org_id = %org_id))]
    pub fn cluster_search(
        &self,
        org_id: &OrgId,
        request: &SearchRequest,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        require_org(org_id)?;
        let query = request.resolve(&self.config);
        let clusters = self.repo.search_clusters(org_id, &query)?;
        tracing::debug!(
            filtered = query.filter.is_some(),
            limit = query.limit,
            returned = clusters.len(),
            "cluster search complete"
        );
        Ok(clusters)
    }

    /// # Errors
    /// Returns [`DirectoryError::Validation`] for a blank org id, and
    /// [`DirectoryError::Unavailable`] when the store fails.
    #[tracing::instrument(
        name = "directory.cluster_count_by_kube_version",
        skip_all,
        fields(org_id = %org_id)
    )]
    pub fn cluster_count_by_kube_version(
        &self,
        org_id: &OrgId,
    ) -> Result<Vec<KubeVersionCount>, DirectoryError> {
        require_org(org_id)?;
        let mut rows = self.repo.count_clusters_by_kube_version(org_id)?;
        rows.retain(|row| row.count > 0);
        sort_version_counts(&mut rows);
        tracing::debug!(groups = rows.len(), "kube version counts computed");
        Ok(rows)
    }

    /// Clusters not updated within the threshold, evaluated against the current time.
    ///
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
    #[tracing::instrument(name = "directory.cluster_zombies", skip_all, fields(org_id = %org_id))]
    pub fn cluster_zombies_at(
        &self,
        org_id: &OrgId,
        request: &StalenessRequest,
        now: OffsetDateTime,
    ) -> Result<Vec<Cluster>, DirectoryError> {
        require_org(org_id)?;
        let query = request.resolve(&self.config, now)?;
        let clusters = self.repo.list_stale_clusters(org_id, &query)?;
        tracing::debug!(
            updated_before = %query.updated_before,
            returned = clusters.len(),
            "zombie clusters read"
        );
        Ok(clusters)
    }
}

impl<R: OrganizationRepository> ClusterDirectory<R> {
    /// # Errors
    /// Propagates [`OrganizationRepository::create_local_org`] failures.
    #[tracing::instrument(
        name = "directory.create_local_org",
        skip_all,
        fields(name = %input.name)
    )]
    pub fn create_local_org(
        &self,
        input: &NewOrganization,
    ) -> Result<Organization, DirectoryError> {
        input.validate()?;
        let org = self.repo.create_local_org(input)?;
        tracing::debug!(org_id = %org.id, "organization resolved");
        Ok(org)
    }

    /// # Errors
    /// Returns [`DirectoryError::Validation`] for a blank org id, and
    /// [`DirectoryError::Unavailable`] when the store fails.
    #[tracing::instrument(name = "directory.organization", skip_all, fields(org_id = %org_id))]
    pub fn organization(&self, org_id: &OrgId) -> Result<Option<Organization>, DirectoryError> {
        require_org(org_id)?;
        self.repo.organization(org_id)
    }
}
