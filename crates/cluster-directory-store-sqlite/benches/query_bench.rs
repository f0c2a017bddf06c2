use std::path::Path;

use cluster_directory_core::{
    ClusterMetadata, ClusterRepository, KubeVersion, NewCluster, NewOrganization, OrgId,
    OrganizationRepository, PageQuery, SearchQuery, StalenessQuery,
};
use cluster_directory_store_sqlite::SqliteStore;
use criterion::{criterion_group, criterion_main, Criterion};
use time::{Duration, OffsetDateTime};

const CLUSTERS_PER_ORG: usize = 5_000;

fn seeded_store() -> (SqliteStore, OrgId) {
    let mut store = match SqliteStore::open(Path::new(":memory:")) {
        Ok(store) => store,
        Err(err) => panic!("benchmark store open failed: {err:#}"),
    };
    if let Err(err) = store.migrate() {
        panic!("benchmark migration failed: {err:#}");
    }

    let mut org_ids = Vec::new();
    for name in ["bench_org", "noise_org"] {
        let org = store.create_local_org(&NewOrganization {
            name: name.to_string(),
            creator_user_id: "bench".to_string(),
            id: None,
        });
        match org {
            Ok(org) => org_ids.push(org.id),
            Err(err) => panic!("benchmark org creation failed: {err}"),
        }
    }

    let base = OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000);
    for (org_index, org_id) in org_ids.iter().enumerate() {
        for index in 0..CLUSTERS_PER_ORG {
            let updated = base - Duration::hours(i64::try_from(index % 72).unwrap_or(0));
            let input = NewCluster {
                org_id: org_id.clone(),
                cluster_id: format!("cluster_{org_index}_{index:05}"),
                metadata: ClusterMetadata {
                    kube_version: KubeVersion {
                        major: "1".to_string(),
                        minor: (14 + index % 8).to_string(),
                        git_version: Some(format!("v1.{}.3", 14 + index % 8)),
                        ..KubeVersion::default()
                    },
                },
                created: Some(updated),
                updated: Some(updated),
            };
            if let Err(err) = store.insert_cluster(&input) {
                panic!("benchmark cluster insert failed: {err:#}");
            }
        }
    }

    (store, org_ids.swap_remove(0))
}

fn bench_queries(c: &mut Criterion) {
    let (store, org_id) = seeded_store();
    let now = OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000);

    c.bench_function("list_clusters_first_page_50", |b| {
        b.iter(|| {
            let page = store.list_clusters(&org_id, &PageQuery { limit: 50, starting_after: None });
            if let Err(err) = page {
                panic!("list benchmark failed: {err}");
            }
        });
    });

    c.bench_function("search_clusters_substring_50", |b| {
        let query = SearchQuery { filter: Some("_0042".to_string()), limit: 50 };
        b.iter(|| {
            if let Err(err) = store.search_clusters(&org_id, &query) {
                panic!("search benchmark failed: {err}");
            }
        });
    });

    c.bench_function("count_clusters_by_kube_version", |b| {
        b.iter(|| {
            if let Err(err) = store.count_clusters_by_kube_version(&org_id) {
                panic!("aggregation benchmark failed: {err}");
            }
        });
    });

    c.bench_function("list_stale_clusters_one_day", |b| {
        let query = StalenessQuery { updated_before: now - Duration::DAY };
        b.iter(|| {
            if let Err(err) = store.list_stale_clusters(&org_id, &query) {
                panic!("staleness benchmark failed: {err}");
            }
        });
    });
}

criterion_group!(query_benches, bench_queries);
criterion_main!(query_benches);
