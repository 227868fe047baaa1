//! Generic filter/sort/paginate over anything with a name and a creation time

use chrono::{DateTime, Utc};
use console_api::{ClusterInfo, DataSelectQuery, Page};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::DynamicObject;
use kube::Resource;

/// Capability required by [`select`]
pub trait Selectable {
    fn name(&self) -> &str;

    /// `None` sorts after every known creation time
    fn created(&self) -> Option<DateTime<Utc>>;
}

fn resource_name<K: Resource>(resource: &K) -> &str {
    resource.meta().name.as_deref().unwrap_or_default()
}

fn resource_created<K: Resource>(resource: &K) -> Option<DateTime<Utc>> {
    resource.meta().creation_timestamp.as_ref().map(|time| time.0)
}

macro_rules! selectable_resources {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Selectable for $ty {
                fn name(&self) -> &str {
                    resource_name(self)
                }

                fn created(&self) -> Option<DateTime<Utc>> {
                    resource_created(self)
                }
            }
        )*
    };
}

selectable_resources!(
    Pod,
    Deployment,
    StatefulSet,
    DaemonSet,
    Service,
    Ingress,
    Secret,
    ConfigMap,
    Namespace,
    Node,
    DynamicObject,
);

impl Selectable for ClusterInfo {
    fn name(&self) -> &str {
        &self.cluster_name
    }

    fn created(&self) -> Option<DateTime<Utc>> {
        Some(self.created_at)
    }
}

/// Filter by name substring, sort newest first, then cut one page.
///
/// `total` counts the filtered items before pagination. Invalid pagination
/// parameters yield an empty page rather than an error.
pub fn select<T: Selectable>(items: Vec<T>, query: &DataSelectQuery) -> Page<T> {
    let mut items: Vec<T> = if query.filter_name.is_empty() {
        items
    } else {
        items
            .into_iter()
            .filter(|item| item.name().contains(query.filter_name.as_str()))
            .collect()
    };
    let total = items.len();

    // Stable, so equal creation times keep their input order.
    items.sort_by(|a, b| b.created().cmp(&a.created()));

    Page {
        limit: query.limit,
        page: query.page,
        total,
        items: paginate(items, query.limit, query.page),
    }
}

fn paginate<T>(mut items: Vec<T>, limit: i64, page: i64) -> Vec<T> {
    if limit <= 0 || page <= 0 {
        return Vec::new();
    }
    let bounds = limit
        .checked_mul(page - 1)
        .zip(limit.checked_mul(page))
        .and_then(|(start, end)| Some((usize::try_from(start).ok()?, usize::try_from(end).ok()?)));
    let Some((start, end)) = bounds else {
        return Vec::new();
    };

    if start >= items.len() {
        return Vec::new();
    }
    items.truncate(end.min(items.len()));
    items.drain(..start);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    #[derive(Clone, Debug, PartialEq)]
    struct Item {
        name: String,
        created: Option<DateTime<Utc>>,
    }

    impl Selectable for Item {
        fn name(&self) -> &str {
            &self.name
        }

        fn created(&self) -> Option<DateTime<Utc>> {
            self.created
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
    }

    /// 25 items, item-0 oldest, item-24 newest
    fn items() -> Vec<Item> {
        (0..25)
            .map(|i| Item {
                name: format!("item-{i}"),
                created: Some(at(i)),
            })
            .collect()
    }

    fn names<T: Selectable>(page: &Page<T>) -> Vec<&str> {
        page.items.iter().map(|item| item.name()).collect()
    }

    #[test]
    fn test_first_page_sorted_newest_first() {
        let page = select(items(), &DataSelectQuery::new("", 10, 1));
        assert_eq!(page.total, 25);
        assert_eq!(page.items.len(), 10);
        assert_eq!(page.items[0].name, "item-24");
        assert!(page
            .items
            .windows(2)
            .all(|pair| pair[0].created > pair[1].created));
    }

    #[test]
    fn test_last_partial_page_and_past_the_end() {
        let page = select(items(), &DataSelectQuery::new("", 10, 3));
        assert_eq!(page.items.len(), 5);
        assert_eq!(names(&page), vec!["item-4", "item-3", "item-2", "item-1", "item-0"]);

        let page = select(items(), &DataSelectQuery::new("", 10, 4));
        assert!(page.items.is_empty());
        assert_eq!(page.total, 25);
    }

    #[test]
    fn test_invalid_pagination_is_empty() {
        for (limit, page) in [(0, 1), (10, 0), (-1, 1), (10, -3), (i64::MAX, i64::MAX)] {
            let selected = select(items(), &DataSelectQuery::new("", limit, page));
            assert!(selected.items.is_empty(), "limit={limit} page={page}");
            assert_eq!(selected.total, 25);
        }
    }

    #[test]
    fn test_exact_boundary_page() {
        let page = select(items(), &DataSelectQuery::new("", 5, 5));
        assert_eq!(names(&page), vec!["item-4", "item-3", "item-2", "item-1", "item-0"]);
        assert!(select(items(), &DataSelectQuery::new("", 5, 6)).items.is_empty());
    }

    #[test]
    fn test_filter_is_case_sensitive_substring_and_counts_before_paging() {
        let page = select(items(), &DataSelectQuery::new("item-1", 3, 1));
        // item-1 and item-10..item-19
        assert_eq!(page.total, 11);
        assert_eq!(names(&page), vec!["item-19", "item-18", "item-17"]);

        assert_eq!(select(items(), &DataSelectQuery::new("ITEM", 10, 1)).total, 0);
    }

    #[test]
    fn test_filtering_a_filtered_page_keeps_membership() {
        let query = DataSelectQuery::new("item-2", 5, 1);
        let once = select(items(), &query);
        let twice = select(once.items.clone(), &query);
        assert_eq!(twice.items, once.items);
    }

    #[test]
    fn test_missing_creation_time_sorts_last_and_ties_keep_order() {
        let input = vec![
            Item { name: "unknown".into(), created: None },
            Item { name: "first".into(), created: Some(at(1)) },
            Item { name: "second".into(), created: Some(at(1)) },
            Item { name: "newest".into(), created: Some(at(2)) },
        ];
        let page = select(input, &DataSelectQuery::new("", 10, 1));
        assert_eq!(names(&page), vec!["newest", "first", "second", "unknown"]);
    }

    #[test]
    fn test_kubernetes_objects_are_selectable() {
        let pod = |name: &str, minute: u32| Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                creation_timestamp: Some(Time(at(minute))),
                ..Default::default()
            },
            ..Default::default()
        };
        let pods = vec![pod("web-1", 1), pod("db-0", 5), pod("web-2", 3)];

        let page = select(pods, &DataSelectQuery::new("web", 10, 1));
        assert_eq!(page.total, 2);
        assert_eq!(names(&page), vec!["web-2", "web-1"]);
        assert_eq!(Pod::default().name(), "");
    }
}
