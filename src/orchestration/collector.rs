//! Membership collection sub-flows.
//!
//! One task per source group checks that the group exists and pages through
//! its members. All tasks are joined before the result is reported, so one
//! failing group never cancels the others.

use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinSet;
use tracing::{debug, error};
use uuid::Uuid;

use super::state::GroupCollection;
use crate::directory::{DirectoryError, DirectoryMembershipProvider, PageResult};
use crate::retry::{RetryPolicy, retry_transient};

#[derive(Debug, Clone, PartialEq)]
pub enum CollectionOutcome {
    Collected(GroupCollection),
    GroupNotFound(Uuid),
}

/// Reads every member of `group_id`, retrying transient faults per call.
pub async fn collect_group(
    provider: Arc<dyn DirectoryMembershipProvider>,
    policy: RetryPolicy,
    run_id: Uuid,
    group_id: Uuid,
) -> Result<CollectionOutcome, DirectoryError> {
    let exists = retry_transient(&policy, run_id, "group_exists", || {
        provider.group_exists(group_id)
    })
    .await?;
    if !exists {
        return Ok(CollectionOutcome::GroupNotFound(group_id));
    }

    let first = retry_transient(&policy, run_id, "get_first_page", || {
        provider.get_first_page(group_id)
    })
    .await;
    let mut page = match first {
        Ok(page) => page,
        Err(DirectoryError::GroupNotFound(id)) => return Ok(CollectionOutcome::GroupNotFound(id)),
        Err(err) => return Err(err),
    };

    let mut collection = GroupCollection {
        group_id,
        ..GroupCollection::default()
    };
    loop {
        accumulate(&mut collection, &page);
        let Some(token) = page.next_token.take() else {
            break;
        };
        let cursor = page.cursor.take();
        page = retry_transient(&policy, run_id, "get_next_page", || {
            provider.get_next_page(&token, cursor.as_ref())
        })
        .await?;
    }

    debug!(
        run_id = %run_id,
        group_id = %group_id,
        users = collection.users.len(),
        pages = collection.pages,
        non_user_objects = ?collection.non_user_object_counts,
        "Collected group membership"
    );
    Ok(CollectionOutcome::Collected(collection))
}

fn accumulate(collection: &mut GroupCollection, page: &PageResult) {
    collection.pages += 1;
    collection.users.extend(page.users.iter().copied());
    for (kind, count) in &page.non_user_object_counts {
        *collection
            .non_user_object_counts
            .entry(kind.clone())
            .or_default() += count;
    }
}

/// Collects all groups concurrently. Outcomes are returned in input order;
/// the first failure (in input order) fails the whole collection once every
/// task has finished.
pub async fn collect_all(
    provider: Arc<dyn DirectoryMembershipProvider>,
    policy: RetryPolicy,
    run_id: Uuid,
    groups: &[Uuid],
) -> Result<Vec<CollectionOutcome>, DirectoryError> {
    let mut tasks = JoinSet::new();
    for (index, group_id) in groups.iter().copied().enumerate() {
        let provider = Arc::clone(&provider);
        tasks.spawn(async move {
            (
                index,
                collect_group(provider, policy, run_id, group_id).await,
            )
        });
    }

    let mut results: Vec<Option<Result<CollectionOutcome, DirectoryError>>> =
        (0..groups.len()).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(join_err) => {
                error!(run_id = %run_id, error = %join_err, "Membership sub-flow aborted");
                counter!("membership_subflow_failures_total").increment(1);
                return Err(DirectoryError::Permanent(join_err.to_string()));
            }
        }
    }

    let mut outcomes = Vec::with_capacity(groups.len());
    for result in results.into_iter().flatten() {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => {
                counter!("membership_subflow_failures_total").increment(1);
                return Err(err);
            }
        }
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AzureAdUser;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    /// Serves each group as two pages and fails the first `flaky` calls.
    struct PagedProvider {
        groups: HashMap<Uuid, Vec<AzureAdUser>>,
        flaky: Mutex<u32>,
    }

    impl PagedProvider {
        fn maybe_fail(&self) -> Result<(), DirectoryError> {
            let mut flaky = self.flaky.lock().unwrap();
            if *flaky > 0 {
                *flaky -= 1;
                return Err(DirectoryError::Transient("connection reset".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DirectoryMembershipProvider for PagedProvider {
        async fn group_exists(&self, group_id: Uuid) -> Result<bool, DirectoryError> {
            self.maybe_fail()?;
            Ok(self.groups.contains_key(&group_id))
        }

        async fn get_first_page(&self, group_id: Uuid) -> Result<PageResult, DirectoryError> {
            self.maybe_fail()?;
            let users = &self.groups[&group_id];
            let half = users.len() / 2;
            Ok(PageResult {
                users: users[..half].to_vec(),
                non_user_object_counts: BTreeMap::from([("device".to_string(), 1)]),
                next_token: Some(format!("{}:{}", group_id, half)),
                cursor: None,
            })
        }

        async fn get_next_page(
            &self,
            next_token: &str,
            _cursor: Option<&serde_json::Value>,
        ) -> Result<PageResult, DirectoryError> {
            self.maybe_fail()?;
            let (group, offset) = next_token.split_once(':').unwrap();
            let users = &self.groups[&Uuid::parse_str(group).unwrap()];
            Ok(PageResult {
                users: users[offset.parse::<usize>().unwrap()..].to_vec(),
                non_user_object_counts: BTreeMap::from([("device".to_string(), 2)]),
                next_token: None,
                cursor: None,
            })
        }
    }

    fn users(n: usize) -> Vec<AzureAdUser> {
        (0..n).map(|_| AzureAdUser::new(Uuid::new_v4())).collect()
    }

    #[tokio::test]
    async fn collects_all_pages_and_counts_non_users() {
        let group = Uuid::new_v4();
        let members = users(5);
        let provider = Arc::new(PagedProvider {
            groups: HashMap::from([(group, members.clone())]),
            flaky: Mutex::new(2),
        });

        let outcome = collect_group(provider, RetryPolicy::immediate(5), Uuid::new_v4(), group)
            .await
            .unwrap();

        let CollectionOutcome::Collected(collection) = outcome else {
            panic!("expected collected membership");
        };
        assert_eq!(collection.users, members);
        assert_eq!(collection.pages, 2);
        assert_eq!(collection.non_user_object_counts.get("device"), Some(&3));
    }

    #[tokio::test]
    async fn missing_group_is_reported_not_raised() {
        let known = Uuid::new_v4();
        let missing = Uuid::new_v4();
        let provider = Arc::new(PagedProvider {
            groups: HashMap::from([(known, users(2))]),
            flaky: Mutex::new(0),
        });

        let outcomes = collect_all(
            provider,
            RetryPolicy::immediate(5),
            Uuid::new_v4(),
            &[known, missing],
        )
        .await
        .unwrap();

        assert!(matches!(outcomes[0], CollectionOutcome::Collected(_)));
        assert_eq!(outcomes[1], CollectionOutcome::GroupNotFound(missing));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_join() {
        let group = Uuid::new_v4();
        let provider = Arc::new(PagedProvider {
            groups: HashMap::from([(group, users(2))]),
            flaky: Mutex::new(100),
        });

        let result = collect_all(provider, RetryPolicy::immediate(5), Uuid::new_v4(), &[group]).await;
        assert!(matches!(result, Err(DirectoryError::Transient(_))));
    }
}
