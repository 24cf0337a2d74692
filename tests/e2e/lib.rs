#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::{Api, Patch, PatchParams, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use nopea::crd::{GitRepository, GitRepositorySpec, Phase};
    use serde_json::json;
    use tokio::time::timeout;

    /// Fixture repository served in the test cluster; `deploy/` holds one
    /// ConfigMap named `app`.
    const FIXTURE_REPO_URL: &str = "http://gitserver.default.svc/fixtures/acme.git";

    fn is_phase(expected: Phase) -> impl Condition<GitRepository> {
        move |obj: Option<&GitRepository>| {
            obj.and_then(|repo| repo.status.as_ref())
                .and_then(|status| status.phase)
                .map(|phase| phase == expected)
                .unwrap_or(false)
        }
    }

    fn has_synced_commit() -> impl Condition<GitRepository> {
        |obj: Option<&GitRepository>| {
            obj.and_then(|repo| repo.status.as_ref())
                .and_then(|status| status.last_synced_commit.as_ref())
                .map(|commit| commit.len() == 40 || commit.len() == 64)
                .unwrap_or(false)
        }
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(
            Duration::from_secs(60),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    fn repository(name: &str) -> GitRepository {
        GitRepository::new(
            name,
            GitRepositorySpec {
                url: FIXTURE_REPO_URL.into(),
                branch: Some("main".into()),
                path: Some("deploy".into()),
                target_namespace: Some("default".into()),
                interval: Some("30s".into()),
                suspend: None,
                heal_policy: None,
                heal_grace_period: None,
            },
        )
    }

    async fn setup(name: &str) -> (Api<GitRepository>, Api<ConfigMap>) {
        let client = Client::try_default().await.unwrap();
        let repos = Api::<GitRepository>::namespaced(client.clone(), "default");
        repos
            .create(&PostParams::default(), &repository(name))
            .await
            .unwrap();

        wait_for(repos.clone(), name, is_phase(Phase::Synced)).await;
        wait_for(repos.clone(), name, has_synced_commit()).await;

        let config_maps = Api::<ConfigMap>::namespaced(client, "default");
        (repos, config_maps)
    }

    #[tokio::test]
    async fn repository_syncs_and_reports_status() {
        let name = "test-sync";
        let (repos, config_maps) = setup(name).await;

        let applied = config_maps.get("app").await.unwrap();
        assert!(applied
            .metadata
            .managed_fields
            .unwrap()
            .iter()
            .filter_map(|f| f.manager.clone())
            .any(|m| m == "nopea"));

        let repo = repos.get(name).await.unwrap();
        let status = repo.status.clone().unwrap();
        assert_eq!(status.observed_generation, repo.metadata.generation);

        repos.delete(name, &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn manual_drift_is_healed() {
        let name = "test-heal";
        let (repos, config_maps) = setup(name).await;

        let original = config_maps.get("app").await.unwrap();
        let original_value = original.data.as_ref().unwrap().get("k").cloned();

        // change the live object out-of-band
        config_maps
            .patch(
                "app",
                &PatchParams::default(),
                &Patch::Merge(json!({"data": {"k": "tampered"}})),
            )
            .await
            .unwrap();

        // the next reconcile pass restores the Git value
        timeout(Duration::from_secs(120), async {
            loop {
                let current = config_maps.get("app").await.unwrap();
                if current.data.as_ref().unwrap().get("k").cloned() == original_value {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        })
        .await
        .unwrap();

        repos.delete(name, &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn suspended_repository_keeps_last_commit() {
        let name = "test-suspend";
        let (repos, _config_maps) = setup(name).await;

        let mut repo = repos.get(name).await.unwrap();
        repo.spec.suspend = Some(true);
        repo.metadata.managed_fields = None;
        repos
            .patch(
                name,
                &PatchParams::apply("e2e-tests").force(),
                &Patch::Apply(&repo),
            )
            .await
            .unwrap();

        // the spec change restarts the worker; status keeps the last
        // synced commit
        wait_for(repos.clone(), name, has_synced_commit()).await;

        repos.delete(name, &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_repository() {
        let name = "test-delete";
        let (repos, _) = setup(name).await;

        let repo = repos.get(name).await.unwrap();
        repos.delete(name, &Default::default()).await.unwrap();
        wait_for(
            repos.clone(),
            name,
            conditions::is_deleted(&repo.uid().unwrap()),
        )
        .await;
    }
}
