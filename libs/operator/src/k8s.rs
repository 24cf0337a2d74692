use crate::crd::{GitRepository, GitRepositoryStatus};
use crate::error::{Error, Result};
use crate::resource::Manifest;

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use kube::api::{Api, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, WatchParams};
use kube::client::Client;
use kube::core::WatchEvent;
use kube::discovery::{self, Scope};
use serde_json::json;

/// Field manager identity used for server-side apply.
pub const FIELD_MANAGER: &str = "nopea";

/// Watch event for the repository custom resource, decoupled from the
/// client library so the controller can be driven by a fake in tests.
#[derive(Debug)]
pub enum RepoEvent {
    Added(GitRepository),
    Modified(GitRepository),
    Deleted(GitRepository),
    Bookmark(String),
}

pub type RepoEventStream = Pin<Box<dyn Stream<Item = Result<RepoEvent>> + Send>>;

/// Cluster operations the core depends on. One implementation talks to the
/// API server, the in-memory fake drives unit tests.
#[async_trait]
pub trait K8sOps: Send + Sync {
    /// Lists repository resources and returns them with the list
    /// resourceVersion to start a watch from.
    async fn list_repos(&self, namespace: &str) -> Result<(Vec<GitRepository>, String)>;

    async fn watch_repos(&self, namespace: &str, resource_version: &str)
        -> Result<RepoEventStream>;

    async fn get_repo(&self, namespace: &str, name: &str) -> Result<Option<GitRepository>>;

    /// Fetches the live object behind a manifest, `None` when absent.
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Manifest>>;

    /// Server-side apply with `fieldManager=nopea`, conflicts forced.
    /// Returns the server-echoed object including cluster defaults.
    async fn apply(&self, manifest: &Manifest) -> Result<Manifest>;

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &GitRepositoryStatus,
    ) -> Result<()>;
}

fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

/// API-server backed implementation.
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
}

impl KubeApi {
    pub fn new(client: Client) -> Self {
        KubeApi { client }
    }

    fn repos(&self, namespace: &str) -> Api<GitRepository> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn dynamic_api(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<Api<DynamicObject>> {
        let gvk = gvk_of(api_version, kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk).await?;
        let api = match caps.scope {
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), namespace, &ar),
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
        };
        Ok(api)
    }
}

fn manifest_of(obj: DynamicObject) -> Result<Manifest> {
    let value = serde_json::to_value(obj)?;
    Manifest::try_new(value).map_err(Error::InvalidResource)
}

#[async_trait]
impl K8sOps for KubeApi {
    async fn list_repos(&self, namespace: &str) -> Result<(Vec<GitRepository>, String)> {
        let list = self.repos(namespace).list(&ListParams::default()).await?;
        let version = list.metadata.resource_version.unwrap_or_default();
        Ok((list.items, version))
    }

    async fn watch_repos(
        &self,
        namespace: &str,
        resource_version: &str,
    ) -> Result<RepoEventStream> {
        let params = WatchParams::default();
        let stream = self
            .repos(namespace)
            .watch(&params, resource_version)
            .await?
            .map_err(Error::from)
            .map(|event| match event? {
                WatchEvent::Added(r) => Ok(RepoEvent::Added(r)),
                WatchEvent::Modified(r) => Ok(RepoEvent::Modified(r)),
                WatchEvent::Deleted(r) => Ok(RepoEvent::Deleted(r)),
                WatchEvent::Bookmark(b) => Ok(RepoEvent::Bookmark(b.metadata.resource_version)),
                WatchEvent::Error(e) => Err(Error::WatchDisconnected(e.message)),
            });
        Ok(stream.boxed())
    }

    async fn get_repo(&self, namespace: &str, name: &str) -> Result<Option<GitRepository>> {
        Ok(self.repos(namespace).get_opt(name).await?)
    }

    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Manifest>> {
        let api = self.dynamic_api(api_version, kind, namespace).await?;
        match api.get_opt(name).await? {
            Some(obj) => Ok(Some(manifest_of(obj)?)),
            None => Ok(None),
        }
    }

    async fn apply(&self, manifest: &Manifest) -> Result<Manifest> {
        let api = self
            .dynamic_api(
                manifest.api_version(),
                manifest.kind(),
                manifest.namespace().unwrap_or("default"),
            )
            .await?;
        let obj: DynamicObject = serde_json::from_value(manifest.as_value().clone())?;
        let applied = api
            .patch(
                manifest.name(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await?;
        manifest_of(applied)
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &GitRepositoryStatus,
    ) -> Result<()> {
        self.repos(namespace)
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": status })),
            )
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{GitRepositorySpec, Phase};

    use assert_json_diff::assert_json_include;
    use http::{Method, Request, Response};
    use http_body_util::BodyExt;
    use kube::client::Body;

    fn repo_json(name: &str) -> serde_json::Value {
        serde_json::to_value(GitRepository::new(
            name,
            GitRepositorySpec {
                url: "https://example/acme.git".into(),
                branch: None,
                path: None,
                target_namespace: None,
                interval: None,
                suspend: None,
                heal_policy: None,
                heal_grace_period: None,
            },
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn update_status_merge_patches_the_status_subresource() {
        let (mock_service, mut handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let api = KubeApi::new(Client::new(mock_service, "default"));

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("no request");
            assert_eq!(request.method(), Method::PATCH);
            assert_eq!(
                request.uri().path(),
                "/apis/nopea.io/v1alpha1/namespaces/default/gitrepositories/acme/status"
            );
            assert_eq!(
                request
                    .headers()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok()),
                Some("application/merge-patch+json")
            );
            let bytes = request.into_body().collect().await.unwrap().to_bytes();
            let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_json_include!(
                actual: body,
                expected: serde_json::json!({"status": {"phase": "Synced", "observedGeneration": 3}})
            );
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&repo_json("acme")).unwrap()))
                    .unwrap(),
            );
        });

        let status = GitRepositoryStatus {
            phase: Some(Phase::Synced),
            observed_generation: Some(3),
            ..GitRepositoryStatus::default()
        };
        api.update_status("default", "acme", &status).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn list_repos_returns_items_and_resume_version() {
        let (mock_service, mut handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let api = KubeApi::new(Client::new(mock_service, "default"));

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("no request");
            assert_eq!(request.method(), Method::GET);
            assert_eq!(
                request.uri().path(),
                "/apis/nopea.io/v1alpha1/namespaces/default/gitrepositories"
            );
            let list = serde_json::json!({
                "apiVersion": "nopea.io/v1alpha1",
                "kind": "GitRepositoryList",
                "metadata": {"resourceVersion": "12345"},
                "items": [repo_json("acme")]
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&list).unwrap()))
                    .unwrap(),
            );
        });

        let (repos, version) = api.list_repos("default").await.unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(version, "12345");
        server.await.unwrap();
    }

    #[test]
    fn gvk_handles_core_and_grouped_versions() {
        let core = gvk_of("v1", "ConfigMap");
        assert_eq!(core.group, "");
        assert_eq!(core.version, "v1");
        let apps = gvk_of("apps/v1", "Deployment");
        assert_eq!(apps.group, "apps");
        assert_eq!(apps.version, "v1");
        assert_eq!(apps.kind, "Deployment");
    }
}
