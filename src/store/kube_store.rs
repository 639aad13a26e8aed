//! kube-rs implementations of the store traits

use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::debug;

use super::{DependencySource, IngressStore, ResourceStore};
use crate::annotations::IngressSource;
use crate::crd::{AlertChannel, Group, ManagedResource, ResourceStatus};
use crate::error::{Error, Result};
use crate::mapper::Dependency;

/// Store backed by the Kubernetes API server
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K: ManagedResource> KubeStore<K> {
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn api_for(&self, obj: &K) -> Api<K> {
        let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
        self.api(&namespace)
    }
}

#[async_trait]
impl<K: ManagedResource> ResourceStore<K> for KubeStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>> {
        let api: Api<K> = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        let params = ListParams::default().labels(label_selector);
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        self.api_for(obj)
            .create(&PostParams::default(), obj)
            .await
            .map_err(Error::from_kube_write)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        self.api_for(obj)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(Error::from_kube_write)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!("{}/{} already deleted", namespace, name);
                Ok(())
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn patch_status(&self, obj: &K, status: &ResourceStatus) -> Result<K> {
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });
        self.api_for(obj)
            .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::from_kube_write)
    }

    async fn patch_finalizers(&self, obj: &K, finalizers: &[String]) -> Result<K> {
        let patch = json!({
            "metadata": {
                "resourceVersion": obj.resource_version(),
                "finalizers": finalizers,
            }
        });
        self.api_for(obj)
            .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::from_kube_write)
    }
}

/// Resolves group and alert channel ids from their status, and secret values
#[derive(Clone)]
pub struct KubeDependencySource {
    client: Client,
}

impl KubeDependencySource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn external_id_of<K: ManagedResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(name)
            .await?
            .and_then(|obj| obj.external_id().map(str::to_string)))
    }
}

#[async_trait]
impl DependencySource for KubeDependencySource {
    async fn resolve(&self, namespace: &str, dependency: &Dependency) -> Result<Option<String>> {
        match dependency {
            Dependency::Group(name) => self.external_id_of::<Group>(namespace, name).await,
            Dependency::AlertChannel(name) => {
                self.external_id_of::<AlertChannel>(namespace, name).await
            }
            Dependency::SecretKey { name, key } => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let Some(secret) = api.get_opt(name).await? else {
                    return Ok(None);
                };
                let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) else {
                    return Ok(None);
                };
                String::from_utf8(bytes.0.clone()).map(Some).map_err(|_| {
                    Error::ConfigError(format!(
                        "Secret {}/{} key {} is not valid UTF-8",
                        namespace, name, key
                    ))
                })
            }
        }
    }
}

/// Ingress reads through the Kubernetes API server
#[derive(Clone)]
pub struct KubeIngressStore {
    client: Client,
}

impl KubeIngressStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IngressStore for KubeIngressStore {
    async fn list(&self) -> Result<Vec<IngressSource>> {
        let api: Api<Ingress> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(IngressSource::from).collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<IngressSource>> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().map(IngressSource::from))
    }
}
