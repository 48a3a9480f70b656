//! The K8s side of the control loop.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::client::Client;
use serde_json::json;
use tokio::time::timeout;

use crate::error::{ReconcileError, ReconcileResult};
use crate::k8s::manifests::{self, DATA_VOLUME_NAME};
use crate::lifecycle::PodInfo;
use crate::mgmt::Credentials;
use crate::reconciler::{ClusterOps, Observed};
use crate::sequencer::RackState;
use cass_core::crd::{CassandraDatacenter, Rack, RequiredMetadata};
use cass_core::{ANNOTATION_CONFIG_HASH, LABEL_NODE_STATE, LABEL_RACK, LABEL_SEED_NODE, OPERATOR_NAME};

/// Resource operations performed directly against the K8s API.
pub struct KubeClusterOps {
    client: Client,
    /// The timeout applied to each API call.
    timeout: Duration,
}

impl KubeClusterOps {
    /// Create a new instance.
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api<K>(&self, dc: &CassandraDatacenter) -> Api<K>
    where
        K: kube::Resource,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), dc.namespace())
    }

    fn apply_params() -> PatchParams {
        let mut params = PatchParams::apply(OPERATOR_NAME);
        params.force = true;
        params
    }
}

#[async_trait]
impl ClusterOps for KubeClusterOps {
    #[tracing::instrument(level = "debug", skip(self, dc), fields(dc = dc.name()))]
    async fn observe(&self, dc: &CassandraDatacenter) -> ReconcileResult<Observed> {
        let params = ListParams {
            label_selector: Some(label_selector(&dc.datacenter_labels())),
            ..Default::default()
        };
        let statefulsets = timeout(self.timeout, self.api::<StatefulSet>(dc).list(&params))
            .await
            .context("timeout while listing statefulsets")??;
        let pods = timeout(self.timeout, self.api::<Pod>(dc).list(&params))
            .await
            .context("timeout while listing pods")??;
        let claims = timeout(self.timeout, self.api::<PersistentVolumeClaim>(dc).list(&params))
            .await
            .context("timeout while listing persistent volume claims")??;
        // The seed service only carries the cluster labels.
        let cluster_params = ListParams {
            label_selector: Some(label_selector(&dc.cluster_labels())),
            ..Default::default()
        };
        let services = timeout(self.timeout, self.api::<Service>(dc).list(&cluster_params))
            .await
            .context("timeout while listing services")??;

        Ok(Observed {
            racks: statefulsets.items.iter().filter_map(rack_state).collect(),
            pods: pods.items.iter().filter_map(pod_info).collect(),
            volumes: claims.items.iter().filter_map(claim_pod_name).collect(),
            services: services.items.into_iter().filter_map(|svc| svc.metadata.name).collect(),
        })
    }

    #[tracing::instrument(level = "debug", skip(self, dc), fields(dc = dc.name()))]
    async fn apply_services(&self, dc: &CassandraDatacenter) -> ReconcileResult<()> {
        let api = self.api::<Service>(dc);
        let params = Self::apply_params();
        for service in manifests::services(dc) {
            let name = service.metadata.name.clone().unwrap_or_default();
            tracing::info!(service = %name, "applying service");
            timeout(self.timeout, api.patch(&name, &params, &Patch::Apply(&service)))
                .await
                .context("timeout while applying service")??;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, dc, rack), fields(dc = dc.name(), rack = %rack.name))]
    async fn apply_rack(&self, dc: &CassandraDatacenter, rack: &Rack, replicas: u32) -> ReconcileResult<()> {
        let sts = manifests::statefulset(dc, rack, replicas).map_err(|err| ReconcileError::InvalidDesiredState(err.to_string()))?;
        let name = dc.statefulset_name(&rack.name);
        tracing::info!(%name, replicas, "applying statefulset");
        timeout(self.timeout, self.api::<StatefulSet>(dc).patch(&name, &Self::apply_params(), &Patch::Apply(&sts)))
            .await
            .context("timeout while applying statefulset")??;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, dc), fields(dc = dc.name()))]
    async fn scale_rack(&self, dc: &CassandraDatacenter, rack: &str, replicas: u32) -> ReconcileResult<()> {
        let name = dc.statefulset_name(rack);
        tracing::info!(%name, replicas, "scaling statefulset");
        let patch = json!({"spec": {"replicas": replicas}});
        timeout(self.timeout, self.api::<StatefulSet>(dc).patch(&name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while scaling statefulset")??;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, dc), fields(dc = dc.name()))]
    async fn delete_pod(&self, dc: &CassandraDatacenter, pod: &str) -> ReconcileResult<()> {
        tracing::info!(pod, "deleting pod");
        let res = timeout(self.timeout, self.api::<Pod>(dc).delete(pod, &DeleteParams::default()))
            .await
            .context("timeout while deleting pod")?;
        match res {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, dc), fields(dc = dc.name()))]
    async fn delete_volume(&self, dc: &CassandraDatacenter, pod: &str) -> ReconcileResult<()> {
        let name = manifests::volume_claim_name(pod);
        tracing::info!(claim = %name, "deleting persistent volume claim");
        let res = timeout(self.timeout, self.api::<PersistentVolumeClaim>(dc).delete(&name, &DeleteParams::default()))
            .await
            .context("timeout while deleting persistent volume claim")?;
        match res {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, dc, labels), fields(dc = dc.name()))]
    async fn label_pod(&self, dc: &CassandraDatacenter, pod: &str, labels: &BTreeMap<String, Option<String>>) -> ReconcileResult<()> {
        tracing::debug!(pod, ?labels, "labeling pod");
        let patch = json!({"metadata": {"labels": labels}});
        timeout(self.timeout, self.api::<Pod>(dc).patch(pod, &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while labeling pod")??;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, dc), fields(dc = dc.name()))]
    async fn superuser_credentials(&self, dc: &CassandraDatacenter) -> ReconcileResult<Option<Credentials>> {
        let name = dc.superuser_secret_name();
        let res = timeout(self.timeout, self.api::<Secret>(dc).get(&name))
            .await
            .context("timeout while fetching superuser secret")?;
        let secret = match res {
            Ok(secret) => secret,
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let data = secret.data.unwrap_or_default();
        let entry = |key: &str| -> ReconcileResult<String> {
            let val = data
                .get(key)
                .ok_or_else(|| anyhow!("superuser secret {} has no entry {}", name, key))?;
            Ok(String::from_utf8(val.0.clone()).with_context(|| format!("superuser secret {} entry {} is not utf-8", name, key))?)
        };
        Ok(Some(Credentials {
            username: entry("username")?,
            password: entry("password")?,
        }))
    }
}

/// Render labels as a K8s label selector.
pub(super) fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, val)| format!("{}={}", key, val))
        .collect::<Vec<_>>()
        .join(",")
}

/// The rack name and state of a rack's StatefulSet.
pub(super) fn rack_state(sts: &StatefulSet) -> Option<(String, RackState)> {
    let rack = sts.metadata.labels.as_ref()?.get(LABEL_RACK)?.clone();
    let spec = sts.spec.as_ref()?;
    let template_hash = spec
        .template
        .metadata
        .as_ref()
        .and_then(|meta| meta.annotations.as_ref())
        .and_then(|annotations| annotations.get(ANNOTATION_CONFIG_HASH))
        .cloned();
    let replicas = spec.replicas.unwrap_or(1).max(0) as u32;
    Some((rack, RackState { replicas, template_hash }))
}

/// Everything the control loop needs to know about a server pod.
///
/// Pods without a rack label or ordinal suffix are not server pods.
pub(super) fn pod_info(pod: &Pod) -> Option<PodInfo> {
    let name = pod.metadata.name.clone()?;
    let labels = pod.metadata.labels.as_ref()?;
    let rack = labels.get(LABEL_RACK)?.clone();
    let ordinal = name.rsplit('-').next()?.parse().ok()?;
    Some(PodInfo {
        rack,
        ordinal,
        uid: pod.metadata.uid.clone(),
        ip: pod.status.as_ref().and_then(|status| status.pod_ip.clone()),
        seed: labels.get(LABEL_SEED_NODE).map(|val| val == "true").unwrap_or(false),
        config_hash: pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_CONFIG_HASH))
            .cloned(),
        terminating: pod.metadata.deletion_timestamp.is_some(),
        state_label: labels.get(LABEL_NODE_STATE).cloned(),
        name,
    })
}

/// The pod name owning the given data volume claim.
///
/// A claim being deleted is already gone as far as its pod is concerned.
pub(super) fn claim_pod_name(claim: &PersistentVolumeClaim) -> Option<String> {
    if claim.metadata.deletion_timestamp.is_some() {
        return None;
    }
    let name = claim.metadata.name.as_deref()?;
    name.strip_prefix(DATA_VOLUME_NAME)?.strip_prefix('-').map(String::from)
}
