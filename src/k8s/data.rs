use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Event;
use kube::Resource;

use crate::k8s::scheduler::SchedulerTask;
use crate::k8s::{Controller, EventResult, METRIC_DATACENTERS, WATCHER_ERROR_DELAY};
use cass_core::crd::CassandraDatacenter;
use cass_core::LABEL_DATACENTER;

//////////////////////////////////////////////////////////////////////////////
// Datacenter Events /////////////////////////////////////////////////////////
impl Controller {
    /// Handle `CassandraDatacenter` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_datacenter_event(&mut self, res: EventResult<CassandraDatacenter>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from CassandraDatacenter k8s watcher");
                let _ = tokio::time::sleep(WATCHER_ERROR_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.datacenter_applied(obj).await,
            Event::Deleted(obj) => self.datacenter_deleted(obj).await,
            Event::Restarted(objs) => self.datacenter_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, dc))]
    async fn datacenter_applied(&mut self, dc: CassandraDatacenter) {
        let name_str = match dc.meta().name.clone() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        // Status and label writes do not bump the generation, and do not call for a pass.
        let (name, unchanged) = match self.datacenters.get_key_value(&name_str) {
            Some((key, old)) => (
                Arc::clone(key), // No additional alloc.
                old.meta().generation == dc.meta().generation && old.meta().deletion_timestamp == dc.meta().deletion_timestamp,
            ),
            None => (Arc::new(name_str), false),
        };
        self.datacenters.insert(name.clone(), dc);
        metrics::gauge!(METRIC_DATACENTERS, self.datacenters.len() as f64);
        if unchanged {
            return;
        }
        self.spawn_scheduler_task(SchedulerTask::DatacenterUpdated(name), None);
    }

    #[tracing::instrument(level = "debug", skip(self, dc))]
    async fn datacenter_deleted(&mut self, dc: CassandraDatacenter) {
        let name_str = match dc.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (name, _dc) = match self.datacenters.remove_entry(name_str) {
            Some((name, dc)) => (name, dc),
            None => return,
        };
        metrics::gauge!(METRIC_DATACENTERS, self.datacenters.len() as f64);
        self.spawn_scheduler_task(SchedulerTask::DatacenterDeleted(name), None);
    }

    #[tracing::instrument(level = "debug", skip(self, datacenters))]
    async fn datacenter_restarted(&mut self, datacenters: Vec<CassandraDatacenter>) {
        // Anything cached but absent from the new listing was deleted while the watch was down.
        let live: Vec<&str> = datacenters.iter().filter_map(|dc| dc.meta().name.as_deref()).collect();
        let gone: Vec<Arc<String>> = self
            .datacenters
            .keys()
            .filter(|name| !live.contains(&name.as_str()))
            .cloned()
            .collect();
        for name in gone {
            self.datacenters.remove(&name);
            self.spawn_scheduler_task(SchedulerTask::DatacenterDeleted(name), None);
        }
        metrics::gauge!(METRIC_DATACENTERS, self.datacenters.len() as f64);
        for dc in datacenters {
            self.datacenter_applied(dc).await;
        }
    }

    /// Schedule a pass of the datacenter owning an object with the given labels, if known.
    fn datacenter_child_changed(&self, meta: &kube::api::ObjectMeta) {
        let dc_name = match meta.labels.as_ref().and_then(|labels| labels.get(LABEL_DATACENTER)) {
            Some(dc_name) => dc_name,
            None => return,
        };
        let name = match self.datacenters.get_key_value(dc_name) {
            Some((key, _)) => Arc::clone(key),
            None => return,
        };
        self.spawn_scheduler_task(SchedulerTask::DatacenterUpdated(name), None);
    }
}

//////////////////////////////////////////////////////////////////////////////
// StatefulSet Events ////////////////////////////////////////////////////////
impl Controller {
    /// Handle `StatefulSet` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_sts_event(&mut self, res: EventResult<StatefulSet>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from StatefulSet k8s watcher");
                let _ = tokio::time::sleep(WATCHER_ERROR_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) | Event::Deleted(obj) => self.datacenter_child_changed(obj.meta()),
            Event::Restarted(objs) => objs.iter().for_each(|obj| self.datacenter_child_changed(obj.meta())),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Pod Events ////////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `Pod` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_pod_event(&mut self, res: EventResult<Pod>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Pod k8s watcher");
                let _ = tokio::time::sleep(WATCHER_ERROR_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) | Event::Deleted(obj) => self.datacenter_child_changed(obj.meta()),
            Event::Restarted(objs) => objs.iter().for_each(|obj| self.datacenter_child_changed(obj.meta())),
        }
    }
}
