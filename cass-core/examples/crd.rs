//! A script used to generate the CassandraDatacenter CRD.
//!
//! Any time the CRD spec changes, this script can be run to ensure that the CRD is up-to-date and
//! ready to be synced with the cluster. The output directory defaults to `../k8s/crds`.

use anyhow::{Context, Result};
use cass_core::crd::CassandraDatacenter;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let crds_path = match std::env::args().nth(1) {
        Some(path) => std::path::PathBuf::from(path),
        None => std::fs::canonicalize("..")
            .context("error getting canonical path of current dir")?
            .join("k8s")
            .join("crds"),
    };
    std::fs::create_dir_all(&crds_path).with_context(|| format!("error creating CRD dir {:?}", &crds_path))?;

    let datacenter = CassandraDatacenter::crd();
    let datacenter_yaml = serde_yaml::to_string(&datacenter).context("error serializing CassandraDatacenter CRD to yaml")?;
    std::fs::write(crds_path.join("cassandradatacenter.yaml"), &datacenter_yaml)
        .with_context(|| format!("error writing CassandraDatacenter CRD to {:?}", &crds_path))?;
    println!("CassandraDatacenter CRD written to {:?}", &crds_path);

    Ok(())
}
