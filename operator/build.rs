//! Generates the MPIJob CRD YAML for the deploy manifests to pick up.
use std::fs::File;

use crds::{CustomResourceExt, MPIJob};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = std::path::Path::new("../deploy/crds");
    if dir.exists() {
        let writer = File::create(dir.join("MPIJob.yaml"))?;
        serde_yaml::to_writer(writer, &MPIJob::crd())?;
    }
    Ok(())
}
