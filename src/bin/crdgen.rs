//! CRD YAML Generator
//!
//! This binary generates the Kubernetes CRD manifest for the ObjectStore
//! resource defined by the barman-cloud-operator.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/objectstore.yaml

use barman_cloud_operator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
