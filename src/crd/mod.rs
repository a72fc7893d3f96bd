//! Custom Resource Definitions used by the Barman Cloud operator

mod cnpg;
mod object_store;

pub use cnpg::*;
pub use object_store::*;

use kube::CustomResourceExt;

use crate::error::Result;

/// Generate the YAML manifests of the CRDs owned by this operator.
///
/// Cluster and Backup belong to CloudNativePG and are not emitted.
pub fn generate_crds() -> Result<Vec<String>> {
    let crd = serde_yaml::to_string(&ObjectStore::crd())
        .map_err(|e| crate::Error::config(format!("cannot render ObjectStore CRD: {}", e)))?;
    Ok(vec![crd])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_store_crd_is_namespaced_with_status() {
        let crd = ObjectStore::crd();
        assert_eq!(crd.spec.group, "barmancloud.cnpg.io");
        assert_eq!(crd.spec.names.kind, "ObjectStore");
        assert_eq!(crd.spec.scope, "Namespaced");

        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
    }

    #[test]
    fn generates_a_single_manifest() {
        let crds = generate_crds().unwrap();
        assert_eq!(crds.len(), 1);
        assert!(crds[0].contains("objectstores.barmancloud.cnpg.io"));
    }
}
