use anyhow::Result;
use kube::CustomResourceExt;

use kube_nodeqos::crd::{AvoidanceAction, NodeQOSEnsurancePolicy};

/// Print both ensurance CRDs as YAML for `kubectl apply -f`.
pub fn generate() -> Result<()> {
    let policy_crd = NodeQOSEnsurancePolicy::crd();
    let action_crd = AvoidanceAction::crd();
    println!("{}", serde_yaml::to_string(&policy_crd)?);
    println!("---");
    println!("{}", serde_yaml::to_string(&action_crd)?);
    Ok(())
}

/// Apply both ensurance CRDs directly to the connected cluster.
pub async fn install() -> Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::{Api, Client};

    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in [NodeQOSEnsurancePolicy::crd(), AvoidanceAction::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match crds.create(&Default::default(), &crd).await {
            Ok(_) => println!("CRD '{name}' installed successfully"),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                println!("CRD '{name}' already exists — skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
