//! Print the `KeepalivedGroup` CustomResourceDefinition as YAML.

use anyhow::Result;
use keepalived_api::KeepalivedGroup;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    print!("{}", serde_yaml::to_string(&KeepalivedGroup::crd())?);
    Ok(())
}
