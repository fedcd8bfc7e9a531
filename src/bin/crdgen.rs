//! Print the operator's CRDs as a multi-document YAML stream

use kubedb_operator::crd::crds;

fn main() -> anyhow::Result<()> {
    for crd in crds() {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
