//! Prints the Widget CustomResourceDefinition as YAML.
//!
//! ```sh
//! cargo run -p crds --bin crdgen > widgets-crd.yaml
//! ```

use crds::Widget;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Widget::crd())?);
    Ok(())
}
