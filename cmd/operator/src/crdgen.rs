use akkacluster_operator::crd::AkkaCluster;

use kube::CustomResourceExt;

fn main() {
    print!("{}", serde_yaml::to_string(&AkkaCluster::crd()).unwrap());
}
